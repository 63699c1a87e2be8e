//! Check evaluation

use tracing::debug;

use crate::expr::Env;
use crate::run::TaskResult;
use crate::vars::merge_defaults;
use crate::{Error, Host, Result, Scalar};

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Coerce a captured value: integers, then `<digits>.<digits>` floats, else string
pub fn coerce(raw: &str) -> Result<Scalar> {
    if all_digits(raw) {
        return raw
            .parse::<i64>()
            .map(Scalar::Integer)
            .map_err(|e| Error::Output(format!("can't convert '{}' to integer: {}", raw, e)));
    }
    if let Some((int, frac)) = raw.split_once('.') {
        if all_digits(int) && all_digits(frac) {
            return raw
                .parse::<f64>()
                .map(Scalar::Float)
                .map_err(|e| Error::Output(format!("can't convert '{}' to float: {}", raw, e)));
        }
    }
    Ok(Scalar::String(raw.to_string()))
}

/// Build the evaluation environment of a result
///
/// Conversion failures are recorded on the result and the value left out.
pub fn environment(host: &Host, result: &mut TaskResult) -> Env {
    let mut env = merge_defaults(&result.probe.defaults, &host.defaults);
    let mut keys: Vec<&String> = result.values.keys().collect();
    keys.sort();
    let mut errors = Vec::new();
    for key in keys {
        match coerce(&result.values[key]) {
            Ok(value) => {
                env.insert(key.clone(), value);
            }
            Err(e) => errors.push(format!("{}: {}", key, e)),
        }
    }
    result.errors.extend(errors);
    env
}

/// Evaluate every check of the result's probe
///
/// `true` means the check is failing. Errors and non-boolean results are
/// recorded on the result and the check lands in neither list.
pub fn evaluate_checks(host: &Host, result: &mut TaskResult) {
    let env = environment(host, result);
    let probe = std::sync::Arc::clone(&result.probe);

    result.failed_checks.clear();
    result.successful_checks.clear();

    for check in &probe.checks {
        match check.condition.evaluate(&env) {
            Ok(Scalar::Boolean(true)) => result.failed_checks.push(check.index),
            Ok(Scalar::Boolean(false)) => result.successful_checks.push(check.index),
            Ok(other) => result.errors.push(format!(
                "check '{}' ({}) returned a non-boolean value: {}",
                check.desc, check.condition, other
            )),
            Err(e) => result
                .errors
                .push(format!("check '{}' ({}): {}", check.desc, check.condition, e)),
        }
    }

    debug!(
        host = %host.name,
        probe = %probe.name,
        failed = result.failed_checks.len(),
        successful = result.successful_checks.len(),
        "Checks evaluated"
    );
}
