//! Alert message builders

use chrono::{DateTime, Local, Utc};
use std::fmt::Write;

use hostwatch_core::{AlertKind, AlertMessage, Check, Expression, Host, Run, TaskResult, GENERAL_CLASS};
use hostwatch_registry::CurrentFail;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn local(at: DateTime<Utc>) -> DateTime<Local> {
    at.with_timezone(&Local)
}

fn finish(details: &mut String, record: &CurrentFail) {
    let _ = writeln!(details);
    let _ = writeln!(details, "Unique failure ID: {}", record.unique_id);
}

fn message(
    kind: AlertKind,
    subject: String,
    details: String,
    classes: Vec<String>,
    record: &CurrentFail,
    hostname: &str,
    at: DateTime<Utc>,
) -> AlertMessage {
    AlertMessage {
        kind,
        subject,
        details,
        classes,
        unique_id: record.unique_id.clone(),
        hostname: hostname.to_string(),
        datetime: local(at),
    }
}

/// Message for run-level errors
pub fn run_message(kind: AlertKind, run: &Run, record: &CurrentFail) -> AlertMessage {
    let started = local(run.start).format(TIME_FORMAT);
    let mut details = String::new();
    match kind {
        AlertKind::Bad => {
            let _ = writeln!(
                details,
                "At least one error occurred during a run for this host. ({})",
                started
            );
            let _ = writeln!(details);
            let _ = writeln!(details, "Error(s):");
            for err in &run.errors {
                let _ = writeln!(details, "{}", err);
            }
        }
        AlertKind::Good => {
            let _ = writeln!(details, "No more run errors for this host. ({})", started);
        }
    }
    finish(&mut details, record);

    message(
        kind,
        format!("[{}] {}: run error(s)", kind, run.host.name),
        details,
        vec![GENERAL_CLASS.to_string()],
        record,
        &run.host.name,
        run.start,
    )
}

/// Message for a failing script
pub fn task_message(
    kind: AlertKind,
    run: &Run,
    result: &TaskResult,
    record: &CurrentFail,
) -> AlertMessage {
    let started = local(result.start).format(TIME_FORMAT);
    let mut details = String::new();
    match kind {
        AlertKind::Bad => {
            let _ = writeln!(
                details,
                "At least one error occurred during a task for this host. ({})",
                started
            );
            let _ = writeln!(details);
            let _ = writeln!(details, "Error(s):");
            for err in &result.errors {
                let _ = writeln!(details, "{}", err);
            }
            if !result.logs.is_empty() {
                let _ = writeln!(details);
                let _ = writeln!(details, "Log(s):");
                for log in &result.logs {
                    let _ = writeln!(details, "{}", log);
                }
            }
        }
        AlertKind::Good => {
            let _ = writeln!(
                details,
                "No more errors for this task on this host. ({})",
                started
            );
        }
    }
    finish(&mut details, record);

    message(
        kind,
        format!(
            "[{}] {}: {}: task error(s)",
            kind, run.host.name, result.probe.name
        ),
        details,
        vec![GENERAL_CLASS.to_string()],
        record,
        &run.host.name,
        result.start,
    )
}

/// Value of a variable referenced by a check, as shown in messages
fn check_var_value(host: &Host, result: &TaskResult, name: &str) -> String {
    if let Some(value) = result.values.get(name) {
        return value.clone();
    }
    host.defaults
        .get(name)
        .or_else(|| result.probe.defaults.get(name))
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Message for a check starting or stopping to fail
pub fn check_message(
    kind: AlertKind,
    run: &Run,
    result: &TaskResult,
    check: &Check,
    record: &CurrentFail,
) -> AlertMessage {
    let mut details = String::new();
    let at = match kind {
        AlertKind::Bad => {
            let _ = writeln!(details, "An alert **is** ringing.\n");
            record.fail_start
        }
        AlertKind::Good => {
            let _ = writeln!(details, "This alert is **no more** ringing.\n");
            result.start
        }
    };

    let _ = writeln!(
        details,
        "Failure time: {}",
        local(record.fail_start).format(TIME_FORMAT)
    );
    let _ = writeln!(
        details,
        "Last task time: {}",
        local(result.start).format(TIME_FORMAT)
    );
    let _ = writeln!(details, "Class(es): {}", check.classes.join(", "));
    let _ = writeln!(details, "Failed condition was: {}", check.condition);
    let _ = writeln!(details);
    let _ = writeln!(details, "Values:");
    for name in check.condition.vars() {
        let value = check_var_value(&run.host, result, &name);
        let _ = writeln!(details, "- {}: {}", name, value);
    }
    let _ = writeln!(details);
    let _ = writeln!(details, "All values for this run ({:?}):", run.duration);
    for other in &run.results {
        let _ = writeln!(details, "- {} ({:?}):", other.probe.name, other.duration);
        let mut values: Vec<_> = other.values.iter().collect();
        values.sort();
        for (key, value) in values {
            let _ = writeln!(details, "--- {}: {}", key, value);
        }
    }
    finish(&mut details, record);

    message(
        kind,
        format!(
            "[{}] {}: {} ({})",
            kind, run.host.name, check.desc, result.probe.name
        ),
        details,
        check.classes.clone(),
        record,
        &run.host.name,
        at,
    )
}
