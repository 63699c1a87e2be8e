//! Default parameters and argument templates

use std::collections::HashMap;

use crate::Scalar;

/// Is `name` a valid value token (`^[A-Za-z0-9_]+$`)?
pub fn is_valid_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Is `name` entirely upper-case? Digits and `_` are neutral.
pub fn is_all_upper(name: &str) -> bool {
    name == name.to_uppercase()
}

/// Merge probe and host defaults, host values win
pub fn merge_defaults(
    probe: &HashMap<String, Scalar>,
    host: &HashMap<String, Scalar>,
) -> HashMap<String, Scalar> {
    let mut merged = probe.clone();
    merged.extend(host.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Expand whitespace-delimited `$name` tokens of an argument template
///
/// Host defaults take precedence over probe defaults; unknown names are
/// left as they are.
pub fn expand_arguments(
    template: &str,
    probe: &HashMap<String, Scalar>,
    host: &HashMap<String, Scalar>,
) -> String {
    template
        .split_whitespace()
        .map(|word| {
            let Some(name) = word.strip_prefix('$') else {
                return word.to_string();
            };
            host.get(name)
                .or_else(|| probe.get(name))
                .map(|value| value.to_string())
                .unwrap_or_else(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lower-case `$name` references of an argument template
pub fn template_vars(template: &str) -> Vec<String> {
    template
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('$'))
        .filter(|name| is_valid_token(name) && !is_all_upper(name))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults(pairs: &[(&str, Scalar)]) -> HashMap<String, Scalar> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_host_default_overrides_probe_default() {
        let probe = defaults(&[("maxcpu", Scalar::Integer(90))]);
        let host = defaults(&[("maxcpu", Scalar::Integer(95))]);

        assert_eq!(expand_arguments("--limit $maxcpu", &probe, &host), "--limit 95");
        assert_eq!(
            expand_arguments("--limit $maxcpu", &probe, &HashMap::new()),
            "--limit 90"
        );
    }

    #[test]
    fn test_upper_case_default_names_expand() {
        let probe = defaults(&[("MAXCPU", Scalar::Integer(90))]);
        let host = defaults(&[("MAXCPU", Scalar::Integer(95))]);
        assert_eq!(expand_arguments("--limit $MAXCPU", &probe, &host), "--limit 95");
    }

    #[test]
    fn test_unknown_names_are_left_verbatim() {
        let probe = defaults(&[("mount", Scalar::from("/var"))]);
        assert_eq!(
            expand_arguments("$mount  $other x$mount", &probe, &HashMap::new()),
            "/var $other x$mount"
        );
    }

    #[test]
    fn test_tokens() {
        assert!(is_valid_token("DISK_USED_2"));
        assert!(!is_valid_token("disk-used"));
        assert!(!is_valid_token(""));
        assert!(is_all_upper("CPU_1"));
        assert!(!is_all_upper("cpu"));
        assert_eq!(template_vars("-w $warn -c $crit $PATH"), vec!["warn", "crit"]);
    }

    #[test]
    fn test_merge_defaults() {
        let probe = defaults(&[("a", Scalar::Integer(1)), ("b", Scalar::Integer(2))]);
        let host = defaults(&[("b", Scalar::Integer(3))]);
        let merged = merge_defaults(&probe, &host);
        assert_eq!(merged["a"], Scalar::Integer(1));
        assert_eq!(merged["b"], Scalar::Integer(3));
    }
}
