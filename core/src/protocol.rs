//! Multiplexer wire format
//!
//! Everything written to the remote shell and every line read back goes
//! through this module. It is pure: no I/O, only strings.

use crate::vars::{is_all_upper, is_valid_token};

/// Command the session is opened with
pub const BOOTSTRAP: &str = "bash -s --";

const EXIT_KEYWORD: &str = "EXIT";
const READY_KEYWORD: &str = "READY";

/// Record the outer shell PID, define the subshell killer, then answer
/// the handshake once the shell reads its input
pub fn preamble() -> String {
    concat!(
        "export __MAIN_PID=$$\n",
        "function __kill_subshells() { pkill -TERM -P $__MAIN_PID cat; }\n",
        "export -f __kill_subshells\n",
        "echo __READY\n",
    )
    .to_string()
}

/// Frame one script for the shared shell
///
/// The `cat` pipe feeds the following lines to a child shell until
/// `__kill_subshells` ends it, then the exit status is echoed.
pub fn frame_task(seq: usize, arguments: &str, script: &str) -> String {
    let mut framed = format!(
        "cat | __SCRIPT_ID={} bash -s -- {} ; echo __{}=$?\n",
        seq, arguments, EXIT_KEYWORD
    );
    framed.push_str("trap __kill_subshells EXIT ; ");
    for line in script.lines() {
        framed.push_str(line);
        framed.push('\n');
    }
    if script.lines().next().is_none() {
        framed.push('\n');
    }
    framed.push_str("__kill_subshells\n");
    framed
}

/// Classified stdout line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `__EXIT=<status>` sentinel
    Exit(i32),
    /// `__READY` handshake, the shell is up
    Ready,
    /// `#` comment, kept as a log line
    Log(String),
    /// `TOKEN: value`
    Value(String, String),
    /// Malformed value line, error for the active task
    Invalid(String),
    /// Bad `__` keyword, error for the whole run
    Protocol(String),
}

/// Classify one stdout line
///
/// Duplicate detection needs the task's state and happens in the run.
pub fn classify(line: &str) -> Line {
    if let Some(rest) = line.strip_prefix("__") {
        if rest == READY_KEYWORD {
            return Line::Ready;
        }
        let (keyword, value) = rest.split_once('=').unwrap_or((rest, ""));
        if keyword != EXIT_KEYWORD {
            return Line::Protocol(format!("unknown keyword '{}'", line));
        }
        return match value.trim().parse::<i32>() {
            Ok(status) => Line::Exit(status),
            Err(_) => Line::Protocol(format!("invalid exit status '{}'", line)),
        };
    }

    if line.starts_with('#') {
        return Line::Log(line.to_string());
    }

    let (token, value) = match line.split_once(':') {
        Some((token, value)) if !token.is_empty() => (token.trim(), value.trim()),
        _ => return Line::Invalid(format!("invalid script output: '{}'", line)),
    };

    if !is_valid_token(token) {
        return Line::Invalid(format!("invalid token '{}' in '{}'", token, line));
    }
    if !is_all_upper(token) {
        return Line::Invalid(format!("token '{}' must be upper-case", token));
    }
    if value.is_empty() {
        return Line::Invalid(format!("empty value for '{}'", token));
    }
    Line::Value(token.to_string(), value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_values() {
        assert_eq!(
            classify("CPU: 42"),
            Line::Value("CPU".to_string(), "42".to_string())
        );
        assert_eq!(
            classify("TIME:  12:30 "),
            Line::Value("TIME".to_string(), "12:30".to_string())
        );
        assert!(matches!(classify("cpu: 42"), Line::Invalid(_)));
        assert!(matches!(classify("DISK-USED: 1"), Line::Invalid(_)));
        assert!(matches!(classify("CPU:"), Line::Invalid(_)));
        assert!(matches!(classify(": 42"), Line::Invalid(_)));
        assert!(matches!(classify("hello world"), Line::Invalid(_)));
    }

    #[test]
    fn test_classify_sentinels_and_logs() {
        assert_eq!(classify("__EXIT=0"), Line::Exit(0));
        assert_eq!(classify("__EXIT=127"), Line::Exit(127));
        assert!(matches!(classify("__EXIT=abc"), Line::Protocol(_)));
        assert!(matches!(classify("__FOO=1"), Line::Protocol(_)));
        assert_eq!(classify("__READY"), Line::Ready);
        assert!(matches!(classify("__READY=1"), Line::Protocol(_)));
        assert_eq!(classify("# note"), Line::Log("# note".to_string()));
    }

    #[test]
    fn test_frame_task() {
        let framed = frame_task(3, "--limit 95", "echo \"CPU: 1\"\necho done\n");
        assert_eq!(
            framed,
            "cat | __SCRIPT_ID=3 bash -s -- --limit 95 ; echo __EXIT=$?\n\
             trap __kill_subshells EXIT ; echo \"CPU: 1\"\n\
             echo done\n\
             __kill_subshells\n"
        );
        assert!(preamble().starts_with("export __MAIN_PID=$$\n"));
        assert!(preamble().ends_with("echo __READY\n"));
    }
}
