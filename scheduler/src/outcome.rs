//! Failure tracking after a run
//!
//! Turns the results of a run into registry updates, alert messages and
//! retry requests. Nothing here rings or sleeps; the worker applies the
//! returned [`Outcome`].

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{debug, instrument, warn};

use hostwatch_core::{evaluate_checks, AlertKind, AlertMessage, Run};
use hostwatch_registry::{FailRegistry, FailSubject};

use crate::messages::{check_message, run_message, task_message};

/// What the worker has to do after a run
#[derive(Debug, Default)]
pub struct Outcome {
    /// Messages to ring, in order
    pub messages: Vec<AlertMessage>,
    /// Run every task of the host at the next tick
    pub retry_all: bool,
    /// Probes to run again at the next tick
    pub retry: BTreeSet<String>,
}

impl Outcome {
    pub fn count(&self, kind: AlertKind) -> usize {
        self.messages.iter().filter(|m| m.kind == kind).count()
    }
}

/// Update the registry from a finished run
#[instrument(skip_all, fields(host = %run.host.name))]
pub fn process(run: &mut Run, registry: &FailRegistry, now: DateTime<Utc>) -> Outcome {
    let mut outcome = Outcome::default();
    let host = run.host.name.clone();

    // Scripts that ran clean close their task-level failure
    for result in run.results.iter().filter(|r| !r.has_errors()) {
        let subject = FailSubject::Task {
            host: host.clone(),
            probe: result.probe.name.clone(),
        };
        if let Some(record) = registry.remove(&subject.fingerprint()) {
            outcome
                .messages
                .push(task_message(AlertKind::Good, run, result, &record));
        }
    }

    let run_subject = FailSubject::Run { host: host.clone() };
    if !run.errors.is_empty() {
        for err in &run.errors {
            warn!(host = %host, error = %err, "Run error");
        }
        let (record, _) = registry.increment_fail(run_subject, now);
        if record.fail_count == 1 {
            outcome
                .messages
                .push(run_message(AlertKind::Bad, run, &record));
        }
        outcome.retry_all = true;
        return outcome;
    }

    if let Some(record) = registry.remove(&run_subject.fingerprint()) {
        outcome
            .messages
            .push(run_message(AlertKind::Good, run, &record));
    }

    for result in run.results.iter().filter(|r| r.has_errors()) {
        for err in &result.errors {
            warn!(host = %host, probe = %result.probe.name, error = %err, "Task error");
        }
        let subject = FailSubject::Task {
            host: host.clone(),
            probe: result.probe.name.clone(),
        };
        let (record, _) = registry.increment_fail(subject, now);
        if record.fail_count == 1 {
            outcome
                .messages
                .push(task_message(AlertKind::Bad, run, result, &record));
        }
        outcome.retry.insert(result.probe.name.clone());
    }

    let clean: Vec<usize> = (0..run.results.len())
        .filter(|&i| !run.results[i].has_errors())
        .collect();
    for &i in &clean {
        let errors_before = run.results[i].errors.len();
        evaluate_checks(&run.host, &mut run.results[i]);
        for err in &run.results[i].errors[errors_before..] {
            warn!(host = %host, probe = %run.results[i].probe.name, error = %err, "Check error");
        }
    }

    let run: &Run = run;
    for &i in &clean {
        let result = &run.results[i];
        let probe = &result.probe;

        for &index in &result.failed_checks {
            let Some(check) = probe.check(index) else {
                continue;
            };
            let subject = FailSubject::Check {
                host: host.clone(),
                probe: probe.name.clone(),
                index,
            };
            let (record, _) = registry.increment_fail(subject, now);
            debug!(
                probe = %probe.name,
                check = %check.desc,
                fail_count = record.fail_count,
                needed = check.needed_failures,
                "Check failing"
            );
            if record.fail_count == check.needed_failures {
                outcome
                    .messages
                    .push(check_message(AlertKind::Bad, run, result, check, &record));
            }
        }

        for &index in &result.successful_checks {
            let Some(check) = probe.check(index) else {
                continue;
            };
            let fingerprint = FailSubject::Check {
                host: host.clone(),
                probe: probe.name.clone(),
                index,
            }
            .fingerprint();
            let Some(record) = registry.increment_ok(&fingerprint) else {
                continue;
            };
            if record.ok_count < check.needed_successes {
                continue;
            }
            registry.remove(&fingerprint);
            if record.fail_count >= check.needed_failures {
                outcome
                    .messages
                    .push(check_message(AlertKind::Good, run, result, check, &record));
            }
        }
    }

    for record in registry.for_host(&host) {
        if let Some(probe) = record.subject.probe() {
            outcome.retry.insert(probe.to_string());
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwatch_core::{Check, CompiledExpression, Host, Probe, Scalar, TaskResult, Transport};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn host() -> Arc<Host> {
        Arc::new(Host {
            name: "web1".to_string(),
            classes: vec!["linux".to_string()],
            defaults: HashMap::new(),
            transport: Transport::Local,
            connection_time_warn: Duration::from_secs(10),
        })
    }

    fn disk_probe(needed_failures: u32, needed_successes: u32) -> Arc<Probe> {
        Arc::new(Probe {
            name: "disk".to_string(),
            script: PathBuf::from("disk.sh"),
            script_body: String::new(),
            targets: vec!["linux".to_string()],
            delay: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
            arguments: String::new(),
            defaults: HashMap::from([("limit".to_string(), Scalar::Integer(90))]),
            checks: vec![Check {
                index: 0,
                desc: "disk full".to_string(),
                condition: Arc::new(CompiledExpression::parse("USED > limit").unwrap()),
                classes: vec!["ops".to_string()],
                needed_failures,
                needed_successes,
            }],
            run_if: None,
        })
    }

    fn run_with(probe: &Arc<Probe>, used: &str) -> Run {
        let mut run = Run::new(host(), vec![probe.clone()]);
        let mut result = TaskResult::new(probe.clone());
        result.values.insert("USED".to_string(), used.to_string());
        result.exit_status = 0;
        run.results.push(result);
        run
    }

    fn tick(registry: &FailRegistry, probe: &Arc<Probe>, used: &str) -> Outcome {
        let mut run = run_with(probe, used);
        process(&mut run, registry, Utc::now())
    }

    #[test]
    fn test_bad_only_on_the_needed_failure() {
        let registry = FailRegistry::in_memory();
        let probe = disk_probe(3, 3);

        let counts: Vec<usize> = (0..5)
            .map(|_| tick(&registry, &probe, "95").count(AlertKind::Bad))
            .collect();
        assert_eq!(counts, vec![0, 0, 1, 0, 0]);

        let bad = tick(&registry, &probe, "95");
        assert!(bad.retry.contains("disk"));
        assert!(!bad.retry_all);
    }

    #[test]
    fn test_good_after_needed_successes() {
        let registry = FailRegistry::in_memory();
        let probe = disk_probe(2, 2);

        tick(&registry, &probe, "95");
        let bad = tick(&registry, &probe, "95");
        assert_eq!(bad.count(AlertKind::Bad), 1);
        assert_eq!(bad.messages[0].subject, "[BAD] web1: disk full (disk)");
        assert_eq!(bad.messages[0].classes, vec!["ops"]);
        assert!(bad.messages[0].details.contains("- USED: 95"));
        assert!(bad.messages[0].details.contains("- limit: 90"));

        let first_ok = tick(&registry, &probe, "10");
        assert!(first_ok.messages.is_empty());
        assert_eq!(registry.len(), 1);

        let second_ok = tick(&registry, &probe, "10");
        assert_eq!(second_ok.count(AlertKind::Good), 1);
        assert_eq!(
            second_ok.messages[0].unique_id,
            bad.messages[0].unique_id
        );
        assert!(registry.is_empty());
        assert!(second_ok.retry.is_empty());
    }

    #[test]
    fn test_no_good_without_bad() {
        let registry = FailRegistry::in_memory();
        let probe = disk_probe(3, 1);

        tick(&registry, &probe, "95");
        let ok = tick(&registry, &probe, "10");
        assert!(ok.messages.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failure_streak_reset_by_success() {
        let registry = FailRegistry::in_memory();
        let probe = disk_probe(2, 2);

        tick(&registry, &probe, "95");
        tick(&registry, &probe, "95");
        tick(&registry, &probe, "10");
        // ok_count goes back to zero, the record stays
        let again = tick(&registry, &probe, "95");
        assert!(again.messages.is_empty());
        tick(&registry, &probe, "10");
        assert_eq!(registry.len(), 1);
        assert_eq!(tick(&registry, &probe, "10").count(AlertKind::Good), 1);
    }

    #[test]
    fn test_run_errors_alert_once_and_retry_everything() {
        let registry = FailRegistry::in_memory();
        let probe = disk_probe(1, 1);

        let mut run = Run::new(host(), vec![probe.clone()]);
        run.errors.push("Transport error: connection refused".to_string());
        let first = process(&mut run, &registry, Utc::now());
        assert_eq!(first.count(AlertKind::Bad), 1);
        assert_eq!(first.messages[0].subject, "[BAD] web1: run error(s)");
        assert_eq!(first.messages[0].classes, vec!["general"]);
        assert!(first.retry_all);

        let second = process(&mut run, &registry, Utc::now());
        assert!(second.messages.is_empty());
        assert_eq!(registry.len(), 1);

        // Checks are skipped while the run fails, then resume
        let recovered = tick(&registry, &probe, "10");
        assert_eq!(recovered.count(AlertKind::Good), 1);
        assert_eq!(recovered.messages[0].subject, "[GOOD] web1: run error(s)");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_task_errors() {
        let registry = FailRegistry::in_memory();
        let probe = disk_probe(1, 1);

        let mut run = run_with(&probe, "95");
        run.results[0].errors.push("exit status 2".to_string());
        let failed = process(&mut run, &registry, Utc::now());
        assert_eq!(failed.count(AlertKind::Bad), 1);
        assert_eq!(failed.messages[0].subject, "[BAD] web1: disk: task error(s)");
        assert!(failed.retry.contains("disk"));

        let mut run = run_with(&probe, "95");
        run.results[0].errors.push("exit status 2".to_string());
        assert!(process(&mut run, &registry, Utc::now()).messages.is_empty());

        let cleared = tick(&registry, &probe, "10");
        assert_eq!(cleared.count(AlertKind::Good), 1);
        assert_eq!(
            cleared.messages[0].subject,
            "[GOOD] web1: disk: task error(s)"
        );
    }

    #[test]
    fn test_task_error_next_to_a_failing_check() {
        let registry = FailRegistry::in_memory();
        let disk = disk_probe(1, 1);
        let mut cpu = (*disk).clone();
        cpu.name = "cpu".to_string();
        cpu.script = PathBuf::from("cpu.sh");
        let cpu = Arc::new(cpu);

        let mut run = run_with(&disk, "95");
        run.probes.push(cpu.clone());
        let mut broken = TaskResult::new(cpu);
        broken.errors.push("cpu.sh, stderr: permission denied".to_string());
        run.results.push(broken);

        let outcome = process(&mut run, &registry, Utc::now());
        assert_eq!(outcome.count(AlertKind::Bad), 2);
        let subjects: Vec<&str> = outcome.messages.iter().map(|m| m.subject.as_str()).collect();
        assert!(subjects.contains(&"[BAD] web1: cpu: task error(s)"));
        assert!(subjects.contains(&"[BAD] web1: disk full (disk)"));
        assert!(!outcome.retry_all);
        assert!(outcome.retry.contains("cpu"));
        assert!(outcome.retry.contains("disk"));

        let check = FailSubject::Check {
            host: "web1".into(),
            probe: "disk".into(),
            index: 0,
        };
        assert_eq!(registry.get(&check.fingerprint()).unwrap().fail_count, 1);
        assert_eq!(registry.len(), 2);
        // The errored result is not evaluated
        assert!(run.results[1].failed_checks.is_empty());
    }

    #[test]
    fn test_bad_check_value_is_not_a_verdict() {
        let registry = FailRegistry::in_memory();
        let probe = disk_probe(1, 1);

        let mut run = run_with(&probe, "full");
        let outcome = process(&mut run, &registry, Utc::now());
        assert!(outcome.messages.is_empty());
        assert!(run.results[0].failed_checks.is_empty());
        assert!(run.results[0].successful_checks.is_empty());
        assert_eq!(run.results[0].errors.len(), 1);
    }
}
