//! Run execution
//!
//! One run streams every due script of a host through a single session.
//! The coordinator writes one framed script at a time and waits for its
//! exit sentinel; two reader tasks turn stdout and stderr into events.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::protocol::{self, Line};
use crate::remote::Connector;
use crate::vars::expand_arguments;
use crate::{Error, Host, Probe, Result};

/// Wall-clock limit of a whole run
pub const RUN_TIMEOUT: Duration = Duration::from_secs(59);

/// Outcome of one script
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub probe: Arc<Probe>,
    pub values: HashMap<String, String>,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    /// -1 until the exit sentinel arrives
    pub exit_status: i32,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub failed_checks: Vec<usize>,
    pub successful_checks: Vec<usize>,
}

impl TaskResult {
    /// Create an empty result starting now
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            values: HashMap::new(),
            logs: Vec::new(),
            errors: Vec::new(),
            exit_status: -1,
            start: Utc::now(),
            duration: Duration::ZERO,
            failed_checks: Vec::new(),
            successful_checks: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn apply(&mut self, event: Event) -> Result<Option<i32>> {
        match event {
            Event::Stdout(Line::Exit(status)) => return Ok(Some(status)),
            Event::Stdout(Line::Ready) => {
                return Err(Error::Protocol("unexpected handshake during a task".into()))
            }
            Event::Stdout(Line::Log(line)) => self.logs.push(line),
            Event::Stdout(Line::Value(key, value)) => {
                if self.values.contains_key(&key) {
                    self.errors.push(format!("duplicated value '{}'", key));
                } else {
                    self.values.insert(key, value);
                }
            }
            Event::Stdout(Line::Invalid(err)) => self.errors.push(err),
            Event::Stdout(Line::Protocol(err)) => return Err(Error::Protocol(err)),
            Event::Stderr(line) => self
                .errors
                .push(format!("{}, stderr: {}", self.probe.script_name(), line)),
            Event::ReadError(err) => return Err(Error::Transport(err)),
        }
        Ok(None)
    }
}

/// One scheduling tick for one host
#[derive(Debug, Clone)]
pub struct Run {
    pub host: Arc<Host>,
    pub probes: Vec<Arc<Probe>>,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub dial_duration: Duration,
    pub results: Vec<TaskResult>,
    pub errors: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug)]
enum Event {
    Stdout(Line),
    Stderr(String),
    ReadError(String),
}

fn spawn_reader<R>(stream: R, tx: mpsc::UnboundedSender<Event>, is_stderr: bool)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            let event = match lines.next_line().await {
                Ok(Some(line)) if is_stderr => Event::Stderr(line),
                Ok(Some(line)) => Event::Stdout(protocol::classify(&line)),
                Ok(None) => break,
                Err(e) => Event::ReadError(e.to_string()),
            };
            let failed = matches!(event, Event::ReadError(_));
            if tx.send(event).is_err() || failed {
                break;
            }
        }
    });
}

impl Run {
    /// Create a run for the given probes, in execution order
    pub fn new(host: Arc<Host>, probes: Vec<Arc<Probe>>) -> Self {
        Self {
            host,
            probes,
            start: Utc::now(),
            duration: Duration::ZERO,
            dial_duration: Duration::ZERO,
            results: Vec::new(),
            errors: Vec::new(),
            timeout: RUN_TIMEOUT,
        }
    }

    /// Override the run deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Results that carry at least one error
    pub fn failed_results(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| r.has_errors())
    }

    /// Execute every probe through one session
    ///
    /// Never fails: problems land in [`Run::errors`] or in the task results.
    #[instrument(skip_all, fields(host = %self.host.name, tasks = self.probes.len()))]
    pub async fn execute(&mut self, connector: &dyn Connector) {
        let started = Instant::now();
        let deadline = started + self.timeout;
        self.start = Utc::now();

        let session = match timeout_at(deadline, connector.connect(protocol::BOOTSTRAP)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.errors.push(e.to_string());
                self.duration = started.elapsed();
                return;
            }
            Err(_) => {
                self.errors
                    .push(format!("timeout connecting to {}", connector.describe()));
                self.duration = started.elapsed();
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_reader(session.stdout, tx.clone(), false);
        spawn_reader(session.stderr, tx, true);
        let mut handle = session.handle;
        let mut stdin = session.stdin;

        // The dial ends when the remote shell answers, not when the client starts
        let dialed = timeout_at(
            deadline,
            handshake(&mut stdin, &mut rx, &connector.describe()),
        )
        .await;
        let dial_error = match dialed {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timeout connecting to {}", connector.describe())),
        };
        if let Some(err) = dial_error {
            self.errors.push(err);
            if let Err(e) = handle.close().await {
                debug!(error = %e, "Closing session failed");
            }
            self.dial_duration = started.elapsed();
            self.duration = self.dial_duration;
            return;
        }

        self.dial_duration = started.elapsed();
        if self.dial_duration > self.host.connection_time_warn {
            self.errors.push(format!(
                "slow connection to {}: {:?} (warn above {:?})",
                connector.describe(),
                self.dial_duration,
                self.host.connection_time_warn
            ));
        }

        let driven = timeout_at(
            deadline,
            drive(
                &self.host,
                &self.probes,
                &mut self.results,
                &mut self.errors,
                stdin,
                &mut rx,
            ),
        )
        .await;

        let mut close = true;
        match driven {
            Ok(Ok(())) => close = false,
            Ok(Err(e)) => self.errors.push(e.to_string()),
            Err(_) => {
                warn!(host = %self.host.name, "Run timed out");
                self.errors
                    .push(format!("run timeout after {:?}", self.timeout));
            }
        }

        if !close {
            match timeout_at(deadline, handle.wait()).await {
                Ok(Ok(Some(0))) | Ok(Ok(None)) => {}
                Ok(Ok(Some(code))) => self
                    .errors
                    .push(format!("session ended with exit code {}", code)),
                Ok(Err(e)) => self.errors.push(e.to_string()),
                Err(_) => {
                    self.errors.push("timeout waiting for session end".into());
                    close = true;
                }
            }
        }
        if close {
            if let Err(e) = handle.close().await {
                debug!(error = %e, "Closing session failed");
            }
        }

        self.duration = started.elapsed();
        debug!(
            duration_ms = self.duration.as_millis() as u64,
            errors = self.errors.len(),
            "Run finished"
        );
    }
}

/// Open a session without tasks and report the dial duration
///
/// Any run error, including a dial slower than the host's warning
/// threshold, fails the check. The whole attempt is bounded by twice
/// that threshold.
pub async fn check_connection(host: Arc<Host>, connector: &dyn Connector) -> Result<Duration> {
    let limit = host.connection_time_warn * 2;
    let mut run = Run::new(host, Vec::new()).with_timeout(limit);
    run.execute(connector).await;
    if run.errors.is_empty() {
        Ok(run.dial_duration)
    } else {
        Err(Error::Transport(run.errors.join("; ")))
    }
}

/// Send the preamble and wait for the shell to answer it
///
/// Output before the answer (login banners, rc files, ssh warnings) is
/// only kept to explain a failed connection.
async fn handshake<W>(
    stdin: &mut W,
    rx: &mut mpsc::UnboundedReceiver<Event>,
    target: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let sent = match stdin.write_all(protocol::preamble().as_bytes()).await {
        Ok(()) => stdin.flush().await,
        Err(e) => Err(e),
    };
    let mut noise = Vec::new();
    if let Err(e) = sent {
        noise.push(format!("writing preamble: {}", e));
    }

    while let Some(event) = rx.recv().await {
        match event {
            Event::Stdout(Line::Ready) => return Ok(()),
            Event::Stdout(other) => debug!(line = ?other, "Output before handshake"),
            Event::Stderr(line) => {
                debug!(line = %line, "Stderr before handshake");
                noise.push(line);
            }
            Event::ReadError(err) => noise.push(err),
        }
    }

    if noise.is_empty() {
        noise.push("session closed".to_string());
    }
    Err(Error::Transport(format!(
        "can't connect to {}: {}",
        target,
        noise.join("; ")
    )))
}

/// Coordinator: feed scripts one at a time and collect their output
async fn drive<W>(
    host: &Host,
    probes: &[Arc<Probe>],
    results: &mut Vec<TaskResult>,
    run_errors: &mut Vec<String>,
    mut stdin: W,
    rx: &mut mpsc::UnboundedReceiver<Event>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for (seq, probe) in probes.iter().enumerate() {
        let arguments = expand_arguments(&probe.arguments, &probe.defaults, &host.defaults);
        let framed = protocol::frame_task(seq, &arguments, &probe.script_body);

        let slot = results.len();
        results.push(TaskResult::new(Arc::clone(probe)));
        let result = &mut results[slot];
        let started = Instant::now();

        let written = match stdin.write_all(framed.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            result
                .errors
                .push(format!("can't send script {}: {}", probe.script_name(), e));
            result.duration = started.elapsed();
            break;
        }

        let status = loop {
            let event = rx.recv().await.ok_or_else(|| {
                Error::Transport(format!(
                    "session closed while running {}",
                    probe.script_name()
                ))
            })?;
            if let Some(status) = result.apply(event)? {
                break status;
            }
        };

        // A non-zero status is data for the checks, not a failure
        result.exit_status = status;
        result.duration = started.elapsed();
        if result.duration > probe.timeout {
            result.errors.push(format!(
                "timeout: {:?} > {:?}",
                result.duration, probe.timeout
            ));
        }
        debug!(
            probe = %probe.name,
            exit_status = status,
            values = result.values.len(),
            errors = result.errors.len(),
            "Task finished"
        );
    }

    // Late lines belong to the last task, stderr may trail its sentinel
    drop(stdin);
    while let Some(event) = rx.recv().await {
        match (results.last_mut(), event) {
            (_, Event::ReadError(err)) => run_errors.push(err),
            (Some(last), event) => match last.apply(event) {
                Ok(None) => {}
                Ok(Some(status)) => {
                    run_errors.push(format!("unexpected exit status {} after the last task", status))
                }
                Err(e) => run_errors.push(e.to_string()),
            },
            (None, Event::Stdout(line)) => {
                run_errors.push(format!("output with no active task: {:?}", line))
            }
            (None, Event::Stderr(line)) => {
                run_errors.push(format!("stderr with no active task: {}", line))
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::{host, probe, FakeConnector, FakeTask};
    use super::*;
    use crate::remote::{spawn_session, Session};

    #[tokio::test]
    async fn test_results_are_attributed_in_queue_order() {
        let connector = FakeConnector::new(vec![
                FakeTask::printing(&["CPU: 42"]),
                FakeTask::printing(&["# checking disks", "DISK: 80"]),
                FakeTask::printing(&["LOAD: 1.5"]),
            ]);
        let mut run = Run::new(host(), vec![probe("cpu"), probe("disk"), probe("load")]);
        run.execute(&connector).await;

        assert!(run.errors.is_empty(), "{:?}", run.errors);
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.results[0].values["CPU"], "42");
        assert_eq!(run.results[1].values["DISK"], "80");
        assert_eq!(run.results[1].logs, vec!["# checking disks"]);
        assert_eq!(run.results[2].values["LOAD"], "1.5");
        assert!(run.results.iter().all(|r| r.exit_status == 0 && !r.has_errors()));
    }

    #[tokio::test]
    async fn test_task_level_errors() {
        let connector = FakeConnector::new(vec![
                FakeTask::printing(&["cpu: 42", "CPU: 1", "CPU: 2", "garbage"]),
                FakeTask {
                    stderr: vec!["disk not found".to_string()],
                    exit: 3,
                    ..Default::default()
                },
            ]);
        let mut run = Run::new(host(), vec![probe("cpu"), probe("disk")]);
        run.execute(&connector).await;

        assert!(run.errors.is_empty(), "{:?}", run.errors);
        let cpu = &run.results[0];
        assert_eq!(cpu.values["CPU"], "1");
        assert_eq!(cpu.errors.len(), 3, "{:?}", cpu.errors);

        let disk = &run.results[1];
        assert_eq!(disk.exit_status, 3);
        assert_eq!(disk.errors, vec!["disk.sh, stderr: disk not found"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_kept_as_data() {
        let connector = FakeConnector::new(vec![FakeTask {
            stdout: vec!["STATE: warning".to_string()],
            exit: 1,
            ..Default::default()
        }]);
        let mut run = Run::new(host(), vec![probe("nagios")]);
        run.execute(&connector).await;

        assert!(run.errors.is_empty(), "{:?}", run.errors);
        let result = &run.results[0];
        assert_eq!(result.exit_status, 1);
        assert_eq!(result.values["STATE"], "warning");
        assert!(!result.has_errors(), "{:?}", result.errors);
    }

    #[tokio::test]
    async fn test_stderr_after_last_sentinel_stays_on_the_task() {
        let connector = FakeConnector::new(vec![FakeTask {
            stdout: vec!["CPU: 1".to_string()],
            late_stderr: vec!["df: warning".to_string()],
            ..Default::default()
        }]);
        let mut run = Run::new(host(), vec![probe("cpu")]);
        run.execute(&connector).await;

        assert!(run.errors.is_empty(), "{:?}", run.errors);
        assert_eq!(run.results[0].values["CPU"], "1");
        assert_eq!(run.results[0].errors, vec!["cpu.sh, stderr: df: warning"]);
    }

    #[tokio::test]
    async fn test_slow_dial_is_a_run_error() {
        let mut slow_host = (*host()).clone();
        slow_host.connection_time_warn = Duration::from_millis(50);
        let connector = FakeConnector {
            tasks: vec![FakeTask::printing(&["CPU: 5"])],
            dial_delay: Duration::from_millis(200),
        };
        let mut run = Run::new(Arc::new(slow_host), vec![probe("cpu")]);
        run.execute(&connector).await;

        assert!(run.dial_duration >= Duration::from_millis(200));
        assert_eq!(run.errors.len(), 1, "{:?}", run.errors);
        assert!(run.errors[0].starts_with("slow connection to fake"));
        // The run still goes on
        assert_eq!(run.results[0].values["CPU"], "5");
    }

    /// Shell started through `sh -c`, like a local or ssh session
    struct ShellConnector(&'static str);

    #[async_trait::async_trait]
    impl Connector for ShellConnector {
        async fn connect(&self, _bootstrap: &str) -> Result<Session> {
            let mut command = tokio::process::Command::new("sh");
            command.arg("-c").arg(self.0);
            spawn_session(command)
        }

        fn describe(&self) -> String {
            "shell".to_string()
        }
    }

    #[tokio::test]
    async fn test_refused_connection_fails_the_dial() {
        let connector =
            ShellConnector("echo 'ssh: connect to host db1 port 22: Connection refused' >&2; exit 255");
        let mut run = Run::new(host(), vec![probe("cpu")]);
        run.execute(&connector).await;

        assert_eq!(run.errors.len(), 1, "{:?}", run.errors);
        assert!(run.errors[0].contains("can't connect to shell"));
        assert!(run.errors[0].contains("Connection refused"));
        assert!(run.results.is_empty());
    }

    #[tokio::test]
    async fn test_dial_waits_for_the_remote_shell() {
        let mut slow_host = (*host()).clone();
        slow_host.connection_time_warn = Duration::from_millis(100);
        let slow_host = Arc::new(slow_host);

        // The shell only reads its input after the sleep
        let connector = ShellConnector("sleep 0.3; exec bash -s --");
        let mut run = Run::new(Arc::clone(&slow_host), Vec::new());
        run.execute(&connector).await;
        assert!(run.dial_duration >= Duration::from_millis(300));
        assert_eq!(run.errors.len(), 1, "{:?}", run.errors);
        assert!(run.errors[0].starts_with("slow connection to shell"));

        // Twice the threshold elapses before the handshake
        let err = check_connection(slow_host, &connector).await.unwrap_err();
        assert!(err.to_string().contains("timeout connecting to shell"), "{}", err);

        let dial = check_connection(host(), &FakeConnector::default()).await.unwrap();
        assert!(dial < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unknown_keyword_is_a_run_error() {
        let connector = FakeConnector::new(vec![FakeTask::printing(&["__BOGUS=1"])]);
        let mut run = Run::new(host(), vec![probe("cpu")]);
        run.execute(&connector).await;

        assert_eq!(run.errors.len(), 1);
        assert!(run.errors[0].contains("unknown keyword"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_results() {
        let connector = FakeConnector::new(vec![
                FakeTask::printing(&["CPU: 7"]),
                FakeTask {
                    hang: true,
                    ..Default::default()
                },
            ]);
        let mut run = Run::new(host(), vec![probe("cpu"), probe("disk")])
            .with_timeout(Duration::from_millis(300));
        run.execute(&connector).await;

        assert!(run.errors.iter().any(|e| e.contains("run timeout")));
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.results[0].values["CPU"], "7");
        assert_eq!(run.results[1].exit_status, -1);
    }
}
