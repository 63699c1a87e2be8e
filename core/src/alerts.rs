//! Alert dispatch
//!
//! Messages are routed to alerts by class. Every rung alert runs as its own
//! task, bounded by a semaphore, so the scheduler never waits on a command.
//! When nothing can ring, or a command fails, the message is forwarded once
//! to the general class.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::{has_class, matches_targets, Alert, Error, Result, GENERAL_CLASS};

/// Attempts allowed for one message: the first ring plus one reroute
pub const MAX_ATTEMPTS: u32 = 2;

/// Alert commands are killed after this long
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Messages
// ============================================================================

/// Failure started or ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertKind {
    Bad,
    Good,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bad => f.write_str("BAD"),
            Self::Good => f.write_str("GOOD"),
        }
    }
}

/// Alert message, built from a failure record and consumed by dispatch
#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub kind: AlertKind,
    pub subject: String,
    pub details: String,
    pub classes: Vec<String>,
    pub unique_id: String,
    pub hostname: String,
    pub datetime: DateTime<Local>,
}

impl AlertMessage {
    /// Is this message only routed to the general class?
    pub fn is_general_only(&self) -> bool {
        self.classes.len() == 1 && self.classes[0] == GENERAL_CLASS
    }

    /// Copy forwarded to the general class
    pub fn forwarded(&self, reason: &str) -> Self {
        let mut fwd = self.clone();
        fwd.subject = format!("{} (Fwd)", self.subject);
        fwd.details = format!(
            "WARNING: this message was forwarded to the '{}' class: {}\n\n{}",
            GENERAL_CLASS, reason, self.details
        );
        fwd.classes = vec![GENERAL_CLASS.to_string()];
        fwd
    }

    fn replace_placeholders(&self, arg: &str) -> String {
        arg.replace("$SUBJECT", &self.subject)
            .replace("$TYPE", &self.kind.to_string())
            .replace("$UNIQUEID", &self.unique_id)
            .replace("$HOSTNAME", &self.hostname)
    }

    /// Environment exported to alert commands
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("SUBJECT", self.subject.clone()),
            ("DETAILS", self.details.clone()),
            ("TYPE", self.kind.to_string()),
            ("UNIQUEID", self.unique_id.clone()),
            ("HOSTNAME", self.hostname.clone()),
            ("CLASSES", self.classes.join(",")),
            ("DATETIME", self.datetime.to_rfc3339()),
        ]
    }
}

/// Expand `$SUBJECT`, `$TYPE`, `$UNIQUEID` and `$HOSTNAME` in alert arguments
pub fn expand_alert_arguments(arguments: &[String], message: &AlertMessage) -> Vec<String> {
    arguments
        .iter()
        .map(|arg| message.replace_placeholders(arg))
        .collect()
}

// ============================================================================
// Runners
// ============================================================================

/// Executes one alert for one message
#[async_trait]
pub trait AlertRunner: Send + Sync {
    /// Run the alert
    async fn run(&self, alert: &Alert, message: &AlertMessage) -> Result<()>;

    /// Runner name
    fn name(&self) -> &str;
}

/// Runs alert commands as child processes, details on stdin
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

#[async_trait]
impl AlertRunner for CommandRunner {
    async fn run(&self, alert: &Alert, message: &AlertMessage) -> Result<()> {
        let mut cmd = Command::new(&alert.command);
        cmd.args(expand_alert_arguments(&alert.arguments, message))
            .envs(message.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Alert(format!(
                "can't start '{}': {}",
                alert.command.display(),
                e
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // Commands may not read their input
            if let Err(e) = stdin.write_all(message.details.as_bytes()).await {
                debug!(alert = %alert.name, error = %e, "Writing details failed");
            }
        }

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Alert(format!("'{}' timed out", alert.name)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Alert(format!(
                "'{}' failed ({}): {}",
                alert.name,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "command"
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes messages to the configured alerts
#[derive(Clone)]
pub struct AlertDispatcher {
    alerts: Arc<Vec<Alert>>,
    runner: Arc<dyn AlertRunner>,
    permits: Arc<Semaphore>,
}

impl AlertDispatcher {
    /// Create a new dispatcher
    pub fn new(alerts: Vec<Alert>, runner: Arc<dyn AlertRunner>, concurrency: usize) -> Self {
        Self {
            alerts: Arc::new(alerts),
            runner,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// Alerts whose targets match the classes, ignoring time windows
    pub fn matching<'a>(&'a self, classes: &'a [String]) -> impl Iterator<Item = &'a Alert> + 'a {
        self.alerts
            .iter()
            .filter(move |a| matches_targets(classes, &a.targets))
    }

    /// Ring a message at the current local time
    ///
    /// A failure here means even the general route could not ring; it is
    /// logged and the message dropped.
    pub fn ring(&self, message: AlertMessage) {
        let now = Local::now().naive_local();
        let subject = message.subject.clone();
        if let Err(e) = self.ring_at(message, now, 1) {
            error!(subject = %subject, error = %e, "Alert dropped");
        }
    }

    /// Ring a message as of `now`, returning the names of the rung alerts
    pub fn ring_at(
        &self,
        message: AlertMessage,
        now: NaiveDateTime,
        attempt: u32,
    ) -> Result<Vec<String>> {
        let ringable: Vec<Alert> = self
            .matching(&message.classes)
            .filter(|a| a.ringable_at(now))
            .cloned()
            .collect();

        if ringable.is_empty() {
            if message.is_general_only() || attempt >= MAX_ATTEMPTS {
                return Err(Error::Alert(format!(
                    "no alert can ring for '{}' (classes: {})",
                    message.subject,
                    message.classes.join(", ")
                )));
            }
            warn!(
                subject = %message.subject,
                classes = ?message.classes,
                "No ringable alert, forwarding to general"
            );
            let reason = format!(
                "no alert could ring for classes [{}]",
                message.classes.join(", ")
            );
            return self.ring_at(message.forwarded(&reason), now, attempt + 1);
        }

        let names = ringable.iter().map(|a| a.name.clone()).collect();
        let message = Arc::new(message);
        for alert in ringable {
            self.spawn_ringing(alert, Arc::clone(&message), attempt);
        }
        Ok(names)
    }

    fn spawn_ringing(&self, alert: Alert, message: Arc<AlertMessage>, attempt: u32) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let result = {
                let _permit = match dispatcher.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                dispatcher.runner.run(&alert, &message).await
            };

            match result {
                Ok(()) => info!(
                    alert = %alert.name,
                    kind = %message.kind,
                    subject = %message.subject,
                    "Alert rung"
                ),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(alert = %alert.name, error = %e, "Alert failed, forwarding to general");
                    let reason = format!("alert '{}' failed: {}", alert.name, e);
                    let fwd = message.forwarded(&reason);
                    let now = Local::now().naive_local();
                    if let Err(e) = dispatcher.ring_at(fwd, now, attempt + 1) {
                        error!(alert = %alert.name, error = %e, "Forwarded alert dropped");
                    }
                }
                Err(e) => error!(alert = %alert.name, error = %e, "Alert failed"),
            }
        });
    }

    /// Does any alert receive the general class?
    pub fn has_general_receiver(&self) -> bool {
        self.alerts.iter().any(Alert::receives_general)
    }

    /// Alerts a message with these classes would reach, ignoring time windows
    pub fn recipients(&self, classes: &[String]) -> Vec<String> {
        let names: Vec<String> = self.matching(classes).map(|a| a.name.clone()).collect();
        if names.is_empty() && !has_class(classes, GENERAL_CLASS) {
            let general = vec![GENERAL_CLASS.to_string()];
            return self
                .matching(&general)
                .map(|a| format!("{} (Fwd)", a.name))
                .collect();
        }
        names
    }
}
