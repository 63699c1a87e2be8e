//! Per-host scheduling loop

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use hostwatch_core::vars::merge_defaults;
use hostwatch_core::{AlertDispatcher, Connector, Expression, Host, Probe, Run, Scalar, Task};
use hostwatch_registry::FailRegistry;

use crate::outcome::{self, Outcome};

/// Length of one scheduling tick
pub const TICK: Duration = Duration::from_secs(60);

/// Owns the tasks of one host and drives their runs
pub struct HostWorker {
    host: Arc<Host>,
    tasks: Vec<Task>,
    connector: Arc<dyn Connector>,
    registry: Arc<FailRegistry>,
    dispatcher: AlertDispatcher,
    tick_length: Duration,
}

impl HostWorker {
    /// Create a worker with one task per probe targeting the host
    pub fn new(
        host: Arc<Host>,
        probes: &[Arc<Probe>],
        connector: Arc<dyn Connector>,
        registry: Arc<FailRegistry>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        let now = Utc::now();
        let tasks = probes
            .iter()
            .filter(|p| host.matches_probe(p))
            .map(|p| Task::new(Arc::clone(p), now))
            .collect();
        Self {
            host,
            tasks,
            connector,
            registry,
            dispatcher,
            tick_length: TICK,
        }
    }

    /// Override the tick length
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_length = tick;
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Probes to run at `now`, rescheduling them
    fn due_probes(&mut self, now: DateTime<Utc>) -> Vec<Arc<Probe>> {
        let mut due = Vec::new();
        for task in self.tasks.iter_mut().filter(|t| t.is_due(now)) {
            let probe = Arc::clone(&task.probe);
            if let Some(run_if) = &probe.run_if {
                let env = merge_defaults(&probe.defaults, &self.host.defaults);
                match run_if.evaluate(&env) {
                    Ok(Scalar::Boolean(true)) => {}
                    Ok(Scalar::Boolean(false)) => {
                        info!(host = %self.host.name, probe = %probe.name, "Paused task");
                        continue;
                    }
                    Ok(other) => {
                        warn!(
                            host = %self.host.name,
                            probe = %probe.name,
                            value = %other,
                            "run_if returned a non-boolean value"
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(host = %self.host.name, probe = %probe.name, error = %e, "run_if failed");
                        continue;
                    }
                }
            }

            let delay = chrono::Duration::from_std(probe.delay)
                .unwrap_or_else(|_| chrono::Duration::minutes(1));
            task.reschedule(now + delay);
            debug!(host = %self.host.name, probe = %probe.name, next_run = %task.next_run, "Running task");
            due.push(probe);
        }
        due
    }

    fn apply(&mut self, outcome: &Outcome) {
        for task in &mut self.tasks {
            if outcome.retry_all || outcome.retry.contains(&task.probe.name) {
                task.force_retry();
            }
        }
        for message in &outcome.messages {
            self.dispatcher.ring(message.clone());
        }
    }

    /// One scheduling step
    ///
    /// Returns the finished run, or `None` when nothing was due.
    #[instrument(skip(self), fields(host = %self.host.name))]
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<Run> {
        let due = self.due_probes(now);
        if due.is_empty() {
            return None;
        }

        let mut run = Run::new(Arc::clone(&self.host), due);
        run.execute(self.connector.as_ref()).await;
        let outcome = outcome::process(&mut run, &self.registry, Utc::now());
        self.apply(&outcome);

        info!(
            tasks = run.probes.len(),
            errors = run.errors.len(),
            alerts = outcome.messages.len(),
            duration_ms = run.duration.as_millis() as u64,
            "Run ended"
        );
        Some(run)
    }

    /// Tick forever, sleeping out the rest of each tick
    pub async fn run_forever(mut self, initial_delay: Duration) {
        tokio::time::sleep(initial_delay).await;
        info!(
            host = %self.host.name,
            transport = %self.host.transport.display(),
            tasks = self.tasks.len(),
            "Host worker started"
        );

        loop {
            let started = Instant::now();
            self.tick(Utc::now()).await;

            let elapsed = started.elapsed();
            if elapsed < self.tick_length {
                tokio::time::sleep(self.tick_length - elapsed).await;
            } else {
                error!(
                    host = %self.host.name,
                    duration_ms = elapsed.as_millis() as u64,
                    "Run duration was too long"
                );
            }
        }
    }
}
