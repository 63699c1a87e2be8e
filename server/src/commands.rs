//! Command implementations

use anyhow::{bail, Context, Result};
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use hostwatch_core::vars::{expand_arguments, merge_defaults};
use hostwatch_core::{
    check_connection, connector_for, evaluate_checks, AlertDispatcher, CommandRunner,
    CompiledExpression, Env, Error, Expression, Host, Run,
};
use hostwatch_registry::FailRegistry;
use hostwatch_scheduler::{HostWorker, Scheduler};

use crate::config::{Config, LoadOptions};
use crate::pid::PidFile;

fn load(path: &Path, options: LoadOptions) -> Result<Config> {
    Config::load(path, options)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// Run the monitoring daemon until Ctrl-C
pub async fn run(path: &Path, pid_file: Option<&Path>) -> Result<()> {
    let config = load(path, LoadOptions::default())?;
    if config.hosts.is_empty() {
        bail!("no enabled host in {}", path.display());
    }

    // Removed when the daemon returns
    let _pid_guard = pid_file.map(PidFile::create).transpose()?;

    let registry = Arc::new(FailRegistry::open(&config.save_path)?);
    let persister = registry.spawn_persister();
    info!(
        name = %config.name,
        current_fails = registry.len(),
        "Fail registry loaded"
    );

    let dispatcher = AlertDispatcher::new(
        config.alerts.clone(),
        Arc::new(CommandRunner),
        config.alert_concurrency,
    );

    let mut scheduler = Scheduler::new(config.start_time_spread);
    for host in &config.hosts {
        let worker = HostWorker::new(
            Arc::clone(host),
            &config.probes,
            connector_for(host),
            Arc::clone(&registry),
            dispatcher.clone(),
        );
        if worker.tasks().is_empty() {
            warn!(host = %host.name, "No probe targets this host");
        }
        scheduler.add_worker(worker);
    }

    let outcome = tokio::select! {
        res = scheduler.run() => res.map_err(anyhow::Error::from),
        res = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            res.map_err(anyhow::Error::from)
        }
    };

    if let Some(handle) = persister {
        handle.abort();
    }
    registry.save_now()?;
    outcome
}

/// Validate the configuration, then dial every enabled host
pub async fn check(path: &Path, connections: bool) -> Result<()> {
    let config = load(path, LoadOptions::default())?;
    println!(
        "OK ({} host(s), {} probe(s), {} alert(s))",
        config.hosts.len(),
        config.probes.len(),
        config.alerts.len()
    );
    if connections {
        test_connections(&config.hosts).await?;
    }
    Ok(())
}

/// Dial all hosts concurrently, failing on the first refused or slow one
async fn test_connections(hosts: &[Arc<Host>]) -> Result<()> {
    let mut set = JoinSet::new();
    for host in hosts {
        let host = Arc::clone(host);
        set.spawn(async move {
            let connector = connector_for(&host);
            let res = check_connection(Arc::clone(&host), connector.as_ref()).await;
            (host, res)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined? {
            (host, Ok(dial)) => {
                println!("Connection to {}: {:?}", host.name, dial);
            }
            (host, Err(e)) => failures.push(format!("Error connecting {}: {}", host.name, e)),
        }
    }

    failures.sort();
    if !failures.is_empty() {
        bail!("{}", failures.join("\n"));
    }
    Ok(())
}

/// Print hosts, then their probes and checks with receiving alerts
pub fn recap(path: &Path) -> Result<()> {
    let config = load(path, LoadOptions::default())?;
    print!("{}", recap_text(&config));
    Ok(())
}

fn recap_text(config: &Config) -> String {
    let dispatcher = AlertDispatcher::new(config.alerts.clone(), Arc::new(CommandRunner), 1);
    let mut out = String::new();

    for host in &config.hosts {
        let _ = writeln!(out, "{} ({})", host.name, host.transport.display());
        for probe in config.probes_for(host) {
            let _ = writeln!(
                out,
                "  - {} ({}m)",
                probe.name,
                probe.delay.as_secs() / 60
            );
            for check in &probe.checks {
                let _ = writeln!(out, "    - {} ({})", check.desc, check.classes.join(", "));
                let recipients = dispatcher.recipients(&check.classes);
                if recipients.is_empty() {
                    let _ = writeln!(out, "      No valid alert for this check!");
                }
                for name in recipients {
                    let _ = writeln!(out, "      > {}", name);
                }
            }
        }
    }
    out
}

/// Evaluate a constant expression
pub fn expr(source: &str) -> Result<()> {
    println!("{}", eval_constant(source)?);
    Ok(())
}

fn eval_constant(source: &str) -> Result<String> {
    let expression = CompiledExpression::parse(source)?;
    let vars = expression.vars();
    if !vars.is_empty() {
        return Err(Error::Expression(format!("Undefined variables: {}", vars.join(", "))).into());
    }
    Ok(expression.evaluate(&Env::new())?.to_string())
}

/// Run one probe on one host and print everything it produced
pub async fn test(path: &Path, host_name: &str, probe_name: &str) -> Result<()> {
    let config = load(
        path,
        LoadOptions {
            include_disabled: true,
        },
    )?;
    let host = config
        .host(host_name)
        .with_context(|| format!("can't find host '{}'", host_name))?;
    let probe = config
        .probe(probe_name)
        .with_context(|| format!("can't find probe '{}'", probe_name))?;

    if config.is_disabled("host", host_name) {
        println!("Note: host '{}' is disabled", host_name);
    }
    if config.is_disabled("probe", probe_name) {
        println!("Note: probe '{}' is disabled", probe_name);
    }
    if !host.matches_probe(probe) {
        println!("Note: probe '{}' does not target this host", probe_name);
    }

    let mut run = Run::new(Arc::clone(host), vec![Arc::clone(probe)]);
    run.execute(connector_for(host).as_ref()).await;

    let defaults = merge_defaults(&probe.defaults, &host.defaults);
    let mut names: Vec<_> = defaults.keys().collect();
    names.sort();
    println!("Arguments: {}", expand_arguments(&probe.arguments, &probe.defaults, &host.defaults));
    println!("Defaults:");
    for name in names {
        println!("- {}: {}", name, defaults[name]);
    }

    for err in &run.errors {
        println!("Run error: {}", err);
    }
    println!(
        "Dial: {:?}, run: {:?}",
        run.dial_duration, run.duration
    );

    let host = Arc::clone(&run.host);
    for result in &mut run.results {
        let had_errors = result.has_errors();
        if !had_errors {
            evaluate_checks(&host, result);
        }

        println!("Values:");
        let mut values: Vec<_> = result.values.iter().collect();
        values.sort();
        for (key, value) in values {
            println!("- {}: {}", key, value);
        }
        if !result.logs.is_empty() {
            println!("Logs:");
            for log in &result.logs {
                println!("{}", log);
            }
        }
        println!("Exit status: {}", result.exit_status);
        println!("Duration: {:?}", result.duration);
        for err in &result.errors {
            println!("Error: {}", err);
        }

        if had_errors {
            println!("Checks skipped (task errors)");
            continue;
        }
        for check in &result.probe.checks {
            let verdict = if result.failed_checks.contains(&check.index) {
                "BAD"
            } else if result.successful_checks.contains(&check.index) {
                "GOOD"
            } else {
                "ERROR"
            };
            println!("[{}] {}: {}", verdict, check.desc, check.condition);
        }
    }
    Ok(())
}
