//! Configuration management
//!
//! The configuration directory holds `hostwatch.toml`, one file per host,
//! probe and alert in `hosts.d/`, `probes.d/` and `alerts.d/`, and the
//! scripts in `scripts/probes/` and `scripts/alerts/`.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use hostwatch_core::vars::{is_all_upper, is_valid_token, template_vars};
use hostwatch_core::{
    Alert, Check, CompiledExpression, Error, Expression, Host, HourRange, Probe, Result, Scalar,
    SshTarget, Transport,
};

pub const MAIN_FILE: &str = "hostwatch.toml";

const DEFAULT_SPREAD: Duration = Duration::from_secs(15);
const MAX_SPREAD: Duration = Duration::from_secs(60);
const DEFAULT_CONN_WARN: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_ALERT_CONCURRENCY: usize = 8;

// ============================================================================
// Durations
// ============================================================================

/// Parse `90s`, `5m`, `1h`, `1m30s` or `500ms`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::Config(format!("invalid duration '{}' (ex: '90s', '5m', '1m30s')", input));
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let number: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_secs = match &rest[..unit_end] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_end..];
        let part = Duration::try_from_secs_f64(number * unit_secs).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }
    Ok(total)
}

fn optional_duration(value: &Option<String>, default: Duration) -> Result<Duration> {
    value.as_deref().map(parse_duration).unwrap_or(Ok(default))
}

// ============================================================================
// TOML files
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlGlobal {
    name: Option<String>,
    start_time_spread: Option<String>,
    ssh_connection_time_warn: Option<String>,
    save_path: Option<PathBuf>,
    alert_concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlDefault {
    name: String,
    value: toml::Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlNetwork {
    host: String,
    port: Option<u16>,
    user: String,
    key: Option<PathBuf>,
    ssh_connection_time_warn: Option<String>,
    #[serde(default)]
    ssh_options: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlHost {
    name: String,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    classes: Vec<String>,
    #[serde(default)]
    local: bool,
    network: Option<TomlNetwork>,
    #[serde(default)]
    default: Vec<TomlDefault>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlCheck {
    desc: String,
    #[serde(rename = "if")]
    condition: String,
    #[serde(default)]
    classes: Vec<String>,
    needed_failures: Option<u32>,
    needed_successes: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlProbe {
    name: String,
    #[serde(default)]
    disabled: bool,
    script: String,
    #[serde(default)]
    targets: Vec<String>,
    delay: String,
    timeout: Option<String>,
    #[serde(default)]
    arguments: String,
    run_if: Option<String>,
    #[serde(default)]
    default: Vec<TomlDefault>,
    #[serde(default)]
    check: Vec<TomlCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlAlert {
    name: String,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    targets: Vec<String>,
    command: String,
    #[serde(default)]
    arguments: Vec<String>,
    #[serde(default)]
    hours: Vec<String>,
    #[serde(default)]
    days: Vec<i64>,
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// `*.toml` files of a directory, sorted by name
fn toml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("can't list {}: {}", dir.display(), e)))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn with_file<T>(path: &Path, result: Result<T>) -> Result<T> {
    result.map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
        other => Error::Config(format!("{}: {}", path.display(), other)),
    })
}

// ============================================================================
// Validation helpers
// ============================================================================

fn check_classes(classes: &[String]) -> Result<()> {
    if classes.is_empty() {
        return Err(Error::Config("empty 'classes'".into()));
    }
    for class in classes {
        if !is_valid_token(class) {
            return Err(Error::Config(format!("invalid class name '{}'", class)));
        }
    }
    Ok(())
}

fn check_targets(targets: &[String]) -> Result<()> {
    if targets.is_empty() {
        return Err(Error::Config("empty 'targets'".into()));
    }
    for token in targets.iter().flat_map(|t| t.split('&')).map(str::trim) {
        if token != "*" && !is_valid_token(token) {
            return Err(Error::Config(format!(
                "invalid 'target' class name '{}'",
                token
            )));
        }
    }
    Ok(())
}

fn scalar_from_toml(name: &str, value: toml::Value) -> Result<Scalar> {
    match value {
        toml::Value::String(s) => Ok(Scalar::String(s)),
        toml::Value::Integer(i) => Ok(Scalar::Integer(i)),
        toml::Value::Float(f) => Ok(Scalar::Float(f)),
        toml::Value::Boolean(b) => Ok(Scalar::Boolean(b)),
        _ => Err(Error::Config(format!(
            "[[default]] invalid value type for '{}'",
            name
        ))),
    }
}

fn build_defaults(list: Vec<TomlDefault>) -> Result<HashMap<String, Scalar>> {
    let mut defaults = HashMap::new();
    for default in list {
        if default.name.is_empty() || !is_valid_token(&default.name) {
            return Err(Error::Config(format!(
                "[[default]] with invalid name '{}'",
                default.name
            )));
        }
        if is_all_upper(&default.name) {
            return Err(Error::Config(format!(
                "[[default]] name is invalid (all uppercase): {}",
                default.name
            )));
        }
        if defaults.contains_key(&default.name) {
            return Err(Error::Config(format!(
                "duplicate default name '{}'",
                default.name
            )));
        }
        let value = scalar_from_toml(&default.name, default.value)?;
        defaults.insert(default.name, value);
    }
    Ok(defaults)
}

fn parse_expression(source: &str, what: &str) -> Result<Arc<dyn Expression>> {
    let expr = CompiledExpression::parse(source).map_err(|e| {
        Error::Config(format!("invalid '{}' expression \"{}\": {}", what, source, e))
    })?;
    Ok(Arc::new(expr))
}

// ============================================================================
// Conversions
// ============================================================================

fn build_host(toml: TomlHost, global_warn: Duration) -> Result<Host> {
    if toml.name.is_empty() {
        return Err(Error::Config("invalid or missing 'name'".into()));
    }
    check_classes(&toml.classes)?;
    let defaults = build_defaults(toml.default)?;

    let (transport, connection_time_warn) = match (toml.local, toml.network) {
        (true, Some(_)) => {
            return Err(Error::Config(
                "'local' and a [network] section can't be used together".into(),
            ))
        }
        (true, None) => (Transport::Local, global_warn),
        (false, None) => {
            return Err(Error::Config(
                "missing [network] section (or 'local = true')".into(),
            ))
        }
        (false, Some(network)) => {
            if network.host.is_empty() {
                return Err(Error::Config(
                    "[network] section, invalid or missing 'host'".into(),
                ));
            }
            if network.user.is_empty() {
                return Err(Error::Config(
                    "[network] section, invalid or missing 'user'".into(),
                ));
            }
            if let Some(key) = &network.key {
                fs::metadata(key).map_err(|e| {
                    Error::Config(format!("can't access key '{}': {}", key.display(), e))
                })?;
            }
            let warn = optional_duration(&network.ssh_connection_time_warn, global_warn)?;
            let target = SshTarget {
                host: network.host,
                port: network.port.unwrap_or(22),
                user: network.user,
                key_path: network.key,
                options: network.ssh_options,
            };
            (Transport::Ssh(target), warn)
        }
    };
    if connection_time_warn < Duration::from_secs(1) {
        return Err(Error::Config(
            "'ssh_connection_time_warn' can't be less than a second".into(),
        ));
    }

    Ok(Host {
        name: toml.name,
        classes: toml.classes,
        defaults,
        transport,
        connection_time_warn,
    })
}

fn build_check(index: usize, toml: TomlCheck) -> Result<Check> {
    if toml.desc.is_empty() {
        return Err(Error::Config("[[check]] with invalid or missing 'desc'".into()));
    }
    if toml.condition.is_empty() {
        return Err(Error::Config("[[check]] with invalid or missing 'if'".into()));
    }
    let condition = parse_expression(&toml.condition, "if")?;
    check_classes(&toml.classes)?;

    let needed_failures = toml.needed_failures.filter(|&n| n > 0).unwrap_or(1);
    let needed_successes = toml
        .needed_successes
        .filter(|&n| n > 0)
        .unwrap_or(needed_failures);

    Ok(Check {
        index,
        desc: toml.desc,
        condition,
        classes: toml.classes,
        needed_failures,
        needed_successes,
    })
}

fn build_probe(toml: TomlProbe, config_path: &Path) -> Result<Probe> {
    if toml.name.is_empty() {
        return Err(Error::Config("invalid or missing 'name'".into()));
    }
    if toml.script.is_empty() {
        return Err(Error::Config("invalid or missing 'script'".into()));
    }
    let script = config_path.join("scripts").join("probes").join(&toml.script);
    if !script.is_file() {
        return Err(Error::Config(format!(
            "invalid 'script' file '{}'",
            script.display()
        )));
    }
    let script_body = fs::read_to_string(&script).map_err(|e| {
        Error::Config(format!("error reading script '{}': {}", script.display(), e))
    })?;

    check_targets(&toml.targets)?;

    let delay = parse_duration(&toml.delay)?;
    if delay < Duration::from_secs(60) {
        return Err(Error::Config("'delay' can't be less than a minute".into()));
    }
    if delay.as_secs() % 60 != 0 || delay.subsec_nanos() != 0 {
        return Err(Error::Config(
            "'delay' granularity is in minutes (ex: 5m)".into(),
        ));
    }

    let timeout = optional_duration(&toml.timeout, DEFAULT_TIMEOUT)?;
    if timeout < Duration::from_secs(1) {
        return Err(Error::Config("'timeout' can't be less than 1 second".into()));
    }

    let defaults = build_defaults(toml.default)?;
    let checks = toml
        .check
        .into_iter()
        .enumerate()
        .map(|(index, check)| build_check(index, check))
        .collect::<Result<Vec<_>>>()?;
    let run_if = toml
        .run_if
        .as_deref()
        .map(|src| parse_expression(src, "run_if"))
        .transpose()?;

    let mut used: Vec<String> = template_vars(&toml.arguments);
    for expr in checks.iter().map(|c| &c.condition).chain(run_if.iter()) {
        used.extend(expr.vars().into_iter().filter(|v| !is_all_upper(v)));
    }
    let mut missing: Vec<String> = used
        .into_iter()
        .filter(|v| !defaults.contains_key(v))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(Error::Config(format!(
            "missing defaults (used in 'if', 'run_if' or 'arguments'): {}",
            missing.join(", ")
        )));
    }

    Ok(Probe {
        name: toml.name,
        script,
        script_body,
        targets: toml.targets,
        delay,
        timeout,
        arguments: toml.arguments,
        defaults,
        checks,
        run_if,
    })
}

fn resolve_command(config_path: &Path, command: &str) -> Result<PathBuf> {
    let local = config_path.join("scripts").join("alerts").join(command);
    if local.exists() {
        if !local.is_file() {
            return Err(Error::Config(format!(
                "is not a regular 'script' file '{}'",
                local.display()
            )));
        }
        return Ok(local);
    }
    which::which(command)
        .map_err(|e| Error::Config(format!("'{}' command not found in PATH: {}", command, e)))
}

fn build_alert(toml: TomlAlert, config_path: &Path) -> Result<Alert> {
    if toml.name.is_empty() {
        return Err(Error::Config("invalid or missing 'name'".into()));
    }
    if toml.command.is_empty() {
        return Err(Error::Config("invalid or missing 'command'".into()));
    }
    let command = resolve_command(config_path, &toml.command)?;
    check_targets(&toml.targets)?;

    let hours = toml
        .hours
        .iter()
        .map(|h| h.parse::<HourRange>())
        .collect::<Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("'hours' parameter: {}", e)))?;

    let mut days = Vec::with_capacity(toml.days.len());
    for day in toml.days {
        match day {
            0..=6 => days.push(day as u32),
            7 => days.push(0),
            _ => {
                return Err(Error::Config(format!(
                    "'days' parameter: {} is not in 0..=7",
                    day
                )))
            }
        }
    }

    Ok(Alert {
        name: toml.name,
        targets: toml.targets,
        command,
        arguments: toml.arguments,
        hours,
        days,
    })
}

// ============================================================================
// Config
// ============================================================================

/// Loading switches
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Keep hosts and probes marked `disabled`
    pub include_disabled: bool,
}

/// Validated configuration
#[derive(Debug)]
pub struct Config {
    pub path: PathBuf,
    pub name: String,
    pub start_time_spread: Duration,
    pub ssh_connection_time_warn: Duration,
    pub save_path: PathBuf,
    pub alert_concurrency: usize,
    pub hosts: Vec<Arc<Host>>,
    pub probes: Vec<Arc<Probe>>,
    pub alerts: Vec<Alert>,
    /// Names of entries loaded although disabled
    pub disabled: HashSet<String>,
}

impl Config {
    /// Load and validate the configuration directory
    pub fn load(path: &Path, options: LoadOptions) -> Result<Self> {
        info!(path = %path.display(), "Loading configuration");

        let main_file = path.join(MAIN_FILE);
        let global: TomlGlobal = if main_file.exists() {
            read_toml(&main_file)?
        } else {
            debug!(file = %main_file.display(), "No main configuration file, using defaults");
            TomlGlobal::default()
        };

        let start_time_spread = with_file(
            &main_file,
            optional_duration(&global.start_time_spread, DEFAULT_SPREAD),
        )?;
        if start_time_spread > MAX_SPREAD {
            return Err(Error::Config(
                "'start_time_spread' can't be more than a minute".into(),
            ));
        }
        let ssh_connection_time_warn = with_file(
            &main_file,
            optional_duration(&global.ssh_connection_time_warn, DEFAULT_CONN_WARN),
        )?;
        if ssh_connection_time_warn < Duration::from_secs(1) {
            return Err(Error::Config(
                "'ssh_connection_time_warn' can't be less than a second".into(),
            ));
        }
        let alert_concurrency = global.alert_concurrency.unwrap_or(DEFAULT_ALERT_CONCURRENCY);
        if alert_concurrency == 0 {
            return Err(Error::Config("'alert_concurrency' can't be 0".into()));
        }

        let mut config = Self {
            path: path.to_path_buf(),
            name: global.name.unwrap_or_else(|| "hostwatch".to_string()),
            start_time_spread,
            ssh_connection_time_warn,
            save_path: global.save_path.unwrap_or_else(|| PathBuf::from("./")),
            alert_concurrency,
            hosts: Vec::new(),
            probes: Vec::new(),
            alerts: Vec::new(),
            disabled: HashSet::new(),
        };

        config.load_alerts()?;
        config.load_probes(options)?;
        config.load_hosts(options)?;

        info!(
            hosts = config.hosts.len(),
            probes = config.probes.len(),
            alerts = config.alerts.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn load_alerts(&mut self) -> Result<()> {
        let mut names = HashSet::new();
        for file in toml_files(&self.path.join("alerts.d"))? {
            let toml: TomlAlert = read_toml(&file)?;
            if toml.disabled {
                continue;
            }
            let alert = with_file(&file, build_alert(toml, &self.path))?;
            if !names.insert(alert.name.clone()) {
                return Err(Error::Config(format!(
                    "{}: duplicate alert name '{}'",
                    file.display(),
                    alert.name
                )));
            }
            self.alerts.push(alert);
        }
        if !self.alerts.iter().any(Alert::receives_general) {
            return Err(Error::Config(
                "at least one alert must target the 'general' class (or '*')".into(),
            ));
        }
        Ok(())
    }

    fn load_probes(&mut self, options: LoadOptions) -> Result<()> {
        let mut names = HashSet::new();
        for file in toml_files(&self.path.join("probes.d"))? {
            let toml: TomlProbe = read_toml(&file)?;
            let disabled = toml.disabled;
            if disabled && !options.include_disabled {
                continue;
            }
            let probe = with_file(&file, build_probe(toml, &self.path))?;
            if !names.insert(probe.name.clone()) {
                return Err(Error::Config(format!(
                    "{}: duplicate probe name '{}'",
                    file.display(),
                    probe.name
                )));
            }
            if disabled {
                self.disabled.insert(format!("probe:{}", probe.name));
            }
            self.probes.push(Arc::new(probe));
        }
        Ok(())
    }

    fn load_hosts(&mut self, options: LoadOptions) -> Result<()> {
        let mut names = HashSet::new();
        for file in toml_files(&self.path.join("hosts.d"))? {
            let toml: TomlHost = read_toml(&file)?;
            let disabled = toml.disabled;
            if disabled && !options.include_disabled {
                continue;
            }
            let host = with_file(&file, build_host(toml, self.ssh_connection_time_warn))?;
            if !names.insert(host.name.clone()) {
                return Err(Error::Config(format!(
                    "{}: duplicate host name '{}'",
                    file.display(),
                    host.name
                )));
            }
            if disabled {
                self.disabled.insert(format!("host:{}", host.name));
            }
            self.hosts.push(Arc::new(host));
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&Arc<Host>> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn probe(&self, name: &str) -> Option<&Arc<Probe>> {
        self.probes.iter().find(|p| p.name == name)
    }

    pub fn is_disabled(&self, kind: &str, name: &str) -> bool {
        self.disabled.contains(&format!("{}:{}", kind, name))
    }

    /// Probes targeting a host
    pub fn probes_for(&self, host: &Host) -> Vec<Arc<Probe>> {
        self.probes
            .iter()
            .filter(|p| host.matches_probe(p))
            .cloned()
            .collect()
    }
}
