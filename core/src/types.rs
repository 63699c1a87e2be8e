//! Shared types
//!
//! Hosts, probes, checks and alerts arrive here already validated; the only
//! mutable piece is [`Task`], which belongs to the scheduler worker of its host.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::expr::Expression;
use crate::{Error, Result};

/// Class used for run/task level messages and as the last-resort alert route
pub const GENERAL_CLASS: &str = "general";

/// Scalar value used for defaults and expression environments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
            Self::Boolean(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

/// How a host is reached
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    /// Scripts run in a local shell
    Local,
    /// Scripts run through the system `ssh` client
    Ssh(SshTarget),
}

/// SSH connection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
    /// Extra `-o` options handed to the ssh client
    pub options: Vec<String>,
}

impl Transport {
    /// Get display string for the transport
    pub fn display(&self) -> String {
        match self {
            Self::Local => "local".to_string(),
            Self::Ssh(target) => format!("{}@{}:{}", target.user, target.host, target.port),
        }
    }
}

/// Monitored host
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub classes: Vec<String>,
    /// Host level defaults, overriding probe defaults of the same name
    pub defaults: HashMap<String, Scalar>,
    pub transport: Transport,
    /// Dial durations above this are reported as run errors
    pub connection_time_warn: Duration,
}

impl Host {
    /// Does this host carry the class? `*` matches anything.
    pub fn has_class(&self, class: &str) -> bool {
        has_class(&self.classes, class)
    }

    /// Is this host targeted by the probe?
    pub fn matches_probe(&self, probe: &Probe) -> bool {
        matches_targets(&self.classes, &probe.targets)
    }
}

/// Class membership test shared by hosts and alert messages
pub fn has_class(classes: &[String], class: &str) -> bool {
    class == "*" || classes.iter().any(|c| c == class)
}

/// Match a class set against target groups
///
/// Each target is a group of `&`-separated class tokens that must all be
/// present; groups are alternatives.
pub fn matches_targets(classes: &[String], targets: &[String]) -> bool {
    targets.iter().any(|group| {
        group
            .split('&')
            .map(str::trim)
            .all(|token| has_class(classes, token))
    })
}

/// A boolean health condition of a probe
#[derive(Debug, Clone)]
pub struct Check {
    /// Position inside the probe, part of the alert fingerprint
    pub index: usize,
    pub desc: String,
    /// Evaluates to `true` when the condition is failing
    pub condition: Arc<dyn Expression>,
    pub classes: Vec<String>,
    pub needed_failures: u32,
    pub needed_successes: u32,
}

/// A script plus the checks evaluated against its output
#[derive(Debug, Clone)]
pub struct Probe {
    pub name: String,
    pub script: PathBuf,
    /// Script body, read once at load time
    pub script_body: String,
    pub targets: Vec<String>,
    /// Whole minutes between two runs
    pub delay: Duration,
    pub timeout: Duration,
    /// Argument template, `$name` tokens are expanded from defaults
    pub arguments: String,
    pub defaults: HashMap<String, Scalar>,
    pub checks: Vec<Check>,
    /// Optional predicate pausing the probe while false
    pub run_if: Option<Arc<dyn Expression>>,
}

impl Probe {
    /// File name of the script, used to tag stderr lines
    pub fn script_name(&self) -> String {
        self.script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Look a check up by its stable index
    pub fn check(&self, index: usize) -> Option<&Check> {
        self.checks.iter().find(|c| c.index == index)
    }
}

/// Probe bound to a host, with its own clock
#[derive(Debug, Clone)]
pub struct Task {
    pub probe: Arc<Probe>,
    pub next_run: DateTime<Utc>,
    pub prev_run: DateTime<Utc>,
    /// Set when a failure asks for the task to run again at the next tick
    pub retry: bool,
}

impl Task {
    /// Create a task due immediately
    pub fn new(probe: Arc<Probe>, now: DateTime<Utc>) -> Self {
        Self {
            probe,
            next_run: now,
            prev_run: now,
            retry: false,
        }
    }

    /// Should this task run at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry || self.next_run <= now
    }

    /// Schedule the next run; `next_run` never moves backwards
    pub fn reschedule(&mut self, at: DateTime<Utc>) {
        self.prev_run = self.next_run;
        if at > self.next_run {
            self.next_run = at;
        }
        self.retry = false;
    }

    /// Ask for a run at the next tick without touching `next_run`
    pub fn force_retry(&mut self) {
        self.retry = true;
    }
}

/// Inclusive time-of-day window, in minutes since midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn contains(&self, minutes: u32) -> bool {
        minutes >= self.start && minutes <= self.end
    }
}

fn parse_clock(input: &str) -> Result<u32> {
    let (h, m) = input
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("invalid format '{}' (ex: '19:30')", input)))?;
    let hours: u32 = h
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("can't convert '{}' hour to integer: {}", input, e)))?;
    let minutes: u32 = m
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("can't convert '{}' minute to integer: {}", input, e)))?;
    if hours > 23 {
        return Err(Error::Config(format!("hour can't be more than 23: {}", input)));
    }
    if minutes > 59 {
        return Err(Error::Config(format!("minute can't be more than 59: {}", input)));
    }
    Ok(hours * 60 + minutes)
}

impl FromStr for HourRange {
    type Err = Error;

    /// Parse `"08:30 - 19:00"`
    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| Error::Config(format!("invalid format '{}' (ex: '8:30 - 19:00')", s)))?;
        let range = Self {
            start: parse_clock(start.trim())?,
            end: parse_clock(end.trim())?,
        };
        if range.start >= range.end {
            return Err(Error::Config(format!(
                "end of the hour range ({}) is before its start",
                s
            )));
        }
        Ok(range)
    }
}

/// External command rung for matching alert messages
#[derive(Debug, Clone)]
pub struct Alert {
    pub name: String,
    /// Class groups, see [`matches_targets`]
    pub targets: Vec<String>,
    pub command: PathBuf,
    pub arguments: Vec<String>,
    pub hours: Vec<HourRange>,
    /// Days of week, Sunday = 0
    pub days: Vec<u32>,
}

impl Alert {
    /// Can this alert ring at the given local time?
    pub fn ringable_at(&self, now: NaiveDateTime) -> bool {
        let minutes = now.hour() * 60 + now.minute();
        let weekday = now.weekday().num_days_from_sunday();

        let hour_ok = self.hours.is_empty() || self.hours.iter().any(|r| r.contains(minutes));
        let day_ok = self.days.is_empty() || self.days.contains(&weekday);
        hour_ok && day_ok
    }

    /// Does this alert receive messages routed to the general class?
    pub fn receives_general(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.trim() == GENERAL_CLASS || t.trim() == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn classes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn alert(hours: Vec<HourRange>, days: Vec<u32>) -> Alert {
        Alert {
            name: "mail".to_string(),
            targets: classes(&["general"]),
            command: PathBuf::from("/bin/true"),
            arguments: vec![],
            hours,
            days,
        }
    }

    #[test]
    fn test_target_groups() {
        let targets = classes(&["A & B"]);
        assert!(matches_targets(&classes(&["A", "B"]), &targets));
        assert!(!matches_targets(&classes(&["A"]), &targets));
        assert!(!matches_targets(&classes(&["C"]), &targets));
        assert!(matches_targets(&classes(&["C"]), &classes(&["A & B", "C"])));
        assert!(matches_targets(&classes(&["anything"]), &classes(&["*"])));
    }

    #[test]
    fn test_hour_range_parse() {
        let range: HourRange = "08:30 - 19:00".parse().unwrap();
        assert_eq!(range, HourRange { start: 510, end: 1140 });
        assert!("19:00 - 08:00".parse::<HourRange>().is_err());
        assert!("24:00 - 25:00".parse::<HourRange>().is_err());
        assert!("0830".parse::<HourRange>().is_err());
    }

    #[test]
    fn test_ringable() {
        // 2024-01-01 is a Monday
        let monday_noon = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let office = "08:00 - 18:00".parse().unwrap();

        assert!(alert(vec![], vec![]).ringable_at(monday_noon));
        assert!(alert(vec![office], vec![1, 2, 3, 4, 5]).ringable_at(monday_noon));
        assert!(!alert(vec![office], vec![0, 6]).ringable_at(monday_noon));

        let monday_night = monday_noon.date().and_hms_opt(22, 15, 0).unwrap();
        assert!(!alert(vec![office], vec![]).ringable_at(monday_night));
    }

    #[test]
    fn test_task_next_run_is_monotonic() {
        let probe = Arc::new(Probe {
            name: "load".to_string(),
            script: PathBuf::from("load.sh"),
            script_body: String::new(),
            targets: classes(&["*"]),
            delay: Duration::from_secs(300),
            timeout: Duration::from_secs(20),
            arguments: String::new(),
            defaults: HashMap::new(),
            checks: vec![],
            run_if: None,
        });
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut task = Task::new(probe, t0);

        let mut previous = task.next_run;
        let steps = [
            t0 + chrono::Duration::minutes(5),
            t0 + chrono::Duration::minutes(1),
            t0 + chrono::Duration::minutes(11),
            t0,
        ];
        for at in steps {
            task.reschedule(at);
            assert!(task.next_run >= previous);
            previous = task.next_run;
        }

        task.force_retry();
        assert!(task.is_due(t0));
        assert_eq!(task.next_run, previous);
        task.reschedule(t0 + chrono::Duration::minutes(12));
        assert!(!task.retry);
        assert!(!task.is_due(t0 + chrono::Duration::minutes(1)));
    }
}
