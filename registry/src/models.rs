//! Failure records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// What a failure record is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum FailSubject {
    /// The whole run of a host failed
    Run { host: String },
    /// One script failed
    Task { host: String, probe: String },
    /// One check is failing
    Check {
        host: String,
        probe: String,
        index: usize,
    },
}

impl FailSubject {
    pub fn host(&self) -> &str {
        match self {
            Self::Run { host } | Self::Task { host, .. } | Self::Check { host, .. } => host,
        }
    }

    pub fn probe(&self) -> Option<&str> {
        match self {
            Self::Run { .. } => None,
            Self::Task { probe, .. } | Self::Check { probe, .. } => Some(probe),
        }
    }

    /// SHA-256 of the identifying fields, NUL separated
    pub fn fingerprint(&self) -> String {
        let material = match self {
            Self::Run { host } => host.clone(),
            Self::Task { host, probe } => format!("{}\0{}", host, probe),
            Self::Check { host, probe, index } => format!("{}\0{}\0{}", host, probe, index),
        };
        hex::encode(Sha256::digest(material.as_bytes()))
    }
}

impl fmt::Display for FailSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run { host } => write!(f, "run on {}", host),
            Self::Task { host, probe } => write!(f, "task {} on {}", probe, host),
            Self::Check { host, probe, index } => {
                write!(f, "check {}#{} on {}", probe, index, host)
            }
        }
    }
}

/// Persistent state of one ongoing failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentFail {
    pub subject: FailSubject,
    pub fail_count: u32,
    pub ok_count: u32,
    pub fail_start: DateTime<Utc>,
    pub unique_id: String,
}

impl CurrentFail {
    /// Create a record for a first failure
    pub fn new(subject: FailSubject, now: DateTime<Utc>) -> Self {
        Self {
            subject,
            fail_count: 1,
            ok_count: 0,
            fail_start: now,
            unique_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}
