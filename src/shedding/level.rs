use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, ErrorContext};

/// Discrete shedding severity. Ordered from `None` to `Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SheddingLevel {
    #[default]
    None,
    Light,
    Moderate,
    Heavy,
    Critical,
}

impl SheddingLevel {
    pub const ALL: [SheddingLevel; 5] = [
        SheddingLevel::None,
        SheddingLevel::Light,
        SheddingLevel::Moderate,
        SheddingLevel::Heavy,
        SheddingLevel::Critical,
    ];

    pub fn as_index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    /// Number of steps between two levels.
    pub fn distance(self, other: SheddingLevel) -> usize {
        self.as_index().abs_diff(other.as_index())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SheddingLevel::None => "none",
            SheddingLevel::Light => "light",
            SheddingLevel::Moderate => "moderate",
            SheddingLevel::Heavy => "heavy",
            SheddingLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for SheddingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SheddingLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                Error::validation_with_context(
                    "unknown shedding level",
                    ErrorContext::new()
                        .with_details(format!(
                            "got {:?}, expected none|light|moderate|heavy|critical",
                            s
                        ))
                        .with_source("shedding_level"),
                )
            })
    }
}

/// Which signal(s) drive level selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheddingStrategy {
    Cpu,
    Memory,
    /// In-flight request count relative to `max_concurrency`.
    Concurrency,
    RequestRate,
    ResponseTime,
    /// Weighted blend: CPU 0.4, memory 0.3, concurrency 0.2, response time 0.1.
    #[default]
    Combined,
}

impl SheddingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SheddingStrategy::Cpu => "cpu",
            SheddingStrategy::Memory => "memory",
            SheddingStrategy::Concurrency => "concurrency",
            SheddingStrategy::RequestRate => "request_rate",
            SheddingStrategy::ResponseTime => "response_time",
            SheddingStrategy::Combined => "combined",
        }
    }
}

impl fmt::Display for SheddingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
