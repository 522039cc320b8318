use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Urgency tier a submitter attaches to a job.
///
/// Interactive requests (a student waiting on an explanation) go in above
/// batch regrades; within a tier jobs are claimed in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Sort key for stores that pop the lowest score first
    pub fn claim_rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobPriority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(QueueError::Validation(format!(
                "unknown priority '{}', expected low, normal, high or critical",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_rank_orders_critical_first() {
        let mut tiers = [JobPriority::Low, JobPriority::Critical, JobPriority::Normal, JobPriority::High];
        tiers.sort_by_key(|p| p.claim_rank());
        assert_eq!(tiers, [JobPriority::Critical, JobPriority::High, JobPriority::Normal, JobPriority::Low]);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("HIGH".parse::<JobPriority>().unwrap(), JobPriority::High);
        assert!(matches!("urgent".parse::<JobPriority>(), Err(QueueError::Validation(_))));
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_value(JobPriority::Critical).unwrap(), "critical");
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }
}
