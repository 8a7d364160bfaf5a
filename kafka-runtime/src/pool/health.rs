use serde::{Deserialize, Serialize};

/// Aggregated health verdict for a pool (producer or consumer side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolIssue {
    pub key_description: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealth {
    pub level: PoolLevel,
    pub issues: Vec<PoolIssue>,
}

impl PoolHealth {
    pub fn healthy() -> Self {
        Self {
            level: PoolLevel::Healthy,
            issues: Vec::new(),
        }
    }

    /// Combine this pool's verdict with another's (e.g. producer + consumer
    /// for the façade's overall report); the worse of the two levels wins.
    pub fn merge(mut self, other: PoolHealth) -> Self {
        if other.level > self.level {
            self.level = other.level;
        }
        self.issues.extend(other.issues);
        self
    }

    pub fn add_issue(&mut self, level: PoolLevel, key_description: impl Into<String>, detail: impl Into<String>) {
        if level > self.level {
            self.level = level;
        }
        self.issues.push(PoolIssue {
            key_description: key_description.into(),
            detail: detail.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_worse_level() {
        let mut warning = PoolHealth::healthy();
        warning.add_issue(PoolLevel::Warning, "k1", "overloaded");
        let healthy = PoolHealth::healthy();

        let merged = healthy.merge(warning);
        assert_eq!(merged.level, PoolLevel::Warning);
        assert_eq!(merged.issues.len(), 1);
    }

    #[test]
    fn critical_outranks_warning() {
        assert!(PoolLevel::Critical > PoolLevel::Warning);
        assert!(PoolLevel::Warning > PoolLevel::Healthy);
    }
}
