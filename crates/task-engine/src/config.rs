use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use task_engine_core::DEFAULT_GROUP;

pub const DEFAULT_MAX_RETRY: u32 = 1;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_GROUP_WEIGHT: i32 = 6;

pub const MIN_GROUP_PERCENT: i32 = 1;
pub const MAX_GROUP_PERCENT: i32 = 10;

/// Upper bound of the per-group execution pool channel buffer
pub const MAX_JOB_BUFFER: usize = 100;

/// Engine configuration as supplied by the caller.
///
/// Zero or negative values mean "use the default"; see [`EngineOptions::resolve`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Total concurrency budget split across groups (0 = number of CPUs)
    pub max_concurrent: usize,
    /// Retry bound for tasks that do not set their own (0 = default of 1)
    pub default_max_retry: u32,
    /// Group id to weight in tenths of `max_concurrent`
    pub groups: BTreeMap<u32, i32>,
    /// Most tasks taken off a ready queue per wake-up (0 = 10)
    pub batch_size: usize,
}

impl EngineOptions {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let options: EngineOptions = serde_yaml::from_str(&contents)?;
        Ok(options)
    }

    /// Fill defaults and compute per-group concurrency
    pub fn resolve(&self) -> ResolvedOptions {
        let max_concurrent = if self.max_concurrent > 0 {
            self.max_concurrent
        } else {
            available_cpus()
        };
        let default_max_retry = if self.default_max_retry > 0 {
            self.default_max_retry
        } else {
            DEFAULT_MAX_RETRY
        };
        let batch_size = if self.batch_size > 0 {
            self.batch_size
        } else {
            DEFAULT_BATCH_SIZE
        };

        let mut weights = if self.groups.is_empty() {
            default_groups()
        } else {
            self.groups.clone()
        };
        match weights.get(&DEFAULT_GROUP) {
            Some(weight) if *weight >= MIN_GROUP_PERCENT => {}
            _ => {
                weights.insert(DEFAULT_GROUP, DEFAULT_GROUP_WEIGHT);
            }
        }

        let groups = weights
            .into_iter()
            .map(|(group, percent)| (group, concurrency_for_percent(max_concurrent, percent)))
            .collect();

        ResolvedOptions {
            max_concurrent,
            default_max_retry,
            batch_size,
            groups,
        }
    }
}

/// Options after defaults and clamping have been applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedOptions {
    pub max_concurrent: usize,
    pub default_max_retry: u32,
    pub batch_size: usize,
    /// Group id to execution pool size
    pub groups: BTreeMap<u32, usize>,
}

/// Weights used when no groups are configured
pub fn default_groups() -> BTreeMap<u32, i32> {
    BTreeMap::from([(1, 6), (2, 3), (3, 1)])
}

/// Pool size for a group: the weight is clamped into [1, 10] tenths of the
/// total, rounded down, and never below one.
pub fn concurrency_for_percent(total: usize, percent: i32) -> usize {
    let percent = percent.clamp(MIN_GROUP_PERCENT, MAX_GROUP_PERCENT) as usize;
    (total * percent / MAX_GROUP_PERCENT as usize).max(1)
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let resolved = EngineOptions::default().resolve();

        assert!(resolved.max_concurrent >= 1);
        assert_eq!(resolved.default_max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(resolved.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(resolved.groups.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrency_split() {
        let options = EngineOptions {
            max_concurrent: 10,
            ..Default::default()
        };
        let resolved = options.resolve();

        assert_eq!(resolved.groups[&1], 6);
        assert_eq!(resolved.groups[&2], 3);
        assert_eq!(resolved.groups[&3], 1);
    }

    #[test]
    fn test_percent_clamp_and_floor() {
        assert_eq!(concurrency_for_percent(10, 25), 10);
        assert_eq!(concurrency_for_percent(10, 0), 1);
        assert_eq!(concurrency_for_percent(10, -4), 1);
        assert_eq!(concurrency_for_percent(4, 3), 1);
        assert_eq!(concurrency_for_percent(7, 5), 3);
        assert_eq!(concurrency_for_percent(1, 1), 1);
    }

    #[test]
    fn test_group_one_always_present() {
        let options = EngineOptions {
            max_concurrent: 10,
            groups: BTreeMap::from([(2, 5)]),
            ..Default::default()
        };
        let resolved = options.resolve();
        assert_eq!(resolved.groups[&1], 6);
        assert_eq!(resolved.groups[&2], 5);

        let options = EngineOptions {
            max_concurrent: 10,
            groups: BTreeMap::from([(1, 0)]),
            ..Default::default()
        };
        assert_eq!(options.resolve().groups[&1], 6);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = "max_concurrent: 20\ngroups:\n  1: 8\n  5: 2\n";
        let options: EngineOptions = serde_yaml::from_str(yaml).unwrap();
        let resolved = options.resolve();

        assert_eq!(resolved.max_concurrent, 20);
        assert_eq!(resolved.default_max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(resolved.groups[&1], 16);
        assert_eq!(resolved.groups[&5], 4);
    }
}
