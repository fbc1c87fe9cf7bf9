use std::collections::BTreeMap;

use crate::config::{PartitionOverride, PartitionSpec, Profile};
use crate::error::{BenchError, Result};
use crate::matrix::Combination;

/// Logical cores visible to this process, falling back to 1.
pub fn host_parallelism() -> u32 {
    std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
        .unwrap_or(1)
}

/// Maps a combination to the `--partitions` value passed to the query program.
///
/// Every (mode, scale) pair gets `default_partitions` unless it has an entry
/// in the override table, in which case the value is looked up by query index.
#[derive(Debug, Clone)]
pub struct ParameterResolver {
    default_partitions: u32,
    overrides: BTreeMap<(String, u32), Vec<PartitionSpec>>,
}

impl ParameterResolver {
    pub fn new(default_partitions: u32, overrides: &[PartitionOverride]) -> Result<Self> {
        if default_partitions == 0 {
            return Err(BenchError::config(
                "default_partitions",
                "default parameter must be > 0",
            ));
        }
        let mut table = BTreeMap::new();
        for entry in overrides {
            let key = format!("overrides[mode={}, scale={}]", entry.mode, entry.scale);
            if entry
                .partitions
                .iter()
                .any(|p| *p == PartitionSpec::Fixed(0))
            {
                return Err(BenchError::config(key, "partition count must be > 0"));
            }
            if table
                .insert((entry.mode.clone(), entry.scale), entry.partitions.clone())
                .is_some()
            {
                return Err(BenchError::config(key, "duplicate override entry"));
            }
        }
        Ok(Self {
            default_partitions,
            overrides: table,
        })
    }

    /// Resolver for `profile`, defaulting to host parallelism when the profile
    /// does not pin `default_partitions`.
    pub fn for_profile(profile: &Profile, host_parallelism: u32) -> Result<Self> {
        Self::new(
            profile.default_partitions.unwrap_or(host_parallelism),
            &profile.overrides,
        )
    }

    pub fn default_partitions(&self) -> u32 {
        self.default_partitions
    }

    pub fn resolve(&self, combo: &Combination) -> Result<u32> {
        let Some(list) = self.overrides.get(&(combo.mode.clone(), combo.scale)) else {
            return Ok(self.default_partitions);
        };
        match list.get(combo.query_index) {
            Some(PartitionSpec::Fixed(n)) => Ok(*n),
            Some(PartitionSpec::Auto(_)) => Ok(self.default_partitions),
            None => Err(BenchError::MissingOverride {
                mode: combo.mode.clone(),
                scale: combo.scale,
                query: combo.query.clone(),
                index: combo.query_index,
                len: list.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: u32 = 48;

    fn combo(mode: &str, scale: u32, query: &str, query_index: usize) -> Combination {
        Combination {
            mode: mode.to_string(),
            scale,
            query: query.to_string(),
            query_index,
        }
    }

    fn gpu_sf10_override() -> Vec<PartitionOverride> {
        vec![PartitionOverride {
            mode: "gpu".to_string(),
            scale: 10,
            partitions: vec![
                PartitionSpec::Fixed(2),
                PartitionSpec::auto(),
                PartitionSpec::auto(),
                PartitionSpec::Fixed(2),
            ],
        }]
    }

    #[test]
    fn specialized_pair_follows_override_table() {
        let resolver = ParameterResolver::new(N, &gpu_sf10_override()).expect("resolver");
        let queries = ["q2", "q4", "q8", "q10"];
        let sf10: Vec<u32> = queries
            .iter()
            .enumerate()
            .map(|(i, q)| resolver.resolve(&combo("gpu", 10, q, i)).expect("sf10"))
            .collect();
        assert_eq!(sf10, vec![2, N, N, 2]);
        let sf1: Vec<u32> = queries
            .iter()
            .enumerate()
            .map(|(i, q)| resolver.resolve(&combo("gpu", 1, q, i)).expect("sf1"))
            .collect();
        assert_eq!(sf1, vec![N, N, N, N]);
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = ParameterResolver::new(N, &gpu_sf10_override()).expect("resolver");
        let c = combo("gpu", 10, "q10", 3);
        let first = resolver.resolve(&c).expect("first");
        for _ in 0..10 {
            assert_eq!(resolver.resolve(&c).expect("again"), first);
        }
    }

    #[test]
    fn short_override_list_is_rejected() {
        let resolver = ParameterResolver::new(N, &gpu_sf10_override()).expect("resolver");
        let err = resolver
            .resolve(&combo("gpu", 10, "q11", 4))
            .expect_err("index past end");
        match err {
            BenchError::MissingOverride {
                query, index, len, ..
            } => {
                assert_eq!(query, "q11");
                assert_eq!(index, 4);
                assert_eq!(len, 4);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn rejects_zero_and_duplicates() {
        assert!(ParameterResolver::new(0, &[]).is_err());
        let zero = vec![PartitionOverride {
            mode: "gpu".to_string(),
            scale: 1,
            partitions: vec![PartitionSpec::Fixed(0)],
        }];
        assert!(ParameterResolver::new(N, &zero).is_err());
        let mut dup = gpu_sf10_override();
        dup.extend(gpu_sf10_override());
        let err = ParameterResolver::new(N, &dup).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate override"), "{}", err);
    }

    #[test]
    fn profile_default_pins_parameter() {
        let profile = Profile {
            name: "p".to_string(),
            default_partitions: Some(8),
            ..Profile::default()
        };
        let resolver = ParameterResolver::for_profile(&profile, N).expect("resolver");
        assert_eq!(resolver.default_partitions(), 8);
        assert!(host_parallelism() >= 1);
    }
}
