use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Environment variable that takes precedence over `dataset_root` in the file.
pub const DATA_ROOT_ENV: &str = "SPATIALBENCH_DATA_ROOT";
pub const DEFAULT_CONFIG_FILE: &str = "bench.yaml";
pub const DEFAULT_MARKER: &str = "execution time";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    dataset_root: Option<PathBuf>,
    #[serde(default = "default_log_root")]
    log_root: PathBuf,
    program: Vec<String>,
    #[serde(default = "default_dataset_dir")]
    dataset_dir: String,
    #[serde(default = "default_marker")]
    marker: String,
    #[serde(default)]
    profiles: Vec<Profile>,
}

fn default_log_root() -> PathBuf {
    PathBuf::from("logs")
}

fn default_dataset_dir() -> String {
    "sf{scale}".to_string()
}

fn default_marker() -> String {
    DEFAULT_MARKER.to_string()
}

/// Harness configuration, resolved once at startup and passed by reference
/// into planning and the run loop.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Directory holding the config file. Relative paths resolve against it
    /// and the query program runs with it as working directory.
    pub config_dir: PathBuf,
    pub dataset_root: PathBuf,
    pub log_root: PathBuf,
    pub program: Vec<String>,
    pub dataset_dir: String,
    pub marker: String,
    pub profiles: Vec<Profile>,
}

/// One named harness: the matrix it declares plus how its runs are invoked.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub scales: Vec<u32>,
    /// Query list used by every mode without an entry in `mode_queries`.
    #[serde(default)]
    pub queries: Option<Vec<String>>,
    #[serde(default)]
    pub mode_queries: BTreeMap<String, Vec<String>>,
    /// Passed as `--repeat`; omitted from the command line when unset.
    #[serde(default)]
    pub repeat: Option<u32>,
    /// Pins the default parameter instead of using host parallelism.
    #[serde(default)]
    pub default_partitions: Option<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub overrides: Vec<PartitionOverride>,
}

/// Per-query-index partition counts for one specialized (mode, scale) pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionOverride {
    pub mode: String,
    pub scale: u32,
    pub partitions: Vec<PartitionSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PartitionSpec {
    Fixed(u32),
    Auto(AutoKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoKeyword {
    Auto,
}

impl PartitionSpec {
    pub fn auto() -> Self {
        PartitionSpec::Auto(AutoKeyword::Auto)
    }
}

impl Profile {
    /// Ordered query list for `mode`. The position of a query in this list is
    /// the index the override table is keyed by.
    pub fn queries_for(&self, mode: &str) -> Result<&[String]> {
        if let Some(list) = self.mode_queries.get(mode) {
            return Ok(list);
        }
        self.queries.as_deref().ok_or_else(|| {
            BenchError::config(
                format!("profiles.{}.mode_queries.{}", self.name, mode),
                "no query list declared for mode (set `queries` or a `mode_queries` entry)",
            )
        })
    }
}

impl BenchConfig {
    /// Loads `path`, letting `SPATIALBENCH_DATA_ROOT` override the dataset root.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_data_root(path, std::env::var_os(DATA_ROOT_ENV))
    }

    pub fn load_with_data_root(path: &Path, env_data_root: Option<OsString>) -> Result<Self> {
        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .canonicalize()
            .map_err(|e| BenchError::io(path, e))?;
        let raw = fs::read_to_string(path).map_err(|e| BenchError::io(path, e))?;
        let parsed: RawConfig =
            serde_yaml::from_str(&raw).map_err(|source| BenchError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(parsed, config_dir, env_data_root.map(PathBuf::from))
    }

    pub fn from_yaml_str(
        raw: &str,
        config_dir: &Path,
        env_data_root: Option<PathBuf>,
    ) -> Result<Self> {
        let parsed: RawConfig =
            serde_yaml::from_str(raw).map_err(|source| BenchError::ConfigParse {
                path: config_dir.join(DEFAULT_CONFIG_FILE),
                source,
            })?;
        Self::from_raw(parsed, config_dir.to_path_buf(), env_data_root)
    }

    fn from_raw(
        raw: RawConfig,
        config_dir: PathBuf,
        env_data_root: Option<PathBuf>,
    ) -> Result<Self> {
        let dataset_root = env_data_root
            .filter(|p| !p.as_os_str().is_empty())
            .or(raw.dataset_root)
            .ok_or_else(|| {
                BenchError::config(
                    "dataset_root",
                    format!("dataset root missing (set `dataset_root` or {})", DATA_ROOT_ENV),
                )
            })?;
        let config = BenchConfig {
            dataset_root: absolutize(&config_dir, &dataset_root),
            log_root: absolutize(&config_dir, &raw.log_root),
            config_dir,
            program: raw.program,
            dataset_dir: raw.dataset_dir,
            marker: raw.marker,
            profiles: raw.profiles,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that do not need the enumerated matrix. Override lengths are
    /// checked against the query lists when the plan is built.
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() || self.program[0].trim().is_empty() {
            return Err(BenchError::config("program", "program must not be empty"));
        }
        if self.marker.is_empty() {
            return Err(BenchError::config("marker", "success marker must not be empty"));
        }
        let mut names = BTreeSet::new();
        for profile in &self.profiles {
            let key = format!("profiles.{}", profile.name);
            if profile.name.trim().is_empty() {
                return Err(BenchError::config("profiles", "profile name must not be empty"));
            }
            if !names.insert(profile.name.as_str()) {
                return Err(BenchError::config(key, "duplicate profile name"));
            }
            if profile.repeat == Some(0) {
                return Err(BenchError::config(format!("{}.repeat", key), "must be > 0"));
            }
            if profile.default_partitions == Some(0) {
                return Err(BenchError::config(
                    format!("{}.default_partitions", key),
                    "must be > 0",
                ));
            }
            for mode in &profile.modes {
                if mode.is_empty() || mode.contains(['/', '\\']) || mode == ".." {
                    return Err(BenchError::config(
                        format!("{}.modes", key),
                        format!("invalid mode name '{}'", mode),
                    ));
                }
                if let Ok(queries) = profile.queries_for(mode) {
                    for query in queries {
                        if query.is_empty() || query.contains(['/', '\\']) || query == ".." {
                            return Err(BenchError::config(
                                format!("{}.queries", key),
                                format!("invalid query name '{}'", query),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Dataset directory handed to the query program for `scale`.
    pub fn dataset_path(&self, scale: u32) -> PathBuf {
        self.dataset_root
            .join(self.dataset_dir.replace("{scale}", &scale.to_string()))
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
dataset_root: /data/spatialbench
program: [python3, "queries/{query}.py"]
profiles:
  - name: cpu
    modes: [cpu]
    scales: [1, 10]
    queries: [q2, q4, q8, q9, q10, q11]
  - name: gpu
    repeat: 5
    modes: [gpu]
    scales: [1, 10]
    queries: [q2, q4, q8, q10]
    overrides:
      - { mode: gpu, scale: 10, partitions: [2, auto, auto, 2] }
"#;

    #[test]
    fn parses_profiles_and_defaults() {
        let cfg = BenchConfig::from_yaml_str(SAMPLE, Path::new("/bench"), None).expect("config");
        assert_eq!(cfg.log_root, PathBuf::from("/bench/logs"));
        assert_eq!(cfg.marker, "execution time");
        assert_eq!(cfg.dataset_path(10), PathBuf::from("/data/spatialbench/sf10"));
        let gpu = cfg.profile("gpu").expect("gpu profile");
        assert_eq!(gpu.repeat, Some(5));
        assert_eq!(cfg.profile("cpu").expect("cpu").repeat, None);
        assert_eq!(
            gpu.overrides[0].partitions,
            vec![
                PartitionSpec::Fixed(2),
                PartitionSpec::auto(),
                PartitionSpec::auto(),
                PartitionSpec::Fixed(2)
            ]
        );
    }

    #[test]
    fn env_data_root_wins_over_file() {
        let cfg = BenchConfig::from_yaml_str(
            SAMPLE,
            Path::new("/bench"),
            Some(PathBuf::from("/mnt/sb")),
        )
        .expect("config");
        assert_eq!(cfg.dataset_root, PathBuf::from("/mnt/sb"));
    }

    #[test]
    fn missing_data_root_is_config_error() {
        let raw = "program: [run]\nprofiles: []\n";
        let err = BenchConfig::from_yaml_str(raw, Path::new("/bench"), None).expect_err("fails");
        assert!(err.is_config());
        assert!(err.to_string().contains("dataset_root"), "{}", err);
    }

    #[test]
    fn mode_queries_take_precedence() {
        let raw = r#"
dataset_root: /d
program: [run]
profiles:
  - name: p
    modes: [cpu, gpu]
    scales: [1]
    queries: [q2, q4]
    mode_queries: { gpu: [q10] }
"#;
        let cfg = BenchConfig::from_yaml_str(raw, Path::new("/b"), None).expect("config");
        let p = cfg.profile("p").expect("profile");
        assert_eq!(p.queries_for("cpu").expect("cpu"), ["q2", "q4"]);
        assert_eq!(p.queries_for("gpu").expect("gpu"), ["q10"]);
    }

    #[test]
    fn rejects_bad_values() {
        let dup = r#"
dataset_root: /d
program: [run]
profiles:
  - { name: a }
  - { name: a }
"#;
        let err = BenchConfig::from_yaml_str(dup, Path::new("/b"), None).expect_err("dup");
        assert!(err.to_string().contains("duplicate profile name"), "{}", err);

        let zero = "dataset_root: /d\nprogram: [run]\nprofiles:\n  - { name: a, repeat: 0 }\n";
        let err = BenchConfig::from_yaml_str(zero, Path::new("/b"), None).expect_err("zero");
        assert!(err.to_string().contains("profiles.a.repeat"), "{}", err);

        let empty = "dataset_root: /d\nprogram: []\n";
        assert!(BenchConfig::from_yaml_str(empty, Path::new("/b"), None).is_err());

        let slash = "dataset_root: /d\nprogram: [run]\nprofiles:\n  - { name: a, modes: [x/y] }\n";
        assert!(BenchConfig::from_yaml_str(slash, Path::new("/b"), None).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = "dataset_root: /d\nprogram: [run]\nlogroot: x\n";
        let err = BenchConfig::from_yaml_str(raw, Path::new("/b"), None).expect_err("typo");
        assert!(matches!(err, BenchError::ConfigParse { .. }));
    }
}
