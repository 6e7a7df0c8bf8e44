//! YAML configuration: testbed-wide base settings and per-experiment
//! run descriptions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use qprism_common::types::SchedulerVariant;

fn default_drain_timeout_s() -> u64 {
    60
}

fn default_complete_threshold() -> f64 {
    0.96
}

fn default_stall_threshold() -> f64 {
    0.98
}

fn default_netem_profiles() -> PathBuf {
    PathBuf::from("configs/netem_profiles.yaml")
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_runs() -> u32 {
    1
}

/// Testbed-wide settings, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseConfig {
    /// Directory experiment-relative paths resolve against.
    pub experiment_root: PathBuf,
    pub results_db_path: PathBuf,
    pub default_trace: PathBuf,
    pub default_tile_source: PathBuf,
    #[serde(default = "default_netem_profiles")]
    pub netem_profiles: PathBuf,
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
    /// Completeness fraction that counts as "first viewport shown".
    #[serde(default = "default_complete_threshold")]
    pub viewport_complete_threshold: f64,
    /// Completeness fraction below which the viewport counts as stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: f64,
    /// Bound on waiting for in-flight fetches after the trace ends.
    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: u64,
}

impl BaseConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read base config {}", path.display()))?;
        let mut config: BaseConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse base config {}", path.display()))?;
        // relative companion paths follow the config file, not the cwd
        if let Some(dir) = path.parent() {
            config.netem_profiles = resolve(dir, &config.netem_profiles);
            config.certs_dir = resolve(dir, &config.certs_dir);
        }
        Ok(config)
    }

    /// The MBTiles file a run should serve, honouring a CLI override.
    pub fn tile_source(&self, override_path: Option<&Path>) -> PathBuf {
        match override_path {
            Some(path) => path.to_path_buf(),
            None => resolve(&self.experiment_root, &self.default_tile_source),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.certs_dir.join("cert.pem")
    }

    pub fn key_path(&self) -> PathBuf {
        self.certs_dir.join("key.pem")
    }
}

/// One experiment: a scheduler variant against a link profile and trace.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub scheduler_variant: SchedulerVariant,
    pub netem_profile: String,
    /// Defaults to the base config's `default_trace` when omitted.
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default)]
    pub seed_base: u64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read experiment config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parse experiment config {}", path.display()))
    }

    /// The trace this experiment walks, resolved against the base config.
    pub fn trace_path(&self, base: &BaseConfig) -> PathBuf {
        let path = self.trace_path.as_ref().unwrap_or(&base.default_trace);
        resolve(&base.experiment_root, path)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_config_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.yaml");
        std::fs::write(
            &path,
            "experiment_root: /tmp/qprism\n\
             results_db_path: results/results.sqlite\n\
             default_trace: traces/dc_trace.json\n\
             default_tile_source: tiles/usa.mbtiles\n",
        )
        .unwrap();

        let base = BaseConfig::load(&path).unwrap();
        assert_eq!(base.drain_timeout_s, 60);
        assert!((base.viewport_complete_threshold - 0.96).abs() < 1e-12);
        assert_eq!(base.netem_profiles, dir.path().join("configs/netem_profiles.yaml"));
        assert_eq!(base.cert_path(), dir.path().join("certs/cert.pem"));
    }

    #[test]
    fn base_config_requires_core_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.yaml");
        std::fs::write(&path, "results_db_path: results.sqlite\n").unwrap();
        assert!(BaseConfig::load(&path).is_err());
    }

    #[test]
    fn experiment_config_parses_variant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.yaml");
        std::fs::write(
            &path,
            "name: qprism_full_mid_loss\n\
             scheduler_variant: qprism_full\n\
             netem_profile: mid_loss\n\
             trace_path: traces/lu_trace.json\n\
             runs: 3\n\
             seed_base: 42\n",
        )
        .unwrap();

        let exp = ExperimentConfig::load(&path).unwrap();
        assert_eq!(exp.scheduler_variant, SchedulerVariant::QprismFull);
        assert_eq!(exp.runs, 3);
        assert_eq!(exp.seed_base, 42);
        assert!(exp.notes.is_none());
    }

    #[test]
    fn missing_variant_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.yaml");
        std::fs::write(&path, "name: broken\nnetem_profile: low_loss\n").unwrap();
        assert!(ExperimentConfig::load(&path).is_err());
    }

    #[test]
    fn trace_path_falls_back_to_default() {
        let base = BaseConfig {
            experiment_root: "/data".into(),
            results_db_path: "results.sqlite".into(),
            default_trace: "traces/default.json".into(),
            default_tile_source: "tiles.mbtiles".into(),
            netem_profiles: default_netem_profiles(),
            certs_dir: default_certs_dir(),
            viewport_complete_threshold: 0.96,
            stall_threshold: 0.98,
            drain_timeout_s: 60,
        };
        let mut exp = ExperimentConfig {
            name: "x".into(),
            scheduler_variant: SchedulerVariant::Http3Default,
            netem_profile: "low_loss".into(),
            trace_path: None,
            runs: 1,
            seed_base: 0,
            notes: None,
        };
        assert_eq!(
            exp.trace_path(&base),
            PathBuf::from("/data/traces/default.json")
        );
        exp.trace_path = Some("/abs/trace.json".into());
        assert_eq!(exp.trace_path(&base), PathBuf::from("/abs/trace.json"));
    }
}
