//! Link emulation over `tc netem`: named profiles from YAML and the
//! apply/clear command wrapper.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::process::Command;

/// One emulated link condition.
#[derive(Debug, Clone, Deserialize)]
pub struct NetemProfile {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub rtt_ms: u32,
    #[serde(default)]
    pub jitter_ms: u32,
    /// Loss fraction in `0..1`.
    #[serde(default)]
    pub loss: f64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    profiles: BTreeMap<String, NetemProfile>,
}

/// Load `{profiles: {<name>: {rtt_ms, jitter_ms, loss, description}}}`.
pub fn load_profiles(path: &Path) -> Result<BTreeMap<String, NetemProfile>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read netem profiles from {}", path.display()))?;
    let file: ProfileFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse netem profiles from {}", path.display()))?;
    let mut profiles = file.profiles;
    for (name, profile) in profiles.iter_mut() {
        profile.name = name.clone();
    }
    Ok(profiles)
}

/// Build the `tc qdisc replace` argv for a profile.
pub fn apply_command(profile: &NetemProfile, interface: &str) -> Vec<String> {
    let mut cmd: Vec<String> = ["tc", "qdisc", "replace", "dev"]
        .into_iter()
        .map(String::from)
        .collect();
    cmd.push(interface.to_string());
    cmd.extend(["root", "netem"].map(String::from));
    if profile.rtt_ms > 0 {
        cmd.push("delay".into());
        cmd.push(format!("{}ms", profile.rtt_ms));
        if profile.jitter_ms > 0 {
            cmd.push(format!("{}ms", profile.jitter_ms));
            cmd.extend(["distribution", "normal"].map(String::from));
        }
    }
    if profile.loss > 0.0 {
        let loss_percent = format!("{:.4}", profile.loss * 100.0);
        let trimmed = loss_percent.trim_end_matches('0').trim_end_matches('.');
        cmd.push("loss".into());
        cmd.push(format!("{trimmed}%"));
    }
    cmd
}

/// Build the `tc qdisc del` argv that clears the interface.
pub fn clear_command(interface: &str) -> Vec<String> {
    ["tc", "qdisc", "del", "dev", interface, "root"]
        .into_iter()
        .map(String::from)
        .collect()
}

pub async fn apply(profile: &NetemProfile, interface: &str) -> Result<()> {
    let cmd = apply_command(profile, interface);
    tracing::info!(profile = %profile.name, %interface, "applying netem profile");
    run_tc(&cmd).await
}

pub async fn clear(interface: &str) -> Result<()> {
    let cmd = clear_command(interface);
    tracing::info!(%interface, "clearing netem profile");
    run_tc(&cmd).await
}

async fn run_tc(cmd: &[String]) -> Result<()> {
    let output = match Command::new(&cmd[0]).args(&cmd[1..]).output().await {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            bail!("tc binary not found on PATH")
        }
        Err(e) => return Err(e).context("run tc"),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
            bail!("root privileges are required to control netem: {}", stderr.trim());
        }
        bail!("tc exited with {}: {}", output.status, stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.yaml");
        std::fs::write(
            &path,
            "profiles:\n  \
               mid_loss:\n    \
                 description: \"mid-grade cellular\"\n    \
                 rtt_ms: 80\n    \
                 jitter_ms: 15\n    \
                 loss: 0.02\n",
        )
        .unwrap();

        let profiles = load_profiles(&path).unwrap();
        let p = &profiles["mid_loss"];
        assert_eq!(p.name, "mid_loss");
        assert_eq!(p.rtt_ms, 80);
        assert_eq!(p.jitter_ms, 15);
        assert!((p.loss - 0.02).abs() < 1e-12);
        assert_eq!(p.description, "mid-grade cellular");
    }

    #[test]
    fn apply_command_includes_delay_jitter_and_loss() {
        let profile = NetemProfile {
            name: "mid_loss".into(),
            rtt_ms: 80,
            jitter_ms: 15,
            loss: 0.02,
            description: String::new(),
        };
        let cmd = apply_command(&profile, "lo").join(" ");
        assert!(cmd.starts_with("tc qdisc replace dev lo root netem"));
        assert!(cmd.contains("delay 80ms 15ms distribution normal"));
        assert!(cmd.contains("loss 2%"));
    }

    #[test]
    fn zero_jitter_drops_the_distribution() {
        let profile = NetemProfile {
            name: "no_jitter".into(),
            rtt_ms: 50,
            jitter_ms: 0,
            loss: 0.0015,
            description: String::new(),
        };
        let cmd = apply_command(&profile, "lo").join(" ");
        assert!(cmd.contains("delay 50ms"));
        assert!(!cmd.contains("distribution"));
        assert!(cmd.contains("loss 0.15%"));
    }

    #[test]
    fn clear_command_shape() {
        assert_eq!(
            clear_command("lo"),
            vec!["tc", "qdisc", "del", "dev", "lo", "root"]
        );
    }
}
