//! Runtime settings for backup-vm.
//!
//! Settings live in `~/.config/backup-vm/config.toml` (or
//! `$XDG_CONFIG_HOME/backup-vm/config.toml`). Every field has a default, so a
//! missing file or a partial one is fine; a file that fails to parse is not.
//! A handful of tool paths can be overridden from the environment, which is
//! how the integration tests point the binary at fake tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BackupError;
use crate::retry::RetryPolicy;

const APP_NAME: &str = "backup-vm";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub hypervisor: HypervisorSettings,
    pub commit: CommitSettings,
    pub archiver: ArchiverSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HypervisorSettings {
    /// `virsh` executable used to talk to libvirt.
    pub virsh: String,
    /// Connection URI passed as `virsh -c`. `None` leaves the choice to virsh
    /// (which honours `LIBVIRT_DEFAULT_URI`).
    pub uri: Option<String>,
    /// Where overlays for block-device-backed disks are written; the device's
    /// own directory (`/dev/...`) is not writable.
    pub block_device_snapshot_dir: PathBuf,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            virsh: "virsh".to_string(),
            uri: None,
            block_device_snapshot_dir: PathBuf::from("/var/lib/libvirt/images"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommitSettings {
    pub attempts: u32,
    pub backoff_secs: u64,
    pub poll_interval_ms: u64,
    /// Offline image-commit utility, invoked as `<tool> commit <overlay>`.
    pub image_tool: String,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_secs: 5,
            poll_interval_ms: 1000,
            image_tool: "qemu-img".to_string(),
        }
    }
}

impl CommitSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            backoff: Duration::from_secs(self.backoff_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiverSettings {
    pub program: String,
    /// Upper bound on one wait for archiver output; progress is redrawn at
    /// least this often.
    pub poll_timeout_ms: u64,
    /// Environment variable the archiver reads its passphrase from.
    pub passphrase_env: String,
}

impl Default for ArchiverSettings {
    fn default() -> Self {
        Self {
            program: "borg".to_string(),
            poll_timeout_ms: 1000,
            passphrase_env: "BORG_PASSPHRASE".to_string(),
        }
    }
}

impl ArchiverSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Load settings from `path` (or the default location) and apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, BackupError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
        let mut settings = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text)
                .map_err(|e| BackupError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => return Err(BackupError::Config(format!("{}: {e}", path.display()))),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply tool overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(virsh) = lookup("BACKUP_VM_VIRSH") {
            self.hypervisor.virsh = virsh;
        }
        if let Some(tool) = lookup("BACKUP_VM_QEMU_IMG") {
            self.commit.image_tool = tool;
        }
        if let Some(borg) = lookup("BACKUP_VM_BORG") {
            self.archiver.program = borg;
        }
    }
}

/// `$XDG_CONFIG_HOME/backup-vm/config.toml`, falling back to `~/.config`.
pub fn default_path() -> PathBuf {
    let dir = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        home.join(".config")
    };
    dir.join(APP_NAME).join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.hypervisor.virsh, "virsh");
        assert_eq!(s.hypervisor.block_device_snapshot_dir, PathBuf::from("/var/lib/libvirt/images"));
        assert_eq!(s.commit.retry_policy().attempts, 3);
        assert_eq!(s.commit.retry_policy().backoff, Duration::from_secs(5));
        assert_eq!(s.commit.poll_interval(), Duration::from_secs(1));
        assert_eq!(s.archiver.program, "borg");
        assert_eq!(s.archiver.passphrase_env, "BORG_PASSPHRASE");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let partial = r#"
[commit]
attempts = 5
image_tool = "/opt/qemu/bin/qemu-img"
"#;
        let s = Settings::from_toml(partial).expect("partial parse failed");
        assert_eq!(s.commit.attempts, 5);
        assert_eq!(s.commit.image_tool, "/opt/qemu/bin/qemu-img");
        assert_eq!(s.commit.backoff_secs, 5);
        assert_eq!(s.archiver.program, "borg");
    }

    #[test]
    fn toml_roundtrip() {
        let mut original = Settings::default();
        original.hypervisor.uri = Some("qemu:///system".into());
        let parsed = Settings::from_toml(&original.to_toml()).expect("roundtrip parse failed");
        assert_eq!(parsed.hypervisor.uri.as_deref(), Some("qemu:///system"));
        assert_eq!(parsed.archiver.poll_timeout_ms, original.archiver.poll_timeout_ms);
    }

    #[test]
    fn invalid_toml_is_rejected() {
        assert!(Settings::from_toml("this is not [[ valid toml").is_err());
    }

    #[test]
    fn env_overrides_tools() {
        let mut s = Settings::default();
        s.apply_env(|key| match key {
            "BACKUP_VM_BORG" => Some("/tmp/fake-borg".into()),
            "BACKUP_VM_QEMU_IMG" => Some("/tmp/fake-qemu-img".into()),
            _ => None,
        });
        assert_eq!(s.archiver.program, "/tmp/fake-borg");
        assert_eq!(s.commit.image_tool, "/tmp/fake-qemu-img");
        assert_eq!(s.hypervisor.virsh, "virsh");
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(s.commit.attempts, 3);
    }

    #[test]
    fn load_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[commit\nattempts = ").unwrap();
        assert!(matches!(Settings::load(Some(&path)), Err(BackupError::Config(_))));
    }
}
