use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    1000
}

fn default_list_timeout() -> u64 {
    600
}

fn default_empty_dir_depth() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    60
}

fn default_rc_url() -> String {
    "http://localhost:5572".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoreConfig {
    pub rclone_binary_path: PathBuf,
    pub rclone_config_path: PathBuf,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            rclone_binary_path: PathBuf::from("rclone"),
            rclone_config_path: PathBuf::from(""),
            dry_run: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub allowed_from: String,
    pub allowed_until: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChunkedUploadConfig {
    pub enabled: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_list_timeout")]
    pub generate_list_timeout: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MoverConfig {
    pub enabled: bool,
    #[serde(default)]
    pub move_from_remote: String,
    #[serde(default)]
    pub move_to_remote: String,
    #[serde(default)]
    pub rclone_extras: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploaderConfig {
    /// Minutes between scheduled folder-size checks.
    pub check_interval: u64,
    /// Upload once the staging folder reaches this many GiB.
    pub max_size_gb: u64,
    #[serde(default)]
    pub size_excludes: Vec<String>,
    #[serde(default)]
    pub exclude_open_files: bool,
    #[serde(default)]
    pub opened_excludes: Vec<String>,
    #[serde(default)]
    pub service_account_path: Option<PathBuf>,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default = "default_true")]
    pub can_be_throttled: bool,
    #[serde(default)]
    pub chunked_upload: Option<ChunkedUploadConfig>,
    #[serde(default)]
    pub mover: Option<MoverConfig>,
}

/// One sleep trigger: if `phrase` is seen `count` times within `timeout`
/// seconds of tool output, abort and suspend for `sleep` hours.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TriggerConfig {
    pub count: u32,
    pub timeout: u64,
    pub sleep: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    pub upload_folder: String,
    pub upload_remote: String,
    #[serde(default)]
    pub rclone_excludes: Vec<String>,
    #[serde(default)]
    pub rclone_extras: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub rclone_sleeps: BTreeMap<String, TriggerConfig>,
    #[serde(default = "default_empty_dir_depth")]
    pub remove_empty_dir_depth: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RcloneRcConfig {
    // 字段名保持为 url；兼容旧配置中的 rc_url（向后兼容） — Field name kept as url; compatible with rc_url in older configs (backward compatibility)
    #[serde(default = "default_rc_url", alias = "rc_url")]
    pub url: String,
    #[serde(default)]
    pub throttle_speeds: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PlexConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub max_streams_before_throttle: usize,
    #[serde(default)]
    pub ignore_local_streams: bool,
    #[serde(default)]
    pub notifications: bool,
    #[serde(default)]
    pub rclone: RcloneRcConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct QueueServiceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub apikey: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SyncerConfig {
    pub service: String,
    /// Hours between scheduled sync runs.
    pub sync_interval: u64,
    #[serde(default)]
    pub instance_destroy: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotificationConfig {
    pub service: String,
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub uploader: BTreeMap<String, UploaderConfig>,
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteConfig>,
    // Sections consumed by collaborators only; kept as raw values so a
    // round-trip through this binary never drops newer keys.
    #[serde(default)]
    pub hidden: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub syncer: BTreeMap<String, SyncerConfig>,
    #[serde(default)]
    pub notifications: BTreeMap<String, NotificationConfig>,
    #[serde(default)]
    pub plex: PlexConfig,
    #[serde(default)]
    pub nzbget: QueueServiceConfig,
    #[serde(default)]
    pub sabnzbd: QueueServiceConfig,
    #[serde(default)]
    pub dashboard: serde_json::Value,
    #[serde(skip)]
    pub state_dir: PathBuf,
}

/// Ensure the barrow state directory exists and return it.
pub fn ensure_state_dir(home_dir: &Path) -> Result<PathBuf> {
    let dir = home_dir.join(".barrow");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;
    }
    Ok(dir)
}

impl Config {
    /// Load the config from `path`, or from `<state_dir>/config.json` when
    /// no explicit path is given. A missing default config file is created
    /// with defaults so the user has something to edit.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, state_dir) = match path {
            Some(p) => {
                let dir = p
                    .parent()
                    .filter(|d| !d.as_os_str().is_empty())
                    .map(|d| d.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                (p.to_path_buf(), dir)
            }
            None => {
                let home = dirs::home_dir().context("cannot determine the user's home dir")?;
                let dir = ensure_state_dir(&home)?;
                (dir.join("config.json"), dir)
            }
        };

        if !config_path.exists() {
            let fresh = Config { state_dir: state_dir.clone(), ..Default::default() };
            fresh.save_to(&config_path)?;
            // logging is not up yet when the config loads
            eprintln!(
                "wrote a default config to {}, edit it before running again",
                config_path.display()
            );
        }

        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config {}", config_path.display()))?;
        let mut cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", config_path.display()))?;
        cfg.state_dir = state_dir;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Every uploader must name a configured remote; catching this at load
    /// time beats failing halfway through an upload run.
    fn validate(&self) -> Result<()> {
        for name in self.uploader.keys() {
            if !self.remotes.contains_key(name) {
                return Err(crate::UploadError::MissingRemote(name.clone()).into());
            }
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// RC URL used for stats polling and throttling. Falls back to the
    /// tool's default RC port when plex does not configure one.
    pub fn rc_url(&self) -> String {
        if self.plex.enabled && !self.plex.rclone.url.is_empty() {
            self.plex.rclone.url.clone()
        } else {
            default_rc_url()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let raw = r#"{
            "core": {"rclone_binary_path": "/usr/bin/rclone", "rclone_config_path": "/cfg/rclone.conf"},
            "uploader": {"gdrive": {"check_interval": 30, "max_size_gb": 200}},
            "remotes": {"gdrive": {"upload_folder": "/mnt/local/Media", "upload_remote": "gdrive:/Media"}}
        }"#;
        let cfg: Config = serde_json::from_str(raw).expect("parse");
        let up = cfg.uploader.get("gdrive").unwrap();
        assert!(up.can_be_throttled);
        assert!(up.service_account_path.is_none());
        let remote = cfg.remotes.get("gdrive").unwrap();
        assert_eq!(remote.remove_empty_dir_depth, 1);
        assert!(remote.rclone_sleeps.is_empty());
        assert!(!cfg.plex.enabled);
        assert_eq!(cfg.rc_url(), "http://localhost:5572");
    }

    #[test]
    fn trigger_and_schedule_blocks_parse() {
        let raw = r#"{
            "core": {"rclone_binary_path": "rclone", "rclone_config_path": "/cfg/rclone.conf"},
            "uploader": {"gdrive": {
                "check_interval": 30,
                "max_size_gb": 200,
                "schedule": {"enabled": true, "allowed_from": "23:00", "allowed_until": "06:00"},
                "chunked_upload": {"enabled": true}
            }},
            "remotes": {"gdrive": {
                "upload_folder": "/mnt/local/Media",
                "upload_remote": "gdrive:/Media",
                "rclone_sleeps": {"userRateLimitExceeded": {"count": 5, "timeout": 300, "sleep": 25}}
            }}
        }"#;
        let cfg: Config = serde_json::from_str(raw).expect("parse");
        let chunked = cfg.uploader["gdrive"].chunked_upload.as_ref().unwrap();
        assert_eq!(chunked.chunk_size, 1000);
        assert_eq!(chunked.generate_list_timeout, 600);
        let trig = &cfg.remotes["gdrive"].rclone_sleeps["userRateLimitExceeded"];
        assert_eq!((trig.count, trig.timeout, trig.sleep), (5, 300, 25));
    }

    #[test]
    fn uploader_without_remote_fails_validation() {
        let raw = r#"{
            "core": {"rclone_binary_path": "rclone", "rclone_config_path": "/cfg/rclone.conf"},
            "uploader": {"gdrive": {"check_interval": 30, "max_size_gb": 200}},
            "remotes": {}
        }"#;
        let cfg: Config = serde_json::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());
    }
}
