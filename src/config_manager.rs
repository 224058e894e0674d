use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::schedule::Schedule;

const APP_DIR: &str = "sftp-backup";
const ENCRYPTED_PREFIX: &str = "enc:";

/// How a session authenticates against a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerTarget {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl ServerTarget {
    /// The key file wins when both a key and a password are configured.
    pub fn credential(&self) -> Credential {
        match &self.key_file {
            Some(path) => Credential::KeyFile(expand_home(path)),
            None => Credential::Password(self.password.clone().unwrap_or_default()),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupTask {
    /// Filled from the map key after loading.
    #[serde(skip)]
    pub name: String,
    pub source_path: PathBuf,
    pub target_server: String,
    pub target_path: String,
    pub schedule: String,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    /// Seconds between failed attempts.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
}

impl BackupTask {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_error_pause")]
    pub error_pause_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            error_pause_secs: default_error_pause(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default = "default_history_entries")]
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_entries: default_history_entries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerTarget>,
    #[serde(default)]
    pub backup_tasks: BTreeMap<String, BackupTask>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl AppConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: AppConfig =
            serde_yaml::from_str(text).context("failed to parse configuration YAML")?;
        config.fill_task_names();
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize configuration")
    }

    fn fill_task_names(&mut self) {
        for (name, task) in self.backup_tasks.iter_mut() {
            task.name = name.clone();
        }
    }

    /// Problems that do not prevent loading but will make a task fail or never fire.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (name, task) in &self.backup_tasks {
            if !self.servers.contains_key(&task.target_server) {
                warnings.push(format!(
                    "task {}: unknown target server {}",
                    name, task.target_server
                ));
            }
            if let Err(e) = Schedule::parse(&task.schedule) {
                warnings.push(format!("task {}: {}", name, e));
            }
            if task.retry_times == 0 {
                warnings.push(format!("task {}: retry_times is 0, the task will never run", name));
            }
        }
        for (name, server) in &self.servers {
            if server.key_file.is_none() && server.password.is_none() {
                warnings.push(format!("server {}: neither password nor key_file set", name));
            }
        }
        warnings
    }
}

/// Loads and saves the YAML configuration and encrypts stored passwords.
pub struct ConfigManager {
    config_path: PathBuf,
    key_path: PathBuf,
}

impl ConfigManager {
    /// Uses `<config dir>/sftp-backup/config.yaml`.
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("failed to determine the configuration directory")?
            .join(APP_DIR);

        fs::create_dir_all(&config_dir)
            .context("failed to create the configuration directory")?;

        Ok(Self::with_path(config_dir.join("config.yaml")))
    }

    /// The encryption key lives next to the config file.
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        let key_path = config_path
            .parent()
            .map(|dir| dir.join("key.dat"))
            .unwrap_or_else(|| PathBuf::from("key.dat"));
        Self {
            config_path,
            key_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn load_config(&self) -> Result<AppConfig> {
        let text = fs::read_to_string(&self.config_path).with_context(|| {
            format!(
                "failed to read configuration file {}",
                self.config_path.display()
            )
        })?;
        AppConfig::from_yaml(&text)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir).context("failed to create the configuration directory")?;
        }
        fs::write(&self.config_path, config.to_yaml()?).with_context(|| {
            format!(
                "failed to write configuration file {}",
                self.config_path.display()
            )
        })?;
        Ok(())
    }

    /// Last modification time of the config file, used to detect edits.
    pub fn modified(&self) -> Result<SystemTime> {
        fs::metadata(&self.config_path)
            .and_then(|m| m.modified())
            .with_context(|| format!("failed to stat {}", self.config_path.display()))
    }

    /// Returns `enc:` + base64(nonce || ciphertext).
    pub fn encrypt_secret(&self, plain: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key()?));
        let nonce = Aes256Gcm::generate_nonce(&mut rand::thread_rng());

        let ciphertext = cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|e| anyhow!("encryption failed: {}", e))?;

        let mut encrypted_data = Vec::with_capacity(nonce.len() + ciphertext.len());
        encrypted_data.extend_from_slice(&nonce);
        encrypted_data.extend_from_slice(&ciphertext);

        Ok(format!(
            "{}{}",
            ENCRYPTED_PREFIX,
            general_purpose::STANDARD.encode(encrypted_data)
        ))
    }

    /// Values without the `enc:` prefix are returned unchanged.
    pub fn decrypt_secret(&self, value: &str) -> Result<String> {
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.to_string());
        };

        let encrypted_data = general_purpose::STANDARD
            .decode(encoded.trim())
            .context("base64 decoding of secret failed")?;

        if encrypted_data.len() < 12 {
            return Err(anyhow!("encrypted secret is too short"));
        }

        let (nonce_bytes, ciphertext) = encrypted_data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key()?));
        let plain = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow!("decryption failed: {}", e))?;

        String::from_utf8(plain).context("decrypted secret is not valid UTF-8")
    }

    /// Copy of `server` with its password decrypted.
    pub fn resolve_server(&self, server: &ServerTarget) -> Result<ServerTarget> {
        let mut resolved = server.clone();
        if let Some(password) = &server.password {
            resolved.password = Some(self.decrypt_secret(password)?);
        }
        Ok(resolved)
    }

    /// Reads the key file, generating it on first use.
    fn encryption_key(&self) -> Result<[u8; 32]> {
        if self.key_path.exists() {
            return fs::read(&self.key_path)
                .context("failed to read the encryption key")?
                .try_into()
                .map_err(|_| anyhow!("invalid encryption key file"));
        }

        if let Some(dir) = self.key_path.parent() {
            fs::create_dir_all(dir).context("failed to create the key directory")?;
        }
        let key = Aes256Gcm::generate_key(&mut rand::thread_rng());
        fs::write(&self.key_path, &key).context("failed to save the encryption key")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.key_path, fs::Permissions::from_mode(0o600))
                .context("failed to restrict key file permissions")?;
        }
        Ok(key.into())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn default_port() -> u16 {
    22
}

fn default_retry_times() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_error_pause() -> u64 {
    5
}

fn default_history_entries() -> usize {
    100
}
