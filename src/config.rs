//! Agent configuration and identity.
//!
//! Settings live in a TOML file in the agent's data directory; the agent
//! id is a separate JSON file created on first run and reused forever
//! after. The API key is generated on first run and written back with the
//! settings. The certificate password is stored as a machine-keyed
//! protected blob and only decrypted through the platform.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::Platform;

/// Default control-plane port.
fn default_listen_port() -> u16 {
    44325
}

fn default_max_sessions() -> usize {
    1
}

fn default_capture_fps() -> u32 {
    30
}

fn default_log_filter() -> String {
    "rc_agent=info".to_string()
}

/// TLS material references; loading the certificate itself belongs to the
/// installer-provisioned collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,

    /// Machine-keyed protected blob, base64. Decrypted via
    /// [`Settings::certificate_password`].
    #[serde(default)]
    pub certificate_password_blob: Option<String>,
}

impl TlsSettings {
    pub fn configured(&self) -> bool {
        self.certificate_path.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_capture_fps")]
    pub capture_fps: u32,

    /// Callers permitted to open desktop sessions. Empty means deny-all
    /// unless `allow_empty_allowlist` is set.
    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default)]
    pub allow_empty_allowlist: bool,

    /// Shared key expected in the `x-api-key` header. Generated on first
    /// run when absent.
    #[serde(default)]
    pub api_key: String,

    /// Require the API key on `/api/v1/health` too.
    #[serde(default)]
    pub require_auth_for_health: bool,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub tls: TlsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            max_sessions: default_max_sessions(),
            capture_fps: default_capture_fps(),
            allowlist: Vec::new(),
            allow_empty_allowlist: false,
            api_key: String::new(),
            require_auth_for_health: false,
            log_filter: default_log_filter(),
            tls: TlsSettings::default(),
        }
    }
}

fn random_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        let settings: Settings =
            toml::from_str(&content).context("failed to parse settings file")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings, creating the file with generated defaults when it
    /// does not exist yet. Also backfills a missing API key.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            Self::load(path)?
        } else {
            tracing::info!(path = %path.display(), "settings file not found, writing defaults");
            Settings::default()
        };

        if settings.api_key.is_empty() {
            settings.api_key = random_api_key();
            settings.save(path)?;
            tracing::info!("generated new api key");
        } else if !path.exists() {
            settings.save(path)?;
        }

        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture_fps == 0 || self.capture_fps > 60 {
            anyhow::bail!("capture_fps must be between 1 and 60");
        }
        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }
        Ok(())
    }

    /// Decrypt the certificate password blob through the platform's
    /// machine-keyed data protection.
    pub fn certificate_password(&self, platform: &dyn Platform) -> Result<Option<String>> {
        let Some(blob) = &self.tls.certificate_password_blob else {
            return Ok(None);
        };
        let protected = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .context("certificate password blob is not valid base64")?;
        let secret = platform
            .unprotect_secret(&protected)
            .context("failed to unprotect certificate password")?;
        let password =
            String::from_utf8(secret).context("certificate password is not valid UTF-8")?;
        Ok(Some(password))
    }
}

/// Persisted agent identity, created on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentId {
    pub id: Uuid,
    pub hostname: String,
    pub created_at: u64,
}

impl AgentId {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            hostname: hostname(),
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    pub fn as_str(&self) -> String {
        self.id.to_string()
    }
}

fn hostname() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Create a new id on first run, return the existing one after.
pub fn get_or_create_agent_id(path: &Path) -> Result<AgentId> {
    if path.exists() {
        match load_agent_id(path) {
            Ok(id) => {
                tracing::debug!(agent_id = %id.id, "loaded existing agent id");
                return Ok(id);
            }
            Err(e) => {
                tracing::warn!("failed to load agent id, creating a new one: {}", e);
            }
        }
    }

    let id = AgentId::new();
    save_agent_id(path, &id)?;
    tracing::info!(agent_id = %id.id, "created new agent id");
    Ok(id)
}

fn load_agent_id(path: &Path) -> Result<AgentId> {
    let bytes = std::fs::read(path).context("failed to read agent id file")?;
    let id: AgentId = serde_json::from_slice(&bytes).context("failed to parse agent id")?;
    Ok(id)
}

fn save_agent_id(path: &Path, id: &AgentId) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    let json = serde_json::to_string_pretty(id).context("failed to serialize agent id")?;
    std::fs::write(path, json).context("failed to write agent id file")?;
    Ok(())
}

/// Data directory for settings, identity, and logs.
pub fn data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(std::env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".into()))
            .join("rc-agent")
    }
    #[cfg(not(windows))]
    {
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(|home| PathBuf::from(home).join(".local/share"))
                    .unwrap_or_else(|_| PathBuf::from("."))
            })
            .join("rc-agent")
    }
}
