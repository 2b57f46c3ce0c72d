//! Credentials — short-lived control-plane tokens and their on-disk store.
//!
//! The credentials file is JSON with owner-only permissions, written
//! atomically (temp file in the same directory, then rename) so a crash
//! mid-write can never leave a torn file.

pub mod refresher;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::AgentError;

/// Skew buffer: a token is only "valid" while it has at least this long left.
pub const VALIDITY_BUFFER_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub workspace_id: String,
}

impl Credentials {
    /// `valid ⇔ access_token ≠ "" ∧ now + 30s < expires_at`.
    pub fn is_valid(&self) -> bool {
        self.valid_for(Duration::seconds(VALIDITY_BUFFER_SECS))
    }

    /// Like [`is_valid`](Self::is_valid) with a caller-chosen horizon — the
    /// background refresher uses a 5-minute horizon.
    pub fn valid_for(&self, horizon: Duration) -> bool {
        !self.access_token.is_empty() && Utc::now() + horizon < self.expires_at
    }

    /// Past the absolute expiry — not even worth attempting a request with.
    pub fn hard_expired(&self) -> bool {
        self.access_token.is_empty() || Utc::now() >= self.expires_at
    }

    /// Credentials built from a token override supplied via the environment.
    /// No refresh token, so they live until their assumed expiry and are
    /// never persisted.
    pub fn from_env_token(token: String) -> Self {
        Self {
            access_token: token,
            refresh_token: String::new(),
            expires_at: Utc::now() + Duration::hours(24),
            user_id: String::new(),
            workspace_id: String::new(),
        }
    }
}

// ─── File store ───────────────────────────────────────────────────────────────

/// Owner-only JSON file under the per-OS config directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `{config_dir}/credentials.json` for the current platform.
    pub fn default_path() -> PathBuf {
        default_config_dir().join("credentials.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Credentials, AgentError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            AgentError::Config(format!(
                "read credentials file {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            AgentError::Config(format!(
                "parse credentials file {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Atomic write-then-rename with `0600` permissions.
    pub fn save(&self, creds: &Credentials) -> Result<(), AgentError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| AgentError::Config("credentials path has no parent".into()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| AgentError::Config(format!("create {}: {e}", dir.display())))?;

        let json = serde_json::to_string_pretty(creds)
            .map_err(|e| AgentError::Config(format!("encode credentials: {e}")))?;

        let tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| AgentError::Config(format!("create temp credentials file: {e}")))?;
        std::io::Write::write_all(&mut tmp.as_file(), json.as_bytes())
            .map_err(|e| AgentError::Config(format!("write credentials: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tmp.as_file()
                .set_permissions(perms)
                .map_err(|e| AgentError::Config(format!("chmod credentials: {e}")))?;
        }

        tmp.persist(&self.path)
            .map_err(|e| AgentError::Config(format!("persist credentials: {e}")))?;
        Ok(())
    }
}

/// Per-OS config directory for tetherd state.
pub fn default_config_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/tetherd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tetherd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_CONFIG_HOME/tetherd or ~/.config/tetherd
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("tetherd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join("tetherd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\tetherd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tetherd");
        }
    }
    // Fallback
    PathBuf::from(".tetherd")
}
