use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    /// Unix seconds
    expires_at: i64,
}

/// Bearer token with explicit login/logout boundaries, optionally persisted as a JSON file.
///
/// Readers always see either no token or a complete one; an expired token reads as absent.
pub struct Session {
    path: Option<PathBuf>,
    token: RwLock<Option<StoredToken>>,
}

impl Session {
    /// A session that lives only as long as the process
    pub fn in_memory() -> Self {
        Self { path: None, token: RwLock::new(None) }
    }

    /// Restore the session persisted at `path`. A missing file is an empty session.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let token = match std::fs::read_to_string(&path) {
            Ok(contents) => Some(serde_json::from_str::<StoredToken>(&contents)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if token.is_some() {
            tracing::info!("Restored session from {}", path.display());
        }
        Ok(Self { path: Some(path), token: RwLock::new(token) })
    }

    /// Store a freshly issued token
    pub fn login(&self, access_token: impl Into<String>, expires_in: Duration) -> Result<()> {
        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + expires_in.as_secs() as i64;
        let token = StoredToken { access_token: access_token.into(), expires_at };
        self.persist(Some(&token))?;
        *self.token.write() = Some(token);
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        self.token.write().take();
        self.persist(None)
    }

    /// Current token, `None` when logged out or expired
    pub fn token(&self) -> Option<String> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.token.read().as_ref().filter(|token| token.expires_at > now).map(|token| token.access_token.clone())
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.token.read().as_ref().and_then(|token| OffsetDateTime::from_unix_timestamp(token.expires_at).ok())
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.read().is_some()
    }

    /// True when a token exists and expires within `margin`
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.token.read().as_ref().is_some_and(|token| token.expires_at - now <= margin.as_secs() as i64)
    }

    fn persist(&self, token: Option<&StoredToken>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match token {
            Some(token) => {
                if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, serde_json::to_vec(token)?)?;
            }
            None => match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            },
        }
        Ok(())
    }
}
