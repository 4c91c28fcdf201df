use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::Token;

const SESSION_FILE: &str = "session";

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("no token stored for endpoint `{endpoint}`")]
    NotFound { endpoint: String },

    #[error("token file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// File-backed endpoint → [`Token`] map.
///
/// Filenames are the URL-safe base64 of the SHA-256 of the endpoint, so
/// arbitrary URLs map to safe path components and renames stay stable.
pub struct TokenStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    session_id: String,
}

impl TokenStore {
    /// Open (creating if needed) the store at the default per-user location.
    pub fn open_default() -> Result<Self, TokenStoreError> {
        let dir = dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("muster")
            .join("tokens");
        Self::open(dir)
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, TokenStoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let session_id = load_or_create_session_id(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
            session_id,
        })
    }

    /// Stable per-install identifier, sent as `Mcp-Session-Id` on every
    /// upstream connection so a server can correlate transports.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get(&self, endpoint: &str) -> Result<Token, TokenStoreError> {
        let _guard = self.lock_for(endpoint).await;
        self.read_file(endpoint)
    }

    pub async fn put(&self, endpoint: &str, token: &Token) -> Result<(), TokenStoreError> {
        let _guard = self.lock_for(endpoint).await;
        let path = self.path_for(endpoint);
        let json = serde_json::to_vec_pretty(token).map_err(|source| TokenStoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomically(&self.dir, &path, &json)?;
        Ok(())
    }

    pub async fn delete(&self, endpoint: &str) -> Result<(), TokenStoreError> {
        let _guard = self.lock_for(endpoint).await;
        let path = self.path_for(endpoint);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(TokenStoreError::NotFound {
                    endpoint: endpoint.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tokens currently on disk. Corrupt files are skipped with a warning;
    /// they only block the endpoint that owns them.
    pub async fn list(&self) -> Result<Vec<Token>, TokenStoreError> {
        let mut tokens = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name() == SESSION_FILE {
                continue;
            }
            match std::fs::read(entry.path()) {
                Ok(bytes) => match serde_json::from_slice::<Token>(&bytes) {
                    Ok(token) => tokens.push(token),
                    Err(error) => {
                        warn!(path = %entry.path().display(), %error, "skipping corrupt token file");
                    }
                },
                Err(error) => {
                    warn!(path = %entry.path().display(), %error, "skipping unreadable token file");
                }
            }
        }
        Ok(tokens)
    }

    pub async fn clear_all(&self) -> Result<(), TokenStoreError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name() == SESSION_FILE {
                continue;
            }
            std::fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    fn read_file(&self, endpoint: &str) -> Result<Token, TokenStoreError> {
        let path = self.path_for(endpoint);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TokenStoreError::NotFound {
                    endpoint: endpoint.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|source| TokenStoreError::Corrupt { path, source })
    }

    fn path_for(&self, endpoint: &str) -> PathBuf {
        self.dir.join(format!("{}.json", endpoint_key(endpoint)))
    }

    async fn lock_for(&self, endpoint: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// URL-safe filename component for an endpoint.
fn endpoint_key(endpoint: &str) -> String {
    let digest = Sha256::digest(endpoint.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Write-temp + fsync + rename, with the temp file created in the target
/// directory so the rename stays on one filesystem. Mode 0600 on unix.
fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), TokenStoreError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn load_or_create_session_id(dir: &Path) -> Result<String, TokenStoreError> {
    let path = dir.join(SESSION_FILE);
    match std::fs::read_to_string(&path) {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing.trim().to_string()),
        Ok(_) | Err(_) => {
            let id = uuid::Uuid::new_v4().to_string();
            write_atomically(dir, &path, id.as_bytes())?;
            Ok(id)
        }
    }
}
