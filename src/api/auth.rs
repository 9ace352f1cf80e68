use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};

/// Bearer token persisted on local disk
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// `~` and environment variables in `path` are expanded
    pub fn new(path: &str) -> Result<Self> {
        let expanded = shellexpand::full(path)
            .map_err(|e| Error::Config(format!("invalid token path {}: {}", path, e)))?;
        Ok(Self {
            path: PathBuf::from(expanded.as_ref()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no token has been saved
    pub fn load(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, token.trim())?;
        Ok(())
    }

    /// Forget the token (logout)
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Cleared bearer token at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to clear bearer token: {}", e);
                Err(e.into())
            }
        }
    }
}
