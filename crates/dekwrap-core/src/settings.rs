use crate::error::{EnvelopeError, Result};
use crate::locator::DEFAULT_SEARCH_LIMIT;
use crate::token::SlotId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which secure element the workflow talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    /// Encrypted soft-token file. `None` means the default path in the data dir.
    Soft {
        #[serde(default)]
        token_file: Option<PathBuf>,
    },
    /// Vendor PKCS#11 module.
    Pkcs11 { module: PathBuf },
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Soft { token_file: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub default_slot: Option<SlotId>,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            default_slot: None,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl Settings {
    /// Reads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| EnvelopeError::Settings(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(EnvelopeError::Settings(format!("{}: {e}", path.display()))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EnvelopeError::Settings(format!("{}: {e}", parent.display())))?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| EnvelopeError::Settings(e.to_string()))?;
        std::fs::write(path, data).map_err(|e| EnvelopeError::Settings(format!("{}: {e}", path.display())))
    }
}
