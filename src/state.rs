//! Pool state persistence across restarts
//!
//! The registry is written as JSON on shutdown and read back on startup.
//! Timestamps round-trip as RFC 3339 strings; `inUse` is reset by the
//! registry when the records are installed.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;
use crate::models::Proxy;

/// JSON file holding a registry snapshot
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot, replacing any previous file
    pub fn save(&self, proxies: &[Proxy]) -> Result<()> {
        let json = serde_json::to_vec_pretty(proxies)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        info!("Saved {} proxies to {}", proxies.len(), self.path.display());
        Ok(())
    }

    /// Read a previously saved snapshot; `None` when there is none
    pub fn load(&self) -> Result<Option<Vec<Proxy>>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let proxies: Vec<Proxy> = serde_json::from_slice(&raw)?;
        if proxies.is_empty() {
            warn!("State file {} holds no proxies, ignoring it", self.path.display());
            return Ok(None);
        }

        info!(
            "Restored {} proxies from {}",
            proxies.len(),
            self.path.display()
        );
        Ok(Some(proxies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::env;

    fn temp_state() -> StateFile {
        StateFile::new(env::temp_dir().join(format!("rotator-state-{}.json", uuid::Uuid::new_v4())))
    }

    #[test]
    fn test_missing_file_is_none() {
        let state = temp_state();
        assert!(state.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_restores_health_fields() {
        let state = temp_state();
        let now = Utc::now();

        let mut broken = Proxy::new("10.0.0.1:3128");
        broken.errors = 2;
        broken.broken = Some(now);
        broken.in_use = true;
        let mut blocked = Proxy::new("10.0.0.2:3128");
        blocked.hits = 9;
        blocked.blocked = Some(now);

        state.save(&[broken, blocked]).unwrap();
        let restored = state.load().unwrap().unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].address, "10.0.0.1:3128");
        assert_eq!(restored[0].errors, 2);
        assert_eq!(restored[0].broken, Some(now));
        assert_eq!(restored[1].hits, 9);
        assert_eq!(restored[1].blocked, Some(now));

        let _ = fs::remove_file(state.path());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let state = temp_state();
        fs::write(state.path(), b"not json").unwrap();

        assert!(state.load().is_err());

        let _ = fs::remove_file(state.path());
    }
}
