//! Network secret persistence
//!
//! The bearer secret presented to the peermap server, stored as a small
//! JSON file (`{"secret": ..., "network": ..., "expire": RFC3339}`) and
//! rewritten atomically whenever the join flow issues a fresh one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PeermapResult;

/// Opaque bearer credential for one overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSecret {
    pub secret: String,
    pub network: String,
    pub expire: DateTime<Utc>,
}

impl NetworkSecret {
    /// Expired iff the deadline has passed.
    pub fn expired(&self) -> bool {
        Utc::now() >= self.expire
    }
}

/// Secret storage backed by a single JSON file.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read and decode the stored secret.
    pub fn load(&self) -> PeermapResult<NetworkSecret> {
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persist a fresh secret. The file is replaced atomically via a
    /// sibling temp file and rename, so a crash never leaves a torn file.
    pub fn update(&self, secret: &NetworkSecret) -> PeermapResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(secret)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn secret(expire_in_secs: i64) -> NetworkSecret {
        NetworkSecret {
            secret: "s3cr3t".into(),
            network: "testnet".into(),
            expire: Utc::now() + ChronoDuration::seconds(expire_in_secs),
        }
    }

    #[test]
    fn expiry() {
        assert!(!secret(3600).expired());
        assert!(secret(-1).expired());
    }

    #[test]
    fn store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secret.json"));
        assert!(!store.exists());

        let s = secret(3600);
        store.update(&s).unwrap();
        assert!(store.exists());
        assert_eq!(store.load().unwrap(), s);
    }

    #[test]
    fn update_replaces_without_leftover_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secret.json"));

        store.update(&secret(10)).unwrap();
        let refreshed = secret(7200);
        store.update(&refreshed).unwrap();

        assert_eq!(store.load().unwrap(), refreshed);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("secret.json")]);
    }

    #[test]
    fn file_uses_the_documented_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secret.json"));
        store.update(&secret(60)).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        for field in ["\"secret\"", "\"network\"", "\"expire\""] {
            assert!(raw.contains(field), "missing {field} in {raw}");
        }
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("nope.json"));
        assert!(store.load().is_err());
    }
}
