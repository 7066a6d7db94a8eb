pub mod smb;

pub use smb::SmbClientBackend;

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    Disk,
    Printer,
    Device,
    Ipc,
}

/// A share is identified by its host and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareKey {
    pub host: String,
    pub name: String,
}

impl ShareKey {
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: name.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() || self.name.trim().is_empty() {
            return Err(Error::validation("share host and name must be set"));
        }
        if self.name.contains('/') || self.name.contains('\\') {
            return Err(Error::validation(format!("invalid share name {}", self.name)));
        }
        Ok(())
    }
}

impl std::fmt::Display for ShareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "//{}/{}", self.host, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub host: String,
    pub name: String,
    #[serde(rename = "type")]
    pub share_type: ShareType,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Username of the pinned credentials; the password is never exposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Share {
    pub fn key(&self) -> ShareKey {
        ShareKey::new(self.host.clone(), self.name.clone())
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

/// Access to the file-sharing service on a host.
#[async_trait]
pub trait ShareBackend: Send + Sync {
    async fn list_shares(&self, host: &str, credentials: Option<&Credentials>) -> Result<Vec<Share>>;

    async fn space(&self, share: &ShareKey, credentials: Option<&Credentials>) -> Result<SpaceStats>;

    /// Make the share reachable as a local directory and return its root.
    async fn open(&self, share: &ShareKey, credentials: Option<&Credentials>) -> Result<PathBuf>;
}

/// Persistence for pinned shares. Passwords are not handed to the store.
#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn save_pinned(&self, share: &Share) -> Result<()>;
    async fn remove_pinned(&self, key: &ShareKey) -> Result<()>;
}

#[derive(Clone)]
struct PinnedShare {
    share: Share,
    credentials: Option<Credentials>,
}

/// Remembered shares, keyed by `(host, name)`.
#[derive(Clone)]
pub struct ShareRegistry {
    backend: Arc<dyn ShareBackend>,
    store: Arc<dyn ShareStore>,
    pinned: Arc<RwLock<Vec<PinnedShare>>>,
}

impl ShareRegistry {
    pub fn new(backend: Arc<dyn ShareBackend>, store: Arc<dyn ShareStore>) -> Self {
        Self {
            backend,
            store,
            pinned: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Load persisted pins. Their passwords are unknown until pinned again.
    pub fn restore(&self, shares: Vec<Share>) {
        let mut pinned = self.pinned.write();
        pinned.clear();
        for mut share in shares {
            share.pinned = true;
            if !pinned.iter().any(|p| p.share.key() == share.key()) {
                pinned.push(PinnedShare {
                    share,
                    credentials: None,
                });
            }
        }
    }

    /// Shares visible on `host`. Does not touch the registry.
    pub async fn discover_shares(&self, host: &str, credentials: Option<&Credentials>) -> Result<Vec<Share>> {
        if host.trim().is_empty() {
            return Err(Error::validation("host is empty"));
        }
        let mut shares = self.backend.list_shares(host, credentials).await?;
        let pinned = self.pinned.read();
        for share in shares.iter_mut() {
            share.pinned = pinned.iter().any(|p| p.share.key() == share.key());
        }
        debug!(host, "Discovered {} shares", shares.len());
        Ok(shares)
    }

    /// Insert or refresh a pin. Re-pinning replaces credentials in place.
    pub async fn pin_share(&self, mut share: Share, credentials: Option<Credentials>) -> Result<Share> {
        let key = share.key();
        key.validate()?;

        share.pinned = true;
        share.username = credentials.as_ref().map(|c| c.username.clone());

        {
            let mut pinned = self.pinned.write();
            let entry = PinnedShare {
                share: share.clone(),
                credentials,
            };
            match pinned.iter_mut().find(|p| p.share.key() == key) {
                Some(existing) => *existing = entry,
                None => pinned.push(entry),
            }
        }

        self.store.save_pinned(&share).await?;
        info!("Pinned share {}", key);
        Ok(share)
    }

    /// Removing an absent key is a no-op.
    pub async fn unpin_share(&self, key: &ShareKey) -> Result<()> {
        let removed = {
            let mut pinned = self.pinned.write();
            let before = pinned.len();
            pinned.retain(|p| &p.share.key() != key);
            pinned.len() != before
        };

        if removed {
            self.store.remove_pinned(key).await?;
            info!("Unpinned share {}", key);
        }
        Ok(())
    }

    pub fn list_pinned(&self) -> Vec<Share> {
        self.pinned.read().iter().map(|p| p.share.clone()).collect()
    }

    pub fn is_pinned(&self, key: &ShareKey) -> bool {
        self.pinned.read().iter().any(|p| &p.share.key() == key)
    }

    pub fn credentials_for(&self, key: &ShareKey) -> Option<Credentials> {
        self.pinned
            .read()
            .iter()
            .find(|p| &p.share.key() == key)
            .and_then(|p| p.credentials.clone())
    }

    /// Explicit credentials win over the pinned ones.
    pub async fn get_space(&self, key: &ShareKey, credentials: Option<Credentials>) -> Result<SpaceStats> {
        key.validate()?;
        let credentials = credentials.or_else(|| self.credentials_for(key));
        self.backend.space(key, credentials.as_ref()).await
    }

    pub async fn open(&self, key: &ShareKey, credentials: Option<Credentials>) -> Result<PathBuf> {
        key.validate()?;
        let credentials = credentials.or_else(|| self.credentials_for(key));
        self.backend.open(key, credentials.as_ref()).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Backend whose shares live under a local directory.
    pub struct LocalBackend {
        pub root: PathBuf,
        pub password: Option<String>,
        pub opened_with: Mutex<Vec<Option<Credentials>>>,
    }

    impl LocalBackend {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                password: None,
                opened_with: Mutex::new(Vec::new()),
            }
        }

        fn check(&self, credentials: Option<&Credentials>) -> Result<()> {
            match (&self.password, credentials) {
                (None, _) => Ok(()),
                (Some(p), Some(c)) if &c.password == p => Ok(()),
                _ => Err(Error::AuthenticationFailed("local".into())),
            }
        }
    }

    #[async_trait]
    impl ShareBackend for LocalBackend {
        async fn list_shares(&self, host: &str, credentials: Option<&Credentials>) -> Result<Vec<Share>> {
            self.check(credentials)?;
            if host == "offline" {
                return Err(Error::NotReachable(host.to_string()));
            }
            Ok(vec![
                share(host, "photos"),
                Share {
                    share_type: ShareType::Ipc,
                    ..share(host, "IPC$")
                },
            ])
        }

        async fn space(&self, share: &ShareKey, credentials: Option<&Credentials>) -> Result<SpaceStats> {
            self.check(credentials)?;
            if share.host == "offline" {
                return Err(Error::NotReachable(share.host.clone()));
            }
            Ok(SpaceStats {
                total: 1000,
                used: 400,
                available: 600,
            })
        }

        async fn open(&self, share: &ShareKey, credentials: Option<&Credentials>) -> Result<PathBuf> {
            self.opened_with.lock().push(credentials.cloned());
            self.check(credentials)?;
            let path = self.root.join(&share.name);
            tokio::fs::create_dir_all(&path).await?;
            Ok(path)
        }
    }

    #[derive(Default)]
    pub struct RecordingStore {
        pub saved: Mutex<Vec<Share>>,
        pub removed: Mutex<Vec<ShareKey>>,
    }

    #[async_trait]
    impl ShareStore for RecordingStore {
        async fn save_pinned(&self, share: &Share) -> Result<()> {
            self.saved.lock().push(share.clone());
            Ok(())
        }

        async fn remove_pinned(&self, key: &ShareKey) -> Result<()> {
            self.removed.lock().push(key.clone());
            Ok(())
        }
    }

    pub fn share(host: &str, name: &str) -> Share {
        Share {
            host: host.to_string(),
            name: name.to_string(),
            share_type: ShareType::Disk,
            pinned: false,
            comment: None,
            username: None,
        }
    }

    pub fn creds(password: &str) -> Credentials {
        Credentials {
            username: "alice".to_string(),
            password: password.to_string(),
        }
    }
}
