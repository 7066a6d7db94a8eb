pub mod monitor;
pub mod privilege;
pub mod system;

pub use system::SystemOverlayClient;

use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Narrow control contract for the locally installed overlay client.
///
/// Implementations talk to the real daemon; the manager layers caching,
/// state-machine checks and the health monitor on top.
#[async_trait]
pub trait OverlayClient: Send + Sync {
    /// `None` when the client is not installed.
    async fn installed_version(&self) -> Result<Option<String>>;

    async fn is_running(&self) -> Result<bool>;

    /// `Ok(None)` when the token exists but cannot be read. A token that
    /// does not exist yet is `Err(NotFound)`.
    async fn read_auth_token(&self) -> Result<Option<String>>;

    async fn has_capabilities(&self) -> Result<bool>;

    fn setcap_command(&self) -> String;

    async fn init_auth_token(&self) -> Result<String>;

    async fn install(&self) -> Result<()>;
    async fn uninstall(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    /// Source of truth for whether health monitoring is enabled.
    async fn monitoring(&self) -> Result<bool>;
    async fn set_monitoring(&self, enabled: bool) -> Result<()>;
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "token", rename_all = "snake_case")]
pub enum AuthTokenState {
    /// Not requested since start-up or since the last `init_auth_token`.
    #[default]
    Unchecked,
    /// Token exists but the current user cannot read it.
    Denied,
    Available(String),
}

impl std::fmt::Debug for AuthTokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthTokenState::Unchecked => f.write_str("Unchecked"),
            AuthTokenState::Denied => f.write_str("Denied"),
            AuthTokenState::Available(_) => f.write_str("Available(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayClientState {
    pub installed_version: Option<String>,
    pub running: bool,
    pub auth_token: AuthTokenState,
    pub has_capabilities: Option<bool>,
    pub monitoring: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    Uninstalled,
    Stopped,
    Running,
}

impl OverlayClientState {
    pub fn stage(&self) -> LifecycleStage {
        match (&self.installed_version, self.running) {
            (None, _) => LifecycleStage::Uninstalled,
            (Some(_), false) => LifecycleStage::Stopped,
            (Some(_), true) => LifecycleStage::Running,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum OverlayEvent {
    StateRefreshed(OverlayClientState),
    MonitorStopped,
}

#[derive(Default)]
pub(crate) struct MonitorSlot {
    pub(crate) generation: u64,
    pub(crate) handle: Option<tokio::task::AbortHandle>,
}

/// Owns the cached overlay client state and the process-wide health monitor.
#[derive(Clone)]
pub struct OverlayManager {
    client: Arc<dyn OverlayClient>,
    state: Arc<RwLock<OverlayClientState>>,
    monitor: Arc<Mutex<MonitorSlot>>,
    monitor_interval: Duration,
    event_tx: broadcast::Sender<OverlayEvent>,
}

impl OverlayManager {
    pub fn new(client: Arc<dyn OverlayClient>, monitor_interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            client,
            state: Arc::new(RwLock::new(OverlayClientState::default())),
            monitor: Arc::new(Mutex::new(MonitorSlot::default())),
            monitor_interval,
            event_tx,
        }
    }

    pub fn state(&self) -> OverlayClientState {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.event_tx.subscribe()
    }

    pub async fn check_installation(&self) -> Result<Option<String>> {
        let version = self.client.installed_version().await?;
        let mut state = self.state.write();
        state.installed_version = version.clone();
        if version.is_none() {
            state.running = false;
        }
        Ok(version)
    }

    pub async fn check_running(&self) -> Result<bool> {
        let running = self.client.is_running().await?;
        self.state.write().running = running;
        Ok(running)
    }

    /// `Ok(None)` means the token exists but reading it was denied.
    pub async fn get_auth_token(&self) -> Result<Option<String>> {
        let token = self.client.read_auth_token().await?;
        self.state.write().auth_token = match &token {
            Some(t) => AuthTokenState::Available(t.clone()),
            None => AuthTokenState::Denied,
        };
        Ok(token)
    }

    pub async fn check_capabilities(&self) -> Result<bool> {
        let capable = self.client.has_capabilities().await?;
        self.state.write().has_capabilities = Some(capable);
        Ok(capable)
    }

    pub fn setcap_command(&self) -> String {
        self.client.setcap_command()
    }

    /// Privileged. The cached token stays invalidated until the next refresh.
    pub async fn init_auth_token(&self) -> Result<String> {
        self.state.write().auth_token = AuthTokenState::Unchecked;
        let token = self.client.init_auth_token().await?;
        info!("Overlay auth token initialized");
        Ok(token)
    }

    pub async fn install(&self) -> Result<()> {
        if self.check_installation().await?.is_some() {
            info!("Overlay client already installed");
            return Ok(());
        }
        self.client.install().await?;
        let version = self.check_installation().await?;
        info!("Overlay client installed: {:?}", version);
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<()> {
        if self.check_installation().await?.is_none() {
            return Ok(());
        }
        self.client.uninstall().await?;
        let mut state = self.state.write();
        state.installed_version = None;
        state.running = false;
        state.auth_token = AuthTokenState::Unchecked;
        state.has_capabilities = None;
        info!("Overlay client uninstalled");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        if self.check_installation().await?.is_none() {
            return Err(Error::NotInstalled);
        }
        if self.check_running().await? {
            return Ok(());
        }
        self.client.start().await?;
        self.state.write().running = true;
        info!("Overlay client started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if self.check_installation().await?.is_none() {
            return Err(Error::NotInstalled);
        }
        if !self.check_running().await? {
            return Ok(());
        }
        self.client.stop().await?;
        self.state.write().running = false;
        info!("Overlay client stopped");
        Ok(())
    }

    /// Re-read installed, running, token and monitoring status from the client.
    pub async fn refresh(&self) -> Result<OverlayClientState> {
        let installed_version = self.client.installed_version().await?;
        let running = if installed_version.is_some() {
            self.client.is_running().await?
        } else {
            false
        };
        let auth_token = match self.client.read_auth_token().await {
            Ok(Some(token)) => AuthTokenState::Available(token),
            Ok(None) => AuthTokenState::Denied,
            Err(e) if e.kind() == ErrorKind::NotFound => AuthTokenState::Unchecked,
            Err(e) => {
                warn!("Could not read overlay auth token: {}", e);
                AuthTokenState::Unchecked
            }
        };
        let monitoring = self.client.monitoring().await?;

        let mut state = self.state.write();
        state.installed_version = installed_version;
        state.running = running;
        state.auth_token = auth_token;
        state.monitoring = monitoring;
        Ok(state.clone())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory overlay client with call counters.
    #[derive(Default)]
    pub struct FakeOverlayClient {
        pub installed: AtomicBool,
        pub running: AtomicBool,
        pub monitoring: AtomicBool,
        pub deny_elevation: AtomicBool,
        pub fail_monitor_signal: AtomicBool,
        pub token: Mutex<Option<Option<String>>>,
        pub running_probes: AtomicUsize,
        pub start_calls: AtomicUsize,
    }

    impl FakeOverlayClient {
        pub fn installed_and_stopped() -> Self {
            let client = Self::default();
            client.installed.store(true, Ordering::SeqCst);
            client
        }

        fn elevate(&self) -> Result<()> {
            if self.deny_elevation.load(Ordering::SeqCst) {
                return Err(Error::PermissionDenied("dismissed".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OverlayClient for FakeOverlayClient {
        async fn installed_version(&self) -> Result<Option<String>> {
            Ok(self
                .installed
                .load(Ordering::SeqCst)
                .then(|| "1.12.2".to_string()))
        }

        async fn is_running(&self) -> Result<bool> {
            self.running_probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.running.load(Ordering::SeqCst))
        }

        async fn read_auth_token(&self) -> Result<Option<String>> {
            match self.token.lock().clone() {
                Some(token) => Ok(token),
                None => Err(Error::not_found("auth token", "fake")),
            }
        }

        async fn has_capabilities(&self) -> Result<bool> {
            Ok(false)
        }

        fn setcap_command(&self) -> String {
            "sudo setcap cap_net_admin=+eip /fake".to_string()
        }

        async fn init_auth_token(&self) -> Result<String> {
            self.elevate()?;
            *self.token.lock() = Some(Some("secret".to_string()));
            Ok("secret".to_string())
        }

        async fn install(&self) -> Result<()> {
            self.elevate()?;
            self.installed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn uninstall(&self) -> Result<()> {
            self.elevate()?;
            self.installed.store(false, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            self.elevate()?;
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.elevate()?;
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn monitoring(&self) -> Result<bool> {
            Ok(self.monitoring.load(Ordering::SeqCst))
        }

        async fn set_monitoring(&self, enabled: bool) -> Result<()> {
            if !enabled && self.fail_monitor_signal.load(Ordering::SeqCst) {
                return Err(Error::DaemonUnreachable("socket closed".into()));
            }
            self.monitoring.store(enabled, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeOverlayClient;
    use super::*;
    use std::sync::atomic::Ordering;

    fn manager(client: Arc<FakeOverlayClient>) -> OverlayManager {
        OverlayManager::new(client, Duration::from_millis(1000))
    }

    #[tokio::test]
    async fn start_requires_installation() {
        let client = Arc::new(FakeOverlayClient::default());
        let overlay = manager(client.clone());

        let err = overlay.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInstalled);
        assert_eq!(overlay.state().stage(), LifecycleStage::Uninstalled);
        assert_eq!(client.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lifecycle_walks_install_start_stop() {
        let client = Arc::new(FakeOverlayClient::default());
        let overlay = manager(client.clone());

        overlay.install().await.unwrap();
        assert_eq!(overlay.state().stage(), LifecycleStage::Stopped);
        overlay.start().await.unwrap();
        assert_eq!(overlay.state().stage(), LifecycleStage::Running);
        overlay.stop().await.unwrap();
        assert_eq!(overlay.state().stage(), LifecycleStage::Stopped);
        overlay.uninstall().await.unwrap();
        assert_eq!(overlay.state().stage(), LifecycleStage::Uninstalled);
    }

    #[tokio::test]
    async fn refused_elevation_keeps_state() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        client.deny_elevation.store(true, Ordering::SeqCst);
        let overlay = manager(client.clone());

        let err = overlay.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(overlay.state().stage(), LifecycleStage::Stopped);

        // Not retried behind the caller's back.
        assert_eq!(client.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_states_are_distinct() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        let overlay = manager(client.clone());
        assert_eq!(overlay.state().auth_token, AuthTokenState::Unchecked);

        *client.token.lock() = Some(None);
        assert_eq!(overlay.get_auth_token().await.unwrap(), None);
        assert_eq!(overlay.state().auth_token, AuthTokenState::Denied);

        *client.token.lock() = Some(Some("abc".into()));
        assert_eq!(overlay.get_auth_token().await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn init_token_invalidates_cache_until_refresh() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        *client.token.lock() = Some(Some("old".into()));
        let overlay = manager(client.clone());
        overlay.get_auth_token().await.unwrap();

        let token = overlay.init_auth_token().await.unwrap();
        assert_eq!(token, "secret");
        assert_eq!(overlay.state().auth_token, AuthTokenState::Unchecked);

        let state = overlay.refresh().await.unwrap();
        assert_eq!(state.auth_token, AuthTokenState::Available("secret".into()));
    }

    #[test]
    fn token_is_redacted_in_debug_output() {
        let state = AuthTokenState::Available("hunter2".into());
        assert!(!format!("{:?}", state).contains("hunter2"));
    }
}
