pub mod devices;
pub mod history;
pub mod probe;

pub use devices::{DeviceApi, DeviceDirectory, HttpDeviceApi};
pub use history::{ConnectionHistory, RecentConnection};
pub use probe::SystemPathProbe;

use crate::error::{Error, Result};
use crate::shares::Share;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    Wifi,
    Ethernet,
    Thunderbolt,
    Remote,
}

impl ConnectionMethod {
    /// Lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            ConnectionMethod::Thunderbolt => 0,
            ConnectionMethod::Ethernet => 1,
            ConnectionMethod::Wifi => 2,
            ConnectionMethod::Remote => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPath {
    pub method: ConnectionMethod,
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddresses {
    pub local: Option<IpAddr>,
    pub overlay: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub addresses: DeviceAddresses,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub shares: Vec<Share>,
}

impl Device {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("device id is empty"));
        }
        if self.addresses.local.is_none() && self.addresses.overlay.is_none() {
            return Err(Error::validation(format!(
                "device {} has no local or overlay address",
                self.id
            )));
        }
        Ok(())
    }
}

/// Enumerates the routes to a device that are reachable right now.
#[async_trait]
pub trait PathProbe: Send + Sync {
    async fn probe_paths(&self, device: &Device) -> Result<Vec<ConnectionPath>>;
}

/// Picks and confirms the best route to a device.
#[derive(Clone)]
pub struct PathResolver {
    probe: Arc<dyn PathProbe>,
}

impl PathResolver {
    pub fn new(probe: Arc<dyn PathProbe>) -> Self {
        Self { probe }
    }

    /// All viable routes, best first.
    pub async fn available_paths(&self, device: &Device) -> Result<Vec<ConnectionPath>> {
        device.validate()?;
        let mut paths = self.probe.probe_paths(device).await?;
        paths.sort_by_key(|p| p.method.priority());
        debug!(device = %device.id, "Found {} connection paths", paths.len());
        Ok(paths)
    }

    pub async fn current_path(&self, device: &Device) -> Result<Option<ConnectionPath>> {
        Ok(self.available_paths(device).await?.into_iter().next())
    }

    /// Poll `current_path` every `interval` until a route shows up.
    ///
    /// The deadline is checked before each poll, so a poll that starts just
    /// before `timeout` still runs to completion. Probe errors end the wait.
    pub async fn wait_for_ready(
        &self,
        device: &Device,
        timeout: Duration,
        interval: Duration,
    ) -> Result<ConnectionPath> {
        let started = Instant::now();

        loop {
            let elapsed = started.elapsed();
            if elapsed > timeout {
                return Err(Error::Timeout {
                    what: format!("connection path to {}", device.id),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }

            if let Some(path) = self.current_path(device).await? {
                info!(
                    device = %device.id,
                    "Connection ready via {:?} after {}ms",
                    path.method,
                    started.elapsed().as_millis()
                );
                return Ok(path);
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Callback form of [`wait_for_ready`](Self::wait_for_ready): exactly one
    /// of the two callbacks runs, once.
    pub async fn wait_for_ready_with<R, F>(
        &self,
        device: &Device,
        timeout: Duration,
        interval: Duration,
        on_ready: R,
        on_failed: F,
    ) where
        R: FnOnce(ConnectionPath),
        F: FnOnce(Error),
    {
        match self.wait_for_ready(device, timeout, interval).await {
            Ok(path) => on_ready(path),
            Err(e) => on_failed(e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolver(probe: ScriptedProbe) -> PathResolver {
        PathResolver::new(Arc::new(probe))
    }

    #[tokio::test]
    async fn ethernet_beats_remote() {
        let probe = ScriptedProbe::ready_after(
            Some(Duration::ZERO),
            vec![path(ConnectionMethod::Remote), path(ConnectionMethod::Ethernet)],
        );
        let current = resolver(probe).current_path(&device()).await.unwrap();
        assert_eq!(current.unwrap().method, ConnectionMethod::Ethernet);
    }

    #[tokio::test]
    async fn no_paths_means_absent() {
        let probe = ScriptedProbe::ready_after(None, Vec::new());
        assert!(resolver(probe).current_path(&device()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn device_without_addresses_is_rejected() {
        let probe = ScriptedProbe::ready_after(Some(Duration::ZERO), Vec::new());
        let mut bare = device();
        bare.addresses = DeviceAddresses::default();
        let err = resolver(probe).available_paths(&bare).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_fires_within_one_interval_of_availability() {
        let probe = ScriptedProbe::ready_after(
            Some(Duration::from_millis(1200)),
            vec![path(ConnectionMethod::Wifi)],
        );
        let started = Instant::now();
        let path = resolver(probe)
            .wait_for_ready(&device(), Duration::from_millis(3000), Duration::from_millis(500))
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert_eq!(path.method, ConnectionMethod::Wifi);
        assert!(elapsed >= Duration::from_millis(1200));
        assert!(elapsed <= Duration::from_millis(1700));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_nothing_appears() {
        let probe = ScriptedProbe::ready_after(None, Vec::new());
        let started = Instant::now();
        let err = resolver(probe)
            .wait_for_ready(&device(), Duration::from_millis(3000), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_ends_wait_immediately() {
        let mut probe = ScriptedProbe::ready_after(None, Vec::new());
        probe.fail = true;
        let started = Instant::now();
        let err = resolver(probe)
            .wait_for_ready(&device(), Duration::from_secs(30), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DaemonUnreachable);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    fn method() -> impl Strategy<Value = ConnectionMethod> {
        prop_oneof![
            Just(ConnectionMethod::Wifi),
            Just(ConnectionMethod::Ethernet),
            Just(ConnectionMethod::Thunderbolt),
            Just(ConnectionMethod::Remote),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn paths_come_back_in_priority_order(methods in proptest::collection::vec(method(), 0..8)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            let paths: Vec<_> = methods.iter().copied().map(path).collect();
            let sorted = rt.block_on(async {
                resolver(ScriptedProbe::ready_after(Some(Duration::ZERO), paths))
                    .available_paths(&device())
                    .await
                    .unwrap()
            });
            prop_assert_eq!(sorted.len(), methods.len());
            for pair in sorted.windows(2) {
                prop_assert!(pair[0].method.priority() <= pair[1].method.priority());
            }
        }

        #[test]
        fn exactly_one_callback_fires(
            timeout_ms in 0u64..3000,
            interval_ms in 1u64..700,
            ready_ms in proptest::option::of(0u64..4000),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let ready = Arc::new(AtomicUsize::new(0));
            let failed = Arc::new(AtomicUsize::new(0));
            let (ready_c, failed_c) = (ready.clone(), failed.clone());

            let elapsed = rt.block_on(async move {
                let probe = ScriptedProbe::ready_after(
                    ready_ms.map(Duration::from_millis),
                    vec![path(ConnectionMethod::Ethernet)],
                );
                let started = Instant::now();
                resolver(probe)
                    .wait_for_ready_with(
                        &device(),
                        Duration::from_millis(timeout_ms),
                        Duration::from_millis(interval_ms),
                        move |_| { ready_c.fetch_add(1, Ordering::SeqCst); },
                        move |e| {
                            assert_eq!(e.kind(), ErrorKind::Timeout);
                            failed_c.fetch_add(1, Ordering::SeqCst);
                        },
                    )
                    .await;
                started.elapsed()
            });

            let (r, f) = (ready.load(Ordering::SeqCst), failed.load(Ordering::SeqCst));
            prop_assert_eq!(r + f, 1);
            if r == 1 {
                prop_assert!(elapsed >= Duration::from_millis(ready_ms.unwrap()));
            } else {
                prop_assert!(elapsed >= Duration::from_millis(timeout_ms));
            }
            if let Some(at) = ready_ms {
                if at + interval_ms <= timeout_ms {
                    prop_assert_eq!(r, 1);
                }
            }
        }
    }
}
