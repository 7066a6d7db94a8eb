//! Periodic health refresh of the overlay client.
//!
//! The timer handle is owned by [`OverlayManager`]; at most one refresh loop
//! exists per manager. The loop disables itself when the client reports that
//! monitoring was turned off elsewhere.

use super::{OverlayEvent, OverlayManager};
use crate::error::Result;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

impl OverlayManager {
    /// Replace any running monitor with a fresh one.
    pub async fn start_monitor(&self) -> Result<()> {
        self.cancel_timer();

        self.client.set_monitoring(true).await?;
        self.state.write().monitoring = true;

        let mut slot = self.monitor.lock();
        slot.generation += 1;
        let generation = slot.generation;

        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.monitor_loop(generation).await });

        // A concurrent start may have slipped in while we awaited the client.
        if let Some(previous) = slot.handle.replace(handle.abort_handle()) {
            previous.abort();
        }

        info!(
            "Overlay monitor started (interval {}ms)",
            self.monitor_interval.as_millis()
        );
        Ok(())
    }

    /// Cancel the local timer, then ask the client to stop monitoring.
    /// A failing client signal is logged, never returned.
    pub async fn stop_monitor(&self) {
        self.cancel_timer();
        self.state.write().monitoring = false;

        if let Err(e) = self.client.set_monitoring(false).await {
            warn!("Overlay client did not acknowledge monitor stop: {}", e);
        }

        let _ = self.event_tx.send(OverlayEvent::MonitorStopped);
        info!("Overlay monitor stopped");
    }

    /// Cancel the local timer only. The client keeps its monitoring flag,
    /// so the next start-up resumes the monitor.
    pub fn halt_monitor(&self) {
        self.cancel_timer();
    }

    pub fn monitor_active(&self) -> bool {
        self.monitor
            .lock()
            .handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.monitor.lock().handle.take() {
            handle.abort();
            debug!("Cancelled previous overlay monitor");
        }
    }

    async fn monitor_loop(self, generation: u64) {
        let mut ticker = tokio::time::interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.refresh().await {
                Ok(state) => {
                    let monitoring = state.monitoring;
                    let _ = self.event_tx.send(OverlayEvent::StateRefreshed(state));
                    if !monitoring {
                        info!("Monitoring disabled by the overlay client, stopping timer");
                        break;
                    }
                }
                Err(e) => warn!("Overlay health refresh failed: {}", e),
            }
        }

        {
            let mut slot = self.monitor.lock();
            if slot.generation == generation {
                slot.handle = None;
            }
        }
        self.state.write().monitoring = false;
        let _ = self.event_tx.send(OverlayEvent::MonitorStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeOverlayClient;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager(client: Arc<FakeOverlayClient>) -> OverlayManager {
        OverlayManager::new(client, Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_leaves_one_timer() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        let overlay = manager(client.clone());

        overlay.start_monitor().await.unwrap();
        overlay.start_monitor().await.unwrap();

        // Ticks at 0, 1000 and 2000ms.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(client.running_probes.load(Ordering::SeqCst), 3);
        assert!(overlay.monitor_active());

        overlay.stop_monitor().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timer() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        let overlay = manager(client.clone());

        overlay.start_monitor().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        overlay.stop_monitor().await;
        let probes = client.running_probes.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(client.running_probes.load(Ordering::SeqCst), probes);
        assert!(!overlay.monitor_active());
        assert!(!client.monitoring.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn halt_keeps_client_flag() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        let overlay = manager(client.clone());

        overlay.start_monitor().await.unwrap();
        overlay.halt_monitor();
        assert!(!overlay.monitor_active());
        assert!(client.monitoring.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resolves_when_client_signal_fails() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        client.fail_monitor_signal.store(true, Ordering::SeqCst);
        let overlay = manager(client.clone());

        overlay.start_monitor().await.unwrap();
        overlay.stop_monitor().await;
        assert!(!overlay.monitor_active());
        assert!(!overlay.state().monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_disables_itself_after_external_stop() {
        let client = Arc::new(FakeOverlayClient::installed_and_stopped());
        let overlay = manager(client.clone());
        let mut events = overlay.subscribe();

        overlay.start_monitor().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Turned off behind the manager's back.
        client.monitoring.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!overlay.monitor_active());

        let probes = client.running_probes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(client.running_probes.load(Ordering::SeqCst), probes);

        let mut saw_stop = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, OverlayEvent::MonitorStopped) {
                saw_stop = true;
            }
        }
        assert!(saw_stop);
    }
}
