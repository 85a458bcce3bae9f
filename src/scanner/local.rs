//! Local scanner: drives an OS radio, owning a start/stop lifecycle and
//! watchdog recovery.

use tokio::sync::Mutex;

use crate::{
    config::{DEFAULT_WATCHDOG_INTERVAL, DEFAULT_WATCHDOG_TIMEOUT},
    error::Result,
    scanner::{BaseScanner, ScanMode, ScannerOps},
    service_info::ServiceInfo,
    Address, Error, ErrorKind,
};

/// Lifecycle state of a [`LocalScanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerLifecycle {
    /// Not scanning, no start in progress.
    Idle,
    /// A start attempt is in progress.
    Starting,
    /// Actively or passively scanning.
    Scanning,
    /// A stop attempt is in progress.
    Stopping,
    /// The scanner failed to start and requires operator intervention.
    Failed,
}

/// Scanner that drives a local (host) BLE radio.
///
/// `start`/`stop` serialise through [`start_stop_lock`](Self::start_stop_lock),
/// held only across the critical section rather than across any await that
/// an external caller might cancel.
pub struct LocalScanner {
    base: BaseScanner,
    lifecycle: ScannerLifecycle,
    watchdog_interval: std::time::Duration,
    watchdog_timeout: std::time::Duration,
    start_stop_lock: Mutex<()>,
}

impl LocalScanner {
    /// Creates a new, idle local scanner.
    pub fn new(adapter: impl Into<String>, connectable: bool) -> Self {
        let adapter = adapter.into();
        Self {
            base: BaseScanner::new(adapter.clone(), adapter, connectable, ScanMode::None),
            lifecycle: ScannerLifecycle::Idle,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            start_stop_lock: Mutex::new(()),
        }
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> ScannerLifecycle {
        self.lifecycle
    }

    /// Watchdog poll cadence.
    pub fn watchdog_interval(&self) -> std::time::Duration {
        self.watchdog_interval
    }

    /// Overrides the watchdog poll cadence and quiescence timeout.
    pub fn set_watchdog(&mut self, interval: std::time::Duration, timeout: std::time::Duration) {
        self.watchdog_interval = interval;
        self.watchdog_timeout = timeout;
    }

    /// Attempts to start scanning in `mode`.
    ///
    /// `try_start` is the driver call supplied by the caller (the OS-level
    /// scanner driver is out of scope for this crate); it
    /// returns `Ok(())` on success. On failure while starting in
    /// [`ScanMode::Active`], a single passive-mode retry is attempted before
    /// surfacing [`ErrorKind::ScannerStartFailed`] and entering
    /// [`ScannerLifecycle::Failed`].
    pub async fn start(&mut self, mode: ScanMode, now: f64, try_start: impl Fn(ScanMode) -> Result<()>) -> Result<()> {
        let _guard = self.start_stop_lock.lock().await;
        self.lifecycle = ScannerLifecycle::Starting;

        match try_start(mode) {
            Ok(()) => {
                self.base.set_mode(mode);
                self.base.set_scanning(true);
                self.base.record_start(now);
                self.base.record_detection(now);
                self.lifecycle = ScannerLifecycle::Scanning;
                Ok(())
            }
            Err(first_err) if mode == ScanMode::Active => {
                log::warn!("active scan start failed on {}, retrying passive: {first_err}", self.base.source());
                match try_start(ScanMode::Passive) {
                    Ok(()) => {
                        self.base.set_mode(ScanMode::Passive);
                        self.base.set_scanning(true);
                        self.base.record_start(now);
                        self.base.record_detection(now);
                        self.lifecycle = ScannerLifecycle::Scanning;
                        Ok(())
                    }
                    Err(second_err) => {
                        self.lifecycle = ScannerLifecycle::Failed;
                        Err(Error::with_message(ErrorKind::ScannerStartFailed, second_err.to_string()))
                    }
                }
            }
            Err(err) => {
                self.lifecycle = ScannerLifecycle::Failed;
                Err(Error::with_message(ErrorKind::ScannerStartFailed, err.to_string()))
            }
        }
    }

    /// Stops scanning. If a start was in progress, cancels it and forces
    /// [`ScannerLifecycle::Idle`].
    pub async fn stop(&mut self, try_stop: impl FnOnce() -> Result<()>) -> Result<()> {
        let _guard = self.start_stop_lock.lock().await;
        if self.lifecycle == ScannerLifecycle::Starting {
            self.lifecycle = ScannerLifecycle::Idle;
            self.base.set_scanning(false);
            return Ok(());
        }
        self.lifecycle = ScannerLifecycle::Stopping;
        let result = try_stop();
        self.base.set_scanning(false);
        self.base.set_mode(ScanMode::None);
        self.lifecycle = ScannerLifecycle::Idle;
        result
    }

    /// Polls the watchdog: if quiescent for longer than the watchdog
    /// timeout, returns `true` to signal the caller should restart scanning
    /// (`stopping → idle → starting`).
    pub fn poll_watchdog(&mut self, now: f64) -> bool {
        if self.lifecycle != ScannerLifecycle::Scanning {
            return false;
        }
        let quiet_for = self.base.time_since_last_detection(now);
        if quiet_for > self.watchdog_timeout.as_secs_f64() {
            log::warn!(
                "scanner {} quiet for {quiet_for:.1}s (timeout {:.1}s), requesting restart",
                self.base.source(),
                self.watchdog_timeout.as_secs_f64()
            );
            self.lifecycle = ScannerLifecycle::Stopping;
            true
        } else {
            false
        }
    }

    /// Invoked by the owning event loop for each advertisement observed by
    /// the local radio. Constructs the [`ServiceInfo`] and records it in the
    /// discovered table.
    #[allow(clippy::too_many_arguments)]
    pub fn on_detection(
        &mut self, address: Address, rssi: i8, fields: super::remote::AdvertisementFields, now: f64,
        raw: Option<Vec<u8>>,
    ) -> ServiceInfo {
        let info = ServiceInfo::new(
            fields.local_name,
            address,
            rssi,
            fields.manufacturer_data,
            fields.service_data,
            fields.service_uuids,
            self.base.source(),
            raw,
            self.base.connectable(),
            now,
            fields.tx_power,
            fields.details,
        );
        self.base.record_discovered(address, info.clone());
        self.base.record_detection(now);
        info
    }
}

impl ScannerOps for LocalScanner {
    fn base(&self) -> &BaseScanner {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseScanner {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_success_transitions_to_scanning() {
        let mut scanner = LocalScanner::new("hci0", true);
        scanner.start(ScanMode::Active, 0.0, |_| Ok(())).await.unwrap();
        assert_eq!(scanner.lifecycle(), ScannerLifecycle::Scanning);
        assert_eq!(scanner.base().mode(), ScanMode::Active);
    }

    #[tokio::test]
    async fn active_start_failure_falls_back_to_passive() {
        let mut scanner = LocalScanner::new("hci0", true);
        scanner
            .start(ScanMode::Active, 0.0, |mode| {
                if mode == ScanMode::Active {
                    Err(Error::new(ErrorKind::ScannerStartFailed))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(scanner.lifecycle(), ScannerLifecycle::Scanning);
        assert_eq!(scanner.base().mode(), ScanMode::Passive);
    }

    #[tokio::test]
    async fn double_failure_surfaces_scanner_start_failed() {
        let mut scanner = LocalScanner::new("hci0", true);
        let result = scanner.start(ScanMode::Active, 0.0, |_| Err(Error::new(ErrorKind::ScannerStartFailed))).await;
        assert!(result.is_err());
        assert_eq!(scanner.lifecycle(), ScannerLifecycle::Failed);
    }

    #[tokio::test]
    async fn stop_during_starting_forces_idle() {
        let mut scanner = LocalScanner::new("hci0", true);
        scanner.lifecycle = ScannerLifecycle::Starting;
        scanner.stop(|| Ok(())).await.unwrap();
        assert_eq!(scanner.lifecycle(), ScannerLifecycle::Idle);
    }

    #[tokio::test]
    async fn watchdog_fires_after_timeout() {
        let mut scanner = LocalScanner::new("hci0", true);
        scanner.set_watchdog(std::time::Duration::from_secs(30), std::time::Duration::from_secs(90));
        scanner.start(ScanMode::Passive, 0.0, |_| Ok(())).await.unwrap();
        assert!(!scanner.poll_watchdog(50.0));
        assert!(scanner.poll_watchdog(100.0));
        assert_eq!(scanner.lifecycle(), ScannerLifecycle::Stopping);
    }
}
