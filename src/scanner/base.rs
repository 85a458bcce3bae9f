//! Shared scanner state: adapter identity, scan mode, last-seen clock,
//! discovered-device table, and connection-slot bookkeeping.

use std::collections::HashMap;

use crate::{service_info::ServiceInfo, Address};

/// Scan mode a scanner is operating in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ScanMode {
    /// Passive scanning: no scan-request/scan-response round trip.
    #[strum(serialize = "passive")]
    Passive,
    /// Active scanning: issues scan requests and collects scan responses.
    #[strum(serialize = "active")]
    Active,
    /// Not currently scanning.
    #[strum(serialize = "none")]
    None,
}

/// State shared by every concrete scanner (remote or local).
///
/// Invariant: `discovered[a].source() == self.source` for every `a`;
/// `connecting_count == connect_in_progress.len()` at every quiescent point.
#[derive(Debug)]
pub struct BaseScanner {
    adapter: String,
    source: String,
    connectable: bool,
    name: Option<String>,
    mode: ScanMode,
    scanning: bool,
    last_detection: f64,
    start_time: f64,
    connecting_count: usize,
    connect_failures: HashMap<Address, u32>,
    connect_in_progress: HashMap<Address, f64>,
    discovered: HashMap<Address, ServiceInfo>,
}

impl BaseScanner {
    /// Score weight for the in-progress-connections term.
    pub(crate) const K1: f64 = 2.0;
    /// Score weight for the prior-failures term.
    pub(crate) const K2: f64 = 0.5;

    /// Creates a new scanner state for `source` on `adapter`.
    pub fn new(adapter: impl Into<String>, source: impl Into<String>, connectable: bool, mode: ScanMode) -> Self {
        Self {
            adapter: adapter.into(),
            source: source.into(),
            connectable,
            name: None,
            mode,
            scanning: false,
            last_detection: 0.0,
            start_time: 0.0,
            connecting_count: 0,
            connect_failures: HashMap::new(),
            connect_in_progress: HashMap::new(),
            discovered: HashMap::new(),
        }
    }

    /// Stable source identifier (adapter MAC, or remote-scanner id).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Adapter identifier this scanner is attached to.
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    /// Whether advertisements from this scanner are connectable.
    pub fn connectable(&self) -> bool {
        self.connectable
    }

    /// Human-readable name of the adapter or remote scanner, if known.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sets the human-readable name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Current scan mode.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Sets the current scan mode.
    pub fn set_mode(&mut self, mode: ScanMode) {
        self.mode = mode;
    }

    /// Whether the scanner is currently actively scanning.
    pub fn scanning(&self) -> bool {
        self.scanning
    }

    /// Sets the scanning flag.
    pub fn set_scanning(&mut self, scanning: bool) {
        self.scanning = scanning;
    }

    /// Monotonic time the scanner was last started.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Records a scanner start at `now`.
    pub fn record_start(&mut self, now: f64) {
        self.start_time = now;
    }

    /// Seconds elapsed since the last accepted detection, as of `now`.
    pub fn time_since_last_detection(&self, now: f64) -> f64 {
        now - self.last_detection
    }

    /// Records that a detection was just accepted at `now`.
    pub fn record_detection(&mut self, now: f64) {
        self.last_detection = now;
    }

    /// Number of GATT connections currently in progress on this scanner.
    pub fn connections_in_progress(&self) -> usize {
        self.connecting_count
    }

    /// Number of prior connection failures recorded for `address`.
    pub fn connection_failures(&self, address: Address) -> u32 {
        self.connect_failures.get(&address).copied().unwrap_or(0)
    }

    /// Records that a connection attempt to `address` has begun.
    pub fn add_connecting(&mut self, address: Address, now: f64) {
        self.connect_in_progress.insert(address, now);
        self.connecting_count = self.connect_in_progress.len();
    }

    /// Records that a connection attempt to `address` has finished,
    /// `connected` indicating success.
    pub fn finished_connecting(&mut self, address: Address, connected: bool) {
        self.connect_in_progress.remove(&address);
        self.connecting_count = self.connect_in_progress.len();
        if !connected {
            *self.connect_failures.entry(address).or_insert(0) += 1;
        }
    }

    /// Clears all recorded connection failures and in-progress attempts.
    pub fn clear_connection_history(&mut self) {
        self.connect_failures.clear();
        self.connect_in_progress.clear();
        self.connecting_count = 0;
    }

    /// Returns the discovered-device table.
    pub fn discovered(&self) -> &HashMap<Address, ServiceInfo> {
        &self.discovered
    }

    /// Returns `(&ServiceInfo, &Advertisement)` for `address`, if discovered
    /// by this scanner.
    pub fn discovered_device_advertisement_data(
        &self, address: Address,
    ) -> Option<(&ServiceInfo, &crate::service_info::Advertisement)> {
        self.discovered.get(&address).map(|info| (info, info.advertisement()))
    }

    /// Records `info` as discovered by this scanner. `info.source()` must
    /// equal `self.source` — callers (scanner implementations) are
    /// responsible for constructing `info` with the right source.
    pub fn record_discovered(&mut self, address: Address, info: ServiceInfo) {
        debug_assert_eq!(info.source(), self.source, "discovered entry must be attributed to this scanner");
        self.discovered.insert(address, info);
    }

    /// Removes `address` from the discovered table, e.g. on expiry.
    pub fn remove_discovered(&mut self, address: Address) -> Option<ServiceInfo> {
        self.discovered.remove(&address)
    }

    /// Scores this scanner as a candidate connection path for a device with
    /// the given `rssi_diff` against `other`'s in-progress/failure counts
    /// already folded in by the caller.
    ///
    /// Higher wins; callers break ties by free-slot count then registration
    /// order.
    pub fn score_connection_paths(&self, rssi_diff: f64) -> f64 {
        rssi_diff - Self::K1 * self.connecting_count as f64 - Self::K2 * self.total_connect_failures() as f64
    }

    fn total_connect_failures(&self) -> u32 {
        self.connect_failures.values().sum()
    }
}
