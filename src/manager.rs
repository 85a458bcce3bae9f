//! Multi-scanner fan-in: source-selection, subscription dispatch, history
//! stores, and connection-slot allocation tracking.

use std::collections::{HashMap, HashSet};

use crate::{
    callback::{CallbackId, Registry},
    config::{ManagerConfig, APPLE_COMPANY_ID, FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS},
    error::Result,
    scanner::{BaseScanner, LocalScanner, RemoteScanner, ScannerOps},
    service_info::ServiceInfo,
    tracker::AdvertisementTracker,
    Address, Error, ErrorKind,
};

/// A registered scanner, held by the manager under its source id.
///
/// Rust has no subclassing, so this enum stands in for the source's
/// polymorphic scanner reference: manager code that only needs the shared
/// [`BaseScanner`] state goes through [`ScannerOps`]; code that needs
/// scanner-specific behavior (parsing, lifecycle) matches on the variant.
pub enum Scanner {
    /// A scanner fed by an external transport.
    Remote(RemoteScanner),
    /// A scanner driving a local radio.
    Local(LocalScanner),
}

impl ScannerOps for Scanner {
    fn base(&self) -> &BaseScanner {
        match self {
            Scanner::Remote(s) => s.base(),
            Scanner::Local(s) => s.base(),
        }
    }

    fn base_mut(&mut self) -> &mut BaseScanner {
        match self {
            Scanner::Remote(s) => s.base_mut(),
            Scanner::Local(s) => s.base_mut(),
        }
    }
}

/// Connection-slot accounting for one adapter.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    /// Total concurrent connection slots available on the adapter.
    pub slots: usize,
    /// Slots not currently occupied by an in-progress connection.
    pub free: usize,
    /// Addresses currently occupying a slot.
    pub allocated: HashSet<Address>,
}

impl Allocation {
    fn recompute_free(&mut self) {
        self.free = self.slots.saturating_sub(self.allocated.len());
    }
}

type AdvertisementCallback = dyn Fn(&ServiceInfo) + Send + Sync;
type UnavailableCallback = dyn Fn(&ServiceInfo) + Send + Sync;
type DisappearedCallback = dyn Fn(&Address) + Send + Sync;
type AllocationCallback = dyn Fn(&Allocation) + Send + Sync;
type ScannerRegistrationCallback = dyn Fn(&(String, bool)) + Send + Sync;

/// Aggregation and routing core: owns scanner registrations, cross-source
/// history, subscriber callback registries, and per-adapter connection-slot
/// allocations.
///
/// Must be driven from a single cooperative task: `scanner_adv_received`,
/// callback dispatch, and history mutation are synchronous and never
/// suspend.
pub struct BluetoothManager {
    config: ManagerConfig,
    all_history: HashMap<Address, ServiceInfo>,
    connectable_history: HashMap<Address, ServiceInfo>,
    sources: HashMap<String, Scanner>,
    allocations: HashMap<String, Allocation>,
    dirty_allocations: HashSet<String>,
    advertisement_tracker: AdvertisementTracker,
    /// Serialises adapter-recovery sequences fleet-wide: at most one
    /// concurrent recovery runs across all adapters. A recovery attempt
    /// that finds this already held is rejected outright rather than
    /// queued, since a queued second recovery would just race the first.
    recovery_lock: tokio::sync::Mutex<()>,

    bleak_callbacks: Registry<AdvertisementCallback>,
    unavailable_callbacks: HashMap<Address, Registry<UnavailableCallback>>,
    disappeared_callbacks: Registry<DisappearedCallback>,
    allocations_callbacks: HashMap<String, Registry<AllocationCallback>>,
    scanner_registration_callbacks: Registry<ScannerRegistrationCallback>,
}

impl BluetoothManager {
    /// Creates a new, empty manager with the given configuration.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            all_history: HashMap::new(),
            connectable_history: HashMap::new(),
            sources: HashMap::new(),
            allocations: HashMap::new(),
            dirty_allocations: HashSet::new(),
            advertisement_tracker: AdvertisementTracker::new(),
            recovery_lock: tokio::sync::Mutex::new(()),
            bleak_callbacks: Registry::new(),
            unavailable_callbacks: HashMap::new(),
            disappeared_callbacks: Registry::new(),
            allocations_callbacks: HashMap::new(),
            scanner_registration_callbacks: Registry::new(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ---- scanner registration ----

    /// Registers `scanner` under `source`, firing
    /// `scanner_registration_callbacks` with `(source, added=true)`.
    pub fn register_scanner(&mut self, source: impl Into<String>, scanner: Scanner) {
        let source = source.into();
        self.sources.insert(source.clone(), scanner);
        self.scanner_registration_callbacks.dispatch(&(source, true));
    }

    /// Unregisters the scanner for `source`, if any, firing
    /// `scanner_registration_callbacks` with `(source, added=false)` and
    /// re-running source-selection for every address it had discovered.
    pub fn unregister_scanner(&mut self, source: &str) {
        let Some(scanner) = self.sources.remove(source) else { return };
        self.scanner_registration_callbacks.dispatch(&(source.to_string(), false));

        let addresses: Vec<Address> = scanner.base().discovered().keys().copied().collect();
        for address in addresses {
            self.reselect_after_unregister(address, source);
        }
    }

    fn reselect_after_unregister(&mut self, address: Address, unregistered_source: &str) {
        let Some(current) = self.all_history.get(&address) else { return };
        if current.source() != unregistered_source {
            return;
        }

        let alternate = self
            .sources
            .values()
            .filter_map(|s| s.base().discovered().get(&address))
            .max_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal))
            .cloned();

        match alternate {
            Some(info) => {
                let connectable = info.connectable();
                self.all_history.insert(address, info.clone());
                if connectable {
                    self.connectable_history.insert(address, info);
                }
            }
            None => {
                self.all_history.remove(&address);
                self.connectable_history.remove(&address);
                self.advertisement_tracker.remove_address(address);
                self.disappeared_callbacks.dispatch(&address);
            }
        }
    }

    /// Returns the registered scanner for `source`, if any.
    pub fn scanner(&self, source: &str) -> Option<&Scanner> {
        self.sources.get(source)
    }

    /// Returns a mutable reference to the registered scanner for `source`,
    /// if any — used by the caller to feed it advertisements before pushing
    /// the result back through [`scanner_adv_received`](Self::scanner_adv_received).
    pub fn scanner_mut(&mut self, source: &str) -> Option<&mut Scanner> {
        self.sources.get_mut(source)
    }

    // ---- source-selection & dispatch ----

    fn effective_expiry(&self, address: Address) -> f64 {
        let measured = self
            .advertisement_tracker
            .interval(address)
            .or_else(|| self.advertisement_tracker.fallback_interval(address))
            .unwrap_or(self.config.default_stale_seconds);
        measured.max(FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS) + self.config.tracker_wobble_seconds
    }

    fn accepts(&self, new: &ServiceInfo, old: &ServiceInfo) -> bool {
        new.source() == old.source()
            || (new.rssi() as i32 - old.rssi() as i32) >= self.config.rssi_switch_threshold as i32
            || (new.time - old.time) > self.effective_expiry(new.address())
    }

    fn passes_apple_filter(&self, info: &ServiceInfo) -> bool {
        let Some(payload) = info.manufacturer_data().get(&APPLE_COMPANY_ID) else { return true };
        let apple_is_only_data = info.manufacturer_data().len() == 1 && info.service_data().is_empty();
        if !apple_is_only_data {
            return true;
        }
        matches!(payload.first(), Some(b) if self.config.apple_allowed_first_bytes.contains(b))
    }

    /// Applies the source-selection policy to a newly observed
    /// advertisement and, if accepted, updates history and dispatches to
    /// matching subscribers.
    ///
    /// Returns `true` if the advertisement was accepted into history.
    pub fn scanner_adv_received(&mut self, new: ServiceInfo) -> bool {
        let address = new.address();
        let accepted = match self.all_history.get(&address) {
            None => true,
            Some(old) => self.accepts(&new, old),
        };

        if !accepted {
            log::trace!("dropping advertisement for {address} from {} (source-selection policy)", new.source());
            return false;
        }

        self.advertisement_tracker.collect(address, new.source(), new.time);

        let connectable = new.connectable();
        self.all_history.insert(address, new.clone());
        if connectable {
            self.connectable_history.insert(address, new.clone());
        }

        if !self.passes_apple_filter(&new) {
            log::trace!("suppressing dispatch for {address}: Apple fast filter rejected");
            return true;
        }

        if !self.bleak_callbacks.is_empty() {
            self.bleak_callbacks.dispatch(&new);
        }
        true
    }

    // ---- subscriber registration ----

    /// Registers a callback invoked on every accepted, filter-passing
    /// advertisement. An empty `uuid_filters` matches everything.
    pub fn register_callback(
        &mut self, uuid_filters: Vec<uuid::Uuid>, callback: impl Fn(&ServiceInfo) + Send + Sync + 'static,
    ) -> CallbackId {
        let wrapped = move |info: &ServiceInfo| {
            if uuid_filters.is_empty() || info.service_uuids().iter().any(|u| uuid_filters.contains(u)) {
                callback(info);
            }
        };
        self.bleak_callbacks.register(Box::new(wrapped))
    }

    /// Cancels a previously registered advertisement callback.
    pub fn cancel_callback(&mut self, id: CallbackId) {
        self.bleak_callbacks.cancel(id);
    }

    /// Registers a callback invoked once when `address` is evicted as
    /// unavailable.
    pub fn register_unavailable_callback(
        &mut self, address: Address, callback: impl Fn(&ServiceInfo) + Send + Sync + 'static,
    ) -> CallbackId {
        self.unavailable_callbacks.entry(address).or_default().register(Box::new(callback))
    }

    /// Registers a callback invoked whenever a device disappears because
    /// its sole owning scanner was unregistered.
    pub fn register_disappeared_callback(&mut self, callback: impl Fn(&Address) + Send + Sync + 'static) -> CallbackId {
        self.disappeared_callbacks.register(Box::new(callback))
    }

    /// Registers a callback invoked whenever `adapter`'s allocation
    /// snapshot changes.
    pub fn register_allocation_callback(
        &mut self, adapter: impl Into<String>, callback: impl Fn(&Allocation) + Send + Sync + 'static,
    ) -> CallbackId {
        self.allocations_callbacks.entry(adapter.into()).or_default().register(Box::new(callback))
    }

    /// Registers a callback invoked on every scanner registration change,
    /// as `(source, added)`.
    pub fn register_scanner_registration_callback(
        &mut self, callback: impl Fn(&(String, bool)) + Send + Sync + 'static,
    ) -> CallbackId {
        self.scanner_registration_callbacks.register(Box::new(callback))
    }

    // ---- unavailable tracking & disappearance ----

    /// Runs one unavailable-tracking sweep: evicts addresses whose last
    /// accepted advertisement is older than their effective expiry, firing
    /// each address's `unavailable_callbacks`. Idempotent: a second call
    /// with no intervening advertisements evicts nothing further.
    pub fn sweep_unavailable(&mut self, now: f64) {
        let stale: Vec<Address> = self
            .all_history
            .iter()
            .filter(|(addr, info)| now - info.time > self.effective_expiry(**addr))
            .map(|(addr, _)| *addr)
            .collect();

        for address in stale {
            if let Some(info) = self.all_history.remove(&address) {
                self.connectable_history.remove(&address);
                self.advertisement_tracker.remove_address(address);
                if let Some(registry) = self.unavailable_callbacks.remove(&address) {
                    registry.dispatch(&info);
                }
            }
        }
    }

    // ---- connection-slot allocation ----

    /// Declares the number of concurrent connection slots available on
    /// `adapter`.
    pub fn set_adapter_slots(&mut self, adapter: impl Into<String>, slots: usize) {
        let adapter = adapter.into();
        let allocation = self.allocations.entry(adapter.clone()).or_default();
        allocation.slots = slots;
        allocation.recompute_free();
        self.dirty_allocations.insert(adapter);
    }

    /// Records that `address` has begun occupying a slot on `adapter`.
    pub fn add_connecting(&mut self, adapter: impl Into<String>, address: Address) {
        let adapter = adapter.into();
        let allocation = self.allocations.entry(adapter.clone()).or_default();
        allocation.allocated.insert(address);
        allocation.recompute_free();
        self.dirty_allocations.insert(adapter);
    }

    /// Records that `address`'s connection attempt on `adapter` has
    /// finished, freeing its slot regardless of outcome.
    pub fn finished_connecting(&mut self, adapter: impl Into<String>, address: Address) {
        let adapter = adapter.into();
        let allocation = self.allocations.entry(adapter.clone()).or_default();
        allocation.allocated.remove(&address);
        allocation.recompute_free();
        self.dirty_allocations.insert(adapter);
    }

    /// Replaces `adapter`'s allocated set wholesale, as reported by a
    /// `GET_CONNECTIONS` management-protocol completion.
    pub fn sync_allocation(&mut self, adapter: impl Into<String>, connected: HashSet<Address>) {
        let adapter = adapter.into();
        let allocation = self.allocations.entry(adapter.clone()).or_default();
        allocation.allocated = connected;
        allocation.recompute_free();
        self.dirty_allocations.insert(adapter);
    }

    /// Returns the current allocation snapshot for `adapter`, if known.
    pub fn allocation(&self, adapter: &str) -> Option<&Allocation> {
        self.allocations.get(adapter)
    }

    /// Fires `allocations_callbacks` exactly once for each adapter whose
    /// allocation changed since the last flush, coalescing any number of
    /// intervening mutations into a single notification per adapter. Call
    /// once per event-loop tick.
    pub fn flush_allocation_notifications(&mut self) {
        for adapter in self.dirty_allocations.drain().collect::<Vec<_>>() {
            if let (Some(allocation), Some(registry)) = (self.allocations.get(&adapter), self.allocations_callbacks.get(&adapter))
            {
                registry.dispatch(allocation);
            }
        }
    }

    // ---- queries ----

    /// All discovered devices, as `(device-handle-less) ServiceInfo`
    /// alongside its lazily materialized advertisement projection, across
    /// both connectable and non-connectable history.
    pub fn all_discovered_devices(&self) -> impl Iterator<Item = &ServiceInfo> {
        self.all_history.values()
    }

    /// Discovered service-info records, restricted to `connectable` history
    /// if true, or the full cross-source history otherwise.
    pub fn discovered_service_info(&self, connectable: bool) -> impl Iterator<Item = &ServiceInfo> {
        if connectable {
            self.connectable_history.values()
        } else {
            self.all_history.values()
        }
    }

    // ---- persistence primitives ----

    /// Returns a snapshot of `all_history` for serialization by [`crate::persist`].
    pub fn dump(&self) -> HashMap<Address, ServiceInfo> {
        self.all_history.clone()
    }

    /// Reinjects a previously dumped history snapshot. `connectable` is
    /// preserved per-entry; restoring from disk does not update
    /// `last_detection` on any scanner and does not trigger expiry
    /// callbacks, since no sweep runs as part of `load`.
    pub fn load(&mut self, history: HashMap<Address, ServiceInfo>) {
        for (address, info) in history {
            if info.connectable() {
                self.connectable_history.insert(address, info.clone());
            }
            self.all_history.insert(address, info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    fn info(source: &str, rssi: i8, time: f64) -> ServiceInfo {
        ServiceInfo::new(
            None,
            addr(),
            rssi,
            HashMap::new(),
            HashMap::new(),
            vec![],
            source,
            None,
            false,
            time,
            None,
            None,
        )
    }

    #[test]
    fn accepting_a_stronger_signal_switches_source() {
        let mut m = BluetoothManager::new(ManagerConfig::default());
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen1 = seen.clone();
        m.register_callback(vec![], move |i: &ServiceInfo| seen1.lock().unwrap().push(i.source().to_string()));

        assert!(m.scanner_adv_received(info("s1", -80, 100.0)));
        assert!(!m.scanner_adv_received(info("s2", -85, 100.5)));
        assert!(m.scanner_adv_received(info("s2", -60, 101.0)));

        assert_eq!(m.all_history.get(&addr()).unwrap().source(), "s2");
        assert_eq!(*seen.lock().unwrap(), vec!["s1", "s2"]);
    }

    #[test]
    fn a_stale_owning_source_loses_to_any_newer_advertisement() {
        let mut m = BluetoothManager::new(ManagerConfig::default());
        assert!(m.scanner_adv_received(info("s1", -70, 100.0)));
        assert!(m.scanner_adv_received(info("s2", -75, 200.0)));
        assert_eq!(m.all_history.get(&addr()).unwrap().source(), "s2");
    }

    #[test]
    fn apple_fast_filter_suppresses_dispatch_but_still_updates_history() {
        let mut m = BluetoothManager::new(ManagerConfig::default());
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls1 = calls.clone();
        m.register_callback(vec![], move |_: &ServiceInfo| {
            calls1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let mut mfg = HashMap::new();
        mfg.insert(APPLE_COMPANY_ID, vec![0x07, 0x00]);
        let rejected =
            ServiceInfo::new(None, addr(), -50, mfg, HashMap::new(), vec![], "s1", None, false, 10.0, None, None);
        assert!(m.scanner_adv_received(rejected));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(m.all_history.contains_key(&addr()));

        let mut mfg2 = HashMap::new();
        mfg2.insert(APPLE_COMPANY_ID, vec![0x02, 0x00]);
        let accepted =
            ServiceInfo::new(None, addr(), -50, mfg2, HashMap::new(), vec![], "s1", None, false, 200.0, None, None);
        assert!(m.scanner_adv_received(accepted));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn slot_allocation_notifications_coalesce_across_a_flush() {
        let mut m = BluetoothManager::new(ManagerConfig::default());
        let a1: Address = "AA:BB:CC:DD:EE:01".parse().unwrap();
        let a2: Address = "AA:BB:CC:DD:EE:02".parse().unwrap();
        m.set_adapter_slots("hci0", 4);

        let invocations = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let invocations1 = invocations.clone();
        m.register_allocation_callback("hci0", move |alloc: &Allocation| {
            invocations1.lock().unwrap().push(alloc.clone());
        });

        m.add_connecting("hci0", a1);
        m.add_connecting("hci0", a2);
        m.finished_connecting("hci0", a1);
        m.flush_allocation_notifications();

        let got = invocations.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].allocated, HashSet::from([a2]));
        assert_eq!(got[0].free, 3);
    }

    #[test]
    fn connectable_history_only_ever_holds_connectable_entries() {
        let mut m = BluetoothManager::new(ManagerConfig::default());
        let connectable_info = ServiceInfo::new(
            None,
            addr(),
            -50,
            HashMap::new(),
            HashMap::new(),
            vec![],
            "s1",
            None,
            true,
            1.0,
            None,
            None,
        );
        m.scanner_adv_received(connectable_info);
        let entry = m.connectable_history.get(&addr()).unwrap();
        assert!(entry.connectable());
        assert!(m.all_history.contains_key(&addr()));
    }

    #[test]
    fn a_second_sweep_with_no_new_advertisements_evicts_nothing_further() {
        let mut m = BluetoothManager::new(ManagerConfig::default());
        m.scanner_adv_received(info("s1", -50, 0.0));
        m.sweep_unavailable(1000.0);
        assert!(!m.all_history.contains_key(&addr()));
        m.sweep_unavailable(2000.0);
        assert!(m.all_history.is_empty());
    }
}
