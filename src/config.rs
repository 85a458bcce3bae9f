//! Tunable constants for the manager, grouped into a single options struct.
//!
//! Plain `Default`-implementing options struct constructed with
//! struct-update syntax rather than a fluent builder.

use std::time::Duration;

/// Fallback interval used when an address has no measured cadence and no
/// per-address override.
pub const DEFAULT_STALE_SECONDS: f64 = 60.0;

/// RSSI delta (in dBm) that alone is sufficient to switch source ownership
/// of an address, regardless of staleness.
pub const DEFAULT_RSSI_SWITCH_THRESHOLD: i8 = 16;

/// Extra slack added on top of the measured/fallback interval to absorb
/// scheduler jitter before declaring an address stale.
pub const DEFAULT_TRACKER_WOBBLE_SECONDS: f64 = 3.0;

/// Hard floor under which `stale_seconds` never falls, even if the tracked
/// interval is smaller.
pub const FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS: f64 = 60.0;

/// Apple (company id `0x004C`) manufacturer-data first bytes considered
/// interesting enough to dispatch to subscribers.
pub const DEFAULT_APPLE_ALLOWED_FIRST_BYTES: &[u8] = &[0x02, 0x05, 0x06, 0x10, 0x12];

/// Apple company id used by the manufacturer-data fast filter.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Local-scanner watchdog poll cadence.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Local-scanner quiescence threshold before the watchdog restarts scanning.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(90);

/// Cadence of the manager's unavailable-tracking sweep.
pub const UNAVAILABLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Number of recent arrival timestamps an [`crate::tracker::AdvertisementTracker`] retains per address.
pub const TRACKER_HISTORY_LEN: usize = 6;

/// Configuration for a [`crate::manager::BluetoothManager`].
///
/// Constructed with struct-update syntax over [`Default::default`], e.g.
///
/// ```
/// use blecore::config::ManagerConfig;
/// let config = ManagerConfig { rssi_switch_threshold: 20, ..Default::default() };
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Fallback staleness interval (seconds) used when no cadence has been measured yet.
    pub default_stale_seconds: f64,
    /// RSSI delta (dBm) that alone justifies a source switch.
    pub rssi_switch_threshold: i8,
    /// Wobble (seconds) added atop the measured/fallback interval.
    pub tracker_wobble_seconds: f64,
    /// Apple manufacturer-data first bytes considered interesting.
    pub apple_allowed_first_bytes: Vec<u8>,
    /// Local-scanner watchdog poll cadence.
    pub watchdog_interval: Duration,
    /// Local-scanner quiescence timeout.
    pub watchdog_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_stale_seconds: DEFAULT_STALE_SECONDS,
            rssi_switch_threshold: DEFAULT_RSSI_SWITCH_THRESHOLD,
            tracker_wobble_seconds: DEFAULT_TRACKER_WOBBLE_SECONDS,
            apple_allowed_first_bytes: DEFAULT_APPLE_ALLOWED_FIRST_BYTES.to_vec(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_the_documented_constants() {
        let config = ManagerConfig::default();
        assert_eq!(config.rssi_switch_threshold, 16);
        assert_eq!(config.tracker_wobble_seconds, 3.0);
        assert_eq!(config.apple_allowed_first_bytes, vec![0x02, 0x05, 0x06, 0x10, 0x12]);
    }

    #[test]
    fn struct_update_syntax_overrides_single_field() {
        let config = ManagerConfig { rssi_switch_threshold: 8, ..Default::default() };
        assert_eq!(config.rssi_switch_threshold, 8);
        assert_eq!(config.default_stale_seconds, DEFAULT_STALE_SECONDS);
    }
}
