//! Advertisement cadence tracking.
//!
//! Tracks, per address, the most recent arrival timestamps and the current
//! owning source, and derives a measured advertising interval from the
//! gaps between arrivals. All operations here are infallible: malformed
//! input is absorbed and logged rather than rejected.

use std::collections::{HashMap, VecDeque};

use crate::{config::TRACKER_HISTORY_LEN, Address};

/// Tracks advertisement cadence and current source ownership per address.
#[derive(Debug, Default)]
pub struct AdvertisementTracker {
    timings: HashMap<Address, VecDeque<f64>>,
    sources: HashMap<Address, String>,
    intervals: HashMap<Address, f64>,
    fallback_intervals: HashMap<Address, f64>,
}

impl AdvertisementTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation of `address` at `time`, owned by `source`.
    ///
    /// Non-monotonic timestamps (earlier than the last recorded one) are
    /// still recorded — the tracker does not assume a monotonic clock
    /// across scanners, it only uses successive gaps to estimate interval.
    pub fn collect(&mut self, address: Address, source: &str, time: f64) {
        let history = self.timings.entry(address).or_default();
        if history.len() == TRACKER_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(time);
        self.sources.insert(address, source.to_string());

        if history.len() >= 2 {
            let mut min_gap = f64::INFINITY;
            for pair in history.make_contiguous().windows(2) {
                let gap = pair[1] - pair[0];
                if gap > 0.0 && gap < min_gap {
                    min_gap = gap;
                }
            }
            if min_gap.is_finite() {
                self.intervals.insert(address, min_gap);
            } else {
                log::debug!("address {address} produced no positive inter-arrival gap; timestamps may be non-monotonic");
            }
        }
    }

    /// Removes all tracked state for `address` (device expired or was
    /// explicitly dropped).
    pub fn remove_address(&mut self, address: Address) {
        self.timings.remove(&address);
        self.sources.remove(&address);
        self.intervals.remove(&address);
        self.fallback_intervals.remove(&address);
    }

    /// Returns the measured interval for `address`, if at least two samples
    /// have been collected.
    pub fn interval(&self, address: Address) -> Option<f64> {
        self.intervals.get(&address).copied()
    }

    /// Returns the source currently recorded as authoritative for `address`.
    pub fn current_source(&self, address: Address) -> Option<&str> {
        self.sources.get(&address).map(String::as_str)
    }

    /// Sets a per-address fallback interval, overriding the crate-wide
    /// default when no measured interval is yet available.
    pub fn set_fallback_interval(&mut self, address: Address, seconds: f64) {
        self.fallback_intervals.insert(address, seconds);
    }

    /// Returns the per-address fallback interval, if one was set.
    pub fn fallback_interval(&self, address: Address) -> Option<f64> {
        self.fallback_intervals.get(&address).copied()
    }

    /// Number of addresses currently tracked.
    pub fn len(&self) -> usize {
        self.timings.len()
    }

    /// Whether no addresses are currently tracked.
    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        format!("AA:BB:CC:DD:EE:{n:02X}").parse().unwrap()
    }

    #[test]
    fn single_sample_yields_no_interval() {
        let mut t = AdvertisementTracker::new();
        t.collect(addr(1), "s1", 100.0);
        assert_eq!(t.interval(addr(1)), None);
    }

    #[test]
    fn interval_is_minimum_successive_gap() {
        let mut t = AdvertisementTracker::new();
        t.collect(addr(1), "s1", 0.0);
        t.collect(addr(1), "s1", 1.0);
        t.collect(addr(1), "s1", 2.5);
        t.collect(addr(1), "s1", 3.0);
        assert_eq!(t.interval(addr(1)), Some(0.5));
    }

    #[test]
    fn history_is_bounded_to_six_entries() {
        let mut t = AdvertisementTracker::new();
        for i in 0..10 {
            t.collect(addr(1), "s1", i as f64);
        }
        assert_eq!(t.timings.get(&addr(1)).unwrap().len(), TRACKER_HISTORY_LEN);
    }

    #[test]
    fn remove_address_clears_all_maps() {
        let mut t = AdvertisementTracker::new();
        t.collect(addr(1), "s1", 0.0);
        t.set_fallback_interval(addr(1), 5.0);
        t.remove_address(addr(1));
        assert_eq!(t.interval(addr(1)), None);
        assert_eq!(t.current_source(addr(1)), None);
        assert_eq!(t.fallback_interval(addr(1)), None);
        assert!(t.is_empty());
    }

    #[test]
    fn per_address_fallback_overrides_default() {
        let mut t = AdvertisementTracker::new();
        t.set_fallback_interval(addr(1), 12.0);
        assert_eq!(t.fallback_interval(addr(1)), Some(12.0));
        assert_eq!(t.fallback_interval(addr(2)), None);
    }
}
