//! JSON load/dump of manager history state.
//!
//! Layers `serde_json` on top of [`crate::manager::BluetoothManager::dump`]
//! and [`crate::manager::BluetoothManager::load`], which themselves stay
//! serialization-agnostic, keeping the wire codec separate from the
//! persisted-state encoding. CBOR is left as a follow-on (see
//! `DESIGN.md`); the logical schema (`mapping<address, ServiceInfo>`)
//! does not depend on the encoding chosen.

use std::collections::HashMap;

use crate::{
    error::{InternalErrorKind, Result},
    manager::BluetoothManager,
    service_info::ServiceInfo,
    Address, Error, ErrorKind,
};

/// Serializes `manager`'s current history to a JSON string.
pub fn dump_json(manager: &BluetoothManager) -> Result<String> {
    serde_json::to_string(&manager.dump())
        .map_err(|err| Error::with_message(ErrorKind::Internal(InternalErrorKind::MalformedPersistedState(err.to_string())), "failed to serialize history"))
}

/// Parses a JSON history document previously produced by [`dump_json`] and
/// reinjects it into `manager` via [`BluetoothManager::load`].
///
/// Restoring from disk never triggers expiry callbacks or reschedules
/// `last_detection` on any scanner — it only replays the cross-source
/// history maps.
pub fn load_json(manager: &mut BluetoothManager, json: &str) -> Result<()> {
    let history: HashMap<Address, ServiceInfo> = serde_json::from_str(json).map_err(|err| {
        Error::with_message(ErrorKind::Internal(InternalErrorKind::MalformedPersistedState(err.to_string())), "failed to parse history")
    })?;
    manager.load(history);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;

    #[test]
    fn dump_then_load_round_trips_history() {
        let mut manager = BluetoothManager::new(ManagerConfig::default());
        let info = ServiceInfo::new(
            Some("widget".to_string()),
            "AA:BB:CC:DD:EE:01".parse().unwrap(),
            -55,
            HashMap::new(),
            HashMap::new(),
            vec![],
            "s1",
            None,
            true,
            42.0,
            None,
            None,
        );
        manager.scanner_adv_received(info);

        let json = dump_json(&manager).unwrap();

        let mut restored = BluetoothManager::new(ManagerConfig::default());
        load_json(&mut restored, &json).unwrap();

        let addr: Address = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(restored.discovered_service_info(false).count(), 1);
        assert_eq!(restored.discovered_service_info(true).count(), 1);
        let info = restored.all_discovered_devices().find(|i| i.address() == addr).unwrap();
        assert_eq!(info.name(), Some("widget"));
    }

    #[test]
    fn load_rejects_malformed_json() {
        let mut manager = BluetoothManager::new(ManagerConfig::default());
        assert!(load_json(&mut manager, "not json").is_err());
    }
}
