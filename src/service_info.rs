//! Immutable per-advertisement record with a lazily materialized projection.
//!
//! `ServiceInfo` is constructed once, by a scanner, and is never mutated
//! afterwards — the only "mutation" is the interior cache for the lazily
//! computed [`Advertisement`] projection, which is the Rust rendition of a
//! lazy `@property` realized over a single-threaded cooperative event loop.

use std::{cell::OnceCell, collections::HashMap, fmt};

use uuid::Uuid;

use crate::Address;

/// A single manufacturer-data or service-data payload.
pub type DataMap<K> = HashMap<K, Vec<u8>>;

/// One immutable snapshot of a BLE advertisement, as observed by a scanner.
///
/// All fields are set once at construction; the record is treated as
/// immutable after publication.
#[derive(Clone)]
pub struct ServiceInfo {
    name: Option<String>,
    address: Address,
    rssi: i8,
    manufacturer_data: DataMap<u16>,
    service_data: DataMap<Uuid>,
    service_uuids: Vec<Uuid>,
    source: String,
    raw: Option<Vec<u8>>,
    connectable: bool,
    /// Monotonic observation time, in seconds.
    pub time: f64,
    tx_power: Option<i16>,
    /// Opaque platform/transport-specific metadata supplied by the scanner
    /// driver alongside the advertisement (e.g. connection handle hints or
    /// OS-specific discovery flags). Not interpreted by this crate.
    details: Option<Vec<u8>>,
    advertisement: OnceCell<Advertisement>,
}

impl ServiceInfo {
    /// Constructs a new record. Positional to keep the advertisement-arrival
    /// fast path allocation-free beyond the maps/vecs themselves.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: Option<String>, address: Address, rssi: i8, manufacturer_data: DataMap<u16>,
        service_data: DataMap<Uuid>, service_uuids: Vec<Uuid>, source: impl Into<String>, raw: Option<Vec<u8>>,
        connectable: bool, time: f64, tx_power: Option<i16>, details: Option<Vec<u8>>,
    ) -> Self {
        Self {
            name,
            address,
            rssi,
            manufacturer_data,
            service_data,
            service_uuids,
            source: source.into(),
            raw,
            connectable,
            time,
            tx_power,
            details,
            advertisement: OnceCell::new(),
        }
    }

    /// Device address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Local name, if advertised.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Received signal strength, in dBm.
    pub fn rssi(&self) -> i8 {
        self.rssi
    }

    /// Manufacturer-data map, keyed by company id.
    pub fn manufacturer_data(&self) -> &DataMap<u16> {
        &self.manufacturer_data
    }

    /// Service-data map, keyed by service UUID.
    pub fn service_data(&self) -> &DataMap<Uuid> {
        &self.service_data
    }

    /// Advertised service UUIDs, in arrival order.
    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }

    /// Stable id of the scanner that produced this record.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Raw advertisement bytes, if the scanner preserved them.
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    /// Whether the device was advertising in connectable mode.
    pub fn connectable(&self) -> bool {
        self.connectable
    }

    /// Reported TX power, if present.
    pub fn tx_power(&self) -> Option<i16> {
        self.tx_power
    }

    /// Opaque platform-specific metadata the scanner driver attached to this
    /// advertisement.
    pub fn details(&self) -> Option<&[u8]> {
        self.details.as_deref()
    }

    /// Returns the lazily materialized advertisement-data projection,
    /// computing and caching it on first access.
    pub fn advertisement(&self) -> &Advertisement {
        self.advertisement.get_or_init(|| Advertisement {
            local_name: self.name.clone(),
            service_uuids: self.service_uuids.clone(),
            service_data: self.service_data.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
            tx_power: self.tx_power,
            rssi: self.rssi,
        })
    }

    /// Returns a copy of this record converted to connectable, without
    /// re-parsing anything.
    ///
    /// Used when a connectable scanner re-observes a device previously seen
    /// only passively.
    pub fn into_connectable(self) -> Self {
        if self.connectable {
            return self;
        }
        Self {
            connectable: true,
            // the projection, if already materialized, is unaffected by connectability
            advertisement: self.advertisement,
            ..self
        }
    }
}

impl fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("ServiceInfo");
        d.field("address", &self.address)
            .field("name", &self.name)
            .field("rssi", &self.rssi)
            .field("source", &self.source)
            .field("connectable", &self.connectable)
            .field("time", &self.time)
            .field("service_uuids", &self.service_uuids)
            .field("manufacturer_data", &self.manufacturer_data)
            .field("service_data", &self.service_data)
            .field("tx_power", &self.tx_power);
        match &self.raw {
            Some(raw) if raw.len() > 32 => {
                d.field("raw", &format_args!("{} bytes: {}...", raw.len(), hex::encode(&raw[..32])));
            }
            Some(raw) => {
                d.field("raw", &format_args!("{}", hex::encode(raw)));
            }
            None => {
                d.field("raw", &Option::<()>::None);
            }
        }
        d.field("details", &self.details.as_ref().map(|bytes| bytes.len()));
        d.finish()
    }
}

impl serde::Serialize for ServiceInfo {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ServiceInfo", 12)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("address", &self.address)?;
        state.serialize_field("rssi", &self.rssi)?;
        state.serialize_field("manufacturer_data", &self.manufacturer_data)?;
        state.serialize_field("service_data", &self.service_data)?;
        state.serialize_field("service_uuids", &self.service_uuids)?;
        state.serialize_field("source", &self.source)?;
        state.serialize_field("raw", &self.raw)?;
        state.serialize_field("connectable", &self.connectable)?;
        state.serialize_field("time", &self.time)?;
        state.serialize_field("tx_power", &self.tx_power)?;
        state.serialize_field("details", &self.details)?;
        state.end()
    }
}

/// Plain data carrier mirroring [`ServiceInfo`]'s persisted fields, used only
/// to drive `#[derive(Deserialize)]` since `ServiceInfo` itself holds a
/// non-deserializable [`OnceCell`] cache.
#[derive(serde::Deserialize)]
struct ServiceInfoData {
    name: Option<String>,
    address: Address,
    rssi: i8,
    manufacturer_data: DataMap<u16>,
    service_data: DataMap<Uuid>,
    service_uuids: Vec<Uuid>,
    source: String,
    raw: Option<Vec<u8>>,
    connectable: bool,
    time: f64,
    tx_power: Option<i16>,
    #[serde(default)]
    details: Option<Vec<u8>>,
}

impl<'de> serde::Deserialize<'de> for ServiceInfo {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let data = ServiceInfoData::deserialize(deserializer)?;
        Ok(ServiceInfo::new(
            data.name,
            data.address,
            data.rssi,
            data.manufacturer_data,
            data.service_data,
            data.service_uuids,
            data.source,
            data.raw,
            data.connectable,
            data.time,
            data.tx_power,
            data.details,
        ))
    }
}

/// The parsed, subscriber-facing projection of a [`ServiceInfo`].
///
/// Materialised lazily; if `local_name` is absent it is `None`, not an
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Advertisement {
    /// Local name, if advertised.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Service-data map, keyed by service UUID.
    pub service_data: DataMap<Uuid>,
    /// Manufacturer-data map, keyed by company id.
    pub manufacturer_data: DataMap<u16>,
    /// Reported TX power, if present.
    pub tx_power: Option<i16>,
    /// Received signal strength, in dBm.
    pub rssi: i8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: Option<&str>) -> ServiceInfo {
        ServiceInfo::new(
            name.map(str::to_string),
            "AA:BB:CC:DD:EE:01".parse().unwrap(),
            -60,
            HashMap::new(),
            HashMap::new(),
            vec![],
            "s1",
            None,
            true,
            100.0,
            None,
            None,
        )
    }

    #[test]
    fn advertisement_is_materialized_lazily_and_cached() {
        let info = sample(Some("widget"));
        assert!(info.advertisement.get().is_none());
        let adv = info.advertisement();
        assert_eq!(adv.local_name.as_deref(), Some("widget"));
        assert!(info.advertisement.get().is_some());
    }

    #[test]
    fn absent_name_materializes_as_none_not_empty_string() {
        let info = sample(None);
        assert_eq!(info.advertisement().local_name, None);
    }

    #[test]
    fn into_connectable_preserves_all_fields() {
        let info = sample(Some("widget"));
        let rssi = info.rssi();
        let converted = info.into_connectable();
        assert!(converted.connectable());
        assert_eq!(converted.rssi(), rssi);
        assert_eq!(converted.name(), Some("widget"));
    }

    #[test]
    fn already_connectable_into_connectable_is_a_no_op() {
        let info = sample(None);
        assert!(info.connectable());
        let converted = info.into_connectable();
        assert!(converted.connectable());
    }

    #[test]
    fn serde_round_trip_preserves_fields() {
        let info = sample(Some("widget"));
        let json = serde_json::to_string(&info).unwrap();
        let restored: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.name(), Some("widget"));
        assert_eq!(restored.address(), info.address());
        assert_eq!(restored.rssi(), info.rssi());
        assert_eq!(restored.time, info.time);
    }

    #[test]
    fn details_round_trips_through_serde() {
        let mut info = sample(Some("widget"));
        info.details = Some(vec![0xAB, 0xCD]);
        let json = serde_json::to_string(&info).unwrap();
        let restored: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.details(), Some(&[0xAB, 0xCD][..]));
    }
}
