//! Remote scanner: receives pre-parsed or raw advertisement payloads pushed
//! in by external transports.

use std::collections::HashMap;

use uuid::Uuid;

use crate::{
    error::{InternalErrorKind, Result},
    scanner::{BaseScanner, ScanMode, ScannerOps},
    service_info::ServiceInfo,
    Address, Error, UuidExt,
};

const AD_TYPE_SHORTENED_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

const AD_TYPES_UUID16: &[u8] = &[0x02, 0x03, 0x14];
const AD_TYPES_UUID32: &[u8] = &[0x04, 0x05, 0x1F, 0x20];
const AD_TYPES_UUID128: &[u8] = &[0x06, 0x07, 0x15];
const AD_TYPES_SERVICE_DATA16: u8 = 0x16;
const AD_TYPES_SERVICE_DATA128: u8 = 0x21;

/// Fields parsed out of a raw BLE AD-structure TLV payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAdvertisement {
    /// Advertised local name, if present.
    pub local_name: Option<String>,
    /// Advertised service UUIDs, in arrival order.
    pub service_uuids: Vec<Uuid>,
    /// Service-data payloads keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Manufacturer-data payloads keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Parses a raw BLE AD-structure TLV payload.
///
/// Each record is `len, type, value[len-1]`. A record with `len == 0`
/// terminates parsing (padding). The 32-bit service-UUID type code `0x20`
/// is also listed by the source as a service-data type; this parser
/// resolves the ambiguity in favor of the service-UUID interpretation (see
/// `DESIGN.md`).
pub fn parse_raw_advertisement(raw: &[u8]) -> Result<ParsedAdvertisement> {
    let mut parsed = ParsedAdvertisement::default();
    let mut pos = 0usize;

    while pos < raw.len() {
        let len = raw[pos] as usize;
        if len == 0 {
            break;
        }
        if pos + 1 + len > raw.len() {
            return Err(Error::new(crate::ErrorKind::Internal(InternalErrorKind::TruncatedAdStructure)));
        }
        let ad_type = raw[pos + 1];
        let value = &raw[pos + 2..pos + 1 + len];

        if ad_type == AD_TYPE_SHORTENED_LOCAL_NAME || ad_type == AD_TYPE_COMPLETE_LOCAL_NAME {
            parsed.local_name = Some(String::from_utf8_lossy(value).into_owned());
        } else if AD_TYPES_UUID16.contains(&ad_type) {
            for chunk in value.chunks_exact(2) {
                parsed.service_uuids.push(Uuid::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
            }
        } else if AD_TYPES_UUID32.contains(&ad_type) {
            for chunk in value.chunks_exact(4) {
                parsed.service_uuids.push(Uuid::from_u32(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])));
            }
        } else if AD_TYPES_UUID128.contains(&ad_type) {
            for chunk in value.chunks_exact(16) {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(chunk);
                bytes.reverse();
                parsed.service_uuids.push(Uuid::from_bytes(bytes));
            }
        } else if ad_type == AD_TYPES_SERVICE_DATA16 {
            if value.len() >= 2 {
                let uuid = Uuid::from_u16(u16::from_le_bytes([value[0], value[1]]));
                parsed.service_data.insert(uuid, value[2..].to_vec());
            }
        } else if ad_type == AD_TYPES_SERVICE_DATA128 {
            if value.len() >= 16 {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&value[..16]);
                bytes.reverse();
                parsed.service_data.insert(Uuid::from_bytes(bytes), value[16..].to_vec());
            }
        } else if ad_type == AD_TYPE_MANUFACTURER_DATA {
            if value.len() >= 2 {
                let company_id = u16::from_le_bytes([value[0], value[1]]);
                parsed.manufacturer_data.insert(company_id, value[2..].to_vec());
            }
        }

        pos += 1 + len;
    }

    Ok(parsed)
}

/// Direct-path advertisement fields accepted by [`RemoteScanner::on_advertisement`].
#[derive(Debug, Clone, Default)]
pub struct AdvertisementFields {
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Service-data payloads keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Manufacturer-data payloads keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Reported TX power, if present.
    pub tx_power: Option<i16>,
    /// Opaque platform-specific metadata passed alongside the advertisement
    /// by the caller; not derived from `raw`.
    pub details: Option<Vec<u8>>,
}

impl From<ParsedAdvertisement> for AdvertisementFields {
    fn from(p: ParsedAdvertisement) -> Self {
        Self {
            local_name: p.local_name,
            service_uuids: p.service_uuids,
            service_data: p.service_data,
            manufacturer_data: p.manufacturer_data,
            tx_power: None,
            details: None,
        }
    }
}

/// Scanner that receives advertisements pushed in by an external transport
/// rather than driving a local radio.
pub struct RemoteScanner {
    base: BaseScanner,
    expire_seconds: f64,
    previous_service_info: HashMap<Address, ServiceInfo>,
}

impl RemoteScanner {
    /// Creates a new remote scanner with the given expiry window.
    pub fn new(adapter: impl Into<String>, source: impl Into<String>, connectable: bool, expire_seconds: f64) -> Self {
        Self {
            base: BaseScanner::new(adapter, source, connectable, ScanMode::Passive),
            expire_seconds,
            previous_service_info: HashMap::new(),
        }
    }

    /// Scanner-reported expiry window, in seconds.
    pub fn expire_seconds(&self) -> f64 {
        self.expire_seconds
    }

    /// Parses `raw` and delegates to [`on_advertisement`](Self::on_advertisement).
    ///
    /// Parse failures are logged and absorbed: no `ServiceInfo` is
    /// published for a malformed raw payload, but the scanner otherwise
    /// continues operating normally. `details` is opaque platform metadata
    /// supplied by the caller; it isn't recovered from `raw` itself.
    pub fn on_raw_advertisement(
        &mut self, address: Address, rssi: i8, raw: &[u8], details: Option<Vec<u8>>, time: f64,
    ) -> Option<ServiceInfo> {
        match parse_raw_advertisement(raw) {
            Ok(parsed) => {
                let mut fields: AdvertisementFields = parsed.into();
                fields.tx_power = None;
                fields.details = details;
                Some(self.on_advertisement(address, rssi, fields, time, Some(raw.to_vec())))
            }
            Err(err) => {
                log::warn!("dropping malformed raw advertisement from {address}: {err}");
                None
            }
        }
    }

    /// Direct intake path: merges `fields` against this scanner's
    /// `previous_service_info` for `address` and publishes the merged
    /// record.
    pub fn on_advertisement(
        &mut self, address: Address, rssi: i8, fields: AdvertisementFields, time: f64, raw: Option<Vec<u8>>,
    ) -> ServiceInfo {
        let merged = match self.previous_service_info.get(&address) {
            Some(prev) if time - prev.time <= self.expire_seconds => self.merge(prev, fields),
            _ => fields,
        };

        let info = ServiceInfo::new(
            merged.local_name,
            address,
            rssi,
            merged.manufacturer_data,
            merged.service_data,
            merged.service_uuids,
            self.base.source(),
            raw,
            self.base.connectable(),
            time,
            merged.tx_power,
            merged.details,
        );

        self.previous_service_info.insert(address, info.clone());
        self.base.record_discovered(address, info.clone());
        self.base.record_detection(time);
        info
    }

    /// Carries forward `local_name`, `service_uuids`, `service_data`,
    /// `manufacturer_data`, and `details` from `prev` for any field left
    /// empty/absent in `new`. Manufacturer-data is carried forward
    /// per-company-id rather than wholesale: an id present in `new`
    /// supersedes `prev`'s entry for that id, and any id absent from `new`
    /// is carried forward unchanged.
    fn merge(&self, prev: &ServiceInfo, mut new: AdvertisementFields) -> AdvertisementFields {
        if new.local_name.is_none() {
            new.local_name = prev.name().map(str::to_string);
        }
        if new.service_uuids.is_empty() {
            new.service_uuids = prev.service_uuids().to_vec();
        }
        if new.service_data.is_empty() {
            new.service_data = prev.service_data().clone();
        }
        if new.tx_power.is_none() {
            new.tx_power = prev.tx_power();
        }
        if new.details.is_none() {
            new.details = prev.details().map(<[u8]>::to_vec);
        }
        for (company_id, payload) in prev.manufacturer_data() {
            new.manufacturer_data.entry(*company_id).or_insert_with(|| payload.clone());
        }
        new
    }

    /// Walks `previous_service_info`, removing and returning addresses whose
    /// last-accepted advertisement is older than `expire_seconds`.
    pub fn expire_devices(&mut self, now: f64) -> Vec<Address> {
        let expired: Vec<Address> = self
            .previous_service_info
            .iter()
            .filter(|(_, info)| now - info.time > self.expire_seconds)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &expired {
            self.previous_service_info.remove(addr);
            self.base.remove_discovered(*addr);
        }
        expired
    }
}

impl ScannerOps for RemoteScanner {
    fn base(&self) -> &BaseScanner {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseScanner {
        &mut self.base
    }
}
