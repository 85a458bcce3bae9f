//! Multi-scanner BLE advertisement aggregation, source-selection and
//! connection-slot scheduling core.
//!
//! This crate fans advertisements in from one or more BLE scanners (remote,
//! over a transport such as ESPHome, or local, via the host's management
//! socket), picks the best-placed scanner to own each observed address,
//! dispatches matching advertisements to subscribers, expires addresses that
//! have gone quiet, and arbitrates GATT connection slots across scanners
//! that share an adapter.
//!
//! `BluetoothManager` and the scanner types in [`scanner`] are cooperative:
//! they are built to be driven from a single `tokio` task (typically the
//! task that also owns the manager's `tokio::select!` event loop). None of
//! the types here spawn their own background worker that call back into the
//! manager concurrently; timers and expiry sweeps are driven by the owner
//! polling `tokio::time::interval`s that the owner itself holds.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
};

use macaddr::MacAddr6;
use strum::{Display, EnumString};

pub mod callback;
pub mod config;
pub mod error;
pub mod manager;
pub mod mgmt;
pub mod persist;
pub mod scanner;
pub mod service_info;
pub mod tracker;
mod uuid_ext;

pub use error::{Error, ErrorKind, InternalErrorKind, Result};
pub use uuid_ext::UuidExt;

/// Bluetooth device address.
///
/// The serialized representation is a string in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde::Serialize::serialize(&self.to_string(), serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Bluetooth device address type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum AddressType {
    /// Classic Bluetooth (BR/EDR) address.
    #[strum(serialize = "br/edr")]
    BrEdr = 0,
    /// Bluetooth Low Energy (LE) public address.
    #[strum(serialize = "public")]
    LePublic = 1,
    /// Bluetooth Low Energy (LE) random address.
    #[strum(serialize = "random")]
    LeRandom = 2,
}

impl Default for AddressType {
    fn default() -> Self {
        Self::LePublic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display_and_parse() {
        let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let s = addr.to_string();
        assert_eq!(s, "AA:BB:CC:DD:EE:FF");
        assert_eq!(s.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn address_from_str_rejects_malformed_input() {
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE".parse::<Address>().is_err());
    }

    #[test]
    fn address_type_default_is_le_public() {
        assert_eq!(AddressType::default(), AddressType::LePublic);
    }
}
