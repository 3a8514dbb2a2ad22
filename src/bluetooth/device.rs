// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Device identity: hardware address, display name and transport kind.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth hardware address (`AA:BB:CC:DD:EE:FF`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The all-zero address.
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error returned when parsing an [`Address`] fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid Bluetooth address: {0}")]
pub struct InvalidAddress(pub String);

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(InvalidAddress(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(InvalidAddress(s.to_string()));
            }
            let decoded = hex::decode(part).map_err(|_| InvalidAddress(s.to_string()))?;
            *byte = decoded[0];
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which link handles a device. Fixed property of the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Classic,
    LowEnergy,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Classic => "classic",
            TransportKind::LowEnergy => "le",
        }
    }
}

/// A remote Bluetooth device.
///
/// Equality and hashing only look at the address; the name may change
/// between scans without making it a different device.
#[derive(Clone, Serialize, Deserialize)]
pub struct Device {
    pub address: Address,
    #[serde(default)]
    pub name: String,
    pub kind: TransportKind,
}

impl Device {
    pub fn new(address: Address, name: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            address,
            name: name.into(),
            kind,
        }
    }

    pub fn classic(address: Address, name: impl Into<String>) -> Self {
        Self::new(address, name, TransportKind::Classic)
    }

    pub fn low_energy(address: Address, name: impl Into<String>) -> Self {
        Self::new(address, name, TransportKind::LowEnergy)
    }

    pub fn is_low_energy(&self) -> bool {
        self.kind == TransportKind::LowEnergy
    }

    /// Name if known, otherwise the address.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.address.to_string()
        } else {
            self.name.clone()
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.name, self.address)
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self, self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let addr: Address = "00:11:22:aa:BB:cc".parse().unwrap();
        assert_eq!(addr, Address::new([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]));
        assert_eq!(addr.to_string(), "00:11:22:AA:BB:CC");
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("00:11:22:33:44".parse::<Address>().is_err());
        assert!("00:11:22:33:44:5".parse::<Address>().is_err());
        assert!("00:11:22:33:44:ZZ".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn test_device_identity_is_address() {
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let a = Device::classic(addr, "phone");
        let b = Device::classic(addr, "renamed");
        assert_eq!(a, b);
        assert_ne!(a, Device::classic(Address::new([1, 2, 3, 4, 5, 7]), "phone"));
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(Device::low_energy(addr, "").display_name(), "01:02:03:04:05:06");
        assert_eq!(Device::low_energy(addr, "tag").display_name(), "tag");
        assert!(Device::low_energy(addr, "tag").is_low_energy());
    }

    #[test]
    fn test_address_serde() {
        let addr = Address::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"DE:AD:BE:EF:00:01\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
