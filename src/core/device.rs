//! Devices: the door's view of how a pool can be reached.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Size of the on-the-wire device id.
pub const DEVICEID_SIZE: usize = 16;

/// Device id reserved for I/O routed through the door itself.
pub const MDS_DEVICE_ID: DeviceId = DeviceId(0);

/// Opaque device id. On the wire it is the 16-byte form, hex encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

#[derive(Debug, Error)]
#[error("invalid device id: {0:?}")]
pub struct DeviceIdError(String);

impl DeviceId {
    pub fn is_mds(&self) -> bool {
        *self == MDS_DEVICE_ID
    }

    /// Wire form: the id in network byte order, zero padded.
    pub fn to_bytes(&self) -> [u8; DEVICEID_SIZE] {
        let mut bytes = [0u8; DEVICEID_SIZE];
        bytes[..4].copy_from_slice(&self.0.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; DEVICEID_SIZE]) -> Self {
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[..4]);
        Self(u32::from_be_bytes(id))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    /// Parses the hex wire form. Only the leading four bytes carry the id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DeviceIdError(s.to_string());
        if s.len() != DEVICEID_SIZE * 2 || !s.is_ascii() {
            return Err(bad());
        }
        let mut bytes = [0u8; DEVICEID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| bad())?;
        }
        if bytes[4..].iter().any(|b| *b != 0) {
            return Err(bad());
        }
        Ok(Self::from_bytes(&bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let hex: String = self.to_bytes().iter().map(|b| format!("{:02x}", b)).collect();
        serializer.serialize_str(&hex)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutType {
    NfsV41Files,
    Osd2Objects,
    BlockVolume,
}

impl LayoutType {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::NfsV41Files),
            2 => Some(Self::Osd2Objects),
            3 => Some(Self::BlockVolume),
            _ => None,
        }
    }
}

/// Maps a device's address groups onto stripe indices.
pub trait StripingPattern: Send + Sync {
    fn pattern(&self, groups: &[Vec<SocketAddr>]) -> Vec<u32>;
}

/// Stripe `i` goes to address group `i`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinStripingPattern;

impl StripingPattern for RoundRobinStripingPattern {
    fn pattern(&self, groups: &[Vec<SocketAddr>]) -> Vec<u32> {
        (0..groups.len() as u32).collect()
    }
}

/// Files-layout device address: multipath groups plus stripe indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddr {
    pub layout_type: LayoutType,
    pub multipath: Vec<Vec<SocketAddr>>,
    pub stripe_indices: Vec<u32>,
}

impl DeviceAddr {
    /// All addresses of one pool form a single multipath group.
    pub fn files(pattern: &dyn StripingPattern, addresses: &[SocketAddr]) -> Self {
        let multipath = vec![addresses.to_vec()];
        let stripe_indices = pattern.pattern(&multipath);
        Self {
            layout_type: LayoutType::NfsV41Files,
            multipath,
            stripe_indices,
        }
    }
}

/// One incarnation of a pool as a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub addresses: Vec<SocketAddr>,
    pub addr: DeviceAddr,
    /// Zero when the pool does not send a verifier.
    pub verifier: u64,
}

impl Device {
    pub fn new(
        id: DeviceId,
        pattern: &dyn StripingPattern,
        addresses: Vec<SocketAddr>,
        verifier: u64,
    ) -> Self {
        let addr = DeviceAddr::files(pattern, &addresses);
        Self {
            id,
            addresses,
            addr,
            verifier,
        }
    }

    /// Whether a readiness report describes a new incarnation of this pool.
    ///
    /// The verifier is authoritative when the pool sends one; older pools
    /// send zero and are compared by address set instead.
    pub fn is_restarted(&self, addresses: &[SocketAddr], verifier: u64) -> bool {
        if verifier != 0 {
            return self.verifier != verifier;
        }
        self.addresses.as_slice() != addresses
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DS: {}, InetAddress: [", self.id)?;
        for (i, a) in self.addresses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", a)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn device_id_wire_form() {
        let id = DeviceId(0x01020304);
        let bytes = id.to_bytes();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert!(bytes[4..].iter().all(|b| *b == 0));
        assert_eq!(DeviceId::from_bytes(&bytes), id);
        assert!(MDS_DEVICE_ID.is_mds());
    }

    #[test]
    fn device_id_travels_as_sixteen_bytes() {
        let json = serde_json::to_value(DeviceId(0x01020304)).unwrap();
        assert_eq!(json, "01020304000000000000000000000000");
        assert_eq!(serde_json::from_value::<DeviceId>(json).unwrap(), DeviceId(0x01020304));

        assert!("0102".parse::<DeviceId>().is_err());
        assert!("zz020304000000000000000000000000".parse::<DeviceId>().is_err());
        // trailing bytes are padding and must stay zero
        assert!("01020304000000000000000000000001".parse::<DeviceId>().is_err());
        assert!(serde_json::from_value::<DeviceId>(serde_json::json!(1)).is_err());
    }

    #[test]
    fn files_address_has_one_group() {
        let addrs = vec![addr("10.0.0.1:2049"), addr("10.0.0.2:2049")];
        let da = DeviceAddr::files(&RoundRobinStripingPattern, &addrs);
        assert_eq!(da.multipath, vec![addrs]);
        assert_eq!(da.stripe_indices, vec![0]);
        assert_eq!(da.layout_type, LayoutType::NfsV41Files);
    }

    #[test]
    fn verifier_decides_restart_when_present() {
        let addrs = vec![addr("10.0.0.1:2049")];
        let dev = Device::new(DeviceId(1), &RoundRobinStripingPattern, addrs.clone(), 7);

        assert!(!dev.is_restarted(&addrs, 7));
        assert!(dev.is_restarted(&addrs, 9));
        // same verifier, moved address: still the same incarnation
        assert!(!dev.is_restarted(&[addr("10.0.0.9:2049")], 7));
    }

    #[test]
    fn address_set_decides_restart_without_verifier() {
        let addrs = vec![addr("10.0.0.1:2049")];
        let dev = Device::new(DeviceId(1), &RoundRobinStripingPattern, addrs.clone(), 0);

        assert!(!dev.is_restarted(&addrs, 0));
        assert!(dev.is_restarted(&[addr("10.0.0.2:2049")], 0));
    }
}
