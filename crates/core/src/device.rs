//! Device identity
//!
//! A device is identified by its `(name, id)` pair. The address and the
//! listen port are reachability hints that may change between sessions
//! without changing who the device is.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity part of a [`Device`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub name: String,
    pub id: String,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// A participant in a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Display name
    pub name: String,
    /// Stable unique identifier (hardware address or generated)
    pub id: String,
    /// Current reachable address, unknown until resolved
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Port the device's inbound listener is bound to
    #[serde(default)]
    pub listen_port: u16,
}

impl Device {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            address: None,
            listen_port: 0,
        }
    }

    /// Local identity with a generated id, for hosts without a stable hardware id
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, Uuid::new_v4().to_string())
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }

    /// True when `key` names this device
    pub fn is(&self, key: &DeviceKey) -> bool {
        self.name == key.name && self.id == key.id
    }

    /// Where this device's listener can be reached, if known
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address
            .map(|address| SocketAddr::new(address, self.listen_port))
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.id == other.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    #[test]
    fn test_identity_ignores_address() {
        let a = Device::new("pixel", "aa:bb")
            .with_address(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 2)))
            .with_listen_port(4000);
        let b = Device::new("pixel", "aa:bb")
            .with_address(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 7)))
            .with_listen_port(5000);

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_name_is_part_of_identity() {
        let a = Device::new("pixel", "aa:bb");
        let b = Device::new("galaxy", "aa:bb");
        assert_ne!(a, b);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_socket_addr_requires_address() {
        let device = Device::new("pixel", "aa:bb").with_listen_port(9999);
        assert!(device.socket_addr().is_none());

        let device = device.with_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            device.socket_addr(),
            Some(SocketAddr::from(([127, 0, 0, 1], 9999)))
        );
    }

    #[test]
    fn test_local_identity_is_unique() {
        let a = Device::local("me");
        let b = Device::local("me");
        assert_ne!(a, b);
        assert!(a.is(&a.key()));
    }

    #[test]
    fn test_json_shape() {
        let device = Device::new("pixel", "aa:bb").with_listen_port(4000);
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["name"], "pixel");
        assert_eq!(json["listen_port"], 4000);
        assert!(json["address"].is_null());
    }
}
