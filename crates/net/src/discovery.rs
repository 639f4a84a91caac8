//! Discovery/formation substrate seen by the sessions
//!
//! Sessions never discover peers themselves. They issue commands through a
//! [`DiscoveryAdapter`] and react to the [`AdapterEvent`]s it publishes.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use tether_core::{Device, DeviceKey};
use tokio::sync::broadcast;

use crate::error::DiscoveryError;

/// TXT key carrying the protocol identifier
pub const PROP_SERVICE_KIND: &str = "serviceKind";
/// TXT key carrying the owner's listen port
pub const PROP_LISTEN_PORT: &str = "listenPort";
/// TXT key carrying the human-chosen group name
pub const PROP_GROUP_LABEL: &str = "groupLabel";

/// Attributes an owner advertises with its service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAttributes {
    pub service_kind: String,
    pub listen_port: u16,
    pub group_label: String,
    /// Custom properties supplied by the application
    pub extra: BTreeMap<String, String>,
}

impl ServiceAttributes {
    /// Flatten into TXT-record style key/value pairs
    pub fn to_properties(&self) -> Vec<(String, String)> {
        let mut properties: Vec<(String, String)> = self
            .extra
            .iter()
            .filter(|(k, _)| !is_reserved(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        properties.push((PROP_SERVICE_KIND.to_string(), self.service_kind.clone()));
        properties.push((PROP_LISTEN_PORT.to_string(), self.listen_port.to_string()));
        properties.push((PROP_GROUP_LABEL.to_string(), self.group_label.clone()));
        properties
    }

    /// Rebuild from TXT-record properties.
    ///
    /// Returns `None` when the record lacks a service kind or a valid port.
    pub fn from_properties(properties: &HashMap<String, String>) -> Option<Self> {
        let service_kind = properties.get(PROP_SERVICE_KIND)?.clone();
        let listen_port = properties.get(PROP_LISTEN_PORT)?.parse().ok()?;
        let group_label = properties
            .get(PROP_GROUP_LABEL)
            .cloned()
            .unwrap_or_default();
        let extra = properties
            .iter()
            .filter(|(k, _)| !is_reserved(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            service_kind,
            listen_port,
            group_label,
            extra,
        })
    }
}

fn is_reserved(key: &str) -> bool {
    matches!(key, PROP_SERVICE_KIND | PROP_LISTEN_PORT | PROP_GROUP_LABEL)
}

/// A service found during discovery
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    /// Substrate-specific instance name, unique per advertisement
    pub instance: String,
    /// The advertising device; address filled in when the substrate knows it
    pub device: Device,
    pub attributes: ServiceAttributes,
}

/// Events published by the substrate
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A service was found while service requests are active
    ServiceFound(ServiceRecord),
    /// The set of nearby peers changed
    PeerListChanged(Vec<Device>),
    /// A physical group now exists
    GroupFormed { owner_address: IpAddr, is_owner: bool },
    /// The physical group this device belonged to was torn down
    GroupDisconnected,
    /// A device dropped out of the physical group this device owns
    PeerLost(DeviceKey),
}

/// Commands the sessions issue to the substrate
pub trait DiscoveryAdapter: Send + Sync {
    /// Activate peer discovery
    fn start_discovery(&self) -> Result<(), DiscoveryError>;

    fn stop_discovery(&self);

    /// Start searching for advertised services; results arrive as `ServiceFound`
    fn request_services(&self) -> Result<(), DiscoveryError>;

    fn clear_service_requests(&self);

    /// Advertise a group service
    fn advertise_service(&self, name: &str, attributes: &ServiceAttributes) -> Result<(), DiscoveryError>;

    fn withdraw_service(&self);

    /// Ask to form a physical group with the advertiser of `target`.
    ///
    /// Completion is reported later as `GroupFormed`.
    fn request_formation(&self, target: &ServiceRecord) -> Result<(), DiscoveryError>;

    /// Leave (or dissolve, when owning) the physical group
    fn leave_group(&self);

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
}
