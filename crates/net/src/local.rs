//! In-process discovery substrate
//!
//! Several [`LocalAdapter`]s attached to one [`LocalNetwork`] see each
//! other's advertisements and form groups on the loopback interface.
//! Used by tests and by the CLI's `--local` mode.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};

use tether_core::{Device, DeviceKey};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::discovery::{AdapterEvent, DiscoveryAdapter, ServiceAttributes, ServiceRecord};
use crate::error::DiscoveryError;

const EVENT_CAPACITY: usize = 64;

struct Station {
    key: DeviceKey,
    events: broadcast::Sender<AdapterEvent>,
    browsing: bool,
}

#[derive(Default)]
struct NetworkState {
    stations: Vec<Station>,
    /// Advertised services by instance name
    services: HashMap<String, ServiceRecord>,
    /// Members of each physical group, by owner instance name
    groups: HashMap<String, Vec<DeviceKey>>,
}

impl NetworkState {
    fn station(&self, key: &DeviceKey) -> Option<&Station> {
        self.stations.iter().find(|s| &s.key == key)
    }

    fn emit(&self, key: &DeviceKey, event: AdapterEvent) {
        if let Some(station) = self.station(key) {
            let _ = station.events.send(event);
        }
    }
}

/// Shared medium the local adapters talk over
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device and get its adapter
    pub fn adapter(&self, device: &Device) -> LocalAdapter {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.with_state(|state| {
            state.stations.retain(|s| s.key != device.key());
            state.stations.push(Station {
                key: device.key(),
                events: events.clone(),
                browsing: false,
            });
        });

        LocalAdapter {
            network: self.clone(),
            local: device.clone(),
            events,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Tear down the physical group owned by `owner`, as if the radio link dropped
    pub fn drop_group(&self, owner: &DeviceKey) {
        self.with_state(|state| {
            let instance = instance_name(owner);
            if let Some(members) = state.groups.remove(&instance) {
                for member in &members {
                    state.emit(member, AdapterEvent::GroupDisconnected);
                }
                info!(owner = %owner, members = members.len(), "Local group dropped");
            }
        });
    }

    /// Number of devices currently in the group owned by `owner`
    pub fn group_size(&self, owner: &DeviceKey) -> usize {
        self.with_state(|state| {
            state
                .groups
                .get(&instance_name(owner))
                .map_or(0, |members| members.len())
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NetworkState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

fn instance_name(key: &DeviceKey) -> String {
    format!("{}._tether.local", key.id)
}

#[derive(Default)]
struct Faults {
    discovery: Option<DiscoveryError>,
    advertise: Option<DiscoveryError>,
    formation: Option<DiscoveryError>,
    form_as_owner: bool,
}

/// Adapter for one device on a [`LocalNetwork`]
pub struct LocalAdapter {
    network: LocalNetwork,
    local: Device,
    events: broadcast::Sender<AdapterEvent>,
    faults: Mutex<Faults>,
}

impl LocalAdapter {
    /// Make the next `start_discovery` fail
    pub fn fail_next_discovery(&self, error: DiscoveryError) {
        self.faults().discovery = Some(error);
    }

    /// Make the next `advertise_service` fail
    pub fn fail_next_advertise(&self, error: DiscoveryError) {
        self.faults().advertise = Some(error);
    }

    /// Make the next `request_formation` fail
    pub fn fail_next_formation(&self, error: DiscoveryError) {
        self.faults().formation = Some(error);
    }

    /// Report this device as the group owner on the next formation
    pub fn form_as_owner(&self, as_owner: bool) {
        self.faults().form_as_owner = as_owner;
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_browsing(&self, browsing: bool) {
        let key = self.local.key();
        self.network.with_state(|state| {
            if let Some(station) = state.stations.iter_mut().find(|s| s.key == key) {
                station.browsing = browsing;
            }
        });
    }
}

impl DiscoveryAdapter for LocalAdapter {
    fn start_discovery(&self) -> Result<(), DiscoveryError> {
        if let Some(error) = self.faults().discovery.take() {
            return Err(error);
        }
        debug!(device = %self.local, "Local peer discovery started");
        Ok(())
    }

    fn stop_discovery(&self) {
        debug!(device = %self.local, "Local peer discovery stopped");
    }

    fn request_services(&self) -> Result<(), DiscoveryError> {
        self.set_browsing(true);
        let key = self.local.key();
        self.network.with_state(|state| {
            for record in state.services.values() {
                if !record.device.is(&key) {
                    let _ = self.events.send(AdapterEvent::ServiceFound(record.clone()));
                }
            }
        });
        Ok(())
    }

    fn clear_service_requests(&self) {
        self.set_browsing(false);
    }

    fn advertise_service(&self, name: &str, attributes: &ServiceAttributes) -> Result<(), DiscoveryError> {
        if let Some(error) = self.faults().advertise.take() {
            return Err(error);
        }

        let key = self.local.key();
        let record = ServiceRecord {
            instance: instance_name(&key),
            device: self
                .local
                .clone()
                .with_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
                .with_listen_port(attributes.listen_port),
            attributes: attributes.clone(),
        };

        self.network.with_state(|state| {
            for station in state.stations.iter().filter(|s| s.browsing && s.key != key) {
                let _ = station.events.send(AdapterEvent::ServiceFound(record.clone()));
            }
            state.services.insert(record.instance.clone(), record);
        });

        info!(device = %self.local, group = %name, "Local service advertised");
        Ok(())
    }

    fn withdraw_service(&self) {
        self.network.with_state(|state| {
            state.services.remove(&instance_name(&self.local.key()));
        });
    }

    fn request_formation(&self, target: &ServiceRecord) -> Result<(), DiscoveryError> {
        if let Some(error) = self.faults().formation.take() {
            return Err(error);
        }
        let is_owner = std::mem::take(&mut self.faults().form_as_owner);

        let key = self.local.key();
        let owner_key = target.device.key();
        let owner_address = target
            .device
            .address
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        self.network.with_state(|state| {
            if !state.services.contains_key(&target.instance) {
                return Err(DiscoveryError::Backend(format!(
                    "no service named {}",
                    target.instance
                )));
            }

            let members = state.groups.entry(target.instance.clone()).or_default();
            if !members.contains(&key) {
                members.push(key.clone());
            }
            let peers: Vec<Device> = members
                .iter()
                .map(|k| Device::new(k.name.clone(), k.id.clone()))
                .collect();

            state.emit(
                &owner_key,
                AdapterEvent::GroupFormed {
                    owner_address,
                    is_owner: true,
                },
            );
            state.emit(&owner_key, AdapterEvent::PeerListChanged(peers));
            state.emit(
                &key,
                AdapterEvent::GroupFormed {
                    owner_address,
                    is_owner,
                },
            );
            Ok(())
        })
    }

    fn leave_group(&self) {
        let key = self.local.key();
        self.network.with_state(|state| {
            // Owner leaving dissolves its own group
            if let Some(members) = state.groups.remove(&instance_name(&key)) {
                for member in &members {
                    state.emit(member, AdapterEvent::GroupDisconnected);
                }
            }

            let mut lost_by = Vec::new();
            for (instance, members) in state.groups.iter_mut() {
                if let Some(pos) = members.iter().position(|k| k == &key) {
                    members.remove(pos);
                    lost_by.push(instance.clone());
                }
            }
            for instance in lost_by {
                if let Some(owner) = state.services.get(&instance).map(|r| r.device.key()) {
                    state.emit(&owner, AdapterEvent::PeerLost(key.clone()));
                }
            }
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn attributes(port: u16) -> ServiceAttributes {
        ServiceAttributes {
            service_kind: "tether".into(),
            listen_port: port,
            group_label: "Study".into(),
            extra: BTreeMap::new(),
        }
    }

    fn found(rx: &mut broadcast::Receiver<AdapterEvent>) -> Vec<ServiceRecord> {
        let mut records = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AdapterEvent::ServiceFound(record) = event {
                records.push(record);
            }
        }
        records
    }

    #[test]
    fn test_browse_sees_existing_and_new_services() {
        let network = LocalNetwork::new();
        let owner_a = network.adapter(&Device::new("a", "1"));
        let owner_b = network.adapter(&Device::new("b", "2"));
        let member = network.adapter(&Device::new("m", "3"));
        let mut rx = member.subscribe();

        owner_a.advertise_service("A", &attributes(4001)).unwrap();
        member.request_services().unwrap();
        owner_b.advertise_service("B", &attributes(4002)).unwrap();

        let records = found(&mut rx);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].device.listen_port, 4001);
        assert_eq!(records[1].device.listen_port, 4002);
    }

    #[test]
    fn test_formation_and_leave() {
        let network = LocalNetwork::new();
        let owner_device = Device::new("owner", "1");
        let owner = network.adapter(&owner_device);
        let member = network.adapter(&Device::new("m", "2"));
        let mut owner_rx = owner.subscribe();
        let mut member_rx = member.subscribe();

        owner.advertise_service("Study", &attributes(4001)).unwrap();
        member.request_services().unwrap();
        let record = found(&mut member_rx).remove(0);

        member.request_formation(&record).unwrap();
        assert_eq!(network.group_size(&owner_device.key()), 1);
        assert!(matches!(
            member_rx.try_recv(),
            Ok(AdapterEvent::GroupFormed { is_owner: false, .. })
        ));

        member.leave_group();
        assert_eq!(network.group_size(&owner_device.key()), 0);
        let lost = std::iter::from_fn(|| owner_rx.try_recv().ok())
            .any(|e| matches!(e, AdapterEvent::PeerLost(ref k) if k.id == "2"));
        assert!(lost);
    }

    #[test]
    fn test_injected_failures_fire_once() {
        let network = LocalNetwork::new();
        let adapter = network.adapter(&Device::new("a", "1"));

        adapter.fail_next_advertise(DiscoveryError::Busy);
        assert_eq!(
            adapter.advertise_service("x", &attributes(1)),
            Err(DiscoveryError::Busy)
        );
        assert!(adapter.advertise_service("x", &attributes(1)).is_ok());
    }

    #[test]
    fn test_drop_group_notifies_members() {
        let network = LocalNetwork::new();
        let owner_device = Device::new("owner", "1");
        let owner = network.adapter(&owner_device);
        let member = network.adapter(&Device::new("m", "2"));
        let mut member_rx = member.subscribe();

        owner.advertise_service("Study", &attributes(4001)).unwrap();
        member.request_services().unwrap();
        let record = found(&mut member_rx).remove(0);
        member.request_formation(&record).unwrap();

        network.drop_group(&owner_device.key());
        let disconnected = std::iter::from_fn(|| member_rx.try_recv().ok())
            .any(|e| matches!(e, AdapterEvent::GroupDisconnected));
        assert!(disconnected);
    }
}
