//! mDNS-based LAN discovery using mdns-sd.
//!
//! Owners register `_tether._tcp.local.` with their group attributes as TXT
//! properties. On an ordinary LAN the physical group already exists, so
//! formation completes immediately with the resolved address, and the
//! group is considered gone when the joined owner's service is removed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tether_core::Device;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::discovery::{AdapterEvent, DiscoveryAdapter, ServiceAttributes, ServiceRecord};
use crate::error::DiscoveryError;

pub const SERVICE_TYPE: &str = "_tether._tcp.local.";
const PROP_DEVICE_ID: &str = "deviceId";
const PROP_DEVICE_NAME: &str = "deviceName";

#[derive(Default)]
struct MdnsState {
    /// Fullname of our own registered service
    registered: Option<String>,
    /// Fullname of the owner service we formed a group with
    joined: Option<String>,
    browsing: bool,
    /// Services resolved by the running browse, by fullname
    resolved: HashMap<String, ServiceRecord>,
}

impl MdnsState {
    /// Start browsing, or hand back what the running browse already resolved
    fn begin_browse(&mut self) -> Option<Vec<ServiceRecord>> {
        if !self.browsing {
            self.browsing = true;
            return None;
        }
        let mut known: Vec<ServiceRecord> = self.resolved.values().cloned().collect();
        known.sort_by(|a, b| a.instance.cmp(&b.instance));
        Some(known)
    }

    fn end_browse(&mut self) -> bool {
        self.resolved.clear();
        std::mem::take(&mut self.browsing)
    }

    fn remember(&mut self, record: ServiceRecord) {
        self.resolved.insert(record.instance.clone(), record);
    }

    /// Drop a withdrawn service; true when it was the owner we joined
    fn forget(&mut self, fullname: &str) -> bool {
        self.resolved.remove(fullname);
        if self.joined.as_deref() == Some(fullname) {
            self.joined = None;
            return true;
        }
        false
    }
}

/// [`DiscoveryAdapter`] over multicast DNS
pub struct MdnsAdapter {
    daemon: ServiceDaemon,
    local: Device,
    events: broadcast::Sender<AdapterEvent>,
    state: Arc<Mutex<MdnsState>>,
}

fn backend(e: impl std::fmt::Display) -> DiscoveryError {
    DiscoveryError::Backend(e.to_string())
}

impl MdnsAdapter {
    pub fn new(local: Device) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(backend)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            daemon,
            local,
            events,
            state: Arc::new(Mutex::new(MdnsState::default())),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MdnsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fullname_for(device_id: &str) -> String {
    format!("{}.{}", device_id, SERVICE_TYPE)
}

/// Translate a resolved mDNS service into a record, skipping our own
fn to_record(
    properties: HashMap<String, String>,
    addresses: Vec<IpAddr>,
    local_id: &str,
) -> Option<ServiceRecord> {
    let id = properties.get(PROP_DEVICE_ID)?.clone();
    if id == local_id {
        return None;
    }
    let name = properties
        .get(PROP_DEVICE_NAME)
        .cloned()
        .unwrap_or_else(|| id.clone());

    let Some(mut attributes) = ServiceAttributes::from_properties(&properties) else {
        debug!(device_id = %id, "mDNS: service without group attributes");
        return None;
    };
    attributes.extra.remove(PROP_DEVICE_ID);
    attributes.extra.remove(PROP_DEVICE_NAME);

    // Listeners bind 0.0.0.0, so only an IPv4 address is reachable
    let Some(address) = addresses.iter().find(|ip| ip.is_ipv4()).copied() else {
        debug!(device_id = %id, "mDNS: service without an IPv4 address");
        return None;
    };

    let mut device = Device::new(name, id.clone()).with_listen_port(attributes.listen_port);
    device.address = Some(address);

    Some(ServiceRecord {
        instance: fullname_for(&id),
        device,
        attributes,
    })
}

impl DiscoveryAdapter for MdnsAdapter {
    fn start_discovery(&self) -> Result<(), DiscoveryError> {
        // Peers are visible as soon as the daemon runs
        debug!("mDNS: peer discovery active");
        Ok(())
    }

    fn stop_discovery(&self) {
        debug!("mDNS: peer discovery idle");
    }

    fn request_services(&self) -> Result<(), DiscoveryError> {
        // A browse is already running: its results were reported once, so replay them
        let known = self.state().begin_browse();
        if let Some(known) = known {
            debug!(count = known.len(), "mDNS: replaying resolved services");
            for record in known {
                let _ = self.events.send(AdapterEvent::ServiceFound(record));
            }
            return Ok(());
        }

        let receiver = match self.daemon.browse(SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                self.state().browsing = false;
                return Err(backend(e));
            }
        };
        let events = self.events.clone();
        let state = self.state.clone();
        let local_id = self.local.id.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let properties: HashMap<String, String> = info
                            .get_properties()
                            .iter()
                            .map(|p| (p.key().to_string(), p.val_str().to_string()))
                            .collect();
                        let addresses: Vec<IpAddr> = info
                            .get_addresses()
                            .iter()
                            .filter_map(|ip| ip.to_string().parse().ok())
                            .collect();

                        if let Some(record) = to_record(properties, addresses, &local_id) {
                            debug!(device = %record.device, "mDNS: resolved service");
                            state
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remember(record.clone());
                            let _ = events.send(AdapterEvent::ServiceFound(record));
                        }
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        debug!("mDNS: service removed: {fullname}");
                        let lost = state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .forget(&fullname);
                        if lost {
                            info!("mDNS: joined owner withdrew its service");
                            let _ = events.send(AdapterEvent::GroupDisconnected);
                        }
                    }
                    ServiceEvent::SearchStopped(_) => {
                        debug!("mDNS: browse stopped");
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }

    fn clear_service_requests(&self) {
        let was_browsing = self.state().end_browse();
        if was_browsing {
            if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
                warn!("mDNS: failed to stop browse: {e}");
            }
        }
    }

    fn advertise_service(&self, name: &str, attributes: &ServiceAttributes) -> Result<(), DiscoveryError> {
        // Re-advertising replaces the previous registration
        self.withdraw_service();

        let ip = local_ip().map_err(backend)?;
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "tether-device".into());

        let mut properties = attributes.to_properties();
        properties.push((PROP_DEVICE_ID.to_string(), self.local.id.clone()));
        properties.push((PROP_DEVICE_NAME.to_string(), self.local.name.clone()));

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &self.local.id,
            &format!("{host}.local."),
            &ip.to_string(),
            attributes.listen_port,
            &properties[..],
        )
        .map_err(backend)?;

        let fullname = service.get_fullname().to_string();
        self.daemon.register(service).map_err(backend)?;
        info!(group = %name, "mDNS: registered {fullname} on {ip}:{}", attributes.listen_port);

        self.state().registered = Some(fullname);
        Ok(())
    }

    fn withdraw_service(&self) {
        let registered = self.state().registered.take();
        if let Some(fullname) = registered {
            info!("mDNS: unregistering service: {fullname}");
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!("mDNS: failed to unregister: {e}");
            }
        }
    }

    fn request_formation(&self, target: &ServiceRecord) -> Result<(), DiscoveryError> {
        let owner_address = target
            .device
            .address
            .ok_or_else(|| DiscoveryError::Backend(format!("{} has no resolved address", target.instance)))?;

        self.state().joined = Some(target.instance.clone());
        let _ = self.events.send(AdapterEvent::GroupFormed {
            owner_address,
            is_owner: false,
        });
        Ok(())
    }

    fn leave_group(&self) {
        self.state().joined = None;
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

impl Drop for MdnsAdapter {
    fn drop(&mut self) {
        self.withdraw_service();
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS: daemon shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn properties(id: &str) -> HashMap<String, String> {
        let attributes = ServiceAttributes {
            service_kind: "tether".into(),
            listen_port: 9999,
            group_label: "Study".into(),
            extra: BTreeMap::new(),
        };
        let mut properties: HashMap<String, String> =
            attributes.to_properties().into_iter().collect();
        properties.insert(PROP_DEVICE_ID.into(), id.into());
        properties.insert(PROP_DEVICE_NAME.into(), "owner".into());
        properties
    }

    #[test]
    fn service_type_is_valid() {
        assert!(SERVICE_TYPE.ends_with(".local."));
        assert!(SERVICE_TYPE.starts_with('_'));
    }

    #[test]
    fn test_record_from_resolved_service() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let v6: IpAddr = "fe80::1".parse().unwrap();

        let record = to_record(properties("owner-id"), vec![v6, v4], "me").unwrap();
        assert_eq!(record.device.name, "owner");
        assert_eq!(record.device.address, Some(v4));
        assert_eq!(record.device.listen_port, 9999);
        assert_eq!(record.attributes.group_label, "Study");
        assert!(record.attributes.extra.is_empty());
        assert_eq!(record.instance, fullname_for("owner-id"));
    }

    #[test]
    fn test_own_service_skipped() {
        assert!(to_record(properties("me"), vec![], "me").is_none());
    }

    #[test]
    fn test_ipv6_only_service_skipped() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert!(to_record(properties("owner-id"), vec![v6], "me").is_none());
    }

    #[test]
    fn test_second_browse_replays_resolved_services() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let mut state = MdnsState::default();
        assert!(state.begin_browse().is_none());

        state.remember(to_record(properties("a-id"), vec![v4], "me").unwrap());
        state.remember(to_record(properties("b-id"), vec![v4], "me").unwrap());
        // Resolved again after a refresh
        state.remember(to_record(properties("a-id"), vec![v4], "me").unwrap());

        let replayed = state.begin_browse().unwrap();
        let instances: Vec<&str> = replayed.iter().map(|r| r.instance.as_str()).collect();
        assert_eq!(instances, vec![fullname_for("a-id"), fullname_for("b-id")]);
        assert!(state.browsing);
    }

    #[test]
    fn test_removed_service_not_replayed() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let mut state = MdnsState::default();
        state.begin_browse();
        state.remember(to_record(properties("a-id"), vec![v4], "me").unwrap());
        state.remember(to_record(properties("b-id"), vec![v4], "me").unwrap());
        state.joined = Some(fullname_for("a-id"));

        assert!(!state.forget(&fullname_for("b-id")));
        assert!(state.forget(&fullname_for("a-id")));
        assert!(state.joined.is_none());
        assert!(state.begin_browse().unwrap().is_empty());
    }

    #[test]
    fn test_stopped_browse_starts_fresh() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let mut state = MdnsState::default();
        state.begin_browse();
        state.remember(to_record(properties("a-id"), vec![v4], "me").unwrap());

        assert!(state.end_browse());
        assert!(!state.end_browse());
        assert!(state.begin_browse().is_none());
        assert!(state.resolved.is_empty());
    }
}
