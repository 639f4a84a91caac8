//! Group owner session
//!
//! The owner advertises the group, listens on the well-known port and
//! keeps every member informed of who else is present. Application
//! traffic is delivered to the data callback and never re-broadcast
//! implicitly.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tether_core::{Device, DeviceKey, Registry, SessionConfig};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{AdapterEvent, DiscoveryAdapter, ServiceAttributes};
use crate::error::{Error, Result};
use crate::observer::Observers;
use crate::protocol::{Body, Envelope};
use crate::transport::{stop_task, Listener, Outbound};

/// Owner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    Idle,
    /// Service being advertised
    Registering,
    /// Serving the group
    Listening,
    ShuttingDown,
}

struct OwnerShared {
    phase: OwnerState,
    registry: Registry,
    local: Device,
    addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

struct OwnerInner {
    config: SessionConfig,
    adapter: Arc<dyn DiscoveryAdapter>,
    outbound: Outbound,
    state: RwLock<OwnerShared>,
    observers: Observers,
}

/// Group owner handle
pub struct OwnerSession {
    inner: Arc<OwnerInner>,
}

impl OwnerSession {
    pub fn new(local: Device, config: SessionConfig, adapter: Arc<dyn DiscoveryAdapter>) -> Self {
        let outbound = Outbound::new(config.connect_timeout());
        Self {
            inner: Arc::new(OwnerInner {
                config,
                adapter,
                outbound,
                state: RwLock::new(OwnerShared {
                    phase: OwnerState::Idle,
                    registry: Registry::new(),
                    local,
                    addr: None,
                    shutdown_tx: None,
                    tasks: Vec::new(),
                }),
                observers: Observers::default(),
            }),
        }
    }

    /// Advertise a group and start serving it.
    ///
    /// `extra` is published next to the standard service attributes. On
    /// failure the session stays `Idle`.
    pub async fn register_group(&self, group_name: &str, extra: BTreeMap<String, String>) -> Result<()> {
        {
            let mut s = self.inner.state.write().await;
            if s.phase != OwnerState::Idle {
                return Err(Error::InvalidState {
                    expected: "Idle",
                    actual: format!("{:?}", s.phase),
                });
            }
            s.phase = OwnerState::Registering;
        }

        let result = self.inner.start(group_name, extra).await;
        if let Err(e) = &result {
            warn!(group = %group_name, error = %e, "Group registration failed");
            let mut s = self.inner.state.write().await;
            if s.phase == OwnerState::Registering {
                s.phase = OwnerState::Idle;
            }
        }
        result
    }

    /// Send to one device, fire-and-forget
    pub async fn send_to(&self, device: &Device, envelope: Envelope) {
        let local = self.inner.state.read().await.local.clone();
        self.inner.outbound.send_to(&local, device, envelope);
    }

    /// Send to every registered device. Each delivery is independent.
    pub async fn send_to_all(&self, envelope: Envelope) {
        let (local, targets) = {
            let s = self.inner.state.read().await;
            (s.local.clone(), s.registry.all())
        };
        for device in &targets {
            self.inner.outbound.send_to(&local, device, envelope.clone());
        }
    }

    /// Devices currently registered with this owner
    pub async fn roster(&self) -> Vec<Device> {
        self.inner.state.read().await.registry.all()
    }

    pub async fn state(&self) -> OwnerState {
        self.inner.state.read().await.phase
    }

    /// Address the listener is bound to, while serving
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.read().await.addr
    }

    pub async fn local_device(&self) -> Device {
        self.inner.state.read().await.local.clone()
    }

    pub fn on_data_received(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.inner.observers.set_data(Arc::new(callback));
    }

    pub fn on_client_connected(&self, callback: impl Fn(&Device) + Send + Sync + 'static) {
        self.inner.observers.set_connected(Arc::new(callback));
    }

    pub fn on_client_disconnected(&self, callback: impl Fn(&Device) + Send + Sync + 'static) {
        self.inner.observers.set_disconnected(Arc::new(callback));
    }

    /// Stop serving the group.
    ///
    /// Every step is attempted even if an earlier one fails.
    pub async fn shutdown(&self) {
        let (shutdown_tx, tasks) = {
            let mut s = self.inner.state.write().await;
            if s.phase == OwnerState::Idle {
                return;
            }
            s.phase = OwnerState::ShuttingDown;
            (s.shutdown_tx.take(), std::mem::take(&mut s.tasks))
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        for task in tasks {
            stop_task(task, self.inner.config.leave_grace()).await;
        }

        {
            let mut s = self.inner.state.write().await;
            s.registry.clear();
            s.addr = None;
            s.phase = OwnerState::Idle;
        }

        self.inner.adapter.withdraw_service();
        self.inner.adapter.leave_group();
        self.inner.adapter.stop_discovery();
        info!("Group owner shut down");
    }
}

impl OwnerInner {
    async fn start(self: &Arc<Self>, group_name: &str, extra: BTreeMap<String, String>) -> Result<()> {
        // Members cannot find the service unless peer discovery is active
        self.adapter.start_discovery()?;

        let bound = Listener::bind(
            self.config.owner_port,
            self.config.max_message_bytes,
            self.config.read_timeout(),
        )
        .await;
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                self.adapter.stop_discovery();
                return Err(e);
            }
        };
        let addr = listener.local_addr();

        let attributes = ServiceAttributes {
            service_kind: self.config.service_kind.clone(),
            listen_port: addr.port(),
            group_label: group_name.to_string(),
            extra,
        };
        if let Err(e) = self.adapter.advertise_service(group_name, &attributes) {
            self.adapter.stop_discovery();
            return Err(e.into());
        }

        let mut s = self.state.write().await;
        // Shut down while advertising: undo instead of serving
        if s.phase != OwnerState::Registering {
            let phase = s.phase;
            drop(s);
            self.adapter.withdraw_service();
            self.adapter.stop_discovery();
            return Err(Error::InvalidState {
                expected: "Registering",
                actual: format!("{:?}", phase),
            });
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let events = self.adapter.subscribe();

        let inner = self.clone();
        let serve = tokio::spawn(listener.serve(
            move |envelope, remote| {
                let inner = inner.clone();
                async move { inner.handle_message(envelope, remote).await }
            },
            shutdown_rx,
        ));
        let watch = tokio::spawn(self.clone().watch_adapter(events, shutdown_tx.subscribe()));

        s.local.listen_port = addr.port();
        s.addr = Some(addr);
        s.shutdown_tx = Some(shutdown_tx);
        s.tasks = vec![serve, watch];
        s.phase = OwnerState::Listening;

        info!(group = %group_name, addr = %addr, "Group registered, waiting for members");
        Ok(())
    }

    async fn handle_message(&self, envelope: Envelope, remote: SocketAddr) {
        match &envelope.body {
            Body::Registration(device) => self.on_registration(device.clone(), remote).await,
            Body::Disconnection(device) => self.remove_and_relay(&device.key()).await,
            Body::Application(_) => self.observers.data(&envelope),
            Body::RosterSync(_) => {
                warn!(from = %remote, "Protocol error: roster sync sent to the owner, ignoring");
            }
        }
    }

    async fn on_registration(&self, device: Device, remote: SocketAddr) {
        // The socket tells us where the device really is; its own idea may be stale
        let device = device.with_address(remote.ip());

        let (local, roster) = {
            let mut s = self.state.write().await;
            if s.phase != OwnerState::Listening {
                debug!(device = %device, "Not serving, ignoring registration");
                return;
            }
            if device.is(&s.local.key()) {
                warn!(device = %device, "Protocol error: registration carries the owner's identity");
                return;
            }
            s.registry.upsert(device.clone());
            (s.local.clone(), s.registry.except(&device.key()))
        };

        info!(
            device = %device,
            addr = %remote.ip(),
            port = device.listen_port,
            "Member registered"
        );

        self.outbound
            .send_to(&local, &device, Envelope::roster_sync(roster.clone()));
        for peer in &roster {
            self.outbound
                .send_to(&local, peer, Envelope::registration(device.clone()));
        }

        self.observers.connected(&device);
    }

    /// Drop a member and tell the rest. Unknown devices are a no-op.
    async fn remove_and_relay(&self, key: &DeviceKey) {
        let (local, removed, remaining) = {
            let mut s = self.state.write().await;
            let removed = s.registry.remove(key);
            (s.local.clone(), removed, s.registry.all())
        };

        let Some(device) = removed else {
            debug!(device = %key, "Disconnection for unknown device, ignoring");
            return;
        };

        info!(device = %device, remaining = remaining.len(), "Member disconnected");
        for peer in &remaining {
            self.outbound
                .send_to(&local, peer, Envelope::disconnection(device.clone()));
        }

        self.observers.disconnected(&device);
    }

    async fn watch_adapter(
        self: Arc<Self>,
        mut events: broadcast::Receiver<AdapterEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(AdapterEvent::PeerLost(key)) => self.remove_and_relay(&key).await,
                        Ok(AdapterEvent::GroupFormed { owner_address, is_owner }) => {
                            if is_owner {
                                info!(addr = %owner_address, "Physical group formed, this device is the owner");
                            } else {
                                warn!(addr = %owner_address, "Protocol error: owner joined a group it does not own");
                            }
                        }
                        Ok(AdapterEvent::PeerListChanged(peers)) => {
                            debug!(peers = peers.len(), "Nearby peers changed");
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed = missed, "Adapter events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Adapter watcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;
    use crate::local::LocalNetwork;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_config() -> SessionConfig {
        SessionConfig {
            owner_port: 0,
            connect_timeout_ms: 500,
            ..SessionConfig::default()
        }
    }

    /// Adapter whose advertisement blocks until released
    struct GatedAdapter {
        gate: std::sync::Mutex<Option<std::sync::mpsc::Receiver<()>>>,
        entered: AtomicBool,
        advertised: AtomicBool,
        events: broadcast::Sender<AdapterEvent>,
    }

    impl GatedAdapter {
        fn new(gate: std::sync::mpsc::Receiver<()>) -> Self {
            Self {
                gate: std::sync::Mutex::new(Some(gate)),
                entered: AtomicBool::new(false),
                advertised: AtomicBool::new(false),
                events: broadcast::channel(8).0,
            }
        }
    }

    impl DiscoveryAdapter for GatedAdapter {
        fn start_discovery(&self) -> std::result::Result<(), DiscoveryError> {
            Ok(())
        }

        fn stop_discovery(&self) {}

        fn request_services(&self) -> std::result::Result<(), DiscoveryError> {
            Ok(())
        }

        fn clear_service_requests(&self) {}

        fn advertise_service(&self, _name: &str, _attributes: &ServiceAttributes) -> std::result::Result<(), DiscoveryError> {
            self.entered.store(true, Ordering::SeqCst);
            if let Some(gate) = self.gate.lock().unwrap().take() {
                let _ = gate.recv();
            }
            self.advertised.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn withdraw_service(&self) {
            self.advertised.store(false, Ordering::SeqCst);
        }

        fn request_formation(&self, _target: &crate::discovery::ServiceRecord) -> std::result::Result<(), DiscoveryError> {
            Ok(())
        }

        fn leave_group(&self) {}

        fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_during_registration_unwinds() {
        let (release, gate) = std::sync::mpsc::channel();
        let adapter = Arc::new(GatedAdapter::new(gate));
        let owner = Arc::new(OwnerSession::new(
            Device::new("owner", "owner-id"),
            test_config(),
            adapter.clone(),
        ));

        let registering = tokio::spawn({
            let owner = owner.clone();
            async move { owner.register_group("Study", BTreeMap::new()).await }
        });
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !adapter.entered.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(owner.state().await, OwnerState::Registering);

        owner.shutdown().await;
        assert_eq!(owner.state().await, OwnerState::Idle);

        release.send(()).unwrap();
        let result = registering.await.unwrap();
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        assert_eq!(owner.state().await, OwnerState::Idle);
        assert!(owner.local_addr().await.is_none());
        assert!(!adapter.advertised.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_register_and_shutdown() {
        let network = LocalNetwork::new();
        let local = Device::new("owner", "owner-id");
        let owner = OwnerSession::new(local.clone(), test_config(), Arc::new(network.adapter(&local)));

        owner.register_group("Study", BTreeMap::new()).await.unwrap();
        assert_eq!(owner.state().await, OwnerState::Listening);
        let port = owner.local_addr().await.unwrap().port();
        assert!(port > 0);
        assert_eq!(owner.local_device().await.listen_port, port);

        owner.shutdown().await;
        assert_eq!(owner.state().await, OwnerState::Idle);
        assert!(owner.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_advertise_failure_stays_idle() {
        let network = LocalNetwork::new();
        let local = Device::new("owner", "owner-id");
        let adapter = Arc::new(network.adapter(&local));
        adapter.fail_next_advertise(DiscoveryError::Busy);
        let owner = OwnerSession::new(local, test_config(), adapter);

        let result = owner.register_group("Study", BTreeMap::new()).await;
        assert!(matches!(result, Err(Error::Discovery(DiscoveryError::Busy))));
        assert_eq!(owner.state().await, OwnerState::Idle);

        // A later attempt may still succeed
        owner.register_group("Study", BTreeMap::new()).await.unwrap();
        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_double_register_rejected() {
        let network = LocalNetwork::new();
        let local = Device::new("owner", "owner-id");
        let owner = OwnerSession::new(local.clone(), test_config(), Arc::new(network.adapter(&local)));

        owner.register_group("Study", BTreeMap::new()).await.unwrap();
        let again = owner.register_group("Study", BTreeMap::new()).await;
        assert!(matches!(again, Err(Error::InvalidState { .. })));
        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_disconnection_is_noop() {
        let network = LocalNetwork::new();
        let local = Device::new("owner", "owner-id");
        let owner = OwnerSession::new(local.clone(), test_config(), Arc::new(network.adapter(&local)));
        owner.register_group("Study", BTreeMap::new()).await.unwrap();

        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = disconnected.clone();
        owner.on_client_disconnected(move |_| flag.store(true, Ordering::SeqCst));

        owner
            .inner
            .remove_and_relay(&Device::new("ghost", "nobody").key())
            .await;
        assert!(!disconnected.load(Ordering::SeqCst));
        assert!(owner.roster().await.is_empty());
        owner.shutdown().await;
    }

    async fn next_message(listener: &tokio::net::TcpListener) -> Option<Envelope> {
        let accepted = tokio::time::timeout(std::time::Duration::from_millis(300), listener.accept()).await;
        let (mut stream, _) = accepted.ok()?.ok()?;
        crate::frame::read_message(&mut stream, 1024 * 1024).await.ok()
    }

    #[tokio::test]
    async fn test_disconnection_fan_out_excludes_leaver() {
        let network = LocalNetwork::new();
        let local = Device::new("owner", "owner-id");
        let owner = OwnerSession::new(local.clone(), test_config(), Arc::new(network.adapter(&local)));
        owner.register_group("Study", BTreeMap::new()).await.unwrap();

        let a_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let d_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = Device::new("a", "1").with_listen_port(a_listener.local_addr().unwrap().port());
        let d = Device::new("d", "2").with_listen_port(d_listener.local_addr().unwrap().port());
        let remote: SocketAddr = "127.0.0.1:50000".parse().unwrap();

        owner.inner.handle_message(Envelope::registration(a.clone()), remote).await;
        let sync = next_message(&a_listener).await.unwrap();
        assert_eq!(sync.body, Body::RosterSync(vec![]));
        assert_eq!(sync.sender.map(|s| s.name), Some("owner".to_string()));

        owner.inner.handle_message(Envelope::registration(d.clone()), remote).await;
        let sync = next_message(&d_listener).await.unwrap();
        assert!(matches!(sync.body, Body::RosterSync(ref roster) if roster.len() == 1 && roster[0].is(&a.key())));
        let announce = next_message(&a_listener).await.unwrap();
        assert!(matches!(announce.body, Body::Registration(ref dev) if dev.is(&d.key())));

        owner.inner.handle_message(Envelope::disconnection(d.clone()), remote).await;
        let relay = next_message(&a_listener).await.unwrap();
        assert!(matches!(relay.body, Body::Disconnection(ref dev) if dev.is(&d.key())));
        assert!(next_message(&d_listener).await.is_none());
        assert_eq!(owner.roster().await.len(), 1);

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unreachable_device() {
        let network = LocalNetwork::new();
        let local = Device::new("owner", "owner-id");
        let owner = OwnerSession::new(local.clone(), test_config(), Arc::new(network.adapter(&local)));
        owner.register_group("Study", BTreeMap::new()).await.unwrap();

        let unreachable = Device::new("gone", "gone-id")
            .with_address("10.255.255.1".parse().unwrap())
            .with_listen_port(9);
        owner.send_to(&unreachable, Envelope::text("anyone?")).await;
        owner.send_to_all(Envelope::text("nobody here")).await;

        assert!(owner.roster().await.is_empty());
        owner.shutdown().await;
    }
}
