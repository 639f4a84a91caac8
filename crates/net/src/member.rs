//! Group member session
//!
//! A member finds an owner through the discovery adapter, forms a physical
//! group with it, then registers over TCP. After registration it talks to
//! the owner and directly to every other member it has learned about.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tether_core::{Device, Registry, SessionConfig};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::{AdapterEvent, DiscoveryAdapter, ServiceRecord};
use crate::error::{Error, Result};
use crate::observer::Observers;
use crate::protocol::{Body, Envelope};
use crate::transport::{stop_task, Listener, Outbound};

/// Member lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Idle,
    Discovering,
    /// Waiting for the physical group
    Connecting,
    Registered,
    Disconnecting,
}

struct MemberShared {
    phase: MemberState,
    registry: Registry,
    local: Device,
    owner: Option<Device>,
    target: Option<ServiceRecord>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    listener_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    joined_tx: Option<oneshot::Sender<Result<()>>>,
}

struct MemberInner {
    config: SessionConfig,
    adapter: Arc<dyn DiscoveryAdapter>,
    outbound: Outbound,
    state: RwLock<MemberShared>,
    observers: Observers,
}

/// Group member handle
pub struct MemberSession {
    inner: Arc<MemberInner>,
}

impl MemberSession {
    pub fn new(local: Device, config: SessionConfig, adapter: Arc<dyn DiscoveryAdapter>) -> Self {
        let outbound = Outbound::new(config.connect_timeout());
        Self {
            inner: Arc::new(MemberInner {
                config,
                adapter,
                outbound,
                state: RwLock::new(MemberShared {
                    phase: MemberState::Idle,
                    registry: Registry::new(),
                    local,
                    owner: None,
                    target: None,
                    shutdown_tx: None,
                    listener_task: None,
                    watch_task: None,
                    joined_tx: None,
                }),
                observers: Observers::default(),
            }),
        }
    }

    /// Look for groups for `window`.
    ///
    /// `on_found` sees each matching service as it appears. The full set is
    /// returned once the window has elapsed, even if the substrate went
    /// quiet earlier.
    pub async fn discover(
        &self,
        window: Duration,
        mut on_found: impl FnMut(&ServiceRecord) + Send,
    ) -> Result<Vec<ServiceRecord>> {
        let local_key = {
            let mut s = self.inner.state.write().await;
            if s.phase != MemberState::Idle {
                return Err(Error::InvalidState {
                    expected: "Idle",
                    actual: format!("{:?}", s.phase),
                });
            }
            s.phase = MemberState::Discovering;
            s.local.key()
        };

        // Subscribe before asking so nothing reported synchronously is missed
        let mut events = self.inner.adapter.subscribe();
        let started = self
            .inner
            .adapter
            .start_discovery()
            .and_then(|()| self.inner.adapter.request_services());
        if let Err(e) = started {
            warn!(error = %e, "Service discovery failed to start");
            self.inner.state.write().await.phase = MemberState::Idle;
            return Err(e.into());
        }

        let mut found: Vec<ServiceRecord> = Vec::new();
        let mut seen = HashSet::new();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(AdapterEvent::ServiceFound(record)) => {
                        if record.attributes.service_kind != self.inner.config.service_kind
                            || record.device.is(&local_key)
                            || !seen.insert(record.instance.clone())
                        {
                            continue;
                        }
                        debug!(
                            group = %record.attributes.group_label,
                            owner = %record.device,
                            "Group found"
                        );
                        on_found(&record);
                        found.push(record);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Discovery events dropped");
                    }
                    Err(RecvError::Closed) => {
                        (&mut deadline).await;
                        break;
                    }
                },
            }
        }

        {
            let mut s = self.inner.state.write().await;
            if s.phase == MemberState::Discovering {
                s.phase = MemberState::Idle;
            }
        }
        info!(groups = found.len(), "Discovery window closed");
        Ok(found)
    }

    /// Join the group advertised by `record`.
    ///
    /// Returns once the physical group exists, the listener is bound and
    /// the registration has been handed to the owner.
    pub async fn join_group(&self, record: &ServiceRecord) -> Result<()> {
        let joined_rx = {
            let mut s = self.inner.state.write().await;
            if s.phase != MemberState::Idle {
                return Err(Error::InvalidState {
                    expected: "Idle",
                    actual: format!("{:?}", s.phase),
                });
            }
            s.phase = MemberState::Connecting;
            s.target = Some(record.clone());

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let (joined_tx, joined_rx) = oneshot::channel();
            let events = self.inner.adapter.subscribe();
            s.watch_task = Some(tokio::spawn(
                self.inner.clone().watch_adapter(events, shutdown_rx),
            ));
            s.shutdown_tx = Some(shutdown_tx);
            s.joined_tx = Some(joined_tx);
            joined_rx
        };

        info!(group = %record.attributes.group_label, owner = %record.device, "Joining group");
        if let Err(e) = self.inner.adapter.request_formation(record) {
            warn!(error = %e, "Group formation request failed");
            if let Some(watch) = self.inner.teardown().await {
                stop_task(watch, self.inner.config.leave_grace()).await;
            }
            return Err(e.into());
        }

        match joined_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Send to the owner only
    pub async fn send_to_owner(&self, envelope: Envelope) -> Result<()> {
        let (local, owner) = {
            let s = self.inner.state.read().await;
            (s.local.clone(), s.owner.clone())
        };
        let owner = owner.ok_or_else(|| self.inner.not_registered())?;
        self.inner.outbound.send_to(&local, &owner, envelope);
        Ok(())
    }

    /// Send to the owner and directly to every known peer
    pub async fn send_to_all(&self, envelope: Envelope) -> Result<()> {
        let (local, owner, peers) = {
            let s = self.inner.state.read().await;
            (s.local.clone(), s.owner.clone(), s.registry.except(&s.local.key()))
        };
        let owner = owner.ok_or_else(|| self.inner.not_registered())?;

        self.inner.outbound.send_to(&local, &owner, envelope.clone());
        for peer in &peers {
            self.inner.outbound.send_to(&local, peer, envelope.clone());
        }
        Ok(())
    }

    /// Other members this device knows about
    pub async fn roster(&self) -> Vec<Device> {
        self.inner.state.read().await.registry.all()
    }

    pub async fn owner(&self) -> Option<Device> {
        self.inner.state.read().await.owner.clone()
    }

    pub async fn state(&self) -> MemberState {
        self.inner.state.read().await.phase
    }

    pub async fn local_device(&self) -> Device {
        self.inner.state.read().await.local.clone()
    }

    pub fn on_data_received(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.inner.observers.set_data(Arc::new(callback));
    }

    pub fn on_peer_connected(&self, callback: impl Fn(&Device) + Send + Sync + 'static) {
        self.inner.observers.set_connected(Arc::new(callback));
    }

    pub fn on_peer_disconnected(&self, callback: impl Fn(&Device) + Send + Sync + 'static) {
        self.inner.observers.set_disconnected(Arc::new(callback));
    }

    /// Called when the physical group disappears under a registered member
    pub fn on_owner_disconnected(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.observers.set_owner_lost(Arc::new(callback));
    }

    /// Leave the group.
    ///
    /// The owner is told first. Teardown waits for that send for at most
    /// the configured grace period.
    pub async fn leave(&self) {
        let farewell = {
            let mut s = self.inner.state.write().await;
            match s.phase {
                MemberState::Idle | MemberState::Disconnecting => return,
                MemberState::Registered => {
                    s.phase = MemberState::Disconnecting;
                    s.owner
                        .clone()
                        .map(|owner| (s.local.clone(), owner))
                }
                _ => {
                    s.phase = MemberState::Disconnecting;
                    None
                }
            }
        };

        if let Some((local, owner)) = farewell {
            let sent = self
                .inner
                .outbound
                .send_to(&local, &owner, Envelope::disconnection(local.clone()));
            if tokio::time::timeout(self.inner.config.leave_grace(), sent)
                .await
                .is_err()
            {
                debug!(owner = %owner, "Disconnection still in flight, tearing down anyway");
            }
        }

        if let Some(watch) = self.inner.teardown().await {
            stop_task(watch, self.inner.config.leave_grace()).await;
        }
        info!("Left group");
    }
}

impl MemberInner {
    fn not_registered(&self) -> Error {
        Error::InvalidState {
            expected: "Registered",
            actual: "no owner".into(),
        }
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
                        Ok(AdapterEvent::GroupFormed { owner_address, is_owner }) => {
                            self.on_group_formed(owner_address, is_owner).await;
                        }
                        Ok(AdapterEvent::GroupDisconnected) => self.on_group_lost().await,
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

    async fn on_group_formed(self: &Arc<Self>, owner_address: IpAddr, is_owner: bool) {
        if is_owner {
            error!(addr = %owner_address, "Protocol error: formed a group as its owner, continuing as member");
        }

        let target = {
            let s = self.state.read().await;
            if s.phase != MemberState::Connecting {
                debug!(phase = ?s.phase, "Group formed outside of a join, ignoring");
                return;
            }
            s.target.clone()
        };
        let Some(target) = target else {
            return;
        };

        if let Err(e) = self.register(&target, owner_address).await {
            warn!(error = %e, "Registration with owner failed");
            let joined_tx = self.state.write().await.joined_tx.take();
            // The watcher is this task, so its handle is left to finish on its own
            let _ = self.teardown().await;
            if let Some(tx) = joined_tx {
                let _ = tx.send(Err(e));
            }
        }
    }

    /// Bind the listener, then announce ourselves to the owner
    async fn register(self: &Arc<Self>, target: &ServiceRecord, owner_address: IpAddr) -> Result<()> {
        let listener = Listener::bind(
            self.config.member_port,
            self.config.max_message_bytes,
            self.config.read_timeout(),
        )
        .await?;
        let port = listener.local_addr().port();
        let owner = target
            .device
            .clone()
            .with_address(owner_address)
            .with_listen_port(target.attributes.listen_port);

        let (local, joined_tx) = {
            let mut s = self.state.write().await;
            if s.phase != MemberState::Connecting {
                return Err(Error::Closed);
            }
            let shutdown_rx = match &s.shutdown_tx {
                Some(tx) => tx.subscribe(),
                None => return Err(Error::Closed),
            };

            let inner = self.clone();
            s.listener_task = Some(tokio::spawn(listener.serve(
                move |envelope, remote| {
                    let inner = inner.clone();
                    async move { inner.handle_message(envelope, remote).await }
                },
                shutdown_rx,
            )));
            s.local.listen_port = port;
            s.owner = Some(owner.clone());
            s.phase = MemberState::Registered;
            (s.local.clone(), s.joined_tx.take())
        };

        let sent = self
            .outbound
            .send_to(&local, &owner, Envelope::registration(local.clone()));
        let _ = sent.await;
        info!(owner = %owner, port = port, "Registered with group owner");

        if let Some(tx) = joined_tx {
            let _ = tx.send(Ok(()));
        }
        Ok(())
    }

    async fn on_group_lost(&self) {
        let was = self.state.read().await.phase;
        if matches!(was, MemberState::Idle | MemberState::Disconnecting) {
            return;
        }

        warn!(phase = ?was, "Physical group torn down, owner gone");
        let _ = self.teardown().await;
        if was == MemberState::Registered {
            self.observers.owner_lost();
        }
    }

    async fn handle_message(&self, envelope: Envelope, remote: SocketAddr) {
        let mut s = self.state.write().await;
        if s.phase != MemberState::Registered {
            debug!(from = %remote, kind = ?envelope.kind(), "Not registered, ignoring message");
            return;
        }
        let local_key = s.local.key();

        match &envelope.body {
            Body::RosterSync(devices) => {
                let added = s
                    .registry
                    .merge(devices.iter().filter(|d| !d.is(&local_key)).cloned());
                debug!(listed = devices.len(), added = added, "Roster synced");
            }
            Body::Registration(device) => {
                if device.is(&local_key) {
                    return;
                }
                s.registry.upsert(device.clone());
                drop(s);
                info!(device = %device, "Peer joined");
                self.observers.connected(device);
            }
            Body::Disconnection(device) => {
                let removed = s.registry.remove(&device.key());
                drop(s);
                match removed {
                    Some(device) => {
                        info!(device = %device, "Peer left");
                        self.observers.disconnected(&device);
                    }
                    None => debug!(device = %device, "Disconnection for unknown peer"),
                }
            }
            Body::Application(_) => {
                drop(s);
                self.observers.data(&envelope);
            }
        }
    }

    /// Return to `Idle`, releasing the listener and the physical group.
    ///
    /// Hands back the adapter watcher so callers outside it can wait for it.
    async fn teardown(&self) -> Option<JoinHandle<()>> {
        let (shutdown_tx, listener_task, watch_task, joined_tx) = {
            let mut s = self.state.write().await;
            s.registry.clear();
            s.owner = None;
            s.target = None;
            s.local.listen_port = 0;
            s.phase = MemberState::Idle;
            (
                s.shutdown_tx.take(),
                s.listener_task.take(),
                s.watch_task.take(),
                s.joined_tx.take(),
            )
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(tx) = joined_tx {
            let _ = tx.send(Err(Error::Closed));
        }
        if let Some(task) = listener_task {
            stop_task(task, self.config.leave_grace()).await;
        }

        self.adapter.clear_service_requests();
        self.adapter.leave_group();
        self.adapter.stop_discovery();
        watch_task
    }
}
