//! One-shot outbound connections and the long-lived inbound listener
//!
//! Every message travels on its own TCP connection. Sends are
//! fire-and-forget: failures are logged and dropped, never retried.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tether_core::Device;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_message, write_message};
use crate::protocol::Envelope;

/// Outbound side of the connection layer
#[derive(Debug, Clone)]
pub struct Outbound {
    connect_timeout: Duration,
}

impl Outbound {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Send one envelope to `device` on a background task.
    ///
    /// The sender field is replaced with `local` before encoding. The
    /// returned handle only reports completion, never failure.
    pub fn send_to(&self, local: &Device, device: &Device, mut envelope: Envelope) -> JoinHandle<()> {
        envelope.sender = Some(local.clone());
        let target = device.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let Some(addr) = target.socket_addr() else {
                debug!(device = %target, "No address for device, dropping message");
                return;
            };

            match deliver(addr, &envelope, connect_timeout).await {
                Ok(()) => {
                    debug!(device = %target, addr = %addr, kind = ?envelope.kind(), "Message sent");
                }
                Err(e) => {
                    warn!(device = %target, addr = %addr, error = %e, "Send failed");
                }
            }
        })
    }
}

async fn deliver(addr: SocketAddr, envelope: &Envelope, connect_timeout: Duration) -> Result<()> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout)??;
    write_message(&mut stream, envelope).await
}

/// Inbound listener shared by both roles
pub struct Listener {
    listener: TcpListener,
    addr: SocketAddr,
    max_message_bytes: usize,
    read_timeout: Duration,
}

impl Listener {
    /// Bind on all interfaces. Port 0 lets the OS choose.
    pub async fn bind(port: u16, max_message_bytes: usize, read_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Listener bound");
        Ok(Self {
            listener,
            addr,
            max_message_bytes,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until shutdown is signalled.
    ///
    /// Connections are handled one at a time: the handler for a message
    /// completes before the next connection is accepted. Malformed or slow
    /// messages are dropped; an accept failure ends the loop.
    pub async fn serve<H, Fut>(self, mut handler: H, mut shutdown_rx: broadcast::Receiver<()>)
    where
        H: FnMut(Envelope, SocketAddr) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let (mut stream, remote) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(addr = %self.addr, error = %e, "Accept failed");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => break,
            };

            // A peer that never closes its side must not hold up the loop
            let read = tokio::time::timeout(
                self.read_timeout,
                read_message(&mut stream, self.max_message_bytes),
            );
            let outcome = tokio::select! {
                outcome = read => outcome,
                _ = shutdown_rx.recv() => break,
            };

            match outcome {
                Ok(Ok(envelope)) => {
                    debug!(from = %remote, kind = ?envelope.kind(), "Message received");
                    handler(envelope, remote).await;
                }
                Ok(Err(e)) => {
                    warn!(from = %remote, error = %e, "Dropping malformed message");
                }
                Err(_) => {
                    warn!(from = %remote, timeout = ?self.read_timeout, "Dropping connection, read timed out");
                }
            }
        }
        info!(addr = %self.addr, "Listener shutting down");
    }
}

/// Wait for a background task to finish, aborting it after `grace`
pub(crate) async fn stop_task(mut task: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Task ended abnormally"),
        Err(_) => {
            warn!(grace = ?grace, "Task did not stop in time, aborting");
            task.abort();
        }
    }
}
