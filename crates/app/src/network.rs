//! Session management for the app
//!
//! Drives an owner or member session from the terminal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tether_core::{Device, SessionConfig};
use tether_net::{
    DiscoveryAdapter, Envelope, LocalNetwork, MdnsAdapter, MemberSession, OwnerSession,
    ServiceRecord,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::chat::{render_roster, ChatLine, Input};
use crate::error::{AppError, Result};

/// How long the `--local` echo peer looks for the group
const DEMO_DISCOVERY_WINDOW: Duration = Duration::from_millis(200);

/// Line-based terminal input
struct Console {
    lines: Lines<BufReader<Stdin>>,
}

impl Console {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Next command. End of input and Ctrl-C both read as `/quit`.
    async fn next(&mut self) -> Input {
        loop {
            let line = tokio::select! {
                line = self.lines.next_line() => line,
                _ = tokio::signal::ctrl_c() => return Input::Quit,
            };
            match line {
                Ok(Some(line)) => match Input::parse(&line) {
                    Input::Empty => continue,
                    input => return input,
                },
                Ok(None) => return Input::Quit,
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    return Input::Quit;
                }
            }
        }
    }
}

fn print_incoming(envelope: &Envelope) {
    match ChatLine::from_envelope(envelope) {
        Some(line) => println!("{}", line.render(envelope.sender.as_ref())),
        None => {
            let from = envelope
                .sender
                .as_ref()
                .map_or("?".to_string(), |d| d.name.clone());
            let size = envelope.payload().map_or(0, |p| p.bytes.len());
            println!("* {} sent {} bytes of binary data", from, size);
        }
    }
}

/// Host a group until the user quits
pub async fn host(local: Device, config: SessionConfig, group: &str, demo: bool) -> Result<()> {
    let network = demo.then(LocalNetwork::new);
    let adapter: Arc<dyn DiscoveryAdapter> = match &network {
        Some(network) => Arc::new(network.adapter(&local)),
        None => Arc::new(MdnsAdapter::new(local.clone())?),
    };

    let owner = OwnerSession::new(local, config.clone(), adapter);
    owner.on_data_received(print_incoming);
    owner.on_client_connected(|d| println!("* {} joined", d.name));
    owner.on_client_disconnected(|d| println!("* {} left", d.name));

    let extra = BTreeMap::from([("version".to_string(), env!("CARGO_PKG_VERSION").to_string())]);
    owner.register_group(group, extra).await?;
    let port = owner.local_addr().await.map_or(0, |addr| addr.port());
    println!("Hosting \"{}\" on port {}. Type to chat, /who to list, /quit to stop.", group, port);

    let echo = match &network {
        Some(network) => Some(start_echo_peer(network, config).await?),
        None => None,
    };

    let mut console = Console::new();
    loop {
        match console.next().await {
            Input::Say(text) => owner.send_to_all(ChatLine::new(text).to_envelope()?).await,
            Input::Who => print!("{}", render_roster(None, &owner.roster().await)),
            Input::Quit => break,
            Input::Empty => {}
        }
    }

    if let Some(echo) = echo {
        echo.leave().await;
    }
    owner.shutdown().await;
    Ok(())
}

/// In-process member that repeats every chat line back to the group
async fn start_echo_peer(network: &LocalNetwork, config: SessionConfig) -> Result<Arc<MemberSession>> {
    let local = Device::local("echo");
    let member = Arc::new(MemberSession::new(
        local.clone(),
        config,
        Arc::new(network.adapter(&local)),
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    member.on_data_received(move |envelope| {
        if let Some(line) = ChatLine::from_envelope(envelope) {
            let _ = tx.send(line);
        }
    });

    let groups = member.discover(DEMO_DISCOVERY_WINDOW, |_| {}).await?;
    let group = groups.first().ok_or(AppError::NoGroups)?;
    member.join_group(group).await?;
    info!("Echo peer joined");

    let echo = member.clone();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let reply = match ChatLine::new(format!("echo: {}", line.text)).to_envelope() {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Failed to encode echo: {}", e);
                    continue;
                }
            };
            if let Err(e) = echo.send_to_all(reply).await {
                debug!("Echo peer stopped: {}", e);
                break;
            }
        }
    });

    Ok(member)
}

fn pick_group<'a>(groups: &'a [ServiceRecord], wanted: Option<&str>) -> Result<&'a ServiceRecord> {
    match wanted {
        Some(label) => groups
            .iter()
            .find(|r| r.attributes.group_label == label)
            .ok_or_else(|| AppError::NoSuchGroup(label.to_string())),
        None => groups.first().ok_or(AppError::NoGroups),
    }
}

/// Find a group, join it, and chat until the user quits or the owner goes away
pub async fn join(local: Device, config: SessionConfig, group: Option<&str>, window: Duration) -> Result<()> {
    let adapter = Arc::new(MdnsAdapter::new(local.clone())?);
    let member = MemberSession::new(local, config, adapter);

    println!("Looking for groups for {}s...", window.as_secs());
    let groups = member
        .discover(window, |record| {
            println!(
                "  found \"{}\" hosted by {}",
                record.attributes.group_label, record.device.name
            );
        })
        .await?;
    let record = pick_group(&groups, group)?;

    let owner_lost = Arc::new(Notify::new());
    let notify = owner_lost.clone();
    member.on_data_received(print_incoming);
    member.on_peer_connected(|d| println!("* {} joined", d.name));
    member.on_peer_disconnected(|d| println!("* {} left", d.name));
    member.on_owner_disconnected(move || notify.notify_one());

    member.join_group(record).await?;
    println!(
        "Joined \"{}\". Type to chat, /who to list, /quit to leave.",
        record.attributes.group_label
    );

    let mut console = Console::new();
    loop {
        tokio::select! {
            input = console.next() => match input {
                Input::Say(text) => member.send_to_all(ChatLine::new(text).to_envelope()?).await?,
                Input::Who => {
                    let owner = member.owner().await;
                    print!("{}", render_roster(owner.as_ref(), &member.roster().await));
                }
                Input::Quit => break,
                Input::Empty => {}
            },
            _ = owner_lost.notified() => {
                println!("* The group owner went away");
                return Ok(());
            }
        }
    }

    member.leave().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_net::ServiceAttributes;

    fn record(label: &str) -> ServiceRecord {
        ServiceRecord {
            instance: format!("{label}-instance"),
            device: Device::new("owner", label),
            attributes: ServiceAttributes {
                service_kind: "tether".into(),
                listen_port: 9999,
                group_label: label.into(),
                extra: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_pick_group() {
        let groups = vec![record("Study"), record("Games")];
        assert_eq!(pick_group(&groups, None).unwrap().attributes.group_label, "Study");
        assert_eq!(pick_group(&groups, Some("Games")).unwrap().attributes.group_label, "Games");
        assert!(matches!(pick_group(&groups, Some("Chess")), Err(AppError::NoSuchGroup(_))));
        assert!(matches!(pick_group(&[], None), Err(AppError::NoGroups)));
    }
}
