//! Tether Network Library
//!
//! Small peer groups over a local network: one owner, any number of
//! members, one JSON message per TCP connection.
//!
//! # Architecture
//!
//! - **Owner**: Advertises a group, keeps the roster, introduces members to each other
//! - **Member**: Finds a group, registers with the owner, talks to peers directly
//! - **Discovery**: Pluggable substrate ([`MdnsAdapter`] on a LAN, [`LocalNetwork`] in-process)
//! - **Protocol**: JSON envelopes, read until the sender closes its half
//!
//! # Usage
//!
//! ```ignore
//! // Owner advertises a group
//! let owner = OwnerSession::new(me, config, Arc::new(MdnsAdapter::new(me.clone())?));
//! owner.on_data_received(|envelope| println!("{:?}", envelope.body));
//! owner.register_group("Study", BTreeMap::new()).await?;
//!
//! // Member finds it and joins
//! let member = MemberSession::new(you, config, adapter);
//! let groups = member.discover(Duration::from_secs(5), |_| {}).await?;
//! member.join_group(&groups[0]).await?;
//! member.send_to_all(Envelope::text("hello")).await?;
//! ```

pub mod discovery;
pub mod error;
mod frame;
pub mod local;
pub mod mdns;
pub mod member;
mod observer;
pub mod owner;
pub mod protocol;
pub mod transport;

pub use discovery::{AdapterEvent, DiscoveryAdapter, ServiceAttributes, ServiceRecord};
pub use error::{DiscoveryError, Error, Result};
pub use local::{LocalAdapter, LocalNetwork};
pub use mdns::MdnsAdapter;
pub use member::{MemberSession, MemberState};
pub use owner::{OwnerSession, OwnerState};
pub use protocol::{Body, ContentType, Envelope, MessageKind, Payload};
pub use tether_core::{Device, DeviceKey, SessionConfig, DEFAULT_OWNER_PORT};
