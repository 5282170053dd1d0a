//! `pairwire` establishes peer-to-peer [webrtc](https://webrtc.rs) data channel sessions between
//! two peers sharing a pairing code:
//! - Negotiation runs over one of two signaling strategies: a public signaling relay with room
//!   semantics and trickle ICE, or an application-hosted message bus exchanging a single offer
//!   and answer with all candidates bundled in.
//! - Connection and channel lifecycle is reported to listeners through an ordered notification
//!   queue, so no application code runs on engine or signaling tasks.
//! - It's build around async Rust.
//!
//! Atm. this library is focused on Data Channels, media tracks are not supported.
//!
//! # Examples
//!
//! ```no_run
//! use pairwire::{Channel, ChannelListener, ChannelState, Configuration, ConnectionFactory, Error};
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! impl ChannelListener for Print {
//!     fn on_state_change(&self, state: ChannelState) {
//!         println!("channel is {state:?}");
//!     }
//!
//!     fn on_message(&self, message: &str) {
//!         println!("received: {message}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     // both peers use the same pairing code, the relay puts them into the same room
//!     let config = Configuration::new("test-session")
//!         .with_signaling_url("https://signaling.example.com")?;
//!     let conn = ConnectionFactory::new()?.create_connection(config).await?;
//!     conn.connected().await?;
//!
//!     let chat: Channel = conn.create_channel("chat").await?;
//!     chat.add_listener(Arc::new(Print));
//!     // wait for ChannelState::Open before sending
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod description;
pub mod engine;
pub mod error;
pub mod factory;
pub mod host_bus;
pub mod listener;
pub mod payload;
pub mod signaling;

pub use channel::{Channel, ChannelState};
pub use config::{Configuration, IceServer, RtcConfig, Strategy};
pub use connection::{Connection, ConnectionState};
pub use error::Error;
pub use factory::ConnectionFactory;
pub use host_bus::{BusEndpoint, HostBus, LocalHostBus};
pub use listener::{ChannelListener, ConnectionListener};
pub use signaling::{HttpRelay, MemoryRelay, RelayService};
