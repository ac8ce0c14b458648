//! Minimal QoS 0 MQTT 3.1.1 client core.
//!
//! The crate contains what a from-scratch client needs to be self-sufficient:
//!
//! - **Codec**: incremental packet encoding and decoding ([`protocol`])
//! - **Session**: the connection state machine, packet identifiers,
//!   SUBACK / UNSUBACK tracking and keep-alive ([`Session`])
//! - **Queue**: a bounded inbound message queue ([`MessageQueue`])
//! - **Transport**: the byte-stream boundary ([`Transport`], [`TcpTransport`])
//!
//! ## Components
//!
//! - [`Client`]: synchronous client, advanced by calling [`Client::pump`]
//! - [`AsyncClient`]: client driven by a background tokio task
//!
//! ## Example
//!
//! ```no_run
//! use mqttc::{Client, ClientConfig, QoS};
//!
//! fn main() -> mqttc::Result<()> {
//!     let mut client = Client::new(ClientConfig::new())?;
//!     client.connect("mqtt://127.0.0.1:1883", None, None)?;
//!
//!     client.subscribe("sensors/+/temp", QoS::AtMostOnce)?;
//!     client.publish("sensors/1/temp", "21.5", QoS::AtMostOnce, false)?;
//!
//!     loop {
//!         client.pump()?;
//!         for msg in client.drain_messages() {
//!             println!("{}: {:?}", msg.topic, msg.payload);
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(50));
//!     }
//! }
//! ```

mod async_client;
mod client;
mod error;
pub mod protocol;
mod queue;
mod session;
pub mod topic;
pub mod transport;
mod types;

pub use async_client::AsyncClient;
pub use client::{Client, ClientConfig, generate_client_id};
pub use error::{Error, ProtocolError, Result};
pub use queue::{DEFAULT_QUEUE_CAPACITY, MessageQueue};
pub use session::Session;
pub use transport::{TcpTransport, Transport, TransportType};
pub use types::{ConnectReturnCode, Event, Message, PacketType, QoS, State};
