//! Cross-process publish/subscribe message bus with request/response
//! semantics.
//!
//! Peers exchange JSON values on named channels through three cooperating
//! pieces:
//!
//! - [`Transport`]: the client-side engine; any number of [`BusClient`]s
//!   share one connector link.
//! - [`Broker`]: the socket hub a bus runs on (TCP or Unix domain socket).
//! - [`Bridge`]: joins a host process, its embedded contexts and the socket
//!   bus into one logical bus.
//!
//! ```no_run
//! use crossbus::command::ProcessKind;
//! use crossbus::{handler_fn, Broker, BusOptions, SocketConnector, Transport};
//!
//! # async fn run() -> crossbus::Result<()> {
//! let broker = Broker::listen(BusOptions::new().with_port(0)).await?;
//! let port = broker.local_addr().unwrap().port();
//!
//! let transport = Transport::new(SocketConnector::new(ProcessKind::Node));
//! let client = transport.client();
//! client.connect(BusOptions::new().with_port(port)).await?;
//! client
//!     .add_listener(
//!         "news",
//!         handler_fn(|event, args| async move {
//!             println!("{}: {:?}", event.channel, args);
//!         }),
//!     )
//!     .await;
//! client.send("news", vec![serde_json::json!("hello")]).await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod bridge;
pub mod broker;
pub mod command;
pub mod config;
pub mod connector;
pub mod error;
pub mod packet;
pub mod transport;

pub use bridge::Bridge;
pub use broker::Broker;
pub use config::{BrokerSettings, BusOptions};
pub use connector::SocketConnector;
pub use error::{BusError, Result};
pub use transport::{
    handler_fn, BusClient, BusEvent, ListenerHandle, MessageHandler, RequestContext,
    RequestResponse, Transport,
};
