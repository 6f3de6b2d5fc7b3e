//! crossbus-broker: standalone bus broker
//!
//! Hosts the socket hub of a bus for transports and bridges in other
//! processes.
//!
//! ## Architecture
//! ```text
//! [transport] --\
//! [transport] ---(TCP 127.0.0.1 | UDS)--> [crossbus-broker]
//! [bridge]    --/
//! ```
//!
//! ## Configuration
//! - CROSSBUS__PORT: TCP port on 127.0.0.1 (default: 45010)
//! - CROSSBUS__PATH: Unix domain socket path; takes precedence over the port
//! - CROSSBUS_CONFIG: alternate settings file (default: crossbus.{yaml,toml,...})
//! - CROSSBUS_LOG: tracing filter (default: info)

use tracing::info;

use crossbus::bootstrap::init_tracing;
use crossbus::{Broker, BrokerSettings};

const DEFAULT_PORT: u16 = 45010;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let settings = BrokerSettings::load()?;
    let broker = Broker::listen(settings.into_options(DEFAULT_PORT)).await?;
    info!("crossbus-broker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    broker.close().await?;

    Ok(())
}
