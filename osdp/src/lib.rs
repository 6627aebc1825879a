//! # osdp
//!
//! Open Supervised Device Protocol for both ends of the bus.
//!
//! ## Features
//!
//! - Control panel (ACU) polling any number of buses and devices
//! - Peripheral device (PD) serving loop
//! - Secure channel with AES-128 session keys
//! - Multi-part file transfer and PIV data reads
//! - Serial, TCP and in-memory transports
//!
//! ## Quick Start
//!
//! ```no_run
//! use osdp::{ControlPanel, DeviceOptions, Event, TcpClientTransport};
//!
//! #[tokio::main]
//! async fn main() -> osdp::Result<()> {
//!     let panel = ControlPanel::new();
//!     let mut events = panel.subscribe();
//!
//!     let connection = panel.start_connection(TcpClientTransport::new("192.168.1.50", 4000));
//!     panel.add_device(connection, DeviceOptions::new(0)).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let Event::CardRead { card, .. } = event {
//!             println!("Card: {:02X?}", card.data);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

mod bus;
pub mod config;
pub mod control_panel;
pub mod device;
pub mod error;
pub mod events;

// Re-exports
pub use bus::DeviceStatus;
pub use config::{BusOptions, ConfigurationStore, DeviceConfiguration};
pub use control_panel::ControlPanel;
pub use device::{CommandHandler, DefaultHandler, Device};
pub use error::{Error, Result};
pub use events::{ConnectionId, Event};

// Re-export protocol types
pub use osdp_core::{
    Command, CommandCode, DeviceOptions, ErrorCode, IncomingCommand, Key, Reply, ReplyCode,
};
pub use osdp_transport::{MemoryTransport, TcpClientTransport, TcpServerTransport, Transport};
#[cfg(feature = "serial")]
pub use osdp_transport::SerialTransport;
pub use osdp_types::ReplyData;
