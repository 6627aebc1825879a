//! Control panel polling one PD over TCP
//!
//! ```text
//! OSDP_HOST=192.168.1.50 OSDP_PORT=4000 OSDP_ADDRESS=0 cargo run --example control_panel
//! ```
//!
//! Set `OSDP_KEY` to 32 hex digits to require a secure channel.

use anyhow::Context;
use osdp::{ControlPanel, DeviceOptions, Event, ReplyData, TcpClientTransport};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let host = std::env::var("OSDP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("OSDP_PORT")
        .unwrap_or_else(|_| "4000".to_string())
        .parse()
        .context("OSDP_PORT")?;
    let address: u8 = std::env::var("OSDP_ADDRESS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .context("OSDP_ADDRESS")?;

    let mut options = DeviceOptions::new(address);
    if let Ok(key) = std::env::var("OSDP_KEY") {
        let key: [u8; 16] = hex::decode(key.trim())
            .context("OSDP_KEY is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("OSDP_KEY must be 16 bytes"))?;
        options = options.with_secure_channel(key);
    }

    let panel = ControlPanel::new();
    let mut events = panel.subscribe();

    let connection = panel.start_connection(TcpClientTransport::new(host, port));
    panel.add_device(connection, options).await?;

    println!("Polling device {}; Ctrl-C to stop", address);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event? {
                Event::ConnectionStatusChanged { online, secure, .. } => {
                    println!("Device {}: online={} secure={}", address, online, secure);
                    if online {
                        match panel.id_report(connection, address).await {
                            Ok(id) => println!("Device {}: {}", address, id),
                            Err(e) => println!("Device {}: identification failed: {}", address, e),
                        }
                    }
                }
                Event::CardRead { card, .. } => {
                    println!("Card: {} bits {}", card.bit_count, hex::encode(&card.data));
                }
                Event::KeypadEntered { keypad, .. } => {
                    println!("Keypad: {:?}", keypad.digits);
                }
                Event::NakReceived { command, code, .. } => {
                    println!("{} rejected: {}", command, code);
                }
                Event::ReplyReceived { reply: ReplyData::Raw { code, data }, .. } => {
                    println!("Reply 0x{:02X}: {}", code, hex::encode(&data));
                }
                _ => {}
            },
        }
    }

    panel.shutdown().await;
    Ok(())
}
