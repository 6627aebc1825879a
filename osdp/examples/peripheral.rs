//! Peripheral device listening for an ACU over TCP
//!
//! ```text
//! OSDP_PORT=4000 OSDP_ADDRESS=0 cargo run --example peripheral
//! ```
//!
//! Type a card number on stdin to report it on the next poll.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use osdp::{CommandHandler, ConfigurationStore, Device, DeviceConfiguration, Reply, TcpServerTransport};
use osdp_types::{RawCardData, ReplyPayload};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Reports queued cards on poll
#[derive(Default)]
struct Reader {
    cards: Mutex<VecDeque<RawCardData>>,
}

#[async_trait]
impl CommandHandler for Reader {
    async fn poll(&self, _configuration: &DeviceConfiguration) -> Reply {
        match self.cards.lock().pop_front() {
            Some(card) => card.into_reply(),
            None => Reply::Ack,
        }
    }
}

struct Shared(Arc<Reader>);

#[async_trait]
impl CommandHandler for Shared {
    async fn poll(&self, configuration: &DeviceConfiguration) -> Reply {
        self.0.poll(configuration).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port: u16 = std::env::var("OSDP_PORT").unwrap_or_else(|_| "4000".to_string()).parse()?;
    let address: u8 = std::env::var("OSDP_ADDRESS").unwrap_or_else(|_| "0".to_string()).parse()?;

    let store = Arc::new(ConfigurationStore::new(DeviceConfiguration::new(address)));
    let reader = Arc::new(Reader::default());
    let cancel = CancellationToken::new();

    let mut device = Device::new(TcpServerTransport::new("0.0.0.0", port), store, Shared(Arc::clone(&reader)));
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move { device.run(cancel).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let Ok(number) = line.trim().parse::<u32>() else {
                    println!("Not a card number: {}", line);
                    continue;
                };
                reader.cards.lock().push_back(RawCardData {
                    reader_number: 0,
                    format: 0,
                    bit_count: 32,
                    data: Bytes::copy_from_slice(&number.to_be_bytes()),
                });
                println!("Card {} queued", number);
            }
        }
    }

    cancel.cancel();
    server.await??;
    Ok(())
}
