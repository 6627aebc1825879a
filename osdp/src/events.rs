//! Typed notifications published by the control panel
//!
//! Buses hand raw session events to an unbounded queue without waiting; a
//! dispatch worker decodes them and publishes [`Event`]s on a broadcast
//! channel.

use osdp_core::{CommandCode, ErrorCode, Reply, SessionEvent};
use osdp_types::{FileTransferStatus, KeypadData, RawCardData, ReplyData, parse_reply};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Identifies one bus started on a control panel
pub type ConnectionId = u64;

/// Something observed on a bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A device went online or offline, or its secure channel changed
    ConnectionStatusChanged {
        connection: ConnectionId,
        address: u8,
        online: bool,
        secure: bool,
    },

    /// A device rejected a command
    NakReceived {
        connection: ConnectionId,
        address: u8,
        command: CommandCode,
        code: ErrorCode,
    },

    /// Card data from a reader
    CardRead {
        connection: ConnectionId,
        address: u8,
        card: RawCardData,
    },

    /// Keys pressed on a reader keypad
    KeypadEntered {
        connection: ConnectionId,
        address: u8,
        keypad: KeypadData,
    },

    /// Progress of a file transfer
    FileTransferStatus {
        connection: ConnectionId,
        address: u8,
        status: FileTransferStatus,
    },

    /// Any other reply; codes without a typed decoder arrive as [`ReplyData::Raw`]
    ReplyReceived {
        connection: ConnectionId,
        address: u8,
        command: CommandCode,
        reply: ReplyData,
    },
}

impl Event {
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::ConnectionStatusChanged { connection, .. }
            | Self::NakReceived { connection, .. }
            | Self::CardRead { connection, .. }
            | Self::KeypadEntered { connection, .. }
            | Self::FileTransferStatus { connection, .. }
            | Self::ReplyReceived { connection, .. } => *connection,
        }
    }

    pub fn address(&self) -> u8 {
        match self {
            Self::ConnectionStatusChanged { address, .. }
            | Self::NakReceived { address, .. }
            | Self::CardRead { address, .. }
            | Self::KeypadEntered { address, .. }
            | Self::FileTransferStatus { address, .. }
            | Self::ReplyReceived { address, .. } => *address,
        }
    }

    /// Check if the event concerns `address` on `connection`
    pub fn is_from(&self, connection: ConnectionId, address: u8) -> bool {
        self.connection() == connection && self.address() == address
    }
}

/// A session event tagged with where it happened
#[derive(Debug)]
pub(crate) struct BusEvent {
    pub connection: ConnectionId,
    pub address: u8,
    pub event: SessionEvent,
}

fn decode(connection: ConnectionId, address: u8, command: CommandCode, reply: Reply) -> Event {
    if let Reply::Nak(code) = reply {
        return Event::NakReceived {
            connection,
            address,
            command,
            code,
        };
    }

    let reply = parse_reply(&reply).unwrap_or_else(|e| {
        warn!("Connection {} device {}: malformed {}: {}", connection, address, reply, e);
        ReplyData::Raw {
            code: reply.code(),
            data: reply.data(),
        }
    });

    match reply {
        ReplyData::RawCard(card) => Event::CardRead {
            connection,
            address,
            card,
        },
        ReplyData::Keypad(keypad) => Event::KeypadEntered {
            connection,
            address,
            keypad,
        },
        ReplyData::FileTransferStatus(status) => Event::FileTransferStatus {
            connection,
            address,
            status,
        },
        reply => Event::ReplyReceived {
            connection,
            address,
            command,
            reply,
        },
    }
}

/// Turn a session event into the published form
fn translate(bus_event: BusEvent) -> Option<Event> {
    let BusEvent {
        connection,
        address,
        event,
    } = bus_event;

    match event {
        SessionEvent::ConnectionStatus { online, secure } => Some(Event::ConnectionStatusChanged {
            connection,
            address,
            online,
            secure,
        }),
        SessionEvent::Reply { command, reply } => Some(decode(connection, address, command, reply)),
        // Routed straight to the waiting caller by the bus
        SessionEvent::Completed { .. } => None,
    }
}

/// Drain `queue` and publish until every bus has dropped its sender
pub(crate) fn spawn_dispatcher(
    mut queue: mpsc::UnboundedReceiver<BusEvent>,
    publisher: broadcast::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bus_event) = queue.recv().await {
            if let Some(event) = translate(bus_event) {
                trace!("Publishing {:?}", event);
                // Nobody listening is fine
                let _ = publisher.send(event);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use osdp_core::ReplyCode;
    use pretty_assertions::assert_eq;

    fn reply_event(reply: Reply) -> Option<Event> {
        translate(BusEvent {
            connection: 1,
            address: 2,
            event: SessionEvent::Reply {
                command: CommandCode::Poll,
                reply,
            },
        })
    }

    #[test]
    fn test_card_read() {
        let event = reply_event(Reply::new(ReplyCode::RawReaderData, vec![0x00, 0x00, 0x08, 0x00, 0xAB]));
        assert_eq!(
            event,
            Some(Event::CardRead {
                connection: 1,
                address: 2,
                card: RawCardData {
                    reader_number: 0,
                    format: 0,
                    bit_count: 8,
                    data: Bytes::from_static(&[0xAB]),
                },
            })
        );
    }

    #[test]
    fn test_nak() {
        let event = reply_event(Reply::Nak(ErrorCode::UnknownCommandCode)).unwrap();
        assert!(matches!(
            event,
            Event::NakReceived {
                code: ErrorCode::UnknownCommandCode,
                ..
            }
        ));
        assert!(event.is_from(1, 2));
    }

    #[test]
    fn test_malformed_reply_stays_raw() {
        let event = reply_event(Reply::new(ReplyCode::IdReport, vec![0x01])).unwrap();
        assert_eq!(
            event,
            Event::ReplyReceived {
                connection: 1,
                address: 2,
                command: CommandCode::Poll,
                reply: ReplyData::Raw {
                    code: 0x45,
                    data: Bytes::from_static(&[0x01]),
                },
            }
        );
    }

    #[test]
    fn test_completion_not_published() {
        let event = translate(BusEvent {
            connection: 1,
            address: 2,
            event: SessionEvent::Completed {
                ticket: 7,
                result: Ok(Reply::Ack),
            },
        });
        assert_eq!(event, None);
    }

    #[tokio::test]
    async fn test_dispatcher_publishes() {
        let (queue, rx) = mpsc::unbounded_channel();
        let (publisher, mut subscriber) = broadcast::channel(8);
        let worker = spawn_dispatcher(rx, publisher);

        queue
            .send(BusEvent {
                connection: 3,
                address: 4,
                event: SessionEvent::ConnectionStatus {
                    online: true,
                    secure: false,
                },
            })
            .unwrap();
        drop(queue);

        let event = subscriber.recv().await.unwrap();
        assert_eq!(
            event,
            Event::ConnectionStatusChanged {
                connection: 3,
                address: 4,
                online: true,
                secure: false,
            }
        );
        worker.await.unwrap();
    }
}
