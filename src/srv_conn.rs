// This module contains the server-side connection handler.
//
// A connection starts when the dispatcher hands over a decoded read or write
// request. The handler works in three stages:
//
// 1. Vet the request: transfer mode, option negotiation, and whether the
//    filesystem can service it at all. Every failure here is answered with
//    an Error packet and the connection never becomes a session.
// 2. Bind a fresh ephemeral port — the server's transfer ID — and decide the
//    opening packets: an Oack when options were negotiated, otherwise the
//    first data window (read) or the zeroth acknowledgment (write).
// 3. Hand the rest to the session loop, which runs the windowed exchange to
//    a terminal state.

use crate::options::{self, OptionLimits};
use crate::processor::{PacketProcessor, ResultAction};
use crate::session::{bind_ephemeral, RoutedRx, Session, TransferError};
use crate::storage::{FileStore, StorageError, WriteMode};
use crate::tftp::{ErrorCode, FileMode, Options, Packet, TftpSocket};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    pub timeout: Duration,
    pub max_retries: u8,
    pub limits: OptionLimits,
    pub write_mode: WriteMode,
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

struct VettedRequest {
    filename: String,
    options: Options,
    is_read: bool,
}

fn vet(request: Packet, peer: SocketAddr) -> Result<VettedRequest, (ErrorCode, String)> {
    let (filename, mode, options, is_read) = match request {
        Packet::Rrq {
            filename,
            mode,
            options,
        } => (filename, mode, options, true),
        Packet::Wrq {
            filename,
            mode,
            options,
        } => (filename, mode, options, false),
        other => {
            return Err((
                ErrorCode::Illegal,
                format!("only read and write requests open a connection, got {other:?}"),
            ))
        }
    };

    match mode {
        FileMode::Mail => {
            return Err((
                ErrorCode::Undefined,
                "mail mode is unsupported".to_string(),
            ))
        }
        FileMode::NetAscii => {
            // No line-ending translation; the payload passes through as-is.
            log::warn!("{peer}: netascii requested, serving raw octets");
        }
        FileMode::Octet => {}
    }

    Ok(VettedRequest {
        filename,
        options,
        is_read,
    })
}

/// Services one read or write request through to a terminal state. Returns
/// the number of payload bytes moved.
pub async fn handle_request(
    request: Packet,
    peer: SocketAddr,
    store: FileStore,
    config: ConnConfig,
    routed: RoutedRx,
) -> Result<u64, TransferError> {
    let sock = bind_ephemeral();

    let vetted = match vet(request, peer) {
        Ok(v) => v,
        Err((code, message)) => {
            send_error_packet(&sock, peer, code, message.clone()).await;
            return Err(TransferError::Protocol(message));
        }
    };

    let (agreed, oack) = match options::negotiate(&vetted.options, &config.limits) {
        Ok(result) => result,
        Err(e) => {
            send_error_packet(&sock, peer, ErrorCode::OptionsRefused, e.to_string()).await;
            return Err(TransferError::Negotiation(e.to_string()));
        }
    };
    log::info!(
        "{peer}: {} '{}' (blksize {}, windowsize {})",
        if vetted.is_read { "read" } else { "write" },
        vetted.filename,
        agreed.block_size,
        agreed.window_size
    );

    let open = if vetted.is_read {
        store.open_read(&vetted.filename).await
    } else {
        store.create_write(&vetted.filename, config.write_mode).await
    };
    let file = match open {
        Ok(f) => f,
        Err(StorageError { code, message }) => {
            send_error_packet(&sock, peer, code, message.clone()).await;
            return Err(TransferError::Storage(code, message));
        }
    };

    let mut processor = if vetted.is_read {
        PacketProcessor::new_sender(file, agreed)
    } else {
        PacketProcessor::new_receiver(file, agreed)
    };

    // With options on the table the Oack opens the exchange and the peer's
    // answer starts the transfer; otherwise we lead with data or Ack(0)
    // directly.
    let initial = match oack {
        Some(oack) => vec![oack],
        None => match processor.start().await {
            ResultAction::SendAndAwait(packets) => packets,
            ResultAction::Terminate(packet, err) => {
                if let Some(packet) = packet {
                    let _ = sock.send(&packet, peer).await;
                }
                return Err(err);
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "unexpected opening action {other:?}"
                )))
            }
        },
    };

    Session::new(sock, peer, processor, config.timeout, config.max_retries)
        .with_routing(routed)
        .run(initial)
        .await
}
