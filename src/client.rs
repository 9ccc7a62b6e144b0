// Client-side transfer drivers.
//
// A download or upload starts on the server's well-known port and then
// follows the source address of the first reply, which fixes the server's
// transfer ID for the rest of the exchange. The first reply also settles
// negotiation: an Oack locks in the granted options, a plain Data or Ack
// means the server ignored them and the transfer runs at the defaults.

use crate::options::{self, TransferOptions};
use crate::processor::{PacketProcessor, ResultAction};
use crate::session::{bind_ephemeral, Session, TransferError};
use crate::tftp::{ErrorCode, FileMode, Options, Packet, SocketError, TftpSocket};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub timeout: Duration,
    pub max_retries: u8,
    pub options: TransferOptions,
}

/// Sends the opening request until something answers or the retry budget
/// runs out. Replies from other hosts are ignored; the reply's source port
/// is the server's transfer ID and is up to the caller to adopt.
async fn exchange_request(
    sock: &TftpSocket,
    config: &ClientConfig,
    request: &Packet,
) -> Result<(Packet, SocketAddr), TransferError> {
    let mut retries: u8 = 0;
    sock.send(request, config.server).await.map_err(io_only)?;

    loop {
        match sock.recv_with_timeout(config.timeout).await {
            Ok((_, src)) if src.ip() != config.server.ip() => {
                log::warn!("reply from unexpected host {src}, still waiting");
            }
            Ok(reply) => return Ok(reply),
            Err(SocketError::Timeout(_)) => {
                retries += 1;
                if retries >= config.max_retries {
                    return Err(TransferError::Timeout);
                }
                log::debug!("no answer from {}, resending request", config.server);
                sock.send(request, config.server).await.map_err(io_only)?;
            }
            Err(SocketError::PacketParse(msg)) => {
                return Err(TransferError::Protocol(msg));
            }
            Err(SocketError::IO(e)) => return Err(TransferError::Io(e)),
        }
    }
}

fn io_only(e: SocketError) -> TransferError {
    match e {
        SocketError::IO(e) => TransferError::Io(e),
        other => TransferError::Protocol(other.to_string()),
    }
}

/// Validates the server's Oack; a bad grant is answered with error code 8
/// before giving up, so the server does not keep the session open.
async fn settle_oack(
    sock: &TftpSocket,
    peer: SocketAddr,
    wanted: &TransferOptions,
    granted: &Options,
) -> Result<TransferOptions, TransferError> {
    match options::accept_oack(wanted, granted) {
        Ok(agreed) => Ok(agreed),
        Err(e) => {
            let _ = sock
                .send(
                    &Packet::Error {
                        code: ErrorCode::OptionsRefused,
                        message: e.to_string(),
                    },
                    peer,
                )
                .await;
            Err(TransferError::Negotiation(e.to_string()))
        }
    }
}

/// Downloads `remote` from the server into `local`. The local file must not
/// already exist; on failure the partial download is removed. Returns the
/// number of payload bytes received.
pub async fn get(
    config: &ClientConfig,
    remote: &str,
    local: &Path,
) -> Result<u64, TransferError> {
    let file = File::create_new(local).await?;
    let result = run_get(config, remote, file).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(local).await;
    }
    result
}

async fn run_get(config: &ClientConfig, remote: &str, file: File) -> Result<u64, TransferError> {
    let sock = bind_ephemeral();
    let request = Packet::Rrq {
        filename: remote.to_string(),
        mode: FileMode::Octet,
        options: options::request_options(&config.options),
    };

    let (reply, peer) = exchange_request(&sock, config, &request).await?;
    log::debug!("downloading '{remote}' from {peer}");

    // The first reply decides the options and may already carry data.
    let (agreed, first_data) = match reply {
        Packet::Oack { options: granted } => {
            let agreed = settle_oack(&sock, peer, &config.options, &granted).await?;
            (agreed, None)
        }
        data @ Packet::Data { .. } => (TransferOptions::default(), Some(data)),
        Packet::Error { code, message } => return Err(TransferError::Peer(code, message)),
        other => {
            return Err(TransferError::Protocol(format!(
                "expected Oack or Data to open a download, got {other:?}"
            )))
        }
    };

    let mut processor = PacketProcessor::new_receiver(file, agreed);
    let initial = match first_data {
        None => vec![Packet::Ack { block: 0 }],
        Some(data) => match processor.process(&data).await {
            ResultAction::SendAndAwait(packets) => packets,
            ResultAction::RetryRecv => Vec::new(),
            ResultAction::Complete(final_packet) => {
                // The whole file fit in the opening block.
                if let Some(packet) = final_packet {
                    sock.send(&packet, peer).await.map_err(io_only)?;
                }
                return Ok(processor.bytes());
            }
            ResultAction::Terminate(final_packet, err) => {
                if let Some(packet) = final_packet {
                    let _ = sock.send(&packet, peer).await;
                }
                return Err(err);
            }
        },
    };

    Session::new(sock, peer, processor, config.timeout, config.max_retries)
        .run(initial)
        .await
}

/// Uploads `local` to the server as `remote`. Returns the number of payload
/// bytes sent.
pub async fn put(
    config: &ClientConfig,
    local: &Path,
    remote: &str,
) -> Result<u64, TransferError> {
    let file = File::open(local).await?;
    let sock = bind_ephemeral();
    let request = Packet::Wrq {
        filename: remote.to_string(),
        mode: FileMode::Octet,
        options: options::request_options(&config.options),
    };

    let (reply, peer) = exchange_request(&sock, config, &request).await?;
    log::debug!("uploading '{remote}' to {peer}");

    let agreed = match reply {
        Packet::Oack { options: granted } => {
            settle_oack(&sock, peer, &config.options, &granted).await?
        }
        Packet::Ack { block: 0 } => TransferOptions::default(),
        Packet::Error { code, message } => return Err(TransferError::Peer(code, message)),
        other => {
            return Err(TransferError::Protocol(format!(
                "expected Oack or Ack 0 to open an upload, got {other:?}"
            )))
        }
    };

    let mut processor = PacketProcessor::new_sender(file, agreed);
    let initial = match processor.start().await {
        ResultAction::SendAndAwait(packets) => packets,
        ResultAction::Terminate(final_packet, err) => {
            if let Some(packet) = final_packet {
                let _ = sock.send(&packet, peer).await;
            }
            return Err(err);
        }
        other => {
            return Err(TransferError::Protocol(format!(
                "unexpected opening action {other:?}"
            )))
        }
    };

    Session::new(sock, peer, processor, config.timeout, config.max_retries)
        .run(initial)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[tokio::test]
    async fn test_get_times_out_against_a_silent_server() {
        // A bound socket that never answers anything.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = silent.local_addr().unwrap();

        let tmpdir = TempDir::new("cli").unwrap();
        let local = tmpdir.path().join("out.bin");
        let config = ClientConfig {
            server,
            timeout: Duration::from_millis(50),
            max_retries: 2,
            options: TransferOptions::default(),
        };

        let err = get(&config, "f.bin", &local).await.unwrap_err();
        assert_eq!(err, TransferError::Timeout);
        // A failed download leaves no partial file behind.
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_get_refuses_to_clobber_local_file() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = silent.local_addr().unwrap();

        let tmpdir = TempDir::new("cli").unwrap();
        let local = tmpdir.path().join("kept.bin");
        std::fs::write(&local, b"precious").unwrap();

        let config = ClientConfig {
            server,
            timeout: Duration::from_millis(50),
            max_retries: 2,
            options: TransferOptions::default(),
        };

        match get(&config, "f.bin", &local).await.unwrap_err() {
            TransferError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("expected an IO error, got {other:?}"),
        }
        assert_eq!(std::fs::read(&local).unwrap(), b"precious");
    }
}
