// Server dispatcher.
//
// One socket listens on the well-known port. Read and write requests each
// spawn a connection task with its own ephemeral socket; everything else
// arriving here is either routed to the session that owns the sender's
// address or answered with an unknown-TID error. The routing table is the
// only state the dispatcher keeps.

use crate::options::OptionLimits;
use crate::session::RoutedTx;
use crate::srv_conn::{self, ConnConfig};
use crate::storage::{FileStore, WriteMode};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub root: PathBuf,
    pub timeout: Duration,
    pub max_retries: u8,
    pub limits: OptionLimits,
    pub write_mode: WriteMode,
}

pub struct Server {
    sock: TftpSocket,
    store: FileStore,
    config: ServerConfig,
    sessions: Arc<Mutex<HashMap<SocketAddr, RoutedTx>>>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> anyhow::Result<Server> {
        let store = FileStore::new(&config.root)?;
        let sock = TftpSocket::bind(config.listen)?;
        Ok(Server {
            sock,
            store,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Accepts requests forever. Only a socket failure on the listening port
    /// brings the server down; per-connection failures are logged and the
    /// dispatcher moves on.
    pub async fn serve(&self) -> anyhow::Result<()> {
        log::info!(
            "serving {} on {}",
            self.config.root.display(),
            self.local_addr()?
        );
        loop {
            match self.sock.recv().await {
                Ok((packet, peer)) => self.dispatch(packet, peer).await,
                Err(SocketError::PacketParse(msg)) => {
                    log::debug!("dropping undecodable datagram: {msg}");
                }
                Err(SocketError::IO(e)) => return Err(e.into()),
                Err(SocketError::Timeout(_)) => {}
            }
        }
    }

    async fn dispatch(&self, packet: Packet, peer: SocketAddr) {
        match packet {
            request @ (Packet::Rrq { .. } | Packet::Wrq { .. }) => {
                let mut sessions = self.sessions.lock().await;
                if sessions.contains_key(&peer) {
                    // A retransmitted request; the session already answered
                    // (or is about to) from its own port.
                    log::debug!("{peer}: request while a session is active, dropping");
                    return;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                sessions.insert(peer, tx);
                drop(sessions);

                let store = self.store.clone();
                let config = ConnConfig {
                    timeout: self.config.timeout,
                    max_retries: self.config.max_retries,
                    limits: self.config.limits,
                    write_mode: self.config.write_mode,
                };
                let table = Arc::clone(&self.sessions);
                tokio::spawn(async move {
                    let started = Instant::now();
                    match srv_conn::handle_request(request, peer, store, config, rx).await {
                        Ok(bytes) => {
                            let secs = started.elapsed().as_secs_f64().max(1e-6);
                            log::info!(
                                "{peer}: moved {bytes} bytes in {secs:.2}s ({:.0} KiB/s)",
                                bytes as f64 / 1024.0 / secs
                            );
                        }
                        Err(e) => log::warn!("{peer}: transfer failed: {e}"),
                    }
                    table.lock().await.remove(&peer);
                });
            }
            other => {
                let routed = self.sessions.lock().await.get(&peer).cloned();
                match routed {
                    Some(tx) => {
                        // The peer kept talking to the well-known port; its
                        // session still gets to see the packet.
                        let _ = tx.send(other);
                    }
                    None => {
                        log::debug!("{peer}: {other:?} without a session");
                        let _ = self
                            .sock
                            .send(
                                &Packet::Error {
                                    code: ErrorCode::UnknownTid,
                                    message: "unknown transfer ID".to_string(),
                                },
                                peer,
                            )
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{self, ClientConfig};
    use crate::options::TransferOptions;
    use crate::session::TransferError;
    use std::path::Path;
    use tempdir::TempDir;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn spawn_server(root: &Path, write_mode: WriteMode) -> SocketAddr {
        let server = Server::bind(ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            root: root.into(),
            timeout: Duration::from_millis(200),
            max_retries: 5,
            limits: OptionLimits::default(),
            write_mode,
        })
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve().await;
        });
        addr
    }

    fn client_config(server: SocketAddr, options: TransferOptions) -> ClientConfig {
        ClientConfig {
            server,
            timeout: Duration::from_millis(200),
            max_retries: 5,
            options,
        }
    }

    #[tokio::test]
    async fn test_loopback_download_with_negotiation() {
        let tmpdir = TempDir::new("srv").unwrap();
        let payload = patterned(5000);
        std::fs::write(tmpdir.path().join("remote.bin"), &payload).unwrap();
        let addr = spawn_server(tmpdir.path(), WriteMode::New);

        let out = tmpdir.path().join("fetched.bin");
        let config = client_config(
            addr,
            TransferOptions {
                block_size: 1024,
                window_size: 4,
            },
        );
        let bytes = client::get(&config, "remote.bin", &out).await.unwrap();
        assert_eq!(bytes, 5000);
        assert_eq!(std::fs::read(out).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_loopback_download_legacy_defaults() {
        let tmpdir = TempDir::new("srv").unwrap();
        // An exact multiple of the block size, so EOF needs the empty block.
        let payload = patterned(1024);
        std::fs::write(tmpdir.path().join("even.bin"), &payload).unwrap();
        let addr = spawn_server(tmpdir.path(), WriteMode::New);

        let out = tmpdir.path().join("even-out.bin");
        let config = client_config(addr, TransferOptions::default());
        let bytes = client::get(&config, "even.bin", &out).await.unwrap();
        assert_eq!(bytes, 1024);
        assert_eq!(std::fs::read(out).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_loopback_upload_with_negotiation() {
        let srv_dir = TempDir::new("srv").unwrap();
        let cli_dir = TempDir::new("cli").unwrap();
        let payload = patterned(10_000);
        let local = cli_dir.path().join("upload.bin");
        std::fs::write(&local, &payload).unwrap();
        let addr = spawn_server(srv_dir.path(), WriteMode::New);

        let config = client_config(
            addr,
            TransferOptions {
                block_size: 512,
                window_size: 8,
            },
        );
        let bytes = client::put(&config, &local, "stored.bin").await.unwrap();
        assert_eq!(bytes, 10_000);
        assert_eq!(
            std::fs::read(srv_dir.path().join("stored.bin")).unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn test_download_of_missing_file_reports_peer_error() {
        let tmpdir = TempDir::new("srv").unwrap();
        let addr = spawn_server(tmpdir.path(), WriteMode::New);

        let out = tmpdir.path().join("never.bin");
        let config = client_config(addr, TransferOptions::default());
        let err = client::get(&config, "no-such-file", &out).await.unwrap_err();
        match err {
            TransferError::Peer(code, _) => assert_eq!(code, ErrorCode::FileNotFound),
            other => panic!("expected a peer error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_refused_when_target_exists() {
        let srv_dir = TempDir::new("srv").unwrap();
        let cli_dir = TempDir::new("cli").unwrap();
        std::fs::write(srv_dir.path().join("taken.bin"), b"old").unwrap();
        let local = cli_dir.path().join("new.bin");
        std::fs::write(&local, b"new contents").unwrap();
        let addr = spawn_server(srv_dir.path(), WriteMode::New);

        let config = client_config(addr, TransferOptions::default());
        let err = client::put(&config, &local, "taken.bin").await.unwrap_err();
        match err {
            TransferError::Peer(code, _) => assert_eq!(code, ErrorCode::FileAlreadyExists),
            other => panic!("expected a peer error, got {other:?}"),
        }
        assert_eq!(std::fs::read(srv_dir.path().join("taken.bin")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_upload_refused_when_writes_disabled() {
        let srv_dir = TempDir::new("srv").unwrap();
        let cli_dir = TempDir::new("cli").unwrap();
        let local = cli_dir.path().join("blocked.bin");
        std::fs::write(&local, b"never stored").unwrap();
        let addr = spawn_server(srv_dir.path(), WriteMode::Disabled);

        let config = client_config(addr, TransferOptions::default());
        let err = client::put(&config, &local, "blocked.bin").await.unwrap_err();
        match err {
            TransferError::Peer(code, _) => assert_eq!(code, ErrorCode::AccessViolation),
            other => panic!("expected a peer error, got {other:?}"),
        }
        assert!(!srv_dir.path().join("blocked.bin").exists());
    }
}
