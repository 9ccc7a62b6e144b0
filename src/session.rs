// Per-transfer session driver.
//
// A session owns one transfer end to end: the ephemeral socket, the fixed
// peer address (the transfer ID), the retransmission timer and retry budget.
// Packet semantics live in the processor; this loop only moves datagrams,
// enforces deadlines and answers strangers. Each session runs on its own
// task and shares nothing with its siblings.

use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Why a transfer stopped short of completion.
#[derive(Debug)]
pub enum TransferError {
    /// Retry budget exhausted. Local condition only, never sent on the wire.
    Timeout,

    /// The peer sent an Error packet. Never answered, to avoid loops.
    Peer(ErrorCode, String),

    /// The peer sent something out of contract for the current state.
    Protocol(String),

    /// Option negotiation failed; the peer gets error code 8.
    Negotiation(String),

    /// The storage collaborator failed; the peer gets the mapped code.
    Storage(ErrorCode, String),

    /// Local socket trouble.
    Io(io::Error),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Timeout => write!(f, "transfer timed out"),
            TransferError::Peer(code, msg) => write!(f, "peer error ({code}): {msg}"),
            TransferError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            TransferError::Negotiation(msg) => write!(f, "{msg}"),
            TransferError::Storage(code, msg) => write!(f, "storage error ({code}): {msg}"),
            TransferError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(e)
    }
}

// Io errors compare by kind so processor actions stay comparable in tests.
impl PartialEq for TransferError {
    fn eq(&self, other: &Self) -> bool {
        use TransferError::*;
        match (self, other) {
            (Timeout, Timeout) => true,
            (Peer(a, b), Peer(c, d)) => a == c && b == d,
            (Protocol(a), Protocol(b)) => a == b,
            (Negotiation(a), Negotiation(b)) => a == b,
            (Storage(a, b), Storage(c, d)) => a == c && b == d,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

/// Binds a transfer socket on a random high port, retrying until one is
/// free. The chosen port becomes this end's transfer ID.
pub fn bind_ephemeral() -> TftpSocket {
    let mut rng = rand::thread_rng();
    loop {
        let port = rng.gen_range(1024..65535);
        match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
            Ok(sock) => return sock,
            Err(e) => log::warn!("couldn't bind port {port}: {e}"),
        }
    }
}

/// Packets the dispatcher routes to a server-side session: datagrams that
/// arrived on the well-known port from this session's peer.
pub type RoutedRx = mpsc::UnboundedReceiver<Packet>;
pub type RoutedTx = mpsc::UnboundedSender<Packet>;

pub struct Session {
    sock: TftpSocket,
    peer: SocketAddr,
    processor: PacketProcessor,
    timeout: Duration,
    max_retries: u8,
    routed: Option<RoutedRx>,
}

impl Session {
    pub fn new(
        sock: TftpSocket,
        peer: SocketAddr,
        processor: PacketProcessor,
        timeout: Duration,
        max_retries: u8,
    ) -> Session {
        Session {
            sock,
            peer,
            processor,
            timeout,
            max_retries,
            routed: None,
        }
    }

    /// Attaches the dispatcher's routing channel (server side only).
    pub fn with_routing(mut self, routed: RoutedRx) -> Session {
        self.routed = Some(routed);
        self
    }

    /// Waits for the next packet within what is left of the current window's
    /// deadline. The caller passes the remaining time so that arrivals which
    /// do not advance the transfer cannot re-arm the clock.
    async fn recv(&mut self, ttl: Duration) -> Result<(Packet, SocketAddr), SocketError> {
        let peer = self.peer;
        match &mut self.routed {
            Some(routed) => {
                tokio::select! {
                    direct = self.sock.recv_with_timeout(ttl) => direct,
                    Some(packet) = routed.recv() => Ok((packet, peer)),
                }
            }
            None => self.sock.recv_with_timeout(ttl).await,
        }
    }

    async fn send_all(&self, packets: &[Packet]) -> Result<(), TransferError> {
        for packet in packets {
            self.sock
                .send(packet, self.peer)
                .await
                .map_err(|e| match e {
                    SocketError::IO(e) => TransferError::Io(e),
                    other => TransferError::Protocol(other.to_string()),
                })?;
        }
        Ok(())
    }

    /// Sends a courtesy Error before tearing the session down. Best effort,
    /// failures are ignored.
    async fn send_error(&self, code: ErrorCode, message: String) {
        let _ = self
            .sock
            .send(&Packet::Error { code, message }, self.peer)
            .await;
    }

    /// Drives the transfer until it completes or fails, starting from the
    /// packets the negotiation phase decided to send first (the Oack, the
    /// zeroth Ack, or the first window of data). Returns the number of
    /// payload bytes moved.
    pub async fn run(mut self, initial: Vec<Packet>) -> Result<u64, TransferError> {
        let mut pending = initial;
        let mut retries: u8 = 0;
        let mut exchanged = false;

        loop {
            self.send_all(&pending).await?;
            // One deadline per transmitted window. Strangers, duplicates and
            // garbage spend the remaining time rather than restarting it, so
            // a noisy peer cannot keep the session alive forever.
            let mut deadline = Instant::now() + self.timeout;

            // Wait for the packet that moves the transfer forward. Anything
            // that does not (strangers, duplicates, garbage, timeouts within
            // budget) is handled here without falling back to a resend of
            // `pending`.
            'waiting: loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.recv(remaining).await {
                    Ok((_, src)) if src != self.peer => {
                        // A stray sender must not disturb the transfer; tell
                        // it off and keep waiting.
                        log::warn!(
                            "datagram from unexpected source {src}, expected {}",
                            self.peer
                        );
                        let _ = self
                            .sock
                            .send(
                                &Packet::Error {
                                    code: ErrorCode::UnknownTid,
                                    message: "unknown transfer ID".to_string(),
                                },
                                src,
                            )
                            .await;
                    }
                    Ok((packet, _)) => match self.processor.process(&packet).await {
                        ResultAction::SendAndAwait(packets) => {
                            retries = 0;
                            exchanged = true;
                            pending = packets;
                            break 'waiting;
                        }
                        ResultAction::RetryRecv => {
                            // Duplicate or stale; no reply, no state change.
                        }
                        ResultAction::Complete(final_packet) => {
                            if let Some(packet) = final_packet {
                                self.send_all(&[packet]).await?;
                            }
                            log::debug!("{}: transfer complete", self.peer);
                            return Ok(self.processor.bytes());
                        }
                        ResultAction::Terminate(final_packet, err) => {
                            if let Some(packet) = final_packet {
                                let _ = self.sock.send(&packet, self.peer).await;
                            }
                            return Err(err);
                        }
                    },
                    Err(SocketError::Timeout(_)) => {
                        retries += 1;
                        if retries >= self.max_retries {
                            log::warn!("{}: retry budget exhausted", self.peer);
                            self.send_error(ErrorCode::Undefined, "transfer timed out".to_string())
                                .await;
                            return Err(TransferError::Timeout);
                        }
                        // Resend the whole outstanding window; during
                        // negotiation the processor has nothing in flight
                        // yet, so repeat the opening packets instead.
                        let again = self.processor.retransmit();
                        if !again.is_empty() {
                            pending = again;
                        }
                        log::debug!("{}: timeout, retransmitting (retry {retries})", self.peer);
                        self.send_all(&pending).await?;
                        deadline = Instant::now() + self.timeout;
                    }
                    Err(SocketError::PacketParse(msg)) if exchanged => {
                        // A single garbled datagram mid-transfer is dropped;
                        // the timer recovers whatever was lost with it.
                        log::debug!("{}: dropping malformed datagram: {msg}", self.peer);
                    }
                    Err(SocketError::PacketParse(msg)) => {
                        self.send_error(ErrorCode::Illegal, format!("malformed packet: {msg}"))
                            .await;
                        return Err(TransferError::Protocol(msg));
                    }
                    Err(SocketError::IO(e)) => return Err(TransferError::Io(e)),
                }
            }
        }
    }
}
