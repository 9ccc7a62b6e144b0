// The per-transfer packet processor: given an incoming packet, decide what
// the session loop should do next. One side of every transfer sends file
// data (ReadProcessor), the other receives it (WriteProcessor); both speak
// in windows of up to the negotiated number of blocks per acknowledgment,
// and both treat block numbers as counters that wrap mod 65536.
//
// The processor never touches the network. It reads and writes the file,
// tracks the window, and expresses everything else as a ResultAction for
// the caller, which keeps the whole state machine testable without sockets.

use crate::options::TransferOptions;
use crate::session::TransferError;
use crate::tftp::{ErrorCode, Packet};
use std::collections::VecDeque;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

impl PacketProcessor {
    pub fn new_sender(file: File, options: TransferOptions) -> PacketProcessor {
        PacketProcessor::Read(ReadProcessor::new(file, options))
    }

    pub fn new_receiver(file: File, options: TransferOptions) -> PacketProcessor {
        PacketProcessor::Write(WriteProcessor::new(file, options))
    }

    /// Produces the opening move once negotiation has settled without an
    /// outstanding Oack: the sender streams its first window, the receiver
    /// acknowledges block zero and waits for data.
    pub async fn start(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.open_window().await,
            PacketProcessor::Write(_) => ResultAction::SendAndAwait(vec![Packet::Ack { block: 0 }]),
        }
    }

    /// Given an incoming packet, processes it and describes the action the
    /// caller should take.
    pub async fn process(&mut self, packet: &Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }

    /// Everything that should go out again on a retransmission timer: the
    /// sender repeats its whole outstanding window, the receiver repeats its
    /// last acknowledgment. Empty while negotiation is still in flight, in
    /// which case the session repeats its opening packets instead.
    pub fn retransmit(&self) -> Vec<Packet> {
        match self {
            PacketProcessor::Read(p) => p.window_packets(),
            PacketProcessor::Write(p) => {
                if p.acked_once {
                    vec![Packet::Ack { block: p.last_ack }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Payload bytes moved so far (retransmissions not counted twice).
    pub fn bytes(&self) -> u64 {
        match self {
            PacketProcessor::Read(p) => p.bytes,
            PacketProcessor::Write(p) => p.bytes,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packets and await a response. May be empty:
    /// nothing new to say, but a response is still owed.
    SendAndAwait(Vec<Packet>),

    /// Caller should keep receiving; the packet changed nothing.
    RetryRecv,

    /// The transfer finished; optionally send one final packet first.
    Complete(Option<Packet>),

    /// The transfer failed; optionally send a courtesy packet (never in
    /// reply to a peer Error).
    Terminate(Option<Packet>, TransferError),
}

fn illegal(message: String) -> ResultAction {
    ResultAction::Terminate(
        Some(Packet::Error {
            code: ErrorCode::Illegal,
            message: message.clone(),
        }),
        TransferError::Protocol(message),
    )
}

///////////////////////////////////////////////////////////////
// Sending side

#[derive(Debug)]
pub struct ReadProcessor {
    file: File,
    block_size: usize,
    window_size: u16,
    /// Blocks sent but not yet cumulatively acknowledged, oldest first.
    window: VecDeque<(u16, Vec<u8>)>,
    /// Highest block number covered by an acknowledgment.
    acked: u16,
    started: bool,
    /// The short (possibly empty) final block has been queued; nothing more
    /// to read.
    source_drained: bool,
    bytes: u64,
}

impl ReadProcessor {
    fn new(file: File, options: TransferOptions) -> ReadProcessor {
        ReadProcessor {
            file,
            block_size: options.block_size as usize,
            window_size: options.window_size,
            window: VecDeque::new(),
            acked: 0,
            started: false,
            source_drained: false,
            bytes: 0,
        }
    }

    /// Reads blocks until the window is full or the file runs out, returning
    /// packets for the newly queued blocks only; blocks already in flight
    /// are not repeated here.
    async fn fill_window(&mut self) -> Result<Vec<Packet>, io::Error> {
        let mut fresh = Vec::new();
        while (self.window.len() as u16) < self.window_size && !self.source_drained {
            let data = read_block(&mut self.file, self.block_size).await?;
            let block = self
                .acked
                .wrapping_add(self.window.len() as u16)
                .wrapping_add(1);
            if data.len() < self.block_size {
                // A file that ends exactly on a block boundary still gets
                // its explicit trailing empty block from the zero-length
                // read that follows it.
                self.source_drained = true;
            }
            self.bytes += data.len() as u64;
            fresh.push(Packet::Data {
                block,
                data: data.clone(),
            });
            self.window.push_back((block, data));
        }
        Ok(fresh)
    }

    async fn open_window(&mut self) -> ResultAction {
        self.started = true;
        match self.fill_window().await {
            Ok(fresh) => ResultAction::SendAndAwait(fresh),
            Err(e) => storage_failure(e),
        }
    }

    fn window_packets(&self) -> Vec<Packet> {
        self.window
            .iter()
            .map(|(block, data)| Packet::Data {
                block: *block,
                data: data.clone(),
            })
            .collect()
    }

    async fn process_ack(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            &Packet::Ack { block } => {
                let covered = block.wrapping_sub(self.acked);
                if covered == 0 {
                    if !self.started {
                        // The Ack(0) confirming our Oack; negotiation is
                        // over, stream the first window.
                        return self.open_window().await;
                    }
                    // Duplicate of an acknowledgment we already consumed.
                    return ResultAction::RetryRecv;
                }

                if covered as usize > self.window.len() {
                    // Stale (pre-wrap) or ahead of anything in flight.
                    return ResultAction::RetryRecv;
                }

                // Cumulative: every block up to `block` is confirmed.
                for _ in 0..covered {
                    self.window.pop_front();
                }
                self.acked = block;

                if self.source_drained && self.window.is_empty() {
                    return ResultAction::Complete(None);
                }

                match self.fill_window().await {
                    Ok(fresh) => ResultAction::SendAndAwait(fresh),
                    Err(e) => storage_failure(e),
                }
            }
            Packet::Oack { .. } => {
                // The peer repeating its option acknowledgment; the timer
                // will resend whatever it missed.
                ResultAction::RetryRecv
            }
            Packet::Error { code, message } => {
                ResultAction::Terminate(None, TransferError::Peer(*code, message.clone()))
            }
            other => illegal(format!("expected an Ack packet, got {other:?}")),
        }
    }
}

fn storage_failure(e: io::Error) -> ResultAction {
    let code: ErrorCode = e.kind().into();
    ResultAction::Terminate(
        Some(Packet::Error {
            code,
            message: e.to_string(),
        }),
        TransferError::Storage(code, e.to_string()),
    )
}

/// Reads up to one block. A single read call has no guarantee of filling
/// the buffer, so keep going until it is full or the file ends; only the
/// final block of a transfer may come back short.
async fn read_block(f: &mut File, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0u8; block_size];
    let mut cursor = 0;
    loop {
        let n = f.read(&mut buf[cursor..]).await?;
        cursor += n;
        if n == 0 || cursor == buf.len() {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

///////////////////////////////////////////////////////////////
// Receiving side

#[derive(Debug)]
pub struct WriteProcessor {
    file: File,
    block_size: usize,
    window_size: u16,
    /// Last block written to the sink.
    accepted: u16,
    /// Block number of the last acknowledgment sent.
    last_ack: u16,
    acked_once: bool,
    bytes: u64,
}

impl WriteProcessor {
    fn new(file: File, options: TransferOptions) -> WriteProcessor {
        WriteProcessor {
            file,
            block_size: options.block_size as usize,
            window_size: options.window_size,
            accepted: 0,
            last_ack: 0,
            acked_once: false,
            bytes: 0,
        }
    }

    fn ack(&mut self, block: u16) -> Packet {
        self.last_ack = block;
        self.acked_once = true;
        Packet::Ack { block }
    }

    async fn process_data(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            Packet::Data { block, data } => {
                if data.len() > self.block_size {
                    return illegal(format!(
                        "data block of {} bytes exceeds the negotiated block size {}",
                        data.len(),
                        self.block_size
                    ));
                }

                let ahead = block.wrapping_sub(self.accepted);
                if ahead == 1 {
                    if let Err(e) = self.file.write_all(data).await {
                        return storage_failure(e);
                    }
                    self.accepted = *block;
                    self.bytes += data.len() as u64;

                    if data.len() < self.block_size {
                        // End-of-file marker; acknowledge and finish.
                        if let Err(e) = self.file.flush().await {
                            return storage_failure(e);
                        }
                        let ack = self.ack(*block);
                        return ResultAction::Complete(Some(ack));
                    }

                    if self.accepted.wrapping_sub(self.last_ack) >= self.window_size {
                        let ack = self.ack(*block);
                        return ResultAction::SendAndAwait(vec![ack]);
                    }

                    // Mid-window: hold the acknowledgment until the window
                    // fills or the transfer ends.
                    return ResultAction::RetryRecv;
                }

                if ahead == 0 || ahead > u16::MAX / 2 {
                    // A retransmit of something already written. Re-confirm
                    // without touching the sink.
                    let last = self.last_ack;
                    return ResultAction::SendAndAwait(vec![Packet::Ack { block: last }]);
                }

                // Ahead of the next expected block. TFTP has no selective
                // repeat; drop it and let the sender's timer resend the
                // window in order.
                ResultAction::RetryRecv
            }
            Packet::Oack { .. } => {
                if self.accepted == 0 && self.bytes == 0 {
                    // Our Ack(0) got lost; confirm the options again.
                    ResultAction::SendAndAwait(vec![Packet::Ack { block: 0 }])
                } else {
                    ResultAction::RetryRecv
                }
            }
            Packet::Error { code, message } => {
                ResultAction::Terminate(None, TransferError::Peer(*code, message.clone()))
            }
            other => illegal(format!("expected a Data packet, got {other:?}")),
        }
    }
}
