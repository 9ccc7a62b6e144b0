// A TFTP client and server over UDP (RFC 1350) with option negotiation
// (RFC 2347), negotiated block sizes (RFC 2348) and windowed transfers
// (RFC 7440).
//
// A transfer begins with a read or write request sent to the server's
// well-known port. Each side then picks an ephemeral port — its transfer
// ID — and the rest of the exchange runs between those two ports. The
// file moves in data blocks, 512 bytes unless a larger blksize was
// negotiated, numbered from 1 and wrapping modulo 65536; a block shorter
// than the agreed size (possibly empty) marks the end of the file.
//
// With windowsize negotiated, the sender pipelines up to a window of
// blocks before stopping for an acknowledgment. Acks are cumulative: ack
// N covers every outstanding block up to N and slides the window. On
// timeout the sender retransmits the whole outstanding window; the
// receiver acks every windowsize-th block, on the final block, and again
// whenever a duplicate shows up.
//
// Requests may carry (name, value) option pairs. The server answers the
// ones it recognizes with an OACK, clamping numeric values it cannot
// honor; the client confirms with ack 0 (read) or the first data window
// (write). A request without recognized options runs as a plain RFC 1350
// exchange.
//
// Errors travel as error packets, sent as a courtesy, never retransmitted
// and never acknowledged. A packet from an unexpected port is answered
// with error 5 (unknown transfer ID) without disturbing the transfer;
// every other error ends the session.

pub mod cli;
pub mod client;
pub mod options;
pub mod processor;
pub mod server;
pub mod session;
pub mod srv_conn;
pub mod storage;
pub mod tftp;

use anyhow::anyhow;
use clap::Parser;
use cli::{Cli, Command};
use client::ClientConfig;
use options::{OptionLimits, TransferOptions};
use server::{Server, ServerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            ip,
            port,
            directory,
            timeout,
            retry,
            max_blksize,
            max_windowsize,
            writemode,
        } => {
            let server = Server::bind(ServerConfig {
                listen: SocketAddr::new(ip, port),
                root: directory,
                timeout: Duration::from_millis(timeout),
                max_retries: retry,
                limits: OptionLimits {
                    max_block_size: max_blksize,
                    max_window_size: max_windowsize,
                },
                write_mode: writemode,
            })?;
            server.serve().await
        }

        Command::Get {
            server,
            remote,
            output,
            blksize,
            windowsize,
            timeout,
            retry,
        } => {
            let local = match output {
                Some(path) => path,
                None => Path::new(&remote)
                    .file_name()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("cannot derive a local name from '{remote}'"))?,
            };
            let config = ClientConfig {
                server,
                timeout: Duration::from_millis(timeout),
                max_retries: retry,
                options: TransferOptions {
                    block_size: blksize,
                    window_size: windowsize,
                },
            };
            let bytes = client::get(&config, &remote, &local).await?;
            println!("received {bytes} bytes into {}", local.display());
            Ok(())
        }

        Command::Put {
            server,
            local,
            remote,
            blksize,
            windowsize,
            timeout,
            retry,
        } => {
            let remote = match remote {
                Some(name) => name,
                None => local
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        anyhow!("cannot derive a remote name from '{}'", local.display())
                    })?,
            };
            let config = ClientConfig {
                server,
                timeout: Duration::from_millis(timeout),
                max_retries: retry,
                options: TransferOptions {
                    block_size: blksize,
                    window_size: windowsize,
                },
            };
            let bytes = client::put(&config, &local, &remote).await?;
            println!("sent {bytes} bytes as '{remote}'");
            Ok(())
        }
    }
}
