use crate::storage::WriteMode;
use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftpw")]
#[command(about = "A windowed TFTP client and server", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve files from a directory
    Serve {
        /// Listen ip
        #[arg(short, long, default_value = "0.0.0.0")]
        ip: IpAddr,

        /// Listen port
        #[arg(short, long, default_value_t = 69)]
        port: u16,

        /// Served directory
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,

        /// Retransmission timeout (ms)
        #[arg(short, long, default_value_t = 1000)]
        timeout: u64,

        /// Max retries per packet
        #[arg(short, long, default_value_t = 5)]
        retry: u8,

        /// Largest block size a client may negotiate
        #[arg(long, default_value_t = 1428)]
        max_blksize: u16,

        /// Largest window size a client may negotiate
        #[arg(long, default_value_t = 16)]
        max_windowsize: u16,

        /// Write request policy
        #[arg(long, value_enum, default_value = "new")]
        writemode: WriteMode,
    },

    /// Download a file from a server
    Get {
        /// Server address (host:port)
        server: SocketAddr,

        /// Remote filename
        remote: String,

        /// Local destination (defaults to the remote filename)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Requested block size
        #[arg(short, long, default_value_t = 512)]
        blksize: u16,

        /// Requested window size
        #[arg(short, long, default_value_t = 1)]
        windowsize: u16,

        /// Retransmission timeout (ms)
        #[arg(short, long, default_value_t = 1000)]
        timeout: u64,

        /// Max retries per packet
        #[arg(short, long, default_value_t = 5)]
        retry: u8,
    },

    /// Upload a file to a server
    Put {
        /// Server address (host:port)
        server: SocketAddr,

        /// Local file to send
        local: PathBuf,

        /// Remote filename (defaults to the local filename)
        remote: Option<String>,

        /// Requested block size
        #[arg(short, long, default_value_t = 512)]
        blksize: u16,

        /// Requested window size
        #[arg(short, long, default_value_t = 1)]
        windowsize: u16,

        /// Retransmission timeout (ms)
        #[arg(short, long, default_value_t = 1000)]
        timeout: u64,

        /// Max retries per packet
        #[arg(short, long, default_value_t = 5)]
        retry: u8,
    },
}
