use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netboot_tftp::backend::{FilesystemReader, FilesystemWriter};
use netboot_tftp::config::{PortRange, TimeoutSchedule, DEFAULT_MAX_BLOCK_SIZE, TFTP_PORT};
use netboot_tftp::datagram::{Options, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use netboot_tftp::{Client, Server, ServerConfig, TransferConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "TFTP server and client for network booting")]
struct Cli {
    /// Enable detailed debug output
    ///
    /// This has the same effect as setting `RUST_LOG=debug` in the environment.
    /// If present, `RUST_LOG` overrides this option.
    #[arg(short, long, action)]
    debug: bool,

    /// Retry schedule in seconds; the last entry is how long to wait before giving up
    #[arg(long, default_value_t = TimeoutSchedule::default(), value_name = "SECS,...")]
    timeout: TimeoutSchedule,

    /// Largest block size to agree to or ask for
    #[arg(long, default_value_t = DEFAULT_MAX_BLOCK_SIZE, value_parser = block_size_parser())]
    max_block_size: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve files from a directory
    Serve {
        /// Directory to serve
        root: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        address: IpAddr,

        #[arg(short, long, default_value_t = TFTP_PORT)]
        port: u16,

        /// Ports to use for transfers
        #[arg(long, default_value_t = PortRange::default(), value_name = "LOW-HIGH")]
        port_range: PortRange,

        /// Accept write requests
        #[arg(long, action)]
        allow_writes: bool,
    },

    /// Download a file
    Get {
        /// Server as HOST or HOST:PORT
        server: String,

        /// Remote file name
        filename: String,

        /// Where to write the file; defaults to the remote file name
        output: Option<PathBuf>,

        /// Block size to ask for
        #[arg(short, long, value_parser = block_size_parser())]
        blksize: Option<u16>,
    },

    /// Upload a file
    Put {
        /// Server as HOST or HOST:PORT
        server: String,

        /// Local file to send
        input: PathBuf,

        /// Remote file name; defaults to the local file name
        filename: Option<String>,

        /// Block size to ask for
        #[arg(short, long, value_parser = block_size_parser())]
        blksize: Option<u16>,
    },
}

fn block_size_parser() -> clap::builder::RangedI64ValueParser<u16> {
    clap::value_parser!(u16).range(i64::from(MIN_BLOCK_SIZE)..=i64::from(MAX_BLOCK_SIZE))
}

fn resolve_server(server: &str) -> Result<SocketAddr> {
    let with_port = if server.contains(':') { server.to_string() } else { format!("{server}:{TFTP_PORT}") };
    with_port
        .to_socket_addrs()
        .with_context(|| format!("Cannot resolve {server}"))?
        .next()
        .with_context(|| format!("No address found for {server}"))
}

fn request_options(blksize: Option<u16>, max_block_size: u16) -> Options {
    let mut options = Options::new();
    if let Some(blksize) = blksize {
        if blksize > max_block_size {
            log::warn!("Asking for a block size of {max_block_size} instead of {blksize}");
        }
        options.insert("blksize", blksize.min(max_block_size).to_string());
    }
    options
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let transfer = TransferConfig { max_block_size: cli.max_block_size, timeout: cli.timeout.0 };

    match cli.command {
        Command::Serve { root, address, port, port_range, allow_writes } => {
            let mut config = ServerConfig::new(root);
            config.bind = SocketAddr::new(address, port);
            config.port_range = port_range;
            config.allow_writes = allow_writes;
            config.transfer = transfer;
            let mut server = Server::bind(config).await?;
            server.run().await?;
        }
        Command::Get { server, filename, output, blksize } => {
            let output = output.unwrap_or_else(|| PathBuf::from(filename.rsplit('/').next().unwrap_or(&filename)));
            let writer = FilesystemWriter::create(&output)
                .with_context(|| format!("Cannot create {}", output.display()))?;
            let client = Client::new(resolve_server(&server)?, transfer);
            let summary = client.get(&filename, Box::new(writer), request_options(blksize, cli.max_block_size)).await?;
            log::info!("Received {} bytes into {}", summary.bytes, output.display());
        }
        Command::Put { server, input, filename, blksize } => {
            let filename = match filename {
                Some(filename) => filename,
                None => input
                    .file_name()
                    .with_context(|| format!("{} has no file name", input.display()))?
                    .to_string_lossy()
                    .into_owned(),
            };
            let reader = FilesystemReader::open(&input)
                .with_context(|| format!("Cannot open {}", input.display()))?;
            let client = Client::new(resolve_server(&server)?, transfer);
            let summary = client.put(&filename, Box::new(reader), request_options(blksize, cli.max_block_size)).await?;
            log::info!("Sent {} bytes from {}", summary.bytes, input.display());
        }
    }

    Ok(())
}
