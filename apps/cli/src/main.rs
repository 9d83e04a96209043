use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cydfu_core::session::{DfuSession, SessionConfig};
use cydfu_core::transport::SerialTransport;
use cydfu_core::FirmwareImage;
use tracing::{error, info};

/// Serial read timeout; the session enforces the acknowledgement bound.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about = "Cypress bootloader host (.cyacd over serial)", long_about = None)]
struct Args {
    /// Path to the firmware image (.cyacd)
    #[arg(long)]
    image: Option<String>,

    /// Serial port of the bootloader
    #[arg(long)]
    port: Option<String>,

    /// Baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<String>,

    /// Print the image summary and exit without touching a device
    #[arg(long)]
    inspect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path))?,
        None => SessionConfig::default(),
    };
    if let Some(image) = &args.image {
        config.image_path = Some(image.clone());
    }
    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    Ok(config)
}

fn print_summary(image: &FirmwareImage) {
    if let Some(header) = image.header() {
        println!("Header:      {}", header.header);
        println!("Silicon ID:  {}", header.silicon_id);
        println!("Silicon rev: {}", header.silicon_rev);
        println!("Checksum:    {}", header.checksum_type);
    }
    println!(
        "Rows:        {} ({} bytes, {} lines)",
        image.rows().len(),
        image.data_size(),
        image.total_lines()
    );
    for array_id in image.array_ids() {
        let rows: Vec<_> = image
            .rows()
            .iter()
            .filter(|r| r.array_id() == array_id)
            .collect();
        if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
            println!(
                "  array {:02X}: {} rows, 0x{:04X}..=0x{:04X}",
                array_id,
                rows.len(),
                first.row_address(),
                last.row_address()
            );
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;

    let image_path = config
        .image_path
        .clone()
        .context("no firmware image given (--image or image_path)")?;
    let text = std::fs::read_to_string(&image_path)
        .with_context(|| format!("reading {}", image_path))?;
    let image = FirmwareImage::parse(&text).with_context(|| format!("parsing {}", image_path))?;

    if args.inspect {
        print_summary(&image);
        return Ok(());
    }

    let port = config
        .port
        .clone()
        .context("no serial port given (--port or port)")?;
    let transport = SerialTransport::open(&port, config.baud_rate, READ_TIMEOUT)?;

    info!(image = %image_path, port = %port, "Starting update");
    let mut session = DfuSession::new(config, transport);
    session.start(image)?;
    session.run()?;
    info!("Device updated");
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
