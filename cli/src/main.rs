mod tree;

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cardlink::apdu::Command;
use cardlink::pcsc::{PcscBackend, PcscConfig};
use cardlink::{Card, Config, Device, Platform};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("{0}")]
    Card(#[from] cardlink::Error),

    #[error("Invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Failed to read or write a file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No reader found on PC/SC service")]
    NoReader,
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Parser)]
#[command(version, about = "Talk to smart cards through PC/SC readers")]
struct Cli {
    /// JSON file configuring the platform and the PC/SC backend
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print more logs; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    Readers {
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send raw APDUs to the card and print the responses
    Send {
        #[command(flatten)]
        target: TargetArgs,

        /// Commands in hex, sent in order within one session
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Read a TLV-encoded EF from the card
    Read {
        #[command(flatten)]
        target: TargetArgs,

        /// Name of the DF to select first, in hex
        #[arg(long)]
        df: Option<String>,

        /// Identifier of the EF, in hex
        #[arg(long)]
        ef: String,

        /// Write the file here instead of printing it as hex
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the structure of BER-TLV data
    Tlv {
        /// The data in hex; read from the standard input if omitted
        data: Option<String>,

        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Reader to use; the first one is used if omitted
    #[arg(short, long)]
    reader: Option<String>,

    /// Seconds to wait for a card
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,
}

struct Settings {
    platform: Config,
    pcsc: PcscConfig,
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    let mut settings = Settings {
        platform: Config::default(),
        pcsc: PcscConfig::default(),
    };

    let Some(path) = path else {
        return Ok(settings);
    };

    let value: serde_json::Value = serde_json::from_reader(File::open(path)?)?;
    if let Some(platform) = value.get("platform") {
        settings.platform = serde_json::from_value(platform.clone())?;
    }
    if let Some(pcsc) = value.get("pcsc") {
        settings.pcsc = serde_json::from_value(pcsc.clone())?;
    }

    Ok(settings)
}

async fn open_device(platform: &Platform, target: &TargetArgs) -> Result<Device> {
    let id = match &target.reader {
        Some(reader) => reader.clone(),
        None => platform
            .get_device_info()
            .await?
            .into_iter()
            .next()
            .map(|info| info.descriptor.id)
            .ok_or(Error::NoReader)?,
    };

    info!("Using reader: {}", id);

    Ok(platform.acquire_device(&id).await?)
}

async fn open_card(platform: &Platform, target: &TargetArgs) -> Result<(Device, Card)> {
    let device = open_device(platform, target).await?;

    eprintln!("Waiting for a card on {}...", device.id());
    device
        .wait_for_card_presence(Duration::from_secs(target.timeout))
        .await?;

    let card = device.start_session().await?;

    Ok((device, card))
}

async fn readers(platform: &Platform, json: bool) -> Result<()> {
    let devices = platform.get_device_info().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No readers found.");
    }

    for device in devices {
        println!(
            "{}\t{}\t{}",
            device.descriptor.id,
            device.descriptor.protocols.join(","),
            device.state,
        );
    }

    Ok(())
}

async fn send(platform: &Platform, target: &TargetArgs, commands: &[String]) -> Result<()> {
    let commands = commands
        .iter()
        .map(|command| -> Result<Command> {
            let bytes = hex::decode(command)?;

            Ok(Command::from_bytes(&bytes).map_err(cardlink::Error::from)?)
        })
        .collect::<Result<Vec<_>>>()?;

    let (_device, card) = open_card(platform, target).await?;

    for command in commands {
        let response = card.transmit(&command).await?;

        println!("> {}", command);
        println!(
            "< {} {}",
            hex::encode_upper(response.payload()),
            response.sw()
        );
    }

    Ok(())
}

async fn read(
    platform: &Platform,
    target: &TargetArgs,
    df: Option<&String>,
    ef: &str,
    output: Option<&PathBuf>,
) -> Result<()> {
    let ef: [u8; 2] = hex::decode(ef)?
        .try_into()
        .map_err(|_| Error::Hex(hex::FromHexError::InvalidStringLength))?;
    let df = df.map(hex::decode).transpose()?;

    let (_device, card) = open_card(platform, target).await?;

    if let Some(df) = df {
        card.select_df(&df).await?;
    }

    card.select_ef(ef).await?;
    let data = card.read_tlv_file().await?;

    match output {
        Some(path) => File::create(path)?.write_all(&data)?,
        None => println!("{}", hex::encode_upper(&data)),
    }

    Ok(())
}

fn tlv(data: Option<&String>, json: bool) -> Result<()> {
    let data = match data {
        Some(data) => data.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let compact = data.split_whitespace().collect::<String>();
    let bytes = hex::decode(compact)?;
    let nodes = tree::parse(&bytes).map_err(cardlink::Error::from)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tree::to_json(&nodes))?);
    } else {
        tree::print(&nodes, 0);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Commands::Tlv { data, json } = &cli.command {
        return tlv(data.as_ref(), *json);
    }

    let settings = load_settings(cli.config.as_ref())?;
    let platform = Platform::with_config(
        Arc::new(PcscBackend::new(settings.pcsc)),
        settings.platform,
    );
    platform.init().await?;

    let result = match &cli.command {
        Commands::Readers { json } => readers(&platform, *json).await,
        Commands::Send { target, commands } => send(&platform, target, commands).await,
        Commands::Read {
            target,
            df,
            ef,
            output,
        } => read(&platform, target, df.as_ref(), ef, output.as_ref()).await,
        Commands::Tlv { .. } => Ok(()),
    };

    platform.release();

    result
}
