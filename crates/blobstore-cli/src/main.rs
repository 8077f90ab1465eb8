//! blobstore CLI: inspect configuration and push files through a blob.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use blobstore_core::{BackendKind, BlobContainer, ChannelIo, PayloadConfig};
use blobstore_exec::{install, BackendFactory, Blob, ThreadHost};

#[derive(Parser)]
#[command(name = "blobstore")]
#[command(about = "Adaptive binary blob store: size-driven backend selection", long_about = None)]
struct Cli {
    /// Config file (.json, .yaml, or payload.* properties). Defaults to BLOBSTORE_* variables.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved threshold table and ceilings
    Config {
        /// Dump the full configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream a file through a blob and report where it ended up
    Probe {
        /// File to stream
        #[arg(short, long)]
        input: PathBuf,

        /// Size hint for the new channel (defaults to 0, forcing live migration)
        #[arg(long, default_value_t = 0)]
        estimate: u64,
    },
}

#[derive(Debug)]
struct ProbeReport {
    kind: BackendKind,
    migrations: u64,
    length: u64,
    digest: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    let outcome = match cli.command {
        Commands::Config { json } => show_config(&config, json),
        Commands::Probe { input, estimate } => run_probe(config, &input, estimate),
    };
    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> PayloadConfig {
    match path {
        Some(path) => PayloadConfig::load_or_default(path),
        None => PayloadConfig::from_env(),
    }
}

fn show_config(config: &PayloadConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }
    let table = config.threshold_table()?;
    println!("Threshold table: {}", table);
    for (i, entry) in table.entries().iter().enumerate() {
        let max = if entry.max_size == u64::MAX {
            "unbounded".to_string()
        } else {
            entry.max_size.to_string()
        };
        println!("  {}. {:<8} <= {}", i + 1, entry.kind, max);
    }
    println!("maxArrayLength:  {}", config.max_array_length);
    println!("warnArrayLength: {}", config.warn_array_length);
    println!(
        "Disk temp dir:   {}",
        config.disk.resolved_temp_dir()?.display()
    );
    println!("Disk keep cache: {}", config.disk.keep_cache);
    Ok(())
}

fn run_probe(
    config: PayloadConfig,
    input: &Path,
    estimate: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let host = ThreadHost::new();
    install(&host, &config)?;
    let factory = Arc::new(BackendFactory::new(config)?);
    let report = probe(factory, input, estimate)?;

    println!("✓ Probe complete");
    println!("  Backend:    {}", report.kind);
    println!("  Migrations: {}", report.migrations);
    println!("  Length:     {} bytes", report.length);
    println!("  BLAKE3:     {}", report.digest);

    host.shutdown();
    Ok(())
}

fn probe(
    factory: Arc<BackendFactory>,
    input: &Path,
    estimate: u64,
) -> Result<ProbeReport, Box<dyn std::error::Error>> {
    let mut source = BufReader::new(File::open(input)?);
    let mut blob = Blob::new(factory)?;
    {
        let mut channel = blob.new_channel(estimate)?;
        io::copy(&mut source, &mut ChannelIo::new(&mut channel))?;
        channel.close()?;
    }

    let mut hasher = blake3::Hasher::new();
    let mut reader = blob.reader()?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    drop(reader);

    Ok(ProbeReport {
        kind: blob.active_kind(),
        migrations: blob.migrations(),
        length: blob.length(),
        digest: hasher.finalize().to_hex().to_string(),
    })
}
