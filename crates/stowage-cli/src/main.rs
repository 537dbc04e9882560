//! Stowage operator CLI.
//!
//! Seals and opens files with the block codec used for encryption at rest and
//! previews storage path templates. Key files default to
//! STOWAGE_ENCRYPTION_KEY_FILE.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stowage_cli::{decrypt, encrypt, load_cipher, preview_path};
use stowage_core::encryption::estimate_plain_size;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Parser)]
#[command(name = "stowage", about = "Stowage operator tools")]
struct Cli {
    /// Log as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file with the block codec
    Encrypt {
        #[command(flatten)]
        io: IoArgs,
    },
    /// Decrypt a file sealed with the block codec
    Decrypt {
        #[command(flatten)]
        io: IoArgs,
        /// Plaintext offset to start from
        #[arg(long, default_value = "0")]
        offset: u64,
    },
    /// Plaintext size of an encrypted object of the given size
    PlainSize {
        /// Encrypted size in bytes
        bytes: u64,
    },
    /// Render a storage path template for a sample file
    RenderPath {
        /// Template, e.g. '$DOMAIN/$CHANNEL/$Y/$M/$D'
        pattern: String,
        /// Tenant id
        #[arg(long, default_value = "1")]
        tenant: i64,
        /// Channel tag
        #[arg(long)]
        channel: Option<String>,
        /// MIME type
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },
}

#[derive(clap::Args)]
struct IoArgs {
    /// Key file (defaults to STOWAGE_ENCRYPTION_KEY_FILE)
    #[arg(long)]
    key_file: Option<PathBuf>,
    /// Input file (defaults to stdin)
    #[arg(long, short)]
    input: Option<PathBuf>,
    /// Output file (defaults to stdout)
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl IoArgs {
    async fn open(&self) -> anyhow::Result<(Box<dyn AsyncRead + Unpin>, Box<dyn AsyncWrite + Unpin>)> {
        let input: Box<dyn AsyncRead + Unpin> = match &self.input {
            Some(path) => Box::new(
                File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            ),
            None => Box::new(tokio::io::stdin()),
        };
        let output: Box<dyn AsyncWrite + Unpin> = match &self.output {
            Some(path) => Box::new(
                File::create(path)
                    .await
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            ),
            None => Box::new(tokio::io::stdout()),
        };
        Ok((input, output))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    stowage_infra::init_telemetry(cli.json_logs)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Encrypt { io } => {
            let cipher = load_cipher(io.key_file.as_deref())?;
            let (input, mut output) = io.open().await?;
            let written = encrypt(input, &mut output, cipher).await?;
            tracing::info!(written_bytes = written, "Encrypted");
        }
        Commands::Decrypt { io, offset } => {
            let cipher = load_cipher(io.key_file.as_deref())?;
            let (input, mut output) = io.open().await?;
            let written = decrypt(input, &mut output, cipher, offset).await?;
            tracing::info!(offset, written_bytes = written, "Decrypted");
        }
        Commands::PlainSize { bytes } => {
            let size = estimate_plain_size(bytes)?;
            println!("{}", size);
        }
        Commands::RenderPath {
            pattern,
            tenant,
            channel,
            mime,
        } => {
            println!(
                "{}",
                preview_path(&pattern, tenant, channel.as_deref(), &mime, chrono::Utc::now())
            );
        }
    }

    Ok(())
}
