//! Local demo harness for `s3ep-core`: encrypts/decrypts a single file
//! through the orchestration facade so the crate can be exercised outside
//! of an actual S3 proxy. The HTTP/S3 request handler is an external
//! collaborator this binary doesn't implement — it exists only to make the
//! library driveable from a terminal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};
use s3ep_core::config::Config;
use s3ep_core::provider::{KekProvider, NONE_PROVIDER_FINGERPRINT};
use s3ep_core::providers::aes_wrap::AesWrapProvider;
use s3ep_core::providers::none::NoneProvider;
use s3ep_core::stream_io::box_reader;
use s3ep_core::Orchestrator;
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Demo harness for the s3ep-core encryption orchestration layer")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Encrypt a file, writing ciphertext and a JSON metadata sidecar.
    Encrypt {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Destination for the envelope metadata (dek-algorithm, wrapped
        /// DEK, IV, HMAC if enabled). Defaults to `<output>.metadata.json`.
        #[arg(long)]
        metadata_out: Option<PathBuf>,
        /// Object key used as AAD/KEK-wrap context.
        #[arg(long, default_value = "demo-bucket/demo-object")]
        object_key: String,
        #[arg(long, default_value = "hybrid")]
        integrity: String,
        /// 64 hex characters (32 bytes). Pass-through ("none" provider) is
        /// used when omitted.
        #[arg(long)]
        kek_hex: Option<String>,
    },
    /// Decrypt a file produced by `encrypt`.
    Decrypt {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        metadata: PathBuf,
        #[arg(long, default_value = "demo-bucket/demo-object")]
        object_key: String,
        #[arg(long, default_value = "hybrid")]
        integrity: String,
        #[arg(long)]
        kek_hex: Option<String>,
    },
    /// Print `Orchestrator::stats()` for a freshly constructed, empty
    /// orchestrator under the given configuration.
    Stats {
        #[arg(long, default_value = "hybrid")]
        integrity: String,
        #[arg(long)]
        kek_hex: Option<String>,
    },
}

fn build_orchestrator(integrity: &str, kek_hex: Option<&str>) -> Result<Orchestrator> {
    let mut config = Config::default();
    config.integrity_verification = integrity.to_string();

    let (providers, active_fingerprint): (Vec<Arc<dyn KekProvider>>, String) = match kek_hex {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key).context("--kek-hex must be valid hex")?;
            if bytes.len() != 32 {
                bail!("--kek-hex must decode to exactly 32 bytes, got {}", bytes.len());
            }
            let mut kek = [0u8; 32];
            kek.copy_from_slice(&bytes);
            let fingerprint = AesWrapProvider::fingerprint_for_kek(&kek);
            let provider: Arc<dyn KekProvider> = Arc::new(AesWrapProvider::new(kek, fingerprint.clone()));
            (vec![provider], fingerprint)
        }
        None => {
            let provider: Arc<dyn KekProvider> = Arc::new(NoneProvider);
            (vec![provider], NONE_PROVIDER_FINGERPRINT.to_string())
        }
    };

    Orchestrator::new(config, providers, &active_fingerprint).context("invalid configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Encrypt { input, output, metadata_out, object_key, integrity, kek_hex } => {
            let orchestrator = build_orchestrator(&integrity, kek_hex.as_deref())?;
            let bytes = tokio::fs::read(&input).await.with_context(|| format!("reading {}", input.display()))?;
            let size = bytes.len() as u64;
            let reader = box_reader(std::io::Cursor::new(bytes));

            let (mut ciphertext, metadata) = orchestrator.encrypt(reader, &object_key, Some(size)).await?;
            let mut out_bytes = Vec::new();
            ciphertext.read_to_end(&mut out_bytes).await?;
            tokio::fs::write(&output, &out_bytes).await.with_context(|| format!("writing {}", output.display()))?;

            let metadata_path = metadata_out.unwrap_or_else(|| {
                let mut p = output.clone();
                p.set_extension("metadata.json");
                p
            });
            let metadata_json = serde_json::to_string_pretty(&metadata)?;
            tokio::fs::write(&metadata_path, metadata_json).await?;

            println!(
                "encrypted {} ({}) -> {} ({}), metadata -> {}",
                input.display(),
                format_size(size, BINARY),
                output.display(),
                format_size(out_bytes.len() as u64, BINARY),
                metadata_path.display()
            );
            orchestrator.shutdown(std::time::Duration::from_millis(100)).await;
            Ok(())
        }
        Cmd::Decrypt { input, output, metadata, object_key, integrity, kek_hex } => {
            let orchestrator = build_orchestrator(&integrity, kek_hex.as_deref())?;
            let ciphertext = tokio::fs::read(&input).await.with_context(|| format!("reading {}", input.display()))?;
            let metadata_json = tokio::fs::read_to_string(&metadata).await.with_context(|| format!("reading {}", metadata.display()))?;
            let metadata_map: s3ep_core::metadata::Metadata = serde_json::from_str(&metadata_json)?;

            let reader = box_reader(std::io::Cursor::new(ciphertext));
            let mut plaintext_reader = orchestrator.decrypt(reader, &metadata_map, &object_key).await?;
            let mut plaintext = Vec::new();
            plaintext_reader.read_to_end(&mut plaintext).await?;
            tokio::fs::write(&output, &plaintext).await.with_context(|| format!("writing {}", output.display()))?;

            println!("decrypted {} -> {} ({})", input.display(), output.display(), format_size(plaintext.len() as u64, BINARY));
            orchestrator.shutdown(std::time::Duration::from_millis(100)).await;
            Ok(())
        }
        Cmd::Stats { integrity, kek_hex } => {
            let orchestrator = build_orchestrator(&integrity, kek_hex.as_deref())?;
            let stats = orchestrator.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            orchestrator.shutdown(std::time::Duration::from_millis(100)).await;
            Ok(())
        }
    }
}
