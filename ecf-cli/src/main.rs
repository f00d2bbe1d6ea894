use anyhow::{Context, Result, bail};
use base64ct::{Base64, Encoding};
use clap::{Args, Parser, Subcommand};
use ecf_core::auth::{Authenticator, Challenge};
use ecf_core::config::{Config, EnvironmentType};
use ecf_core::integrity;
use ecf_core::keys::{CredentialSource, KeyMaterial};
use ecf_core::transport::{AuthorityTransport, HttpTransport};
use ecf_core::xmldsig::{XmlSigner, verify};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "ecf")]
#[command(about = "DGII e-CF seed authentication and signing CLI")]
struct Cli {
    /// testecf, certecf or ecf
    #[arg(long, global = true, default_value = "testecf", env = "ECF_ENV")]
    env: EnvironmentType,
    #[arg(long, global = true, default_value_t = 10)]
    timeout_secs: u64,
    #[command(flatten)]
    credentials: CredentialArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Credential flags. Without any of them the `ECF_CERT_*` environment
/// variables are used.
#[derive(Args)]
struct CredentialArgs {
    #[arg(long, global = true, conflicts_with_all = ["key_pem", "cert_pem"])]
    p12: Option<PathBuf>,
    #[arg(long, global = true, env = "ECF_CERT_PASS", hide_env_values = true)]
    passphrase: Option<String>,
    #[arg(long, global = true, requires = "cert_pem")]
    key_pem: Option<PathBuf>,
    #[arg(long, global = true, requires = "key_pem")]
    cert_pem: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a seed document from the authority.
    Seed {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Sign an XML document with an enveloped signature.
    Sign {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Verify the enveloped signature of a document.
    Verify {
        #[arg(long)]
        input: PathBuf,
    },
    /// Run a full seed/token cycle and print the bearer token.
    Token,
    /// SHA-256 of a payload, as sent in `HashXML`.
    Digest {
        #[arg(long)]
        input: PathBuf,
        /// The file holds base64 (`XMLFirmado`) rather than raw XML.
        #[arg(long)]
        encoded: bool,
        #[arg(long)]
        hex: bool,
    },
    /// Show which credential inputs are configured.
    Credentials,
}

impl CredentialArgs {
    fn source(&self) -> Result<CredentialSource> {
        if let Some(path) = &self.p12 {
            let passphrase = self
                .passphrase
                .clone()
                .context("--p12 needs a passphrase (--passphrase or ECF_CERT_PASS)")?;
            return Ok(CredentialSource::Pkcs12File {
                path: path.clone(),
                passphrase: Zeroizing::new(passphrase),
            });
        }
        if let (Some(key_path), Some(cert_path)) = (&self.key_pem, &self.cert_pem) {
            return Ok(CredentialSource::PemFiles {
                key_path: key_path.clone(),
                cert_path: cert_path.clone(),
            });
        }
        Ok(CredentialSource::from_env()?)
    }

    fn load(&self) -> Result<KeyMaterial> {
        let source = self.source()?;
        tracing::debug!(source = source.kind(), "loading signing credential");
        Ok(KeyMaterial::from_source(&source)?)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        Ok("pretty") => builder.pretty().try_init(),
        _ => builder.try_init(),
    };
}

fn write_or_print(output: Option<&PathBuf>, contents: &str) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::new(cli.env).with_timeout(Duration::from_secs(cli.timeout_secs));

    match cli.command {
        Commands::Seed { output } => {
            let transport = HttpTransport::new(&config)?;
            let response = transport.fetch_seed().await?;
            if !response.is_success() {
                bail!(
                    "seed request failed with status {}: {}",
                    response.status,
                    response.body
                );
            }
            let challenge = Challenge::parse(&response.body, chrono::Utc::now())?;
            tracing::info!(issued_at = %challenge.issued_at(), "received seed");
            write_or_print(output.as_ref(), challenge.as_str())?;
        }
        Commands::Sign { input, output } => {
            let keys = cli.credentials.load()?;
            let xml = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let signed = XmlSigner::new(&keys, config.signature_profile()).sign_xml(&xml)?;
            tracing::info!(digest = signed.digest_value(), "document signed");
            write_or_print(output.as_ref(), signed.as_str())?;
        }
        Commands::Verify { input } => {
            let xml = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let verified = verify(&xml)?;
            println!("OK {}", verified.digest_value());
        }
        Commands::Token => {
            let keys = Arc::new(cli.credentials.load()?);
            let auth = Authenticator::new(HttpTransport::new(&config)?, keys, &config);
            let token = auth.authenticate().await?;
            let json = serde_json::json!({
                "token": token.value(),
                "expedido": token.issued_at(),
                "expira": token.expires_at(),
                "expiry_from_authority": token.expiry_from_authority(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Commands::Digest {
            input,
            encoded,
            hex,
        } => {
            let raw = std::fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let payload = if encoded {
                let text = String::from_utf8(raw).context("encoded payload is not UTF-8")?;
                let compact: String = text.split_whitespace().collect();
                Base64::decode_vec(&compact)
                    .map_err(|e| anyhow::anyhow!("encoded payload is not valid base64: {e}"))?
            } else {
                raw
            };
            let digest = integrity::digest(&payload)?;
            if hex {
                println!("{}", digest.to_hex());
            } else {
                println!("{}", digest.to_base64());
            }
        }
        Commands::Credentials => {
            let status = CredentialSource::describe();
            println!("{}", serde_json::to_string_pretty(&status)?);
            if !status.is_usable() {
                tracing::warn!("no complete signing credential is configured");
            }
        }
    }

    Ok(())
}
