// slurp - fetch media by URL through the first backend that can deliver it

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use slurp_lib::config::{build_registry, Settings};
use slurp_lib::fetcher::{Format, Orchestrator, SlurpEvent};

#[derive(Parser)]
#[command(name = "slurp", about = "Fetch media by URL with automatic backend fallback", version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the media at URL into an output directory
    Fetch {
        url: String,

        /// Base file name for the result, without extension
        #[arg(long)]
        slug: String,

        #[arg(long, value_enum, default_value_t = FormatArg::VideoAndAudio)]
        format: FormatArg,

        /// One of the configured OUTPUTS (defaults to the first)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List registered fetchers, or the candidates for a URL
    Fetchers {
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    VideoAndAudio,
    VideoOnly,
    AudioOnly,
}

impl From<FormatArg> for Format {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::VideoAndAudio => Format::VideoAndAudio,
            FormatArg::VideoOnly => Format::VideoOnly,
            FormatArg::AudioOnly => Format::AudioOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    let registry = Arc::new(build_registry(&settings)?);
    let orchestrator = Orchestrator::new(registry);

    match cli.command {
        Commands::Fetch {
            url,
            slug,
            format,
            output,
        } => {
            check_slug(&slug)?;
            let directory = settings.output_dir(output.as_deref())?;
            tokio::fs::create_dir_all(&directory)
                .await
                .with_context(|| format!("creating {}", directory.display()))?;

            let mut events = orchestrator.orchestrate(&url, format.into(), &directory, &slug);
            let mut succeeded = false;
            while let Some(event) = events.next().await {
                if cli.json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    println!("{}", event);
                }
                succeeded = matches!(event, SlurpEvent::Succeeded { .. });
            }

            Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Fetchers { url } => {
            let registry = orchestrator.registry();
            for (fetcher, ready) in registry.readiness(url.as_deref()).await {
                let domains = fetcher
                    .eligible_domains()
                    .map(|d| d.join(", "))
                    .unwrap_or_else(|| "any".to_string());
                let services = fetcher.service_names().await;

                if cli.json {
                    let row = serde_json::json!({
                        "name": fetcher.name(),
                        "priority": fetcher.priority(),
                        "ready": ready,
                        "domains": fetcher.eligible_domains(),
                        "services": services,
                    });
                    println!("{}", row);
                } else {
                    println!(
                        "{:<12} priority={:<5} ready={:<5} domains=[{}] services=[{}]",
                        fetcher.name(),
                        fetcher.priority(),
                        ready,
                        domains,
                        services.join(", ")
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Slugs become file names inside the output directory and must stay there
fn check_slug(slug: &str) -> Result<()> {
    if slug.is_empty() || slug == "." || slug == ".." || slug.contains(['/', '\\']) {
        bail!("invalid slug '{}': must be a plain file name", slug);
    }
    Ok(())
}
