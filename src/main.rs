use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wyoming_streamer::backend::{AudioFormat, BackendRegistry, VoiceCatalog};
use wyoming_streamer::wyoming::{HandlerContext, ListenAddr, info_for_catalog, serve};
use wyoming_streamer::Config;

/// Wyoming TTS server that streams cloud voices sentence by sentence
#[derive(Parser)]
#[command(name = "wyoming-streamer", version, about)]
struct Cli {
    /// Listen address: tcp://host:port, unix:///path or stdio://
    #[arg(long)]
    uri: Option<String>,

    /// Config file (defaults to ~/.config/wyoming-streamer/config.toml)
    #[arg(short, long, env = "WYOMING_STREAMER_CONFIG")]
    config: Option<PathBuf>,

    /// Accept synthesize-start/chunk/stop and advertise streaming support
    #[arg(long)]
    streaming: bool,

    /// Voice catalog (voices.json); the built-in catalog is used otherwise
    #[arg(long)]
    voices: Option<PathBuf>,

    /// Voice used when a request names none
    #[arg(long)]
    default_voice: Option<String>,

    /// Concurrent backend calls per request
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Longest text unit sent to a backend, in characters
    #[arg(long)]
    max_unit_chars: Option<usize>,

    /// Log debug messages (same as -v)
    #[arg(long)]
    debug: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the advertised voices
    Voices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = if cli.debug { cli.verbose.max(1) } else { cli.verbose };
    let filter = match level {
        0 => "info,wyoming_streamer=info",
        1 => "info,wyoming_streamer=debug",
        2 => "debug",
        _ => "trace",
    };

    // stdout may carry the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let catalog = VoiceCatalog::load(config.voices.catalog.as_deref())?;

    if let Some(Command::Voices) = cli.command {
        print_voices(&catalog);
        return Ok(());
    }

    let addr: ListenAddr = config.server.uri.parse()?;
    let registry = BackendRegistry::from_config(
        &config.backends,
        config.voices.default_voice.clone(),
        AudioFormat::pcm16_mono(config.backends.google_sample_rate),
    )?;
    let catalog = catalog.retain_providers(|p| registry.has(p));

    tracing::info!(
        uri = %addr,
        streaming = config.server.streaming,
        voices = catalog.len(),
        default_voice = registry.default_voice(),
        max_concurrency = config.synthesis.max_concurrency,
        "starting wyoming streamer"
    );

    let ctx = Arc::new(HandlerContext {
        info: info_for_catalog(&catalog, config.server.streaming),
        registry,
        synthesis: config.synthesis,
        streaming: config.server.streaming,
        samples_per_chunk: config.server.samples_per_chunk,
    });

    // Set up shutdown signal
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal.cancel();
        }
    });

    serve(ctx, &addr, shutdown).await?;
    tracing::info!("stopped");
    Ok(())
}

/// Resolve config and apply CLI overrides on top
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(uri) = &cli.uri {
        config.server.uri.clone_from(uri);
    }
    if cli.streaming {
        config.server.streaming = true;
    }
    if let Some(path) = &cli.voices {
        config.voices.catalog = Some(path.clone());
    }
    if let Some(voice) = &cli.default_voice {
        config.voices.default_voice.clone_from(voice);
    }
    if let Some(n) = cli.max_concurrency {
        config.synthesis.max_concurrency = n;
    }
    if let Some(n) = cli.max_unit_chars {
        config.synthesis.max_unit_chars = n;
    }

    config.validate()?;
    tracing::debug!(?config, "configuration resolved");
    Ok(config)
}

fn print_voices(catalog: &VoiceCatalog) {
    for voice in catalog.voices() {
        println!("{:<32} {:<8} {}", voice.name, voice.provider.key(), voice.description);
    }
}
