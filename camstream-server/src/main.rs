//! camstream server entry point.
//!
//! ```text
//! camstream-server                  Serve with camstream.toml (or defaults)
//! camstream-server --config <path>  Load a custom config TOML
//! camstream-server --bind <addr>    Override the listen address
//! camstream-server --gen-config     Write default config to stdout
//! camstream-server --list-codecs    Probe codecs, print the table and exit
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use camstream_core::codec::{FfmpegProbe, detect_with};
use camstream_core::{
    CodecTable, ConnectionRegistry, DefaultCodecFactory, SharedCapture, SyntheticSource,
};
use camstream_server::config::ServerConfig;
use camstream_server::service::StreamServer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camstream-server", about = "Adaptive camera streaming over WebSocket")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "camstream.toml")]
    config: PathBuf,

    /// Listen address, overriding the config file.
    #[arg(short, long)]
    bind: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Probe available codecs, print them and exit.
    #[arg(long)]
    list_codecs: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(bind) = cli.bind {
        config.network.bind = bind;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("camstream-server v{}", env!("CARGO_PKG_VERSION"));

    let table = if config.codec.probe || cli.list_codecs {
        let ffmpeg = FfmpegProbe {
            timeout: config.probe_timeout(),
            ..FfmpegProbe::with_binary(config.codec.ffmpeg.clone())
        };
        tokio::task::spawn_blocking(move || detect_with(&ffmpeg)).await?
    } else {
        CodecTable::fallback_only()
    };

    // --list-codecs: show what detection found and exit.
    if cli.list_codecs {
        println!("gpu matrix path: {}", table.gpu_matrix_path());
        for family in table.families() {
            for variant in table.variants(family) {
                println!("{variant}");
            }
        }
        println!("fallback: {}", table.fallback());
        return Ok(());
    }

    info!("listen address: {}", config.network.bind);
    info!(
        "default stream: {}x{} @ {} fps, quality {}",
        config.capture.width, config.capture.height, config.capture.fps, config.capture.quality
    );
    info!("best codec: {}", table.get_best(config.codec.prefer_hardware));

    let source = match config.synthetic_period() {
        Some(period) => SyntheticSource::with_period(period),
        None => SyntheticSource::new(),
    };
    let registry = ConnectionRegistry::new(
        SharedCapture::new(Arc::new(source)),
        Arc::new(table),
        Arc::new(DefaultCodecFactory {
            ffmpeg: config.codec.ffmpeg.clone(),
            encode_timeout: config.streaming.encode_timeout(),
        }),
        config.to_registry_options(),
    );

    let service = StreamServer::new(config, Arc::new(registry));
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
