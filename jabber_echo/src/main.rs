mod loopback;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
use clap::Parser;
use jabber_keeper::{config, PeerId, SessionKeeper};
use loopback::LoopbackTransport;
use tracing_subscriber::EnvFilter;

/// jabber_echo - keeps an XMPP session alive against a loopback server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file (default: search the usual locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Probability (0..1) that a loopback call fails
    #[arg(short, long, default_value_t = 0.0)]
    fail_rate: f64,

    /// Rooms the loopback server reports as password-protected
    #[arg(short = 'p', long, num_args = 1..)]
    rooms_protected: Vec<String>,
}

/// Install the global subscriber; RUST_LOG wins over `level`
fn init_logging(level: &str, log: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Unable to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.fail_rate) {
        bail!("--fail-rate must be between 0 and 1, got {}", args.fail_rate);
    }

    // Config loading logs to stderr until the real subscriber is known
    let bootstrap = tracing_subscriber::fmt().with_writer(std::io::stderr).finish();
    let app = tracing::subscriber::with_default(bootstrap, || {
        config::load(args.config.as_deref())
    })?;

    let level = args.log_level.as_deref().unwrap_or(app.loglevel.as_str());
    init_logging(level, app.log.as_deref())?;

    let protected = args
        .rooms_protected
        .iter()
        .map(|room| room.parse::<PeerId>())
        .collect::<Result<Vec<_>, _>>()?;

    // Events the loopback server sends back, routed into the keeper
    let (events_tx, events_rx) = flume::unbounded();
    let transport = LoopbackTransport::new(&app.jabber, events_tx, args.fail_rate, protected)?;

    let keeper = SessionKeeper::new(app.jabber, transport)?;
    let handle = keeper.handle();
    let router = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv_async().await {
            handle.deliver(event);
        }
    });

    let report = keeper.run().await?;
    router.abort();

    tracing::info!(
        "Goodbye: {} offline presence(s) sent, {} failed, connection {}",
        report.presences_sent,
        report.presence_errors,
        if report.closed { "closed" } else { "not closed" }
    );
    Ok(())
}
