use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use doatrackd::config::Config;
use doatrackd::error::Error;
use doatrackd::metrics::Metrics;
use doatrackd::sdr::Sdr;
use doatrackd::telemetry::{HistoryRing, JsonlReporter, LogReporter, Reporter, ReporterList};
use doatrackd::tracker::Tracker;

#[derive(Parser, Debug)]
#[command(name = "doatrackd")]
#[command(about = "Monopulse direction-of-arrival tracking daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/doatrack/doatrack.toml")]
    config: PathBuf,
    /// Backend override: mock or pluto
    #[arg(long)]
    backend: Option<String>,
    /// IIOD endpoint override, host:port
    #[arg(long)]
    uri: Option<String>,
    /// Acquire once, print the bearing, and exit
    #[arg(long)]
    scan_only: bool,
    /// Extra telemetry sinks, e.g. jsonl:/var/log/doatrack/samples.ndjson
    #[arg(long)]
    telemetry: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load_from(&args.config);
    if let Some(backend) = args.backend {
        config.backend.kind = backend;
    }
    if let Some(uri) = args.uri {
        config.radio.uri = uri;
    }
    config.validate().context("configuration rejected")?;

    let metrics = Arc::new(Metrics::new());

    // Roll the frames/s gauge every second.
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                metrics.rollup();
            }
        });
    }

    // Log a metrics line every ten seconds.
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                info!(
                    "metrics: frames/s={} frames={} empty={} errors={} iters={}",
                    metrics.rx_frames_per_sec(),
                    metrics.rx_frames_total(),
                    metrics.rx_empty_total(),
                    metrics.transport_errors_total(),
                    metrics.track_iterations_total()
                );
            }
        });
    }

    let history = Arc::new(HistoryRing::new(config.tracking.history_limit));
    let mut reporters = ReporterList::new();
    reporters.register(LogReporter);
    reporters.register_shared(Arc::clone(&history) as Arc<dyn Reporter>);
    for sink in &args.telemetry {
        if let Some(path) = sink.strip_prefix("jsonl:") {
            match JsonlReporter::new(path).await {
                Ok(reporter) => reporters.register(reporter),
                Err(err) => warn!("telemetry sink {sink} unavailable: {err}"),
            }
        } else {
            warn!("unknown telemetry sink spec {sink:?}");
        }
    }

    info!(
        "starting: backend={} uri={} fft={} tone={} Hz",
        config.backend.kind,
        config.radio.uri,
        config.tracking.fft_size,
        config.radio.tone_offset_hz
    );

    let backend = Sdr::init(&config)
        .await
        .context("backend initialization failed")?;
    let mut tracker = Tracker::new(config, backend, Arc::new(reporters), Arc::clone(&metrics));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    let outcome = if args.scan_only {
        tracker.run_once(cancel).await.map(|result| {
            println!(
                "bearing {:.2} deg (delay {:.1} deg, peak {:.1} dBFS)",
                result.angle_deg, result.delay_deg, result.peak_dbfs
            );
        })
    } else {
        tracker.run(cancel).await
    };

    if let Err(err) = tracker.close().await {
        warn!("shutdown cleanup: {err}");
    }

    match outcome {
        Ok(()) => Ok(()),
        Err(Error::Cancelled) => {
            info!("stopped");
            Ok(())
        }
        Err(err) => Err(err).context("tracker stopped"),
    }
}
