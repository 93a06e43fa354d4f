#[cfg(feature = "camera")]
mod camera;

use anyhow::{Context, bail};
use clap::Parser;
use crowd_live::{LiveSession, LiveState, SessionConfig, SessionState, SyntheticSource, VideoSource};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "live_tester", about = "Streams one live session to an analyzer and prints the reconciled state")]
struct Args {
    /// Analyzer WebSocket endpoint.
    #[arg(long, env = "CROWD_LIVE_ENDPOINT")]
    endpoint: Option<String>,

    /// Seconds between state reports.
    #[arg(long, default_value_t = 2)]
    report_every: u64,

    /// Stop after this many seconds. Runs until Ctrl-C when omitted.
    #[arg(long)]
    duration: Option<u64>,

    /// Size of the synthetic test pattern.
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Capture from this camera index instead of the test pattern.
    #[cfg(feature = "camera")]
    #[arg(long, conflicts_with = "video")]
    camera: Option<i32>,

    /// Capture from this video file instead of the test pattern.
    #[cfg(feature = "camera")]
    #[arg(long)]
    video: Option<String>,
}

fn open_source(args: &Args) -> Box<dyn VideoSource> {
    #[cfg(feature = "camera")]
    {
        use camera::{CaptureInput, OpenCvSource};
        if let Some(index) = args.camera {
            return Box::new(OpenCvSource::new(CaptureInput::Device(index)));
        }
        if let Some(path) = &args.video {
            return Box::new(OpenCvSource::new(CaptureInput::File(path.clone())));
        }
    }
    Box::new(SyntheticSource::new(args.width, args.height))
}

fn report(state: SessionState, live: &LiveState) {
    let prediction = live
        .prediction
        .as_ref()
        .map(|p| format!("{} in {}", p.expected_risk_level, p.horizon_label))
        .unwrap_or_else(|| "-".to_string());
    let grid = live
        .grid_dimensions
        .map(|d| format!("{}x{}", d.rows, d.cols))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "[{state}] people={} alerts={} prediction={} grid={} merged={} dropped={}",
        live.current_count,
        live.alerts.len(),
        prediction,
        grid,
        live.payloads_merged,
        live.payloads_dropped,
    );
    if let Some(alert) = live.alerts.latest() {
        println!("    latest alert: {} ({})", alert.message, alert.kind);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Logging & Arguments ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    // --- 2. Session Setup ---
    let mut config = SessionConfig::from_env().context("reading CROWD_LIVE_* settings")?;
    if let Some(endpoint) = &args.endpoint {
        config = config.with_endpoint(endpoint)?;
    }
    println!("Streaming to {}", config.endpoint);
    let mut session = LiveSession::new(config);
    session.start(open_source(&args))?;

    // --- 3. Report Loop ---
    let mut status_rx = session.subscribe_status();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.report_every.max(1)));
    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let failure = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break None,
            _ = &mut deadline => break None,
            _ = ticker.tick() => report(session.state(), &session.snapshot()),
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break None;
                }
                let status = status_rx.borrow_and_update().clone();
                tracing::info!(state = %status.state, "session state changed");
                if status.state == SessionState::Failed {
                    break status.error_message;
                }
            }
        }
    };

    // --- 4. Shutdown ---
    session.stop().await;
    report(session.state(), &session.snapshot());
    if let Some(message) = failure {
        bail!(message);
    }
    println!("Session ended cleanly.");
    Ok(())
}
