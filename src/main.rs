//! Meteotemplate uploader - forwards weather observations to a Meteotemplate server
//!
//! Observations are read as JSON lines from stdin, one event per line:
//!
//! ```text
//! {"event": "loop", "dateTime": 1700000000, "usUnits": 1, "outTemp": 32.5}
//! {"event": "archive", "dateTime": 1700000300, "usUnits": 1, "rain": 0.01}
//! ```
//!
//! Archive records are also kept in an in-memory archive used to compute
//! accumulated rain. With `METEOTEMPLATE_SIMULATE=true` a simulated station
//! is used instead of stdin.
//!
//! ## Configuration
//!
//! See [`meteotemplate_uploader::config::Config`] for the `METEOTEMPLATE_*`
//! variables. `RUST_LOG` sets the logging filter (default: info).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meteotemplate_uploader::archive::{Archive, MemoryArchive};
use meteotemplate_uploader::config::Config;
use meteotemplate_uploader::observation::{Event, Observation};
use meteotemplate_uploader::service::{UploaderService, DEFAULT_SHUTDOWN_TIMEOUT};
use meteotemplate_uploader::simulator::StationSimulator;

/// Key naming the event kind on each input line
const EVENT_KEY: &str = "event";

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Meteotemplate uploader...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                server_url = %config.server_url,
                binding = ?config.binding,
                throttle = ?config.throttle,
                skip_upload = config.skip_upload,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let archive = Arc::new(MemoryArchive::new());
    let enrich_from: Arc<dyn Archive> = archive.clone();
    let service = UploaderService::start(&config, Some(enrich_from));

    let simulate = matches!(
        std::env::var("METEOTEMPLATE_SIMULATE")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref(),
        Ok("1" | "true" | "yes" | "on")
    );

    tokio::select! {
        _ = feed(&service, &archive, simulate) => {
            info!("Input exhausted, stopping...");
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    info!("Initiating graceful shutdown...");
    let stats = service.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
    info!(
        received = stats.queue.records_received,
        dropped = stats.queue.records_dropped,
        succeeded = stats.upload.posts_succeeded,
        failed = stats.upload.posts_failed,
        "Meteotemplate uploader stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

async fn feed(service: &UploaderService, archive: &MemoryArchive, simulate: bool) {
    if simulate {
        run_simulator(service, archive).await;
    } else {
        read_stdin(service, archive).await;
    }
}

fn dispatch(service: &UploaderService, archive: &MemoryArchive, event: Event) {
    if let Event::NewArchiveRecord(record) = &event {
        archive.insert(record.clone());
    }
    service.on_event(&event);
}

/// Read events from stdin until EOF.
async fn read_stdin(service: &UploaderService, archive: &MemoryArchive) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number: u64 = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        line_number += 1;

        if line.trim().is_empty() {
            continue;
        }

        match parse_event(&line) {
            Ok(event) => dispatch(service, archive, event),
            Err(e) => warn!(line = line_number, error = %e, "Skipping malformed input line"),
        }
    }
}

/// Parse one input line into an event.
fn parse_event(line: &str) -> Result<Event, String> {
    let mut value: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;

    let fields = value
        .as_object_mut()
        .ok_or_else(|| "expected a JSON object".to_string())?;

    let kind = match fields.remove(EVENT_KEY) {
        None => "loop".to_string(),
        Some(serde_json::Value::String(kind)) => kind.to_ascii_lowercase(),
        Some(other) => return Err(format!("'{}' must be a string, got {}", EVENT_KEY, other)),
    };

    let record: Observation = serde_json::from_value(value).map_err(|e| e.to_string())?;

    match kind.as_str() {
        "loop" => Ok(Event::NewLoopPacket(record)),
        "archive" => Ok(Event::NewArchiveRecord(record)),
        other => Err(format!("unknown event '{}'", other)),
    }
}

/// Feed simulated packets and archive records until interrupted.
async fn run_simulator(service: &UploaderService, archive: &MemoryArchive) {
    let mut simulator = StationSimulator::with_defaults();
    let mut ticker = interval(Duration::from_secs(simulator.config().loop_interval_secs.max(1)));
    info!(
        loop_interval_secs = simulator.config().loop_interval_secs,
        "Simulated station started"
    );

    loop {
        ticker.tick().await;

        let packet = simulator.next_packet(Utc::now().timestamp());
        dispatch(service, archive, Event::NewLoopPacket(packet));

        if simulator.archive_due() {
            if let Some(record) = simulator.take_archive_record() {
                dispatch(service, archive, Event::NewArchiveRecord(record));
            }
        }
    }
}
