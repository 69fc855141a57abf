//! The uploader service: the piece that sits between the station's event
//! stream and the background upload worker.
//!
//! Event handlers only enqueue a copy of the record and return; all network
//! I/O happens on the worker task. A service without a password is created
//! disabled and silently ignores events.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Url;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive::Archive;
use crate::client::{HttpTransport, Transport};
use crate::config::{Binding, Config};
use crate::fields::FieldTable;
use crate::observation::{Event, Observation};
use crate::protocol::{Meteotemplate, Protocol};
use crate::queue::{DeliveryQueue, QueueConfig, QueueSender, QueueStats};
use crate::worker::{UploadStats, UploadWorker, WorkerSettings};

/// Default time allowed for the worker to finish on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Combined queue and upload statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub queue: QueueStats,
    pub upload: UploadStats,
}

struct Running {
    sender: QueueSender,
    worker: JoinHandle<()>,
    stats: Arc<RwLock<UploadStats>>,
}

/// Uploader bound to the station's observation events.
pub struct UploaderService {
    binding: Binding,
    running: Option<Running>,
}

impl UploaderService {
    /// Start an uploader posting to a Meteotemplate server.
    ///
    /// Never fails: configuration problems are logged and yield a disabled
    /// service. Must be called from within a tokio runtime.
    pub fn start(config: &Config, archive: Option<Arc<dyn Archive>>) -> Self {
        let Some(password) = config.password.clone() else {
            error!("Data will not be uploaded: missing password");
            return Self::disabled(config.binding);
        };

        let server_url = match Url::parse(&config.server_url) {
            Ok(url) => url,
            Err(e) => {
                error!(server_url = %config.server_url, error = %e, "Data will not be uploaded: invalid server URL");
                return Self::disabled(config.binding);
            }
        };

        let transport = match HttpTransport::new(config.timeout, config.client_id.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "Data will not be uploaded: failed to create HTTP client");
                return Self::disabled(config.binding);
            }
        };

        let protocol = Meteotemplate::new(
            password,
            server_url,
            config.client_id.clone(),
            FieldTable::meteotemplate(),
        );
        info!(server_url = %protocol.server_url(), "Data will be uploaded to Meteotemplate");

        Self::start_with(config, protocol, transport, archive)
    }

    /// Start an uploader with an explicit protocol and transport.
    pub fn start_with<P: Protocol, T: Transport>(
        config: &Config,
        protocol: P,
        transport: T,
        archive: Option<Arc<dyn Archive>>,
    ) -> Self {
        let (sender, queue) = DeliveryQueue::new(QueueConfig::new(config.max_backlog));

        let mut worker = UploadWorker::new(protocol, transport, WorkerSettings::from(config));
        if let Some(archive) = archive {
            worker = worker.with_archive(archive);
        }
        let stats = worker.stats_handle();

        info!(
            binding = ?config.binding,
            post_interval_secs = config.post_interval.map(|d| d.as_secs()),
            max_backlog = config.max_backlog,
            max_tries = config.max_tries,
            skip_upload = config.skip_upload,
            "Uploader started"
        );

        Self {
            binding: config.binding,
            running: Some(Running {
                sender,
                worker: tokio::spawn(worker.run(queue)),
                stats,
            }),
        }
    }

    fn disabled(binding: Binding) -> Self {
        Self {
            binding,
            running: None,
        }
    }

    /// Whether records are being uploaded.
    pub fn is_enabled(&self) -> bool {
        self.running.is_some()
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// Handle a raw station packet.
    pub fn new_loop_packet(&self, packet: &Observation) {
        if self.binding.accepts_loop() {
            self.enqueue(packet);
        }
    }

    /// Handle a completed archive record.
    pub fn new_archive_record(&self, record: &Observation) {
        if self.binding.accepts_archive() {
            self.enqueue(record);
        }
    }

    /// Dispatch an event to the matching handler.
    pub fn on_event(&self, event: &Event) {
        match event {
            Event::NewLoopPacket(packet) => self.new_loop_packet(packet),
            Event::NewArchiveRecord(record) => self.new_archive_record(record),
        }
    }

    fn enqueue(&self, record: &Observation) {
        let Some(running) = &self.running else {
            return;
        };
        if let Err(e) = running.sender.push(record.clone()) {
            debug!(date_time = record.date_time, error = %e, "Record not queued");
        }
    }

    pub fn stats(&self) -> ServiceStats {
        match &self.running {
            Some(running) => ServiceStats {
                queue: running.sender.stats(),
                upload: running.stats.read().map(|s| s.clone()).unwrap_or_default(),
            },
            None => ServiceStats::default(),
        }
    }

    /// Close the queue and wait up to `timeout` for the worker to finish.
    ///
    /// Records still pending are drained unless the worker is waiting out
    /// the post interval, in which case they are dropped. A worker that does
    /// not finish in time is aborted.
    pub async fn shutdown(self, timeout: Duration) -> ServiceStats {
        let stats = self.stats();
        let Some(running) = self.running else {
            return stats;
        };

        running.sender.close();
        let abort = running.worker.abort_handle();

        match tokio::time::timeout(timeout, running.worker).await {
            Ok(Ok(())) => info!("Upload worker shut down gracefully"),
            Ok(Err(e)) => warn!(error = %e, "Upload worker panicked during shutdown"),
            Err(_) => {
                warn!("Upload worker shutdown timed out after {:?}", timeout);
                abort.abort();
            }
        }

        ServiceStats {
            queue: running.sender.stats(),
            upload: running.stats.read().map(|s| s.clone()).unwrap_or_default(),
        }
    }
}
