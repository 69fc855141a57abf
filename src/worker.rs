//! The upload worker.
//!
//! A single task drains the delivery queue and, for every record:
//!
//! 1. drops it if it is stale,
//! 2. waits out the post interval (coalescing the backlog to its newest
//!    record, or posting records one by one, depending on the policy),
//! 3. enriches it from the archive when one is attached,
//! 4. maps it to a request and posts it with retries.
//!
//! Nothing that goes wrong with one record stops the loop; the worker only
//! exits once the queue is closed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::archive::{self, Archive};
use crate::client::{self, Delivery, SkipReason, Transport};
use crate::config::{Config, ThrottlePolicy};
use crate::observation::{Observation, Timestamp};
use crate::protocol::Protocol;
use crate::queue::{DeliveryQueue, QueueItem};

/// Delivery settings for the worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Minimum time between successful posts; `None` disables throttling
    pub post_interval: Option<Duration>,

    /// Maximum record age; `None` keeps everything
    pub stale: Option<Duration>,

    pub max_tries: u32,

    pub retry_wait: Duration,

    /// Build requests but never send them
    pub skip_upload: bool,

    pub throttle: ThrottlePolicy,

    pub log_success: bool,

    pub log_failure: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            post_interval: config.post_interval,
            stale: config.stale,
            max_tries: config.max_tries,
            retry_wait: config.retry_wait,
            skip_upload: config.skip_upload,
            throttle: config.throttle,
            log_success: config.log_success,
            log_failure: config.log_failure,
        }
    }
}

/// Statistics about upload outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Records accepted by the server
    pub posts_succeeded: u64,

    /// Records that failed after every attempt
    pub posts_failed: u64,

    /// Records whose post was aborted (dry run)
    pub posts_aborted: u64,

    /// HTTP attempts made, retries included
    pub attempts: u64,

    /// Records dropped for being too old
    pub records_stale: u64,

    /// Records superseded by a newer one within a post interval
    pub records_coalesced: u64,

    /// Records that had nothing to post
    pub records_without_data: u64,

    /// Records abandoned because processing them failed
    pub records_abandoned: u64,
}

/// Background worker posting queued records to one destination.
pub struct UploadWorker<P, T> {
    protocol: P,
    transport: T,
    archive: Option<Arc<dyn Archive>>,
    settings: WorkerSettings,
    stats: Arc<RwLock<UploadStats>>,

    /// When the last successful post completed
    last_post: Option<Instant>,
}

impl<P: Protocol, T: Transport> UploadWorker<P, T> {
    pub fn new(protocol: P, transport: T, settings: WorkerSettings) -> Self {
        Self {
            protocol,
            transport,
            archive: None,
            settings,
            stats: Arc::new(RwLock::new(UploadStats::default())),
            last_post: None,
        }
    }

    /// Enrich records from this archive before mapping them.
    pub fn with_archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Shared handle to the worker's statistics, readable while it runs.
    pub fn stats_handle(&self) -> Arc<RwLock<UploadStats>> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> UploadStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Drain the queue until it is closed.
    pub async fn run(mut self, mut queue: DeliveryQueue) {
        info!(protocol = self.protocol.name(), "Upload worker started");

        loop {
            let record = match queue.pop().await {
                QueueItem::Record(record) => record,
                QueueItem::Stop => break,
            };

            // Don't hold a record through the wait interval only to drop it afterwards
            if let Some(skipped) = self.check_stale(&record) {
                self.report(record.date_time, &skipped);
                continue;
            }

            let Some(record) = self.throttle(record, &mut queue).await else {
                break;
            };

            if let Some(skipped) = self.check_stale(&record) {
                self.report(record.date_time, &skipped);
                continue;
            }

            let date_time = record.date_time;
            let delivery = match AssertUnwindSafe(self.process_record(record))
                .catch_unwind()
                .await
            {
                Ok(delivery) => delivery,
                Err(panic) => Delivery::Abandoned(panic_message(panic.as_ref())),
            };

            if matches!(delivery, Delivery::Delivered { .. }) {
                self.last_post = Some(Instant::now());
            }
            self.report(date_time, &delivery);
        }

        info!(
            protocol = self.protocol.name(),
            pending = queue.len(),
            "Upload worker stopped"
        );
    }

    /// Enrich, map and post a single record.
    pub async fn process_record(&self, record: Observation) -> Delivery {
        let record = match &self.archive {
            Some(archive) => match archive::enrich(&record, archive.as_ref()) {
                Ok(enriched) => enriched,
                Err(e) => {
                    warn!(
                        date_time = record.date_time,
                        error = %e,
                        "Unable to enrich record from archive; posting it as is"
                    );
                    record
                }
            },
            None => record,
        };

        let url = match self.protocol.build_request(&record) {
            Ok(Some(url)) => url,
            Ok(None) => return Delivery::Skipped(SkipReason::NoData),
            Err(e) => return Delivery::Abandoned(e.to_string()),
        };

        debug!(url = %self.protocol.redact(&url), "Built update request");

        if self.settings.skip_upload {
            return Delivery::Aborted("skip_upload is set".to_string());
        }

        client::post_with_retries(
            &self.transport,
            &self.protocol,
            &url,
            self.settings.max_tries,
            self.settings.retry_wait,
        )
        .await
    }

    fn check_stale(&self, record: &Observation) -> Option<Delivery> {
        let max_age = self.settings.stale?;
        let age_secs = record.age(Utc::now().timestamp());
        let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        if age_secs > max_age_secs {
            Some(Delivery::Skipped(SkipReason::Stale { age_secs }))
        } else {
            None
        }
    }

    /// Hold a record until the post interval has elapsed.
    ///
    /// Returns `None` if the queue was closed during the wait, in which case
    /// the held record is dropped.
    async fn throttle(&mut self, record: Observation, queue: &mut DeliveryQueue) -> Option<Observation> {
        let Some(interval) = self.settings.post_interval else {
            return Some(record);
        };

        if let Some(last) = self.last_post {
            let deadline = last + interval;
            let now = Instant::now();
            if now < deadline {
                debug!(
                    date_time = record.date_time,
                    wait_ms = (deadline - now).as_millis() as u64,
                    "Wait interval has not passed"
                );
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = queue.closed() => {
                        info!(
                            date_time = record.date_time,
                            pending = queue.len(),
                            "Shutting down during wait interval; dropping held records"
                        );
                        return None;
                    }
                }
            }
        }

        if self.settings.throttle == ThrottlePolicy::Sequential {
            return Some(record);
        }

        // Last value wins within a post cycle
        match queue.take_latest() {
            Some((latest, superseded)) => {
                let coalesced = superseded as u64 + 1;
                if let Ok(mut stats) = self.stats.write() {
                    stats.records_coalesced += coalesced;
                }
                info!(
                    coalesced = coalesced,
                    date_time = latest.date_time,
                    "Coalesced backlog into most recent record"
                );
                Some(latest)
            }
            None => Some(record),
        }
    }

    fn report(&self, date_time: Timestamp, delivery: &Delivery) {
        let protocol = self.protocol.name();
        let Ok(mut stats) = self.stats.write() else {
            return;
        };

        match delivery {
            Delivery::Delivered { attempts } => {
                stats.posts_succeeded += 1;
                stats.attempts += u64::from(*attempts);
                if self.settings.log_success {
                    info!(protocol, date_time, attempts, "Published record");
                } else {
                    debug!(protocol, date_time, attempts, "Published record");
                }
            }
            Delivery::Failed {
                attempts,
                last_error,
            } => {
                stats.posts_failed += 1;
                stats.attempts += u64::from(*attempts);
                if self.settings.log_failure {
                    error!(protocol, date_time, attempts, error = %last_error, "Failed to publish record");
                } else {
                    debug!(protocol, date_time, attempts, error = %last_error, "Failed to publish record");
                }
            }
            Delivery::Aborted(reason) => {
                stats.posts_aborted += 1;
                debug!(protocol, date_time, reason = %reason, "Post aborted");
            }
            Delivery::Skipped(SkipReason::Stale { age_secs }) => {
                stats.records_stale += 1;
                info!(protocol, date_time, age_secs, "Record is stale; skipping");
            }
            Delivery::Skipped(SkipReason::NoData) => {
                stats.records_without_data += 1;
                info!(protocol, date_time, "Record has no data to post; skipping");
            }
            Delivery::Abandoned(reason) => {
                stats.records_abandoned += 1;
                error!(protocol, date_time, error = %reason, "Unable to process record");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic while processing record".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::client::{ClientError, HttpReply, PostOutcome};
    use crate::fields::FieldTable;
    use crate::observation::{Value, METRIC, US};
    use crate::protocol::Meteotemplate;
    use crate::queue::QueueConfig;
    use reqwest::{StatusCode, Url};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// Records every requested URL and answers from a script.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        requests: Arc<Mutex<Vec<Url>>>,
        script: Arc<Mutex<VecDeque<Result<HttpReply, ClientError>>>>,
    }

    impl RecordingTransport {
        fn failing_first(n: usize) -> Self {
            let transport = Self::default();
            {
                let mut script = transport.script.lock().unwrap();
                for _ in 0..n {
                    script.push_back(Ok(HttpReply::new(StatusCode::SERVICE_UNAVAILABLE, "")));
                }
            }
            transport
        }

        fn requests(&self) -> Vec<Url> {
            self.requests.lock().unwrap().clone()
        }

        fn query_value(url: &Url, key: &str) -> Option<String> {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        }
    }

    impl Transport for RecordingTransport {
        fn get(&self, url: &Url) -> impl Future<Output = Result<HttpReply, ClientError>> + Send {
            self.requests.lock().unwrap().push(url.clone());
            let reply = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpReply::new(StatusCode::OK, "Success")));
            async move { reply }
        }
    }

    /// Protocol that panics on a marked record.
    struct PanickyProtocol(Meteotemplate);

    impl Protocol for PanickyProtocol {
        fn name(&self) -> &str {
            "Panicky"
        }

        fn field_table(&self) -> &FieldTable {
            self.0.field_table()
        }

        fn build_request(&self, record: &Observation) -> Result<Option<Url>, crate::units::MapError> {
            if record.contains("boom") {
                panic!("formatting blew up");
            }
            self.0.build_request(record)
        }

        fn check_response(&self, reply: &HttpReply) -> PostOutcome {
            self.0.check_response(reply)
        }
    }

    fn protocol() -> Meteotemplate {
        Meteotemplate::new(
            "abc123",
            Url::parse("http://localhost/plugins/api/update.php").unwrap(),
            "test-client",
            FieldTable::meteotemplate(),
        )
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            post_interval: None,
            stale: None,
            max_tries: 3,
            retry_wait: Duration::ZERO,
            skip_upload: false,
            throttle: ThrottlePolicy::Coalesce,
            log_success: true,
            log_failure: true,
        }
    }

    fn fresh(offset: i64) -> Observation {
        Observation::new(Utc::now().timestamp() + offset, METRIC).with("outTemp", 20.0)
    }

    async fn run_to_completion<P: Protocol>(
        worker: UploadWorker<P, RecordingTransport>,
        records: Vec<Observation>,
    ) -> UploadStats {
        let stats = worker.stats_handle();
        let (sender, queue) = DeliveryQueue::new(QueueConfig::default());
        for record in records {
            sender.push(record).unwrap();
        }
        sender.close();

        timeout(Duration::from_secs(5), worker.run(queue))
            .await
            .expect("worker should stop after the queue is closed");

        let snapshot = stats.read().unwrap().clone();
        snapshot
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            max_tries: 7,
            skip_upload: true,
            ..Config::default()
        };
        let settings = WorkerSettings::from(&config);
        assert_eq!(settings.max_tries, 7);
        assert!(settings.skip_upload);
        assert_eq!(settings.post_interval, config.post_interval);
    }

    #[tokio::test]
    async fn test_posts_every_record_without_throttle() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(protocol(), transport.clone(), settings());

        let stats = run_to_completion(worker, vec![fresh(-2), fresh(-1), fresh(0)]).await;

        assert_eq!(transport.requests().len(), 3);
        assert_eq!(stats.posts_succeeded, 3);
        assert_eq!(stats.attempts, 3);
    }

    #[tokio::test]
    async fn test_stale_records_are_never_sent() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                stale: Some(Duration::from_secs(60)),
                ..settings()
            },
        );

        let stats = run_to_completion(worker, vec![fresh(-3_600), fresh(0)]).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(stats.records_stale, 1);
        assert_eq!(stats.posts_succeeded, 1);
    }

    #[tokio::test]
    async fn test_extreme_timestamp_does_not_stop_worker() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                stale: Some(Duration::from_secs(60)),
                ..settings()
            },
        );
        let ancient = Observation::new(i64::MIN, METRIC).with("outTemp", 1.0);

        let stats = run_to_completion(worker, vec![ancient, fresh(0)]).await;

        assert_eq!(transport.requests().len(), 1);
        assert_eq!(stats.records_stale, 1);
        assert_eq!(stats.posts_succeeded, 1);
    }

    #[tokio::test]
    async fn test_records_without_data_are_not_sent() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(protocol(), transport.clone(), settings());
        let empty = Observation::new(Utc::now().timestamp(), METRIC)
            .with("outTemp", Value::Null)
            .with("unmapped", 1.0);

        let stats = run_to_completion(worker, vec![empty]).await;

        assert!(transport.requests().is_empty());
        assert_eq!(stats.records_without_data, 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let max_tries = 3;
        let transport = RecordingTransport::failing_first(max_tries as usize - 1);
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                max_tries,
                ..settings()
            },
        );

        let stats = run_to_completion(worker, vec![fresh(0)]).await;

        assert_eq!(transport.requests().len(), max_tries as usize);
        assert_eq!(stats.posts_succeeded, 1);
        assert_eq!(stats.posts_failed, 0);
        assert_eq!(stats.attempts, u64::from(max_tries));
    }

    #[tokio::test]
    async fn test_exhausted_retries_do_not_stop_the_worker() {
        let transport = RecordingTransport::failing_first(2);
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                max_tries: 2,
                ..settings()
            },
        );

        let stats = run_to_completion(worker, vec![fresh(-1), fresh(0)]).await;

        assert_eq!(transport.requests().len(), 3);
        assert_eq!(stats.posts_failed, 1);
        assert_eq!(stats.posts_succeeded, 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_touches_the_network() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                skip_upload: true,
                ..settings()
            },
        );

        let stats = run_to_completion(worker, vec![fresh(0), fresh(1)]).await;

        assert!(transport.requests().is_empty());
        assert_eq!(stats.posts_aborted, 2);
    }

    #[tokio::test]
    async fn test_malformed_record_is_abandoned() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(protocol(), transport.clone(), settings());
        let bad = Observation::new(Utc::now().timestamp(), 99).with("outTemp", 1.0);

        let stats = run_to_completion(worker, vec![bad, fresh(0)]).await;

        assert_eq!(stats.records_abandoned, 1);
        assert_eq!(stats.posts_succeeded, 1);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained_per_record() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(PanickyProtocol(protocol()), transport.clone(), settings());
        let bomb = fresh(0).with("boom", 1.0);

        let stats = run_to_completion(worker, vec![bomb, fresh(1)]).await;

        assert_eq!(stats.records_abandoned, 1);
        assert_eq!(stats.posts_succeeded, 1);
    }

    #[tokio::test]
    async fn test_archive_enrichment_adds_day_rain() {
        let transport = RecordingTransport::default();
        let now = Utc::now().timestamp();
        let archive = Arc::new(MemoryArchive::new());
        archive.insert(Observation::new(now, METRIC).with("rain", 0.2));

        let worker = UploadWorker::new(protocol(), transport.clone(), settings())
            .with_archive(archive);

        run_to_completion(worker, vec![Observation::new(now, METRIC).with("outTemp", 5.0)]).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            RecordingTransport::query_value(&requests[0], "R").as_deref(),
            Some("2.000")
        );
    }

    #[tokio::test]
    async fn test_enrichment_failure_posts_raw_record() {
        let transport = RecordingTransport::default();
        let now = Utc::now().timestamp();
        let archive = Arc::new(MemoryArchive::new());
        // Archive rows in a different unit system than the record
        archive.insert(Observation::new(now, US).with("rain", 0.1));

        let worker = UploadWorker::new(protocol(), transport.clone(), settings())
            .with_archive(archive);

        let stats = run_to_completion(worker, vec![Observation::new(now, METRIC).with("outTemp", 5.0)]).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(RecordingTransport::query_value(&requests[0], "R").is_none());
        assert_eq!(stats.posts_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_posts_latest_after_interval() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                post_interval: Some(Duration::from_secs(300)),
                ..settings()
            },
        );
        let stats = worker.stats_handle();
        let (sender, queue) = DeliveryQueue::with_defaults();
        let handle = tokio::spawn(worker.run(queue));

        let base = Utc::now().timestamp();
        sender.push(Observation::new(base, METRIC).with("outTemp", 1.0)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.requests().len(), 1);

        // Three records inside the interval collapse into the newest one
        for (i, temp) in [2.0, 3.0, 4.0].iter().enumerate() {
            sender
                .push(Observation::new(base + 1 + i as i64, METRIC).with("outTemp", *temp))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(transport.requests().len(), 1);

        tokio::time::sleep(Duration::from_secs(250)).await;
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            RecordingTransport::query_value(&requests[1], "T").as_deref(),
            Some("4.00")
        );
        // The two older records were superseded
        assert_eq!(stats.read().unwrap().records_coalesced, 2);

        sender.close();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_posts_each_record_after_interval() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                post_interval: Some(Duration::from_secs(60)),
                throttle: ThrottlePolicy::Sequential,
                ..settings()
            },
        );
        let (sender, queue) = DeliveryQueue::with_defaults();
        let handle = tokio::spawn(worker.run(queue));

        for i in 0..3 {
            sender.push(fresh(i)).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.requests().len(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.requests().len(), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.requests().len(), 3);

        sender.close();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_wait_interval() {
        let transport = RecordingTransport::default();
        let worker = UploadWorker::new(
            protocol(),
            transport.clone(),
            WorkerSettings {
                post_interval: Some(Duration::from_secs(3_600)),
                ..settings()
            },
        );
        let (sender, queue) = DeliveryQueue::with_defaults();
        let handle = tokio::spawn(worker.run(queue));

        sender.push(fresh(0)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sender.push(fresh(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sender.close();

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should not wait out the interval on shutdown")
            .unwrap();
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "panic: static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "panic: owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "panic while processing record");
    }
}
