//! Destination protocol: how a record becomes a request and how a response
//! is judged.
//!
//! The worker is generic over [`Protocol`] so the delivery machinery stays the
//! same whatever the destination's vocabulary is.

use reqwest::Url;

use crate::client::{HttpReply, PostOutcome};
use crate::fields::{self, FieldTable};
use crate::observation::Observation;
use crate::units::MapError;

/// Parameter carrying the shared secret.
pub const PASSWORD_KEY: &str = "PASS";

/// Parameter carrying the observation time as epoch seconds.
pub const TIMESTAMP_KEY: &str = "U";

/// Parameter identifying the uploading software.
pub const CLIENT_KEY: &str = "SW";

/// Body returned by the server when an update is accepted.
pub const SUCCESS_MARKER: &str = "Success";

/// Strategy used by the upload worker for a particular destination.
pub trait Protocol: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// The field table used to build requests.
    fn field_table(&self) -> &FieldTable;

    /// Build the request URL for a record.
    ///
    /// Returns `Ok(None)` when the record has no data worth posting.
    fn build_request(&self, record: &Observation) -> Result<Option<Url>, MapError>;

    /// Classify the destination's reply.
    fn check_response(&self, reply: &HttpReply) -> PostOutcome;

    /// A copy of the URL that is safe to log.
    fn redact(&self, url: &Url) -> Url {
        url.clone()
    }
}

/// The Meteotemplate update API.
///
/// Requests look like
/// `GET http://host/plugins/api/update.php?PASS=secret&U=1700000000&SW=...&T=21.50&H=40`.
#[derive(Debug, Clone)]
pub struct Meteotemplate {
    password: String,
    server_url: Url,
    client_id: String,
    table: FieldTable,
}

impl Meteotemplate {
    pub fn new(
        password: impl Into<String>,
        server_url: Url,
        client_id: impl Into<String>,
        table: FieldTable,
    ) -> Self {
        Self {
            password: password.into(),
            server_url,
            client_id: client_id.into(),
            table,
        }
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }
}

impl Protocol for Meteotemplate {
    fn name(&self) -> &str {
        "Meteotemplate"
    }

    fn field_table(&self) -> &FieldTable {
        &self.table
    }

    fn build_request(&self, record: &Observation) -> Result<Option<Url>, MapError> {
        let data = fields::map_record(record, &self.table)?;

        // The server needs at least one parameter besides PASS and U
        if data.is_empty() {
            return Ok(None);
        }

        let mut url = self.server_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(PASSWORD_KEY, &self.password)
                .append_pair(TIMESTAMP_KEY, &record.date_time.to_string())
                .append_pair(CLIENT_KEY, &self.client_id);
            for (key, value) in &data {
                query.append_pair(key, value);
            }
        }

        Ok(Some(url))
    }

    fn check_response(&self, reply: &HttpReply) -> PostOutcome {
        if !reply.status.is_success() {
            return PostOutcome::Retryable(format!("server returned status {}", reply.status));
        }

        let body = reply.body.trim();
        if body == SUCCESS_MARKER {
            PostOutcome::Success
        } else {
            PostOutcome::Retryable(format!("server returned '{}'", body))
        }
    }

    fn redact(&self, url: &Url) -> Url {
        let mut redacted = url.clone();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                if k == PASSWORD_KEY {
                    (k.into_owned(), "XXX".to_string())
                } else {
                    (k.into_owned(), v.into_owned())
                }
            })
            .collect();
        redacted.query_pairs_mut().clear().extend_pairs(pairs);
        redacted
    }
}
