use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_ENCODING, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decoder;
use crate::domain::{BBox, EntityType};
use crate::error::OprError;

const QUERY_SETTINGS: &str = "[timeout:1800][maxsize:1000000000]";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One key with the values and entity kinds it is fetched for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    pub key: String,
    pub values: Vec<String>,
    pub kinds: Vec<EntityType>,
}

impl TagFilter {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() || self.kinds.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryWindow {
    Snapshot { date: String },
    Diff { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverpassQuery {
    pub window: QueryWindow,
    pub filter: TagFilter,
    pub bbox: Option<BBox>,
}

impl OverpassQuery {
    pub fn snapshot(date: &str, filter: TagFilter, bbox: Option<BBox>) -> Self {
        Self {
            window: QueryWindow::Snapshot {
                date: date.to_string(),
            },
            filter,
            bbox,
        }
    }

    pub fn diff(from: &str, to: &str, filter: TagFilter) -> Self {
        Self {
            window: QueryWindow::Diff {
                from: from.to_string(),
                to: to.to_string(),
            },
            filter,
            bbox: None,
        }
    }

    pub fn with_bbox(&self, bbox: BBox) -> Self {
        Self {
            bbox: Some(bbox),
            ..self.clone()
        }
    }

    pub fn is_diff(&self) -> bool {
        matches!(self.window, QueryWindow::Diff { .. })
    }

    /// Overpass QL for the full data request.
    pub fn to_ql(&self) -> String {
        format!("[out:xml]{}; out geom meta;", self.body())
    }

    /// Overpass QL for the cheap size probe of the same selection.
    pub fn to_count_ql(&self) -> String {
        format!("[out:csv(::count;false)]{}; out count;", self.body())
    }

    fn body(&self) -> String {
        let (header, changed) = match &self.window {
            QueryWindow::Snapshot { date } => (format!("[date:\"{date}\"]"), String::new()),
            QueryWindow::Diff { from, to } => (
                format!("[diff:\"{from}\",\"{to}\"]"),
                format!("(changed:\"{from}\",\"{to}\")"),
            ),
        };
        let bbox = self
            .bbox
            .map(|bbox| format!("({})", bbox.to_overpass()))
            .unwrap_or_default();
        let mut statements = String::new();
        for kind in &self.filter.kinds {
            for value in &self.filter.values {
                statements.push_str(&format!(
                    "{kind}[\"{}\"=\"{}\"]{changed}{bbox};",
                    escape_ql(&self.filter.key),
                    escape_ql(value)
                ));
            }
        }
        format!("{QUERY_SETTINGS}{header}; ({statements})")
    }
}

fn escape_ql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub type FeedReader = Box<dyn BufRead + Send>;

pub trait OverpassClient: Send + Sync {
    /// Latest timestamp the service has data for, `yyyy-MM-ddTHH:mm:ssZ`.
    fn latest_timestamp(&self) -> Result<String, OprError>;
    fn count(&self, query: &OverpassQuery) -> Result<u64, OprError>;
    fn fetch(&self, query: &OverpassQuery) -> Result<FeedReader, OprError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverpassSettings {
    pub url: String,
    pub timestamp_url: String,
    pub timeout_secs: u64,
}

impl Default for OverpassSettings {
    fn default() -> Self {
        Self {
            url: "https://overpass-api.de/api/interpreter".to_string(),
            timestamp_url: "https://overpass-api.de/api/timestamp".to_string(),
            timeout_secs: 4 * 60 * 60,
        }
    }
}

#[derive(Clone)]
pub struct OverpassHttpClient {
    client: Client,
    settings: OverpassSettings,
}

impl OverpassHttpClient {
    pub fn new(settings: OverpassSettings) -> Result<Self, OprError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("opr-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| OprError::Config(err.to_string()))?,
        );
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| OprError::TransientNetwork(err.to_string()))?;
        Ok(Self { client, settings })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, OprError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    if !resp.status().is_success() {
                        let message = resp
                            .text()
                            .unwrap_or_else(|_| "overpass request failed".to_string());
                        return Err(OprError::UpstreamStatus {
                            status,
                            message: message.trim().to_string(),
                        });
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(OprError::TransientNetwork(err.to_string()));
                }
            }
        }
    }

    fn query(&self, ql: &str) -> Result<FeedReader, OprError> {
        debug!(query = ql, "overpass request");
        let response = self.send_with_retries(|| {
            self.client
                .get(&self.settings.url)
                .query(&[("data", ql)])
        })?;
        open_body(BufReader::new(response))
    }
}

impl OverpassClient for OverpassHttpClient {
    fn latest_timestamp(&self) -> Result<String, OprError> {
        let response = self.send_with_retries(|| self.client.get(&self.settings.timestamp_url))?;
        let body = response
            .text()
            .map_err(|err| OprError::TransientNetwork(err.to_string()))?;
        Ok(body.trim().to_string())
    }

    fn count(&self, query: &OverpassQuery) -> Result<u64, OprError> {
        decoder::parse_count(self.query(&query.to_count_ql())?)
    }

    fn fetch(&self, query: &OverpassQuery) -> Result<FeedReader, OprError> {
        self.query(&query.to_ql())
    }
}

/// Wraps the body in a gzip decoder when it starts with the gzip magic.
pub fn open_body<R>(mut body: BufReader<R>) -> Result<FeedReader, OprError>
where
    R: std::io::Read + Send + 'static,
{
    let head = body
        .fill_buf()
        .map_err(|err| OprError::TransientNetwork(err.to_string()))?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(BufReader::new(GzDecoder::new(body))))
    } else {
        Ok(Box::new(body))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
