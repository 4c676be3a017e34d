//! Upstream inspection data source client + raw record transformation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use insp_core::{InspectionRecord, RawRecord, SyncWindow};
use insp_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "insp-adapters";

/// Provider field carrying the stable record identifier.
pub const ID_FIELD: &str = "restaurantinspectionid";
/// Provider field carrying the inspection timestamp.
pub const DATE_FIELD: &str = "inspectedon";

const SOCRATA_TIMESTAMP: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("record has no `restaurantinspectionid` identifier")]
    MissingId,
    #[error("identifier `{0}` is not an integer")]
    NonNumericId(String),
    #[error("inspection date `{0}` is not a timestamp")]
    BadDate(String),
}

/// Maps one provider record into the stored shape.
///
/// The whole raw map is kept as the opaque attribute set.
pub fn to_inspection_record(raw: RawRecord) -> Result<InspectionRecord, MalformedRecord> {
    let external_id = match raw.get(ID_FIELD) {
        None | Some(JsonValue::Null) => return Err(MalformedRecord::MissingId),
        Some(value) => coerce_id(value)?,
    };

    let inspected_on = match raw.get(DATE_FIELD) {
        None | Some(JsonValue::Null) => None,
        Some(value) => Some(
            parse_inspected_on(value).ok_or_else(|| MalformedRecord::BadDate(render(value)))?,
        ),
    };

    Ok(InspectionRecord::new(external_id, inspected_on, raw))
}

fn coerce_id(value: &JsonValue) -> Result<i64, MalformedRecord> {
    match value {
        JsonValue::Number(n) => n.as_i64().ok_or_else(|| MalformedRecord::NonNumericId(n.to_string())),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| MalformedRecord::NonNumericId(s.clone())),
        other => Err(MalformedRecord::NonNumericId(render(other))),
    }
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Accepts Socrata floating timestamps (`2024-03-01T00:00:00.000`) and bare dates.
pub fn parse_inspected_on(value: &JsonValue) -> Option<NaiveDateTime> {
    let text = value.as_str()?.trim();
    let text = text.strip_suffix('Z').unwrap_or(text);
    NaiveDateTime::parse_from_str(text, &format!("{SOCRATA_TIMESTAMP}%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
        })
}

/// Raw records for one window plus what the client observed while paging.
#[derive(Debug, Clone, Default)]
pub struct FetchedWindow {
    pub records: Vec<RawRecord>,
    pub pages: usize,
    /// The page ceiling was reached with a full last page.
    pub truncated: bool,
    pub dropped_outside_window: usize,
}

#[async_trait]
pub trait InspectionSource: Send + Sync {
    async fn fetch_window(&self, run_id: Uuid, window: SyncWindow) -> Result<FetchedWindow, FetchError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub app_token: Option<String>,
    pub page_size: usize,
    pub max_pages: usize,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://data.cityofnewyork.us/resource/4dx7-axux.json".to_string(),
            app_token: None,
            page_size: 1000,
            max_pages: 10,
            http_timeout: Duration::from_secs(20),
            user_agent: "insp-sync/0.1".to_string(),
        }
    }
}

/// SoQL query client for the provider's resource endpoint.
#[derive(Debug)]
pub struct SocrataClient {
    http: HttpFetcher,
    config: UpstreamConfig,
}

impl SocrataClient {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let default_headers = config
            .app_token
            .iter()
            .map(|token| ("X-App-Token".to_string(), token.clone()))
            .collect();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: 1,
            default_headers,
        })?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Query parameters for one page of `window`.
    pub fn window_query(&self, window: SyncWindow, offset: usize) -> Vec<(&'static str, String)> {
        vec![
            (
                "$where",
                format!(
                    "{DATE_FIELD} between '{}' and '{}'",
                    window.start().format(SOCRATA_TIMESTAMP),
                    window.end().format(SOCRATA_TIMESTAMP)
                ),
            ),
            // `:id` is the provider's row id; it keeps paging stable across equal timestamps.
            ("$order", format!("{DATE_FIELD} DESC,:id")),
            ("$limit", self.page_size().to_string()),
            ("$offset", offset.to_string()),
        ]
    }

    fn page_size(&self) -> usize {
        self.config.page_size.max(1)
    }
}

#[async_trait]
impl InspectionSource for SocrataClient {
    async fn fetch_window(&self, run_id: Uuid, window: SyncWindow) -> Result<FetchedWindow, FetchError> {
        let page_size = self.page_size();
        let max_pages = self.config.max_pages.max(1);
        let mut fetched = FetchedWindow::default();

        for page in 0..max_pages {
            let query = self.window_query(window, page * page_size);
            let rows: Vec<RawRecord> = self
                .http
                .get_json(run_id, &self.config.endpoint, &query)
                .await?;
            let count = rows.len();
            fetched.pages += 1;
            fetched.records.extend(rows);
            debug!(%run_id, page, count, "fetched upstream page");

            if count < page_size {
                break;
            }
            if page + 1 == max_pages {
                fetched.truncated = true;
                warn!(
                    %run_id,
                    day = %window.day,
                    max_pages,
                    page_size,
                    "page ceiling reached; remaining upstream records for this window are not synced"
                );
            }
        }

        let before = fetched.records.len();
        retain_in_window(&mut fetched.records, window);
        fetched.dropped_outside_window = before - fetched.records.len();
        if fetched.dropped_outside_window > 0 {
            warn!(
                %run_id,
                dropped = fetched.dropped_outside_window,
                "upstream returned records undated or outside the requested window"
            );
        }
        Ok(fetched)
    }
}

/// Keeps only records dated inside `window`, newest first.
///
/// A record with a missing or unparseable date cannot be placed in the window and is dropped.
pub fn retain_in_window(records: &mut Vec<RawRecord>, window: SyncWindow) {
    records.retain(|raw| {
        raw.get(DATE_FIELD)
            .and_then(parse_inspected_on)
            .is_some_and(|at| window.contains(at))
    });
    records.sort_by_cached_key(|raw| {
        std::cmp::Reverse(raw.get(DATE_FIELD).and_then(parse_inspected_on))
    });
}
