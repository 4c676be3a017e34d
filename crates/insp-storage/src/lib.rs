//! Inspection record store (PostgreSQL + in-memory) and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use insp_core::InspectionRecord;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "insp-storage";

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Conflict(i64),
    #[error("record {0} not found")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Paging and search options for listing stored records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Case-insensitive substring match on the `name` attribute.
    pub name: Option<String>,
}

impl ListQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    fn name_needle(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

/// Persistence contract shared by the sync pipeline and the CRUD surface.
///
/// Each call is atomic on its own; callers get no cross-call transaction.
#[async_trait]
pub trait InspectionStore: Send + Sync {
    /// Removes every record whose `external_id` is in `ids`, in one statement.
    async fn delete_by_external_ids(&self, ids: &[i64]) -> Result<u64, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the identifier is already present.
    async fn insert(&self, record: &InspectionRecord) -> Result<(), StoreError>;

    async fn get(&self, external_id: i64) -> Result<Option<InspectionRecord>, StoreError>;

    async fn list(&self, query: &ListQuery) -> Result<Vec<InspectionRecord>, StoreError>;

    /// Full replacement of an existing row. Fails with [`StoreError::NotFound`] otherwise.
    async fn update(&self, record: &InspectionRecord) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    async fn delete(&self, external_id: i64) -> Result<bool, StoreError>;
}

pub type DynStore = Arc<dyn InspectionStore>;

#[derive(Debug, Clone)]
pub struct PgInspectionStore {
    pool: PgPool,
}

impl PgInspectionStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn row_to_record(row: PgRow) -> Result<InspectionRecord, StoreError> {
    let external_id: i64 = row.try_get("external_id")?;
    let inspected_on: Option<NaiveDateTime> = row.try_get("inspected_on")?;
    let fields: JsonValue = row.try_get("fields")?;
    let fields = match fields {
        JsonValue::Object(map) => map,
        _ => Default::default(),
    };
    Ok(InspectionRecord {
        external_id,
        inspected_on,
        fields,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Name search is a literal substring match, so `%` and `_` carry no pattern meaning.
const LIST_SQL: &str = r#"
    SELECT external_id, inspected_on, fields
      FROM inspections
     WHERE ($3::text IS NULL OR strpos(lower(fields->>'name'), $3) > 0)
     ORDER BY inspected_on DESC NULLS LAST, external_id DESC
     LIMIT $1 OFFSET $2
"#;

#[async_trait]
impl InspectionStore for PgInspectionStore {
    async fn delete_by_external_ids(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM inspections WHERE external_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert(&self, record: &InspectionRecord) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO inspections (external_id, inspected_on, fields)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(record.external_id)
        .bind(record.inspected_on)
        .bind(JsonValue::Object(record.fields.clone()))
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(record.external_id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, external_id: i64) -> Result<Option<InspectionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_id, inspected_on, fields
              FROM inspections
             WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_record).transpose()
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<InspectionRecord>, StoreError> {
        let rows = sqlx::query(LIST_SQL)
        .bind(query.limit())
        .bind(query.offset())
        .bind(query.name_needle())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn update(&self, record: &InspectionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE inspections
               SET inspected_on = $2,
                   fields = $3,
                   updated_at = NOW()
             WHERE external_id = $1
            "#,
        )
        .bind(record.external_id)
        .bind(record.inspected_on)
        .bind(JsonValue::Object(record.fields.clone()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.external_id));
        }
        Ok(())
    }

    async fn delete(&self, external_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM inspections WHERE external_id = $1")
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local store with the same uniqueness rules as the database table.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<i64, InspectionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<InspectionRecord> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl InspectionStore for MemoryStore {
    async fn delete_by_external_ids(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let removed = ids.iter().filter(|id| rows.remove(id).is_some()).count();
        Ok(removed as u64)
    }

    async fn insert(&self, record: &InspectionRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&record.external_id) {
            return Err(StoreError::Conflict(record.external_id));
        }
        rows.insert(record.external_id, record.clone());
        Ok(())
    }

    async fn get(&self, external_id: i64) -> Result<Option<InspectionRecord>, StoreError> {
        Ok(self.rows.read().await.get(&external_id).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<InspectionRecord>, StoreError> {
        let needle = query.name_needle();
        let rows = self.rows.read().await;
        let mut matched = rows
            .values()
            .filter(|r| match &needle {
                Some(needle) => r
                    .field_str("name")
                    .map(|name| name.to_lowercase().contains(needle.as_str()))
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        // Newest first, undated rows last.
        matched.sort_by(|a, b| {
            b.inspected_on
                .is_some()
                .cmp(&a.inspected_on.is_some())
                .then(b.inspected_on.cmp(&a.inspected_on))
                .then(b.external_id.cmp(&a.external_id))
        });
        Ok(matched
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .collect())
    }

    async fn update(&self, record: &InspectionRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&record.external_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.external_id)),
        }
    }

    async fn delete(&self, external_id: i64) -> Result<bool, StoreError> {
        Ok(self.rows.write().await.remove(&external_id).is_some())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            default_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client is shut down")]
    Closed,
}

/// Single-shot HTTP client: no internal retries, callers own retry policy.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// GETs `url` with `query` and decodes the JSON body into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn record(id: i64, day: u32, name: &str) -> InspectionRecord {
        InspectionRecord::new(
            id,
            NaiveDate::from_ymd_opt(2024, 3, day).and_then(|d| d.and_hms_opt(10, 0, 0)),
            json!({ "name": name }).as_object().cloned().unwrap(),
        )
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_identifiers() {
        let store = MemoryStore::new();
        store.insert(&record(101, 1, "Joe's Diner")).await.unwrap();
        let err = store.insert(&record(101, 2, "Joe's Diner")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(101)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn memory_store_bulk_delete_counts_only_present_rows() {
        let store = MemoryStore::new();
        store.insert(&record(1, 1, "a")).await.unwrap();
        store.insert(&record(2, 1, "b")).await.unwrap();
        let removed = store.delete_by_external_ids(&[1, 2, 3]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn memory_store_lists_newest_first_with_name_search() {
        let store = MemoryStore::new();
        store.insert(&record(1, 1, "Blue Bottle")).await.unwrap();
        store.insert(&record(2, 3, "Red Hook Tavern")).await.unwrap();
        store.insert(&record(3, 2, "Bluebird Cafe")).await.unwrap();
        store
            .insert(&InspectionRecord::new(4, None, json!({"name": "Blue Ribbon"}).as_object().cloned().unwrap()))
            .await
            .unwrap();

        let all = store.list(&ListQuery::default()).await.unwrap();
        let ids = all.iter().map(|r| r.external_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3, 1, 4]);

        let blue = store
            .list(&ListQuery {
                name: Some("  BLUE ".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids = blue.iter().map(|r| r.external_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 1, 4]);

        let paged = store
            .list(&ListQuery {
                limit: Some(1),
                offset: Some(1),
                name: None,
            })
            .await
            .unwrap();
        assert_eq!(paged[0].external_id, 3);
    }

    #[tokio::test]
    async fn name_search_treats_wildcard_characters_literally() {
        let store = MemoryStore::new();
        store.insert(&record(1, 1, "Corner_Deli")).await.unwrap();
        store.insert(&record(2, 2, "100% Juice")).await.unwrap();
        store.insert(&record(3, 3, "Plain Bagels")).await.unwrap();

        for (needle, expected) in [("_", vec![1_i64]), ("%", vec![2]), ("n_b", vec![])] {
            let found = store
                .list(&ListQuery {
                    name: Some(needle.into()),
                    ..Default::default()
                })
                .await
                .unwrap()
                .iter()
                .map(|r| r.external_id)
                .collect::<Vec<_>>();
            assert_eq!(found, expected, "{needle}");
        }

        assert!(LIST_SQL.contains("strpos("));
        assert!(!LIST_SQL.to_ascii_uppercase().contains("LIKE"));
    }

    #[tokio::test]
    async fn memory_store_update_requires_existing_row() {
        let store = MemoryStore::new();
        let err = store.update(&record(9, 1, "ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(9)));

        store.insert(&record(9, 1, "ghost")).await.unwrap();
        store.update(&record(9, 2, "host")).await.unwrap();
        let stored = store.get(9).await.unwrap().unwrap();
        assert_eq!(stored.field_str("name"), Some("host"));
    }

    #[test]
    fn list_query_clamps_paging() {
        let query = ListQuery {
            limit: Some(50_000),
            offset: Some(-4),
            name: Some("   ".into()),
        };
        assert_eq!(query.limit(), MAX_LIST_LIMIT);
        assert_eq!(query.offset(), 0);
        assert_eq!(query.name_needle(), None);
        assert_eq!(ListQuery::default().limit(), DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn fetcher_rejects_invalid_default_headers() {
        let config = HttpClientConfig {
            default_headers: vec![("bad header".into(), "x".into())],
            ..Default::default()
        };
        assert!(HttpFetcher::new(config).is_err());
    }
}
