//! Core domain model for restaurant-inspection synchronization.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "insp-core";

const SECONDS_PER_DAY: i64 = 86_400;

/// A flat key/value record exactly as the upstream provider returned it.
pub type RawRecord = Map<String, JsonValue>;

/// Unit of synchronization, keyed by the provider's stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRecord {
    pub external_id: i64,
    pub inspected_on: Option<NaiveDateTime>,
    /// Provider-supplied attributes, stored without shape validation.
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

impl InspectionRecord {
    pub fn new(external_id: i64, inspected_on: Option<NaiveDateTime>, fields: Map<String, JsonValue>) -> Self {
        Self {
            external_id,
            inspected_on,
            fields,
        }
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(JsonValue::as_str)
    }

    /// Shallow merge: keys in `patch` overwrite, everything else is kept.
    pub fn merge_fields(&mut self, patch: Map<String, JsonValue>) {
        for (key, value) in patch {
            self.fields.insert(key, value);
        }
    }
}

/// One local calendar day, covering `00:00:00` through `23:59:59` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncWindow {
    pub day: NaiveDate,
}

impl SyncWindow {
    pub fn for_day(day: NaiveDate) -> Self {
        Self { day }
    }

    /// The default policy: the calendar day before `today`.
    pub fn yesterday_of(today: NaiveDate) -> Self {
        Self {
            day: today - Duration::days(1),
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.day.and_time(NaiveTime::MIN)
    }

    pub fn end(&self) -> NaiveDateTime {
        self.start() + Duration::seconds(SECONDS_PER_DAY - 1)
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        at >= self.start() && at <= self.end()
    }
}
