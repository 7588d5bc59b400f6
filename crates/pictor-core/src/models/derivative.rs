use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for the delay between automatic retries of a failed derivative.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// `min(base * 2^retry_count, cap)`, saturating on overflow.
pub fn retry_backoff(base: Duration, retry_count: i32, cap: Duration) -> Duration {
    let exponent = retry_count.max(0) as u32;
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(cap)
        .min(cap)
}

/// Retry delay parameters handed to the store when a failed record is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            cap: MAX_RETRY_BACKOFF,
        }
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn delay(&self, retry_count: i32) -> Duration {
        retry_backoff(self.base, retry_count, self.cap)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "derivative_status", rename_all = "lowercase")
)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DerivativeStatus {
    /// Transitions the store accepts. `Completed` is terminal.
    pub fn can_transition_to(self, next: DerivativeStatus) -> bool {
        use DerivativeStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Pending)
        )
    }

    /// Edges applied through the plain conditional `transition` primitive.
    /// Completion, retry and orphan recovery have dedicated operations.
    pub fn is_direct_transition(self, next: DerivativeStatus) -> bool {
        matches!(
            (self, next),
            (DerivativeStatus::Pending, DerivativeStatus::Processing)
                | (DerivativeStatus::Processing, DerivativeStatus::Failed)
        )
    }

}

impl Display for DerivativeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DerivativeStatus::Pending => write!(f, "pending"),
            DerivativeStatus::Processing => write!(f, "processing"),
            DerivativeStatus::Completed => write!(f, "completed"),
            DerivativeStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DerivativeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DerivativeStatus::Pending),
            "processing" => Ok(DerivativeStatus::Processing),
            "completed" => Ok(DerivativeStatus::Completed),
            "failed" => Ok(DerivativeStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid derivative status: {}", s)),
        }
    }
}

/// Which producer handles a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivativeKind {
    Conversion,
    Thumbnail,
}

/// Target encoding of a derivative. Stored as text: `webp` or `thumb-<px>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivativeFormat {
    Webp,
    Thumbnail(u32),
}

impl DerivativeFormat {
    pub fn kind(&self) -> DerivativeKind {
        match self {
            DerivativeFormat::Webp => DerivativeKind::Conversion,
            DerivativeFormat::Thumbnail(_) => DerivativeKind::Thumbnail,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DerivativeFormat::Webp => "webp",
            DerivativeFormat::Thumbnail(_) => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            DerivativeFormat::Webp => "image/webp",
            DerivativeFormat::Thumbnail(_) => "image/jpeg",
        }
    }
}

impl Display for DerivativeFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DerivativeFormat::Webp => write!(f, "webp"),
            DerivativeFormat::Thumbnail(size) => write!(f, "thumb-{}", size),
        }
    }
}

impl FromStr for DerivativeFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "webp" {
            return Ok(DerivativeFormat::Webp);
        }
        let size = s
            .strip_prefix("thumb-")
            .and_then(|px| px.parse::<u32>().ok())
            .filter(|px| *px > 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid derivative format: {}", s))?;
        Ok(DerivativeFormat::Thumbnail(size))
    }
}

impl Serialize for DerivativeFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivativeFormat {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Artifact metadata written atomically with completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeArtifact {
    pub identifier: String,
    pub width: i32,
    pub height: i32,
    pub file_size: i64,
}

/// One requested variant of a source image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Derivative {
    pub id: Uuid,
    pub source_image_id: Uuid,
    pub format: DerivativeFormat,
    pub status: DerivativeStatus,
    /// Storage key of the artifact; empty unless `status == Completed`.
    pub identifier: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub file_size: Option<i64>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Derivative {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Derivative {
            id: row.get("id"),
            source_image_id: row.get("source_image_id"),
            format: row.get::<String, _>("format").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse format: {}", e).into())
            })?,
            status: row.get("status"),
            identifier: row.get("identifier"),
            width: row.get("width"),
            height: row.get("height"),
            file_size: row.get("file_size"),
            retry_count: row.get("retry_count"),
            next_retry_at: row.get("next_retry_at"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl Derivative {
    /// A fresh `pending` record as produced by the first upsert.
    pub fn new_pending(source_image_id: Uuid, format: DerivativeFormat) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_image_id,
            format,
            status: DerivativeStatus::Pending,
            identifier: String::new(),
            width: None,
            height: None,
            file_size: None,
            retry_count: 0,
            next_retry_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == DerivativeStatus::Completed
    }

    pub fn can_retry(&self, max_retries: i32) -> bool {
        self.retry_count < max_retries
    }

    /// Eligible for an automatic retry at `now`. A missing `next_retry_at`
    /// counts as due.
    pub fn is_retry_due(&self, max_retries: i32, now: DateTime<Utc>) -> bool {
        self.status == DerivativeStatus::Failed
            && self.can_retry(max_retries)
            && self.next_retry_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Untouched since `stale_before` while a worker should own it: stuck in
    /// `processing`, or `pending` with no task left to claim it (the queue
    /// dropped the submission, or the process restarted).
    pub fn is_orphaned(&self, stale_before: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            DerivativeStatus::Processing | DerivativeStatus::Pending
        ) && self.updated_at < stale_before
    }
}
