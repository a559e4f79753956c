//! SQLite persistence for call records, ad-spend snapshots and profiles.
//!
//! Both natural-key invariants live in the database, not in application
//! code: call ingestion is `INSERT .. ON CONFLICT DO NOTHING` against a
//! unique `(provider, external_call_id)` index, and spend snapshots are a
//! native `ON CONFLICT(user_id, date) DO UPDATE` full-row replace. That
//! closes the check-then-insert race under concurrent webhook redelivery
//! and concurrent sync triggers.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;
use tradeboost_core::{CallEvent, Micros, QualificationReason, QualificationStatus};

pub const CRATE_NAME: &str = "tradeboost-storage";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS call_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    external_call_id TEXT NOT NULL,
    from_number TEXT,
    to_number TEXT,
    tracking_number TEXT,
    started_at_ms INTEGER NOT NULL,
    duration_seconds INTEGER NOT NULL,
    answered INTEGER NOT NULL,
    qualification_status TEXT NOT NULL,
    qualification_reason TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    UNIQUE (provider, external_call_id)
);

CREATE INDEX IF NOT EXISTS idx_call_records_user_started
    ON call_records (user_id, started_at_ms);

CREATE TABLE IF NOT EXISTS spend_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    date TEXT NOT NULL,
    currency_code TEXT NOT NULL,
    spend_micros INTEGER NOT NULL,
    synced_at_ms INTEGER NOT NULL,
    source TEXT NOT NULL,
    google_customer_id TEXT,
    UNIQUE (user_id, date)
);

CREATE TABLE IF NOT EXISTS profiles (
    user_id TEXT PRIMARY KEY,
    average_revenue_per_job REAL NOT NULL DEFAULT 0,
    timezone TEXT NOT NULL DEFAULT 'Europe/London',
    google_customer_id TEXT,
    google_refresh_token TEXT,
    updated_at_ms INTEGER NOT NULL
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("negative spend {micros} micros for {date}")]
    NegativeSpend { micros: i64, date: NaiveDate },
    #[error("stored {column} value {value:?} is not a known variant")]
    CorruptEnum { column: &'static str, value: String },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Persisted call record. Append-only: created once on first ingestion,
/// never mutated thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub id: i64,
    pub user_id: String,
    pub provider: String,
    pub external_call_id: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub tracking_number: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u32,
    pub answered: bool,
    pub qualification_status: QualificationStatus,
    pub qualification_reason: QualificationReason,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an ingestion attempt: `deduplicated` is true when the
/// `(provider, external_call_id)` pair had already been recorded and the
/// existing record was returned untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordedCall {
    pub id: i64,
    pub deduplicated: bool,
}

/// One day's recorded ad spend for one account. Subject to full overwrite
/// on every resync; never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendSnapshot {
    pub id: i64,
    pub user_id: String,
    pub date: NaiveDate,
    pub currency_code: String,
    pub spend_micros: Micros,
    pub synced_at: DateTime<Utc>,
    pub source: String,
    pub google_customer_id: Option<String>,
}

/// Provenance carried on each snapshot write.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub source: String,
    pub google_customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub user_id: String,
    pub average_revenue_per_job: f64,
    pub timezone: String,
    pub google_customer_id: Option<String>,
    pub google_refresh_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProfileUpdate {
    pub average_revenue_per_job: f64,
    pub timezone: String,
    pub google_customer_id: Option<String>,
    pub google_refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database. SQLite `:memory:` is
    /// per-connection, so the pool must not grow past one.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert one call record, idempotent on `(provider, external_call_id)`.
    /// On redelivery the existing record is returned unchanged; the freshly
    /// evaluated qualification fields are discarded, matching the rule that
    /// qualification is evaluated only on first ingestion.
    pub async fn record_call(
        &self,
        event: &CallEvent,
        status: QualificationStatus,
        reason: QualificationReason,
        now: DateTime<Utc>,
    ) -> Result<RecordedCall, StoreError> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO call_records (
                user_id, provider, external_call_id,
                from_number, to_number, tracking_number,
                started_at_ms, duration_seconds, answered,
                qualification_status, qualification_reason, created_at_ms
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, external_call_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.user_id)
        .bind(&event.provider)
        .bind(&event.external_call_id)
        .bind(&event.from_number)
        .bind(&event.to_number)
        .bind(&event.tracking_number)
        .bind(event.started_at.timestamp_millis())
        .bind(event.duration_seconds as i64)
        .bind(event.answered)
        .bind(status.to_string())
        .bind(reason.to_string())
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(RecordedCall {
                id,
                deduplicated: false,
            });
        }

        debug!(
            provider = %event.provider,
            external_call_id = %event.external_call_id,
            "call already recorded, returning existing id"
        );
        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM call_records WHERE provider = ? AND external_call_id = ?",
        )
        .bind(&event.provider)
        .bind(&event.external_call_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecordedCall {
            id,
            deduplicated: true,
        })
    }

    pub async fn get_call(
        &self,
        provider: &str,
        external_call_id: &str,
    ) -> Result<Option<CallRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, provider, external_call_id,
                   from_number, to_number, tracking_number,
                   started_at_ms, duration_seconds, answered,
                   qualification_status, qualification_reason, created_at_ms
              FROM call_records
             WHERE provider = ? AND external_call_id = ?
            "#,
        )
        .bind(provider)
        .bind(external_call_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(call_record_from_row).transpose()
    }

    /// Qualified calls started within the half-open instant interval
    /// `[start, end)`.
    pub async fn qualified_call_count(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM call_records
             WHERE user_id = ?
               AND started_at_ms >= ? AND started_at_ms < ?
               AND qualification_status = ?
            "#,
        )
        .bind(user_id)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .bind(QualificationStatus::Qualified.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Write one day's spend, replacing the whole row when the
    /// `(user_id, date)` key exists. The upstream platform's view of a
    /// day's spend is authoritative and may be revised, so accumulation
    /// would be incorrect.
    pub async fn upsert_daily_spend(
        &self,
        user_id: &str,
        date: NaiveDate,
        currency_code: &str,
        spend: Micros,
        meta: &SnapshotMeta,
        synced_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        if spend.is_negative() {
            return Err(StoreError::NegativeSpend {
                micros: spend.0,
                date,
            });
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO spend_snapshots (
                user_id, date, currency_code, spend_micros,
                synced_at_ms, source, google_customer_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, date) DO UPDATE SET
                currency_code = excluded.currency_code,
                spend_micros = excluded.spend_micros,
                synced_at_ms = excluded.synced_at_ms,
                source = excluded.source,
                google_customer_id = excluded.google_customer_id
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(date.format("%Y-%m-%d").to_string())
        .bind(currency_code)
        .bind(spend.0)
        .bind(synced_at.timestamp_millis())
        .bind(&meta.source)
        .bind(&meta.google_customer_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Most recent successful sync instant across the month's snapshots,
    /// the input to the freshness gate.
    pub async fn latest_synced_at(
        &self,
        user_id: &str,
        month_key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let newest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(synced_at_ms)
              FROM spend_snapshots
             WHERE user_id = ? AND date LIKE ? || '-%'
            "#,
        )
        .bind(user_id)
        .bind(month_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(newest.map(timestamp_from_ms))
    }

    /// Total spend over the inclusive date range `[from, to]`, with the
    /// currency of the most recent snapshot. Lexicographic comparison on
    /// `YYYY-MM-DD` text is calendar order.
    pub async fn spend_in_range(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(Micros, Option<String>), StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(spend_micros), 0) AS total,
                   MAX(date) AS newest_date
              FROM spend_snapshots
             WHERE user_id = ? AND date >= ? AND date <= ?
            "#,
        )
        .bind(user_id)
        .bind(from.format("%Y-%m-%d").to_string())
        .bind(to.format("%Y-%m-%d").to_string())
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let newest_date: Option<String> = row.try_get("newest_date")?;

        let currency = match newest_date {
            Some(date) => sqlx::query_scalar(
                "SELECT currency_code FROM spend_snapshots WHERE user_id = ? AND date = ?",
            )
            .bind(user_id)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?,
            None => None,
        };

        Ok((Micros(total), currency))
    }

    pub async fn list_spend(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SpendSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, date, currency_code, spend_micros,
                   synced_at_ms, source, google_customer_id
              FROM spend_snapshots
             WHERE user_id = ? AND date >= ? AND date <= ?
             ORDER BY date
            "#,
        )
        .bind(user_id)
        .bind(from.format("%Y-%m-%d").to_string())
        .bind(to.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(snapshot_from_row).collect()
    }

    pub async fn upsert_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<Profile, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO profiles (
                user_id, average_revenue_per_job, timezone,
                google_customer_id, google_refresh_token, updated_at_ms
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                average_revenue_per_job = excluded.average_revenue_per_job,
                timezone = excluded.timezone,
                google_customer_id = excluded.google_customer_id,
                google_refresh_token = excluded.google_refresh_token,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(user_id)
        .bind(update.average_revenue_per_job)
        .bind(&update.timezone)
        .bind(&update.google_customer_id)
        .bind(&update.google_refresh_token)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(Profile {
            user_id: user_id.to_string(),
            average_revenue_per_job: update.average_revenue_per_job,
            timezone: update.timezone.clone(),
            google_customer_id: update.google_customer_id.clone(),
            google_refresh_token: update.google_refresh_token.clone(),
            updated_at: now,
        })
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, average_revenue_per_job, timezone,
                   google_customer_id, google_refresh_token, updated_at_ms
              FROM profiles
             WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Profile {
                user_id: row.try_get("user_id")?,
                average_revenue_per_job: row.try_get("average_revenue_per_job")?,
                timezone: row.try_get("timezone")?,
                google_customer_id: row.try_get("google_customer_id")?,
                google_refresh_token: row.try_get("google_refresh_token")?,
                updated_at: timestamp_from_ms(row.try_get("updated_at_ms")?),
            })
        })
        .transpose()
    }
}

fn timestamp_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .expect("stored timestamps fit chrono's instant range")
}

fn call_record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<CallRecord, StoreError> {
    let status: String = row.try_get("qualification_status")?;
    let reason: String = row.try_get("qualification_reason")?;
    Ok(CallRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        external_call_id: row.try_get("external_call_id")?,
        from_number: row.try_get("from_number")?,
        to_number: row.try_get("to_number")?,
        tracking_number: row.try_get("tracking_number")?,
        started_at: timestamp_from_ms(row.try_get("started_at_ms")?),
        duration_seconds: row.try_get::<i64, _>("duration_seconds")? as u32,
        answered: row.try_get("answered")?,
        qualification_status: status.parse().map_err(|_| StoreError::CorruptEnum {
            column: "qualification_status",
            value: status.clone(),
        })?,
        qualification_reason: reason.parse().map_err(|_| StoreError::CorruptEnum {
            column: "qualification_reason",
            value: reason.clone(),
        })?,
        created_at: timestamp_from_ms(row.try_get("created_at_ms")?),
    })
}

fn snapshot_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SpendSnapshot, StoreError> {
    let date: String = row.try_get("date")?;
    Ok(SpendSnapshot {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        date: date.parse().map_err(|_| StoreError::CorruptEnum {
            column: "date",
            value: date.clone(),
        })?,
        currency_code: row.try_get("currency_code")?,
        spend_micros: Micros(row.try_get("spend_micros")?),
        synced_at: timestamp_from_ms(row.try_get("synced_at_ms")?),
        source: row.try_get("source")?,
        google_customer_id: row.try_get("google_customer_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tradeboost_core::QualificationPolicy;

    fn event(provider: &str, external_call_id: &str, answered: bool, duration: u32) -> CallEvent {
        CallEvent {
            user_id: "u1".into(),
            provider: provider.into(),
            external_call_id: external_call_id.into(),
            from_number: Some("+447700900001".into()),
            to_number: Some("+442079460000".into()),
            tracking_number: None,
            started_at: Utc.with_ymd_and_hms(2025, 3, 5, 9, 30, 0).single().unwrap(),
            duration_seconds: duration,
            answered,
        }
    }

    fn meta() -> SnapshotMeta {
        SnapshotMeta {
            source: "google_ads".into(),
            google_customer_id: Some("123-456-7890".into()),
        }
    }

    async fn store() -> Store {
        Store::in_memory().await.expect("in-memory store")
    }

    #[tokio::test]
    async fn record_call_is_idempotent_on_natural_key() {
        let store = store().await;
        let policy = QualificationPolicy::default();
        let now = Utc::now();

        let first_event = event("callrail", "CAL123", true, 95);
        let (status, reason) =
            policy.evaluate(first_event.answered, first_event.duration_seconds);
        let first = store
            .record_call(&first_event, status, reason, now)
            .await
            .unwrap();

        // Redelivery with different payload fields must not touch the record.
        let redelivered = event("callrail", "CAL123", false, 2);
        let (status, reason) =
            policy.evaluate(redelivered.answered, redelivered.duration_seconds);
        let second = store
            .record_call(&redelivered, status, reason, now)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);

        let stored = store.get_call("callrail", "CAL123").await.unwrap().unwrap();
        assert_eq!(stored.duration_seconds, 95);
        assert!(stored.answered);
        assert_eq!(stored.qualification_status, QualificationStatus::Qualified);
        assert_eq!(stored.qualification_reason, QualificationReason::RulesSatisfied);
    }

    #[tokio::test]
    async fn same_external_id_from_other_provider_is_a_new_record() {
        let store = store().await;
        let now = Utc::now();
        let a = store
            .record_call(
                &event("callrail", "42", true, 60),
                QualificationStatus::Qualified,
                QualificationReason::RulesSatisfied,
                now,
            )
            .await
            .unwrap();
        let b = store
            .record_call(
                &event("twilio", "42", true, 60),
                QualificationStatus::Qualified,
                QualificationReason::RulesSatisfied,
                now,
            )
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert!(!b.deduplicated);
    }

    #[tokio::test]
    async fn upsert_replaces_rather_than_accumulates() {
        let store = store().await;
        let date = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        let now = Utc::now();

        store
            .upsert_daily_spend("u1", date, "GBP", Micros(1_000_000), &meta(), now)
            .await
            .unwrap();
        store
            .upsert_daily_spend("u1", date, "GBP", Micros(2_500_000), &meta(), now)
            .await
            .unwrap();

        let rows = store.list_spend("u1", date, date).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].spend_micros, Micros(2_500_000));
    }

    #[tokio::test]
    async fn upsert_rejects_negative_spend() {
        let store = store().await;
        let date = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        let err = store
            .upsert_daily_spend("u1", date, "GBP", Micros(-1), &meta(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NegativeSpend { micros: -1, .. }));
    }

    #[tokio::test]
    async fn latest_synced_at_scopes_to_month() {
        let store = store().await;
        let march = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).single().unwrap();
        let feb = Utc.with_ymd_and_hms(2025, 2, 28, 8, 0, 0).single().unwrap();
        store
            .upsert_daily_spend(
                "u1",
                NaiveDate::from_ymd_opt(2025, 2, 27).unwrap(),
                "GBP",
                Micros(100),
                &meta(),
                feb,
            )
            .await
            .unwrap();
        store
            .upsert_daily_spend(
                "u1",
                NaiveDate::from_ymd_opt(2025, 3, 9).unwrap(),
                "GBP",
                Micros(100),
                &meta(),
                march,
            )
            .await
            .unwrap();

        assert_eq!(
            store.latest_synced_at("u1", "2025-03").await.unwrap(),
            Some(march)
        );
        assert_eq!(
            store.latest_synced_at("u1", "2025-02").await.unwrap(),
            Some(feb)
        );
        assert_eq!(store.latest_synced_at("u1", "2025-01").await.unwrap(), None);
        assert_eq!(store.latest_synced_at("u2", "2025-03").await.unwrap(), None);
    }

    #[tokio::test]
    async fn spend_in_range_is_inclusive_and_per_user() {
        let store = store().await;
        let now = Utc::now();
        for (day, micros) in [(1, 1_000_000), (2, 2_000_000), (3, 4_000_000)] {
            store
                .upsert_daily_spend(
                    "u1",
                    NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
                    "GBP",
                    Micros(micros),
                    &meta(),
                    now,
                )
                .await
                .unwrap();
        }
        store
            .upsert_daily_spend(
                "other",
                NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
                "GBP",
                Micros(99_000_000),
                &meta(),
                now,
            )
            .await
            .unwrap();

        let (total, currency) = store
            .spend_in_range(
                "u1",
                NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(total, Micros(3_000_000));
        assert_eq!(currency.as_deref(), Some("GBP"));

        let (empty, none) = store
            .spend_in_range(
                "u1",
                NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 4, 30).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(empty, Micros(0));
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn qualified_call_count_is_bounded_half_open() {
        let store = store().await;
        let now = Utc::now();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).single().unwrap();

        let mut in_month = event("callrail", "A", true, 60);
        in_month.started_at = start;
        let mut at_end = event("callrail", "B", true, 60);
        at_end.started_at = end; // first instant of April, excluded
        let mut unqualified = event("callrail", "C", false, 60);
        unqualified.started_at = start;

        for (ev, status, reason) in [
            (&in_month, QualificationStatus::Qualified, QualificationReason::RulesSatisfied),
            (&at_end, QualificationStatus::Qualified, QualificationReason::RulesSatisfied),
            (&unqualified, QualificationStatus::Unqualified, QualificationReason::NotAnswered),
        ] {
            store.record_call(ev, status, reason, now).await.unwrap();
        }

        assert_eq!(
            store.qualified_call_count("u1", start, end).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn connect_creates_database_file_and_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("tradeboost.db").display());
        let store = Store::connect(&url).await.expect("connect");
        store
            .record_call(
                &event("callrail", "F1", true, 31),
                QualificationStatus::Qualified,
                QualificationReason::RulesSatisfied,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(dir.path().join("tradeboost.db").exists());
    }

    #[tokio::test]
    async fn profile_upsert_round_trips() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().unwrap();
        assert!(store.get_profile("u1").await.unwrap().is_none());

        store
            .upsert_profile(
                "u1",
                &ProfileUpdate {
                    average_revenue_per_job: 180.0,
                    timezone: "Europe/London".into(),
                    google_customer_id: Some("123-456-7890".into()),
                    google_refresh_token: Some("1//refresh".into()),
                },
                now,
            )
            .await
            .unwrap();
        store
            .upsert_profile(
                "u1",
                &ProfileUpdate {
                    average_revenue_per_job: 220.0,
                    timezone: "Europe/London".into(),
                    google_customer_id: Some("123-456-7890".into()),
                    google_refresh_token: Some("1//refresh".into()),
                },
                now,
            )
            .await
            .unwrap();

        let profile = store.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.average_revenue_per_job, 220.0);
        assert_eq!(profile.timezone, "Europe/London");
        assert_eq!(profile.updated_at, now);
    }
}
