//! Orchestration for TradeBoost: spend sync against the ads platform,
//! call-event ingestion, dashboard metrics aggregation and the ad-copy
//! compliance scanner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tradeboost_adapters::{
    AdsError, DateRange, GoogleAdsConfig, GoogleAdsReportClient, GoogleOAuthClient,
    SpendReportSource, TokenSource,
};
use tradeboost_core::{
    CallEvent, DashboardMetrics, MonthPeriod, QualificationPolicy,
};
use tradeboost_storage::{
    Profile, RecordedCall, SnapshotMeta, SpendSnapshot, Store, StoreError,
};

pub const CRATE_NAME: &str = "tradeboost-sync";

const DEFAULT_CURRENCY: &str = "GBP";

/// Wall-clock source, threaded explicitly so period resolution and the
/// freshness gate are testable against pinned instants.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub default_timezone: String,
    pub freshness_minutes: i64,
    pub min_call_seconds: u32,
    pub source_tag: String,
    pub workspace_root: PathBuf,
    pub ads: Option<GoogleAdsConfig>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("TB_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://tradeboost.db".to_string()),
            default_timezone: std::env::var("TB_REPORTING_TZ")
                .unwrap_or_else(|_| "Europe/London".to_string()),
            freshness_minutes: std::env::var("TB_FRESHNESS_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(45),
            min_call_seconds: std::env::var("TB_MIN_CALL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            source_tag: std::env::var("TB_SPEND_SOURCE")
                .unwrap_or_else(|_| "google_ads".to_string()),
            workspace_root: PathBuf::from("."),
            ads: GoogleAdsConfig::from_env(),
        }
    }

    pub fn reporting_timezone(&self) -> anyhow::Result<Tz> {
        self.default_timezone
            .parse()
            .ok()
            .with_context(|| format!("TB_REPORTING_TZ {:?} is not a valid IANA zone", self.default_timezone))
    }

    pub fn qualification_policy(&self) -> QualificationPolicy {
        QualificationPolicy {
            min_duration_seconds: self.min_call_seconds,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no authenticated user in request context")]
    NotAuthenticated,
    #[error("ads platform authentication failed: {0}")]
    Auth(String),
    #[error("ads platform request failed: {0}")]
    Platform(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    fn from_token_refresh(err: AdsError) -> Self {
        Self::Auth(err.to_string())
    }

    fn from_report_fetch(err: AdsError) -> Self {
        match err {
            AdsError::Auth(message) => Self::Auth(message),
            other => Self::Platform(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The newest snapshot is younger than the freshness threshold.
    FreshEnough,
    /// The account has no linked ads platform credentials.
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped { reason: SkipReason },
    Completed { days: usize },
}

/// Decides each invocation afresh whether the current month's spend
/// snapshots need refreshing from the ads platform, and drives the
/// snapshot upserts when they do. The freshness gate bounds external-API
/// call frequency without a scheduler; a per-user async mutex makes
/// concurrent triggers for the same account single-flight in-process.
pub struct SpendSync {
    store: Store,
    tokens: Arc<dyn TokenSource>,
    reports: Arc<dyn SpendReportSource>,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    default_timezone: Tz,
    source_tag: String,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SpendSync {
    pub fn new(
        store: Store,
        tokens: Arc<dyn TokenSource>,
        reports: Arc<dyn SpendReportSource>,
        clock: Arc<dyn Clock>,
        freshness: Duration,
        default_timezone: Tz,
        source_tag: String,
    ) -> Self {
        Self {
            store,
            tokens,
            reports,
            clock,
            freshness,
            default_timezone,
            source_tag,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn flight_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().await;
        map.entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Refresh the current month's daily spend snapshots unless they are
    /// fresh enough. Authentication and report-fetch failures abort the
    /// whole attempt; rows missing a date are skipped individually. The
    /// completed outcome carries the count of days actually persisted.
    pub async fn refresh_current_month_if_stale(
        &self,
        user_id: &str,
    ) -> Result<SyncOutcome, SyncError> {
        if user_id.trim().is_empty() {
            return Err(SyncError::NotAuthenticated);
        }
        let flight = self.flight_lock(user_id).await;
        let _guard = flight.lock().await;

        let profile = self.store.get_profile(user_id).await?;
        let tz = reporting_timezone(profile.as_ref(), self.default_timezone)?;
        let period = MonthPeriod::resolve(tz, self.clock.now());

        if let Some(last) = self.store.latest_synced_at(user_id, &period.month_key).await? {
            let age = self.clock.now() - last;
            if age < self.freshness {
                debug!(
                    user_id,
                    age_minutes = age.num_minutes(),
                    "snapshots fresh enough, skipping sync"
                );
                return Ok(SyncOutcome::Skipped {
                    reason: SkipReason::FreshEnough,
                });
            }
        }

        let connection = profile.as_ref().and_then(|p| {
            Some((
                p.google_customer_id.clone()?,
                p.google_refresh_token.clone()?,
            ))
        });
        let Some((customer_id, refresh_token)) = connection else {
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::NotConnected,
            });
        };

        let token = self
            .tokens
            .refresh(&refresh_token)
            .await
            .map_err(SyncError::from_token_refresh)?;

        // Today's partial day is included on purpose; its provisional total
        // is overwritten on the next cycle.
        let range = DateRange {
            from: period.first_of_month,
            to: period.today,
        };
        let rows = self
            .reports
            .daily_spend(&token.token, &customer_id, &range)
            .await
            .map_err(SyncError::from_report_fetch)?;

        let meta = SnapshotMeta {
            source: self.source_tag.clone(),
            google_customer_id: Some(customer_id),
        };
        let mut days = 0usize;
        for row in rows {
            let Some(date) = row.date else {
                warn!(user_id, "spend row missing date segment, skipping");
                continue;
            };
            if row.cost_micros.is_negative() {
                warn!(user_id, %date, micros = row.cost_micros.0, "negative spend row, skipping");
                continue;
            }
            let currency = row.currency_code.as_deref().unwrap_or(DEFAULT_CURRENCY);
            self.store
                .upsert_daily_spend(user_id, date, currency, row.cost_micros, &meta, self.clock.now())
                .await?;
            days += 1;
        }

        info!(user_id, days, month = %period.month_key, "spend sync completed");
        Ok(SyncOutcome::Completed { days })
    }
}

/// Idempotent ingestion of call events from the call-tracking provider's
/// webhook. Qualification is evaluated once, before insert; redelivered
/// events return the existing record untouched.
pub struct CallIngest {
    store: Store,
    policy: QualificationPolicy,
    clock: Arc<dyn Clock>,
}

impl CallIngest {
    pub fn new(store: Store, policy: QualificationPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub async fn record(&self, event: CallEvent) -> Result<RecordedCall, SyncError> {
        if event.user_id.trim().is_empty() {
            return Err(SyncError::NotAuthenticated);
        }
        if event.provider.trim().is_empty() || event.external_call_id.trim().is_empty() {
            return Err(SyncError::Validation(
                "provider and external_call_id are required".to_string(),
            ));
        }

        let (status, reason) = self.policy.evaluate(event.answered, event.duration_seconds);
        let recorded = self
            .store
            .record_call(&event, status, reason, self.clock.now())
            .await?;
        if !recorded.deduplicated {
            info!(
                provider = %event.provider,
                external_call_id = %event.external_call_id,
                status = %status,
                reason = %reason,
                "call recorded"
            );
        }
        Ok(recorded)
    }
}

/// Current-month dashboard aggregate over qualified calls and spend
/// snapshots. A pure read: recomputed on every call against whatever state
/// the stores hold right now.
pub struct MetricsAggregator {
    store: Store,
    clock: Arc<dyn Clock>,
    default_timezone: Tz,
}

impl MetricsAggregator {
    pub fn new(store: Store, clock: Arc<dyn Clock>, default_timezone: Tz) -> Self {
        Self {
            store,
            clock,
            default_timezone,
        }
    }

    pub async fn dashboard_metrics(&self, user_id: &str) -> Result<DashboardMetrics, SyncError> {
        if user_id.trim().is_empty() {
            return Err(SyncError::NotAuthenticated);
        }
        let profile = self.store.get_profile(user_id).await?;
        let tz = reporting_timezone(profile.as_ref(), self.default_timezone)?;
        let period = MonthPeriod::resolve(tz, self.clock.now());

        let qualified_calls = self
            .store
            .qualified_call_count(user_id, period.month_start, period.month_end)
            .await?;
        let (spend, currency) = self
            .store
            .spend_in_range(user_id, period.first_of_month, period.today)
            .await?;
        let average_revenue_per_job = profile
            .map(|p| p.average_revenue_per_job)
            .unwrap_or_default();

        Ok(DashboardMetrics::derive(
            period.month_key,
            qualified_calls,
            spend,
            currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            average_revenue_per_job,
        ))
    }

    /// The month's daily snapshot rows, for the breakdown next to the
    /// aggregate.
    pub async fn month_spend(&self, user_id: &str) -> Result<Vec<SpendSnapshot>, SyncError> {
        if user_id.trim().is_empty() {
            return Err(SyncError::NotAuthenticated);
        }
        let profile = self.store.get_profile(user_id).await?;
        let tz = reporting_timezone(profile.as_ref(), self.default_timezone)?;
        let period = MonthPeriod::resolve(tz, self.clock.now());
        Ok(self
            .store
            .list_spend(user_id, period.first_of_month, period.today)
            .await?)
    }
}

fn reporting_timezone(profile: Option<&Profile>, default: Tz) -> Result<Tz, SyncError> {
    match profile {
        Some(profile) => profile.timezone.parse().map_err(|_| {
            SyncError::Validation(format!(
                "profile timezone {:?} is not a valid IANA zone",
                profile.timezone
            ))
        }),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Warning,
    Blocker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub risk_flag: String,
    pub severity: Severity,
    pub contains_any: Vec<String>,
    pub suggest: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ComplianceRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<ComplianceRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceFinding {
    pub risk_flag: String,
    pub matched_phrase: String,
    pub severity: Severity,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub findings: Vec<ComplianceFinding>,
    pub rewritten: Option<String>,
}

/// Rule-based scan of ad copy against the UK advertising rule set. One
/// finding per rule (first matching phrase wins) plus a proposed rewrite
/// with flagged phrases substituted.
pub struct ComplianceScanner {
    rules: Vec<ComplianceRule>,
}

impl ComplianceScanner {
    pub fn new(rules: Vec<ComplianceRule>) -> Self {
        Self { rules }
    }

    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("rules").join("compliance.yaml");
        let file: ComplianceRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.rules))
    }

    pub fn scan(&self, text: &str) -> ComplianceReport {
        let lowered = text.to_ascii_lowercase();
        let mut findings = Vec::new();
        let mut rewritten = text.to_string();

        for rule in &self.rules {
            for phrase in &rule.contains_any {
                let needle = phrase.to_ascii_lowercase();
                if lowered.contains(&needle) {
                    findings.push(ComplianceFinding {
                        risk_flag: rule.risk_flag.clone(),
                        matched_phrase: phrase.clone(),
                        severity: rule.severity,
                        suggestion: rule.suggest.clone(),
                    });
                    rewritten = replace_case_insensitive(&rewritten, &needle, &rule.suggest);
                    break;
                }
            }
        }

        let compliant = findings.is_empty();
        ComplianceReport {
            compliant,
            rewritten: if compliant { None } else { Some(rewritten) },
            findings,
        }
    }
}

/// `needle_lower` must already be lowercased; ASCII lowercasing preserves
/// byte offsets, so matches found in the lowered copy splice cleanly into
/// the original.
fn replace_case_insensitive(text: &str, needle_lower: &str, replacement: &str) -> String {
    if needle_lower.is_empty() {
        return text.to_string();
    }
    let lowered = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(offset) = lowered[cursor..].find(needle_lower) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);
        out.push_str(replacement);
        cursor = start + needle_lower.len();
    }
    out.push_str(&text[cursor..]);
    out
}

/// The wired service set for the web surface and the CLI.
pub struct Services {
    pub store: Store,
    pub ingest: CallIngest,
    pub metrics: MetricsAggregator,
    pub spend_sync: Option<Arc<SpendSync>>,
    pub scanner: ComplianceScanner,
}

impl Services {
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let store = Store::connect(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tz = config.reporting_timezone()?;

        let spend_sync = match config.ads.clone() {
            Some(ads) => {
                let tokens: Arc<dyn TokenSource> =
                    Arc::new(GoogleOAuthClient::new(ads.clone()).context("building oauth client")?);
                let reports: Arc<dyn SpendReportSource> = Arc::new(
                    GoogleAdsReportClient::new(ads).context("building ads report client")?,
                );
                Some(Arc::new(SpendSync::new(
                    store.clone(),
                    tokens,
                    reports,
                    clock.clone(),
                    Duration::minutes(config.freshness_minutes),
                    tz,
                    config.source_tag.clone(),
                )))
            }
            None => None,
        };

        let scanner = ComplianceScanner::from_workspace_root(&config.workspace_root)
            .unwrap_or_else(|err| {
                warn!("compliance rules unavailable ({err:#}); scanner runs with no rules");
                ComplianceScanner::new(Vec::new())
            });

        Ok(Self {
            ingest: CallIngest::new(store.clone(), config.qualification_policy(), clock.clone()),
            metrics: MetricsAggregator::new(store.clone(), clock, tz),
            spend_sync,
            scanner,
            store,
        })
    }
}
