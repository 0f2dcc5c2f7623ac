//! Tiered admission control.
//!
//! Fixed-window counters per (category, subject) in the shared store:
//!
//! 1. Atomically increment `ratelimit:<category>:<subject>`, creating it with
//!    TTL = window if absent.
//! 2. If the post-increment count exceeds the category maximum, reject with
//!    retry-after = remaining TTL. Otherwise admit.
//!
//! The subject is the authenticated user id when known, else the caller's
//! network address. Privileged routes derive their window from the caller's
//! tier. Admission never consults instance health.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive_store::{CoordinationStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::keys::rate_limit_key;

/// Errors from admission checks.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The shared store failed; the caller decides whether to fail open.
    #[error("rate limit store error: {0}")]
    Store(#[from] StoreError),
}

/// Request category with its own independent window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    /// Generic inbound traffic.
    General,
    /// Heavyweight conversational interactions.
    Interaction,
    /// Background evolution jobs.
    Evolution,
    /// Memory reads.
    MemoryRead,
    /// Privileged routes, limited per caller tier.
    Privileged,
}

impl RateCategory {
    pub const ALL: [RateCategory; 5] = [
        RateCategory::General,
        RateCategory::Interaction,
        RateCategory::Evolution,
        RateCategory::MemoryRead,
        RateCategory::Privileged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Interaction => "interaction",
            Self::Evolution => "evolution",
            Self::MemoryRead => "memory_read",
            Self::Privileged => "privileged",
        }
    }

    pub fn default_rule(&self) -> RateLimitRule {
        match self {
            Self::General => RateLimitRule::new(Duration::from_secs(15 * 60), 100),
            Self::Interaction => RateLimitRule::new(Duration::from_secs(60), 20),
            Self::Evolution => RateLimitRule::new(Duration::from_secs(60 * 60), 10),
            Self::MemoryRead => RateLimitRule::new(Duration::from_secs(60), 60),
            Self::Privileged => Tier::Basic.rule(),
        }
    }
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window length and maximum admitted requests per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub window: Duration,
    pub max: u64,
}

impl RateLimitRule {
    pub const fn new(window: Duration, max: u64) -> Self {
        Self { window, max }
    }
}

/// Caller tier for privileged routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn rule(&self) -> RateLimitRule {
        match self {
            Self::Basic => RateLimitRule::new(Duration::from_secs(60), 10),
            Self::Premium => RateLimitRule::new(Duration::from_secs(60), 50),
            Self::Enterprise => RateLimitRule::new(Duration::from_secs(60), 200),
        }
    }
}

/// Resolves a subject's tier. Owned by the external trust layer.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn resolve(&self, subject_key: &str) -> Tier;
}

/// Tier table held in memory; unknown subjects are [`Tier::Basic`].
#[derive(Debug, Default, Clone)]
pub struct StaticTierResolver {
    tiers: HashMap<String, Tier>,
}

impl StaticTierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, subject_key: impl Into<String>, tier: Tier) -> Self {
        self.tiers.insert(subject_key.into(), tier);
        self
    }
}

#[async_trait]
impl TierResolver for StaticTierResolver {
    async fn resolve(&self, subject_key: &str) -> Tier {
        self.tiers.get(subject_key).copied().unwrap_or(Tier::Basic)
    }
}

/// Identity of an inbound caller.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Authenticated user id, if any.
    pub user_id: Option<String>,
    /// Network address of the connection.
    pub address: IpAddr,
}

impl Caller {
    /// Key used for rate-limit windows.
    pub fn subject_key(&self) -> String {
        match &self.user_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.address.to_string(),
        }
    }
}

/// Structured rejection for an over-limit caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimited {
    pub category: RateCategory,
    pub limit: u64,
    pub retry_after_ms: u64,
}

impl RateLimited {
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }

    /// Whole seconds for a `Retry-After` header (rounded up).
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        category: RateCategory,
        limit: u64,
        remaining: u64,
    },
    Limited(RateLimited),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Usage of one category window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUsage {
    pub category: RateCategory,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Gates inbound requests per category and caller.
pub struct AdmissionController {
    store: Arc<dyn CoordinationStore>,
    rules: HashMap<RateCategory, RateLimitRule>,
    tiers: Arc<dyn TierResolver>,
}

impl AdmissionController {
    /// Controller with default rules and every caller on the basic tier.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        let rules = RateCategory::ALL
            .iter()
            .map(|c| (*c, c.default_rule()))
            .collect();
        Self {
            store,
            rules,
            tiers: Arc::new(StaticTierResolver::new()),
        }
    }

    pub fn with_rule(mut self, category: RateCategory, rule: RateLimitRule) -> Self {
        self.rules.insert(category, rule);
        self
    }

    pub fn with_tier_resolver(mut self, tiers: Arc<dyn TierResolver>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn rule(&self, category: RateCategory) -> RateLimitRule {
        self.rules
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_rule())
    }

    /// Count one request against `category` for `subject_key`.
    pub async fn check(
        &self,
        category: RateCategory,
        subject_key: &str,
    ) -> Result<Admission, AdmissionError> {
        self.admit(category, self.rule(category), subject_key).await
    }

    pub async fn check_caller(
        &self,
        category: RateCategory,
        caller: &Caller,
    ) -> Result<Admission, AdmissionError> {
        self.check(category, &caller.subject_key()).await
    }

    /// Privileged-route check: the window comes from the caller's tier.
    pub async fn check_tiered(&self, subject_key: &str) -> Result<Admission, AdmissionError> {
        let tier = self.tiers.resolve(subject_key).await;
        debug!(subject = %subject_key, tier = tier.as_str(), "Resolved caller tier");
        self.admit(RateCategory::Privileged, tier.rule(), subject_key).await
    }

    /// Usage per category, without counting a request.
    ///
    /// The privileged window is reported against the subject's tier limit.
    pub async fn status(&self, subject_key: &str) -> Result<Vec<CategoryUsage>, AdmissionError> {
        let tier = self.tiers.resolve(subject_key).await;
        let mut usage = Vec::with_capacity(RateCategory::ALL.len());
        for category in RateCategory::ALL {
            let key = rate_limit_key(category.as_str(), subject_key);
            let used = self.store.get_counter(&key).await?.unwrap_or(0).max(0) as u64;
            let limit = match category {
                RateCategory::Privileged => tier.rule().max,
                _ => self.rule(category).max,
            };
            usage.push(CategoryUsage {
                category,
                used,
                limit,
                remaining: limit.saturating_sub(used),
            });
        }
        Ok(usage)
    }

    /// Delete every window for `subject_key`. Returns how many existed.
    pub async fn clear(&self, subject_key: &str) -> Result<usize, AdmissionError> {
        let mut cleared = 0;
        for category in RateCategory::ALL {
            if self
                .store
                .del(&rate_limit_key(category.as_str(), subject_key))
                .await?
            {
                cleared += 1;
            }
        }
        info!(subject = %subject_key, cleared, "Cleared rate limit windows");
        Ok(cleared)
    }

    async fn admit(
        &self,
        category: RateCategory,
        rule: RateLimitRule,
        subject_key: &str,
    ) -> Result<Admission, AdmissionError> {
        let key = rate_limit_key(category.as_str(), subject_key);
        let (count, ttl) = self.store.incr_with_ttl(&key, rule.window).await?;
        let count = count.max(0) as u64;

        if count > rule.max {
            let retry_after_ms = ttl.min(rule.window).as_millis() as u64;
            info!(
                category = %category,
                subject = %subject_key,
                count,
                limit = rule.max,
                retry_after_ms,
                "Rate limited"
            );
            return Ok(Admission::Limited(RateLimited {
                category,
                limit: rule.max,
                retry_after_ms,
            }));
        }

        Ok(Admission::Admitted {
            category,
            limit: rule.max,
            remaining: rule.max - count,
        })
    }
}
