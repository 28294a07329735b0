//! Account model and deactivation policy.
//!
//! An account carries a traffic budget (in GB, fractional values allowed)
//! and an optional time-to-live in days. The policy functions here are pure
//! so the enforcer and the property tests share one definition of the
//! byte-limit and expiry boundaries.

use std::fmt;

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Bytes per configured GB (2^30).
pub const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Prefix of the per-account tag shared by the proxy config and stats keys.
pub const TAG_PREFIX: &str = "user_";

/// Tag for an account id: `"user_" + id`.
#[must_use]
pub fn tag_for(id: &str) -> String {
    format!("{TAG_PREFIX}{id}")
}

/// Byte budget for a GB limit, truncated toward zero.
///
/// NaN and negative limits collapse to zero; an infinite limit saturates
/// at `u64::MAX`.
#[must_use]
pub fn limit_bytes(limit_gb: f64) -> u64 {
    (limit_gb * BYTES_PER_GB) as u64
}

/// A user entitlement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: String,
    pub traffic_limit_gb: f64,
    pub time_limit_days: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub traffic_used_bytes: u64,
    #[serde(default)]
    pub is_active: bool,
}

impl Account {
    /// Build a fresh active account from a validated create request.
    pub fn create(request: &NewAccount, now: DateTime<Utc>) -> Result<Self> {
        request.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            traffic_limit_gb: request.traffic_limit_gb,
            time_limit_days: request.time_limit_days,
            created_at: now,
            traffic_used_bytes: 0,
            is_active: true,
        })
    }

    #[must_use]
    pub fn tag(&self) -> String {
        tag_for(&self.id)
    }

    #[must_use]
    pub fn traffic_limit_bytes(&self) -> u64 {
        limit_bytes(self.traffic_limit_gb)
    }

    /// Instant the account expires, or `None` when unbounded.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let days = u64::try_from(self.time_limit_days).ok().filter(|d| *d > 0)?;
        self.created_at.checked_add_days(Days::new(days))
    }

    #[must_use]
    pub fn is_over_traffic_limit(&self) -> bool {
        self.traffic_used_bytes >= self.traffic_limit_bytes()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expiry| now >= expiry)
    }

    /// Deactivation reason for the current usage at `now`, if any.
    ///
    /// The traffic limit is checked first; expiry only applies to an
    /// account that survived the traffic check.
    #[must_use]
    pub fn deactivation_reason(&self, now: DateTime<Utc>) -> Option<DeactivationReason> {
        if self.is_over_traffic_limit() {
            Some(DeactivationReason::TrafficLimit)
        } else if self.is_expired_at(now) {
            Some(DeactivationReason::TimeLimit)
        } else {
            None
        }
    }
}

/// Why the enforcer deactivated an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    TrafficLimit,
    TimeLimit,
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrafficLimit => write!(f, "traffic_limit"),
            Self::TimeLimit => write!(f, "time_limit"),
        }
    }
}

/// Change computed by one enforcement tick for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDelta {
    pub id: String,
    /// Bytes drained from the proxy counters this tick
    pub usage_delta: u64,
    pub deactivate: Option<DeactivationReason>,
}

/// Create request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewAccount {
    pub traffic_limit_gb: f64,
    pub time_limit_days: i64,
}

impl NewAccount {
    pub fn validate(&self) -> Result<()> {
        if !(self.traffic_limit_gb.is_finite() && self.traffic_limit_gb > 0.0)
            || self.time_limit_days <= 0
        {
            return Err(Error::Validation(
                "traffic_limit_gb and time_limit_days must be positive values".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update request body.
///
/// Limit fields that are absent or non-positive leave the account unchanged;
/// `is_active` and `traffic_used_bytes` apply as given when present.
/// Reactivation does not reset usage or recheck expiry; the next tick
/// re-deactivates an account that is still over its limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountUpdate {
    pub traffic_limit_gb: Option<f64>,
    pub time_limit_days: Option<i64>,
    pub is_active: Option<bool>,
    pub traffic_used_bytes: Option<u64>,
}

impl AccountUpdate {
    pub fn validate(&self) -> Result<()> {
        if self.traffic_limit_gb.is_some_and(f64::is_nan) {
            return Err(Error::Validation("traffic_limit_gb must be a number".to_string()));
        }
        Ok(())
    }

    pub fn apply_to(&self, account: &mut Account) {
        if let Some(gb) = self.traffic_limit_gb.filter(|gb| gb.is_finite() && *gb > 0.0) {
            account.traffic_limit_gb = gb;
        }
        if let Some(days) = self.time_limit_days.filter(|d| *d > 0) {
            account.time_limit_days = days;
        }
        if let Some(active) = self.is_active {
            account.is_active = active;
        }
        if let Some(used) = self.traffic_used_bytes {
            account.traffic_used_bytes = used;
        }
    }
}
