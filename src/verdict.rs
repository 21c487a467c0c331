//! Verdict values and the records persisted by a verdict store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregated answer for one IP under one policy.
///
/// A stored row always carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// First-positive-wins result.
    Cascade(bool),
    /// Fraction of definitive sources that reported a VPN, in `[0, 1]`.
    Consensus(f64),
}

impl Verdict {
    /// Which policy produced this verdict.
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::Cascade(_) => VerdictKind::Cascade,
            Verdict::Consensus(_) => VerdictKind::Consensus,
        }
    }

    /// The cascade answer, if this is a cascade verdict.
    pub fn as_cascade(&self) -> Option<bool> {
        match self {
            Verdict::Cascade(v) => Some(*v),
            Verdict::Consensus(_) => None,
        }
    }

    /// The consensus ratio, if this is a consensus verdict.
    pub fn as_consensus(&self) -> Option<f64> {
        match self {
            Verdict::Cascade(_) => None,
            Verdict::Consensus(v) => Some(*v),
        }
    }

    /// Split into the `(cascade, consensus)` column pair used by row stores.
    pub fn to_columns(&self) -> (Option<bool>, Option<f64>) {
        (self.as_cascade(), self.as_consensus())
    }

    /// Rebuild from a column pair. Exactly one column must be set and a
    /// consensus value must lie in `[0, 1]`.
    pub fn from_columns(cascade: Option<bool>, consensus: Option<f64>) -> Option<Self> {
        match (cascade, consensus) {
            (Some(c), None) => Some(Verdict::Cascade(c)),
            (None, Some(r)) if (0.0..=1.0).contains(&r) => Some(Verdict::Consensus(r)),
            _ => None,
        }
    }
}

/// Aggregation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictKind {
    /// Stop at the first positive source.
    #[default]
    Cascade,
    /// Ratio of positive sources over definitive ones.
    Consensus,
}

impl std::fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictKind::Cascade => write!(f, "cascade"),
            VerdictKind::Consensus => write!(f, "consensus"),
        }
    }
}

/// Result of a consensus lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Consensus {
    /// Fraction of definitive sources that reported a VPN.
    Ratio(f64),
    /// No source answered definitively.
    Unknown,
}

impl Consensus {
    /// Build from counts. Zero definitive answers yields `Unknown`.
    pub fn from_counts(positives: usize, definitive: usize) -> Self {
        if definitive == 0 {
            return Consensus::Unknown;
        }
        let ratio = positives.min(definitive) as f64 / definitive as f64;
        Consensus::Ratio(ratio.clamp(0.0, 1.0))
    }

    /// Compare against a threshold. `Unknown` never matches; callers that
    /// want fail-closed behaviour must check [`Consensus::is_unknown`].
    pub fn meets(&self, threshold: f64) -> bool {
        match self {
            Consensus::Ratio(r) => *r >= threshold,
            Consensus::Unknown => false,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Consensus::Unknown)
    }

    pub fn ratio(&self) -> Option<f64> {
        match self {
            Consensus::Ratio(r) => Some(*r),
            Consensus::Unknown => None,
        }
    }
}

/// Interned IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpRecord {
    pub id: i64,
    pub ip: String,
}

/// Interned player identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: i64,
    pub player: Uuid,
}

/// One stored verdict row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    /// Row ID.
    pub id: i64,
    /// Surrogate ID of the IP this verdict is about.
    pub ip_id: i64,
    /// The IP string, resolved from `ip_id`.
    pub ip: String,
    pub verdict: Verdict,
    /// Unix milliseconds.
    pub created: i64,
}

impl VerdictRecord {
    /// Whether this row is still usable as a cache hit at `now`.
    pub fn is_fresh(&self, now: i64, max_age_millis: i64) -> bool {
        now - self.created <= max_age_millis
    }
}

/// Verdict row as exported by a dump, without the resolved IP string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVerdict {
    pub id: i64,
    pub ip_id: i64,
    pub verdict: Verdict,
    pub created: i64,
}

impl From<&VerdictRecord> for RawVerdict {
    fn from(r: &VerdictRecord) -> Self {
        Self {
            id: r.id,
            ip_id: r.ip_id,
            verdict: r.verdict,
            created: r.created,
        }
    }
}

/// Outcome of [`crate::store::VerdictStore::post`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostVpnResult {
    /// Row ID of the inserted verdict.
    pub id: i64,
    pub ip_id: i64,
    pub ip: String,
    pub verdict: Verdict,
    pub created: i64,
    /// True when the verdict was freshly computed, false when the store
    /// short-circuited on a fresh row of the same policy.
    pub fresh: bool,
}

impl PostVpnResult {
    /// The stored row this result describes.
    pub fn record(&self) -> VerdictRecord {
        VerdictRecord {
            id: self.id,
            ip_id: self.ip_id,
            ip: self.ip.clone(),
            verdict: self.verdict,
            created: self.created,
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
