//! Domain types shared by every stage of the grab pipeline.
//!
//! Identifiers are thin newtypes. Outcomes are a closed variant so that every
//! consumer handles `granted` and each denial reason exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn trimmed(id: String) -> String {
    let trimmed = id.trim();
    if trimmed.len() == id.len() {
        id
    } else {
        trimmed.to_string()
    }
}

/// Identifier of a requester.
///
/// Surrounding whitespace is trimmed, so `" alice "` and `"alice"` are the
/// same user. Construction never fails: a blank id is representable so the
/// gateway can answer it with [`DenialReason::Invalid`] and still account for
/// the attempt.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a user id, trimming surrounding whitespace.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(trimmed(id.into()))
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a store key (non-blank).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a stock-limited resource (one coupon batch).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource id, trimming surrounding whitespace.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(trimmed(id.into()))
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a store key (non-blank).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Idempotency key of a pipeline event, generated once at the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (used when loading rows back from the ledger).
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a grab attempt did not consume stock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DenialReason {
    /// The bounded decrement refused: the counter was already at zero.
    OutOfStock,
    /// The user already holds a grant for this resource.
    Duplicate,
    /// The request could not be interpreted (blank ids).
    Invalid,
}

impl DenialReason {
    /// Ledger representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::Duplicate => "duplicate",
            Self::Invalid => "invalid",
        }
    }

    /// Parse the ledger representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "out_of_stock" => Some(Self::OutOfStock),
            "duplicate" => Some(Self::Duplicate),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one grab decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// One unit of stock was consumed by this requester.
    Granted,
    /// No stock was consumed.
    Denied(DenialReason),
}

impl Outcome {
    /// `true` for [`Outcome::Granted`].
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    /// The denial reason, if any.
    #[must_use]
    pub const fn reason(&self) -> Option<DenialReason> {
        match self {
            Self::Granted => None,
            Self::Denied(reason) => Some(*reason),
        }
    }

    /// Ledger representation of the outcome column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied(_) => "denied",
        }
    }

    /// Rebuild an outcome from its `(outcome, reason)` ledger columns.
    #[must_use]
    pub fn from_columns(outcome: &str, reason: Option<&str>) -> Option<Self> {
        match (outcome, reason) {
            ("granted", None) => Some(Self::Granted),
            ("denied", Some(reason)) => DenialReason::parse(reason).map(Self::Denied),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => f.write_str("granted"),
            Self::Denied(reason) => write!(f, "denied/{reason}"),
        }
    }
}

/// Immutable record of one grab attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabEvent {
    /// Idempotency key.
    pub event_id: EventId,
    /// Who asked.
    pub user_id: UserId,
    /// What was asked for.
    pub resource_id: ResourceId,
    /// What the gateway decided.
    pub outcome: Outcome,
    /// Counter value observed by the decision (0 when out of stock).
    pub stock_snapshot: i64,
    /// Decision time.
    pub occurred_at: DateTime<Utc>,
}

/// Record of a like action. No stock involved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeEvent {
    /// Idempotency key.
    pub event_id: EventId,
    /// Who liked.
    pub user_id: UserId,
    /// Whether this like is promoted to the top-likes board.
    pub is_top_like: bool,
    /// Action time.
    pub occurred_at: DateTime<Utc>,
}

/// Per-user running totals, owned by the persister.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAggregate {
    /// The user these totals belong to.
    pub user_id: UserId,
    /// Every recorded attempt.
    pub total_attempts: i64,
    /// Attempts that were granted.
    pub successful_grants: i64,
    /// Attempts that were denied for any reason.
    pub failed_attempts: i64,
    /// Latest `occurred_at` seen for this user.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl UserAggregate {
    /// Empty totals for a user.
    #[must_use]
    pub const fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            total_attempts: 0,
            successful_grants: 0,
            failed_attempts: 0,
            last_attempt_at: None,
        }
    }

    /// Fold one grab attempt into the totals. Counters only ever grow.
    pub fn record(&mut self, event: &GrabEvent) {
        self.total_attempts += 1;
        if event.outcome.is_granted() {
            self.successful_grants += 1;
        } else {
            self.failed_attempts += 1;
        }
        self.last_attempt_at = Some(
            self.last_attempt_at
                .map_or(event.occurred_at, |last| last.max(event.occurred_at)),
        );
    }
}

/// Authoritative stock configuration row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockConfig {
    /// Resource this row configures.
    pub resource_id: ResourceId,
    /// Units available in the current round.
    pub total: i64,
    /// Last remaining figure written back (bootstrap/reconcile); may be absent.
    pub remaining: Option<i64>,
    /// Start of the current round. Grants before it no longer count against
    /// `total`; `None` means every grant counts.
    pub round_started_at: Option<DateTime<Utc>>,
}

impl StockConfig {
    /// A row with `total` units and no written-back remaining figure.
    #[must_use]
    pub fn new(resource_id: ResourceId, total: i64) -> Self {
        Self {
            resource_id,
            total,
            remaining: None,
            round_started_at: None,
        }
    }

    /// Value a freshly started counter is seeded with.
    #[must_use]
    pub fn seed_value(&self) -> i64 {
        self.remaining.unwrap_or(self.total).clamp(0, self.total)
    }
}

/// Live view of a resource's counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCounter {
    /// Resource id.
    pub resource_id: ResourceId,
    /// Units ever available.
    pub total: i64,
    /// Units not yet granted.
    pub remaining: i64,
}

impl StockCounter {
    /// `0 <= remaining <= total`.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.remaining >= 0 && self.remaining <= self.total
    }
}

/// Ledger-wide totals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStats {
    /// Sum of all attempts.
    pub total_attempts: i64,
    /// Sum of all grants.
    pub successful_grants: i64,
    /// Sum of all denials.
    pub failed_attempts: i64,
    /// Rows in `user_aggregates`.
    pub distinct_users: i64,
    /// All persisted likes.
    pub total_likes: i64,
    /// Persisted likes flagged as top likes.
    pub top_likes: i64,
}

/// Audit entry written whenever the reconciler overwrites a counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftCorrection {
    /// Corrected resource.
    pub resource_id: ResourceId,
    /// Counter value before correction (`None` when the key was missing).
    pub observed: Option<i64>,
    /// Ledger-derived remaining stock written to the counter.
    pub authoritative: i64,
    /// When the correction happened.
    pub corrected_at: DateTime<Utc>,
}

impl DriftCorrection {
    /// Signed difference `observed - authoritative`; a missing key counts as the
    /// whole authoritative amount missing.
    #[must_use]
    pub fn drift(&self) -> i64 {
        self.observed.unwrap_or(0) - self.authoritative
    }
}
