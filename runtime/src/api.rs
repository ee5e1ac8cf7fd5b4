//! Inbound API facade for the (external) HTTP layer.
//!
//! [`CouponApi`] bundles the gateway, the query service and the admin
//! actions behind the request/response shapes of the public API. Every
//! failure is mapped to an [`ApiError`] carrying the HTTP status, a stable
//! error code and whether the client may retry.

use crate::admin::{Admin, AdminError};
use crate::gateway::{DecisionGateway, GrabError, GrabResponse};
use crate::query::{QueryError, QueryService, StockLevel, SystemOverview, Tier};
use crate::reconciler::{ReconcileError, ReconcileReport};
use flashgrab_core::types::{ResourceId, UserAggregate, UserId};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Error answer of the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    /// HTTP status code.
    pub status: u16,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Whether the same request may be retried.
    pub retryable: bool,
}

impl ApiError {
    const fn new(status: u16, code: &'static str, message: String, retryable: bool) -> Self {
        Self {
            status,
            code,
            message,
            retryable,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "BAD_REQUEST", message.into(), false)
    }

    fn not_found(what: &str, id: impl fmt::Display) -> Self {
        Self::new(404, "NOT_FOUND", format!("{what} {id} not found"), false)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, "CONFLICT", message.into(), true)
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, "SERVICE_UNAVAILABLE", message.into(), true)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<GrabError> for ApiError {
    fn from(error: GrabError) -> Self {
        match &error {
            GrabError::Indeterminate { .. } => {
                Self::new(504, "INDETERMINATE", error.to_string(), true)
            }
            GrabError::Unavailable(_) | GrabError::Channel(_) => Self::unavailable(error.to_string()),
            GrabError::NotInitialized(resource) => Self::not_found("Resource", resource),
            GrabError::InvalidRequest(message) => Self::bad_request(message.clone()),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(error: QueryError) -> Self {
        match error {
            QueryError::NotConfigured(resource) => Self::not_found("Resource", resource),
            QueryError::Ledger(error) => Self::unavailable(error.to_string()),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(error: ReconcileError) -> Self {
        match error {
            ReconcileError::InProgress(resource) => {
                Self::conflict(format!("Reconcile already running for {resource}"))
            }
            ReconcileError::NotConfigured(resource) => Self::not_found("Resource", resource),
            ReconcileError::Ledger(error) => Self::unavailable(error.to_string()),
            ReconcileError::Counter(error) => Self::unavailable(error.to_string()),
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(error: AdminError) -> Self {
        match error {
            AdminError::NotConfigured(resource) => Self::not_found("Resource", resource),
            AdminError::InvalidTotal { .. } => Self::bad_request(error.to_string()),
            AdminError::Ledger(error) => Self::unavailable(error.to_string()),
            AdminError::Counter(error) => Self::unavailable(error.to_string()),
            AdminError::Reconcile(error) => error.into(),
        }
    }
}

/// `POST grab` answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrabReply {
    /// `granted` or `denied`.
    pub outcome: &'static str,
    /// Denial reason, if denied.
    pub reason: Option<&'static str>,
    /// Counter value after the decision.
    pub remaining_stock: i64,
    /// Event id, usable to trace the grab through the pipeline.
    pub event_id: String,
    /// Decision latency.
    pub latency_ms: f64,
}

impl From<GrabResponse> for GrabReply {
    fn from(response: GrabResponse) -> Self {
        Self {
            outcome: response.outcome.as_str(),
            reason: response.outcome.reason().map(|r| r.as_str()),
            remaining_stock: response.remaining_stock,
            event_id: response.event_id.to_string(),
            latency_ms: response.latency.as_secs_f64() * 1000.0,
        }
    }
}

/// `GET stock` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockReply {
    /// Resource id.
    pub resource_id: String,
    /// Units left.
    pub remaining: i64,
    /// Tier that answered.
    pub source: &'static str,
}

impl From<StockLevel> for StockReply {
    fn from(level: StockLevel) -> Self {
        Self {
            resource_id: level.resource_id.to_string(),
            remaining: level.remaining,
            source: level.tier.as_str(),
        }
    }
}

/// `GET stats` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStatsReply {
    /// User id.
    pub user_id: String,
    /// Totals; zero for a user that never grabbed.
    pub total_attempts: i64,
    /// Granted attempts.
    pub successful_grants: i64,
    /// Denied attempts.
    pub failed_attempts: i64,
    /// Latest attempt, RFC 3339.
    pub last_attempt_at: Option<String>,
    /// Tier that answered.
    pub source: &'static str,
}

impl UserStatsReply {
    fn new(user: &UserId, aggregate: Option<UserAggregate>, tier: Tier) -> Self {
        let aggregate = aggregate.unwrap_or_else(|| UserAggregate::empty(user.clone()));
        Self {
            user_id: user.to_string(),
            total_attempts: aggregate.total_attempts,
            successful_grants: aggregate.successful_grants,
            failed_attempts: aggregate.failed_attempts,
            last_attempt_at: aggregate.last_attempt_at.map(|at| at.to_rfc3339()),
            source: tier.as_str(),
        }
    }
}

/// `POST admin/reconcile` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReply {
    /// Resource id.
    pub resource_id: String,
    /// `observed - authoritative`.
    pub drift: i64,
    /// Whether the counter was overwritten.
    pub corrected: bool,
}

impl From<ReconcileReport> for ReconcileReply {
    fn from(report: ReconcileReport) -> Self {
        Self {
            resource_id: report.resource_id.to_string(),
            drift: report.drift,
            corrected: report.corrected,
        }
    }
}

/// The public API surface.
#[derive(Clone)]
pub struct CouponApi {
    gateway: DecisionGateway,
    query: Arc<QueryService>,
    admin: Arc<Admin>,
}

impl CouponApi {
    /// Bundle the services.
    #[must_use]
    pub const fn new(gateway: DecisionGateway, query: Arc<QueryService>, admin: Arc<Admin>) -> Self {
        Self {
            gateway,
            query,
            admin,
        }
    }

    /// `POST grab(user_id, resource_id)`.
    ///
    /// # Errors
    ///
    /// See [`DecisionGateway::grab`].
    pub async fn grab(&self, user_id: &str, resource_id: &str) -> Result<GrabReply, ApiError> {
        let response = self
            .gateway
            .grab(&UserId::new(user_id), &ResourceId::new(resource_id))
            .await?;
        Ok(response.into())
    }

    /// `POST like(user_id)`. Returns whether the like made the top board.
    ///
    /// # Errors
    ///
    /// See [`DecisionGateway::like`].
    pub fn like(&self, user_id: &str) -> Result<bool, ApiError> {
        Ok(self.gateway.like(&UserId::new(user_id))?.is_top_like)
    }

    /// `GET stock(resource_id)`.
    ///
    /// # Errors
    ///
    /// See [`QueryService::stock`].
    pub async fn stock(&self, resource_id: &str) -> Result<StockReply, ApiError> {
        Ok(self.query.stock(&ResourceId::new(resource_id)).await?.into())
    }

    /// `GET stats(user_id)`.
    ///
    /// # Errors
    ///
    /// See [`QueryService::user_stats`].
    pub async fn user_stats(&self, user_id: &str) -> Result<UserStatsReply, ApiError> {
        let user = UserId::new(user_id);
        if !user.is_valid() {
            return Err(ApiError::bad_request("user_id must not be blank"));
        }
        let answer = self.query.user_stats(&user).await?;
        Ok(UserStatsReply::new(&user, answer.value, answer.tier))
    }

    /// `GET system/stats`.
    ///
    /// # Errors
    ///
    /// See [`QueryService::system_stats`].
    pub async fn system_stats(&self) -> Result<SystemOverview, ApiError> {
        Ok(self.query.system_stats().await?.value)
    }

    /// `POST admin/reset(resource_id, total)`.
    ///
    /// # Errors
    ///
    /// See [`Admin::reset`].
    pub async fn reset(&self, resource_id: &str, total: i64) -> Result<StockReply, ApiError> {
        let report = self.admin.reset(&ResourceId::new(resource_id), total).await?;
        Ok(StockReply {
            resource_id: report.resource_id.to_string(),
            remaining: report.total,
            source: Tier::Counter.as_str(),
        })
    }

    /// `POST admin/reconcile(resource_id)`.
    ///
    /// # Errors
    ///
    /// See [`Admin::reconcile`].
    pub async fn reconcile(&self, resource_id: &str) -> Result<ReconcileReply, ApiError> {
        Ok(self.admin.reconcile(&ResourceId::new(resource_id)).await?.into())
    }
}
