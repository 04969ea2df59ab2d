//! # Admission Gate
//!
//! Composition point run before a request is dispatched upstream. The
//! checks run in a fixed order and short-circuit on the first failure:
//!
//! 1. channel ceiling (`allow` only)
//! 2. caller ceiling on that channel (`allow` only)
//! 3. channel+model quarantine
//!
//! Only when all three pass are both ceilings recorded, the caller's before
//! the channel's. A rejection at a later step therefore never consumes
//! budget from an earlier one, and a caller record that fails leaves the
//! pooled channel budget untouched.
//!
//! Denials are ordinary outcomes ([`AdmissionDecision::Deny`]). A limiter
//! backend that cannot answer is an error
//! ([`GatewayError::RateLimitCheckFailed`]) so callers fail closed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::credential::{CredentialRouter, RoutingCredential};
use crate::health::{HealthMonitor, Sample};
use crate::observability::metrics as gateway_metrics;
use crate::ratelimit::{ChannelLimits, ChannelRateLimiter, LimitScope, RateLimitError};

/// Per-request context handed over by the request-handling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub channel_id: i64,
    pub model: String,
    pub caller_id: i64,
    #[serde(default)]
    pub limits: ChannelLimits,
}

impl AdmissionRequest {
    pub fn new(channel_id: i64, model: impl Into<String>, caller_id: i64) -> Self {
        Self {
            channel_id,
            model: model.into(),
            caller_id,
            limits: ChannelLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ChannelLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    RateLimitedChannel,
    RateLimitedCaller,
    ChannelUnhealthy,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitedChannel => "rate_limited_channel",
            Self::RateLimitedCaller => "rate_limited_caller",
            Self::ChannelUnhealthy => "channel_unhealthy",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimitedChannel | Self::RateLimitedCaller => StatusCode::TOO_MANY_REQUESTS,
            Self::ChannelUnhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Structured denial returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

impl Rejection {
    fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.reason.code(),
                "message": self.message,
            }
        });
        (self.reason.status_code(), Json(body)).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allow,
    Deny(Rejection),
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Allow => None,
            Self::Deny(rejection) => Some(rejection),
        }
    }
}

/// Rate limiter, health monitor and credential router behind one call
#[derive(Clone)]
pub struct AdmissionGate {
    limiter: ChannelRateLimiter,
    health: Arc<HealthMonitor>,
    router: CredentialRouter,
}

impl AdmissionGate {
    pub fn new(limiter: ChannelRateLimiter, health: Arc<HealthMonitor>, router: CredentialRouter) -> Self {
        Self {
            limiter,
            health,
            router,
        }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn limiter(&self) -> &ChannelRateLimiter {
        &self.limiter
    }

    pub fn router(&self) -> &CredentialRouter {
        &self.router
    }

    /// Routing group for the caller's credential
    pub fn resolve_group(&self, credential: &mut RoutingCredential) -> String {
        self.router.resolve_group(credential)
    }

    /// Decide whether the request may go to its channel now
    pub async fn admit(&self, request: &AdmissionRequest) -> GatewayResult<AdmissionDecision> {
        let channel_id = request.channel_id;
        let limits = request.limits;

        let channel_ok = self
            .limiter
            .allow_channel(channel_id, limits.rpm_limit)
            .await
            .map_err(|e| check_failed(LimitScope::Channel, &e))?;
        if !channel_ok {
            return Ok(self.deny(
                request,
                RejectReason::RateLimitedChannel,
                "Channel is at its request ceiling, please retry shortly",
            ));
        }

        let caller_ok = self
            .limiter
            .allow_caller(channel_id, request.caller_id, limits.user_rpm_limit)
            .await
            .map_err(|e| check_failed(LimitScope::Caller, &e))?;
        if !caller_ok {
            return Ok(self.deny(
                request,
                RejectReason::RateLimitedCaller,
                "Too many requests to this channel from this caller, please retry shortly",
            ));
        }

        if self.health.is_disabled(channel_id, &request.model) {
            return Ok(self.deny(
                request,
                RejectReason::ChannelUnhealthy,
                format!(
                    "Channel {} is temporarily disabled for model {}",
                    channel_id, request.model
                ),
            ));
        }

        // Caller first: a failed caller record must not spend pooled budget
        self.limiter
            .record_caller(channel_id, request.caller_id, limits.user_rpm_limit)
            .await
            .map_err(|e| check_failed(LimitScope::Caller, &e))?;
        self.limiter
            .record_channel(channel_id, limits.rpm_limit)
            .await
            .map_err(|e| check_failed(LimitScope::Channel, &e))?;

        gateway_metrics::admission("allow");
        Ok(AdmissionDecision::Allow)
    }

    /// Feed telemetry from a finished upstream call into the health monitor
    pub fn report_completion(&self, channel_id: i64, model: &str, sample: Sample) {
        self.health.record_sample(channel_id, model, sample);
    }

    fn deny(
        &self,
        request: &AdmissionRequest,
        reason: RejectReason,
        message: impl Into<String>,
    ) -> AdmissionDecision {
        debug!(
            channel_id = request.channel_id,
            caller_id = request.caller_id,
            model = %request.model,
            reason = %reason,
            "Request denied admission"
        );
        gateway_metrics::admission(reason.code());
        AdmissionDecision::Deny(Rejection::new(reason, message))
    }
}

fn check_failed(scope: LimitScope, err: &RateLimitError) -> GatewayError {
    gateway_metrics::admission("check_failed");
    GatewayError::rate_limit_check_failed(scope.as_str(), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::credential::MemoryCredentialStore;
    use crate::health::HealthConfigStore;
    use crate::ratelimit::{LocalBackend, RateLimitBackend, CALLER_MARK};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Backend whose caller-scoped records always fail
    struct CallerRecordFails(LocalBackend);

    #[async_trait]
    impl RateLimitBackend for CallerRecordFails {
        async fn allow(
            &self,
            key: &str,
            window: Duration,
            max_count: u64,
        ) -> Result<bool, RateLimitError> {
            self.0.allow(key, window, max_count).await
        }

        async fn record(
            &self,
            key: &str,
            window: Duration,
            max_count: u64,
        ) -> Result<(), RateLimitError> {
            if key.starts_with(CALLER_MARK) {
                return Err(RateLimitError::Backend("connection reset".to_string()));
            }
            self.0.record(key, window, max_count).await
        }

        fn name(&self) -> &'static str {
            "caller-record-fails"
        }
    }

    fn gate() -> AdmissionGate {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let limiter = ChannelRateLimiter::new(
            Arc::new(LocalBackend::with_clock(clock.clone())),
            Duration::from_secs(60),
        );
        let health = Arc::new(HealthMonitor::with_clock(
            Arc::new(HealthConfigStore::new()),
            clock,
        ));
        let router = CredentialRouter::new(Arc::new(MemoryCredentialStore::new()));
        AdmissionGate::new(limiter, health, router)
    }

    #[test]
    fn test_reason_codes_and_statuses() {
        assert_eq!(
            serde_json::to_string(&RejectReason::RateLimitedCaller).unwrap(),
            "\"rate_limited_caller\""
        );
        assert_eq!(
            RejectReason::RateLimitedChannel.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RejectReason::ChannelUnhealthy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_unlimited_request_is_admitted() {
        let gate = gate();
        let decision = gate.admit(&AdmissionRequest::new(1, "gpt-4o", 7)).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_caller_denial_does_not_consume_channel_budget() {
        let gate = gate();
        let limits = ChannelLimits {
            rpm_limit: 2,
            user_rpm_limit: 1,
        };
        let first = AdmissionRequest::new(1, "m", 7).with_limits(limits);
        assert!(gate.admit(&first).await.unwrap().is_allowed());

        // Caller 7 is out of budget; the channel keeps its second slot
        let denied = gate.admit(&first).await.unwrap();
        assert_eq!(
            denied.rejection().map(|r| r.reason),
            Some(RejectReason::RateLimitedCaller)
        );

        let other = AdmissionRequest::new(1, "m", 8).with_limits(limits);
        assert!(gate.admit(&other).await.unwrap().is_allowed());

        let third = AdmissionRequest::new(1, "m", 9).with_limits(limits);
        assert_eq!(
            gate.admit(&third).await.unwrap().rejection().map(|r| r.reason),
            Some(RejectReason::RateLimitedChannel)
        );
    }

    #[tokio::test]
    async fn test_failed_caller_record_spends_no_channel_budget() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let backend = Arc::new(CallerRecordFails(LocalBackend::with_clock(clock.clone())));
        let window = Duration::from_secs(60);
        let gate = AdmissionGate::new(
            ChannelRateLimiter::new(backend.clone(), window),
            Arc::new(HealthMonitor::with_clock(
                Arc::new(HealthConfigStore::new()),
                clock,
            )),
            CredentialRouter::new(Arc::new(MemoryCredentialStore::new())),
        );
        let request = AdmissionRequest::new(1, "m", 7).with_limits(ChannelLimits {
            rpm_limit: 1,
            user_rpm_limit: 5,
        });

        let err = gate.admit(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitCheckFailed { ref scope, .. } if scope == "caller"));

        let channel_key = ChannelRateLimiter::channel_key(1);
        assert!(backend.0.allow(&channel_key, window, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejection_response() {
        let rejection = Rejection::new(RejectReason::ChannelUnhealthy, "down");
        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
