//! Detector invocation boundary
//!
//! A detector inspects an entity and returns findings to merge into its
//! reasons map. The production implementation posts to a remote analysis
//! endpoint; with no endpoint configured, scans complete without new
//! findings so the rest of the pipeline (cooldown, queue lifecycle) still
//! exercises normally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use warden_common::db::models::{Entity, EntityKind, ReasonType};

/// Requests per second against the analysis endpoint, across all workers
const DETECTOR_RATE_PER_SEC: u32 = 5;

/// Source attributed to findings the endpoint returns without one
const FALLBACK_SOURCE: &str = "remote";

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("detector endpoint returned {0}: {1}")]
    Api(u16, String),

    #[error("failed to parse detector response: {0}")]
    Parse(String),
}

/// One detector finding, ready to merge into an entity's reasons
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub reason_type: ReasonType,
    pub message: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
    /// Detector that produced the finding
    pub source: String,
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, entity: &Entity) -> Result<Vec<Finding>, DetectorError>;
}

/// Detector used when no endpoint is configured
pub struct NullDetector;

#[async_trait]
impl Detector for NullDetector {
    async fn detect(&self, entity: &Entity) -> Result<Vec<Finding>, DetectorError> {
        debug!(
            entity_id = entity.id,
            kind = %entity.kind,
            "No detector endpoint configured, scan produces no findings"
        );
        Ok(vec![])
    }
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    entity_id: i64,
    kind: EntityKind,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    findings: Vec<RemoteFinding>,
}

#[derive(Debug, Deserialize)]
struct RemoteFinding {
    reason_type: String,
    message: String,
    confidence: f64,
    #[serde(default)]
    evidence: Vec<String>,
    source: Option<String>,
}

/// Remote analysis endpoint client
///
/// Posts the entity's identity as JSON and expects
/// `{ "findings": [ { reason_type, message, confidence, evidence?, source? } ] }`.
/// Calls are rate limited so a deep backlog cannot flood the endpoint.
pub struct RemoteDetector {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl RemoteDetector {
    pub fn new(endpoint: String, api_key: Option<String>, timeout: Duration) -> Self {
        // Safe: DETECTOR_RATE_PER_SEC is always non-zero
        let quota =
            governor::Quota::per_second(std::num::NonZeroU32::new(DETECTOR_RATE_PER_SEC).unwrap());
        let rate_limiter = governor::RateLimiter::direct(quota);

        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client (system error)"),
            endpoint,
            api_key,
            rate_limiter,
        }
    }
}

#[async_trait]
impl Detector for RemoteDetector {
    async fn detect(&self, entity: &Entity) -> Result<Vec<Finding>, DetectorError> {
        self.rate_limiter.until_ready().await;

        debug!(
            entity_id = entity.id,
            kind = %entity.kind,
            endpoint = %self.endpoint,
            "Querying detector endpoint"
        );

        let mut request = self.client.post(&self.endpoint).json(&DetectRequest {
            entity_id: entity.id,
            kind: entity.kind,
            name: &entity.name,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DetectorError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Api(status, body));
        }

        let parsed: DetectResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Parse(e.to_string()))?;

        Ok(convert_findings(parsed.findings))
    }
}

/// Map raw endpoint findings to mergeable ones.
///
/// A finding with an unknown reason type or a confidence outside [0,1] is
/// skipped with a warning; one bad finding never discards the rest.
fn convert_findings(raw: Vec<RemoteFinding>) -> Vec<Finding> {
    let mut findings = Vec::with_capacity(raw.len());
    for f in raw {
        let reason_type = match f.reason_type.parse::<ReasonType>() {
            Ok(rt) => rt,
            Err(_) => {
                warn!("Skipping finding with unknown reason type {:?}", f.reason_type);
                continue;
            }
        };
        if !(0.0..=1.0).contains(&f.confidence) {
            warn!(
                reason_type = %reason_type,
                confidence = f.confidence,
                "Skipping finding with out-of-range confidence"
            );
            continue;
        }
        findings.push(Finding {
            reason_type,
            message: f.message,
            confidence: f.confidence,
            evidence: f.evidence,
            source: f.source.unwrap_or_else(|| FALLBACK_SOURCE.to_string()),
        });
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_common::db::models::EntityStatus;

    fn entity() -> Entity {
        Entity {
            id: 1,
            kind: EntityKind::User,
            name: "test".to_string(),
            status: EntityStatus::Flagged,
            reasons: Default::default(),
            confidence: 0.0,
            upvotes: 0,
            downvotes: 0,
            account_created_at: Utc::now(),
            first_flagged_at: Utc::now(),
            last_scanned: None,
            last_updated: Utc::now(),
            last_viewed: None,
        }
    }

    fn raw(reason_type: &str, confidence: f64, source: Option<&str>) -> RemoteFinding {
        RemoteFinding {
            reason_type: reason_type.to_string(),
            message: "m".to_string(),
            confidence,
            evidence: vec![],
            source: source.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn null_detector_finds_nothing() {
        let findings = NullDetector.detect(&entity()).await.unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn unknown_reason_type_is_skipped() {
        let findings = convert_findings(vec![
            raw("profile", 0.5, Some("A")),
            raw("astrology", 0.5, Some("A")),
        ]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reason_type, ReasonType::Profile);
    }

    #[test]
    fn out_of_range_confidence_is_skipped() {
        let findings = convert_findings(vec![
            raw("chat", 1.2, Some("A")),
            raw("chat", -0.1, Some("A")),
            raw("chat", 1.0, Some("A")),
        ]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, 1.0);
    }

    #[test]
    fn missing_source_gets_the_fallback() {
        let findings = convert_findings(vec![raw("member", 0.5, None)]);
        assert_eq!(findings[0].source, "remote");
    }

    #[test]
    fn response_parses_with_optional_fields_absent() {
        let parsed: DetectResponse = serde_json::from_str(
            r#"{"findings":[{"reason_type":"profile","message":"bad","confidence":0.7}]}"#,
        )
        .unwrap();
        let findings = convert_findings(parsed.findings);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].evidence.is_empty());
    }
}
