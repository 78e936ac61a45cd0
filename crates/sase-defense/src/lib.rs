//! OpenSASE Real-Time Defense
//!
//! Multi-backend threat response coordination:
//! - Parallel fan-out of each threat to independent analysis backends
//! - Severity-scaled deadlines with partial-result degradation
//! - Rapid consensus for critical threats, plurality correlation otherwise
//! - Content-addressed response cache with TTL expiry
//! - Bounded threat history used as analysis context
//! - Fire-and-forget alert fan-out for blocking decisions
//! - Bespoke workflows per threat category
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       REAL-TIME DEFENSE COORDINATOR                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │   ThreatEvent ──► History ──► Cache ──hit──────────────────────► reply   │
//! │                                 │                                        │
//! │                                miss                                      │
//! │                                 ▼                                        │
//! │                  ┌──────────────────────────────┐                        │
//! │                  │   Fan-out (one task/backend) │◄── deadline by         │
//! │                  └──────┬───────┬───────┬───────┘    severity            │
//! │                         ▼       ▼       ▼                                │
//! │                      backend backend backend  (AnalysisRouter)           │
//! │                         └───────┼───────┘                                │
//! │                                 ▼                                        │
//! │              critical? ── rapid consensus : correlation                  │
//! │                                 │                                        │
//! │                    ┌────────────┼─────────────┐                          │
//! │                    ▼            ▼             ▼                          │
//! │                  Cache       Alerts        History                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub mod alerts;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod history;
pub mod router;
pub mod voting;
pub mod workflows;

#[cfg(test)]
pub(crate) mod testing;

pub use alerts::{Alert, AlertListener, AlertManager, AlertPriority};
pub use cache::ResponseCache;
pub use config::DefenseConfig;
pub use coordinator::{DefenseCoordinator, DefenseStatus};
pub use history::{HistoryContext, ThreatHistory, ThreatRecord};
pub use router::{AnalysisResponse, AnalysisRouter, AnalysisTask, HttpRouter, RouterError};
pub use workflows::PatternWorkflows;

// =============================================================================
// Core Types
// =============================================================================

/// Category of an observed threat.
///
/// Labels outside the known set deserialize as `Unclassified` and are
/// analyzed by the roster fallback.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThreatCategory {
    #[serde(rename = "ai_exploit")]
    Exploit,
    #[serde(rename = "polymorphic")]
    PolymorphicMalware,
    #[serde(rename = "prompt_injection")]
    PromptInjection,
    #[serde(rename = "deepfake")]
    Deepfake,
    #[serde(rename = "model_poison")]
    ModelPoisoning,
    #[serde(rename = "zero_day")]
    ZeroDay,
    #[default]
    #[serde(rename = "unclassified", other)]
    Unclassified,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exploit => "ai_exploit",
            Self::PolymorphicMalware => "polymorphic",
            Self::PromptInjection => "prompt_injection",
            Self::Deepfake => "deepfake",
            Self::ModelPoisoning => "model_poison",
            Self::ZeroDay => "zero_day",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Threat observation submitted for real-time response.
///
/// Never mutated once built; the coordinator clones it into history,
/// analysis tasks and alerts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatEvent {
    #[serde(default = "new_threat_id")]
    pub id: String,
    pub category: ThreatCategory,
    pub severity: Severity,
    pub source: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub detected_at: DateTime<Utc>,
    /// Backends that must analyze this threat; overrides the category roster
    #[serde(default)]
    pub required_backends: Vec<String>,
}

fn new_threat_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ThreatEvent {
    pub fn new(
        category: ThreatCategory,
        severity: Severity,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: new_threat_id(),
            category,
            severity,
            source: source.into(),
            payload,
            detected_at: Utc::now(),
            required_backends: Vec::new(),
        }
    }

    /// Set identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set detection time
    pub fn detected_at(mut self, at: DateTime<Utc>) -> Self {
        self.detected_at = at;
        self
    }

    /// Pin analysis to specific backends
    pub fn requiring<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_backends = backends.into_iter().map(Into::into).collect();
        self
    }
}

/// Action labels produced by the coordinator and the workflows
pub mod actions {
    pub const BLOCKED: &str = "blocked";
    pub const MONITOR: &str = "monitor";
    pub const PATCH_DEPLOYED: &str = "patch_deployed";
    pub const FLAGGED: &str = "flagged";
    pub const PASSED: &str = "passed";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const SIGNATURE_UPDATED: &str = "signature_updated";

    /// Actions that raise an alert
    pub const ALERT_WORTHY: [&str; 2] = [BLOCKED, PATCH_DEPLOYED];

    pub fn is_alert_worthy(action: &str) -> bool {
        ALERT_WORTHY.contains(&action)
    }
}

/// Elapsed time reported for a cache hit
pub const CACHE_HIT_TIME_MS: f64 = 0.1;

/// Verdict returned for one processed threat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DefenseResponse {
    pub action: String,
    pub reason: String,
    pub patch: Option<serde_json::Value>,
    pub details: HashMap<String, serde_json::Value>,
    pub time_ms: f64,
    pub consensus: bool,
}

impl DefenseResponse {
    pub fn new(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
            ..Default::default()
        }
    }

    /// Set consensus flag
    pub fn with_consensus(mut self, consensus: bool) -> Self {
        self.consensus = consensus;
        self
    }

    /// Attach a result artifact
    pub fn with_patch(mut self, patch: Option<serde_json::Value>) -> Self {
        self.patch = patch;
        self
    }

    /// Replace diagnostic details
    pub fn with_details(mut self, details: HashMap<String, serde_json::Value>) -> Self {
        self.details = details;
        self
    }

    /// Add one diagnostic entry
    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    /// Set elapsed time in milliseconds
    pub fn with_time_ms(mut self, time_ms: f64) -> Self {
        self.time_ms = time_ms;
        self
    }
}

/// Milliseconds elapsed since `since`, clamped at zero
pub fn elapsed_ms(since: DateTime<Utc>) -> f64 {
    let elapsed = Utc::now() - since;
    match elapsed.num_microseconds() {
        Some(us) => (us.max(0) as f64) / 1000.0,
        None => elapsed.num_milliseconds().max(0) as f64,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Defense coordinator error type
#[derive(Error, Debug)]
pub enum DefenseError {
    /// No backend produced a verdict
    #[error("no analysis responses available")]
    NoResponses,

    /// Critical threat without enough verdicts to vote
    #[error("insufficient AI responses for critical threat consensus ({received} received)")]
    InsufficientResponses { received: usize },

    /// A required workflow phase failed
    #[error("{stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: RouterError,
    },

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for the defense coordinator
pub type DefenseResult<T> = Result<T, DefenseError>;
