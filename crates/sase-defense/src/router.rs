//! Analysis Routing
//!
//! The single external capability the coordinator depends on: hand a task
//! to a named analysis backend and get its verdict back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::RouterConfig;

/// Kind of work requested from a backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Analyze,
    Generate,
    Visual,
    BulkScan,
    Correlate,
    Validate,
    Ethical,
    RealtimeDefense,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Work item for one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub kind: TaskKind,
    pub priority: DispatchPriority,
    pub backend: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Point after which the result is no longer used
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl AnalysisTask {
    /// Critical-priority task for `backend`
    pub fn critical(kind: TaskKind, backend: &str, payload: serde_json::Value) -> Self {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        Self {
            kind,
            priority: DispatchPriority::Critical,
            backend: backend.to_string(),
            payload,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Verdict returned by a backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AnalysisResponse {
    /// Proposed action label, empty when the backend abstains
    pub action: String,
    pub explanation: String,
    pub analysis: HashMap<String, serde_json::Value>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Generated artifact (patch, signature)
    pub result: Option<serde_json::Value>,
}

impl AnalysisResponse {
    pub fn new(action: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: action.into(),
            confidence,
            ..Default::default()
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_analysis(mut self, key: &str, value: serde_json::Value) -> Self {
        self.analysis.insert(key.to_string(), value);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Analysis map as a JSON object
    pub fn analysis_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.analysis
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Routes tasks to analysis backends.
///
/// Implementations must stop working on a task once its deadline passes;
/// the coordinator drops the future at that point regardless.
#[async_trait]
pub trait AnalysisRouter: Send + Sync {
    async fn route(&self, task: AnalysisTask) -> Result<AnalysisResponse, RouterError>;
}

/// Route with the task deadline enforced locally
pub async fn route_within(
    router: &dyn AnalysisRouter,
    task: AnalysisTask,
) -> Result<AnalysisResponse, RouterError> {
    match task.deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, router.route(task))
            .await
            .unwrap_or(Err(RouterError::Timeout)),
        None => router.route(task).await,
    }
}

// =============================================================================
// HTTP Router
// =============================================================================

/// Posts tasks as JSON to an analysis gateway
pub struct HttpRouter {
    client: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    fn route_url(&self, backend: &str) -> String {
        format!("{}/v1/backends/{}/route", self.endpoint, backend)
    }

    fn timeout_for(&self, task: &AnalysisTask) -> Duration {
        match task.remaining() {
            Some(remaining) => remaining.min(self.request_timeout),
            None => self.request_timeout,
        }
    }
}

#[async_trait]
impl AnalysisRouter for HttpRouter {
    async fn route(&self, task: AnalysisTask) -> Result<AnalysisResponse, RouterError> {
        let timeout = self.timeout_for(&task);
        if timeout.is_zero() {
            return Err(RouterError::Timeout);
        }

        let url = self.route_url(&task.backend);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&task)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RouterError::Timeout
                } else {
                    RouterError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(RouterError::Unavailable(task.backend));
        }
        if !status.is_success() {
            return Err(RouterError::Status(status.as_u16()));
        }

        tracing::debug!("Backend {} answered {:?} task", task.backend, task.kind);

        response
            .json::<AnalysisResponse>()
            .await
            .map_err(|e| RouterError::InvalidResponse(e.to_string()))
    }
}
