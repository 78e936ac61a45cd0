//! Defense Coordinator
//!
//! Unified flow: Record → Cache → Fan-out → Vote → Cache/Alert → Reply

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::alerts::{AlertManager, AlertPriority};
use crate::cache::ResponseCache;
use crate::config::DefenseConfig;
use crate::history::ThreatHistory;
use crate::router::{route_within, AnalysisResponse, AnalysisRouter, AnalysisTask, TaskKind};
use crate::voting::{self, BackendVerdicts};
use crate::{
    actions, elapsed_ms, DefenseResponse, DefenseResult, Severity, ThreatEvent, CACHE_HIT_TIME_MS,
};

/// Stateless orchestrator over the cache, history and alert log
pub struct DefenseCoordinator {
    router: Arc<dyn AnalysisRouter>,
    cache: Arc<ResponseCache>,
    history: Arc<ThreatHistory>,
    alerts: Arc<AlertManager>,
    config: DefenseConfig,
    intake_tx: mpsc::Sender<ThreatEvent>,
    intake_rx: Mutex<Option<mpsc::Receiver<ThreatEvent>>>,
    stats: CoordinatorStats,
}

#[derive(Default)]
struct CoordinatorStats {
    threats_processed: AtomicU64,
    cache_hits: AtomicU64,
    intake_dropped: AtomicU64,
    correlation_failures: AtomicU64,
}

impl DefenseCoordinator {
    pub fn new(config: DefenseConfig, router: Arc<dyn AnalysisRouter>) -> DefenseResult<Self> {
        config.validate()?;
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity);

        Ok(Self {
            router,
            cache: Arc::new(ResponseCache::new(config.cache.ttl())),
            history: Arc::new(ThreatHistory::new(config.history.clone())),
            alerts: Arc::new(AlertManager::new(config.alerts.clone())),
            config,
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            stats: CoordinatorStats::default(),
        })
    }

    /// Analyze one threat and decide on a response.
    ///
    /// Errors only when no verdict could be obtained at all; every other
    /// shortfall degrades to a non-escalating decision.
    pub async fn process_threat(&self, threat: &ThreatEvent) -> DefenseResult<DefenseResponse> {
        self.stats.threats_processed.fetch_add(1, Ordering::Relaxed);
        self.history.record(threat.clone());

        let deadline = self.deadline_for(threat.severity);

        if let Some(mut cached) = self.cache.get(threat) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache hit for threat {} ({})", threat.id, threat.category);
            cached.time_ms = CACHE_HIT_TIME_MS;
            self.history.record_response(&threat.id, CACHE_HIT_TIME_MS);
            return Ok(cached);
        }

        let backends = self.capable_backends(threat);
        let verdicts = self.fan_out(threat, &backends, deadline).await;

        let decision = if threat.severity == Severity::Critical {
            voting::rapid_consensus(&verdicts)
        } else {
            voting::correlate(&verdicts)
        };

        let response = match decision {
            Ok(response) => response.with_time_ms(elapsed_ms(threat.detected_at)),
            Err(e) => {
                self.stats.correlation_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Could not evaluate threat {}: {}", threat.id, e);
                return Err(e);
            }
        };

        self.cache.insert(threat, &response);
        self.conclude(threat, &response);
        Ok(response)
    }

    /// Alert on blocking actions and record the latency
    pub(crate) fn conclude(&self, threat: &ThreatEvent, response: &DefenseResponse) {
        if actions::is_alert_worthy(&response.action) {
            self.alerts
                .send_alert(AlertPriority::for_severity(threat.severity), threat, response);
        }
        self.history.record_response(&threat.id, response.time_ms);
    }

    /// Fan the threat out to its capable backends under its severity deadline
    pub async fn parallel_analyze(&self, threat: &ThreatEvent) -> BackendVerdicts {
        let backends = self.capable_backends(threat);
        self.fan_out(threat, &backends, self.deadline_for(threat.severity))
            .await
    }

    /// One worker per backend; returns whatever answered before `deadline`
    pub(crate) async fn fan_out(
        &self,
        threat: &ThreatEvent,
        backends: &[String],
        deadline: Instant,
    ) -> BackendVerdicts {
        let results: Arc<Mutex<HashMap<String, AnalysisResponse>>> = Arc::default();
        let context = serde_json::to_value(self.history.context(threat))
            .unwrap_or(serde_json::Value::Null);

        let mut workers = JoinSet::new();
        for backend in backends {
            let task = self.build_task(threat, backend, &context).with_deadline(deadline);
            let router = Arc::clone(&self.router);
            let results = Arc::clone(&results);
            let backend = backend.clone();

            workers.spawn(async move {
                match route_within(router.as_ref(), task).await {
                    Ok(resp) => {
                        results.lock().insert(backend, resp);
                    }
                    Err(e) => {
                        tracing::debug!("Backend {} failed: {}", backend, e);
                    }
                }
            });
        }

        let all_done = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout_at(deadline, all_done).await.is_err() {
            tracing::warn!(
                "Deadline reached for threat {}; continuing with partial results",
                threat.id
            );
        }
        workers.abort_all();

        let collected = std::mem::take(&mut *results.lock());
        let verdicts = BackendVerdicts::from_roster(backends, collected);
        tracing::debug!(
            "Threat {}: {}/{} backends answered",
            threat.id,
            verdicts.len(),
            backends.len()
        );
        verdicts
    }

    fn build_task(
        &self,
        threat: &ThreatEvent,
        backend: &str,
        context: &serde_json::Value,
    ) -> AnalysisTask {
        AnalysisTask::critical(
            TaskKind::RealtimeDefense,
            backend,
            serde_json::json!({
                "threat_id": threat.id,
                "threat_type": threat.category,
                "severity": threat.severity,
                "payload": threat.payload,
                "context": context,
            }),
        )
    }

    /// Explicitly required backends, else the roster entry for the category
    pub fn capable_backends(&self, threat: &ThreatEvent) -> Vec<String> {
        if !threat.required_backends.is_empty() {
            return threat.required_backends.clone();
        }
        self.config.roster.backends_for(threat.category)
    }

    pub(crate) fn deadline_for(&self, severity: Severity) -> Instant {
        Instant::now() + self.config.timeouts.for_severity(severity)
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Enqueue without waiting; drops the threat when the queue is full
    pub fn submit_threat(&self, threat: ThreatEvent) {
        match self.intake_tx.try_send(threat) {
            Ok(()) => {}
            Err(TrySendError::Full(threat)) => {
                self.stats.intake_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Threat queue full, dropping threat: {}", threat.id);
            }
            Err(TrySendError::Closed(threat)) => {
                self.stats.intake_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Threat queue closed, dropping threat: {}", threat.id);
            }
        }
    }

    /// Receiving end of the intake queue; available once
    pub fn take_threat_stream(&self) -> Option<mpsc::Receiver<ThreatEvent>> {
        self.intake_rx.lock().take()
    }

    /// Drain the intake queue through `process_threat`
    pub fn spawn_intake_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut stream = self.take_threat_stream()?;
        let coordinator = Arc::clone(self);

        Some(tokio::spawn(async move {
            while let Some(threat) = stream.recv().await {
                match coordinator.process_threat(&threat).await {
                    Ok(response) => tracing::info!(
                        "Threat {} ({}) -> {} in {:.1}ms",
                        threat.id,
                        threat.category,
                        response.action,
                        response.time_ms
                    ),
                    Err(e) => tracing::warn!("Threat {} not evaluated: {}", threat.id, e),
                }
            }
            tracing::debug!("Intake worker stopped");
        }))
    }

    /// Start the periodic cache sweep
    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        self.cache
            .spawn_sweeper(self.config.cache.sweep_interval())
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> DefenseStatus {
        DefenseStatus {
            active_threats: self.intake_tx.max_capacity() - self.intake_tx.capacity(),
            cache_size: self.cache.len(),
            threats_today: self.history.count_today(),
            avg_response_ms: self.history.average_response_time(),
            alert_queue_size: self.alerts.pending_count(),
            threats_processed: self.stats.threats_processed.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            intake_dropped: self.stats.intake_dropped.load(Ordering::Relaxed),
            correlation_failures: self.stats.correlation_failures.load(Ordering::Relaxed),
        }
    }

    pub fn router(&self) -> &Arc<dyn AnalysisRouter> {
        &self.router
    }
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }
    pub fn history(&self) -> &Arc<ThreatHistory> {
        &self.history
    }
    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }
    pub fn config(&self) -> &DefenseConfig {
        &self.config
    }
}

/// Operator-facing snapshot
#[derive(Debug, Clone, Serialize)]
pub struct DefenseStatus {
    /// Threats waiting in the intake queue
    pub active_threats: usize,
    pub cache_size: usize,
    pub threats_today: usize,
    /// Mean decision latency, cache hits included at their sentinel cost
    pub avg_response_ms: f64,
    /// Alerts retained in the log
    pub alert_queue_size: usize,
    pub threats_processed: u64,
    pub cache_hits: u64,
    pub intake_dropped: u64,
    pub correlation_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRouter;
    use crate::{DefenseError, ThreatCategory};
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn coordinator(router: ScriptedRouter) -> (DefenseCoordinator, Arc<ScriptedRouter>) {
        let router = Arc::new(router);
        let coordinator = DefenseCoordinator::new(DefenseConfig::default(), router.clone()).unwrap();
        (coordinator, router)
    }

    fn threat(category: ThreatCategory, severity: Severity) -> ThreatEvent {
        ThreatEvent::new(category, severity, "waf-eu-1", json!("SELECT * FROM users"))
    }

    fn vote(action: &str) -> AnalysisResponse {
        AnalysisResponse::new(action, 0.9).with_explanation(format!("voted {action}"))
    }

    #[tokio::test]
    async fn test_second_identical_threat_hits_cache() {
        let (coord, router) = coordinator(
            ScriptedRouter::new()
                .respond("claude", vote("blocked"))
                .respond("gemini", vote("blocked")),
        );

        let first = coord
            .process_threat(&threat(ThreatCategory::ModelPoisoning, Severity::High))
            .await
            .unwrap();
        let second = coord
            .process_threat(&threat(ThreatCategory::ModelPoisoning, Severity::High))
            .await
            .unwrap();

        assert_eq!(router.call_count(), 2);
        assert_eq!(second.time_ms, CACHE_HIT_TIME_MS);
        assert_eq!(second.clone().with_time_ms(first.time_ms), first);

        let status = coord.status();
        let expected_avg = (first.time_ms + CACHE_HIT_TIME_MS) / 2.0;
        assert!((status.avg_response_ms - expected_avg).abs() < 1e-9);
        assert_eq!(status.cache_hits, 1);
        assert_eq!(status.cache_size, 1);
        assert_eq!(status.threats_processed, 2);
    }

    #[tokio::test]
    async fn test_critical_with_one_response_is_error() {
        let (coord, _) = coordinator(ScriptedRouter::new().respond("claude", vote("blocked")));
        let t = threat(ThreatCategory::ModelPoisoning, Severity::Critical);

        let err = assert_err!(coord.process_threat(&t).await);
        assert!(matches!(err, DefenseError::InsufficientResponses { received: 1 }));
        // Recorded even though evaluation failed
        assert_eq!(coord.history().len(), 1);
        assert!(coord.cache().is_empty());
        assert_eq!(coord.status().correlation_failures, 1);
    }

    #[tokio::test]
    async fn test_critical_disagreement_monitors() {
        let (coord, _) = coordinator(
            ScriptedRouter::new()
                .respond("gemini", vote("blocked"))
                .respond("claude", vote("quarantine")),
        );
        let resp = assert_ok!(
            coord
                .process_threat(&threat(ThreatCategory::ModelPoisoning, Severity::Critical))
                .await
        );

        assert_eq!(resp.action, actions::MONITOR);
        assert!(!resp.consensus);
        assert_eq!(coord.alerts().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_critical_consensus_blocks_and_alerts() {
        let (coord, _) = coordinator(
            ScriptedRouter::new()
                .respond("claude", vote("blocked"))
                .respond("gemini", vote("blocked"))
                .respond("deepseek", vote("monitor")),
        );
        let t = threat(ThreatCategory::ZeroDay, Severity::Critical);
        let resp = coord.process_threat(&t).await.unwrap();

        assert_eq!(resp.action, actions::BLOCKED);
        assert!(resp.consensus);

        let alerts = coord.alerts().recent_alerts(chrono::Duration::minutes(1));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].priority, AlertPriority::Critical);
        assert_eq!(alerts[0].threat.id, t.id);
    }

    #[tokio::test]
    async fn test_non_critical_uses_plurality() {
        let (coord, _) = coordinator(
            ScriptedRouter::new()
                .respond("claude", vote("monitor"))
                .respond("gemini", vote("patch_deployed"))
                .respond("deepseek", vote("patch_deployed")),
        );
        let resp = coord
            .process_threat(&threat(ThreatCategory::ZeroDay, Severity::Medium))
            .await
            .unwrap();

        assert_eq!(resp.action, actions::PATCH_DEPLOYED);
        assert!(!resp.consensus);
        assert!(resp.details.contains_key("claude_analysis"));
        assert!(resp.details.contains_key("deepseek_confidence"));
        assert_eq!(coord.alerts().pending_count(), 1);
        assert!(coord.history().average_response_time() >= 0.0);
    }

    #[tokio::test]
    async fn test_no_responses_is_error() {
        let (coord, _) = coordinator(ScriptedRouter::new().fail("claude").fail("gemini"));
        let result = coord
            .process_threat(&threat(ThreatCategory::Unclassified, Severity::Low))
            .await;

        assert!(matches!(result, Err(DefenseError::NoResponses)));
        assert!(coord.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_uses_partial_results() {
        let (coord, _) = coordinator(
            ScriptedRouter::new()
                .respond("claude", vote("blocked"))
                .respond("gemini", vote("blocked"))
                .delayed("deepseek", Duration::from_secs(60), vote("monitor")),
        );

        let started = Instant::now();
        let resp = coord
            .process_threat(&threat(ThreatCategory::ZeroDay, Severity::Critical))
            .await
            .unwrap();

        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(resp.action, actions::BLOCKED);
        assert_eq!(resp.reason, "Consensus reached by 2/2 AIs");
        assert!(!resp.details.contains_key("deepseek_analysis"));
    }

    #[tokio::test]
    async fn test_tasks_carry_threat_and_context() {
        let (coord, router) = coordinator(ScriptedRouter::new().respond("gpt-4o", vote("flagged")));
        let t = threat(ThreatCategory::Deepfake, Severity::High);
        coord.process_threat(&t).await.unwrap();

        let calls = router.calls();
        assert_eq!(calls.len(), 1);
        let task = &calls[0];
        assert_eq!(task.backend, "gpt-4o");
        assert_eq!(task.kind, TaskKind::RealtimeDefense);
        assert_eq!(task.payload["threat_id"], json!(t.id));
        assert_eq!(task.payload["threat_type"], json!("deepfake"));
        assert_eq!(task.payload["severity"], json!("high"));
        assert_eq!(task.payload["context"]["total_today"], json!(1));
        assert!(task.deadline.is_some());
    }

    #[tokio::test]
    async fn test_required_backends_override_roster() {
        let (coord, router) = coordinator(
            ScriptedRouter::new()
                .respond("sentinel", vote("blocked"))
                .respond("claude", vote("monitor")),
        );
        let t = threat(ThreatCategory::Exploit, Severity::Low).requiring(["sentinel"]);
        let resp = coord.process_threat(&t).await.unwrap();

        assert_eq!(resp.action, actions::BLOCKED);
        assert_eq!(router.calls().len(), 1);
        assert_eq!(router.calls()[0].backend, "sentinel");
    }

    #[tokio::test]
    async fn test_intake_overflow_drops_newest() {
        let (coord, _) = coordinator(ScriptedRouter::new());
        for i in 0..101 {
            coord.submit_threat(
                threat(ThreatCategory::Exploit, Severity::Low).with_id(format!("t{i}")),
            );
        }

        let status = coord.status();
        assert_eq!(status.intake_dropped, 1);
        assert_eq!(status.active_threats, 100);

        let mut stream = coord.take_threat_stream().unwrap();
        for i in 0..100 {
            assert_eq!(stream.try_recv().unwrap().id, format!("t{i}"));
        }
        assert!(stream.try_recv().is_err());
        assert!(coord.take_threat_stream().is_none());
    }

    #[tokio::test]
    async fn test_intake_worker_processes_queue() {
        let (coord, _) = coordinator(
            ScriptedRouter::new()
                .respond("claude", vote("monitor"))
                .respond("gemini", vote("monitor")),
        );
        let coord = Arc::new(coord);
        let worker = coord.spawn_intake_worker().unwrap();
        assert!(coord.spawn_intake_worker().is_none());

        coord.submit_threat(threat(ThreatCategory::Unclassified, Severity::Low));
        for _ in 0..100 {
            if coord.status().cache_size == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coord.status().cache_size, 1);
        worker.abort();
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = DefenseConfig {
            intake_capacity: 0,
            ..Default::default()
        };
        let result = DefenseCoordinator::new(config, Arc::new(ScriptedRouter::new()));
        assert!(matches!(result, Err(DefenseError::Config(_))));
    }
}
