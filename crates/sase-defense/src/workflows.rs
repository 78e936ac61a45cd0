//! Threat-Pattern Workflows
//!
//! Category-specific decision pipelines. Each one talks to designated
//! backends directly instead of the roster-wide fan-out vote:
//!
//! - exploit: scan, correlate with history, patch on a confident match
//! - prompt injection: both paired backends must flag it
//! - deepfake: confidence tiers from one visual backend
//! - polymorphic: three facets, signature emitted on evolving behavior

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

use crate::coordinator::DefenseCoordinator;
use crate::router::{route_within, AnalysisResponse, AnalysisTask, RouterError, TaskKind};
use crate::{actions, DefenseError, DefenseResponse, DefenseResult, ThreatCategory, ThreatEvent};

/// Correlation confidence above which a remediation is generated
pub const EXPLOIT_PATCH_THRESHOLD: f64 = 0.7;
/// Behavioral-evolution confidence above which a signature is emitted
pub const POLYMORPHIC_SIGNATURE_THRESHOLD: f64 = 0.7;
pub const DEEPFAKE_BLOCK_THRESHOLD: f64 = 0.8;
pub const DEEPFAKE_FLAG_THRESHOLD: f64 = 0.5;

pub struct PatternWorkflows {
    coordinator: Arc<DefenseCoordinator>,
}

impl PatternWorkflows {
    pub fn new(coordinator: Arc<DefenseCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<DefenseCoordinator> {
        &self.coordinator
    }

    /// Run the workflow for the threat's category.
    ///
    /// Categories without a bespoke workflow go through
    /// [`DefenseCoordinator::process_threat`].
    pub async fn defend(&self, threat: &ThreatEvent) -> DefenseResult<DefenseResponse> {
        let outcome = match threat.category {
            ThreatCategory::Exploit => {
                self.coordinator.history().record(threat.clone());
                self.defend_exploit(threat).await
            }
            ThreatCategory::PromptInjection => {
                self.coordinator.history().record(threat.clone());
                self.defend_prompt_injection(threat).await
            }
            ThreatCategory::Deepfake => {
                self.coordinator.history().record(threat.clone());
                self.defend_deepfake(threat).await
            }
            ThreatCategory::PolymorphicMalware => {
                self.coordinator.history().record(threat.clone());
                self.defend_polymorphic(threat).await
            }
            _ => return self.coordinator.process_threat(threat).await,
        };

        match outcome {
            Ok(response) => {
                tracing::info!(
                    "Workflow {} for threat {} -> {}",
                    threat.category,
                    threat.id,
                    response.action
                );
                self.coordinator.conclude(threat, &response);
                Ok(response)
            }
            Err(e) => {
                tracing::error!("Workflow {} for threat {} failed: {}", threat.category, threat.id, e);
                Err(e)
            }
        }
    }

    /// Scan → correlate → remediate
    pub async fn defend_exploit(&self, threat: &ThreatEvent) -> DefenseResult<DefenseResponse> {
        let start = Instant::now();
        let deadline = self.coordinator.deadline_for(threat.severity);
        let backends = &self.coordinator.config().workflows;

        let scan = self
            .dispatch(
                AnalysisTask::critical(
                    TaskKind::BulkScan,
                    &backends.exploit_scan,
                    json!({
                        "pattern": threat.payload,
                        "scope": "active_memory",
                        "scan_type": "exploit_signature",
                    }),
                ),
                deadline,
            )
            .await
            .map_err(|source| DefenseError::Stage { stage: "scan", source })?;

        let correlation = self
            .dispatch(
                AnalysisTask::critical(
                    TaskKind::Correlate,
                    &backends.exploit_correlate,
                    json!({
                        "current": scan.analysis_value(),
                        "historical": self.coordinator.history().similar(threat),
                        "cve_check": true,
                    }),
                ),
                deadline,
            )
            .await
            .map_err(|source| DefenseError::Stage {
                stage: "correlation",
                source,
            })?;

        if correlation.confidence <= EXPLOIT_PATCH_THRESHOLD {
            return Ok(DefenseResponse::new(
                actions::MONITOR,
                "Potential exploit detected but confidence too low for auto-patch",
            )
            .with_detail("confidence", json!(correlation.confidence))
            .with_detail("analysis", correlation.analysis_value())
            .with_time_ms(since_ms(start)));
        }

        let remediation = self
            .dispatch(
                AnalysisTask::critical(
                    TaskKind::Generate,
                    &backends.exploit_remediation,
                    json!({
                        "vulnerability": correlation.analysis_value(),
                        "priority": "critical",
                        "patch_type": "immediate",
                    }),
                ),
                deadline,
            )
            .await
            .map_err(|source| DefenseError::Stage {
                stage: "patch generation",
                source,
            })?;

        Ok(DefenseResponse::new(
            actions::PATCH_DEPLOYED,
            format!(
                "Exploit detected and patched (CVE match: {:.0}%)",
                correlation.confidence * 100.0
            ),
        )
        .with_detail("scan_results", scan.analysis_value())
        .with_detail("correlation_match", correlation.analysis_value())
        .with_detail("patch_generated", json!(remediation.result.is_some()))
        .with_patch(remediation.result)
        .with_time_ms(since_ms(start)))
    }

    /// Block only when both paired backends flag an injection
    pub async fn defend_prompt_injection(
        &self,
        threat: &ThreatEvent,
    ) -> DefenseResult<DefenseResponse> {
        let start = Instant::now();
        let deadline = self.coordinator.deadline_for(threat.severity);
        let pair = self.coordinator.config().workflows.injection_pair.to_vec();

        let verdicts = self.coordinator.fan_out(threat, &pair, deadline).await;
        let (first, second) = (&pair[0], &pair[1]);

        let (Some(first_resp), Some(second_resp)) = (verdicts.get(first), verdicts.get(second))
        else {
            return Ok(DefenseResponse::new(
                actions::MONITOR,
                "Insufficient AI consensus (missing responses)",
            )
            .with_consensus(false)
            .with_time_ms(since_ms(start)));
        };

        let first_detected = flags_injection(first_resp);
        let second_detected = flags_injection(second_resp);

        if first_detected && second_detected {
            let patterns = injection_patterns([first_resp, second_resp]);
            return Ok(DefenseResponse::new(
                actions::BLOCKED,
                "Prompt injection confirmed by AI consensus",
            )
            .with_consensus(true)
            .with_detail(&format!("{first}_analysis"), first_resp.analysis_value())
            .with_detail(&format!("{second}_analysis"), second_resp.analysis_value())
            .with_detail("injection_patterns", json!(patterns))
            .with_time_ms(since_ms(start)));
        }

        Ok(
            DefenseResponse::new(actions::MONITOR, "No consensus on prompt injection threat")
                .with_consensus(false)
                .with_detail(&format!("{first}_detected"), json!(first_detected))
                .with_detail(&format!("{second}_detected"), json!(second_detected))
                .with_time_ms(since_ms(start)),
        )
    }

    /// Tiered on visual-manipulation confidence; never passes an unanalyzed sample
    pub async fn defend_deepfake(&self, threat: &ThreatEvent) -> DefenseResult<DefenseResponse> {
        let start = Instant::now();
        let deadline = self.coordinator.deadline_for(threat.severity);
        let visual = &self.coordinator.config().workflows.visual;

        let task = AnalysisTask::critical(
            TaskKind::Visual,
            visual,
            json!({
                "image_data": threat.payload,
                "analysis_type": "deepfake_detection",
                "check_metadata": true,
            }),
        );
        let detection = match self.dispatch(task, deadline).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("Visual analysis unavailable for threat {}: {}", threat.id, e);
                return Ok(DefenseResponse::new(
                    actions::UNAVAILABLE,
                    format!("Visual analysis backend ({visual}) not available"),
                )
                .with_time_ms(since_ms(start)));
            }
        };

        let confidence = detection
            .analysis
            .get("deepfake_confidence")
            .and_then(Value::as_f64)
            .unwrap_or(detection.confidence);

        let response = if confidence >= DEEPFAKE_BLOCK_THRESHOLD {
            let field = |key: &str| detection.analysis.get(key).cloned().unwrap_or(Value::Null);
            DefenseResponse::new(
                actions::BLOCKED,
                format!(
                    "Deepfake detected with high confidence ({:.0}%)",
                    confidence * 100.0
                ),
            )
            .with_detail("manipulation_type", field("manipulation_type"))
            .with_detail("artifacts_found", field("artifacts"))
            .with_detail("metadata_analysis", field("metadata"))
        } else if confidence >= DEEPFAKE_FLAG_THRESHOLD {
            DefenseResponse::new(
                actions::FLAGGED,
                format!("Potential deepfake detected ({:.0}% confidence)", confidence * 100.0),
            )
            .with_details(detection.analysis.clone())
        } else {
            DefenseResponse::new(actions::PASSED, "No deepfake indicators detected")
                .with_detail("confidence", json!(confidence))
        };

        Ok(response.with_time_ms(since_ms(start)))
    }

    /// Structure, behavior and signature facets analyzed concurrently
    pub async fn defend_polymorphic(&self, threat: &ThreatEvent) -> DefenseResult<DefenseResponse> {
        let start = Instant::now();
        let deadline = self.coordinator.deadline_for(threat.severity);
        let backends = &self.coordinator.config().workflows;

        let (structure, behavior, signature) = tokio::join!(
            self.dispatch(
                AnalysisTask::critical(
                    TaskKind::Visual,
                    &backends.polymorphic_structure,
                    json!({"code_visualization": threat.payload, "detect_mutations": true}),
                ),
                deadline,
            ),
            self.dispatch(
                AnalysisTask::critical(
                    TaskKind::Analyze,
                    &backends.polymorphic_behavior,
                    json!({"behavior_analysis": threat.payload, "track_evolution": true}),
                ),
                deadline,
            ),
            self.dispatch(
                AnalysisTask::critical(
                    TaskKind::Generate,
                    &backends.polymorphic_signature,
                    json!({"signature_type": "polymorphic", "base_pattern": threat.payload}),
                ),
                deadline,
            ),
        );
        let (structure, behavior, signature) = (structure.ok(), behavior.ok(), signature.ok());

        let answered = [&structure, &behavior, &signature]
            .iter()
            .filter(|r| r.is_some())
            .count();
        if answered < 2 {
            return Ok(DefenseResponse::new(
                actions::MONITOR,
                "Insufficient AI analysis for polymorphic detection",
            )
            .with_time_ms(since_ms(start)));
        }

        let evolving = behavior
            .as_ref()
            .filter(|b| b.confidence > POLYMORPHIC_SIGNATURE_THRESHOLD);
        let new_signature = signature.as_ref().and_then(|s| s.result.clone());

        if let (Some(evolving), Some(new_signature)) = (evolving, new_signature) {
            return Ok(DefenseResponse::new(
                actions::SIGNATURE_UPDATED,
                "Polymorphic malware detected and signature generated",
            )
            .with_patch(Some(new_signature))
            .with_detail("mutation_patterns", evolving.analysis_value())
            .with_detail(
                "visual_analysis",
                structure
                    .as_ref()
                    .map(AnalysisResponse::analysis_value)
                    .unwrap_or(Value::Null),
            )
            .with_time_ms(since_ms(start)));
        }

        let mut details = HashMap::new();
        let facets = [
            (&backends.polymorphic_structure, &structure),
            (&backends.polymorphic_behavior, &behavior),
            (&backends.polymorphic_signature, &signature),
        ];
        for (backend, resp) in facets {
            if let Some(resp) = resp {
                details.insert(
                    backend.clone(),
                    json!({"confidence": resp.confidence, "analysis": resp.analysis_value()}),
                );
            }
        }

        Ok(DefenseResponse::new(
            actions::MONITOR,
            "Polymorphic behavior suspected but not confirmed",
        )
        .with_details(details)
        .with_time_ms(since_ms(start)))
    }

    async fn dispatch(
        &self,
        task: AnalysisTask,
        deadline: Instant,
    ) -> Result<AnalysisResponse, RouterError> {
        let (kind, backend) = (task.kind, task.backend.clone());
        let result = route_within(
            self.coordinator.router().as_ref(),
            task.with_deadline(deadline),
        )
        .await;
        if let Err(e) = &result {
            tracing::debug!("{:?} task on {} failed: {}", kind, backend, e);
        }
        result
    }
}

fn since_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn flags_injection(resp: &AnalysisResponse) -> bool {
    resp.analysis.get("injection_detected") == Some(&Value::Bool(true))
}

/// Union of reported patterns, first occurrence order
fn injection_patterns<'a>(responses: impl IntoIterator<Item = &'a AnalysisResponse>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for resp in responses {
        let Some(patterns) = resp.analysis.get("patterns").and_then(Value::as_array) else {
            continue;
        };
        for pattern in patterns.iter().filter_map(Value::as_str) {
            if !unique.iter().any(|p| p == pattern) {
                unique.push(pattern.to_string());
            }
        }
    }
    unique
}
