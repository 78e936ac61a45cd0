//! Verdict Voting
//!
//! Combines backend verdicts into one decision. Verdicts are kept in
//! roster order, and vote ties go to the action first proposed in that
//! order, so identical inputs always produce the same winner.

use std::collections::HashMap;

use crate::router::AnalysisResponse;
use crate::{actions, DefenseError, DefenseResponse, DefenseResult};

/// Verdicts gathered from one fan-out, in roster order
#[derive(Debug, Clone, Default)]
pub struct BackendVerdicts {
    entries: Vec<(String, AnalysisResponse)>,
}

impl BackendVerdicts {
    /// Order `collected` by `roster`, dropping backends that did not answer
    pub fn from_roster(roster: &[String], mut collected: HashMap<String, AnalysisResponse>) -> Self {
        let entries = roster
            .iter()
            .filter_map(|backend| {
                collected
                    .remove(backend)
                    .map(|resp| (backend.clone(), resp))
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, backend: &str) -> Option<&AnalysisResponse> {
        self.entries
            .iter()
            .find(|(name, _)| name == backend)
            .map(|(_, resp)| resp)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AnalysisResponse)> {
        self.entries.iter().map(|(name, resp)| (name.as_str(), resp))
    }

    pub fn backends(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl FromIterator<(String, AnalysisResponse)> for BackendVerdicts {
    fn from_iter<T: IntoIterator<Item = (String, AnalysisResponse)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Vote count per proposed action, most votes first.
///
/// Abstentions (empty action) are not counted.
pub fn tally(verdicts: &BackendVerdicts) -> Vec<(String, usize)> {
    let mut votes: Vec<(String, usize)> = Vec::new();
    for (_, resp) in verdicts.iter() {
        if resp.action.is_empty() {
            continue;
        }
        match votes.iter_mut().find(|(action, _)| *action == resp.action) {
            Some((_, count)) => *count += 1,
            None => votes.push((resp.action.clone(), 1)),
        }
    }
    // Stable sort keeps first-proposed order among equal counts
    votes.sort_by(|a, b| b.1.cmp(&a.1));
    votes
}

/// Diagnostic payload from every backend
pub fn extract_details(verdicts: &BackendVerdicts) -> HashMap<String, serde_json::Value> {
    let mut details = HashMap::new();
    for (backend, resp) in verdicts.iter() {
        details.insert(format!("{backend}_analysis"), resp.analysis_value());
        if resp.confidence > 0.0 {
            details.insert(format!("{backend}_confidence"), serde_json::json!(resp.confidence));
        }
    }
    details
}

/// Strict-majority vote used for critical threats.
///
/// Never escalates without a majority: a split vote resolves to monitor.
pub fn rapid_consensus(verdicts: &BackendVerdicts) -> DefenseResult<DefenseResponse> {
    let total = verdicts.len();
    if total < 2 {
        return Err(DefenseError::InsufficientResponses { received: total });
    }

    let needed = total / 2 + 1;
    let (best_action, best_votes) = tally(verdicts)
        .into_iter()
        .next()
        .unwrap_or_else(|| (String::new(), 0));

    if best_votes < needed {
        return Ok(DefenseResponse::new(
            actions::MONITOR,
            format!(
                "No consensus reached on critical threat (top vote {}/{}, majority needs {})",
                best_votes, total, needed
            ),
        )
        .with_consensus(false)
        .with_details(extract_details(verdicts)));
    }

    Ok(DefenseResponse::new(
        best_action,
        format!("Consensus reached by {}/{} AIs", best_votes, total),
    )
    .with_consensus(true)
    .with_details(extract_details(verdicts)))
}

/// Plurality vote used for non-critical threats
pub fn correlate(verdicts: &BackendVerdicts) -> DefenseResult<DefenseResponse> {
    if verdicts.is_empty() {
        return Err(DefenseError::NoResponses);
    }

    let (action, rule_reason) = match tally(verdicts).into_iter().next() {
        Some((action, votes)) => (
            action.clone(),
            format!(
                "Correlation plurality: {} proposed by {}/{} backends",
                action,
                votes,
                verdicts.len()
            ),
        ),
        None => (
            actions::MONITOR.to_string(),
            "Correlation found no proposed action; defaulting to monitor".to_string(),
        ),
    };

    Ok(
        DefenseResponse::new(action, format!("{}. {}", rule_reason, primary_reason(verdicts)))
            .with_details(extract_details(verdicts)),
    )
}

/// First explanation in roster order
fn primary_reason(verdicts: &BackendVerdicts) -> String {
    verdicts
        .iter()
        .find(|(_, resp)| !resp.explanation.is_empty())
        .map(|(backend, resp)| format!("{}: {}", backend, resp.explanation))
        .unwrap_or_else(|| "AI analysis completed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verdicts(list: &[(&str, &str)]) -> BackendVerdicts {
        list.iter()
            .map(|(backend, action)| {
                (backend.to_string(), AnalysisResponse::new(*action, 0.8))
            })
            .collect()
    }

    #[test]
    fn test_from_roster_orders_and_filters() {
        let mut collected = HashMap::new();
        collected.insert("gemini".to_string(), AnalysisResponse::new("blocked", 0.9));
        collected.insert("claude".to_string(), AnalysisResponse::new("monitor", 0.4));
        let roster = vec!["claude".to_string(), "deepseek".to_string(), "gemini".to_string()];

        let v = BackendVerdicts::from_roster(&roster, collected);
        assert_eq!(v.backends(), vec!["claude", "gemini"]);
    }

    #[test]
    fn test_consensus_requires_two_responses() {
        let err = rapid_consensus(&verdicts(&[("claude", "blocked")])).unwrap_err();
        assert!(matches!(err, DefenseError::InsufficientResponses { received: 1 }));
        assert!(rapid_consensus(&BackendVerdicts::default()).is_err());
    }

    #[test]
    fn test_consensus_split_defaults_to_monitor() {
        let resp = rapid_consensus(&verdicts(&[("claude", "blocked"), ("gemini", "monitor")])).unwrap();
        assert_eq!(resp.action, actions::MONITOR);
        assert!(!resp.consensus);
        assert!(resp.reason.contains("No consensus"));
    }

    #[test]
    fn test_consensus_majority_wins() {
        let resp = rapid_consensus(&verdicts(&[
            ("claude", "blocked"),
            ("gemini", "blocked"),
            ("deepseek", "monitor"),
        ]))
        .unwrap();
        assert_eq!(resp.action, "blocked");
        assert!(resp.consensus);
        assert_eq!(resp.reason, "Consensus reached by 2/3 AIs");
    }

    #[test]
    fn test_consensus_abstentions_count_toward_total() {
        // 2 of 4 is not a strict majority
        let resp = rapid_consensus(&verdicts(&[
            ("a", "blocked"),
            ("b", "blocked"),
            ("c", ""),
            ("d", ""),
        ]))
        .unwrap();
        assert_eq!(resp.action, actions::MONITOR);
        assert!(!resp.consensus);
    }

    #[test]
    fn test_correlation_plurality() {
        let resp = correlate(&verdicts(&[
            ("a", "monitor"),
            ("b", "blocked"),
            ("c", "blocked"),
            ("d", "flagged"),
        ]))
        .unwrap();
        assert_eq!(resp.action, "blocked");
        assert!(!resp.consensus);
        assert!(resp.reason.starts_with("Correlation plurality: blocked proposed by 2/4"));
    }

    #[test]
    fn test_correlation_tie_goes_to_roster_order() {
        let first = correlate(&verdicts(&[("claude", "monitor"), ("gemini", "blocked")])).unwrap();
        assert_eq!(first.action, "monitor");

        let swapped = correlate(&verdicts(&[("claude", "blocked"), ("gemini", "monitor")])).unwrap();
        assert_eq!(swapped.action, "blocked");
    }

    #[test]
    fn test_correlation_without_actions_monitors() {
        let resp = correlate(&verdicts(&[("claude", ""), ("gemini", "")])).unwrap();
        assert_eq!(resp.action, actions::MONITOR);
        assert!(resp.reason.ends_with("AI analysis completed"));
    }

    #[test]
    fn test_correlation_requires_a_response() {
        assert!(matches!(
            correlate(&BackendVerdicts::default()),
            Err(DefenseError::NoResponses)
        ));
    }

    #[test]
    fn test_details_and_reason() {
        let v: BackendVerdicts = vec![
            (
                "claude".to_string(),
                AnalysisResponse::new("blocked", 0.0).with_analysis("family", json!("emotet")),
            ),
            (
                "gemini".to_string(),
                AnalysisResponse::new("blocked", 0.7).with_explanation("known loader"),
            ),
        ]
        .into_iter()
        .collect();

        let resp = correlate(&v).unwrap();
        assert_eq!(resp.details["claude_analysis"], json!({"family": "emotet"}));
        assert!(!resp.details.contains_key("claude_confidence"));
        assert_eq!(resp.details["gemini_confidence"], json!(0.7));
        assert!(resp.reason.ends_with("gemini: known loader"));
    }
}
