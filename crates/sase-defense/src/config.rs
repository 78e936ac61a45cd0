//! Defense Configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{DefenseError, DefenseResult, Severity, ThreatCategory};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenseConfig {
    /// Response cache
    pub cache: CacheConfig,
    /// Threat history
    pub history: HistoryConfig,
    /// Alert log
    pub alerts: AlertConfig,
    /// Intake queue capacity
    pub intake_capacity: usize,
    /// Deadlines per severity
    pub timeouts: SeverityTimeouts,
    /// Category to backend mapping
    pub roster: BackendRoster,
    /// Backends used by the category workflows
    pub workflows: WorkflowBackends,
    /// Analysis gateway
    pub router: RouterConfig,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            history: HistoryConfig::default(),
            alerts: AlertConfig::default(),
            intake_capacity: 100,
            timeouts: SeverityTimeouts::default(),
            roster: BackendRoster::default(),
            workflows: WorkflowBackends::default(),
            router: RouterConfig::default(),
        }
    }
}

impl DefenseConfig {
    /// Load from file
    pub fn load(path: &str) -> DefenseResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: &str) -> DefenseResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> DefenseResult<()> {
        if self.intake_capacity == 0 {
            return Err(DefenseError::Config("intake_capacity must be positive".into()));
        }
        if self.cache.ttl_secs == 0 || self.cache.sweep_interval_secs == 0 {
            return Err(DefenseError::Config("cache ttl and sweep interval must be positive".into()));
        }
        if self.history.max_records == 0 || self.history.max_response_times == 0 {
            return Err(DefenseError::Config("history bounds must be positive".into()));
        }
        if self.alerts.max_alerts == 0 {
            return Err(DefenseError::Config("alerts.max_alerts must be positive".into()));
        }
        if self.roster.fallback.is_empty() {
            return Err(DefenseError::Config("roster.fallback must name at least one backend".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_records: usize,
    pub max_response_times: usize,
    pub similar_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_response_times: 1_000,
            similar_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub max_alerts: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { max_alerts: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityTimeouts {
    pub critical_secs: u64,
    pub high_secs: u64,
    pub medium_secs: u64,
    pub default_secs: u64,
}

impl Default for SeverityTimeouts {
    fn default() -> Self {
        Self {
            critical_secs: 5,
            high_secs: 10,
            medium_secs: 20,
            default_secs: 30,
        }
    }
}

impl SeverityTimeouts {
    /// Total processing budget for a threat of `severity`
    pub fn for_severity(&self, severity: Severity) -> Duration {
        let secs = match severity {
            Severity::Critical => self.critical_secs,
            Severity::High => self.high_secs,
            Severity::Medium => self.medium_secs,
            Severity::Low => self.default_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Which backends analyze which category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendRoster {
    pub categories: HashMap<ThreatCategory, Vec<String>>,
    /// Used for categories without an entry
    pub fallback: Vec<String>,
}

impl Default for BackendRoster {
    fn default() -> Self {
        let mut categories = HashMap::new();
        categories.insert(ThreatCategory::Exploit, names(&["deepseek", "gemini", "claude"]));
        categories.insert(ThreatCategory::PolymorphicMalware, names(&["gpt-4o", "gemini", "claude"]));
        categories.insert(ThreatCategory::PromptInjection, names(&["claude", "gemini"]));
        categories.insert(ThreatCategory::Deepfake, names(&["gpt-4o"]));
        categories.insert(ThreatCategory::ModelPoisoning, names(&["gemini", "claude"]));
        categories.insert(ThreatCategory::ZeroDay, names(&["claude", "gemini", "deepseek"]));

        Self {
            categories,
            fallback: names(&["claude", "gemini"]),
        }
    }
}

impl BackendRoster {
    /// Ordered backend list for a category
    pub fn backends_for(&self, category: ThreatCategory) -> Vec<String> {
        match self.categories.get(&category) {
            Some(backends) if !backends.is_empty() => backends.clone(),
            _ => self.fallback.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowBackends {
    pub exploit_scan: String,
    pub exploit_correlate: String,
    pub exploit_remediation: String,
    pub injection_pair: [String; 2],
    pub visual: String,
    pub polymorphic_structure: String,
    pub polymorphic_behavior: String,
    pub polymorphic_signature: String,
}

impl Default for WorkflowBackends {
    fn default() -> Self {
        Self {
            exploit_scan: "deepseek".into(),
            exploit_correlate: "gemini".into(),
            exploit_remediation: "claude".into(),
            injection_pair: ["claude".into(), "gemini".into()],
            visual: "gpt-4o".into(),
            polymorphic_structure: "gpt-4o".into(),
            polymorphic_behavior: "gemini".into(),
            polymorphic_signature: "claude".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub endpoint: String,
    pub request_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8700".into(),
            request_timeout_secs: 30,
        }
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
