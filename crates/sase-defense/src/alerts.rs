//! Alert Manager
//!
//! Records alerts for blocking decisions and fans them out to listeners.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::AlertConfig;
use crate::{DefenseResponse, Severity, ThreatEvent};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertPriority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl AlertPriority {
    /// Priority for an alert raised on a threat of `severity`
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Self::Critical,
            _ => Self::High,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub priority: AlertPriority,
    pub threat: ThreatEvent,
    pub response: DefenseResponse,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Invoked once per alert on a blocking worker thread
pub type AlertListener = Arc<dyn Fn(&Alert) + Send + Sync>;

pub struct AlertManager {
    log: RwLock<VecDeque<Alert>>,
    listeners: RwLock<Vec<AlertListener>>,
    config: AlertConfig,
    stats: Arc<AlertStats>,
}

#[derive(Default)]
struct AlertStats {
    total_sent: AtomicU64,
    listener_failures: AtomicU64,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            log: RwLock::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            config,
            stats: Arc::new(AlertStats::default()),
        }
    }

    /// Record an alert and notify every listener without waiting on them
    pub fn send_alert(
        &self,
        priority: AlertPriority,
        threat: &ThreatEvent,
        response: &DefenseResponse,
    ) -> Alert {
        let timestamp = Utc::now();
        let alert = Alert {
            id: format!("ALERT-{}-{}", timestamp.timestamp(), threat.id),
            priority,
            threat: threat.clone(),
            response: response.clone(),
            timestamp,
            message: Self::build_message(threat, response),
        };

        tracing::info!("Alert {} ({:?}): {}", alert.id, alert.priority, alert.message);
        self.push(alert.clone());
        self.stats.total_sent.fetch_add(1, Ordering::Relaxed);
        self.notify(&alert);
        alert
    }

    fn push(&self, alert: Alert) {
        let mut log = self.log.write();
        log.push_back(alert);
        while log.len() > self.config.max_alerts {
            log.pop_front();
        }
    }

    fn notify(&self, alert: &Alert) {
        let listeners: Vec<AlertListener> = self.listeners.read().clone();

        for listener in listeners {
            let alert = alert.clone();
            let stats = Arc::clone(&self.stats);
            let deliver = move || {
                if catch_unwind(AssertUnwindSafe(|| listener(&alert))).is_err() {
                    stats.listener_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Alert listener panicked on {}", alert.id);
                }
            };

            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(deliver);
                }
                Err(_) => {
                    std::thread::spawn(deliver);
                }
            }
        }
    }

    pub fn register_listener(&self, listener: AlertListener) {
        self.listeners.write().push(listener);
    }

    /// Alerts raised within `window`, newest first
    pub fn recent_alerts(&self, window: Duration) -> Vec<Alert> {
        let cutoff = Utc::now() - window;
        self.log
            .read()
            .iter()
            .rev()
            .take_while(|a| a.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Alerts currently retained in the log
    pub fn pending_count(&self) -> usize {
        self.log.read().len()
    }

    pub fn total_sent(&self) -> u64 {
        self.stats.total_sent.load(Ordering::Relaxed)
    }

    pub fn listener_failures(&self) -> u64 {
        self.stats.listener_failures.load(Ordering::Relaxed)
    }

    fn build_message(threat: &ThreatEvent, response: &DefenseResponse) -> String {
        format!(
            "[{}] {} threat from {} - Action: {} ({})",
            threat.severity, threat.category, threat.source, response.action, response.reason
        )
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}
