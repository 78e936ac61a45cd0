//! Threat History
//!
//! Bounded, insertion-ordered log of observed threats and their response
//! latencies. Windowed queries scan backwards from the newest record and
//! stop at the first one outside the window, so records must only ever be
//! appended.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::config::HistoryConfig;
use crate::{ThreatCategory, ThreatEvent};

#[derive(Debug, Clone, Serialize)]
pub struct ThreatRecord {
    pub threat: ThreatEvent,
    /// Measured response latency, once known
    pub response_time_ms: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Historical context handed to analysis backends
#[derive(Debug, Clone, Serialize, Default)]
pub struct HistoryContext {
    /// Threats per category in the last hour
    pub threat_counts_1h: BTreeMap<ThreatCategory, usize>,
    /// Same-category threats from the last hour, newest first
    pub similar_recent: Vec<ThreatRecord>,
    pub total_today: usize,
}

pub struct ThreatHistory {
    log: RwLock<HistoryLog>,
    config: HistoryConfig,
}

#[derive(Default)]
struct HistoryLog {
    records: VecDeque<ThreatRecord>,
    response_times: VecDeque<f64>,
}

impl HistoryLog {
    fn count_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.records
            .iter()
            .rev()
            .take_while(|r| r.recorded_at >= cutoff)
            .count()
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl ThreatHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            log: RwLock::new(HistoryLog::default()),
            config,
        }
    }

    pub fn record(&self, threat: ThreatEvent) {
        self.record_at(threat, Utc::now());
    }

    pub(crate) fn record_at(&self, threat: ThreatEvent, at: DateTime<Utc>) {
        let mut log = self.log.write();
        log.records.push_back(ThreatRecord {
            threat,
            response_time_ms: None,
            recorded_at: at,
        });
        while log.records.len() > self.config.max_records {
            log.records.pop_front();
        }
    }

    /// Attach a latency to the newest record for `threat_id`.
    ///
    /// Returns false when no such record is retained.
    pub fn record_response(&self, threat_id: &str, response_time_ms: f64) -> bool {
        let mut log = self.log.write();
        let Some(record) = log
            .records
            .iter_mut()
            .rev()
            .find(|r| r.threat.id == threat_id)
        else {
            return false;
        };
        record.response_time_ms = Some(response_time_ms);

        log.response_times.push_back(response_time_ms);
        while log.response_times.len() > self.config.max_response_times {
            log.response_times.pop_front();
        }
        true
    }

    /// Most recent earlier records of the same category, oldest first
    pub fn similar(&self, threat: &ThreatEvent) -> Vec<ThreatRecord> {
        let log = self.log.read();
        let mut similar: Vec<ThreatRecord> = log
            .records
            .iter()
            .rev()
            .filter(|r| r.threat.category == threat.category && r.threat.id != threat.id)
            .take(self.config.similar_limit)
            .cloned()
            .collect();
        similar.reverse();
        similar
    }

    pub fn context(&self, threat: &ThreatEvent) -> HistoryContext {
        self.context_at(threat, Utc::now())
    }

    pub(crate) fn context_at(&self, threat: &ThreatEvent, now: DateTime<Utc>) -> HistoryContext {
        let log = self.log.read();
        let hour_ago = now - Duration::hours(1);
        let mut context = HistoryContext::default();

        for record in log.records.iter().rev() {
            if record.recorded_at < hour_ago {
                break;
            }
            *context
                .threat_counts_1h
                .entry(record.threat.category)
                .or_insert(0) += 1;
            if record.threat.category == threat.category && record.threat.id != threat.id {
                context.similar_recent.push(record.clone());
            }
        }
        context.total_today = log.count_since(start_of_day(now));
        context
    }

    /// Threats recorded since UTC midnight
    pub fn count_today(&self) -> usize {
        self.count_today_at(Utc::now())
    }

    pub(crate) fn count_today_at(&self, now: DateTime<Utc>) -> usize {
        self.log.read().count_since(start_of_day(now))
    }

    /// Mean of the retained response latencies, 0 when none
    pub fn average_response_time(&self) -> f64 {
        let log = self.log.read();
        if log.response_times.is_empty() {
            return 0.0;
        }
        log.response_times.iter().sum::<f64>() / log.response_times.len() as f64
    }

    pub fn len(&self) -> usize {
        self.log.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().records.is_empty()
    }
}

impl Default for ThreatHistory {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}
