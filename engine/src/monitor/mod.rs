//! Resource monitor
//!
//! Keeps a fixed-size ring of usage samples per plugin and compares each new
//! sample against the plugin's limits. Entering a breach raises one high
//! severity security event; staying in breach does not raise more until the
//! plugin recovers and breaches again.
//!
//! Admission is soft: after a breaching sample, new calls are refused for the
//! throttle window, and admitted again once a healthy sample arrives or the
//! window passes.

use crate::events::{SecurityEvent, SecurityEventStore, SecurityEventType, Severity};
use crate::sync::{lock, read, write};
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::limits::{ResourceDimension, ResourceLimits, ResourceSample};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub plugin_id: String,
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub network_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub admit: bool,
    pub exceeded: Vec<ResourceDimension>,
    /// Event stored when this sample entered a breach; the caller announces it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raised: Option<SecurityEvent>,
}

impl Admission {
    fn open() -> Self {
        Self {
            admit: true,
            exceeded: Vec::new(),
            raised: None,
        }
    }
}

/// Aggregates over the retained samples of one plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub samples: usize,
    pub avg_cpu_pct: f64,
    pub peak_cpu_pct: f64,
    pub avg_memory_mb: f64,
    pub peak_memory_mb: f64,
    pub total_network_bytes: u64,
    pub breaching: bool,
}

struct PluginUsage {
    limits: ResourceLimits,
    samples: VecDeque<ResourceSnapshot>,
    breaching: bool,
    breach_seen_at: Option<Instant>,
    last_exceeded: Vec<ResourceDimension>,
}

pub struct ResourceMonitor {
    plugins: RwLock<HashMap<String, Arc<Mutex<PluginUsage>>>>,
    capacity: usize,
    throttle_window: Duration,
    events: Arc<SecurityEventStore>,
}

impl ResourceMonitor {
    pub fn new(capacity: usize, throttle_window: Duration, events: Arc<SecurityEventStore>) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            throttle_window,
            events,
        }
    }

    fn cell(&self, plugin_id: &str) -> Option<Arc<Mutex<PluginUsage>>> {
        read(&self.plugins).get(plugin_id).map(Arc::clone)
    }

    /// Start tracking `plugin_id` with a fresh, empty ring
    pub fn register(&self, plugin_id: &str, limits: ResourceLimits) {
        let usage = PluginUsage {
            limits,
            samples: VecDeque::with_capacity(self.capacity),
            breaching: false,
            breach_seen_at: None,
            last_exceeded: Vec::new(),
        };
        write(&self.plugins).insert(plugin_id.to_string(), Arc::new(Mutex::new(usage)));
        debug!(plugin_id, "Resource monitor registered");
    }

    pub fn unregister(&self, plugin_id: &str) {
        write(&self.plugins).remove(plugin_id);
    }

    pub fn is_tracked(&self, plugin_id: &str) -> bool {
        read(&self.plugins).contains_key(plugin_id)
    }

    pub fn limits(&self, plugin_id: &str) -> Option<ResourceLimits> {
        self.cell(plugin_id).map(|cell| lock(&cell).limits)
    }

    /// Append a sample and compare it against the plugin's limits
    pub fn record(&self, plugin_id: &str, sample: ResourceSample) -> Result<Admission, EngineError> {
        self.record_at(plugin_id, sample, Instant::now())
    }

    pub fn record_at(
        &self,
        plugin_id: &str,
        sample: ResourceSample,
        now: Instant,
    ) -> Result<Admission, EngineError> {
        let cell = self
            .cell(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource monitor for {}", plugin_id)))?;

        let (exceeded, entered_breach, limits) = {
            let mut usage = lock(&cell);
            if usage.samples.len() == self.capacity {
                usage.samples.pop_front();
            }
            usage.samples.push_back(ResourceSnapshot {
                plugin_id: plugin_id.to_string(),
                cpu_pct: sample.cpu_pct,
                memory_mb: sample.memory_mb,
                network_bytes: sample.network_bytes,
                timestamp: Utc::now(),
            });

            let exceeded = usage.limits.exceeded_by(&sample);
            let entered_breach = !exceeded.is_empty() && !usage.breaching;
            usage.breaching = !exceeded.is_empty();
            usage.breach_seen_at = usage.breaching.then_some(now);
            usage.last_exceeded = exceeded.clone();
            (exceeded, entered_breach, usage.limits)
        };

        let raised = entered_breach.then(|| {
            let detail = describe_breach(&exceeded, &sample, &limits);
            warn!(plugin_id, "Resource limits exceeded: {}", detail);
            self.events.raise(
                plugin_id,
                SecurityEventType::ResourceLimitExceeded,
                Severity::High,
                detail,
            )
        });

        Ok(Admission {
            admit: exceeded.is_empty(),
            exceeded,
            raised,
        })
    }

    /// Pre-admission check before a call starts
    pub fn admit(&self, plugin_id: &str) -> Admission {
        self.admit_at(plugin_id, Instant::now())
    }

    pub fn admit_at(&self, plugin_id: &str, now: Instant) -> Admission {
        let Some(cell) = self.cell(plugin_id) else {
            return Admission::open();
        };
        let usage = lock(&cell);
        match usage.breach_seen_at {
            Some(seen) if usage.breaching && now.duration_since(seen) < self.throttle_window => {
                Admission {
                    admit: false,
                    exceeded: usage.last_exceeded.clone(),
                    raised: None,
                }
            }
            _ => Admission::open(),
        }
    }

    /// Retained samples for one plugin, oldest first
    pub fn get_snapshot(&self, plugin_id: &str) -> Vec<ResourceSnapshot> {
        self.cell(plugin_id)
            .map(|cell| lock(&cell).samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, plugin_id: &str) -> Option<ResourceSnapshot> {
        self.cell(plugin_id)
            .and_then(|cell| lock(&cell).samples.back().cloned())
    }

    pub fn get_all_snapshots(&self) -> HashMap<String, Vec<ResourceSnapshot>> {
        let cells: Vec<(String, Arc<Mutex<PluginUsage>>)> = read(&self.plugins)
            .iter()
            .map(|(id, cell)| (id.clone(), Arc::clone(cell)))
            .collect();

        cells
            .into_iter()
            .map(|(id, cell)| {
                let samples = lock(&cell).samples.iter().cloned().collect();
                (id, samples)
            })
            .collect()
    }

    pub fn summary(&self, plugin_id: &str) -> Option<UsageSummary> {
        let cell = self.cell(plugin_id)?;
        let usage = lock(&cell);
        let n = usage.samples.len();
        if n == 0 {
            return Some(UsageSummary::default());
        }

        let mut summary = UsageSummary {
            samples: n,
            breaching: usage.breaching,
            ..UsageSummary::default()
        };
        for s in &usage.samples {
            summary.avg_cpu_pct += s.cpu_pct;
            summary.avg_memory_mb += s.memory_mb;
            summary.peak_cpu_pct = summary.peak_cpu_pct.max(s.cpu_pct);
            summary.peak_memory_mb = summary.peak_memory_mb.max(s.memory_mb);
            summary.total_network_bytes = summary.total_network_bytes.saturating_add(s.network_bytes);
        }
        summary.avg_cpu_pct /= n as f64;
        summary.avg_memory_mb /= n as f64;
        Some(summary)
    }
}

fn describe_breach(
    exceeded: &[ResourceDimension],
    sample: &ResourceSample,
    limits: &ResourceLimits,
) -> String {
    exceeded
        .iter()
        .map(|dimension| match dimension {
            ResourceDimension::Memory => format!(
                "memory {:.1} MB over limit {} MB",
                sample.memory_mb, limits.max_memory_mb
            ),
            ResourceDimension::Cpu => format!(
                "cpu {:.1}% over limit {}%",
                sample.cpu_pct, limits.max_cpu_percent
            ),
            ResourceDimension::Network => format!(
                "network {} bytes over limit {} bytes",
                sample.network_bytes, limits.max_network_bytes
            ),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use sdk::limits::ResourcePreset;

    fn monitor(capacity: usize) -> (ResourceMonitor, Arc<SecurityEventStore>) {
        let events = Arc::new(SecurityEventStore::new(100));
        let monitor = ResourceMonitor::new(capacity, Duration::from_secs(10), Arc::clone(&events));
        monitor.register("p1", ResourcePreset::Minimal.limits());
        (monitor, events)
    }

    fn memory(mb: f64) -> ResourceSample {
        ResourceSample {
            memory_mb: mb,
            ..ResourceSample::default()
        }
    }

    #[test]
    fn test_healthy_sample_is_admitted() {
        let (monitor, events) = monitor(10);
        let admission = monitor.record("p1", memory(32.0)).unwrap();
        assert!(admission.admit);
        assert!(admission.raised.is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn test_sustained_breach_raises_one_event() {
        let (monitor, events) = monitor(60);
        let first = monitor.record("p1", memory(512.0)).unwrap();
        let mut last = None;
        for _ in 0..9 {
            last = Some(monitor.record("p1", memory(512.0)).unwrap());
        }

        let last = last.unwrap();
        assert!(!last.admit);
        assert_eq!(last.exceeded, vec![ResourceDimension::Memory]);
        assert!(last.raised.is_none());

        let raised = events.list(&EventFilter::default());
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, Severity::High);
        assert_eq!(raised[0].event_type, SecurityEventType::ResourceLimitExceeded);
        assert_eq!(first.raised.as_ref(), Some(&raised[0]));
    }

    #[test]
    fn test_new_breach_after_recovery_raises_again() {
        let (monitor, events) = monitor(60);
        monitor.record("p1", memory(512.0)).unwrap();
        monitor.record("p1", memory(10.0)).unwrap();
        monitor.record("p1", memory(512.0)).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_ring_buffer_keeps_capacity() {
        let (monitor, _) = monitor(3);
        for i in 0..5 {
            monitor.record("p1", memory(i as f64)).unwrap();
        }
        let samples = monitor.get_snapshot("p1");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].memory_mb, 2.0);
        assert_eq!(monitor.latest("p1").unwrap().memory_mb, 4.0);
    }

    #[test]
    fn test_admission_throttles_within_window() {
        let (monitor, _) = monitor(10);
        let start = Instant::now();
        monitor.record_at("p1", memory(512.0), start).unwrap();

        assert!(!monitor.admit_at("p1", start + Duration::from_secs(1)).admit);
        assert!(monitor.admit_at("p1", start + Duration::from_secs(11)).admit);

        monitor.record_at("p1", memory(1.0), start).unwrap();
        assert!(monitor.admit_at("p1", start).admit);
    }

    #[test]
    fn test_unknown_plugin() {
        let (monitor, _) = monitor(10);
        assert!(matches!(
            monitor.record("ghost", memory(1.0)),
            Err(EngineError::NotFound(_))
        ));
        assert!(monitor.get_snapshot("ghost").is_empty());
    }

    #[test]
    fn test_summary() {
        let (monitor, _) = monitor(10);
        monitor
            .record(
                "p1",
                ResourceSample {
                    cpu_pct: 4.0,
                    memory_mb: 20.0,
                    network_bytes: 100,
                },
            )
            .unwrap();
        monitor
            .record(
                "p1",
                ResourceSample {
                    cpu_pct: 8.0,
                    memory_mb: 40.0,
                    network_bytes: 50,
                },
            )
            .unwrap();

        let summary = monitor.summary("p1").unwrap();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.avg_cpu_pct, 6.0);
        assert_eq!(summary.peak_memory_mb, 40.0);
        assert_eq!(summary.total_network_bytes, 150);
    }
}
