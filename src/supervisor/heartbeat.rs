//! Heartbeat Monitor
//!
//! Periodically sweeps the hub's descriptor table, takes agents that missed
//! too many heartbeats offline, and publishes liveness transitions.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hub::CommunicationHub;

/// Liveness transition observed by the monitor
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    /// Agent reached the missed-heartbeat limit
    AgentOffline {
        agent_id: String,
        last_heartbeat: DateTime<Utc>,
    },
    /// Previously offline agent is heartbeating again
    AgentRecovered { agent_id: String },
}

/// Background sweeper driving the hub's offline transitions
pub struct HeartbeatMonitor {
    hub: CommunicationHub,
    check_interval: Duration,
    event_tx: broadcast::Sender<HeartbeatEvent>,
    running: Arc<AtomicBool>,
}

impl HeartbeatMonitor {
    /// Sweep at the hub's configured heartbeat interval
    pub fn new(hub: CommunicationHub) -> Self {
        let check_interval = hub.config().heartbeat_interval();
        Self::with_interval(hub, check_interval)
    }

    pub fn with_interval(hub: CommunicationHub, check_interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            hub,
            check_interval,
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One sweep; returns the events it emitted
    pub fn check(&self, offline_before: &mut BTreeSet<String>) -> Vec<HeartbeatEvent> {
        sweep(&self.hub, &self.event_tx, offline_before, Utc::now())
    }

    /// Start the sweep loop
    pub fn start(&self) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(interval_ms = self.check_interval.as_millis() as u64, "Heartbeat monitor started");

        let hub = self.hub.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();
        let check_interval = self.check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            let mut offline = BTreeSet::new();

            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                sweep(&hub, &event_tx, &mut offline, Utc::now());
            }

            debug!("Heartbeat monitor loop exited");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Heartbeat monitor stopped");
    }
}

fn sweep(
    hub: &CommunicationHub,
    event_tx: &broadcast::Sender<HeartbeatEvent>,
    offline: &mut BTreeSet<String>,
    now: DateTime<Utc>,
) -> Vec<HeartbeatEvent> {
    let mut events = Vec::new();

    for agent_id in hub.sweep_heartbeats(now) {
        let last_heartbeat = hub
            .descriptor(&agent_id)
            .map(|d| d.last_heartbeat)
            .unwrap_or(now);
        warn!(agent_id = %agent_id, "Agent offline after missed heartbeats");
        offline.insert(agent_id.clone());
        events.push(HeartbeatEvent::AgentOffline {
            agent_id,
            last_heartbeat,
        });
    }

    let recovered: Vec<String> = offline
        .iter()
        .filter(|id| hub.descriptor(id).map(|d| !d.is_offline()).unwrap_or(true))
        .cloned()
        .collect();
    for agent_id in recovered {
        offline.remove(&agent_id);
        if hub.descriptor(&agent_id).is_some() {
            info!(agent_id = %agent_id, "Agent recovered");
            events.push(HeartbeatEvent::AgentRecovered { agent_id });
        }
    }

    for event in &events {
        let _ = event_tx.send(event.clone());
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentDescriptor, Capability, HealthStatus};
    use crate::hub::HubConfig;
    use tokio::sync::mpsc;

    fn hub() -> CommunicationHub {
        CommunicationHub::new(HubConfig {
            heartbeat_interval_ms: 20,
            max_missed_heartbeats: 3,
            ..HubConfig::default()
        })
    }

    #[tokio::test]
    async fn test_monitor_takes_silent_agent_offline() {
        let hub = hub();
        let (tx, _rx) = mpsc::channel(4);
        hub.register(AgentDescriptor::new("quiet", [Capability::Reporting]), tx)
            .unwrap();

        let monitor = HeartbeatMonitor::new(hub.clone());
        let mut events = monitor.subscribe();
        let task = monitor.start();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no event before timeout")
            .unwrap();
        assert!(matches!(event, HeartbeatEvent::AgentOffline { ref agent_id, .. } if agent_id == "quiet"));
        assert!(hub.descriptor("quiet").unwrap().is_offline());

        monitor.stop();
        task.abort();
    }

    #[test]
    fn test_check_reports_recovery() {
        let hub = hub();
        let (tx, _rx) = mpsc::channel(4);
        hub.register(AgentDescriptor::new("a", [Capability::Reporting]), tx)
            .unwrap();
        let monitor = HeartbeatMonitor::new(hub.clone());

        let mut offline = BTreeSet::new();
        hub.heartbeat("a", HealthStatus::Offline).unwrap();
        offline.insert("a".to_string());

        hub.heartbeat("a", HealthStatus::Healthy).unwrap();
        let events = monitor.check(&mut offline);
        assert_eq!(
            events,
            vec![HeartbeatEvent::AgentRecovered {
                agent_id: "a".into()
            }]
        );
        assert!(offline.is_empty());
        assert!(!monitor.is_running());
    }
}
