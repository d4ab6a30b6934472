use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{EmployeeId, Event};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per employee.
/// Payloads are the events encoded as JSON.
pub struct NotifyHub {
    channels: DashMap<EmployeeId, broadcast::Sender<String>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to an employee's events. Creates the channel if needed.
    pub fn subscribe(&self, employee_id: EmployeeId) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(employee_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, employee_id: EmployeeId, event: &Event) {
        let Some(sender) = self.channels.get(&employee_id) else {
            return;
        };
        match serde_json::to_string(event) {
            Ok(payload) => {
                let _ = sender.send(payload);
            }
            Err(e) => tracing::warn!("notify: could not encode event for employee {employee_id}: {e}"),
        }
    }

    pub fn channel_name(employee_id: EmployeeId) -> String {
        format!("employee_{employee_id}")
    }

    /// Parse a `LISTEN` channel name back into an employee id. Only the
    /// spelling `channel_name` produces is accepted.
    pub fn parse_channel(channel: &str) -> Option<EmployeeId> {
        channel
            .strip_prefix("employee_")
            .and_then(|id| id.parse().ok())
            .filter(|id| *id > 0 && Self::channel_name(*id) == channel)
    }
}
