//! An in-process, `VecDeque`-backed `Broker` used by control-loop unit and
//! integration tests — no real network broker required.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::{Broker, BrokerError, RawMessage};

#[derive(Default)]
pub struct FakeBroker {
    queues: HashMap<String, VecDeque<RawMessage>>,
    acked: HashSet<String>,
    next_id: u64,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: enqueues `payload` onto `queue` as if a client had sent
    /// it, without going through `send` (which a kernel uses for its own
    /// outbound replies).
    pub fn push_inbound(&mut self, queue: &str, payload: &str) {
        self.next_id += 1;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(RawMessage {
                queue: queue.to_string(),
                system_id: self.next_id.to_string(),
                payload: payload.to_string(),
            });
    }

    /// Test helper: drains everything sent to `queue` via `send` (the
    /// kernel's outbound replies), in emission order.
    pub fn drain_sent(&mut self, queue: &str) -> Vec<String> {
        self.queues
            .get_mut(queue)
            .map(|q| q.drain(..).map(|m| m.payload).collect())
            .unwrap_or_default()
    }

    pub fn is_acked(&self, system_id: &str) -> bool {
        self.acked.contains(system_id)
    }
}

impl Broker for FakeBroker {
    fn get_messages(&mut self, queue: &str, _timeout: Duration) -> Result<Vec<RawMessage>, BrokerError> {
        Ok(self
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default())
    }

    fn ack(&mut self, system_id: &str) -> Result<(), BrokerError> {
        self.acked.insert(system_id.to_string());
        Ok(())
    }

    fn send(&mut self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        self.next_id += 1;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(RawMessage {
                queue: queue.to_string(),
                system_id: self.next_id.to_string(),
                payload: payload.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_inbound_then_get_messages_returns_it() {
        let mut broker = FakeBroker::new();
        broker.push_inbound("k1", "hello");
        let msgs = broker.get_messages("k1", Duration::from_secs(0)).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, "hello");
    }

    #[test]
    fn send_lands_in_drain_sent_not_get_messages_of_same_queue() {
        let mut broker = FakeBroker::new();
        broker.send("r1", "reply").unwrap();
        assert_eq!(broker.drain_sent("r1"), vec!["reply".to_string()]);
    }

    #[test]
    fn ack_tracks_system_id() {
        let mut broker = FakeBroker::new();
        broker.push_inbound("k1", "hello");
        let msgs = broker.get_messages("k1", Duration::from_secs(0)).unwrap();
        broker.ack(&msgs[0].system_id).unwrap();
        assert!(broker.is_acked(&msgs[0].system_id));
    }
}
