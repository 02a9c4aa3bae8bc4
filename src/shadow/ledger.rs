use std::collections::BTreeMap;

/// Subscribe requests still waiting for their acknowledgment, by packet
/// identifier.
///
/// Empty exactly when every issued subscription has been acknowledged. The
/// ledger only lives as long as one connection; it is cleared on connect and
/// on disconnect.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionLedger {
    pending: BTreeMap<u16, String>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, packet_id: u16, topic: impl Into<String>) {
        self.pending.insert(packet_id, topic.into());
    }

    /// Removes `packet_id` and returns its topic; `None` if it was not pending
    /// (duplicate or stray ack).
    pub fn acknowledge(&mut self, packet_id: u16) -> Option<String> {
        self.pending.remove(&packet_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
