//! Records for reliable sends awaiting their acks.
//!
//! Each reliable send inserts one entry here and awaits the entry's
//! one-shot notifier. 0x7B acks carry the request's msg id, so they resolve
//! through the reverse map and parallel outstanding data sends are fine.
//! 0x28, 0x88 and 0xD8 carry no usable id; they resolve FIFO within their
//! class, which is unambiguous because the transport serializes sends of
//! those classes.
//!
//! The journal owns no lock. The connection guards it with the same mutex
//! that guards its connection state, so a state check and a pending-table
//! mutation are one critical section.

use std::collections::{HashMap, VecDeque};

use cybase::packet::MsgId;
use tokio::{sync::oneshot, time::Instant};
use uuid::Uuid;

/// Which ack resolves a pending send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckClass {
    /// 0x73 → 0x7B, matched by msg id.
    Data,
    /// 0x23 → 0x28, matched FIFO.
    Handshake,
    /// 0x83 → 0x88, matched FIFO.
    Status,
    /// 0xD3 → 0xD8, matched FIFO.
    Heartbeat,
}

/// One in-flight reliable send.
#[derive(Debug)]
struct PendingMessage {
    msg_id: MsgId,
    sent_at: Instant,
    notifier: oneshot::Sender<()>,
    retry_count: u32,
    class: AckClass,
}

/// The pending-ack table of one transport.
#[derive(Debug, Default)]
pub struct PendingJournal {
    pending: HashMap<Uuid, PendingMessage>,
    by_msg_id: HashMap<u16, Uuid>,
    // per-class arrival order for the id-less ack types; stale ids are
    // skipped lazily on resolve
    fifo: HashMap<AckClass, VecDeque<Uuid>>,
}

impl PendingJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record a send and hand back the receiver its caller awaits.
    ///
    /// Dropping the journal entry (resolve, removal or sweep) consumes or
    /// drops the sender, which is what wakes or cancels the caller.
    pub fn insert(
        &mut self,
        class: AckClass,
        msg_id: MsgId,
        correlation_id: Uuid,
        retry_count: u32,
    ) -> oneshot::Receiver<()> {
        let (notifier, signal) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingMessage {
                msg_id,
                sent_at: Instant::now(),
                notifier,
                retry_count,
                class,
            },
        );
        if class == AckClass::Data {
            self.by_msg_id
                .insert(u16::from_be_bytes(msg_id), correlation_id);
        } else {
            self.fifo.entry(class).or_default().push_back(correlation_id);
        }
        signal
    }

    /// Resolve the data send matching `msg_id`, firing its notifier.
    pub fn resolve_msg_id(&mut self, msg_id: MsgId) -> Option<Uuid> {
        let correlation_id = self.by_msg_id.remove(&u16::from_be_bytes(msg_id))?;
        let entry = self
            .pending
            .remove(&correlation_id)
            .expect("reverse map only holds live entries");
        _ = entry.notifier.send(());
        Some(correlation_id)
    }

    /// Resolve the oldest outstanding send of `class`, firing its notifier.
    pub fn resolve_fifo(&mut self, class: AckClass) -> Option<Uuid> {
        let queue = self.fifo.get_mut(&class)?;
        while let Some(correlation_id) = queue.pop_front() {
            if let Some(entry) = self.pending.remove(&correlation_id) {
                _ = entry.notifier.send(());
                return Some(correlation_id);
            }
        }
        None
    }

    /// Drop the entry for `correlation_id` if it still exists, cancelling
    /// its waiter. Safe to call for an already-resolved id.
    pub fn remove(&mut self, correlation_id: &Uuid) -> bool {
        let Some(entry) = self.pending.remove(correlation_id) else {
            return false;
        };
        if entry.class == AckClass::Data {
            // a newer attempt may have reclaimed this msg id slot
            let key = u16::from_be_bytes(entry.msg_id);
            if self.by_msg_id.get(&key) == Some(correlation_id) {
                self.by_msg_id.remove(&key);
            }
        }
        true
    }

    /// Reap every entry older than `max_age`, cancelling their waiters.
    /// Returns each reaped correlation id with the retry count its send had
    /// reached.
    ///
    /// This is the safety net behind the per-attempt ack timeouts, not the
    /// primary timeout mechanism.
    pub fn sweep_older_than(&mut self, max_age: std::time::Duration) -> Vec<(Uuid, u32)> {
        let now = Instant::now();
        let stale: Vec<(Uuid, u32)> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) > max_age)
            .map(|(id, entry)| (*id, entry.retry_count))
            .collect();
        for (correlation_id, _) in &stale {
            self.remove(correlation_id);
        }
        stale
    }

    /// Drop every entry, cancelling all waiters.
    pub fn clear(&mut self) -> usize {
        let cancelled = self.pending.len();
        self.pending.clear();
        self.by_msg_id.clear();
        self.fifo.clear();
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid() -> Uuid {
        Uuid::now_v7()
    }

    #[tokio::test]
    async fn data_acks_resolve_by_msg_id_in_any_order() {
        let mut journal = PendingJournal::new();
        let (id_a, id_b) = (uuid(), uuid());
        let mut signal_a = journal.insert(AckClass::Data, [0, 1], id_a, 0);
        let signal_b = journal.insert(AckClass::Data, [0, 2], id_b, 0);

        // the second send is acked first
        assert_eq!(journal.resolve_msg_id([0, 2]), Some(id_b));
        signal_b.await.unwrap();
        assert!(signal_a.try_recv().is_err());

        assert_eq!(journal.resolve_msg_id([0, 1]), Some(id_a));
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn unknown_msg_id_resolves_nothing() {
        let mut journal = PendingJournal::new();
        journal.insert(AckClass::Data, [0, 1], uuid(), 0);
        assert_eq!(journal.resolve_msg_id([9, 9]), None);
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn idless_acks_resolve_fifo_within_their_class() {
        let mut journal = PendingJournal::new();
        let first = uuid();
        let second = uuid();
        journal.insert(AckClass::Heartbeat, [0, 0], first, 0);
        journal.insert(AckClass::Heartbeat, [0, 0], second, 0);
        journal.insert(AckClass::Status, [0, 0], uuid(), 0);

        assert_eq!(journal.resolve_fifo(AckClass::Heartbeat), Some(first));
        assert_eq!(journal.resolve_fifo(AckClass::Heartbeat), Some(second));
        assert_eq!(journal.resolve_fifo(AckClass::Heartbeat), None);
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn fifo_skips_entries_removed_out_of_band() {
        let mut journal = PendingJournal::new();
        let withdrawn = uuid();
        let live = uuid();
        journal.insert(AckClass::Status, [0, 0], withdrawn, 0);
        journal.insert(AckClass::Status, [0, 0], live, 0);
        assert!(journal.remove(&withdrawn));
        assert!(!journal.remove(&withdrawn));
        assert_eq!(journal.resolve_fifo(AckClass::Status), Some(live));
    }

    #[tokio::test]
    async fn removing_an_entry_cancels_its_waiter() {
        let mut journal = PendingJournal::new();
        let id = uuid();
        let signal = journal.insert(AckClass::Data, [0, 7], id, 0);
        journal.remove(&id);
        assert!(signal.await.is_err());
        // the reverse map slot is gone with it
        assert_eq!(journal.resolve_msg_id([0, 7]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reaps_only_aged_entries() {
        let mut journal = PendingJournal::new();
        let old = uuid();
        journal.insert(AckClass::Data, [0, 1], old, 0);
        tokio::time::advance(std::time::Duration::from_secs(31)).await;
        let young = uuid();
        journal.insert(AckClass::Data, [0, 2], young, 0);

        let reaped = journal.sweep_older_than(std::time::Duration::from_secs(30));
        assert_eq!(reaped, vec![(old, 0)]);
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.resolve_msg_id([0, 2]), Some(young));
    }
}
