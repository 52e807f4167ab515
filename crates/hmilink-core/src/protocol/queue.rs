//! Pending-command queue
//!
//! The display executes one command at a time and answers strictly in order,
//! so every reply is matched against the oldest outstanding request; no
//! correlation ids exist on the wire. Entries referring to registered
//! components carry only a [`ComponentKey`] into the engine's registry, while
//! ack-only entries own their label and are dropped on pop.

use std::collections::VecDeque;

use super::component::ComponentKey;

/// One outstanding request awaiting a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    /// Fire-and-forget command: only an ack or error code comes back.
    /// The label names the originating operation for diagnostics.
    NoResult(String),
    /// A `get` awaiting a value for a registered component
    Component(ComponentKey),
    /// An `addt` announce awaiting the display's transmit-ready signal.
    /// `announced` is the byte count promised in the announce command.
    Waveform {
        key: ComponentKey,
        announced: usize,
    },
}

impl QueueEntry {
    pub fn describe(&self) -> String {
        match self {
            QueueEntry::NoResult(label) => format!("no-result '{label}'"),
            QueueEntry::Component(key) => format!("component #{}", key.index()),
            QueueEntry::Waveform { key, announced } => {
                format!("waveform #{} ({announced} bytes)", key.index())
            }
        }
    }
}

/// Strict FIFO of outstanding requests
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<QueueEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, entry: QueueEntry) {
        tracing::trace!(entry = %entry.describe(), depth = self.entries.len() + 1, "queued");
        self.entries.push_back(entry);
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Position of the first waveform entry, scanning the whole queue.
    ///
    /// Waveform errors and transmit-ready signals are not ordered with respect
    /// to ordinary replies, so they match the first waveform entry anywhere in
    /// the queue rather than the head.
    pub fn first_waveform(&self) -> Option<(usize, ComponentKey, usize)> {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            QueueEntry::Waveform { key, announced } => Some((i, *key, *announced)),
            _ => None,
        })
    }

    pub fn remove(&mut self, index: usize) -> Option<QueueEntry> {
        self.entries.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fifo_order() {
        let mut queue = PendingQueue::new();
        queue.push_back(QueueEntry::NoResult("a".into()));
        queue.push_back(QueueEntry::NoResult("b".into()));

        assert_eq!(queue.pop_front(), Some(QueueEntry::NoResult("a".into())));
        assert_eq!(queue.pop_front(), Some(QueueEntry::NoResult("b".into())));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn test_first_waveform_scans_past_head() {
        let mut queue = PendingQueue::new();
        queue.push_back(QueueEntry::NoResult("head".into()));
        queue.push_back(QueueEntry::Component(ComponentKey(0)));
        queue.push_back(QueueEntry::Waveform {
            key: ComponentKey(1),
            announced: 64,
        });

        let (index, key, announced) = queue.first_waveform().unwrap();
        assert_eq!(index, 2);
        assert_eq!(key, ComponentKey(1));
        assert_eq!(announced, 64);

        queue.remove(index);
        assert!(queue.first_waveform().is_none());
        assert_eq!(queue.len(), 2);
    }
}
