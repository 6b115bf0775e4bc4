//! ReadyQueue - Queued ジョブの安定優先度キュー
//!
//! 優先度の高い順、同じ優先度なら enqueue 順（sequence が小さい順）に取り出します。
//! 削除・キャンセルされたジョブのエントリはヒープに残り、取り出し時に
//! 呼び出し側の判定で読み捨てます（遅延削除）。

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::domain::{JobId, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyEntry {
    pub priority: Priority,
    pub sequence: u64,
    pub job_id: JobId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then the smaller sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
}

impl ReadyQueue {
    pub fn push(&mut self, entry: ReadyEntry) {
        self.heap.push(entry);
    }

    /// Pop the best entry accepted by `take`. `Take::Later` entries are put
    /// back, `Take::Stale` ones are discarded.
    pub fn pop_where(&mut self, mut take: impl FnMut(&ReadyEntry) -> Take) -> Option<ReadyEntry> {
        let mut kept = Vec::new();
        let mut found = None;
        while let Some(entry) = self.heap.pop() {
            match take(&entry) {
                Take::Yes => {
                    found = Some(entry);
                    break;
                }
                Take::Later => kept.push(entry),
                Take::Stale => {}
            }
        }
        self.heap.extend(kept);
        found
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Verdict of [`ReadyQueue::pop_where`] on one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Take {
    Yes,
    /// Valid but not now (e.g. same content already in flight).
    Later,
    /// Job gone or no longer Queued under this sequence.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn entry(priority: Priority, sequence: u64) -> ReadyEntry {
        ReadyEntry {
            priority,
            sequence,
            job_id: JobId::from_ulid(Ulid::new()),
        }
    }

    #[test]
    fn higher_priority_then_fifo() {
        let mut q = ReadyQueue::default();
        let n1 = entry(Priority::Normal, 1);
        let n2 = entry(Priority::Normal, 2);
        let n3 = entry(Priority::Normal, 3);
        let high = entry(Priority::High, 4);
        let low = entry(Priority::Low, 0);
        for e in [n1, n2, low, n3, high] {
            q.push(e);
        }

        let order: Vec<u64> = std::iter::from_fn(|| q.pop_where(|_| Take::Yes))
            .map(|e| e.sequence)
            .collect();
        assert_eq!(order, vec![4, 1, 2, 3, 0]);
    }

    #[test]
    fn later_entries_are_kept_and_stale_dropped() {
        let mut q = ReadyQueue::default();
        let busy = entry(Priority::Critical, 1);
        let stale = entry(Priority::High, 2);
        let next = entry(Priority::Normal, 3);
        for e in [busy, stale, next] {
            q.push(e);
        }

        let got = q.pop_where(|e| {
            if e.sequence == 1 {
                Take::Later
            } else if e.sequence == 2 {
                Take::Stale
            } else {
                Take::Yes
            }
        });
        assert_eq!(got.map(|e| e.sequence), Some(3));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_where(|_| Take::Yes).map(|e| e.sequence), Some(1));
    }
}
