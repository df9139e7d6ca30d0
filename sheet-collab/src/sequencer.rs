//! Transaction ordering and catch-up.
//!
//! The server is the single authority on transaction order: every
//! accepted transaction gets a monotonically increasing sequence number.
//! This module keeps the local document engine in lockstep with that
//! order:
//!
//! - local edits apply optimistically, then travel to the server tagged
//!   with a client-generated id; the delayed echo carries the assigned
//!   sequence number and is acknowledged without re-applying,
//! - remote broadcasts apply only when contiguous; a sequence gap parks
//!   later transactions in a sorted buffer and requests a backfill for
//!   the missing range,
//! - periodic sequence announcements bound gap-detection latency even
//!   when no edits flow.
//!
//! Duplicates (sequence number below the tracker) are discarded
//! silently; the server never reuses or rewinds sequence numbers.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::SequencedTransaction;

/// The document engine collaborator: accepts ordered operation batches
/// and tracks its own applied-sequence counter as defense in depth.
pub trait DocumentEngine: Send {
    /// Apply one operation batch. A rejection is a corruption-class
    /// error: the batch is dropped, never retried.
    fn apply(&mut self, operations: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Sequence number of the last transaction the engine has applied.
    fn applied_sequence(&self) -> u64;

    /// Out-of-band notification of the server's current sequence number,
    /// letting the engine detect desync independently of this tracker.
    fn receive_sequence_announcement(&mut self, sequence_num: u64);
}

/// Outcome of feeding one broadcast transaction to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Applied in order (possibly draining buffered successors).
    Applied,
    /// Echo of a locally-submitted transaction; acknowledged only.
    AckedOwn,
    /// Ahead of the tracker; parked. `backfill` carries the minimum
    /// sequence number to request when a request is due.
    Buffered { backfill: Option<u64> },
    /// Below the tracker; already applied.
    Duplicate,
}

pub struct TransactionSequencer<E> {
    engine: E,
    /// Sequence number of the last transaction applied locally.
    last_sequence_num: u64,
    /// Ids of locally-submitted transactions whose echo is outstanding.
    unacked: Vec<Uuid>,
    /// Transactions ahead of the tracker, ascending by sequence number.
    out_of_order: Vec<SequencedTransaction>,
    /// Highest sequence number known to exist on the server.
    backfill_target: Option<u64>,
    backfill_requested_at: Option<Instant>,
    backfill_retry: Duration,
}

impl<E: DocumentEngine> TransactionSequencer<E> {
    pub fn new(engine: E, backfill_retry: Duration) -> Self {
        let last_sequence_num = engine.applied_sequence();
        Self {
            engine,
            last_sequence_num,
            unacked: Vec::new(),
            out_of_order: Vec::new(),
            backfill_target: None,
            backfill_requested_at: None,
            backfill_retry,
        }
    }

    /// Last applied sequence number.
    pub fn sequence_num(&self) -> u64 {
        self.last_sequence_num
    }

    /// Ids of locally-submitted transactions not yet echoed back.
    pub fn unacked(&self) -> &[Uuid] {
        &self.unacked
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Submit a locally-produced operation batch: apply it optimistically
    /// and return the transaction id to transmit. An engine rejection
    /// drops the batch entirely — it is neither recorded nor transmitted.
    pub fn submit(&mut self, operations: &[u8]) -> Result<Uuid, CollabError> {
        self.engine
            .apply(operations)
            .map_err(|e| CollabError::Engine(e.to_string()))?;
        let id = Uuid::new_v4();
        self.unacked.push(id);
        Ok(id)
    }

    /// Feed one broadcast transaction.
    pub fn receive_transaction(
        &mut self,
        id: Uuid,
        sequence_num: u64,
        operations: Vec<u8>,
    ) -> Result<Outcome, CollabError> {
        let expected = self.last_sequence_num + 1;
        if sequence_num < expected {
            log::debug!("duplicate transaction {sequence_num}, tracker at {}", self.last_sequence_num);
            return Ok(Outcome::Duplicate);
        }
        if sequence_num > expected {
            self.buffer_out_of_order(id, sequence_num, operations);
            let backfill = self.maybe_request_backfill(sequence_num);
            return Ok(Outcome::Buffered { backfill });
        }

        let own = self.apply_next(id, sequence_num, operations)?;
        self.drain_buffered()?;
        self.maybe_clear_backfill();
        Ok(if own { Outcome::AckedOwn } else { Outcome::Applied })
    }

    /// Feed a backfill batch. Transactions apply strictly ascending;
    /// entries at or below the tracker are skipped without re-applying.
    pub fn receive_transactions(
        &mut self,
        transactions: Vec<SequencedTransaction>,
    ) -> Result<(), CollabError> {
        for tx in transactions {
            let expected = self.last_sequence_num + 1;
            if tx.sequence_num < expected {
                continue;
            }
            if tx.sequence_num > expected {
                // A hole inside a batch should not happen; park it and let
                // the normal gap machinery recover.
                self.buffer_out_of_order(tx.id, tx.sequence_num, tx.operations);
                continue;
            }
            self.apply_next(tx.id, tx.sequence_num, tx.operations)?;
            self.drain_buffered()?;
        }
        self.maybe_clear_backfill();
        Ok(())
    }

    /// Server sequence announcement, on room entry and on heartbeat.
    /// Returns the minimum sequence number to backfill from, when behind
    /// and a request is due.
    pub fn receive_sequence_num(&mut self, sequence_num: u64) -> Option<u64> {
        self.engine.receive_sequence_announcement(sequence_num);
        if sequence_num <= self.last_sequence_num {
            return None;
        }
        log::debug!(
            "server at sequence {sequence_num}, local tracker at {}",
            self.last_sequence_num
        );
        self.maybe_request_backfill(sequence_num)
    }

    fn apply_next(
        &mut self,
        id: Uuid,
        sequence_num: u64,
        operations: Vec<u8>,
    ) -> Result<bool, CollabError> {
        debug_assert_eq!(sequence_num, self.last_sequence_num + 1);

        if let Some(pos) = self.unacked.iter().position(|u| *u == id) {
            // Our own echo: already applied optimistically at submit time.
            self.unacked.remove(pos);
            self.last_sequence_num = sequence_num;
            return Ok(true);
        }

        // Advance even when the engine rejects: the server considers this
        // transaction part of history and a retry would fail identically.
        self.last_sequence_num = sequence_num;
        self.engine
            .apply(&operations)
            .map_err(|e| CollabError::Engine(e.to_string()))?;
        Ok(false)
    }

    fn drain_buffered(&mut self) -> Result<(), CollabError> {
        while let Some(first) = self.out_of_order.first() {
            if first.sequence_num <= self.last_sequence_num {
                self.out_of_order.remove(0);
                continue;
            }
            if first.sequence_num != self.last_sequence_num + 1 {
                break;
            }
            let tx = self.out_of_order.remove(0);
            self.apply_next(tx.id, tx.sequence_num, tx.operations)?;
        }
        Ok(())
    }

    fn buffer_out_of_order(&mut self, id: Uuid, sequence_num: u64, operations: Vec<u8>) {
        if self
            .out_of_order
            .iter()
            .any(|t| t.sequence_num == sequence_num)
        {
            return;
        }
        let index = self
            .out_of_order
            .iter()
            .position(|t| t.sequence_num > sequence_num)
            .unwrap_or(self.out_of_order.len());
        self.out_of_order.insert(
            index,
            SequencedTransaction {
                id,
                sequence_num,
                operations,
            },
        );
    }

    fn maybe_request_backfill(&mut self, known_sequence: u64) -> Option<u64> {
        self.backfill_target = Some(
            self.backfill_target
                .map_or(known_sequence, |t| t.max(known_sequence)),
        );
        let now = Instant::now();
        let due = match self.backfill_requested_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.backfill_retry,
        };
        if !due {
            return None;
        }
        self.backfill_requested_at = Some(now);
        Some(self.last_sequence_num + 1)
    }

    fn maybe_clear_backfill(&mut self) {
        if let Some(target) = self.backfill_target {
            if self.last_sequence_num >= target {
                self.backfill_target = None;
                self.backfill_requested_at = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestEngine {
        applied: Vec<Vec<u8>>,
        announced: Vec<u64>,
        reject_next: bool,
    }

    impl DocumentEngine for TestEngine {
        fn apply(
            &mut self,
            operations: &[u8],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if self.reject_next {
                self.reject_next = false;
                return Err("structurally invalid".into());
            }
            self.applied.push(operations.to_vec());
            Ok(())
        }

        fn applied_sequence(&self) -> u64 {
            0
        }

        fn receive_sequence_announcement(&mut self, sequence_num: u64) {
            self.announced.push(sequence_num);
        }
    }

    fn sequencer() -> TransactionSequencer<TestEngine> {
        TransactionSequencer::new(TestEngine::default(), Duration::from_secs(5))
    }

    fn tx(seq: u64) -> (Uuid, u64, Vec<u8>) {
        (Uuid::new_v4(), seq, vec![seq as u8])
    }

    #[test]
    fn test_contiguous_broadcasts_apply_in_order() {
        let mut s = sequencer();
        for seq in 1..=4 {
            let (id, n, ops) = tx(seq);
            assert_eq!(s.receive_transaction(id, n, ops).unwrap(), Outcome::Applied);
        }
        assert_eq!(s.sequence_num(), 4);
        assert_eq!(s.engine().applied.len(), 4);
        assert_eq!(s.engine().applied[2], vec![3u8]);
    }

    #[test]
    fn test_gap_buffers_and_requests_backfill_once() {
        let mut s = sequencer();
        // Walk the tracker to 6 with a contiguous run.
        for seq in 1..=6 {
            let (id, n, ops) = tx(seq);
            s.receive_transaction(id, n, ops).unwrap();
        }

        // 9 arrives: gap [7, 9).
        let (id9, _, ops9) = tx(9);
        let outcome = s.receive_transaction(id9, 9, ops9).unwrap();
        assert_eq!(outcome, Outcome::Buffered { backfill: Some(7) });

        // A second out-of-order arrival inside the retry window does not
        // issue another request.
        let (id10, _, ops10) = tx(10);
        let outcome = s.receive_transaction(id10, 10, ops10).unwrap();
        assert_eq!(outcome, Outcome::Buffered { backfill: None });

        // Backfill batch [7, 8] closes the gap; 9 and 10 drain after it.
        s.receive_transactions(vec![
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 7,
                operations: vec![7],
            },
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 8,
                operations: vec![8],
            },
        ])
        .unwrap();
        assert_eq!(s.sequence_num(), 10);
        assert_eq!(s.engine().applied.len(), 10);
        // Strictly ascending application order.
        let order: Vec<u8> = s.engine().applied.iter().map(|o| o[0]).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_duplicate_is_discarded() {
        let mut s = sequencer();
        for seq in 1..=3 {
            let (id, n, ops) = tx(seq);
            s.receive_transaction(id, n, ops).unwrap();
        }
        let applied_before = s.engine().applied.len();
        let (id, _, ops) = tx(2);
        assert_eq!(
            s.receive_transaction(id, 2, ops).unwrap(),
            Outcome::Duplicate
        );
        assert_eq!(s.engine().applied.len(), applied_before);
        assert_eq!(s.sequence_num(), 3);
    }

    #[test]
    fn test_own_echo_acks_without_reapply() {
        let mut s = sequencer();
        let id = s.submit(&[42]).unwrap();
        assert_eq!(s.engine().applied.len(), 1);
        assert_eq!(s.unacked(), &[id]);

        let outcome = s.receive_transaction(id, 1, vec![42]).unwrap();
        assert_eq!(outcome, Outcome::AckedOwn);
        assert_eq!(s.engine().applied.len(), 1, "echo must not re-apply");
        assert!(s.unacked().is_empty());
        assert_eq!(s.sequence_num(), 1);
    }

    #[test]
    fn test_own_echo_inside_backfill_batch() {
        let mut s = sequencer();
        let id = s.submit(&[1]).unwrap();
        s.receive_transactions(vec![
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 1,
                operations: vec![9],
            },
            SequencedTransaction {
                id,
                sequence_num: 2,
                operations: vec![1],
            },
        ])
        .unwrap();
        assert!(s.unacked().is_empty());
        assert_eq!(s.sequence_num(), 2);
        // Optimistic apply plus the remote transaction: two applies total.
        assert_eq!(s.engine().applied.len(), 2);
    }

    #[test]
    fn test_submit_rejection_is_not_recorded() {
        let mut s = sequencer();
        s.engine.reject_next = true;
        let err = s.submit(&[0]).unwrap_err();
        assert!(matches!(err, CollabError::Engine(_)));
        assert!(s.unacked().is_empty());
        assert_eq!(s.sequence_num(), 0);
    }

    #[test]
    fn test_announcement_triggers_backfill() {
        let mut s = sequencer();
        assert_eq!(s.receive_sequence_num(3), Some(1));
        assert_eq!(s.engine().announced, vec![3]);
        // Equal announcement after catch-up is quiet.
        s.receive_transactions(vec![
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 1,
                operations: vec![1],
            },
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 2,
                operations: vec![2],
            },
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 3,
                operations: vec![3],
            },
        ])
        .unwrap();
        assert_eq!(s.receive_sequence_num(3), None);
    }

    #[test]
    fn test_announcement_within_retry_window_is_quiet() {
        let mut s = sequencer();
        assert_eq!(s.receive_sequence_num(5), Some(1));
        assert_eq!(s.receive_sequence_num(6), None);
    }

    #[test]
    fn test_backfill_rerequest_after_retry_interval() {
        let mut s = TransactionSequencer::new(TestEngine::default(), Duration::ZERO);
        assert_eq!(s.receive_sequence_num(5), Some(1));
        // Retry window elapsed (zero); a lost response may be re-requested.
        assert_eq!(s.receive_sequence_num(5), Some(1));
    }

    #[test]
    fn test_batch_skips_already_applied() {
        let mut s = sequencer();
        for seq in 1..=2 {
            let (id, n, ops) = tx(seq);
            s.receive_transaction(id, n, ops).unwrap();
        }
        s.receive_transactions(vec![
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 1,
                operations: vec![1],
            },
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 2,
                operations: vec![2],
            },
            SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num: 3,
                operations: vec![3],
            },
        ])
        .unwrap();
        assert_eq!(s.sequence_num(), 3);
        assert_eq!(s.engine().applied.len(), 3);
    }

    #[test]
    fn test_redelivered_buffered_transaction_deduplicates() {
        let mut s = sequencer();
        let (id, _, ops) = tx(3);
        s.receive_transaction(id, 3, ops.clone()).unwrap();
        s.receive_transaction(Uuid::new_v4(), 3, ops).unwrap();

        for seq in 1..=2 {
            let (id, n, ops) = tx(seq);
            s.receive_transaction(id, n, ops).unwrap();
        }
        assert_eq!(s.sequence_num(), 3);
        assert_eq!(s.engine().applied.len(), 3);
    }
}
