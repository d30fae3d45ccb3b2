//! C8: the append-only Transaction Log.
//!
//! [`MemTransactionLog`] is the in-memory reference implementation every
//! other crate's tests run against. Each log carries a modification time
//! the sweeper uses to decide staleness, tracked here as the wall-clock
//! time of the most recent append for that transaction.

use dashmap::DashMap;
use sop_core::error::Result;
use sop_core::ids::TransactionId;
use sop_core::time::now_micros;
use sop_core::traits::{LogRecord, TransactionLog};
use parking_lot::Mutex;

struct TxLog {
    records: Vec<LogRecord>,
    last_modified_micros: i64,
}

/// In-memory `TransactionLog`.
#[derive(Default)]
pub struct MemTransactionLog {
    logs: DashMap<TransactionId, Mutex<TxLog>>,
}

impl MemTransactionLog {
    /// An empty log store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionLog for MemTransactionLog {
    fn append(&self, tx_id: TransactionId, phase_tag: u8, payload: Vec<u8>) -> Result<()> {
        let now = now_micros();
        let entry = self.logs.entry(tx_id).or_insert_with(|| {
            Mutex::new(TxLog {
                records: Vec::new(),
                last_modified_micros: now,
            })
        });
        let mut log = entry.lock();
        let sequence_number = log.records.len() as u64;
        log.records.push(LogRecord {
            phase_tag,
            sequence_number,
            payload,
        });
        log.last_modified_micros = now;
        Ok(())
    }

    fn read(&self, tx_id: TransactionId) -> Result<Vec<LogRecord>> {
        Ok(self
            .logs
            .get(&tx_id)
            .map(|e| e.value().lock().records.clone())
            .unwrap_or_default())
    }

    fn delete(&self, tx_id: TransactionId) -> Result<()> {
        self.logs.remove(&tx_id);
        Ok(())
    }

    fn list_active(&self) -> Result<Vec<(TransactionId, i64)>> {
        Ok(self
            .logs
            .iter()
            .map(|e| (*e.key(), e.value().lock().last_modified_micros))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_preserves_order() {
        let log = MemTransactionLog::new();
        let tx = TransactionId::new();
        log.append(tx, 2, b"a".to_vec()).unwrap();
        log.append(tx, 3, b"b".to_vec()).unwrap();
        let records = log.read(tx).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence_number, 0);
        assert_eq!(records[1].sequence_number, 1);
        assert_eq!(records[0].phase_tag, 2);
        assert_eq!(records[1].phase_tag, 3);
    }

    #[test]
    fn read_of_unknown_tx_is_empty() {
        let log = MemTransactionLog::new();
        assert!(log.read(TransactionId::new()).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_all_records() {
        let log = MemTransactionLog::new();
        let tx = TransactionId::new();
        log.append(tx, 1, vec![]).unwrap();
        log.delete(tx).unwrap();
        assert!(log.read(tx).unwrap().is_empty());
    }

    #[test]
    fn list_active_reports_every_open_transaction() {
        let log = MemTransactionLog::new();
        let a = TransactionId::new();
        let b = TransactionId::new();
        log.append(a, 1, vec![]).unwrap();
        log.append(b, 1, vec![]).unwrap();
        let active: Vec<TransactionId> = log.list_active().unwrap().into_iter().map(|(id, _)| id).collect();
        assert!(active.contains(&a));
        assert!(active.contains(&b));
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn delete_removes_from_list_active() {
        let log = MemTransactionLog::new();
        let tx = TransactionId::new();
        log.append(tx, 1, vec![]).unwrap();
        log.delete(tx).unwrap();
        assert!(log.list_active().unwrap().is_empty());
    }
}
