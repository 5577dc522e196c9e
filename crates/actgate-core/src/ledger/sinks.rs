use super::{Decision, LedgerError, LedgerRecord, LedgerSink};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// File-based ledger sink (NDJSON, one record per line).
pub struct FileLedgerSink {
    file: Mutex<File>,
}

impl FileLedgerSink {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LedgerSink for FileLedgerSink {
    fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        // Single write per record so concurrent appenders never interleave lines.
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), LedgerError> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.flush()?;
        Ok(())
    }
}

/// In-process sink. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerSink {
    records: Arc<Mutex<Vec<LedgerRecord>>>,
}

impl MemoryLedgerSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                LedgerRecord::Decision(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerSink for MemoryLedgerSink {
    fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLedgerSink;

impl LedgerSink for NullLedgerSink {
    fn append(&self, _record: &LedgerRecord) -> Result<(), LedgerError> {
        Ok(())
    }
}
