//! Parallel body-text store
//!
//! # `.txt` sidecar format
//!
//! ```text
//! i32 LE         count
//! per entry:     i32 LE length, length UTF-8 bytes (no trailing newline)
//! ```
//!
//! Slots share the vector index's dense ID space: the ID of a body is its
//! position at insertion time.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::sidecar::{read_i32, read_lp_bytes, write_i32, write_lp_bytes};

#[derive(Error, Debug)]
pub enum TextStoreError {
    #[error("text store is full (capacity {0})")]
    Full(usize),

    #[error("id {id} not found (count {count})")]
    NotFound { id: u64, count: usize },

    #[error("corrupt text sidecar: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TextStore {
    lines: Vec<String>,
    capacity: usize,
}

impl TextStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Vec::new(),
            capacity,
        }
    }

    pub fn count(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        self.lines.get(id as usize).map(String::as_str)
    }

    /// Append a body and return its ID (the slot position).
    pub fn add(&mut self, text: &str) -> Result<u64, TextStoreError> {
        if self.lines.len() >= self.capacity {
            return Err(TextStoreError::Full(self.capacity));
        }
        self.lines.push(text.to_string());
        Ok(self.lines.len() as u64 - 1)
    }

    /// Replace the body at `id`.
    pub fn set(&mut self, id: u64, text: &str) -> Result<(), TextStoreError> {
        let slot = id as usize;
        if slot >= self.lines.len() {
            return Err(TextStoreError::NotFound {
                id,
                count: self.lines.len(),
            });
        }
        self.lines[slot] = text.to_string();
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TextStoreError> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);
        write_i32(&mut w, self.lines.len() as i32)?;
        for line in &self.lines {
            write_lp_bytes(&mut w, line.as_bytes())?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, TextStoreError> {
        let file = File::open(path.as_ref())?;
        let mut r = BufReader::new(file);
        let count = read_i32(&mut r)?;
        if count < 0 {
            return Err(TextStoreError::Corrupt(format!("negative count {count}")));
        }

        let mut store = Self::new(capacity.max(count as usize));
        for i in 0..count {
            let bytes = read_lp_bytes(&mut r)?;
            let line = String::from_utf8(bytes)
                .map_err(|e| TextStoreError::Corrupt(format!("entry {i} not UTF-8: {e}")))?;
            store.lines.push(line);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ids_are_sequential_positions() {
        let mut store = TextStore::new(8);
        assert_eq!(store.add("my name is Bob").unwrap(), 0);
        assert_eq!(store.add("cake is for birthdays").unwrap(), 1);
        assert_eq!(store.add("carrots are orange").unwrap(), 2);
        assert_eq!(store.get(1), Some("cake is for birthdays"));
    }

    #[test]
    fn full_store_rejects_add() {
        let mut store = TextStore::new(1);
        store.add("one").unwrap();
        assert!(matches!(store.add("two"), Err(TextStoreError::Full(1))));
    }

    #[test]
    fn set_replaces_without_changing_count() {
        let mut store = TextStore::new(4);
        store.add("old body").unwrap();
        store.add("other").unwrap();
        store.set(0, "new body").unwrap();
        assert_eq!(store.get(0), Some("new body"));
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn set_unknown_id_is_not_found() {
        let mut store = TextStore::new(4);
        assert!(matches!(
            store.set(3, "nope"),
            Err(TextStoreError::NotFound { id: 3, .. })
        ));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.txt");

        let mut store = TextStore::new(8);
        store.add("first note").unwrap();
        store.add("").unwrap();
        store.add("note with unicode: héllo ✓").unwrap();
        store.save(&path).unwrap();

        let loaded = TextStore::load(&path, 8).unwrap();
        assert_eq!(loaded.count(), 3);
        assert_eq!(loaded.get(0), Some("first note"));
        assert_eq!(loaded.get(1), Some(""));
        assert_eq!(loaded.get(2), Some("note with unicode: héllo ✓"));
    }
}
