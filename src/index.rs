//! Flat vector index with GPU-scored brute-force search
//!
//! # `.memo` file format
//!
//! ```text
//! Offset  Size             Description
//! ──────────────────────────────────────────────
//! 0x00    i32 LE           dim
//! 0x04    i32 LE           count
//! 0x08    i32 LE           metric (0 = L2, 1 = cosine, 2 = dot)
//! 0x0C    count × u64 LE   ids
//! ...     count × dim × f32 LE  packed vectors
//! ```
//!
//! IDs are append-ordered and equal to the slot position; overwrite by id is
//! the only mutation after insertion. Search compacts the candidate set
//! (all records, or those flagged by a pre-filter mask), scores it on the
//! GPU, and partial-selects the top k descending.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::gpu::{GpuContext, GpuError};
use crate::sidecar::{read_f32, read_i32, read_u64, write_f32, write_i32, write_u64};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index is full (capacity {0})")]
    Full(usize),

    #[error("id {id} not found (count {count})")]
    NotFound { id: u64, count: usize },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("corrupt index file: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Similarity metric. The shipped pipeline always writes `Cosine`; `L2` and
/// `Dot` are recognized in persistence for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    L2 = 0,
    Cosine = 1,
    Dot = 2,
}

impl Metric {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::L2),
            1 => Some(Self::Cosine),
            2 => Some(Self::Dot),
            _ => None,
        }
    }

    /// Kernel selector. The similarity kernel implements cosine and dot;
    /// an L2 index scores under cosine (nothing in the shipped path writes
    /// L2 files).
    pub fn kernel_selector(self) -> u32 {
        match self {
            Metric::Dot => 2,
            Metric::Cosine | Metric::L2 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    pub id: u64,
    pub score: f32,
}

impl SearchResult {
    /// Padding entry for ranks beyond the candidate count.
    pub const SENTINEL: SearchResult = SearchResult {
        id: 0,
        score: -1.0,
    };
}

pub struct VectorIndex {
    dim: usize,
    metric: Metric,
    capacity: usize,
    ids: Vec<u64>,
    vectors: Vec<f32>,
}

impl VectorIndex {
    /// Allocate all slabs up front for `capacity` vectors.
    pub fn create(dim: usize, metric: Metric, capacity: usize) -> Self {
        Self {
            dim,
            metric,
            capacity,
            ids: Vec::with_capacity(capacity),
            vectors: Vec::with_capacity(capacity * dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append a vector. The caller assigns ids equal to the insertion
    /// position; this is asserted in debug builds.
    pub fn add(&mut self, id: u64, vector: &[f32]) -> Result<(), IndexError> {
        if self.count() >= self.capacity {
            return Err(IndexError::Full(self.capacity));
        }
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        debug_assert_eq!(id as usize, self.ids.len());
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
        Ok(())
    }

    /// Replace the vector at `id` in place.
    pub fn overwrite(&mut self, id: u64, vector: &[f32]) -> Result<(), IndexError> {
        let slot = id as usize;
        if slot >= self.count() {
            return Err(IndexError::NotFound {
                id,
                count: self.count(),
            });
        }
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        self.vectors[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(vector);
        Ok(())
    }

    pub fn vector(&self, id: u64) -> Option<&[f32]> {
        let slot = id as usize;
        if slot >= self.count() {
            return None;
        }
        Some(&self.vectors[slot * self.dim..(slot + 1) * self.dim])
    }

    /// Brute-force top-k search, optionally restricted by a pre-filter
    /// mask (one flag per record).
    ///
    /// Always returns exactly `k` entries; ranks beyond the candidate count
    /// are [`SearchResult::SENTINEL`].
    pub fn search(
        &self,
        gpu: &GpuContext,
        query: &[f32],
        k: usize,
        mask: Option<&[bool]>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }

        // Compact the candidate set into contiguous buffers for the kernel.
        let (cand_ids, cand_vectors) = match mask {
            None => (self.ids.clone(), self.vectors.clone()),
            Some(mask) => self.compact(mask),
        };

        if cand_ids.is_empty() {
            return Ok(vec![SearchResult::SENTINEL; k]);
        }

        let scores = gpu.similarity(&cand_vectors, query, self.metric.kernel_selector())?;

        let scored: Vec<SearchResult> = cand_ids
            .iter()
            .zip(&scores)
            .map(|(&id, &score)| SearchResult { id, score })
            .collect();
        Ok(select_top_k(scored, k))
    }

    /// Gather the ids and vectors of mask-selected slots into contiguous
    /// buffers.
    fn compact(&self, mask: &[bool]) -> (Vec<u64>, Vec<f32>) {
        let mut ids = Vec::new();
        let mut vecs = Vec::new();
        for (slot, &keep) in mask.iter().enumerate().take(self.count()) {
            if keep {
                ids.push(self.ids[slot]);
                vecs.extend_from_slice(&self.vectors[slot * self.dim..(slot + 1) * self.dim]);
            }
        }
        (ids, vecs)
    }

    /// Write the index to `path` in the `.memo` format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), IndexError> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);

        write_i32(&mut w, self.dim as i32)?;
        write_i32(&mut w, self.count() as i32)?;
        write_i32(&mut w, self.metric as i32)?;
        for &id in &self.ids {
            write_u64(&mut w, id)?;
        }
        for &v in &self.vectors {
            write_f32(&mut w, v)?;
        }
        w.flush()?;

        tracing::debug!(count = self.count(), path = %path.as_ref().display(), "index saved");
        Ok(())
    }

    /// Load an index from `path`. Capacity is the larger of the stored
    /// count (plus headroom) and `min_capacity`.
    pub fn load<P: AsRef<Path>>(path: P, min_capacity: usize) -> Result<Self, IndexError> {
        let file = File::open(path.as_ref())?;
        let mut r = BufReader::new(file);

        let dim = read_i32(&mut r)?;
        let count = read_i32(&mut r)?;
        let metric_raw = read_i32(&mut r)?;
        if dim <= 0 || count < 0 {
            return Err(IndexError::Corrupt(format!(
                "bad header: dim={dim} count={count}"
            )));
        }
        let metric = Metric::from_i32(metric_raw)
            .ok_or_else(|| IndexError::Corrupt(format!("unknown metric {metric_raw}")))?;
        if metric == Metric::L2 {
            tracing::warn!("index stored with L2 metric; searches will score under cosine");
        }

        let dim = dim as usize;
        let count = count as usize;
        let capacity = min_capacity.max(count + 1024);

        let mut index = Self::create(dim, metric, capacity);
        for _ in 0..count {
            index.ids.push(read_u64(&mut r)?);
        }
        for _ in 0..count * dim {
            index.vectors.push(read_f32(&mut r)?);
        }

        tracing::debug!(count, dim, path = %path.as_ref().display(), "index loaded");
        Ok(index)
    }
}

/// Sort descending by score and keep the top `min(k, len)` entries, padding
/// the remainder with sentinels. Tie order between equal scores is not
/// contractual.
pub fn select_top_k(mut scored: Vec<SearchResult>, k: usize) -> Vec<SearchResult> {
    scored.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored.resize(k, SearchResult::SENTINEL);
    scored
}
