//! Top-level memory engine
//!
//! [`MemoryEngine`] is the explicit context that owns everything with
//! process lifetime: the arena, the model weights and run state, the
//! tokenizer, the GPU orchestrator, and the three parallel stores. The CLI
//! constructs one per invocation and calls `save_note` / `overwrite_note` /
//! `recall` on it.
//!
//! Database layout: one basename resolves to three sidecars
//! (`<base>.memo`, `<base>.txt`, `<base>.meta`), all optional at load time.
//! A missing or unreadable sidecar loads as empty rather than failing the
//! run; save failures are reported.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::arena::Arena;
use crate::filter;
use crate::gpu::{GpuContext, GpuError};
use crate::index::{IndexError, Metric, SearchResult, VectorIndex};
use crate::infer::{self, RunState};
use crate::meta::{MetaStore, MetaStoreError};
use crate::model::{self, Config, ModelError, Weights};
use crate::text::{TextStore, TextStoreError};
use crate::tokenizer::{Tokenizer, TokenizerError};

/// Arena reservation for one run: weights plus filter scratch.
const ARENA_CAPACITY: usize = 1 << 30;

/// Record capacity of a fresh database.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("missing required asset {path}: run the model download script first")]
    MissingAsset { path: PathBuf },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Text(#[from] TextStoreError),

    #[error(transparent)]
    Meta(#[from] MetaStoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sidecar paths for one database basename.
#[derive(Debug, Clone)]
pub struct DbPaths {
    pub index: PathBuf,
    pub text: PathBuf,
    pub meta: PathBuf,
}

impl DbPaths {
    pub fn for_base(base: &str) -> Self {
        Self {
            index: PathBuf::from(format!("{base}.memo")),
            text: PathBuf::from(format!("{base}.txt")),
            meta: PathBuf::from(format!("{base}.meta")),
        }
    }

    fn ensure_parent_dirs(&self) -> std::io::Result<()> {
        for path in [&self.index, &self.text, &self.meta] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }

    /// Remove all sidecars. Returns true if anything was removed.
    pub fn clean(&self) -> std::io::Result<bool> {
        let mut removed_any = false;
        for path in [&self.index, &self.text, &self.meta] {
            match std::fs::remove_file(path) {
                Ok(()) => removed_any = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed_any)
    }
}

/// One recalled record.
#[derive(Debug, Clone)]
pub struct RecallHit {
    pub id: u64,
    pub score: f32,
    pub body: String,
    pub metadata: Option<String>,
}

pub struct MemoryEngine {
    arena: Arena,
    gpu: GpuContext,
    config: Config,
    weights: Weights,
    state: RunState,
    tokenizer: Tokenizer,
    index: VectorIndex,
    texts: TextStore,
    metas: MetaStore,
    paths: DbPaths,
}

impl MemoryEngine {
    /// Load the model and tokenizer from `model_dir`, bring up the GPU, and
    /// load whichever sidecars exist for `db_base`.
    pub fn open(model_dir: &Path, db_base: &str) -> Result<Self, EngineError> {
        let model_path = model_dir.join("model.bin");
        let tokenizer_path = model_dir.join("tokenizer.bin");
        for path in [&model_path, &tokenizer_path] {
            if !path.exists() {
                return Err(EngineError::MissingAsset { path: path.clone() });
            }
        }

        let mut arena = Arena::with_capacity(ARENA_CAPACITY);
        let (config, weights) = model::load(&model_path, &mut arena)?;
        let tokenizer = Tokenizer::load(&tokenizer_path, config.vocab_size as usize)?;
        let state = RunState::new(&config);

        let mut gpu = GpuContext::new()?;
        let dim = config.dim as usize;
        let hidden = config.hidden_dim as usize;
        let vocab = config.vocab_size as usize;
        gpu.load_weights(arena.occupied_bytes(), dim.max(hidden), dim.max(hidden).max(vocab))?;

        let paths = DbPaths::for_base(db_base);
        let index = Self::load_index_or_empty(&paths, dim);
        let capacity = index.capacity();
        gpu.prepare_similarity(capacity, index.dim())?;

        let mut texts = match TextStore::load(&paths.text, capacity) {
            Ok(store) => store,
            Err(TextStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                TextStore::new(capacity)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load text sidecar; starting empty");
                TextStore::new(capacity)
            }
        };
        let mut metas = match MetaStore::load(&paths.meta, capacity) {
            Ok(store) => store,
            Err(MetaStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                MetaStore::new(capacity)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load metadata sidecar; starting empty");
                MetaStore::new(capacity)
            }
        };

        // Keep the parallel stores in lockstep with the index even if a
        // sidecar went missing.
        while texts.count() < index.count() {
            texts.add("")?;
        }
        while metas.count() < index.count() {
            metas.add(None)?;
        }

        tracing::debug!(
            records = index.count(),
            dim = index.dim(),
            "memory engine ready"
        );

        Ok(Self {
            arena,
            gpu,
            config,
            weights,
            state,
            tokenizer,
            index,
            texts,
            metas,
            paths,
        })
    }

    fn load_index_or_empty(paths: &DbPaths, model_dim: usize) -> VectorIndex {
        if paths.index.exists() {
            match VectorIndex::load(&paths.index, DEFAULT_CAPACITY) {
                Ok(index) => {
                    if index.dim() != model_dim {
                        tracing::warn!(
                            stored = index.dim(),
                            model = model_dim,
                            "index dimension does not match the model; starting empty"
                        );
                    } else {
                        return index;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load index sidecar; starting empty");
                }
            }
        }
        VectorIndex::create(model_dim, Metric::Cosine, DEFAULT_CAPACITY)
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }

    pub fn texts(&self) -> &TextStore {
        &self.texts
    }

    pub fn metas(&self) -> &MetaStore {
        &self.metas
    }

    /// Embed one string with the on-device model.
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>, GpuError> {
        infer::embed(
            &mut self.state,
            &self.config,
            &self.weights,
            &self.tokenizer,
            &self.arena,
            &self.gpu,
            text,
        )
    }

    /// Embed and append a note with optional metadata, persist, and return
    /// the assigned ID.
    pub fn save_note(&mut self, note: &str, metadata: Option<&str>) -> Result<u64, EngineError> {
        if self.index.count() >= self.index.capacity() {
            return Err(EngineError::Index(IndexError::Full(self.index.capacity())));
        }

        let vector = self.embed(note)?;
        let id = self.texts.add(note)?;
        self.index.add(id, &vector)?;
        self.metas.add(metadata)?;

        self.persist()?;
        Ok(id)
    }

    /// Overwrite an existing record in place: vector, body, and metadata.
    pub fn overwrite_note(
        &mut self,
        id: u64,
        note: &str,
        metadata: Option<&str>,
    ) -> Result<(), EngineError> {
        if id as usize >= self.index.count() {
            return Err(EngineError::Index(IndexError::NotFound {
                id,
                count: self.index.count(),
            }));
        }

        let vector = self.embed(note)?;
        self.index.overwrite(id, &vector)?;
        self.texts.set(id, note)?;
        self.metas.set(id, metadata)?;

        self.persist()?;
        Ok(())
    }

    /// Embed the query, optionally pre-filter by metadata, and return the
    /// top-k hits (sentinel ranks excluded).
    ///
    /// A malformed filter yields an empty result set, not an error.
    pub fn recall(
        &mut self,
        query: &str,
        k: usize,
        filter_expr: Option<&str>,
    ) -> Result<Vec<RecallHit>, EngineError> {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }

        let mask = match filter_expr {
            None => None,
            Some(expr) => match filter::filter_mask(&self.metas, &mut self.arena, expr) {
                Ok(mask) => Some(mask),
                Err(e) => {
                    tracing::warn!(error = %e, "invalid filter expression; no candidates");
                    return Ok(Vec::new());
                }
            },
        };

        let query_vec = self.embed(query)?;
        let results = self
            .index
            .search(&self.gpu, &query_vec, k, mask.as_deref())?;

        let hits = results
            .iter()
            .filter(|r| r.score >= -0.9)
            .filter_map(|r| self.materialize(r))
            .collect();
        Ok(hits)
    }

    fn materialize(&self, result: &SearchResult) -> Option<RecallHit> {
        let body = self.texts.get(result.id)?;
        Some(RecallHit {
            id: result.id,
            score: result.score,
            body: body.to_string(),
            metadata: self.metas.get(result.id).map(str::to_string),
        })
    }

    /// Write all three sidecars.
    pub fn persist(&self) -> Result<(), EngineError> {
        self.paths.ensure_parent_dirs()?;
        self.index.save(&self.paths.index)?;
        self.texts.save(&self.paths.text)?;
        self.metas.save(&self.paths.meta)?;
        Ok(())
    }
}
