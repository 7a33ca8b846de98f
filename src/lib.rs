//! Memo-DB: a GPU-accelerated semantic memory engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CLI (save / recall)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Embedder: BPE tokenizer → transformer forward pass        │
//! │              (host element-wise, GPU matmuls)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │   VectorIndex · TextStore · MetaStore (flat, parallel IDs)  │
//! │        brute-force GPU similarity + metadata pre-filter     │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Binary sidecars: <base>.memo / .txt / .meta          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is single-threaded by design: every GPU dispatch is followed
//! by a host-side wait, and all stores share one dense ID space where a
//! record's ID equals its insertion position.

pub mod arena;
pub mod engine;
pub mod filter;
pub mod gpu;
pub mod index;
pub mod infer;
pub mod meta;
pub mod model;
pub mod sidecar;
pub mod text;
pub mod tokenizer;

pub use arena::Arena;
pub use engine::MemoryEngine;
pub use gpu::GpuContext;
pub use index::{Metric, VectorIndex};
pub use meta::MetaStore;
pub use text::TextStore;
pub use tokenizer::Tokenizer;
