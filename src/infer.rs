//! Transformer forward pass and the text embedder
//!
//! Hybrid CPU/GPU split: matrix multiplies go through the
//! [`GpuContext`](crate::gpu::GpuContext) matmul kernel, while the
//! element-wise and small-reduction work (RMSNorm, RoPE, softmax, SwiGLU,
//! residual adds) stays on the host. At sequence width 1 the
//! synchronization cost of dispatching those as kernels exceeds their
//! compute time.

use crate::arena::Arena;
use crate::gpu::{GpuContext, GpuError};
use crate::model::{Config, Weights};
use crate::tokenizer::Tokenizer;

const RMS_EPS: f32 = 1e-5;

/// Per-token scratch buffers plus the KV cache.
///
/// Embedding a short string writes cache positions `0..n-1` sequentially,
/// which implicitly resets whatever the previous string left behind.
pub struct RunState {
    /// Residual stream at the current position (dim).
    pub x: Vec<f32>,
    /// Branch buffer (dim).
    pub xb: Vec<f32>,
    /// Second branch buffer (dim).
    pub xb2: Vec<f32>,
    /// FFN hidden buffer (hidden_dim).
    pub hb: Vec<f32>,
    /// FFN gate buffer (hidden_dim).
    pub hb2: Vec<f32>,
    /// Query projection (dim).
    pub q: Vec<f32>,
    /// Key projection (kv_dim).
    pub k: Vec<f32>,
    /// Value projection (kv_dim).
    pub v: Vec<f32>,
    /// Attention scores (n_heads, seq_len).
    pub att: Vec<f32>,
    /// Classifier output (vocab_size).
    pub logits: Vec<f32>,
    key_cache: Vec<f32>,
    value_cache: Vec<f32>,
}

impl RunState {
    pub fn new(config: &Config) -> Self {
        let dim = config.dim as usize;
        let hidden = config.hidden_dim as usize;
        let kv_dim = config.kv_dim();
        let layers = config.n_layers as usize;
        let seq_len = config.seq_len as usize;
        let cache = layers * seq_len * kv_dim;

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hidden],
            hb2: vec![0.0; hidden],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; config.n_heads as usize * seq_len],
            logits: vec![0.0; config.vocab_size as usize],
            key_cache: vec![0.0; cache],
            value_cache: vec![0.0; cache],
        }
    }
}

/// `out = w * x / sqrt(mean(x^2) + eps)`
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32]) {
    let scale = rms_scale(x);
    for i in 0..out.len() {
        out[i] = weight[i] * (scale * x[i]);
    }
}

/// In-place variant used for the final norm.
pub fn rmsnorm_in_place(x: &mut [f32], weight: &[f32]) {
    let scale = rms_scale(x);
    for i in 0..x.len() {
        x[i] = weight[i] * (scale * x[i]);
    }
}

fn rms_scale(x: &[f32]) -> f32 {
    let mut ss = 0.0f32;
    for &v in x {
        ss += v * v;
    }
    ss /= x.len() as f32;
    1.0 / (ss + RMS_EPS).sqrt()
}

/// Max-subtracting softmax, in place.
pub fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

fn silu(u: f32) -> f32 {
    u * (1.0 / (1.0 + (-u).exp()))
}

/// Rotate the `(2i, 2i+1)` pairs of `q` (all of it) and `k` (below kv_dim)
/// by the position-dependent angle. Frequencies are head-local.
fn rope(q: &mut [f32], k: &mut [f32], pos: usize, head_size: usize, kv_dim: usize) {
    for i in (0..q.len()).step_by(2) {
        let head_dim = i % head_size;
        let freq = 1.0 / 10000f32.powf(head_dim as f32 / head_size as f32);
        let angle = pos as f32 * freq;
        let (sin, cos) = angle.sin_cos();

        let (q0, q1) = (q[i], q[i + 1]);
        q[i] = q0 * cos - q1 * sin;
        q[i + 1] = q0 * sin + q1 * cos;

        if i < kv_dim {
            let (k0, k1) = (k[i], k[i + 1]);
            k[i] = k0 * cos - k1 * sin;
            k[i + 1] = k0 * sin + k1 * cos;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// One forward step for `token` at position `pos`.
///
/// On return, `state.x` holds the post-final-RMSNorm residual and
/// `state.logits` the classifier output.
pub fn forward(
    state: &mut RunState,
    config: &Config,
    weights: &Weights,
    arena: &Arena,
    gpu: &GpuContext,
    token: u32,
    pos: usize,
) -> Result<(), GpuError> {
    let dim = config.dim as usize;
    let hidden = config.hidden_dim as usize;
    let head_size = config.head_size();
    let kv_dim = config.kv_dim();
    let kv_mul = config.kv_mul();
    let seq_len = config.seq_len as usize;
    let n_heads = config.n_heads as usize;

    // 1. Embedding row into the residual stream.
    let embedding = arena.f32s(weights.token_embedding);
    let row = &embedding[token as usize * dim..(token as usize + 1) * dim];
    state.x.copy_from_slice(row);

    for l in 0..config.n_layers as usize {
        let rms_att = arena.f32s(weights.rms_att);
        rmsnorm(&mut state.xb, &state.x, &rms_att[l * dim..(l + 1) * dim]);

        // QKV projections.
        gpu.matmul(
            &mut state.q,
            &state.xb,
            weights.wq.offset_f32 + (l * dim * dim) as u32,
            dim,
            dim,
        )?;
        gpu.matmul(
            &mut state.k,
            &state.xb,
            weights.wk.offset_f32 + (l * dim * kv_dim) as u32,
            dim,
            kv_dim,
        )?;
        gpu.matmul(
            &mut state.v,
            &state.xb,
            weights.wv.offset_f32 + (l * dim * kv_dim) as u32,
            dim,
            kv_dim,
        )?;

        rope(&mut state.q, &mut state.k, pos, head_size, kv_dim);

        // KV cache write at (l, pos).
        let loff = l * seq_len * kv_dim;
        state.key_cache[loff + pos * kv_dim..loff + (pos + 1) * kv_dim].copy_from_slice(&state.k);
        state.value_cache[loff + pos * kv_dim..loff + (pos + 1) * kv_dim].copy_from_slice(&state.v);

        // Grouped-query attention, one query head at a time.
        let inv_sqrt_hs = 1.0 / (head_size as f32).sqrt();
        for h in 0..n_heads {
            let q = &state.q[h * head_size..(h + 1) * head_size];
            let att = &mut state.att[h * seq_len..h * seq_len + pos + 1];

            for (t, score) in att.iter_mut().enumerate() {
                let koff = loff + t * kv_dim + (h / kv_mul) * head_size;
                let key = &state.key_cache[koff..koff + head_size];
                *score = dot(q, key) * inv_sqrt_hs;
            }
            softmax(att);

            let xb = &mut state.xb[h * head_size..(h + 1) * head_size];
            xb.fill(0.0);
            for t in 0..=pos {
                let voff = loff + t * kv_dim + (h / kv_mul) * head_size;
                let value = &state.value_cache[voff..voff + head_size];
                let a = state.att[h * seq_len + t];
                for i in 0..head_size {
                    xb[i] += a * value[i];
                }
            }
        }

        // Output projection and residual.
        gpu.matmul(
            &mut state.xb2,
            &state.xb,
            weights.wo.offset_f32 + (l * dim * dim) as u32,
            dim,
            dim,
        )?;
        for i in 0..dim {
            state.x[i] += state.xb2[i];
        }

        // FFN.
        let rms_ffn = arena.f32s(weights.rms_ffn);
        rmsnorm(&mut state.xb, &state.x, &rms_ffn[l * dim..(l + 1) * dim]);

        gpu.matmul(
            &mut state.hb,
            &state.xb,
            weights.w1.offset_f32 + (l * hidden * dim) as u32,
            dim,
            hidden,
        )?;
        gpu.matmul(
            &mut state.hb2,
            &state.xb,
            weights.w3.offset_f32 + (l * hidden * dim) as u32,
            dim,
            hidden,
        )?;

        // SwiGLU gate.
        for i in 0..hidden {
            state.hb[i] = silu(state.hb[i]) * state.hb2[i];
        }

        gpu.matmul(
            &mut state.xb,
            &state.hb,
            weights.w2.offset_f32 + (l * dim * hidden) as u32,
            hidden,
            dim,
        )?;
        for i in 0..dim {
            state.x[i] += state.xb[i];
        }
    }

    let rms_final = arena.f32s(weights.rms_final);
    rmsnorm_in_place(&mut state.x, rms_final);

    gpu.matmul(
        &mut state.logits,
        &state.x,
        weights.wcls.offset_f32,
        dim,
        config.vocab_size as usize,
    )?;

    Ok(())
}

/// L2-normalize into a fresh vector; norms below the threshold collapse to
/// the zero vector.
pub fn l2_normalize(x: &[f32]) -> Vec<f32> {
    let norm = x.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-5 {
        x.iter().map(|v| v / norm).collect()
    } else {
        vec![0.0; x.len()]
    }
}

/// Embed a whole string: tokenize, run the forward pass over every
/// position, and L2-normalize the final residual.
pub fn embed(
    state: &mut RunState,
    config: &Config,
    weights: &Weights,
    tokenizer: &Tokenizer,
    arena: &Arena,
    gpu: &GpuContext,
    text: &str,
) -> Result<Vec<f32>, GpuError> {
    let mut tokens = tokenizer.encode(text);
    tokens.truncate(config.seq_len as usize);
    tracing::debug!(n_tokens = tokens.len(), "embedding text");

    if tokens.is_empty() {
        return Ok(vec![0.0; config.dim as usize]);
    }

    for (pos, &token) in tokens.iter().enumerate() {
        forward(state, config, weights, arena, gpu, token, pos)?;
    }

    Ok(l2_normalize(&state.x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmsnorm_with_unit_weights_is_idempotent() {
        let weight = vec![1.0f32; 8];
        let x: Vec<f32> = (1..=8).map(|v| v as f32).collect();

        let mut once = vec![0.0; 8];
        rmsnorm(&mut once, &x, &weight);
        let mut twice = once.clone();
        rmsnorm_in_place(&mut twice, &weight);

        for (a, b) in once.iter().zip(&twice) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn softmax_is_a_distribution() {
        let mut x = vec![3.0f32, 1.0, 0.2, -2.0];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(x.windows(2).all(|w| w[0] >= w[1]), "order preserved: {x:?}");
    }

    #[test]
    fn softmax_survives_large_inputs() {
        // Max-subtraction keeps exp() from overflowing.
        let mut x = vec![1000.0f32, 999.0, 998.0];
        softmax(&mut x);
        assert!(x.iter().all(|v| v.is_finite()));
        assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let head_size = 4;
        let mut q: Vec<f32> = (0..8).map(|v| v as f32 + 1.0).collect();
        let mut k: Vec<f32> = (0..4).map(|v| v as f32 + 1.0).collect();
        let q_before: Vec<f32> = q.chunks(2).map(|p| p[0].hypot(p[1])).collect();
        let k_before: Vec<f32> = k.chunks(2).map(|p| p[0].hypot(p[1])).collect();

        rope(&mut q, &mut k, 7, head_size, 4);

        let q_after: Vec<f32> = q.chunks(2).map(|p| p[0].hypot(p[1])).collect();
        let k_after: Vec<f32> = k.chunks(2).map(|p| p[0].hypot(p[1])).collect();
        for (a, b) in q_before.iter().zip(&q_after) {
            assert!((a - b).abs() < 1e-4);
        }
        for (a, b) in k_before.iter().zip(&k_after) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let mut q = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut k = vec![5.0f32, 6.0];
        rope(&mut q, &mut k, 0, 4, 2);
        assert_eq!(q, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(k, vec![5.0, 6.0]);
    }

    #[test]
    fn l2_normalize_yields_unit_norm() {
        let v = vec![3.0f32, -4.0, 12.0, 0.5, -2.5];
        let e = l2_normalize(&v);
        let norm = e.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn l2_normalize_collapses_tiny_norms_to_zero() {
        let v = vec![1e-7f32, -1e-7, 0.0];
        assert_eq!(l2_normalize(&v), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn silu_matches_definition() {
        for u in [-3.0f32, -0.5, 0.0, 0.5, 3.0] {
            let expected = u / (1.0 + (-u).exp());
            assert!((silu(u) - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn run_state_buffer_shapes() {
        let config = Config {
            dim: 8,
            hidden_dim: 16,
            n_layers: 3,
            n_heads: 4,
            n_kv_heads: 2,
            vocab_size: 32,
            seq_len: 10,
        };
        let state = RunState::new(&config);
        assert_eq!(state.x.len(), 8);
        assert_eq!(state.hb.len(), 16);
        assert_eq!(state.k.len(), config.kv_dim());
        assert_eq!(state.att.len(), 4 * 10);
        assert_eq!(state.logits.len(), 32);
        assert_eq!(state.key_cache.len(), 3 * 10 * config.kv_dim());
    }
}
