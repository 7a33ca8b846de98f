//! GPU compute orchestrator
//!
//! Owns one logical device and one compute queue, and two independent
//! pipelines with disjoint buffer sets:
//!
//! - **matmul**: `out = W · x` against the device-resident weights region,
//!   addressed by a float offset carried in push constants. Drives every
//!   matrix multiply of the transformer forward pass.
//! - **similarity**: brute-force scoring of a packed `count × dim` region
//!   against one query vector, metric selected by push constant.
//!
//! Every dispatch is submitted alone and followed by a blocking wait before
//! the readback buffer is touched; there is never more than one submission
//! in flight. Device loss or a failed map is unrecoverable
//! ([`GpuError::Dispatch`]).

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

const WORKGROUP_SIZE: u32 = 256;

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("gpu initialization failed: {0}")]
    Init(String),

    #[error("gpu dispatch failed: {0}")]
    Dispatch(String),
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MatmulPush {
    weight_offset: u32,
    n: u32,
    d: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SimilarityPush {
    count: u32,
    dim: u32,
    metric: u32,
}

/// One compute pipeline with its bind group and readback staging buffer.
struct Pass {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    readback: wgpu::Buffer,
}

/// Buffers for the matmul path. `weights` is uploaded once at startup;
/// `input`/`output` are reused for every call.
struct MatmulBuffers {
    input: wgpu::Buffer,
    output: wgpu::Buffer,
    max_input: usize,
    max_output: usize,
    pass: Pass,
}

/// Buffers for the similarity path, sized for the index capacity.
struct SimilarityBuffers {
    vectors: wgpu::Buffer,
    query: wgpu::Buffer,
    scores: wgpu::Buffer,
    capacity: usize,
    dim: usize,
    pass: Pass,
}

pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    matmul: Option<MatmulBuffers>,
    similarity: Option<SimilarityBuffers>,
}

impl GpuContext {
    /// Discover a device with a compute queue. Fatal on any failure.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| GpuError::Init("no compatible adapter found".into()))?;

        let info = adapter.get_info();
        tracing::debug!(name = %info.name, backend = ?info.backend, "selected adapter");

        let adapter_limits = adapter.limits();
        let limits = wgpu::Limits {
            max_push_constant_size: 16,
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("memo-db"),
                required_features: wgpu::Features::PUSH_CONSTANTS,
                required_limits: limits,
            },
            None,
        ))
        .map_err(|e| GpuError::Init(format!("device request failed: {e}")))?;

        Ok(Self {
            device,
            queue,
            matmul: None,
            similarity: None,
        })
    }

    fn storage_layout(&self, label: &str) -> wgpu::BindGroupLayout {
        let entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        self.device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &[entry(0, true), entry(1, true), entry(2, false)],
            })
    }

    fn compute_pipeline(
        &self,
        label: &str,
        source: &str,
        layout: &wgpu::BindGroupLayout,
        push_size: u32,
    ) -> wgpu::ComputePipeline {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[layout],
                push_constant_ranges: &[wgpu::PushConstantRange {
                    stages: wgpu::ShaderStages::COMPUTE,
                    range: 0..push_size,
                }],
            });
        self.device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: Default::default(),
            })
    }

    fn storage_buffer(&self, label: &str, size: usize, readable: bool) -> wgpu::Buffer {
        let mut usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        if readable {
            usage |= wgpu::BufferUsages::COPY_SRC;
        }
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size as u64,
            usage,
            mapped_at_creation: false,
        })
    }

    fn readback_buffer(&self, label: &str, size: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        })
    }

    fn bind_three(
        &self,
        label: &str,
        layout: &wgpu::BindGroupLayout,
        buffers: [&wgpu::Buffer; 3],
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers[0].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers[1].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers[2].as_entire_binding(),
                },
            ],
        })
    }

    /// Upload the weight region and build the matmul pipeline.
    ///
    /// `max_input` / `max_output` are element counts bounding every later
    /// call (the largest of dim, hidden_dim and vocab_size).
    pub fn load_weights(
        &mut self,
        weight_bytes: &[u8],
        max_input: usize,
        max_output: usize,
    ) -> Result<(), GpuError> {
        let weights = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("weights"),
            size: weight_bytes.len() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&weights, 0, weight_bytes);

        let input = self.storage_buffer("matmul-input", max_input * 4, false);
        let output = self.storage_buffer("matmul-output", max_output * 4, true);
        let readback = self.readback_buffer("matmul-readback", max_output * 4);

        let layout = self.storage_layout("matmul-layout");
        let pipeline = self.compute_pipeline(
            "matmul",
            include_str!("shaders/matmul.wgsl"),
            &layout,
            std::mem::size_of::<MatmulPush>() as u32,
        );
        let bind_group = self.bind_three("matmul-bind", &layout, [&weights, &input, &output]);

        // Flush the weight upload before the first dispatch.
        self.queue.submit(std::iter::empty());
        let _ = self.device.poll(wgpu::Maintain::Wait);
        tracing::debug!(bytes = weight_bytes.len(), "weights uploaded");

        self.matmul = Some(MatmulBuffers {
            input,
            output,
            max_input,
            max_output,
            pass: Pass {
                pipeline,
                bind_group,
                readback,
            },
        });
        Ok(())
    }

    /// Allocate the similarity buffer set for an index of `capacity` vectors.
    pub fn prepare_similarity(&mut self, capacity: usize, dim: usize) -> Result<(), GpuError> {
        let cap = capacity.max(1);
        let vectors = self.storage_buffer("similarity-vectors", cap * dim * 4, false);
        let query = self.storage_buffer("similarity-query", dim * 4, false);
        let scores = self.storage_buffer("similarity-scores", cap * 4, true);
        let readback = self.readback_buffer("similarity-readback", cap * 4);

        let layout = self.storage_layout("similarity-layout");
        let pipeline = self.compute_pipeline(
            "similarity",
            include_str!("shaders/similarity.wgsl"),
            &layout,
            std::mem::size_of::<SimilarityPush>() as u32,
        );
        let bind_group = self.bind_three("similarity-bind", &layout, [&vectors, &query, &scores]);

        self.similarity = Some(SimilarityBuffers {
            vectors,
            query,
            scores,
            capacity,
            dim,
            pass: Pass {
                pipeline,
                bind_group,
                readback,
            },
        });
        Ok(())
    }

    /// Record one dispatch, submit it, and block until the copied-out
    /// region of `copy_src` lands in `out`.
    fn dispatch_and_read(
        &self,
        pass: &Pass,
        push_bytes: &[u8],
        groups: u32,
        copy_src: &wgpu::Buffer,
        out: &mut [f32],
    ) -> Result<(), GpuError> {
        let out_bytes = std::mem::size_of_val(out) as u64;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            cpass.set_pipeline(&pass.pipeline);
            cpass.set_bind_group(0, &pass.bind_group, &[]);
            cpass.set_push_constants(0, push_bytes);
            cpass.dispatch_workgroups(groups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(copy_src, 0, &pass.readback, 0, out_bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = pass.readback.slice(..out_bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| GpuError::Dispatch("map callback dropped".into()))?
            .map_err(|e| GpuError::Dispatch(format!("readback map failed: {e}")))?;

        out.copy_from_slice(bytemuck::cast_slice(&slice.get_mapped_range()));
        pass.readback.unmap();
        Ok(())
    }

    /// `out[..d] = W · x[..n]`, where W is the `d × n` row-major block at
    /// `weight_offset` floats into the uploaded weight region.
    pub fn matmul(
        &self,
        out: &mut [f32],
        x: &[f32],
        weight_offset: u32,
        n: usize,
        d: usize,
    ) -> Result<(), GpuError> {
        let mm = self
            .matmul
            .as_ref()
            .ok_or_else(|| GpuError::Dispatch("matmul buffers not prepared".into()))?;
        debug_assert!(x.len() >= n && n <= mm.max_input);
        debug_assert!(out.len() >= d && d <= mm.max_output);

        self.queue
            .write_buffer(&mm.input, 0, bytemuck::cast_slice(&x[..n]));

        let push = MatmulPush {
            weight_offset,
            n: n as u32,
            d: d as u32,
        };
        let groups = (d as u32).div_ceil(WORKGROUP_SIZE);
        self.dispatch_and_read(
            &mm.pass,
            bytemuck::bytes_of(&push),
            groups,
            &mm.output,
            &mut out[..d],
        )
    }

    /// Score `count` packed vectors against `query`. `metric` is the kernel
    /// selector: 1 = cosine, 2 = dot.
    pub fn similarity(
        &self,
        vectors: &[f32],
        query: &[f32],
        metric: u32,
    ) -> Result<Vec<f32>, GpuError> {
        let sim = self
            .similarity
            .as_ref()
            .ok_or_else(|| GpuError::Dispatch("similarity buffers not prepared".into()))?;
        let dim = sim.dim;
        debug_assert_eq!(query.len(), dim);
        let count = vectors.len() / dim;
        debug_assert!(count <= sim.capacity);

        self.queue
            .write_buffer(&sim.vectors, 0, bytemuck::cast_slice(vectors));
        self.queue
            .write_buffer(&sim.query, 0, bytemuck::cast_slice(query));

        let push = SimilarityPush {
            count: count as u32,
            dim: dim as u32,
            metric,
        };
        let groups = (count as u32).div_ceil(WORKGROUP_SIZE);
        let mut scores = vec![0.0f32; count];
        self.dispatch_and_read(
            &sim.pass,
            bytemuck::bytes_of(&push),
            groups,
            &sim.scores,
            &mut scores,
        )?;
        Ok(scores)
    }
}
