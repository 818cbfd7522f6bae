use std::sync::Arc;

/// RGBA -> packed planar I420, one byte per invocation written with
/// `atomicOr` (the storage buffer is cleared before each pass). BT.601.
const YUV_PACK_SHADER: &str = r#"
struct Dims {
    width: u32,
    height: u32,
}

@group(0) @binding(0) var tex: texture_2d<f32>;
@group(0) @binding(1) var<storage, read_write> packed_out: array<atomic<u32>>;
@group(0) @binding(2) var<uniform> dims: Dims;

fn write_byte(index: u32, value: u32) {
    let word = index / 4u;
    let shift = (index % 4u) * 8u;
    atomicOr(&packed_out[word], (value & 0xffu) << shift);
}

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= dims.width || id.y >= dims.height) {
        return;
    }

    let rgba = textureLoad(tex, vec2<i32>(id.xy), 0);
    let r = rgba.r;
    let g = rgba.g;
    let b = rgba.b;

    let y = clamp((0.299 * r + 0.587 * g + 0.114 * b) * 255.0, 0.0, 255.0);
    write_byte(id.y * dims.width + id.x, u32(y));

    if ((id.x % 2u == 0u) && (id.y % 2u == 0u)) {
        let u = clamp((-0.168736 * r - 0.331264 * g + 0.5 * b) * 255.0 + 128.0, 0.0, 255.0);
        let v = clamp((0.5 * r - 0.418688 * g - 0.081312 * b) * 255.0 + 128.0, 0.0, 255.0);

        let y_size = dims.width * dims.height;
        let uv_width = dims.width / 2u;
        let uv_index = (id.y / 2u) * uv_width + (id.x / 2u);
        write_byte(y_size + uv_index, u32(u));
        write_byte(y_size + y_size / 4u + uv_index, u32(v));
    }
}
"#;

/// GPU compute capability. Detected once at session configuration; a session
/// that starts without one stays on the CPU path for its whole lifetime.
pub struct Accelerator {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl Accelerator {
    /// Probes for a usable adapter, trying the fallback (software) adapter
    /// first so headless CI behaves the same as real hardware. `None` means
    /// the caller must use the synchronous CPU conversion path.
    pub async fn detect() -> Option<Accelerator> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY | wgpu::Backends::GL,
            ..Default::default()
        });

        let adapter = match instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: true,
            })
            .await
        {
            Some(adapter) => Some(adapter),
            None => {
                instance
                    .request_adapter(&wgpu::RequestAdapterOptions {
                        power_preference: wgpu::PowerPreference::LowPower,
                        compatible_surface: None,
                        force_fallback_adapter: false,
                    })
                    .await
            }
        };
        let Some(adapter) = adapter else {
            log::warn!("no gpu adapter found");
            return None;
        };

        match adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("frame-bus accelerator"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
        {
            Ok((device, queue)) => {
                log::info!("gpu accelerator ready: {}", adapter.get_info().name);
                Some(Accelerator {
                    device: Arc::new(device),
                    queue: Arc::new(queue),
                })
            }
            Err(e) => {
                log::warn!("gpu device request failed: {e}");
                None
            }
        }
    }
}

/// Byte length of the kernel's packed I420 output, padded to the 4-byte
/// alignment wgpu requires for buffer copies and clears.
pub fn packed_i420_len(width: u32, height: u32) -> u64 {
    let len = width as u64 * height as u64 * 3 / 2;
    (len + 3) & !3
}

/// Per-session compute resources for the RGBA -> I420 transform. The storage
/// buffer is the "current" frame's output; the readback ring copies out of
/// it.
pub struct YuvPackKernel {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    texture: wgpu::Texture,
    storage: wgpu::Buffer,
    width: u32,
    height: u32,
}

impl YuvPackKernel {
    pub fn new(acc: &Accelerator, width: u32, height: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(
            width % 2 == 0 && height % 2 == 0,
            "I420 needs even dimensions, got {width}x{height}"
        );
        let device = &acc.device;

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("yuv-pack input"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let storage = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("yuv-pack output"),
            size: packed_i420_len(width, height),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("yuv-pack dims"),
            size: 8,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        acc.queue.write_buffer(&uniform, 0, &{
            let mut dims = [0u8; 8];
            dims[..4].copy_from_slice(&width.to_le_bytes());
            dims[4..].copy_from_slice(&height.to_le_bytes());
            dims
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("yuv-pack"),
            source: wgpu::ShaderSource::Wgsl(YUV_PACK_SHADER.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("yuv-pack pipeline"),
            layout: None,
            module: &shader,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("yuv-pack bind group"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(
                        &texture.create_view(&wgpu::TextureViewDescriptor::default()),
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: storage.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniform.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            pipeline,
            bind_group,
            texture,
            storage,
            width,
            height,
        })
    }

    /// Uploads one RGBA capture frame into the input texture.
    pub fn upload_rgba(&self, acc: &Accelerator, rgba: &[u8]) -> anyhow::Result<()> {
        let expected = self.width as usize * self.height as usize * 4;
        anyhow::ensure!(
            rgba.len() == expected,
            "rgba frame is {} bytes, expected {expected}",
            rgba.len()
        );
        acc.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(self.width * 4),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    /// Records the conversion pass. The shader accumulates with `atomicOr`,
    /// so the output buffer is cleared first.
    pub fn record(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.storage, 0, None);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("yuv-pack pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.dispatch_workgroups(self.width.div_ceil(8), self.height.div_ceil(8), 1);
    }

    pub fn storage(&self) -> &wgpu::Buffer {
        &self.storage
    }

    pub fn packed_len(&self) -> u64 {
        packed_i420_len(self.width, self.height)
    }
}

/// Synchronous CPU fallback for sessions without an accelerator. Same BT.601
/// coefficients and top-left chroma siting as the compute kernel.
pub fn rgba_to_i420(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    debug_assert_eq!(rgba.len(), w * h * 4);

    let y_size = w * h;
    let mut out = vec![0u8; y_size + y_size / 2];
    let (y_plane, uv_planes) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(y_size / 4);

    for row in 0..h {
        for col in 0..w {
            let px = (row * w + col) * 4;
            let r = rgba[px] as f32;
            let g = rgba[px + 1] as f32;
            let b = rgba[px + 2] as f32;

            let y = 0.299 * r + 0.587 * g + 0.114 * b;
            y_plane[row * w + col] = y.clamp(0.0, 255.0) as u8;

            if row % 2 == 0 && col % 2 == 0 {
                let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
                let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
                let uv_idx = (row / 2) * (w / 2) + col / 2;
                u_plane[uv_idx] = u.clamp(0.0, 255.0) as u8;
                v_plane[uv_idx] = v.clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}
