//! Render pipelines shared by every draw of the wgpu backend.
//!
//! All pipelines use the same bind group layout: a uniform [`Params`] block at
//! binding 0 and the source texture at binding 1. Vertices are plain pixel
//! positions; the vertex shader maps them to clip space using
//! `Params::target_size`. Fragment shaders read their source with
//! `textureLoad`, so no sampler is involved.

use crate::region::Rect;
use crate::render::ImageOp;
use wgpu::util::DeviceExt;

/// Format of every texture the backend creates. Colors are premultiplied.
pub const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Uniform block, mirrored by `Params` in [`COMMON_WGSL`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Params {
    pub target_size: [f32; 2],
    /// Target pixel of source texel `(0, 0)`.
    pub offset: [i32; 2],
    /// Readable source texels as `[x1, y1, x2, y2]`.
    pub bounds: [i32; 4],
    pub color: [f32; 4],
    pub op: u32,
    pub value: f32,
    pub _pad: [u32; 2],
}

impl Params {
    pub fn new(target: (u32, u32)) -> Self {
        Self {
            target_size: [target.0 as f32, target.1 as f32],
            ..Default::default()
        }
    }

    /// Places source texel `(0, 0)` at `offset` and limits reads to `bounds`.
    pub fn with_source(mut self, offset: (i32, i32), bounds: Rect) -> Self {
        self.offset = [offset.0, offset.1];
        self.bounds = [bounds.x1, bounds.y1, bounds.x2, bounds.y2];
        self
    }
}

pub const COMMON_WGSL: &str = r#"
struct Params {
    target_size: vec2<f32>,
    offset: vec2<i32>,
    bounds: vec4<i32>,
    color: vec4<f32>,
    op: u32,
    value: f32,
    pad: vec2<u32>,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var src: texture_2d<f32>;

@vertex
fn vs_main(@location(0) p: vec2<f32>) -> @builtin(position) vec4<f32> {
    let ndc = vec2<f32>(
        p.x / params.target_size.x * 2.0 - 1.0,
        1.0 - p.y / params.target_size.y * 2.0,
    );
    return vec4<f32>(ndc, 0.0, 1.0);
}

fn source_texel(pos: vec4<f32>) -> vec2<i32> {
    return vec2<i32>(floor(pos.xy)) - params.offset;
}

fn readable(t: vec2<i32>) -> bool {
    return all(t >= params.bounds.xy) && all(t < params.bounds.zw);
}
"#;

const COMPOSE_WGSL: &str = r#"
@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let t = source_texel(pos);
    if (!readable(t)) {
        return vec4<f32>(0.0);
    }
    return textureLoad(src, t, 0) * params.value;
}
"#;

const FILL_WGSL: &str = r#"
@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    return params.color;
}
"#;

const IMAGE_OP_WGSL: &str = r#"
@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let c = textureLoad(src, source_texel(pos), 0);
    switch params.op {
        case 0u: {
            return c * params.value;
        }
        case 1u: {
            return vec4<f32>(vec3<f32>(c.a) - c.rgb, c.a);
        }
        case 2u: {
            return vec4<f32>(c.rgb * (1.0 - params.value), c.a);
        }
        default: {
            if (c.a == 0.0) {
                return c;
            }
            let brightness = dot(c.rgb, vec3<f32>(0.2126, 0.7152, 0.0722)) / c.a;
            if (brightness > params.value) {
                return vec4<f32>(c.rgb * (params.value / brightness), c.a);
            }
            return c;
        }
    }
}
"#;

/// Shader-side code and value of an image operation.
pub fn op_params(op: ImageOp) -> (u32, f32) {
    match op {
        ImageOp::ApplyAlphaAll(alpha) | ImageOp::ApplyAlpha(alpha) => (0, alpha as f32),
        ImageOp::InvertColorAll => (1, 0.0),
        ImageOp::DimAll(dim) => (2, dim as f32),
        ImageOp::MaxBrightness(max) => (3, max as f32),
    }
}

/// Premultiplied "over".
const BLEND_OVER: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
};

pub struct Pipelines {
    pub layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pub compose: wgpu::RenderPipeline,
    pub fill: wgpu::RenderPipeline,
    pub image_op: wgpu::RenderPipeline,
}

impl Pipelines {
    pub fn new(device: &wgpu::Device) -> Self {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compositor bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("compositor pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let compose = create_pipeline(device, &pipeline_layout, "compose", COMPOSE_WGSL, Some(BLEND_OVER));
        let fill = create_pipeline(device, &pipeline_layout, "fill", FILL_WGSL, Some(BLEND_OVER));
        let image_op = create_pipeline(device, &pipeline_layout, "image op", IMAGE_OP_WGSL, None);

        Self {
            layout,
            pipeline_layout,
            compose,
            fill,
            image_op,
        }
    }

    /// Builds a pipeline from a fragment shader written against
    /// [`COMMON_WGSL`]. With `blend` the output is composited "over" the
    /// target, otherwise it replaces it.
    pub fn custom(&self, device: &wgpu::Device, label: &str, fragment: &str, blend: bool) -> wgpu::RenderPipeline {
        let blend = if blend { Some(BLEND_OVER) } else { None };
        create_pipeline(device, &self.pipeline_layout, label, fragment, blend)
    }

    pub fn bind_group(&self, device: &wgpu::Device, params: &Params, source: &wgpu::TextureView) -> wgpu::BindGroup {
        let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("compositor params"),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("compositor bind group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(source),
                },
            ],
        })
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    label: &str,
    fragment: &str,
    blend: Option<wgpu::BlendState>,
) -> wgpu::RenderPipeline {
    let source = format!("{COMMON_WGSL}{fragment}");
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &[wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x2,
                    offset: 0,
                    shader_location: 0,
                }],
            }],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: TEXTURE_FORMAT,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// Two triangles per rect, in pixel coordinates.
pub fn quads(rects: &[Rect]) -> Vec<[f32; 2]> {
    let mut vertices = Vec::with_capacity(rects.len() * 6);
    for r in rects {
        let (x1, y1, x2, y2) = (r.x1 as f32, r.y1 as f32, r.x2 as f32, r.y2 as f32);
        vertices.extend_from_slice(&[[x1, y1], [x2, y1], [x1, y2], [x1, y2], [x2, y1], [x2, y2]]);
    }
    vertices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_the_uniform_layout() {
        assert_eq!(std::mem::size_of::<Params>(), 64);
    }

    #[test]
    fn quads_emit_six_vertices_per_rect() {
        let v = quads(&[Rect::new(0, 0, 2, 3), Rect::new(5, 5, 1, 1)]);
        assert_eq!(v.len(), 12);
        assert_eq!(v[0], [0.0, 0.0]);
        assert_eq!(v[5], [2.0, 3.0]);
        assert_eq!(v[11], [6.0, 6.0]);
    }

    #[test]
    fn image_ops_map_to_shader_codes() {
        assert_eq!(op_params(ImageOp::ApplyAlpha(0.5)), (0, 0.5));
        assert_eq!(op_params(ImageOp::InvertColorAll).0, 1);
        assert_eq!(op_params(ImageOp::DimAll(0.25)), (2, 0.25));
        assert_eq!(op_params(ImageOp::MaxBrightness(0.75)), (3, 0.75));
    }
}
