use crate::blur::{passes_margin, BlurMethod};
use crate::errors::BlurError;
use crate::region::{Rect, Region};
use crate::render::backend::{
    Backend, ErasedBlurContext, ExternalHandle, ImageHandle, ImageOp, PixelFormat, RgbaImage,
};
use crate::render::{Color, Viewport};
use anyhow::{anyhow, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

mod blur;
mod pipelines;

use blur::{Scratch, WgpuBlurContext};
use pipelines::{Params, Pipelines, TEXTURE_FORMAT};

/// Number of back buffers painted in turn.
const BACK_BUFFERS: usize = 2;

/// This trait abstracts over the wgpu context (device, queue, texture management) so a host that
/// already owns a wgpu device can share it with the compositor.
pub trait WgpuContextProvider {
    fn device(&self) -> &wgpu::Device;
    fn queue(&self) -> &wgpu::Queue;
    fn create_texture(&self, width: u32, height: u32, format: wgpu::TextureFormat) -> Result<u64>;
    fn get_texture(&self, id: u64) -> Option<(wgpu::Texture, wgpu::TextureView)>;
    fn remove_texture(&self, id: u64);
}

/// A context provider owning its own device, for hosts without a GPU setup of
/// their own and for tests.
pub struct HeadlessContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    textures: RefCell<HashMap<u64, (wgpu::Texture, wgpu::TextureView)>>,
    next_id: Cell<u64>,
}

impl HeadlessContext {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .ok_or_else(|| anyhow!("no suitable GPU adapter found"))?;
        log::info!("Using wgpu adapter {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("compositor"),
                ..Default::default()
            },
            None,
        ))?;
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("Uncaptured wgpu error: {error}");
        }));

        Ok(Self {
            device,
            queue,
            textures: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        })
    }

    pub fn texture_count(&self) -> usize {
        self.textures.borrow().len()
    }
}

impl WgpuContextProvider for HeadlessContext {
    fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn create_texture(&self, width: u32, height: u32, format: wgpu::TextureFormat) -> Result<u64> {
        let (texture, view) = error_scope(&self.device, "create texture", || {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("compositor texture"),
                size: wgpu::Extent3d {
                    width: width.max(1),
                    height: height.max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            (texture, view)
        })?;

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.textures.borrow_mut().insert(id, (texture, view));
        Ok(id)
    }

    fn get_texture(&self, id: u64) -> Option<(wgpu::Texture, wgpu::TextureView)> {
        self.textures.borrow().get(&id).cloned()
    }

    fn remove_texture(&self, id: u64) {
        if let Some((texture, _)) = self.textures.borrow_mut().remove(&id) {
            texture.destroy();
        }
    }
}

/// Runs `f` inside validation and out-of-memory error scopes and turns a
/// captured error into `Err`.
fn error_scope<T>(device: &wgpu::Device, label: &str, f: impl FnOnce() -> T) -> Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let out = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    match validation.or(out_of_memory) {
        Some(err) => Err(anyhow!("wgpu error in {label}: {err}")),
        None => Ok(out),
    }
}

/// Allocates a texture in the context's store, refusing sizes over the
/// device limit up front.
fn allocate<C: WgpuContextProvider>(context: &C, width: u32, height: u32) -> Result<u64> {
    let max = context.device().limits().max_texture_dimension_2d;
    let result = if width > max || height > max {
        Err(anyhow!("texture of {width}x{height} exceeds the device limit of {max}"))
    } else {
        context.create_texture(width, height, TEXTURE_FORMAT)
    };
    if let Err(e) = &result {
        log::error!("WgpuBackend texture allocation failed: {e:#}");
    }
    result
}

/// Allocates the back buffers and the front texture. Nothing is left
/// allocated on failure.
fn allocate_targets<C: WgpuContextProvider>(context: &C, width: u32, height: u32) -> Result<([u64; BACK_BUFFERS], u64)> {
    let mut ids = Vec::with_capacity(BACK_BUFFERS + 1);
    for _ in 0..=BACK_BUFFERS {
        match allocate(context, width, height) {
            Ok(id) => ids.push(id),
            Err(e) => {
                for id in ids {
                    context.remove_texture(id);
                }
                return Err(e);
            }
        }
    }
    Ok(([ids[0], ids[1]], ids[2]))
}

fn copy_info(texture: &wgpu::Texture, x: i32, y: i32) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d {
            x: x as u32,
            y: y as u32,
            z: 0,
        },
        aspect: wgpu::TextureAspect::All,
    }
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// Copies `rects` from `source` to the same position in `target`.
fn copy_rects(encoder: &mut wgpu::CommandEncoder, source: &wgpu::Texture, target: &wgpu::Texture, rects: &[Rect]) {
    for r in rects {
        encoder.copy_texture_to_texture(
            copy_info(source, r.x1, r.y1),
            copy_info(target, r.x1, r.y1),
            extent(r.width() as u32, r.height() as u32),
        );
    }
}

/// wgpu backend: composites on the GPU into textures managed by a
/// [`WgpuContextProvider`].
///
/// Like the cairo backend it paints into alternating back buffers and copies
/// the damaged area into a front texture on present. The front texture's
/// store id is what [`Backend::external_handle`] hands to the host.
pub struct WgpuBackend<C: WgpuContextProvider> {
    context: Arc<C>,
    pipelines: Pipelines,
    viewport: Viewport,
    /// Sizes of the live images, keyed by texture store id.
    images: HashMap<u64, (u32, u32)>,
    back: [u64; BACK_BUFFERS],
    painted_at: [u64; BACK_BUFFERS],
    current: usize,
    front: u64,
    /// Bound as the source of draws that do not read one.
    blank: u64,
    frame_id: u64,
}

impl WgpuBackend<HeadlessContext> {
    /// Creates a backend on a device of its own.
    pub fn new_headless(viewport: Viewport) -> Result<Self> {
        Self::new(Arc::new(HeadlessContext::new()?), viewport)
    }
}

impl<C: WgpuContextProvider> WgpuBackend<C> {
    pub fn new(context: Arc<C>, viewport: Viewport) -> Result<Self> {
        let pipelines = Pipelines::new(context.device());
        let (back, front) = allocate_targets(&*context, viewport.width, viewport.height)?;
        let blank = match allocate(&*context, 1, 1) {
            Ok(id) => id,
            Err(e) => {
                for id in back.iter().chain([&front]) {
                    context.remove_texture(*id);
                }
                return Err(e);
            }
        };

        Ok(Self {
            context,
            pipelines,
            viewport,
            images: HashMap::new(),
            back,
            painted_at: [0; BACK_BUFFERS],
            current: 0,
            front,
            blank,
            frame_id: 0,
        })
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    fn texture(&self, id: u64) -> Result<(wgpu::Texture, wgpu::TextureView)> {
        self.context
            .get_texture(id)
            .ok_or_else(|| anyhow!("WgpuBackend used with unknown texture {id}"))
    }

    fn image_texture(&self, image: &ImageHandle) -> Result<(wgpu::Texture, wgpu::TextureView)> {
        if !self.images.contains_key(&image.id()) {
            return Err(anyhow!("WgpuBackend used with unknown image {}", image.id()));
        }
        self.texture(image.id())
    }

    fn scoped<T>(&self, label: &str, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        error_scope(self.context.device(), label, || f(self))?
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.context
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.context.queue().submit(std::iter::once(encoder.finish()));
    }

    /// Draws `rects` of `target` with `pipeline`, keeping what was there
    /// before.
    fn draw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::RenderPipeline,
        target: &wgpu::TextureView,
        source: &wgpu::TextureView,
        params: &Params,
        rects: &[Rect],
    ) {
        if rects.is_empty() {
            return;
        }
        let device = self.context.device();
        let vertices = pipelines::quads(rects);
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("compositor quads"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let bind_group = self.pipelines.bind_group(device, params, source);

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("compositor pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.set_vertex_buffer(0, vertex_buffer.slice(..));
        pass.draw(0..vertices.len() as u32, 0..1);
    }

    /// Writes the pixels of `image` into texture `id`, converting from
    /// premultiplied ARGB words to RGBA bytes.
    fn upload(&self, id: u64, image: &RgbaImage) -> Result<()> {
        if image.width == 0 || image.height == 0 {
            return Ok(());
        }
        let (texture, _) = self.texture(id)?;
        let mut rgba = Vec::with_capacity((image.width * image.height * 4) as usize);
        for y in 0..image.height {
            for x in 0..image.width {
                let p = image.pixel(x, y);
                rgba.extend_from_slice(&[(p >> 16) as u8, (p >> 8) as u8, p as u8, (p >> 24) as u8]);
            }
        }
        self.context.queue().write_texture(
            copy_info(&texture, 0, 0),
            &rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(image.width * 4),
                rows_per_image: Some(image.height),
            },
            extent(image.width, image.height),
        );
        Ok(())
    }

    fn try_copy(&self, source: &wgpu::Texture, id: u64, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let (copy, _) = self.texture(id)?;
        let mut encoder = self.encoder("copy");
        encoder.copy_texture_to_texture(copy_info(source, 0, 0), copy_info(&copy, 0, 0), extent(width, height));
        self.submit(encoder);
        Ok(())
    }

    fn try_compose(&self, image: &ImageHandle, x: i32, y: i32, region: &Region) -> Result<()> {
        let (_, source) = self.image_texture(image)?;
        let (_, target) = self.texture(self.back[self.current])?;
        let region = region.intersect_rect(self.viewport.bounds());

        let mut params = Params::new((self.viewport.width, self.viewport.height))
            .with_source((x, y), Rect::new(0, 0, image.width() as i32, image.height() as i32));
        params.value = 1.0;

        let mut encoder = self.encoder("compose");
        self.draw(&mut encoder, &self.pipelines.compose, &target, &source, &params, region.rects());
        self.submit(encoder);
        Ok(())
    }

    fn try_image_op(&self, op: ImageOp, image: &ImageHandle, sub_region: Option<&Region>) -> Result<()> {
        let (texture, view) = self.image_texture(image)?;
        let bounds = Rect::new(0, 0, image.width() as i32, image.height() as i32);
        let region = match (op, sub_region) {
            (ImageOp::ApplyAlpha(_), Some(sub)) => sub.intersect_rect(bounds),
            _ => Region::from_rect(bounds),
        };
        if region.is_empty() {
            return Ok(());
        }

        // A texture cannot be sampled and rendered to in the same pass, so
        // the result goes through a scratch texture.
        let scratch_id = allocate(&*self.context, image.width(), image.height())?;
        let result = self.texture(scratch_id).map(|(scratch, scratch_view)| {
            let (code, value) = pipelines::op_params(op);
            let mut params = Params::new((image.width(), image.height())).with_source((0, 0), bounds);
            params.op = code;
            params.value = value;

            let mut encoder = self.encoder("image op");
            self.draw(&mut encoder, &self.pipelines.image_op, &scratch_view, &view, &params, region.rects());
            copy_rects(&mut encoder, &scratch, &texture, region.rects());
            self.submit(encoder);
        });
        self.context.remove_texture(scratch_id);
        result
    }

    fn try_fill(&self, color: Color, region: &Region) -> Result<()> {
        let (_, target) = self.texture(self.back[self.current])?;
        let (_, blank) = self.texture(self.blank)?;
        let region = region.intersect_rect(self.viewport.bounds());

        let mut params = Params::new((self.viewport.width, self.viewport.height));
        params.color = color.premultiplied();

        let mut encoder = self.encoder("fill");
        self.draw(&mut encoder, &self.pipelines.fill, &target, &blank, &params, region.rects());
        self.submit(encoder);
        Ok(())
    }

    /// Makes sure `ctx` has ping-pong textures of the viewport's size plus
    /// the blur margin on each side.
    fn ensure_scratch(&self, ctx: &mut WgpuBlurContext) -> Result<(u64, u64), BlurError> {
        let size = (
            self.viewport.width + 2 * ctx.margin.0 as u32,
            self.viewport.height + 2 * ctx.margin.1 as u32,
        );
        match &ctx.scratch {
            Some(scratch) if scratch.size == size => Ok((scratch.ping, scratch.pong)),
            _ => {
                if let Some(old) = ctx.scratch.take() {
                    self.context.remove_texture(old.ping);
                    self.context.remove_texture(old.pong);
                }
                log::debug!("WgpuBackend blur textures resized to {}x{}", size.0, size.1);
                let allocation = |e: anyhow::Error| BlurError::Allocation(format!("{e:#}"));
                let ping = allocate(&*self.context, size.0, size.1).map_err(allocation)?;
                let pong = match allocate(&*self.context, size.0, size.1) {
                    Ok(id) => id,
                    Err(e) => {
                        self.context.remove_texture(ping);
                        return Err(allocation(e));
                    }
                };
                ctx.scratch = Some(Scratch { ping, pong, size });
                Ok((ping, pong))
            }
        }
    }

    fn try_blur(&self, ctx: &mut WgpuBlurContext, opacity: f64, region: &Region) -> Result<()> {
        let bounds = self.viewport.bounds();
        let (mx, my) = ctx.margin;
        // Everything the passes read, on screen and in scratch coordinates.
        let Some(area) = region.extents().expand(mx, my).intersect(&bounds) else {
            return Ok(());
        };
        let shifted = area.translate(mx, my);

        let (ping, pong) = self.ensure_scratch(ctx)?;
        let (back, back_view) = self.texture(self.back[self.current])?;
        let mut src = self.texture(ping)?;
        let mut dst = self.texture(pong)?;
        let scratch_size = ctx.scratch.as_ref().map_or((0, 0), |s| s.size);

        let mut encoder = self.encoder("blur");
        encoder.copy_texture_to_texture(
            copy_info(&back, area.x1, area.y1),
            copy_info(&src.0, shifted.x1, shifted.y1),
            extent(area.width() as u32, area.height() as u32),
        );

        let mut params = Params::new(scratch_size).with_source((0, 0), shifted);
        params.value = 1.0;
        for pass in &ctx.passes {
            self.draw(&mut encoder, pass, &dst.1, &src.1, &params, &[shifted]);
            std::mem::swap(&mut src, &mut dst);
        }

        let mut params = Params::new((self.viewport.width, self.viewport.height)).with_source((-mx, -my), shifted);
        params.value = opacity as f32;
        let target = region.intersect_rect(bounds);
        self.draw(&mut encoder, &ctx.last, &back_view, &src.1, &params, target.rects());
        self.submit(encoder);
        Ok(())
    }

    /// Reads the front texture back to the CPU.
    pub fn read_front(&self) -> Result<RgbaImage> {
        let (front, _) = self.texture(self.front)?;
        let (width, height) = (self.viewport.width, self.viewport.height);
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = (width * 4).div_ceil(align) * align;

        let device = self.context.device();
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("front readback"),
            size: (padded_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.encoder("readback");
        encoder.copy_texture_to_buffer(
            copy_info(&front, 0, 0),
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );
        self.submit(encoder);

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        rx.recv()??;

        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(padded_row as usize).take(height as usize) {
                for rgba in row[..(width * 4) as usize].chunks_exact(4) {
                    let word = (rgba[3] as u32) << 24 | (rgba[0] as u32) << 16 | (rgba[1] as u32) << 8 | rgba[2] as u32;
                    pixels.extend_from_slice(&word.to_ne_bytes());
                }
            }
        }
        buffer.unmap();

        Ok(RgbaImage::from_raw(pixels, width, height, width * 4, PixelFormat::PreMulArgb32))
    }
}

impl<C: WgpuContextProvider + 'static> Backend for WgpuBackend<C> {
    fn name(&self) -> &'static str {
        "WgpuBackend"
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn max_buffer_age(&self) -> usize {
        BACK_BUFFERS + 1
    }

    fn import_image(&mut self, image: &RgbaImage) -> Result<ImageHandle> {
        let id = allocate(&*self.context, image.width, image.height)?;
        let upload = self.scoped("import image", |b| b.upload(id, image));
        if let Err(e) = upload {
            log::error!("WgpuBackend image import failed: {e:#}");
            self.context.remove_texture(id);
            return Err(e);
        }

        self.images.insert(id, (image.width, image.height));
        Ok(ImageHandle::new(id, image.width, image.height))
    }

    fn compose(&mut self, image: &ImageHandle, dst_x: i32, dst_y: i32, clip: &Region, visible: &Region) {
        let region = clip.intersect(visible);
        if region.is_empty() {
            return;
        }
        if let Err(e) = self.scoped("compose", |b| b.try_compose(image, dst_x, dst_y, &region)) {
            log::error!("WgpuBackend compose failed: {e:#}");
        }
    }

    fn copy(&mut self, image: &ImageHandle, _visible: &Region) -> Result<ImageHandle> {
        let (source, _) = self.image_texture(image)?;
        let id = allocate(&*self.context, image.width(), image.height())?;
        if let Err(e) = self.scoped("copy", |b| b.try_copy(&source, id, image.width(), image.height())) {
            self.context.remove_texture(id);
            return Err(e);
        }

        self.images.insert(id, (image.width(), image.height()));
        Ok(ImageHandle::new(id, image.width(), image.height()))
    }

    fn image_op(&mut self, op: ImageOp, image: &ImageHandle, sub_region: Option<&Region>, _visible: &Region) -> bool {
        match self.scoped("image op", |b| b.try_image_op(op, image, sub_region)) {
            Ok(()) => true,
            Err(e) => {
                log::error!("WgpuBackend image operation {op:?} failed: {e:#}");
                false
            }
        }
    }

    fn release_image(&mut self, image: ImageHandle) {
        if self.images.remove(&image.id()).is_none() {
            log::error!("WgpuBackend released unknown image {}", image.id());
            return;
        }
        self.context.remove_texture(image.id());
    }

    fn fill(&mut self, color: Color, region: &Region) {
        if let Err(e) = self.scoped("fill", |b| b.try_fill(color, region)) {
            log::error!("WgpuBackend fill failed: {e:#}");
        }
    }

    fn present(&mut self, region: &Region) -> Result<()> {
        self.scoped("present", |b| {
            let (back, _) = b.texture(b.back[b.current])?;
            let (front, _) = b.texture(b.front)?;
            let region = region.intersect_rect(b.viewport.bounds());

            let mut encoder = b.encoder("present");
            copy_rects(&mut encoder, &back, &front, region.rects());
            b.submit(encoder);
            Ok(())
        })?;

        self.frame_id = self.frame_id.wrapping_add(1);
        self.painted_at[self.current] = self.frame_id;
        self.current = (self.current + 1) % BACK_BUFFERS;
        Ok(())
    }

    fn buffer_age(&self) -> Option<u32> {
        match self.painted_at[self.current] {
            0 => Some(0),
            painted => Some((self.frame_id + 1 - painted) as u32),
        }
    }

    fn resize(&mut self, viewport: Viewport) -> Result<()> {
        // The old targets stay in place when the new ones cannot be allocated.
        let (back, front) = allocate_targets(&*self.context, viewport.width, viewport.height)?;
        for id in self.back.iter().chain([&self.front]) {
            self.context.remove_texture(*id);
        }
        self.back = back;
        self.front = front;
        self.painted_at = [0; BACK_BUFFERS];
        self.viewport = viewport;
        Ok(())
    }

    fn create_blur_context(&mut self, method: &BlurMethod) -> Result<Box<dyn ErasedBlurContext>, BlurError> {
        let kernels = method.passes()?;
        let margin = passes_margin(&kernels);
        let Some((last_kernel, kernels)) = kernels.split_last() else {
            return Err(BlurError::InvalidKernel("no blur passes".into()));
        };

        let (passes, last) = self
            .scoped("blur shaders", |b| {
                let device = b.context.device();
                let passes = kernels
                    .iter()
                    .map(|k| b.pipelines.custom(device, "blur pass", &blur::kernel_shader(k), false))
                    .collect::<Vec<_>>();
                let last = b
                    .pipelines
                    .custom(device, "last blur pass", &blur::kernel_shader(last_kernel), true);
                Ok((passes, last))
            })
            .map_err(|e| BlurError::Shader(format!("{e:#}")))?;

        log::debug!("WgpuBackend blur context with {} passes, margin {margin:?}", passes.len() + 1);
        Ok(Box::new(WgpuBlurContext {
            passes,
            last,
            margin,
            scratch: None,
        }))
    }

    fn destroy_blur_context(&mut self, mut ctx: Box<dyn ErasedBlurContext>) {
        let Some(ctx) = ctx.as_any_mut().downcast_mut::<WgpuBlurContext>() else {
            log::error!("WgpuBackend asked to destroy a foreign blur context");
            return;
        };
        if let Some(scratch) = ctx.scratch.take() {
            self.context.remove_texture(scratch.ping);
            self.context.remove_texture(scratch.pong);
        }
    }

    fn blur(&mut self, ctx: &mut dyn ErasedBlurContext, opacity: f64, reg_blur: &Region, reg_visible: &Region) -> bool {
        let Some(ctx) = ctx.as_any_mut().downcast_mut::<WgpuBlurContext>() else {
            log::error!("WgpuBackend used with non-wgpu blur context");
            return false;
        };
        let region = reg_blur.intersect(reg_visible);
        if region.is_empty() {
            return true;
        }

        match self.scoped("blur", |b| b.try_blur(ctx, opacity, &region)) {
            Ok(()) => true,
            Err(e) => {
                log::error!("WgpuBackend blur failed: {e:#}");
                false
            }
        }
    }

    fn external_handle(&mut self) -> Option<ExternalHandle> {
        Some(ExternalHandle::WgpuTextureId {
            id: self.front,
            width: self.viewport.width,
            height: self.viewport.height,
            frame_id: self.frame_id,
        })
    }

    fn deinit(&mut self) {
        assert!(
            self.images.is_empty(),
            "WgpuBackend torn down with {} live images",
            self.images.len()
        );
        for id in self.back.iter().chain([&self.front, &self.blank]) {
            self.context.remove_texture(*id);
        }
        log::debug!("WgpuBackend deinitialized after {} frames", self.frame_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// GPU tests need an adapter; machines without one skip them.
    fn backend(width: u32, height: u32) -> Option<WgpuBackend<HeadlessContext>> {
        match WgpuBackend::new_headless(Viewport::new(0, 0, width, height)) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping wgpu test: {e:#}");
                None
            }
        }
    }

    fn full(width: i32, height: i32) -> Region {
        Region::from_rect(Rect::new(0, 0, width, height))
    }

    #[test]
    fn compose_is_clipped_and_presented() {
        let Some(mut backend) = backend(8, 8) else { return };
        let white = backend
            .import_image(&RgbaImage::solid(4, 4, Color::new(1.0, 1.0, 1.0, 1.0)))
            .unwrap();

        backend.compose(&white, 2, 2, &Region::from_rect(Rect::new(0, 0, 3, 8)), &full(8, 8));
        backend.present(&full(8, 8)).unwrap();

        let front = backend.read_front().unwrap();
        assert_eq!(front.pixel(2, 2), 0xffff_ffff);
        assert_eq!(front.pixel(3, 2), 0);
        assert_eq!(front.pixel(1, 2), 0);

        backend.release_image(white);
        backend.deinit();
    }

    #[test]
    fn image_ops_do_not_touch_copies() {
        let Some(mut backend) = backend(4, 4) else { return };
        let image = backend
            .import_image(&RgbaImage::solid(4, 4, Color::new(1.0, 1.0, 1.0, 1.0)))
            .unwrap();
        let copy = backend.copy(&image, &full(4, 4)).unwrap();

        assert!(backend.image_op(ImageOp::InvertColorAll, &copy, None, &full(4, 4)));
        backend.compose(&copy, 0, 0, &full(4, 4), &full(4, 4));
        backend.compose(&image, 0, 0, &full(2, 4), &full(4, 4));
        backend.present(&full(4, 4)).unwrap();

        let front = backend.read_front().unwrap();
        assert_eq!(front.pixel(0, 0), 0xffff_ffff);
        assert_eq!(front.pixel(3, 0), 0xff00_0000);

        backend.release_image(copy);
        backend.release_image(image);
        backend.deinit();
    }

    #[test]
    fn blur_context_lifecycle() {
        let Some(mut backend) = backend(16, 16) else { return };
        let mut ctx = backend
            .create_blur_context(&BlurMethod::Box { radius: 2 })
            .unwrap();
        assert_eq!(ctx.margin(), (2, 2));

        backend.fill(Color::new(1.0, 1.0, 1.0, 1.0), &full(16, 16));
        assert!(backend.blur(ctx.as_mut(), 1.0, &full(16, 16), &full(16, 16)));
        backend.present(&full(16, 16)).unwrap();
        // Blurring a uniform color leaves it unchanged.
        assert_eq!(backend.read_front().unwrap().pixel(8, 8), 0xffff_ffff);

        let textures = backend.context().texture_count();
        backend.destroy_blur_context(ctx);
        assert_eq!(backend.context().texture_count(), textures - 2);
        backend.deinit();
    }

    fn texture_limit(backend: &WgpuBackend<HeadlessContext>) -> u32 {
        backend.context().device().limits().max_texture_dimension_2d
    }

    #[test]
    fn oversized_import_is_an_error() {
        let Some(mut backend) = backend(16, 16) else { return };
        let limit = texture_limit(&backend);
        let textures = backend.context().texture_count();

        let result = backend.import_image(&RgbaImage::solid(limit + 1, 1, Color::BLACK));
        assert!(result.is_err());
        assert_eq!(backend.context().texture_count(), textures);

        let image = backend
            .import_image(&RgbaImage::solid(2, 2, Color::BLACK))
            .unwrap();
        backend.release_image(image);
        backend.deinit();
    }

    #[test]
    fn failed_resize_keeps_old_targets() {
        let Some(mut backend) = backend(4, 4) else { return };
        let limit = texture_limit(&backend);
        let textures = backend.context().texture_count();

        assert!(backend.resize(Viewport::new(0, 0, limit + 1, 4)).is_err());
        assert_eq!(backend.viewport(), Viewport::new(0, 0, 4, 4));
        assert_eq!(backend.context().texture_count(), textures);
        backend.present(&full(4, 4)).unwrap();
        backend.deinit();
    }

    #[test]
    fn blur_scratch_over_limit_is_an_allocation_error() {
        let Some(mut backend) = backend(4, 4) else { return };
        let limit = texture_limit(&backend);
        backend.resize(Viewport::new(0, 0, limit, 1)).unwrap();
        let mut ctx = backend
            .create_blur_context(&BlurMethod::Box { radius: 2 })
            .unwrap();

        let wgpu_ctx = ctx.as_any_mut().downcast_mut::<WgpuBlurContext>().unwrap();
        assert!(matches!(backend.ensure_scratch(wgpu_ctx), Err(BlurError::Allocation(_))));
        assert!(wgpu_ctx.scratch.is_none());

        let screen = full(limit as i32, 1);
        assert!(!backend.blur(ctx.as_mut(), 1.0, &screen, &screen));
        backend.destroy_blur_context(ctx);
        backend.deinit();
    }

    #[test]
    fn buffer_age_follows_back_buffers() {
        let Some(mut backend) = backend(4, 4) else { return };
        assert_eq!(backend.buffer_age(), Some(0));
        backend.present(&full(4, 4)).unwrap();
        assert_eq!(backend.buffer_age(), Some(0));
        backend.present(&full(4, 4)).unwrap();
        assert_eq!(backend.buffer_age(), Some(2));
        backend.deinit();
    }
}
