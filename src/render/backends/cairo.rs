use crate::blur::convolve::Patch;
use crate::blur::{passes_margin, BlurMethod, Kernel};
use crate::errors::BlurError;
use crate::region::{Rect, Region};
use crate::render::backend::{
    Backend, ErasedBlurContext, ExternalHandle, ImageHandle, ImageOp, PixelFormat, RgbaImage,
};
use crate::render::{Color, Viewport};
use anyhow::{anyhow, Result};
use std::any::Any;
use std::collections::HashMap;

mod pixel_ops;

/// Number of back buffers painted in turn.
const BACK_BUFFERS: usize = 2;

/// Cairo backend: composites on the CPU into image surfaces.
///
/// Frames are painted into alternating back buffers. Presenting copies the
/// damaged part of the back buffer into the front buffer, which is what
/// [`Backend::external_handle`] hands out.
pub struct CairoBackend {
    viewport: Viewport,
    images: HashMap<u64, cairo::ImageSurface>,
    next_image: u64,
    back: Vec<cairo::ImageSurface>,
    /// Frame number each back buffer was last painted at, 0 if never
    painted_at: [u64; BACK_BUFFERS],
    current: usize,
    front: cairo::ImageSurface,
    frame_id: u64,
}

fn create_surface(width: u32, height: u32) -> Result<cairo::ImageSurface> {
    Ok(cairo::ImageSurface::create(
        cairo::Format::ARgb32,
        width as i32,
        height as i32,
    )?)
}

/// Restricts painting on `cr` to `region`.
fn clip_to(cr: &cairo::Context, region: &Region) {
    for r in region.rects() {
        cr.rectangle(r.x1 as f64, r.y1 as f64, r.width() as f64, r.height() as f64);
    }
    cr.clip();
}

impl CairoBackend {
    pub fn new(viewport: Viewport) -> Result<Self> {
        let back = (0..BACK_BUFFERS)
            .map(|_| create_surface(viewport.width, viewport.height))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            viewport,
            images: HashMap::new(),
            next_image: 1,
            back,
            painted_at: [0; BACK_BUFFERS],
            current: 0,
            front: create_surface(viewport.width, viewport.height)?,
            frame_id: 0,
        })
    }

    fn insert_image(&mut self, surface: cairo::ImageSurface) -> ImageHandle {
        let id = self.next_image;
        self.next_image += 1;
        let handle = ImageHandle::new(id, surface.width() as u32, surface.height() as u32);
        self.images.insert(id, surface);
        handle
    }

    fn image(&self, image: &ImageHandle) -> Result<&cairo::ImageSurface> {
        self.images
            .get(&image.id())
            .ok_or_else(|| anyhow!("CairoBackend used with unknown image {}", image.id()))
    }

    fn try_compose(&mut self, image: &ImageHandle, x: i32, y: i32, region: &Region) -> Result<()> {
        let source = self.image(image)?;
        let cr = cairo::Context::new(&self.back[self.current])?;
        clip_to(&cr, region);
        cr.set_source_surface(source, x as f64, y as f64)?;
        cr.paint()?;
        Ok(())
    }

    fn try_image_op(&mut self, op: ImageOp, image: &ImageHandle, sub_region: Option<&Region>) -> Result<()> {
        let surface = self
            .images
            .get_mut(&image.id())
            .ok_or_else(|| anyhow!("CairoBackend used with unknown image {}", image.id()))?;
        let bounds = Rect::new(0, 0, surface.width(), surface.height());
        let region = match (op, sub_region) {
            (ImageOp::ApplyAlpha(_), Some(sub)) => sub.intersect_rect(bounds),
            _ => Region::from_rect(bounds),
        };

        surface.flush();
        let stride = surface.stride() as usize;
        let mut data = surface.data()?;
        pixel_ops::apply(op, &mut data, stride, region.rects());
        Ok(())
    }

    fn try_fill(&mut self, color: Color, region: &Region) -> Result<()> {
        let cr = cairo::Context::new(&self.back[self.current])?;
        clip_to(&cr, region);
        cr.set_source_rgba(color.r as f64, color.g as f64, color.b as f64, color.a as f64);
        cr.paint()?;
        Ok(())
    }

    fn try_blur(&mut self, passes: &[Kernel], margin: (i32, i32), opacity: f64, region: &Region) -> Result<()> {
        let bounds = self.viewport.bounds();
        let Some(extent) = region.extents().expand(margin.0, margin.1).intersect(&bounds) else {
            return Ok(());
        };

        let back = &mut self.back[self.current];
        back.flush();
        let stride = back.stride() as usize;
        let mut data = back.data()?;

        let blurred = Patch::from_argb32(&data, stride, extent).blur(passes);
        for rect in region.intersect_rect(bounds).rects() {
            blurred.blend_into_argb32(&mut data, stride, (extent.x1, extent.y1), *rect, opacity as f32);
        }
        Ok(())
    }
}

/// Blur state of the cairo backend: the convolution passes to run.
pub struct CairoBlurContext {
    passes: Vec<Kernel>,
    margin: (i32, i32),
}

impl ErasedBlurContext for CairoBlurContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn margin(&self) -> (i32, i32) {
        self.margin
    }
}

impl Backend for CairoBackend {
    fn name(&self) -> &'static str {
        "CairoBackend"
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn max_buffer_age(&self) -> usize {
        BACK_BUFFERS + 1
    }

    fn import_image(&mut self, image: &RgbaImage) -> Result<ImageHandle> {
        let mut surface = create_surface(image.width, image.height)?;
        {
            let stride = surface.stride() as usize;
            let row_len = image.width as usize * 4;
            let mut data = surface.data()?;
            for y in 0..image.height as usize {
                let src = &image.pixels[y * image.stride as usize..][..row_len];
                data[y * stride..][..row_len].copy_from_slice(src);
            }
        }
        Ok(self.insert_image(surface))
    }

    fn compose(&mut self, image: &ImageHandle, dst_x: i32, dst_y: i32, clip: &Region, visible: &Region) {
        let region = clip.intersect(visible);
        if region.is_empty() {
            return;
        }
        if let Err(e) = self.try_compose(image, dst_x, dst_y, &region) {
            log::error!("CairoBackend compose failed: {e:#}");
        }
    }

    fn copy(&mut self, image: &ImageHandle, _visible: &Region) -> Result<ImageHandle> {
        let copy = {
            let source = self.image(image)?;
            let copy = create_surface(image.width(), image.height())?;
            let cr = cairo::Context::new(&copy)?;
            cr.set_operator(cairo::Operator::Source);
            cr.set_source_surface(source, 0.0, 0.0)?;
            cr.paint()?;
            copy
        };
        Ok(self.insert_image(copy))
    }

    fn image_op(&mut self, op: ImageOp, image: &ImageHandle, sub_region: Option<&Region>, _visible: &Region) -> bool {
        match self.try_image_op(op, image, sub_region) {
            Ok(()) => true,
            Err(e) => {
                log::error!("CairoBackend image operation {op:?} failed: {e:#}");
                false
            }
        }
    }

    fn release_image(&mut self, image: ImageHandle) {
        if self.images.remove(&image.id()).is_none() {
            log::error!("CairoBackend released unknown image {}", image.id());
        }
    }

    fn fill(&mut self, color: Color, region: &Region) {
        if let Err(e) = self.try_fill(color, region) {
            log::error!("CairoBackend fill failed: {e:#}");
        }
    }

    fn present(&mut self, region: &Region) -> Result<()> {
        {
            let cr = cairo::Context::new(&self.front)?;
            clip_to(&cr, region);
            cr.set_operator(cairo::Operator::Source);
            cr.set_source_surface(&self.back[self.current], 0.0, 0.0)?;
            cr.paint()?;
        }
        self.front.flush();

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
        for buffer in self.back.iter_mut() {
            *buffer = create_surface(viewport.width, viewport.height)?;
        }
        self.front = create_surface(viewport.width, viewport.height)?;
        self.painted_at = [0; BACK_BUFFERS];
        self.viewport = viewport;
        Ok(())
    }

    fn create_blur_context(&mut self, method: &BlurMethod) -> Result<Box<dyn ErasedBlurContext>, BlurError> {
        let passes = method.passes()?;
        let margin = passes_margin(&passes);
        Ok(Box::new(CairoBlurContext { passes, margin }))
    }

    fn blur(&mut self, ctx: &mut dyn ErasedBlurContext, opacity: f64, reg_blur: &Region, reg_visible: &Region) -> bool {
        let Some(ctx) = ctx.as_any_mut().downcast_mut::<CairoBlurContext>() else {
            log::error!("CairoBackend used with non-Cairo blur context");
            return false;
        };
        let region = reg_blur.intersect(reg_visible);
        if region.is_empty() {
            return true;
        }

        match self.try_blur(&ctx.passes, ctx.margin, opacity, &region) {
            Ok(()) => true,
            Err(e) => {
                log::error!("CairoBackend blur failed: {e:#}");
                false
            }
        }
    }

    fn external_handle(&mut self) -> Option<ExternalHandle> {
        self.front.flush();
        let width = self.front.width() as u32;
        let height = self.front.height() as u32;
        let stride = self.front.stride() as u32;
        let pixels = self.front.data().ok()?.to_vec();

        Some(ExternalHandle::CpuPixelsOwned {
            width,
            height,
            stride,
            pixels,
            format: PixelFormat::PreMulArgb32,
        })
    }

    fn deinit(&mut self) {
        assert!(
            self.images.is_empty(),
            "CairoBackend torn down with {} live images",
            self.images.len()
        );
        log::debug!("CairoBackend deinitialized after {} frames", self.frame_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn front_pixel(backend: &mut CairoBackend, x: u32, y: u32) -> u32 {
        let Some(ExternalHandle::CpuPixelsOwned {
            pixels,
            width,
            height,
            stride,
            format,
        }) = backend.external_handle()
        else {
            panic!("expected CPU pixels");
        };
        RgbaImage::from_raw(pixels, width, height, stride, format).pixel(x, y)
    }

    fn screen() -> Region {
        Region::from_rect(Rect::new(0, 0, 16, 16))
    }

    #[test]
    fn compose_respects_clip() {
        let mut backend = CairoBackend::new(Viewport::new(0, 0, 16, 16)).unwrap();
        let red = backend
            .import_image(&RgbaImage::solid(8, 8, Color::from_u8(255, 0, 0, 255)))
            .unwrap();

        let clip = Region::from_rect(Rect::new(0, 0, 4, 8));
        backend.compose(&red, 0, 0, &clip, &screen());
        backend.present(&screen()).unwrap();

        assert_eq!(front_pixel(&mut backend, 1, 1), 0xffff_0000);
        assert_eq!(front_pixel(&mut backend, 6, 1), 0);

        backend.release_image(red);
        backend.deinit();
    }

    #[test]
    fn copy_is_independent() {
        let mut backend = CairoBackend::new(Viewport::new(0, 0, 16, 16)).unwrap();
        let white = backend
            .import_image(&RgbaImage::solid(4, 4, Color::from_u8(255, 255, 255, 255)))
            .unwrap();
        let copy = backend.copy(&white, &Region::new()).unwrap();
        assert!(backend.image_op(ImageOp::InvertColorAll, &copy, None, &Region::new()));

        backend.compose(&white, 0, 0, &screen(), &screen());
        backend.compose(&copy, 8, 0, &screen(), &screen());
        backend.present(&screen()).unwrap();

        assert_eq!(front_pixel(&mut backend, 1, 1), 0xffff_ffff);
        assert_eq!(front_pixel(&mut backend, 9, 1), 0xff00_0000);

        backend.release_image(copy);
        backend.release_image(white);
        backend.deinit();
    }

    #[test]
    fn buffer_age_follows_back_buffers() {
        let mut backend = CairoBackend::new(Viewport::new(0, 0, 4, 4)).unwrap();
        assert_eq!(backend.buffer_age(), Some(0));
        backend.present(&Region::new()).unwrap();
        assert_eq!(backend.buffer_age(), Some(0));
        backend.present(&Region::new()).unwrap();
        assert_eq!(backend.buffer_age(), Some(2));
        backend.present(&Region::new()).unwrap();
        assert_eq!(backend.buffer_age(), Some(2));
        assert!((backend.buffer_age().unwrap() as usize) < backend.max_buffer_age());
    }

    #[test]
    fn blur_smooths_an_edge() {
        let mut backend = CairoBackend::new(Viewport::new(0, 0, 16, 16)).unwrap();
        let white = backend
            .import_image(&RgbaImage::solid(8, 16, Color::from_u8(255, 255, 255, 255)))
            .unwrap();
        let black = backend
            .import_image(&RgbaImage::solid(8, 16, Color::BLACK))
            .unwrap();
        backend.compose(&white, 0, 0, &screen(), &screen());
        backend.compose(&black, 8, 0, &screen(), &screen());

        let mut ctx = backend
            .create_blur_context(&BlurMethod::Box { radius: 2 })
            .unwrap();
        assert!(backend.blur(ctx.as_mut(), 1.0, &screen(), &screen()));
        backend.present(&screen()).unwrap();

        let edge = front_pixel(&mut backend, 8, 8);
        let red = (edge >> 16) & 0xff;
        assert!(red > 0 && red < 255, "edge not blurred: {edge:#x}");
        assert_eq!(front_pixel(&mut backend, 0, 8), 0xffff_ffff);

        backend.destroy_blur_context(ctx);
        backend.release_image(white);
        backend.release_image(black);
        backend.deinit();
    }
}
