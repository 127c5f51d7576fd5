use crate::blur::{passes_margin, BlurMethod};
use crate::errors::BlurError;
use crate::region::Region;
use crate::render::backend::{Backend, ErasedBlurContext, ExternalHandle, ImageHandle, ImageOp, RgbaImage};
use crate::render::{Color, RenderList, RenderOp, Viewport};
use anyhow::{anyhow, Result};
use std::any::Any;
use std::collections::HashMap;

/// Null backend that does not perform any rendering.
///
/// Every paint operation is recorded into a [`RenderList`] instead, and image
/// ownership is tracked so misuse (unknown handles, leaked images at
/// teardown) is caught.
pub struct NullBackend {
    viewport: Viewport,
    /// Live images and their sizes
    images: HashMap<u64, (u32, u32)>,
    next_image: u64,
    blur_contexts: usize,
    list: RenderList,
    buffer_age: Option<u32>,
    max_buffer_age: usize,
    fail_sync_fence: bool,
    /// Largest image width or height `import_image` accepts
    max_image_size: Option<u32>,
    /// Frame ID, bumped on every present.
    frame_id: u64,
}

impl NullBackend {
    /// Creates a new instance of the null backend.
    pub fn new(viewport: Viewport) -> Result<Self> {
        Ok(Self {
            viewport,
            images: HashMap::new(),
            next_image: 1,
            blur_contexts: 0,
            list: RenderList::new(),
            buffer_age: None,
            max_buffer_age: 1,
            fail_sync_fence: false,
            max_image_size: None,
            frame_id: 0,
        })
    }

    /// Reports `age` as the buffer age of every frame and keeps `max`
    /// frames of damage.
    pub fn with_buffer_age(mut self, age: Option<u32>, max: usize) -> Self {
        self.buffer_age = age;
        self.max_buffer_age = max;
        self
    }

    /// Makes every `sync_fence` call fail.
    pub fn with_failing_sync_fence(mut self) -> Self {
        self.fail_sync_fence = true;
        self
    }

    /// Rejects imports of images wider or taller than `size`, the way a GPU
    /// backend rejects textures over its device limit.
    pub fn with_max_image_size(mut self, size: u32) -> Self {
        self.max_image_size = Some(size);
        self
    }

    pub fn render_list(&self) -> &RenderList {
        &self.list
    }

    pub fn take_render_list(&mut self) -> RenderList {
        std::mem::take(&mut self.list)
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_blur_contexts(&self) -> usize {
        self.blur_contexts
    }

    fn new_image(&mut self, width: u32, height: u32) -> ImageHandle {
        let id = self.next_image;
        self.next_image += 1;
        self.images.insert(id, (width, height));
        ImageHandle::new(id, width, height)
    }

    fn check_image(&self, image: &ImageHandle) {
        assert!(
            self.images.contains_key(&image.id()),
            "NullBackend used with unknown image {}",
            image.id()
        );
    }
}

/// Blur context of the null backend; only knows its margin.
pub struct NullBlurContext {
    margin: (i32, i32),
}

impl ErasedBlurContext for NullBlurContext {
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

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "NullBackend"
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn max_buffer_age(&self) -> usize {
        self.max_buffer_age
    }

    fn import_image(&mut self, image: &RgbaImage) -> Result<ImageHandle> {
        if let Some(max) = self.max_image_size {
            if image.width > max || image.height > max {
                return Err(anyhow!(
                    "NullBackend cannot import a {}x{} image, the limit is {max}",
                    image.width,
                    image.height
                ));
            }
        }
        Ok(self.new_image(image.width, image.height))
    }

    fn prepare(&mut self, region: &Region) {
        self.list.add_command(RenderOp::Prepare { region: region.clone() });
    }

    fn compose(&mut self, image: &ImageHandle, dst_x: i32, dst_y: i32, clip: &Region, visible: &Region) {
        self.check_image(image);
        self.list.add_command(RenderOp::Compose {
            image: image.id(),
            x: dst_x,
            y: dst_y,
            clip: clip.clone(),
            visible: visible.clone(),
        });
    }

    fn copy(&mut self, image: &ImageHandle, _visible: &Region) -> Result<ImageHandle> {
        if !self.images.contains_key(&image.id()) {
            return Err(anyhow!("NullBackend cannot copy unknown image {}", image.id()));
        }
        let copy = self.new_image(image.width(), image.height());
        self.list.add_command(RenderOp::Copy {
            source: image.id(),
            copy: copy.id(),
        });
        Ok(copy)
    }

    fn image_op(&mut self, op: ImageOp, image: &ImageHandle, sub_region: Option<&Region>, _visible: &Region) -> bool {
        self.check_image(image);
        self.list.add_command(RenderOp::ImageOp {
            image: image.id(),
            op,
            sub_region: sub_region.cloned(),
        });
        true
    }

    fn release_image(&mut self, image: ImageHandle) {
        assert!(
            self.images.remove(&image.id()).is_some(),
            "NullBackend released unknown image {}",
            image.id()
        );
        self.list.add_command(RenderOp::Release { image: image.id() });
    }

    fn fill(&mut self, color: Color, region: &Region) {
        self.list.add_command(RenderOp::Fill {
            color,
            region: region.clone(),
        });
    }

    fn present(&mut self, region: &Region) -> Result<()> {
        self.frame_id = self.frame_id.wrapping_add(1);
        self.list.add_command(RenderOp::Present { region: region.clone() });
        Ok(())
    }

    fn buffer_age(&self) -> Option<u32> {
        self.buffer_age
    }

    fn sync_fence(&mut self) -> Result<()> {
        if self.fail_sync_fence {
            return Err(anyhow!("NullBackend fence failed"));
        }
        Ok(())
    }

    fn resize(&mut self, viewport: Viewport) -> Result<()> {
        self.viewport = viewport;
        Ok(())
    }

    fn create_blur_context(&mut self, method: &BlurMethod) -> Result<Box<dyn ErasedBlurContext>, BlurError> {
        let passes = method.passes()?;
        self.blur_contexts += 1;
        Ok(Box::new(NullBlurContext {
            margin: passes_margin(&passes),
        }))
    }

    fn destroy_blur_context(&mut self, ctx: Box<dyn ErasedBlurContext>) {
        assert!(
            ctx.as_any().downcast_ref::<NullBlurContext>().is_some(),
            "NullBackend used with non-Null blur context"
        );
        self.blur_contexts -= 1;
    }

    fn blur(&mut self, ctx: &mut dyn ErasedBlurContext, opacity: f64, reg_blur: &Region, _reg_visible: &Region) -> bool {
        if ctx.as_any_mut().downcast_mut::<NullBlurContext>().is_none() {
            log::error!("NullBackend used with non-Null blur context");
            return false;
        }
        if reg_blur.is_empty() {
            return true;
        }
        self.list.add_command(RenderOp::Blur {
            opacity,
            region: reg_blur.clone(),
        });
        true
    }

    fn external_handle(&mut self) -> Option<ExternalHandle> {
        Some(ExternalHandle::NullHandle {
            width: self.viewport.width,
            height: self.viewport.height,
            frame_id: self.frame_id,
        })
    }

    fn deinit(&mut self) {
        assert!(
            self.images.is_empty(),
            "NullBackend torn down with {} live images",
            self.images.len()
        );
        assert_eq!(self.blur_contexts, 0, "NullBackend torn down with live blur contexts");
        self.list.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Rect;

    #[test]
    fn tracks_image_ownership() {
        let mut backend = NullBackend::new(Viewport::new(0, 0, 10, 10)).unwrap();
        let image = backend
            .import_image(&RgbaImage::solid(2, 2, Color::BLACK))
            .unwrap();
        let copy = backend.copy(&image, &Region::new()).unwrap();
        assert_ne!(copy.id(), image.id());
        assert_eq!(backend.live_images(), 2);

        backend.release_image(copy);
        backend.release_image(image);
        backend.deinit();
    }

    #[test]
    #[should_panic(expected = "live images")]
    fn deinit_with_live_images_panics() {
        let mut backend = NullBackend::new(Viewport::new(0, 0, 10, 10)).unwrap();
        let _image = backend
            .import_image(&RgbaImage::solid(1, 1, Color::BLACK))
            .unwrap();
        backend.deinit();
    }

    #[test]
    fn blur_context_margin_sums_passes() {
        let mut backend = NullBackend::new(Viewport::new(0, 0, 10, 10)).unwrap();
        let mut ctx = backend
            .create_blur_context(&BlurMethod::Gaussian { radius: 4, deviation: 1.0 })
            .unwrap();
        assert_eq!(ctx.margin(), (4, 4));

        let region = Region::from_rect(Rect::new(0, 0, 5, 5));
        assert!(backend.blur(ctx.as_mut(), 0.5, &region, &region));
        assert_eq!(
            backend.render_list().items,
            vec![RenderOp::Blur { opacity: 0.5, region }]
        );

        backend.destroy_blur_context(ctx);
        assert_eq!(backend.live_blur_contexts(), 0);
    }

    #[test]
    fn present_advances_frame_id() {
        let mut backend = NullBackend::new(Viewport::new(0, 0, 4, 3)).unwrap();
        backend.present(&Region::new()).unwrap();
        match backend.external_handle() {
            Some(ExternalHandle::NullHandle { width, height, frame_id }) => {
                assert_eq!((width, height, frame_id), (4, 3, 1));
            }
            other => panic!("unexpected handle {other:?}"),
        }
    }
}
