use std::any::Any;

use anyhow::Result;

use crate::blur::BlurMethod;
use crate::errors::BlurError;
use crate::region::Region;
use crate::render::{Color, Viewport};

/// Opaque handle to an image owned by the active backend.
///
/// Handles are deliberately neither `Clone` nor `Copy`: operations that only
/// read an image borrow the handle, [`Backend::copy`] hands out a new handle
/// the caller owns, and [`Backend::release_image`] consumes it. Backends may
/// share the underlying pixels between handles internally.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "images must be returned through Backend::release_image"]
pub struct ImageHandle {
    id: u64,
    width: u32,
    height: u32,
}

impl ImageHandle {
    /// Creates a handle. Meant for backend implementations only.
    pub fn new(id: u64, width: u32, height: u32) -> Self {
        Self { id, width, height }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// In-place image transformations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ImageOp {
    /// Multiply the whole image by an alpha value.
    ApplyAlphaAll(f64),
    /// Multiply only the given sub-region by an alpha value.
    ApplyAlpha(f64),
    /// Invert the color channels, keeping alpha.
    InvertColorAll,
    /// Blend the whole image towards black by the given factor.
    DimAll(f64),
    /// Limit the brightness of every pixel.
    MaxBrightness(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Premultiplied ARGB, one native-endian `u32` per pixel (cairo's `ARgb32`).
    PreMulArgb32,
}

/// Handle to a presented frame the host can show. Ownership & sync are
/// backend-specific; see docs per variant.
#[derive(Clone, Debug)]
pub enum ExternalHandle {
    /// CPU pixels of the front buffer.
    CpuPixelsOwned {
        width: u32,
        height: u32,
        stride: u32,
        pixels: Vec<u8>,
        format: PixelFormat,
    },

    /// The backend's front texture. Contract: the host resolves `id` through
    /// the backend that produced it.
    WgpuTextureId { id: u64, width: u32, height: u32, frame_id: u64 },

    /// Nothing was rendered; only the frame counter advances.
    NullHandle { width: u32, height: u32, frame_id: u64 },
}

/// CPU image handed in by the window tracker (window contents, shadows,
/// wallpaper).
#[derive(Clone)]
pub struct RgbaImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl RgbaImage {
    pub fn from_raw(pixels: Vec<u8>, width: u32, height: u32, stride: u32, format: PixelFormat) -> Self {
        assert!(
            pixels.len() >= (height as usize) * (stride as usize),
            "pixel buffer too small for image dimensions"
        );
        assert!(stride >= width * 4, "stride smaller than a row of pixels");

        Self {
            pixels,
            width,
            height,
            stride,
            format,
        }
    }

    /// An image filled with a single color.
    pub fn solid(width: u32, height: u32, color: Color) -> Self {
        let pixel = color.to_premul_argb32().to_ne_bytes();
        let pixels = pixel
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::from_raw(pixels, width, height, width * 4, PixelFormat::PreMulArgb32)
    }

    /// Pixel at `(x, y)` as a premultiplied ARGB word.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        let offset = (y * self.stride + x * 4) as usize;
        let bytes = &self.pixels[offset..offset + 4];
        u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl std::fmt::Debug for RgbaImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbaImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.pixels.len())
            .finish()
    }
}

/// Type-erased blur state so the blur module can hold it without knowing the
/// backend.
pub trait ErasedBlurContext: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// How many pixels outside a region blurring it reads, horizontally and
    /// vertically.
    fn margin(&self) -> (i32, i32);
}

/// Core backend interface. All calls happen on the compositor thread and
/// return once their work has been issued.
///
/// Regions are in screen coordinates unless noted otherwise.
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Size of the presentation target.
    fn viewport(&self) -> Viewport;

    /// Number of damage frames needed to cover every buffer age this backend
    /// can report.
    fn max_buffer_age(&self) -> usize;

    /// Turns externally acquired pixels into a backend image.
    fn import_image(&mut self, image: &RgbaImage) -> Result<ImageHandle>;

    /// Painting restricted to `region` is about to start.
    fn prepare(&mut self, _region: &Region) {}

    /// Paints `image` with its origin at `(dst_x, dst_y)`, limited to
    /// `clip ∩ visible`.
    fn compose(&mut self, image: &ImageHandle, dst_x: i32, dst_y: i32, clip: &Region, visible: &Region);

    /// Makes an independent copy of `image`. `visible` (image-local) is a
    /// hint of which part will be used.
    fn copy(&mut self, image: &ImageHandle, visible: &Region) -> Result<ImageHandle>;

    /// Transforms `image` in place. `sub_region` is image-local and `None`
    /// means the whole image. Returns `false` if the operation is not
    /// supported.
    fn image_op(&mut self, op: ImageOp, image: &ImageHandle, sub_region: Option<&Region>, visible: &Region) -> bool;

    fn release_image(&mut self, image: ImageHandle);

    /// Paints a flat color over `region`.
    fn fill(&mut self, color: Color, region: &Region);

    /// Publishes the composited frame. May block until the previous frame has
    /// been retired.
    fn present(&mut self, region: &Region) -> Result<()>;

    /// How many frames old the contents of the buffer painted next are, or
    /// `None` when the backend cannot tell.
    fn buffer_age(&self) -> Option<u32> {
        None
    }

    /// Waits until the display server finished with the window contents.
    fn sync_fence(&mut self) -> Result<()> {
        Ok(())
    }

    /// Resizes the presentation target.
    fn resize(&mut self, viewport: Viewport) -> Result<()>;

    fn create_blur_context(&mut self, _method: &BlurMethod) -> Result<Box<dyn ErasedBlurContext>, BlurError> {
        Err(BlurError::Unsupported(self.name()))
    }

    fn destroy_blur_context(&mut self, _ctx: Box<dyn ErasedBlurContext>) {}

    /// Blurs what is already painted under `reg_blur`, blending the result in
    /// with `opacity`. Returns `false` on failure.
    fn blur(&mut self, _ctx: &mut dyn ErasedBlurContext, _opacity: f64, _reg_blur: &Region, _reg_visible: &Region) -> bool {
        false
    }

    /// Returns the last presented frame, if supported.
    fn external_handle(&mut self) -> Option<ExternalHandle>;

    /// Tears down the backend. Every image and blur context must have been
    /// released before.
    fn deinit(&mut self);
}
