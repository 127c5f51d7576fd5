//! CPU convolution over premultiplied ARGB32 pixels, used by rasterizer
//! backends.

use crate::blur::kernel::Kernel;
use crate::region::Rect;

/// Premultiplied `[r, g, b, a]` pixels of a rectangular area, as floats in
/// `0.0 ..= 1.0`.
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<[f32; 4]>,
}

fn unpack(word: u32) -> [f32; 4] {
    [
        ((word >> 16) & 0xff) as f32 / 255.0,
        ((word >> 8) & 0xff) as f32 / 255.0,
        (word & 0xff) as f32 / 255.0,
        (word >> 24) as f32 / 255.0,
    ]
}

fn pack(px: [f32; 4]) -> u32 {
    let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u32;
    (c(px[3]) << 24) | (c(px[0]) << 16) | (c(px[1]) << 8) | c(px[2])
}

fn read_word(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

impl Patch {
    /// Reads `rect` out of an ARGB32 buffer. `rect` must lie inside the
    /// buffer.
    pub fn from_argb32(data: &[u8], stride: usize, rect: Rect) -> Self {
        let width = rect.width().max(0) as usize;
        let height = rect.height().max(0) as usize;
        let mut pixels = Vec::with_capacity(width * height);
        for y in rect.y1..rect.y2 {
            let row = y as usize * stride;
            for x in rect.x1..rect.x2 {
                pixels.push(unpack(read_word(data, row + x as usize * 4)));
            }
        }
        Self { width, height, pixels }
    }

    /// Runs one pass of `kernel`. Samples falling outside the patch are
    /// skipped and the result is divided by the weights actually sampled.
    pub fn convolve(&self, kernel: &Kernel) -> Patch {
        let (hx, hy) = (kernel.width as isize / 2, kernel.height as isize / 2);
        let mut pixels = Vec::with_capacity(self.pixels.len());

        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                let mut sum = [0.0f32; 4];
                let mut weight = 0.0f64;
                for ky in 0..kernel.height as isize {
                    let sy = y + ky - hy;
                    if sy < 0 || sy >= self.height as isize {
                        continue;
                    }
                    for kx in 0..kernel.width as isize {
                        let sx = x + kx - hx;
                        if sx < 0 || sx >= self.width as isize {
                            continue;
                        }
                        let w = kernel.get(kx as usize, ky as usize);
                        if w == 0.0 {
                            continue;
                        }
                        let px = self.pixels[sy as usize * self.width + sx as usize];
                        for c in 0..4 {
                            sum[c] += px[c] * w as f32;
                        }
                        weight += w;
                    }
                }
                if weight > 0.0 {
                    for c in sum.iter_mut() {
                        *c /= weight as f32;
                    }
                }
                pixels.push(sum);
            }
        }

        Patch {
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    pub fn blur(&self, passes: &[Kernel]) -> Patch {
        passes.iter().fold(self.clone(), |patch, kernel| patch.convolve(kernel))
    }

    /// Composites the part of this patch covering `rect` over an ARGB32
    /// buffer with the given opacity. The patch's top-left corner sits at
    /// `origin` in buffer coordinates.
    pub fn blend_into_argb32(&self, data: &mut [u8], stride: usize, origin: (i32, i32), rect: Rect, opacity: f32) {
        for y in rect.y1..rect.y2 {
            let py = (y - origin.1) as usize;
            for x in rect.x1..rect.x2 {
                let px = (x - origin.0) as usize;
                let src = self.pixels[py * self.width + px];
                let offset = y as usize * stride + x as usize * 4;
                let dst = unpack(read_word(data, offset));

                let inv = 1.0 - src[3] * opacity;
                let out = [
                    src[0] * opacity + dst[0] * inv,
                    src[1] * opacity + dst[1] * inv,
                    src[2] * opacity + dst[2] * inv,
                    src[3] * opacity + dst[3] * inv,
                ];
                data[offset..offset + 4].copy_from_slice(&pack(out).to_ne_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blur::kernel::box_kernels;

    fn buffer(width: usize, height: usize, f: impl Fn(usize, usize) -> u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height * 4);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y).to_ne_bytes());
            }
        }
        data
    }

    #[test]
    fn uniform_input_is_unchanged() {
        let data = buffer(8, 8, |_, _| 0xff80_4020);
        let patch = Patch::from_argb32(&data, 32, Rect::new(0, 0, 8, 8));
        let blurred = patch.blur(&box_kernels(2));
        for px in &blurred.pixels {
            assert!((px[0] - 128.0 / 255.0).abs() < 1e-4);
            assert!((px[3] - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn box_pass_averages_neighbours() {
        // One white pixel in the middle of a black row.
        let data = buffer(5, 1, |x, _| if x == 2 { 0xffff_ffff } else { 0xff00_0000 });
        let patch = Patch::from_argb32(&data, 20, Rect::new(0, 0, 5, 1));
        let [h, _] = box_kernels(1);
        let out = patch.convolve(&h);
        assert!((out.pixels[1][0] - 1.0 / 3.0).abs() < 1e-6);
        assert!((out.pixels[2][0] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(out.pixels[0][0], 0.0);
        // Edge pixels only average what exists.
        assert!((out.pixels[4][3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn blend_respects_opacity_and_rect() {
        let mut data = buffer(4, 1, |_, _| 0xff00_0000);
        let white = Patch {
            width: 4,
            height: 1,
            pixels: vec![[1.0, 1.0, 1.0, 1.0]; 4],
        };
        white.blend_into_argb32(&mut data, 16, (0, 0), Rect::new(1, 0, 2, 1), 0.5);
        let words: Vec<u32> = data
            .chunks(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![0xff00_0000, 0xff80_8080, 0xff80_8080, 0xff00_0000]);
    }
}
