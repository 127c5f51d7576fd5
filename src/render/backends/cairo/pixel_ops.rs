//! In-place image operations on premultiplied ARGB32 pixel data.

use crate::region::Rect;
use crate::render::ImageOp;

#[inline]
fn channels(word: u32) -> [f64; 4] {
    [
        (word >> 24) as f64,
        ((word >> 16) & 0xff) as f64,
        ((word >> 8) & 0xff) as f64,
        (word & 0xff) as f64,
    ]
}

#[inline]
fn word([a, r, g, b]: [f64; 4]) -> u32 {
    let c = |v: f64| v.round().clamp(0.0, 255.0) as u32;
    (c(a) << 24) | (c(r) << 16) | (c(g) << 8) | c(b)
}

/// Transforms one premultiplied `[a, r, g, b]` pixel.
fn transform(op: ImageOp, [a, r, g, b]: [f64; 4]) -> [f64; 4] {
    match op {
        ImageOp::ApplyAlphaAll(alpha) | ImageOp::ApplyAlpha(alpha) => [a * alpha, r * alpha, g * alpha, b * alpha],
        // With premultiplied colors the inverse of c is a - c.
        ImageOp::InvertColorAll => [a, a - r, a - g, a - b],
        ImageOp::DimAll(dim) => {
            let keep = 1.0 - dim;
            [a, r * keep, g * keep, b * keep]
        }
        ImageOp::MaxBrightness(max) => {
            if a == 0.0 {
                return [a, r, g, b];
            }
            // Luminance of the unpremultiplied color, in 0..=1.
            let brightness = (0.2126 * r + 0.7152 * g + 0.0722 * b) / a;
            if brightness > max {
                let scale = max / brightness;
                [a, r * scale, g * scale, b * scale]
            } else {
                [a, r, g, b]
            }
        }
    }
}

/// Applies `op` to every pixel inside `rects`. Rects must lie inside the
/// image.
pub(super) fn apply(op: ImageOp, data: &mut [u8], stride: usize, rects: &[Rect]) {
    for rect in rects {
        for y in rect.y1..rect.y2 {
            let row = y as usize * stride;
            for x in rect.x1..rect.x2 {
                let offset = row + x as usize * 4;
                let px = &mut data[offset..offset + 4];
                let old = u32::from_ne_bytes([px[0], px[1], px[2], px[3]]);
                let new = word(transform(op, channels(old)));
                px.copy_from_slice(&new.to_ne_bytes());
            }
        }
    }
}
