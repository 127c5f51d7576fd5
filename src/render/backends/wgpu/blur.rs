use crate::blur::Kernel;
use crate::render::backend::ErasedBlurContext;
use std::any::Any;
use std::fmt::Write;

/// Ping-pong textures the blur passes render between. They are larger than
/// the viewport by the margin on every side, so texel `(x, y)` of the screen
/// lives at `(x + margin.0, y + margin.1)`.
pub struct Scratch {
    pub ping: u64,
    pub pong: u64,
    pub size: (u32, u32),
}

/// Blur state of the wgpu backend: one pipeline per convolution pass.
pub struct WgpuBlurContext {
    /// Passes rendering between the scratch textures.
    pub passes: Vec<wgpu::RenderPipeline>,
    /// The last pass, blending straight into the back buffer.
    pub last: wgpu::RenderPipeline,
    pub margin: (i32, i32),
    /// Created on first use and recreated when the viewport size changes.
    pub scratch: Option<Scratch>,
}

impl ErasedBlurContext for WgpuBlurContext {
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

/// Generates the fragment shader for one convolution pass of `kernel`.
///
/// Every non-zero weight becomes one unrolled tap. Taps outside the readable
/// bounds are skipped and the sum is divided by the weights actually
/// sampled, so the edges of the blurred area do not darken. The result is
/// scaled by `params.value`, the blur opacity on the last pass.
pub fn kernel_shader(kernel: &Kernel) -> String {
    let (hx, hy) = kernel.half_extents();
    let mut taps = String::new();
    for y in 0..kernel.height {
        for x in 0..kernel.width {
            let w = kernel.get(x, y) as f32;
            if w == 0.0 {
                continue;
            }
            // Writing into a String cannot fail.
            let _ = writeln!(
                taps,
                "    {{\n        let s = t + vec2<i32>({}, {});\n        if (readable(s)) {{\n            sum += textureLoad(src, s, 0) * {w:e};\n            weight += {w:e};\n        }}\n    }}",
                x as i32 - hx,
                y as i32 - hy,
            );
        }
    }

    format!(
        r#"
@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {{
    let t = source_texel(pos);
    var sum = vec4<f32>(0.0);
    var weight = 0.0;
{taps}
    if (weight == 0.0) {{
        return vec4<f32>(0.0);
    }}
    return sum / weight * params.value;
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blur::box_kernels;

    #[test]
    fn one_tap_per_nonzero_weight() {
        let [horizontal, vertical] = box_kernels(2);
        let shader = kernel_shader(&horizontal);
        assert_eq!(shader.matches("textureLoad").count(), 5);
        assert!(shader.contains("vec2<i32>(-2, 0)"));
        assert!(shader.contains("vec2<i32>(2, 0)"));

        let shader = kernel_shader(&vertical);
        assert!(shader.contains("vec2<i32>(0, -2)"));
    }

    #[test]
    fn zero_weights_are_skipped() {
        let kernel = Kernel::new(3, 1, vec![0.0, 1.0, 0.0]).unwrap();
        let shader = kernel_shader(&kernel);
        assert_eq!(shader.matches("textureLoad").count(), 1);
        assert!(shader.contains("vec2<i32>(0, 0)"));
    }
}
