use serde::{Deserialize, Serialize};

use crate::blur::{BlurMethod, Kernel};
use crate::errors::ConfigError;
use crate::region::{Rect, Region};

const DEFAULT_BLUR_RADIUS: u32 = 3;
const DEFAULT_BLUR_DEVIATION: f64 = 0.84089642;

/// Which rendering backend a session activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Paints nothing; useful for diagnostics and tests
    #[default]
    Null,
    Cairo,
    Wgpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlurMethodConfig {
    #[default]
    None,
    Box,
    Gaussian,
    Kernel,
}

/// Background blur settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    pub method: BlurMethodConfig,
    /// Radius for the box and gaussian methods
    pub radius: u32,
    /// Standard deviation for the gaussian method
    pub deviation: f64,
    /// Kernels for the kernel method, applied in order
    pub kernels: Vec<Kernel>,
    /// Blur behind the frame of windows whose body is opaque
    pub background_frame: bool,
    /// Keep blur at full strength while windows fade
    pub background_fixed: bool,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            method: BlurMethodConfig::None,
            radius: DEFAULT_BLUR_RADIUS,
            deviation: DEFAULT_BLUR_DEVIATION,
            kernels: Vec::new(),
            background_frame: false,
            background_fixed: false,
        }
    }
}

impl BlurConfig {
    /// The configured method with its parameters, or `None` when blur is off.
    pub fn method(&self) -> Option<BlurMethod> {
        match self.method {
            BlurMethodConfig::None => None,
            BlurMethodConfig::Box => Some(BlurMethod::Box { radius: self.radius }),
            BlurMethodConfig::Gaussian => Some(BlurMethod::Gaussian {
                radius: self.radius,
                deviation: self.deviation,
            }),
            BlurMethodConfig::Kernel => Some(BlurMethod::Kernel(self.kernels.clone())),
        }
    }
}

/// Main compositor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub backend: BackendKind,
    /// Only repaint damaged areas. When off every frame repaints the screen.
    pub use_damage: bool,
    /// Highlight each frame's damage with a translucent fill
    pub monitor_repaint: bool,
    /// Translucent windows do not hide what is below them
    pub transparent_clipping: bool,
    /// Brightness limit applied to window contents, 1.0 disables it
    pub max_brightness: f64,
    /// Dim factor for windows flagged as dimmed
    pub inactive_dim: f64,
    /// Do not scale the dim factor with window opacity
    pub inactive_dim_fixed: bool,
    /// Screen areas shadows are never painted on, as `[x, y, width, height]`
    pub shadow_exclude: Vec<[i32; 4]>,
    /// Clip shadows to the screen their window is on
    pub crop_shadow_to_screen: bool,
    /// Paint shadows under the window body as well
    pub full_shadow: bool,
    /// Wait on the display server before painting
    pub sync_fence: bool,
    /// Treat every window as translucent when deciding on blur
    pub force_win_blend: bool,
    pub blur: BlurConfig,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Null,
            use_damage: true,
            monitor_repaint: false,
            transparent_clipping: false,
            max_brightness: 1.0,
            inactive_dim: 0.0,
            inactive_dim_fixed: false,
            shadow_exclude: Vec::new(),
            crop_shadow_to_screen: false,
            full_shadow: false,
            sync_fence: false,
            force_win_blend: false,
            blur: BlurConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

impl CompositorConfig {
    /// Parses and validates a JSON configuration. Missing fields take their
    /// default value.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: CompositorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.max_brightness) {
            return Err(invalid("max_brightness", format!("{} is not within [0, 1]", self.max_brightness)));
        }
        if !(0.0..=1.0).contains(&self.inactive_dim) {
            return Err(invalid("inactive_dim", format!("{} is not within [0, 1]", self.inactive_dim)));
        }
        if let Some([_, _, w, h]) = self.shadow_exclude.iter().find(|r| r[2] < 0 || r[3] < 0) {
            return Err(invalid("shadow_exclude", format!("negative size {w}x{h}")));
        }

        let blur = &self.blur;
        if blur.method == BlurMethodConfig::Gaussian && !(blur.deviation > 0.0 && blur.deviation.is_finite()) {
            return Err(invalid("blur.deviation", format!("{} is not positive", blur.deviation)));
        }
        if blur.method == BlurMethodConfig::Kernel {
            if blur.kernels.is_empty() {
                return Err(invalid("blur.kernels", "kernel method needs at least one kernel"));
            }
            for kernel in &blur.kernels {
                kernel
                    .validate()
                    .map_err(|e| invalid("blur.kernels", e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Union of the shadow exclusion rectangles.
    pub fn shadow_exclude_region(&self) -> Region {
        Region::from_rects(self.shadow_exclude.iter().map(|[x, y, w, h]| Rect::new(*x, *y, *w, *h)))
    }
}
