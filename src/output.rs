//! Per-output bookkeeping: identity, layer surface handles, committed
//! size and the dirty flags driving the render pass.

use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_protocols::wp::fractional_scale::v1::client::wp_fractional_scale_v1::WpFractionalScaleV1;
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_surface_v1::ZwlrLayerSurfaceV1;

use crate::config::Config;

pub struct Output {
    pub wl_name: u32,
    pub wl_output: WlOutput,
    pub name: Option<String>,
    pub identifier: Option<String>,

    pub configs: Vec<Config>,
    /// Index of the active config; `None` until the first resolve.
    pub active: Option<usize>,

    pub surface: Option<WlSurface>,
    pub layer_surface: Option<ZwlrLayerSurfaceV1>,
    pub fractional_scale: Option<WpFractionalScaleV1>,

    /// Committed size in compositor coordinates.
    pub width: u32,
    pub height: u32,
    /// Pixel size from the mode event, used without fractional scale.
    pub mode_width: i32,
    pub mode_height: i32,
    /// Preferred scale in 120ths, valid with fractional scale.
    pub scale_120: u32,

    pub configured: bool,
    pub buffer_change: bool,
    pub config_change: bool,
}

impl Output {
    pub fn new(wl_name: u32, wl_output: WlOutput) -> Output {
        Output {
            wl_name,
            wl_output,
            name: None,
            identifier: None,
            configs: Vec::new(),
            active: None,
            surface: None,
            layer_surface: None,
            fractional_scale: None,
            width: 0,
            height: 0,
            mode_width: 0,
            mode_height: 0,
            scale_120: 0,
            configured: false,
            buffer_change: false,
            config_change: false,
        }
    }

    /// Buffer pixel dimensions for the next draw.
    pub fn buffer_size(&self) -> (i32, i32) {
        buffer_pixel_size(
            self.fractional_scale.is_some(),
            self.scale_120,
            self.width,
            self.height,
            self.mode_width,
            self.mode_height,
        )
    }

    pub fn active_config(&self) -> Option<&Config> {
        self.configs.get(self.active?)
    }

    /// Release every protocol object owned by this output. Dropping the
    /// configs releases their buffer references.
    pub fn destroy(self) {
        if let Some(layer_surface) = &self.layer_surface {
            layer_surface.destroy();
        }
        if let Some(surface) = &self.surface {
            surface.destroy();
        }
        if let Some(fractional_scale) = &self.fractional_scale {
            fractional_scale.destroy();
        }
        self.wl_output.release();
    }
}

/// With fractional scale, round compositor dimensions by the preferred
/// 120-denominated factor; otherwise use the mode, rotated to match the
/// committed orientation.
pub fn buffer_pixel_size(
    fractional: bool,
    scale_120: u32,
    width: u32,
    height: u32,
    mode_width: i32,
    mode_height: i32,
) -> (i32, i32) {
    if fractional {
        let scale = |dim: u32| ((i64::from(dim) * i64::from(scale_120) + 60) / 120) as i32;
        (scale(width), scale(height))
    } else if (mode_width < mode_height) == (width < height) {
        (mode_width, mode_height)
    } else {
        (mode_height, mode_width)
    }
}

/// True when a configure flips the output between landscape and
/// portrait, invalidating every buffer.
pub fn rotation_flipped(old_width: u32, old_height: u32, width: u32, height: u32) -> bool {
    (width < height) != (old_width < old_height)
}

/// wlroots formats `wl_output.description` as `make model serial (name)`;
/// the identifier is the part before the parenthesized name.
pub fn identifier_from_description(description: &str) -> String {
    match description.rfind('(') {
        Some(index) => description[..index.saturating_sub(1)].to_string(),
        None => description.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_from_description() {
        assert_eq!(
            identifier_from_description("Dell Inc. DELL U2720Q ABC123 (DP-3)"),
            "Dell Inc. DELL U2720Q ABC123"
        );
        assert_eq!(identifier_from_description("Virtual Display"), "Virtual Display");
        assert_eq!(identifier_from_description("(eDP-1)"), "");
    }

    #[test]
    fn test_buffer_pixel_size_fractional() {
        // 1.5x on a 1280x800 logical size.
        assert_eq!(buffer_pixel_size(true, 180, 1280, 800, 0, 0), (1920, 1200));
        // Rounding: 1.25x of 1097 is 1371.25, which rounds to 1371.
        assert_eq!(buffer_pixel_size(true, 150, 1097, 800, 0, 0).0, 1371);
        assert_eq!(buffer_pixel_size(true, 120, 1920, 1080, 0, 0), (1920, 1080));
    }

    #[test]
    fn test_buffer_pixel_size_mode_rotation() {
        // Matching orientation: mode passes through.
        assert_eq!(buffer_pixel_size(false, 0, 1920, 1080, 3840, 2160), (3840, 2160));
        // Output committed rotated: swap the mode dimensions.
        assert_eq!(buffer_pixel_size(false, 0, 1080, 1920, 3840, 2160), (2160, 3840));
    }

    #[test]
    fn test_rotation_flipped() {
        assert!(rotation_flipped(1920, 1080, 1080, 1920));
        assert!(!rotation_flipped(1920, 1080, 2560, 1440));
        // Brand-new output (0x0) counts as landscape.
        assert!(!rotation_flipped(0, 0, 1920, 1080));
    }
}
