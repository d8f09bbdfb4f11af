//! Wallpaper image bookkeeping: lazy decode, background compositing,
//! and the pure output-to-source transform calculator.

use std::path::{Path, PathBuf};
use std::rc::Weak;

use cairo::{Format, ImageSurface};

use crate::buffer::Buffer;
use crate::error::WsbgError;
use crate::types::{rounded_div, BackgroundMode, Color, ImageTransform, SizeQ16, Q16};

/// Largest image dimension that keeps `dim * INT32_MAX * Q16` inside i64.
const IMAGE_SIZE_MAX: i64 = i64::MAX / (i32::MAX as i64 * Q16 as i64);

/// Stable handle into the daemon's image table. Identical `--image`
/// paths intern to the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    /// Never decoded; dimensions unknown.
    Unknown,
    /// Decoded at least once; dimensions are known even while the pixel
    /// surface is unloaded.
    Loaded { width: i32, height: i32 },
    /// Decode failed; never retried.
    Failed,
}

/// An image referenced by the option stream, keyed by path.
///
/// The pixel surface only exists while buffers are being built; it is
/// dropped at the end of every render pass and re-decoded on demand. The
/// `buffers` list is the cache index over compositor buffers built from
/// this image (weak: configs own the buffers).
pub struct Image {
    path: PathBuf,
    background: Color,
    surface: Option<ImageSurface>,
    status: ImageStatus,
    pub buffers: Vec<Weak<Buffer>>,
}

impl Image {
    pub fn new(path: PathBuf) -> Image {
        Image {
            path,
            background: Color::ZERO,
            surface: None,
            status: ImageStatus::Unknown,
            buffers: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> ImageStatus {
        self.status
    }

    pub fn size(&self) -> Option<(i32, i32)> {
        match self.status {
            ImageStatus::Loaded { width, height } => Some((width, height)),
            _ => None,
        }
    }

    pub fn surface(&self) -> Option<&ImageSurface> {
        self.surface.as_ref()
    }

    /// Effective background the current surface was composited over.
    /// The zero color means the source had no alpha channel and the
    /// surface can be reused with any fill.
    pub fn background(&self) -> Color {
        self.background
    }

    /// Ensure the pixel surface is decoded and composited over
    /// `background`. Returns false when the image is permanently broken.
    pub fn load(&mut self, background: Color) -> bool {
        if self.surface.is_some() {
            if self.background.a == 0 || self.background == background {
                return true;
            }
            // Alpha was composited over a different fill; redo it.
            self.unload();
        } else if self.status == ImageStatus::Failed {
            return false;
        }

        self.background = background;
        match self.decode() {
            Ok(()) => true,
            Err(err) => {
                log::error!("{err}");
                self.status = ImageStatus::Failed;
                false
            }
        }
    }

    /// Drop the decoded pixels. Buffers built from them stay valid; the
    /// next build re-decodes.
    pub fn unload(&mut self) {
        self.surface = None;
    }

    fn decode(&mut self) -> Result<(), WsbgError> {
        let path = self.path.clone();
        let decode_err = move |reason: String| WsbgError::Decode {
            path: path.clone(),
            reason,
        };

        let decoded = image::open(&self.path).map_err(|e| decode_err(e.to_string()))?;
        let has_alpha = decoded.color().has_alpha();
        let (width, height) = (decoded.width() as i64, decoded.height() as i64);
        if width < 1 || height < 1 || width > IMAGE_SIZE_MAX || height > IMAGE_SIZE_MAX {
            return Err(decode_err(format!("unsupported dimensions {width}x{height}")));
        }
        let (width, height) = (width as i32, height as i32);

        let stride = Format::Rgb24
            .stride_for_width(width as u32)
            .map_err(|e| decode_err(format!("bad stride: {e}")))?;
        let mut data = vec![0u8; stride as usize * height as usize];

        if has_alpha {
            let rgba = decoded.into_rgba8();
            let bg = self.background;
            for (y, row) in rgba.rows().enumerate() {
                let line = &mut data[y * stride as usize..];
                for (x, px) in row.enumerate() {
                    let [r, g, b, a] = px.0;
                    let blend =
                        |s: u8, d: u8| ((u32::from(s) * u32::from(a)
                            + u32::from(d) * (255 - u32::from(a))
                            + 127) / 255) as u8;
                    let argb = u32::from_le_bytes([
                        blend(b, bg.b),
                        blend(g, bg.g),
                        blend(r, bg.r),
                        0xFF,
                    ]);
                    line[x * 4..x * 4 + 4].copy_from_slice(&argb.to_le_bytes());
                }
            }
        } else {
            let rgb = decoded.into_rgb8();
            for (y, row) in rgb.rows().enumerate() {
                let line = &mut data[y * stride as usize..];
                for (x, px) in row.enumerate() {
                    let [r, g, b] = px.0;
                    let argb = u32::from_le_bytes([b, g, r, 0xFF]);
                    line[x * 4..x * 4 + 4].copy_from_slice(&argb.to_le_bytes());
                }
            }
            self.background = Color::ZERO;
        }

        let surface = ImageSurface::create_for_data(data, Format::Rgb24, width, height, stride)
            .map_err(|e| decode_err(format!("cairo surface creation failed: {e}")))?;
        self.surface = Some(surface);
        self.status = ImageStatus::Loaded { width, height };
        Ok(())
    }
}

/// Compute the source transform and coverage for drawing an image of
/// `image_width` x `image_height` onto an output of `width` x `height`.
///
/// `position` is the Q16 anchor: 0 aligns start edges, `Q16` end edges.
/// The result maps destination pixels into source pixels,
/// `source = scale * (dest + translate)`; at 1:1 scale the translation
/// is snapped to whole pixels to keep sampling blur-free.
pub fn image_transform(
    image_width: i32,
    image_height: i32,
    mode: BackgroundMode,
    position: SizeQ16,
    width: i32,
    height: i32,
) -> (ImageTransform, bool) {
    let q16 = i64::from(Q16);
    let width_q16 = i64::from(width) * q16;
    let height_q16 = i64::from(height) * q16;
    let image_width = i64::from(image_width);
    let image_height = i64::from(image_height);

    let dest_width;
    let dest_height;
    let scale_x;
    let scale_y;

    match mode {
        BackgroundMode::Center | BackgroundMode::Tile => {
            dest_width = image_width * q16;
            dest_height = image_height * q16;
            scale_x = q16;
            scale_y = q16;
        }
        BackgroundMode::Stretch => {
            dest_width = width_q16;
            dest_height = height_q16;
            scale_x = rounded_div(image_width * q16, i64::from(width));
            scale_y = rounded_div(image_height * q16, i64::from(height));
        }
        _ => {
            let width_scaled = image_width * height_q16 / image_height;
            let tighter = if mode == BackgroundMode::Fit {
                width_q16 < width_scaled
            } else {
                width_scaled < width_q16
            };
            if tighter {
                dest_width = width_q16;
                dest_height = image_height * width_q16 / image_width;
                scale_x = image_width * q16 / i64::from(width);
            } else {
                dest_width = width_scaled;
                dest_height = height_q16;
                scale_x = image_height * q16 / i64::from(height);
            }
            scale_y = scale_x;
        }
    }

    let mut x = rounded_div((dest_width - width_q16) * i64::from(position.x), q16);
    let mut y = rounded_div((dest_height - height_q16) * i64::from(position.y), q16);
    // At 1:1 scale, center the half-pixel and floor to a whole pixel.
    if scale_x == q16 {
        x = (x + q16 / 2) & !(q16 - 1);
    }
    if scale_y == q16 {
        y = (y + q16 / 2) & !(q16 - 1);
    }

    let covered =
        x <= 0 && y <= 0 && width_q16 <= x + dest_width && height_q16 <= y + dest_height;

    (
        ImageTransform {
            x: x as i32,
            y: y as i32,
            scale_x: scale_x as i32,
            scale_y: scale_y as i32,
        },
        covered,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(
        (iw, ih): (i32, i32),
        mode: BackgroundMode,
        position: SizeQ16,
        (ow, oh): (i32, i32),
    ) -> (ImageTransform, bool) {
        image_transform(iw, ih, mode, position, ow, oh)
    }

    #[test]
    fn test_fill_half_size_image() {
        let (t, covered) = transform(
            (960, 540),
            BackgroundMode::Fill,
            SizeQ16::CENTER,
            (1920, 1080),
        );
        assert_eq!(t.scale_x, Q16 / 2);
        assert_eq!(t.scale_y, Q16 / 2);
        assert_eq!(t.x, 0);
        assert_eq!(t.y, 0);
        assert!(covered);
    }

    #[test]
    fn test_fit_wide_image_letterboxes_vertically() {
        let (t, covered) = transform(
            (3840, 1080),
            BackgroundMode::Fit,
            SizeQ16::CENTER,
            (1920, 1080),
        );
        assert_eq!(t.scale_x, 2 * Q16);
        assert_eq!(t.scale_y, 2 * Q16);
        assert_eq!(t.x, 0);
        // Half the 540-pixel letterbox, shifting the sampling up.
        assert_eq!(t.y, -270 * Q16);
        assert!(!covered);
    }

    #[test]
    fn test_fill_wide_image_crops_horizontally() {
        let (t, _) = transform(
            (3840, 1080),
            BackgroundMode::Fill,
            SizeQ16::CENTER,
            (1920, 1080),
        );
        assert_eq!(t.scale_x, Q16);
        assert_eq!(t.scale_y, Q16);
        assert_eq!(t.x, 960 * Q16);
        assert_eq!(t.y, 0);
    }

    #[test]
    fn test_stretch_is_always_covered() {
        for (iw, ih, ow, oh) in [(100, 100, 1920, 1080), (3000, 50, 640, 480), (7, 13, 1, 1)] {
            let (t, covered) =
                transform((iw, ih), BackgroundMode::Stretch, SizeQ16::new(0, 0), (ow, oh));
            assert_eq!(t.x, 0);
            assert_eq!(t.y, 0);
            assert!(covered, "{iw}x{ih} on {ow}x{oh}");
        }
    }

    #[test]
    fn test_stretch_scale_rounds_to_nearest() {
        let (t, _) = transform((3, 3), BackgroundMode::Stretch, SizeQ16::new(0, 0), (2, 4));
        assert_eq!(t.scale_x, 3 * Q16 / 2);
        assert_eq!(t.scale_y, 3 * Q16 / 4);
    }

    #[test]
    fn test_center_small_image_not_covered() {
        let (t, covered) = transform(
            (100, 100),
            BackgroundMode::Center,
            SizeQ16::CENTER,
            (200, 200),
        );
        assert_eq!(t.x, -50 * Q16);
        assert_eq!(t.y, -50 * Q16);
        assert!(!covered);
    }

    #[test]
    fn test_center_large_image() {
        let (t, _) = transform(
            (400, 400),
            BackgroundMode::Center,
            SizeQ16::CENTER,
            (200, 200),
        );
        assert_eq!(t.x, 100 * Q16);
        assert_eq!(t.y, 100 * Q16);
        assert_eq!(t.scale_x, Q16);
    }

    #[test]
    fn test_identity_when_sizes_match() {
        for mode in [BackgroundMode::Center, BackgroundMode::Fit, BackgroundMode::Fill] {
            let (t, covered) =
                transform((1920, 1080), mode, SizeQ16::CENTER, (1920, 1080));
            assert_eq!(t.x, 0);
            assert_eq!(t.y, 0);
            assert_eq!(t.scale_x, Q16);
            assert_eq!(t.scale_y, Q16);
            assert!(covered);
        }
    }

    #[test]
    fn test_tile_top_left() {
        let (t, covered) = transform(
            (100, 100),
            BackgroundMode::Tile,
            SizeQ16::new(0, 0),
            (800, 600),
        );
        assert_eq!(t.x, 0);
        assert_eq!(t.y, 0);
        assert_eq!(t.scale_x, Q16);
        assert_eq!(t.scale_y, Q16);
        assert!(!covered);
    }

    #[test]
    fn test_anchor_edges() {
        // Fit, tall output: horizontal pillarbox of 1920 - 540 = 1380.
        let left = transform((100, 200), BackgroundMode::Fit, SizeQ16::new(0, 0), (1920, 1080));
        assert_eq!(left.0.x, 0);
        let right =
            transform((100, 200), BackgroundMode::Fit, SizeQ16::new(Q16, Q16), (1920, 1080));
        assert_eq!(right.0.x, -1380 * Q16);
    }

    #[test]
    fn test_pixel_snap_at_unit_scale() {
        // Odd 1-pixel overhang centered: half-pixel offset snaps to 1.
        let (t, _) = transform(
            (101, 101),
            BackgroundMode::Center,
            SizeQ16::CENTER,
            (100, 100),
        );
        assert_eq!(t.x, Q16);
        assert_eq!(t.y, Q16);
    }

    #[test]
    fn test_transform_is_pure() {
        let a = transform((123, 457), BackgroundMode::Fill, SizeQ16::CENTER, (1366, 768));
        let b = transform((123, 457), BackgroundMode::Fill, SizeQ16::CENTER, (1366, 768));
        assert_eq!(a, b);
    }

    #[test]
    fn test_failed_decode_is_sticky() {
        let mut image = Image::new(PathBuf::from("/nonexistent/wsbg-test.png"));
        assert!(!image.load(Color::BLACK));
        assert_eq!(image.status(), ImageStatus::Failed);
        assert!(!image.load(Color::BLACK));
        assert_eq!(image.size(), None);
    }

    #[test]
    fn test_decode_alpha_and_background_contract() {
        let dir = std::env::temp_dir();
        let alpha_path = dir.join("wsbg-test-alpha.png");
        let opaque_path = dir.join("wsbg-test-opaque.png");

        let mut rgba = image::RgbaImage::new(2, 2);
        rgba.put_pixel(0, 0, image::Rgba([255, 0, 0, 128]));
        rgba.save(&alpha_path).unwrap();
        let mut rgb = image::RgbImage::new(2, 2);
        rgb.put_pixel(0, 0, image::Rgb([0, 255, 0]));
        rgb.save(&opaque_path).unwrap();

        let blue = Color::opaque(0, 0, 255);
        let red = Color::opaque(255, 0, 0);

        let mut with_alpha = Image::new(alpha_path.clone());
        assert!(with_alpha.load(blue));
        assert_eq!(with_alpha.background(), blue);
        assert_eq!(with_alpha.size(), Some((2, 2)));
        // Same background: surface is reused. Different: re-decoded.
        assert!(with_alpha.load(blue));
        assert!(with_alpha.load(red));
        assert_eq!(with_alpha.background(), red);

        let mut no_alpha = Image::new(opaque_path.clone());
        assert!(no_alpha.load(blue));
        // No alpha consumed: background resets so any fill can reuse it.
        assert_eq!(no_alpha.background(), Color::ZERO);
        assert!(no_alpha.load(red));
        assert_eq!(no_alpha.background(), Color::ZERO);

        std::fs::remove_file(alpha_path).ok();
        std::fs::remove_file(opaque_path).ok();
    }
}
