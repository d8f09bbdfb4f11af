//! Buffer cache: at most one compositor buffer per distinct color or
//! per (image, transform, fill, tiling) combination.
//!
//! Configs own buffers through `Rc`; the cache keeps `Weak` index
//! entries only, so a buffer lives exactly as long as some config
//! displays it. Dead index entries are pruned lazily.

use std::rc::{Rc, Weak};

use cairo::{Context, Extend, Filter, Matrix, Operator, SurfacePattern};
use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_shm::WlShm;
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::{Dispatch, QueueHandle};
use wayland_protocols::wp::single_pixel_buffer::v1::client::wp_single_pixel_buffer_manager_v1::WpSinglePixelBufferManagerV1;

use crate::buffer::{Buffer, BufferKey};
use crate::config::Config;
use crate::error::WsbgError;
use crate::image::{image_transform, Image};
use crate::types::{BackgroundMode, Color, ImageTransform, Q16};

pub struct BufferCache {
    colors: Vec<Weak<Buffer>>,
}

impl BufferCache {
    pub fn new() -> BufferCache {
        BufferCache { colors: Vec::new() }
    }

    /// Look up or build the buffer for `config` at the given pixel size.
    /// Returns `None` on a permanently failed image or a failed
    /// allocation; the caller logs nothing further and keeps running.
    pub fn get_buffer<T>(
        &mut self,
        config: &Config,
        images: &mut [Image],
        shm: &WlShm,
        single_pixel: Option<&WpSinglePixelBufferManagerV1>,
        qh: &QueueHandle<T>,
        width: i32,
        height: i32,
    ) -> Option<Rc<Buffer>>
    where
        T: Dispatch<WlShmPool, ()> + Dispatch<WlBuffer, ()> + 'static,
    {
        let image = match config.image {
            Some(id) if config.mode != BackgroundMode::SolidColor => &mut images[id.0],
            _ => return self.color_buffer(shm, single_pixel, qh, config.color),
        };

        // First request for this image: decode to learn its dimensions.
        if image.size().is_none() && !image.load(config.color) {
            return None;
        }
        let (image_width, image_height) = image.size()?;

        let (transform, covered) =
            image_transform(image_width, image_height, config.mode, config.position, width, height);
        let background = effective_fill(covered, image.background(), config.color);
        let repeat = tile_repeat(config.mode, covered);
        let key = BufferKey::Image {
            transform,
            background,
            repeat,
        };

        if let Some(buffer) = find_buffer(&mut image.buffers, &key) {
            return Some(buffer);
        }

        // The pixel surface may have been unloaded after the last pass.
        if !image.load(config.color) {
            return None;
        }

        let buffer = match Buffer::new_shm(shm, qh, width, height, key) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::error!("{err}");
                return None;
            }
        };
        if let Err(err) = paint_image(&buffer, image, transform, background, repeat) {
            log::error!("{err}");
            return None;
        }

        let buffer = Rc::new(buffer);
        image.buffers.push(Rc::downgrade(&buffer));
        Some(buffer)
    }

    /// Look up or build a solid-color buffer.
    pub fn color_buffer<T>(
        &mut self,
        shm: &WlShm,
        single_pixel: Option<&WpSinglePixelBufferManagerV1>,
        qh: &QueueHandle<T>,
        color: Color,
    ) -> Option<Rc<Buffer>>
    where
        T: Dispatch<WlShmPool, ()> + Dispatch<WlBuffer, ()> + 'static,
    {
        if let Some(buffer) = find_buffer(&mut self.colors, &BufferKey::Color(color)) {
            return Some(buffer);
        }
        match Buffer::new_color(shm, single_pixel, qh, color) {
            Ok(buffer) => {
                let buffer = Rc::new(buffer);
                self.colors.push(Rc::downgrade(&buffer));
                Some(buffer)
            }
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }

    /// Drop index entries whose buffers are gone.
    pub fn prune(&mut self) {
        self.colors.retain(|entry| entry.strong_count() > 0);
    }
}

/// Fill color painted under the image: skipped (zero) only when the
/// image covers the output and carries no composited alpha.
pub fn effective_fill(covered: bool, image_background: Color, config_color: Color) -> Color {
    if !covered || image_background.a != 0 {
        config_color
    } else {
        Color::ZERO
    }
}

/// Tiling extends the source only when the single tile does not already
/// cover the output.
pub fn tile_repeat(mode: BackgroundMode, covered: bool) -> bool {
    mode == BackgroundMode::Tile && !covered
}

fn find_buffer(index: &mut Vec<Weak<Buffer>>, key: &BufferKey) -> Option<Rc<Buffer>> {
    index.retain(|entry| entry.strong_count() > 0);
    index
        .iter()
        .filter_map(Weak::upgrade)
        .find(|buffer| buffer.key() == key)
}

fn paint_image(
    buffer: &Buffer,
    image: &Image,
    transform: ImageTransform,
    background: Color,
    repeat: bool,
) -> Result<(), WsbgError> {
    let paint_err = |e: cairo::Error| WsbgError::alloc(format!("buffer paint failed: {e}"));

    let surface = buffer.painting_surface()?;
    let cr = Context::new(&surface).map_err(paint_err)?;

    if background.a != 0 {
        cr.set_source_rgb(
            f64::from(background.r) / 255.0,
            f64::from(background.g) / 255.0,
            f64::from(background.b) / 255.0,
        );
        cr.paint().map_err(paint_err)?;
    }

    let source = image
        .surface()
        .ok_or_else(|| WsbgError::alloc("image surface not loaded"))?;
    let pattern = SurfacePattern::create(source);
    pattern.set_filter(Filter::Best);
    pattern.set_extend(if repeat { Extend::Repeat } else { Extend::None });

    // Pattern matrix maps output pixels into source pixels:
    // source = scale * (dest + translate).
    let q16 = f64::from(Q16);
    let scale_x = f64::from(transform.scale_x) / q16;
    let scale_y = f64::from(transform.scale_y) / q16;
    pattern.set_matrix(Matrix::new(
        scale_x,
        0.0,
        0.0,
        scale_y,
        scale_x * f64::from(transform.x) / q16,
        scale_y * f64::from(transform.y) / q16,
    ));

    cr.set_source(&pattern).map_err(paint_err)?;
    cr.set_operator(Operator::Over);
    cr.paint().map_err(paint_err)?;
    drop(cr);
    surface.flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_fill() {
        let red = Color::opaque(255, 0, 0);
        // Covered opaque image: no fill needed.
        assert_eq!(effective_fill(true, Color::ZERO, red), Color::ZERO);
        // Uncovered image always needs the fill.
        assert_eq!(effective_fill(false, Color::ZERO, red), red);
        // Alpha was composited over the config color, which keys the buffer.
        assert_eq!(effective_fill(true, red, red), red);
    }

    #[test]
    fn test_tile_repeat() {
        assert!(tile_repeat(BackgroundMode::Tile, false));
        assert!(!tile_repeat(BackgroundMode::Tile, true));
        assert!(!tile_repeat(BackgroundMode::Center, false));
        assert!(!tile_repeat(BackgroundMode::Fill, false));
    }
}
