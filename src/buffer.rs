//! Shared-memory buffer management for Wayland.
//!
//! Buffers are memory-mapped files created in `XDG_RUNTIME_DIR` and
//! unlinked immediately after mapping, so a crash can never leak a
//! filesystem entry. Solid colors use the single-pixel-buffer protocol
//! when the compositor offers it.

use std::env;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::ptr::NonNull;

use cairo::{Format, ImageSurface};
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{ftruncate, mkstemp, unlink};
use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_shm::{self, WlShm};
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::{Dispatch, QueueHandle};
use wayland_protocols::wp::single_pixel_buffer::v1::client::wp_single_pixel_buffer_manager_v1::WpSinglePixelBufferManagerV1;

use crate::error::WsbgError;
use crate::types::{Color, ImageTransform};

/// Identity of a cached buffer: either a solid color, or an image
/// rendered with a specific transform, fill and tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKey {
    Color(Color),
    Image {
        transform: ImageTransform,
        background: Color,
        repeat: bool,
    },
}

struct Mapping {
    ptr: NonNull<c_void>,
    size: usize,
}

impl Mapping {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.size);
        }
    }
}

/// A compositor buffer plus, when shm-backed, its writable mapping.
///
/// Configs own buffers through `Rc`; dropping the last owner destroys
/// the compositor handle and unmaps the memory.
pub struct Buffer {
    wl_buffer: WlBuffer,
    mapping: Option<Mapping>,
    width: i32,
    height: i32,
    key: BufferKey,
}

impl Buffer {
    /// Allocate a `width` x `height` XRGB8888 shm buffer.
    pub fn new_shm<T>(
        shm: &WlShm,
        qh: &QueueHandle<T>,
        width: i32,
        height: i32,
        key: BufferKey,
    ) -> Result<Buffer, WsbgError>
    where
        T: Dispatch<WlShmPool, ()> + Dispatch<WlBuffer, ()> + 'static,
    {
        let stride = width * 4;
        let size = stride as usize * height as usize;
        let (pool, mapping) = create_pool(shm, qh, size)?;
        let wl_buffer =
            pool.create_buffer(0, width, height, stride, wl_shm::Format::Xrgb8888, qh, ());
        pool.destroy();
        Ok(Buffer {
            wl_buffer,
            mapping: Some(mapping),
            width,
            height,
            key,
        })
    }

    /// Allocate a 1x1 buffer of a solid color, preferring the
    /// single-pixel-buffer protocol over a pool.
    pub fn new_color<T>(
        shm: &WlShm,
        single_pixel: Option<&WpSinglePixelBufferManagerV1>,
        qh: &QueueHandle<T>,
        color: Color,
    ) -> Result<Buffer, WsbgError>
    where
        T: Dispatch<WlShmPool, ()> + Dispatch<WlBuffer, ()> + 'static,
    {
        if let Some(manager) = single_pixel {
            let scale = |channel: u8| u32::from(channel) * 0x0101_0101;
            let wl_buffer = manager.create_u32_rgba_buffer(
                scale(color.r),
                scale(color.g),
                scale(color.b),
                scale(color.a),
                qh,
                (),
            );
            return Ok(Buffer {
                wl_buffer,
                mapping: None,
                width: 1,
                height: 1,
                key: BufferKey::Color(color),
            });
        }

        let data = [color.b, color.g, color.r, color.a];
        let (pool, mapping) = create_pool(shm, qh, data.len())?;
        let format = if color.a == 0xFF {
            wl_shm::Format::Xrgb8888
        } else {
            wl_shm::Format::Argb8888
        };
        let wl_buffer = pool.create_buffer(0, 1, 1, data.len() as i32, format, qh, ());
        pool.destroy();
        unsafe {
            mapping
                .as_mut_ptr()
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
        Ok(Buffer {
            wl_buffer,
            mapping: Some(mapping),
            width: 1,
            height: 1,
            key: BufferKey::Color(color),
        })
    }

    pub fn wl_buffer(&self) -> &WlBuffer {
        &self.wl_buffer
    }

    pub fn key(&self) -> &BufferKey {
        &self.key
    }

    /// Cairo surface over the mapped pixels, for painting right after
    /// allocation. Must not outlive the buffer.
    pub fn painting_surface(&self) -> Result<ImageSurface, WsbgError> {
        let mapping = self
            .mapping
            .as_ref()
            .ok_or_else(|| WsbgError::alloc("buffer has no mapping"))?;
        let surface = unsafe {
            ImageSurface::create_for_data_unsafe(
                mapping.as_mut_ptr(),
                Format::Rgb24,
                self.width,
                self.height,
                self.width * 4,
            )
        }
        .map_err(|e| WsbgError::alloc(format!("cairo surface creation failed: {e}")))?;
        Ok(surface)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.wl_buffer.destroy();
    }
}

/// Create, size and map a pool file, then hand its fd to the compositor.
/// The file is unlinked and the fd closed on every path; the mapping and
/// the compositor keep the inode alive.
fn create_pool<T>(
    shm: &WlShm,
    qh: &QueueHandle<T>,
    size: usize,
) -> Result<(WlShmPool, Mapping), WsbgError>
where
    T: Dispatch<WlShmPool, ()> + 'static,
{
    let runtime_dir = env::var_os("XDG_RUNTIME_DIR")
        .ok_or_else(|| WsbgError::alloc("XDG_RUNTIME_DIR is not set"))?;
    let template = PathBuf::from(runtime_dir).join("wsbg-XXXXXX");

    let (raw_fd, path) = mkstemp(&template)
        .map_err(|e| WsbgError::alloc(format!("temp file creation failed: {e}")))?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

    let result = map_pool_file(shm, qh, &fd, size);
    let _ = unlink(&path);
    result
}

fn map_pool_file<T>(
    shm: &WlShm,
    qh: &QueueHandle<T>,
    fd: &OwnedFd,
    size: usize,
) -> Result<(WlShmPool, Mapping), WsbgError>
where
    T: Dispatch<WlShmPool, ()> + 'static,
{
    loop {
        match ftruncate(fd, size as i64) {
            Ok(()) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(WsbgError::alloc(format!("ftruncate failed: {e}"))),
        }
    }

    let length = NonZeroUsize::new(size)
        .ok_or_else(|| WsbgError::alloc("zero-sized buffer requested"))?;
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| WsbgError::alloc(format!("shared memory map failed: {e}")))?;

    let pool = shm.create_pool(fd.as_fd(), size as i32, qh, ());
    Ok((pool, Mapping { ptr, size }))
}
