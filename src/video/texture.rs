//! GPU texture for streamed frames
//!
//! Owns one wgpu texture plus two mappable staging buffers. Each frame is
//! written into the staging buffer the GPU is not reading from, then copied
//! into the texture on the queue, so the CPU never overwrites memory a
//! previous copy still uses.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::FrameLayout;
use crate::error::{StreamError, StreamResult};

const SLOT_MAPPED: u8 = 0;
const SLOT_PENDING: u8 = 1;
const SLOT_FAILED: u8 = 2;

/// Round `value` up to a multiple of `alignment`
pub fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Row pitch for buffer-to-texture copies
pub fn padded_bytes_per_row(layout: &FrameLayout) -> u32 {
    align_to(layout.stride() as u32, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

/// Copy tightly packed rows into a buffer with a wider row pitch
pub fn copy_rows(dst: &mut [u8], src: &[u8], row_bytes: usize, padded_row_bytes: usize) {
    if row_bytes == padded_row_bytes {
        dst[..src.len()].copy_from_slice(src);
        return;
    }
    for (dst_row, src_row) in dst
        .chunks_exact_mut(padded_row_bytes)
        .zip(src.chunks_exact(row_bytes))
    {
        dst_row[..row_bytes].copy_from_slice(src_row);
    }
}

/// One staging buffer and its mapping state
struct StagingSlot {
    buffer: wgpu::Buffer,
    state: Arc<AtomicU8>,
    /// Copy that last read from this buffer
    submission: Option<wgpu::SubmissionIndex>,
}

impl StagingSlot {
    fn new(device: &wgpu::Device, size: u64, index: usize) -> Self {
        let label = format!("Stream Staging {}", index);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size,
            usage: wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        Self {
            buffer,
            state: Arc::new(AtomicU8::new(SLOT_MAPPED)),
            submission: None,
        }
    }

    /// Request the buffer back for CPU writes once the GPU copy retires
    fn remap(&mut self, submission: wgpu::SubmissionIndex) {
        self.submission = Some(submission);
        self.state.store(SLOT_PENDING, Ordering::Release);
        let state = Arc::clone(&self.state);
        self.buffer
            .slice(..)
            .map_async(wgpu::MapMode::Write, move |result| {
                let next = if result.is_ok() { SLOT_MAPPED } else { SLOT_FAILED };
                state.store(next, Ordering::Release);
            });
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// A texture receiving streamed frames through double-buffered staging
pub struct StreamTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    staging: [StagingSlot; 2],
    next_slot: usize,
    layout: FrameLayout,
    padded_bytes_per_row: u32,
}

impl StreamTexture {
    /// Allocate the texture and both staging buffers
    pub fn new(device: &wgpu::Device, layout: FrameLayout) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Stream Texture"),
            size: wgpu::Extent3d {
                width: layout.width,
                height: layout.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: layout.format.texture_format(),
            // COPY_DST for uploading data, TEXTURE_BINDING for shader sampling
            usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let padded_bytes_per_row = padded_bytes_per_row(&layout);
        let staging_size = padded_bytes_per_row as u64 * layout.height as u64;
        let staging = [
            StagingSlot::new(device, staging_size, 0),
            StagingSlot::new(device, staging_size, 1),
        ];

        tracing::debug!(
            "Created {}x{} stream texture ({:?}, row pitch {})",
            layout.width,
            layout.height,
            layout.format,
            padded_bytes_per_row
        );

        Self {
            texture,
            view,
            staging,
            next_slot: 0,
            layout,
            padded_bytes_per_row,
        }
    }

    /// Copy one complete frame into the texture.
    ///
    /// The caller guarantees `frame` is exactly one frame long.
    pub fn write_frame(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        frame: &[u8],
    ) -> StreamResult<()> {
        self.layout.check_len(frame.len())?;

        let slot_index = self.next_slot;
        let slot = &mut self.staging[slot_index];

        if slot.state() == SLOT_PENDING {
            let _ = device.poll(wgpu::Maintain::Poll);
        }
        if slot.state() == SLOT_PENDING {
            // Only the copy from two frames ago has to retire, not the one just queued
            let maintain = match slot.submission.clone() {
                Some(index) => wgpu::Maintain::WaitForSubmissionIndex(index),
                None => wgpu::Maintain::Wait,
            };
            let _ = device.poll(maintain);
        }
        if slot.state() == SLOT_PENDING {
            let _ = device.poll(wgpu::Maintain::Wait);
        }
        match slot.state() {
            SLOT_MAPPED => {}
            SLOT_FAILED => return Err(StreamError::Gpu("staging buffer mapping failed".into())),
            _ => return Err(StreamError::Gpu("staging buffer still in use".into())),
        }

        {
            let mut mapped = slot.buffer.slice(..).get_mapped_range_mut();
            copy_rows(
                &mut mapped,
                frame,
                self.layout.stride(),
                self.padded_bytes_per_row as usize,
            );
        }
        slot.buffer.unmap();

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Stream Upload"),
        });
        encoder.copy_buffer_to_texture(
            wgpu::TexelCopyBufferInfo {
                buffer: &slot.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.layout.height),
                },
            },
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: self.layout.width,
                height: self.layout.height,
                depth_or_array_layers: 1,
            },
        );
        let submission = queue.submit(Some(encoder.finish()));

        slot.remap(submission);
        self.next_slot = (slot_index + 1) % self.staging.len();
        Ok(())
    }

    /// Get the texture view
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }
}
