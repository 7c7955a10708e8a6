use crate::error::{GpuError, GpuResult};
use crate::format::Format;

/// Upper bound on the frame ring size.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Capacities of the fixed-size descriptor heaps.
///
/// Heaps never grow; running out is a configuration error, so these are chosen
/// generously.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapSizes {
    pub shader_resource: u32,
    pub sampler: u32,
    pub render_target: u32,
    pub depth_stencil: u32,
    pub query: u32,
    /// Shader-visible resource slots per frame slot.
    pub shader_visible_resources: u32,
    /// Shader-visible sampler slots per frame slot.
    pub shader_visible_samplers: u32,
}

impl Default for HeapSizes {
    fn default() -> Self {
        Self {
            shader_resource: 32_768,
            sampler: 2_048,
            render_target: 1_024,
            depth_stencil: 256,
            query: 512,
            shader_visible_resources: 16_384,
            shader_visible_samplers: 2_048,
        }
    }
}

/// Construction parameters for [`crate::Device`].
///
/// Keep this structure small. Per-resource options belong on the resource
/// descriptors, not here.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Number of frames in flight (the frame ring size).
    pub back_buffer_count: usize,

    /// Size of the display images in physical pixels.
    pub width: u32,
    pub height: u32,

    /// Display image color format.
    pub color_format: Format,

    /// Creates a default depth target of this format when set.
    pub depth_format: Option<Format>,

    /// MSAA sample count for the default targets and pipelines.
    pub sample_count: u32,

    /// Frames a destroyed object waits before it is physically freed.
    pub free_frames: u16,

    pub heap_sizes: HeapSizes,

    /// Bytes in each frame slot's transient uniform ring.
    pub uniform_ring_size: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            back_buffer_count: 2,
            width: 1280,
            height: 720,
            color_format: Format::Bgra8UnormSrgb,
            depth_format: Some(Format::Depth24PlusStencil8),
            sample_count: 1,
            free_frames: 2,
            heap_sizes: HeapSizes::default(),
            uniform_ring_size: 1 << 20,
        }
    }
}

impl DeviceConfig {
    /// Checks the configuration before any native object is created.
    pub fn validate(&self) -> GpuResult<()> {
        if !(2..=MAX_FRAMES_IN_FLIGHT).contains(&self.back_buffer_count) {
            return Err(GpuError::InvalidConfig(format!(
                "back_buffer_count must be in 2..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.back_buffer_count
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(GpuError::InvalidConfig("display size must be non-zero".into()));
        }
        if self.color_format == Format::Undefined || self.color_format.is_depth() {
            return Err(GpuError::InvalidConfig(format!(
                "{:?} is not a color format",
                self.color_format
            )));
        }
        if let Some(depth) = self.depth_format {
            if !depth.is_depth() {
                return Err(GpuError::InvalidConfig(format!("{depth:?} is not a depth format")));
            }
        }
        if !matches!(self.sample_count, 1 | 2 | 4 | 8) {
            return Err(GpuError::InvalidConfig(format!(
                "unsupported sample count {}",
                self.sample_count
            )));
        }
        if self.free_frames == 0 {
            return Err(GpuError::InvalidConfig("free_frames must be at least 1".into()));
        }
        if self.uniform_ring_size < 256 {
            return Err(GpuError::InvalidConfig("uniform ring must hold at least 256 bytes".into()));
        }
        let h = self.heap_sizes;
        if h.shader_resource == 0 || h.sampler == 0 || h.render_target < self.back_buffer_count as u32 {
            return Err(GpuError::InvalidConfig("descriptor heaps are too small".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(DeviceConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_single_buffering() {
        let config = DeviceConfig { back_buffer_count: 1, ..Default::default() };
        assert!(matches!(config.validate(), Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_too_many_frames() {
        let config = DeviceConfig {
            back_buffer_count: MAX_FRAMES_IN_FLIGHT + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_depth_as_color() {
        let config = DeviceConfig { color_format: Format::Depth32Float, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_odd_sample_count() {
        let config = DeviceConfig { sample_count: 3, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
