//! Backend-neutral format and topology enums.
//!
//! All enums are `repr(u8)` so they can be packed into pipeline-state keys.

/// Texture / render-target formats understood by the core.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum Format {
    #[default]
    Undefined = 0,
    R8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth16Unorm,
    Depth24PlusStencil8,
    Depth32Float,
}

impl Format {
    /// Bytes per texel for uncompressed color formats and copyable depth formats.
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::Depth16Unorm => 2,
            Format::Rgba8Unorm
            | Format::Rgba8UnormSrgb
            | Format::Bgra8Unorm
            | Format::Bgra8UnormSrgb
            | Format::R32Float
            | Format::Depth24PlusStencil8
            | Format::Depth32Float => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    pub const fn is_depth(self) -> bool {
        matches!(
            self,
            Format::Depth16Unorm | Format::Depth24PlusStencil8 | Format::Depth32Float
        )
    }

    pub const fn has_stencil(self) -> bool {
        matches!(self, Format::Depth24PlusStencil8)
    }
}

/// Vertex attribute formats.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum VertexFormat {
    #[default]
    Float32x4 = 0,
    Float32,
    Float32x2,
    Float32x3,
    Uint32,
    Uint16x2,
    Unorm8x4,
}

impl VertexFormat {
    pub const fn size(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 => 4,
            VertexFormat::Uint16x2 | VertexFormat::Unorm8x4 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum IndexFormat {
    #[default]
    Uint16 = 0,
    Uint32,
}

impl IndexFormat {
    pub const fn size(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum PrimitiveTopology {
    PointList = 0,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

/// Shader stage a uniform binding is visible to.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ShaderStage {
    Vertex = 0,
    Fragment,
}

impl ShaderStage {
    pub const COUNT: usize = 2;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}
