//! Texture formats, usage flags and extents.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Pixel format of a shared allocation or of a texture created from one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Placeholder reported by allocations that failed to import.
    #[default]
    Undefined,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgb10a2Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    /// NV12: full resolution 8-bit luma plane plus half resolution interleaved chroma.
    R8Bg8Biplanar420Unorm,
    /// P010: like NV12 with 10 significant bits stored in 16-bit words.
    R10x6Bg10x6Biplanar420Unorm,
}

/// Build a DRM fourcc code from its four characters.
const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

const DRM_FORMAT_R8: u32 = fourcc(b'R', b'8', b' ', b' ');
const DRM_FORMAT_GR88: u32 = fourcc(b'G', b'R', b'8', b'8');
const DRM_FORMAT_ABGR8888: u32 = fourcc(b'A', b'B', b'2', b'4');
const DRM_FORMAT_XBGR8888: u32 = fourcc(b'X', b'B', b'2', b'4');
const DRM_FORMAT_ARGB8888: u32 = fourcc(b'A', b'R', b'2', b'4');
const DRM_FORMAT_XRGB8888: u32 = fourcc(b'X', b'R', b'2', b'4');
const DRM_FORMAT_ABGR2101010: u32 = fourcc(b'A', b'B', b'3', b'0');
const DRM_FORMAT_NV12: u32 = fourcc(b'N', b'V', b'1', b'2');
const DRM_FORMAT_P010: u32 = fourcc(b'P', b'0', b'1', b'0');

impl TextureFormat {
    /// Every defined format, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::R8Unorm,
        Self::Rg8Unorm,
        Self::Rgba8Unorm,
        Self::Rgba8UnormSrgb,
        Self::Bgra8Unorm,
        Self::Bgra8UnormSrgb,
        Self::Rgb10a2Unorm,
        Self::R16Float,
        Self::Rg16Float,
        Self::Rgba16Float,
        Self::R8Bg8Biplanar420Unorm,
        Self::R10x6Bg10x6Biplanar420Unorm,
    ];

    /// Number of planes (0 for `Undefined`).
    pub const fn plane_count(self) -> usize {
        match self {
            Self::Undefined => 0,
            Self::R8Bg8Biplanar420Unorm | Self::R10x6Bg10x6Biplanar420Unorm => 2,
            _ => 1,
        }
    }

    /// Returns true for YUV and other multi-planar formats.
    pub const fn is_multi_planar(self) -> bool {
        self.plane_count() > 1
    }

    /// Bytes per texel of the given plane.
    pub const fn plane_bytes_per_texel(self, plane: usize) -> u32 {
        match (self, plane) {
            (Self::Undefined, _) => 0,
            (Self::R8Unorm, 0) | (Self::R8Bg8Biplanar420Unorm, 0) => 1,
            (Self::Rg8Unorm, 0)
            | (Self::R16Float, 0)
            | (Self::R8Bg8Biplanar420Unorm, 1)
            | (Self::R10x6Bg10x6Biplanar420Unorm, 0) => 2,
            (Self::Rgba8Unorm, 0)
            | (Self::Rgba8UnormSrgb, 0)
            | (Self::Bgra8Unorm, 0)
            | (Self::Bgra8UnormSrgb, 0)
            | (Self::Rgb10a2Unorm, 0)
            | (Self::Rg16Float, 0)
            | (Self::R10x6Bg10x6Biplanar420Unorm, 1) => 4,
            (Self::Rgba16Float, 0) => 8,
            _ => 0,
        }
    }

    /// Extent of the given plane for a texture of `size`.
    ///
    /// Chroma planes of 4:2:0 formats are subsampled by two in both directions,
    /// rounding up.
    pub const fn plane_extent(self, plane: usize, size: Extent3d) -> Extent3d {
        if self.is_multi_planar() && plane > 0 {
            Extent3d {
                width: size.width.div_ceil(2),
                height: size.height.div_ceil(2),
                depth_or_array_layers: size.depth_or_array_layers,
            }
        } else {
            size
        }
    }

    /// Size in bytes of a tightly packed plane.
    pub const fn plane_byte_size(self, plane: usize, size: Extent3d) -> usize {
        let extent = self.plane_extent(plane, size);
        extent.width as usize
            * extent.height as usize
            * extent.depth_or_array_layers as usize
            * self.plane_bytes_per_texel(plane) as usize
    }

    /// Whether the format stores an alpha channel.
    pub const fn has_alpha(self) -> bool {
        matches!(
            self,
            Self::Rgba8Unorm
                | Self::Rgba8UnormSrgb
                | Self::Bgra8Unorm
                | Self::Bgra8UnormSrgb
                | Self::Rgb10a2Unorm
                | Self::Rgba16Float
        )
    }

    /// Whether the format can be used as a render attachment.
    pub const fn is_renderable(self) -> bool {
        !matches!(self, Self::Undefined) && !self.is_multi_planar()
    }

    /// Whether the format is an sRGB-encoded variant.
    pub const fn is_srgb(self) -> bool {
        matches!(self, Self::Rgba8UnormSrgb | Self::Bgra8UnormSrgb)
    }

    /// The sRGB/linear counterpart with the same bit layout, if any.
    pub const fn srgb_counterpart(self) -> Option<Self> {
        match self {
            Self::Rgba8Unorm => Some(Self::Rgba8UnormSrgb),
            Self::Rgba8UnormSrgb => Some(Self::Rgba8Unorm),
            Self::Bgra8Unorm => Some(Self::Bgra8UnormSrgb),
            Self::Bgra8UnormSrgb => Some(Self::Bgra8Unorm),
            _ => None,
        }
    }

    /// Whether a texture of format `other` may reinterpret memory of this format.
    pub fn is_view_compatible(self, other: Self) -> bool {
        self == other || self.srgb_counterpart() == Some(other)
    }

    /// Usages an allocation of this format may advertise at most.
    pub fn supported_usage(self) -> TextureUsage {
        match self {
            Self::Undefined => TextureUsage::empty(),
            f if f.is_multi_planar() => TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC,
            f if f.is_srgb() => {
                TextureUsage::COPY_SRC
                    | TextureUsage::COPY_DST
                    | TextureUsage::TEXTURE_BINDING
                    | TextureUsage::RENDER_ATTACHMENT
            }
            _ => TextureUsage::SHAREABLE,
        }
    }

    /// DRM fourcc code used to describe dma-buf contents.
    pub const fn drm_fourcc(self) -> Option<u32> {
        match self {
            Self::R8Unorm => Some(DRM_FORMAT_R8),
            Self::Rg8Unorm => Some(DRM_FORMAT_GR88),
            Self::Rgba8Unorm => Some(DRM_FORMAT_ABGR8888),
            Self::Bgra8Unorm => Some(DRM_FORMAT_ARGB8888),
            Self::Rgb10a2Unorm => Some(DRM_FORMAT_ABGR2101010),
            Self::R8Bg8Biplanar420Unorm => Some(DRM_FORMAT_NV12),
            Self::R10x6Bg10x6Biplanar420Unorm => Some(DRM_FORMAT_P010),
            _ => None,
        }
    }

    /// Map a DRM fourcc code to a texture format.
    ///
    /// Formats with an ignored `X` channel map to their alpha-carrying equivalent.
    pub fn from_drm_fourcc(code: u32) -> Result<Self> {
        match code {
            DRM_FORMAT_R8 => Ok(Self::R8Unorm),
            DRM_FORMAT_GR88 => Ok(Self::Rg8Unorm),
            DRM_FORMAT_ABGR8888 | DRM_FORMAT_XBGR8888 => Ok(Self::Rgba8Unorm),
            DRM_FORMAT_ARGB8888 | DRM_FORMAT_XRGB8888 => Ok(Self::Bgra8Unorm),
            DRM_FORMAT_ABGR2101010 => Ok(Self::Rgb10a2Unorm),
            DRM_FORMAT_NV12 => Ok(Self::R8Bg8Biplanar420Unorm),
            DRM_FORMAT_P010 => Ok(Self::R10x6Bg10x6Biplanar420Unorm),
            other => Err(Error::UnsupportedFourcc(other)),
        }
    }

    /// Decode one texel of a single-planar format to normalized RGBA.
    ///
    /// Channels the format does not store read as 0, except alpha which reads as 1.
    pub fn decode_rgba(self, texel: &[u8]) -> Option<[f32; 4]> {
        let unorm8 = |b: u8| f32::from(b) / 255.0;
        let float16 = |lo: u8, hi: u8| half::f16::from_le_bytes([lo, hi]).to_f32();
        let rgba = match (self, texel) {
            (Self::R8Unorm, [r, ..]) => [unorm8(*r), 0.0, 0.0, 1.0],
            (Self::Rg8Unorm, [r, g, ..]) => [unorm8(*r), unorm8(*g), 0.0, 1.0],
            (Self::Rgba8Unorm | Self::Rgba8UnormSrgb, [r, g, b, a, ..]) => {
                [unorm8(*r), unorm8(*g), unorm8(*b), unorm8(*a)]
            }
            (Self::Bgra8Unorm | Self::Bgra8UnormSrgb, [b, g, r, a, ..]) => {
                [unorm8(*r), unorm8(*g), unorm8(*b), unorm8(*a)]
            }
            (Self::Rgb10a2Unorm, [b0, b1, b2, b3, ..]) => {
                let packed = u32::from_le_bytes([*b0, *b1, *b2, *b3]);
                let channel = |shift: u32, bits: u32| {
                    let max = (1u32 << bits) - 1;
                    ((packed >> shift) & max) as f32 / max as f32
                };
                [channel(0, 10), channel(10, 10), channel(20, 10), channel(30, 2)]
            }
            (Self::R16Float, [r0, r1, ..]) => [float16(*r0, *r1), 0.0, 0.0, 1.0],
            (Self::Rg16Float, [r0, r1, g0, g1, ..]) => {
                [float16(*r0, *r1), float16(*g0, *g1), 0.0, 1.0]
            }
            (Self::Rgba16Float, [r0, r1, g0, g1, b0, b1, a0, a1, ..]) => [
                float16(*r0, *r1),
                float16(*g0, *g1),
                float16(*b0, *b1),
                float16(*a0, *a1),
            ],
            _ => return None,
        };
        Some(rgba)
    }

    /// Encode normalized RGBA into one texel of a single-planar format.
    ///
    /// Values are clamped to `[0, 1]` for unorm formats; channels the format does
    /// not store are dropped.
    pub fn encode_rgba(self, rgba: [f32; 4]) -> Option<Vec<u8>> {
        let unorm = |v: f32, max: u32| (v.clamp(0.0, 1.0) * max as f32).round() as u32;
        let unorm8 = |v: f32| unorm(v, 255) as u8;
        let float16 = |v: f32| half::f16::from_f32(v).to_le_bytes();
        let [r, g, b, a] = rgba;
        let texel = match self {
            Self::R8Unorm => vec![unorm8(r)],
            Self::Rg8Unorm => vec![unorm8(r), unorm8(g)],
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb => {
                vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)]
            }
            Self::Bgra8Unorm | Self::Bgra8UnormSrgb => {
                vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)]
            }
            Self::Rgb10a2Unorm => {
                let packed = unorm(r, 1023)
                    | unorm(g, 1023) << 10
                    | unorm(b, 1023) << 20
                    | unorm(a, 3) << 30;
                packed.to_le_bytes().to_vec()
            }
            Self::R16Float => float16(r).to_vec(),
            Self::Rg16Float => [float16(r), float16(g)].concat(),
            Self::Rgba16Float => [float16(r), float16(g), float16(b), float16(a)].concat(),
            Self::Undefined | Self::R8Bg8Biplanar420Unorm | Self::R10x6Bg10x6Biplanar420Unorm => {
                return None
            }
        };
        Some(texel)
    }

    /// Canonical lower-case name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::R8Unorm => "r8unorm",
            Self::Rg8Unorm => "rg8unorm",
            Self::Rgba8Unorm => "rgba8unorm",
            Self::Rgba8UnormSrgb => "rgba8unorm-srgb",
            Self::Bgra8Unorm => "bgra8unorm",
            Self::Bgra8UnormSrgb => "bgra8unorm-srgb",
            Self::Rgb10a2Unorm => "rgb10a2unorm",
            Self::R16Float => "r16float",
            Self::Rg16Float => "rg16float",
            Self::Rgba16Float => "rgba16float",
            Self::R8Bg8Biplanar420Unorm => "r8bg8biplanar420unorm",
            Self::R10x6Bg10x6Biplanar420Unorm => "r10x6bg10x6biplanar420unorm",
        }
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextureFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "nv12" => return Ok(Self::R8Bg8Biplanar420Unorm),
            "p010" => return Ok(Self::R10x6Bg10x6Biplanar420Unorm),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|format| format.name() == lower)
            .ok_or_else(|| Error::UnknownFormat(s.to_string()))
    }
}

bitflags! {
    /// Operations a texture may be used for.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
        /// Tile-memory-only attachment. Never valid on shared memory.
        const TRANSIENT_ATTACHMENT = 1 << 5;

        /// Usages that may modify contents.
        const WRITE = Self::COPY_DST.bits()
            | Self::STORAGE_BINDING.bits()
            | Self::RENDER_ATTACHMENT.bits();
        /// Every usage a shared allocation may carry.
        const SHAREABLE = Self::COPY_SRC.bits()
            | Self::COPY_DST.bits()
            | Self::TEXTURE_BINDING.bits()
            | Self::STORAGE_BINDING.bits()
            | Self::RENDER_ATTACHMENT.bits();
    }
}

impl TextureUsage {
    /// Whether any usage in the set can write to the texture.
    pub const fn is_write_capable(self) -> bool {
        self.intersects(Self::WRITE)
    }
}

/// Texture dimensionality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

/// Size of a texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
}

impl Extent3d {
    /// Zero-sized extent, reported by error allocations.
    pub const ZERO: Self = Self {
        width: 0,
        height: 0,
        depth_or_array_layers: 0,
    };

    /// A single-layer 2D extent.
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth_or_array_layers: 1,
        }
    }

    /// Number of texels in the extent.
    pub const fn texel_count(self) -> usize {
        self.width as usize * self.height as usize * self.depth_or_array_layers as usize
    }
}

impl fmt::Display for Extent3d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.width, self.height, self.depth_or_array_layers
        )
    }
}
