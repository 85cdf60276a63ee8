//! Media-Typen für Offers und Video-Frames

use serde::{Deserialize, Serialize};

/// Media-Typ eines eingehenden Offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Audio,
    Video,
}

impl MediaType {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Audio => 0,
            Self::Video => 1,
        }
    }
}

/// Pixel-Format-Tag eines Video-Frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    I420,
    Nv12,
    Rgba,
    /// Unbekannter Tag, wird unverändert weitergereicht
    Other(i32),
}

impl PixelFormat {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::I420,
            1 => Self::Nv12,
            2 => Self::Rgba,
            other => Self::Other(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::I420 => 0,
            Self::Nv12 => 1,
            Self::Rgba => 2,
            Self::Other(raw) => raw,
        }
    }

    /// Exakte Byte-Länge eines Frames (None für unbekannte Formate)
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        match self {
            // Y-Plane plus zwei Chroma-Planes mit halber Auflösung
            Self::I420 | Self::Nv12 => {
                let luma = w.checked_mul(h)?;
                let chroma = w.div_ceil(2).checked_mul(h.div_ceil(2))?.checked_mul(2)?;
                luma.checked_add(chroma)
            }
            Self::Rgba => w.checked_mul(h)?.checked_mul(4),
            Self::Other(_) => None,
        }
    }
}

/// Ein Video-Frame in host-owned Memory
#[derive(Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
