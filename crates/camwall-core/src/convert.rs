//! YUV 4:2:0 to packed RGB conversion.
//!
//! Samples are located through the descriptor's row and pixel strides, so
//! the same routine handles fully planar (I420) and semi-planar (NV12/NV21
//! style, pixel stride 2) chroma. The U plane starts right after the Y
//! plane; V is read one byte past the chroma base within the plane that
//! starts `uv_size` bytes later.
//!
//! Output is tightly packed, row-major, three bytes per pixel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConvertError;
use crate::image::ImageDescriptor;

/// Chroma value used when a strided chroma read falls outside its plane.
pub const NEUTRAL_CHROMA: u8 = 128;

/// Byte order of each output pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelOrder {
    /// `R, G, B`
    #[default]
    Rgb,
    /// `G, R, B`, matching older producers' viewers that swapped the first two channels
    LegacyGrb,
}

impl ChannelOrder {
    fn pack(self, [r, g, b]: [u8; 3]) -> [u8; 3] {
        match self {
            ChannelOrder::Rgb => [r, g, b],
            ChannelOrder::LegacyGrb => [g, r, b],
        }
    }
}

impl FromStr for ChannelOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(ChannelOrder::Rgb),
            "legacy-grb" | "legacy_grb" => Ok(ChannelOrder::LegacyGrb),
            other => Err(format!("unknown channel order '{other}' (expected 'rgb' or 'legacy-grb')")),
        }
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOrder::Rgb => f.write_str("rgb"),
            ChannelOrder::LegacyGrb => f.write_str("legacy-grb"),
        }
    }
}

#[inline]
fn clamp_channel(value: f64) -> u8 {
    // Truncate toward zero first, then clamp.
    (value as i32).clamp(0, 255) as u8
}

#[inline]
fn sample(plane: &[u8], index: Option<usize>) -> u8 {
    index
        .and_then(|i| plane.get(i))
        .copied()
        .unwrap_or(NEUTRAL_CHROMA)
}

/// Convert a single Y/U/V sample triple to `[r, g, b]`.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f64::from(y);
    let u = f64::from(u) - 128.0;
    let v = f64::from(v) - 128.0;

    [
        clamp_channel(y + 1.370705 * v),
        clamp_channel(y - 0.698001 * v - 0.337633 * u),
        clamp_channel(y + 1.732446 * u),
    ]
}

/// Convert one wire frame into `rgb`, which must be exactly `descriptor.rgb_len()` bytes.
pub fn convert_into(
    frame: &[u8],
    descriptor: &ImageDescriptor,
    order: ChannelOrder,
    rgb: &mut [u8],
) -> Result<(), ConvertError> {
    if frame.len() != descriptor.frame_byte_size() {
        return Err(ConvertError::FrameLength {
            expected: descriptor.frame_byte_size(),
            actual: frame.len(),
        });
    }
    if rgb.len() != descriptor.rgb_len() {
        return Err(ConvertError::OutputLength {
            expected: descriptor.rgb_len(),
            actual: rgb.len(),
        });
    }

    let (y_plane, chroma) = frame.split_at(descriptor.y_size);
    let (u_plane, v_plane) = chroma.split_at(descriptor.uv_size);
    // rgb_len matched, so width * 3 cannot overflow here.
    let row_len = descriptor.width as usize * 3;
    if row_len == 0 {
        return Ok(());
    }

    for (row, out_row) in rgb.chunks_exact_mut(row_len).enumerate() {
        // Offsets that overflow are treated as missing samples.
        let y_row = row.checked_mul(descriptor.y_row_stride);
        let uv_row = (row >> 1).checked_mul(descriptor.uv_row_stride);

        for (col, pixel) in out_row.chunks_exact_mut(3).enumerate() {
            let uv_base = uv_row.and_then(|base| {
                (col >> 1)
                    .checked_mul(descriptor.uv_pixel_stride)
                    .and_then(|offset| base.checked_add(offset))
            });

            let y_index = y_row.and_then(|base| {
                col.checked_mul(descriptor.y_pixel_stride)
                    .and_then(|offset| base.checked_add(offset))
            });
            let y = y_index.and_then(|i| y_plane.get(i)).copied().unwrap_or(0);
            let u = sample(u_plane, uv_base);
            let v = sample(v_plane, uv_base.and_then(|base| base.checked_add(1)));

            pixel.copy_from_slice(&order.pack(yuv_to_rgb(y, u, v)));
        }
    }

    Ok(())
}

/// Allocating variant of [`convert_into`].
pub fn convert(
    frame: &[u8],
    descriptor: &ImageDescriptor,
    order: ChannelOrder,
) -> Result<Vec<u8>, ConvertError> {
    let mut rgb = vec![0u8; descriptor.rgb_len()];
    convert_into(frame, descriptor, order, &mut rgb)?;
    Ok(rgb)
}
