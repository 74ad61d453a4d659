//! Frame geometry.
//!
//! A producer declares its frame layout once, in an ASCII header of eight
//! whitespace-separated integers:
//!
//! ```text
//! width height y_size uv_size y_row_stride y_pixel_stride uv_row_stride uv_pixel_stride
//! ```
//!
//! [`parse_header`] turns that text into an [`ImageDescriptor`] after
//! checking it against [`GeometryLimits`], so every later size computation
//! on the descriptor is known not to overflow.

use std::fmt;

use serde::Serialize;

use crate::errors::{GeometryError, HeaderError};

/// Maximum header size; the header is taken from a single read of this many bytes.
pub const HEADER_MAX_BYTES: usize = 64;

/// Header field names, in wire order.
pub const HEADER_FIELDS: [&str; 8] = [
    "width",
    "height",
    "y_size",
    "uv_size",
    "y_row_stride",
    "y_pixel_stride",
    "uv_row_stride",
    "uv_pixel_stride",
];

/// Upper bounds applied to producer-declared geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryLimits {
    /// Largest accepted width or height
    pub max_dimension: u32,
    /// Largest accepted `y_size + 2 * uv_size`
    pub max_frame_bytes: usize,
}

impl Default for GeometryLimits {
    fn default() -> Self {
        Self {
            max_dimension: 8192,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Geometry of every frame on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub y_size: usize,
    pub uv_size: usize,
    pub y_row_stride: usize,
    pub y_pixel_stride: usize,
    pub uv_row_stride: usize,
    pub uv_pixel_stride: usize,
}

impl ImageDescriptor {
    /// Validate raw header values and build a descriptor.
    pub fn from_fields(fields: [i64; 8], limits: &GeometryLimits) -> Result<Self, GeometryError> {
        for (name, value) in HEADER_FIELDS.iter().zip(fields) {
            // An empty chroma plane is allowed; every sample then reads as neutral.
            let min = if *name == "uv_size" { 0 } else { 1 };
            if value < min {
                return Err(GeometryError::NonPositive { field: *name, value });
            }
        }

        let dimension = |index: usize| -> Result<u32, GeometryError> {
            let value = fields[index];
            match u32::try_from(value) {
                Ok(v) if v <= limits.max_dimension => Ok(v),
                _ => Err(GeometryError::DimensionTooLarge {
                    field: HEADER_FIELDS[index],
                    value,
                    max: limits.max_dimension,
                }),
            }
        };
        let size = |index: usize| usize::try_from(fields[index]).map_err(|_| GeometryError::Overflow);

        let descriptor = Self {
            width: dimension(0)?,
            height: dimension(1)?,
            y_size: size(2)?,
            uv_size: size(3)?,
            y_row_stride: size(4)?,
            y_pixel_stride: size(5)?,
            uv_row_stride: size(6)?,
            uv_pixel_stride: size(7)?,
        };

        let frame = descriptor
            .uv_size
            .checked_mul(2)
            .and_then(|uv| uv.checked_add(descriptor.y_size))
            .ok_or(GeometryError::Overflow)?;
        if frame > limits.max_frame_bytes {
            return Err(GeometryError::TooLarge {
                size: frame,
                max: limits.max_frame_bytes,
            });
        }

        // Rows must not overlap, so the RGB output stays within 3x the Y plane.
        let row_bytes = (descriptor.width as usize)
            .checked_mul(descriptor.y_pixel_stride)
            .ok_or(GeometryError::Overflow)?;
        if descriptor.height > 1 && descriptor.y_row_stride < row_bytes {
            return Err(GeometryError::OverlappingRows {
                row_stride: descriptor.y_row_stride,
                row_bytes,
            });
        }
        descriptor.checked_rgb_len().ok_or(GeometryError::Overflow)?;

        let last_luma = (descriptor.height as usize - 1)
            .checked_mul(descriptor.y_row_stride)
            .and_then(|row| {
                (descriptor.width as usize - 1)
                    .checked_mul(descriptor.y_pixel_stride)
                    .and_then(|col| row.checked_add(col))
            })
            .ok_or(GeometryError::Overflow)?;
        if last_luma >= descriptor.y_size {
            return Err(GeometryError::YPlaneOverrun {
                index: last_luma,
                y_size: descriptor.y_size,
            });
        }

        Ok(descriptor)
    }

    /// Bytes in one wire frame: the Y plane followed by the U and V planes.
    ///
    /// Saturates for hand-built descriptors that [`ImageDescriptor::from_fields`] would reject.
    pub fn frame_byte_size(&self) -> usize {
        self.uv_size.saturating_mul(2).saturating_add(self.y_size)
    }

    /// Bytes in the tightly packed 3-byte-per-pixel output. Saturates like
    /// [`ImageDescriptor::frame_byte_size`].
    pub fn rgb_len(&self) -> usize {
        self.checked_rgb_len().unwrap_or(usize::MAX)
    }

    fn checked_rgb_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|pixels| pixels.checked_mul(3))
    }

    /// Render the descriptor as header text, as a producer would send it.
    pub fn to_header(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {}",
            self.width,
            self.height,
            self.y_size,
            self.uv_size,
            self.y_row_stride,
            self.y_pixel_stride,
            self.uv_row_stride,
            self.uv_pixel_stride
        )
    }
}

/// Parse the raw bytes of a header read.
///
/// Trailing NUL padding is ignored. Anything other than exactly eight
/// base-10 integers is rejected.
pub fn parse_header(raw: &[u8], limits: &GeometryLimits) -> Result<ImageDescriptor, HeaderError> {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let text = String::from_utf8_lossy(&raw[..end]);

    let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
    if tokens.len() != HEADER_FIELDS.len() {
        return Err(HeaderError::TokenCount(tokens.len()));
    }

    let mut fields = [0i64; 8];
    for (i, token) in tokens.iter().enumerate() {
        fields[i] = token.parse().map_err(|_| HeaderError::NotANumber {
            field: HEADER_FIELDS[i],
            token: (*token).to_string(),
        })?;
    }

    ImageDescriptor::from_fields(fields, limits).map_err(HeaderError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ImageDescriptor, HeaderError> {
        parse_header(text.as_bytes(), &GeometryLimits::default())
    }

    #[test]
    fn test_parse_reference_header() {
        let d = parse("4 4 16 8 4 1 4 2").unwrap();
        assert_eq!(
            d,
            ImageDescriptor {
                width: 4,
                height: 4,
                y_size: 16,
                uv_size: 8,
                y_row_stride: 4,
                y_pixel_stride: 1,
                uv_row_stride: 4,
                uv_pixel_stride: 2,
            }
        );
        assert_eq!(d.frame_byte_size(), 32);
        assert_eq!(d.rgb_len(), 48);
    }

    #[test]
    fn test_parse_ignores_nul_padding_and_newline() {
        let mut raw = b"2 1 2 2 2 1 2 2\n".to_vec();
        raw.resize(HEADER_MAX_BYTES, 0);
        let d = parse_header(&raw, &GeometryLimits::default()).unwrap();
        assert_eq!((d.width, d.height), (2, 1));
        assert_eq!(d.frame_byte_size(), 6);
    }

    #[test]
    fn test_non_numeric_token() {
        match parse("4 4 abc 8 4 1 4 2") {
            Err(HeaderError::NotANumber { field, token }) => {
                assert_eq!(field, "y_size");
                assert_eq!(token, "abc");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_token_count() {
        assert!(matches!(parse("4 4 16 8 4 1 4"), Err(HeaderError::TokenCount(7))));
        assert!(matches!(parse("4 4 16 8 4 1 4 2 9"), Err(HeaderError::TokenCount(9))));
        assert!(matches!(parse(""), Err(HeaderError::TokenCount(0))));
        assert!(matches!(parse_header(&[0u8; 64], &GeometryLimits::default()), Err(HeaderError::TokenCount(0))));
    }

    #[test]
    fn test_binary_garbage_is_rejected() {
        let raw = [0xffu8, 0xfe, b' ', 1, 2, 3];
        assert!(parse_header(&raw, &GeometryLimits::default()).is_err());
    }

    #[test]
    fn test_non_positive_field() {
        match parse("4 0 16 8 4 1 4 2") {
            Err(HeaderError::Geometry(GeometryError::NonPositive { field, value })) => {
                assert_eq!(field, "height");
                assert_eq!(value, 0);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            parse("4 4 16 8 4 1 -4 2"),
            Err(HeaderError::Geometry(GeometryError::NonPositive { field: "uv_row_stride", .. }))
        ));
    }

    #[test]
    fn test_dimension_limit() {
        let limits = GeometryLimits {
            max_dimension: 100,
            ..GeometryLimits::default()
        };
        let err = parse_header(b"101 1 101 1 101 1 1 1", &limits).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::Geometry(GeometryError::DimensionTooLarge { field: "width", max: 100, .. })
        ));
    }

    #[test]
    fn test_frame_size_limit() {
        let limits = GeometryLimits {
            max_dimension: 8192,
            max_frame_bytes: 31,
        };
        let err = parse_header(b"4 4 16 8 4 1 4 2", &limits).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::Geometry(GeometryError::TooLarge { size: 32, max: 31 })
        ));
    }

    #[test]
    fn test_huge_sizes_overflow_or_exceed_limit() {
        let err = parse(&format!("1 1 {} {} 1 1 1 1", i64::MAX, i64::MAX)).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::Geometry(GeometryError::Overflow | GeometryError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_luma_strides_must_fit_y_plane() {
        // Row stride 5 on a 4x4 frame addresses byte 18 of a 16-byte plane.
        let err = parse("4 4 16 8 5 1 4 2").unwrap_err();
        assert!(matches!(
            err,
            HeaderError::Geometry(GeometryError::YPlaneOverrun { index: 18, y_size: 16 })
        ));
    }

    #[test]
    fn test_overlapping_luma_rows_are_rejected() {
        // A 16 KiB frame must not be able to claim an 8192x8192 picture.
        let err = parse("8192 8192 16384 1 1 1 1 1").unwrap_err();
        assert!(matches!(
            err,
            HeaderError::Geometry(GeometryError::OverlappingRows { row_stride: 1, row_bytes: 8192 })
        ));

        // Pixel stride 2 needs a row stride of at least 2 * width.
        assert!(matches!(
            parse("4 2 16 4 7 2 4 2"),
            Err(HeaderError::Geometry(GeometryError::OverlappingRows { row_stride: 7, row_bytes: 8 }))
        ));

        // A single row has nothing to overlap with.
        assert!(parse("4 1 4 2 1 1 4 2").is_ok());
    }

    #[test]
    fn test_rgb_output_is_bounded_by_frame_limit() {
        let limits = GeometryLimits::default();
        let d = parse("8192 8192 67108864 1 8192 1 8192 2").unwrap_err();
        assert!(matches!(d, HeaderError::Geometry(GeometryError::TooLarge { .. })));

        let d = parse("4096 4096 16777216 4194304 4096 1 2048 1").unwrap();
        assert!(d.rgb_len() <= 3 * limits.max_frame_bytes);
    }

    #[test]
    fn test_empty_chroma_plane_is_accepted() {
        let d = parse("2 1 2 0 2 1 2 2").unwrap();
        assert_eq!(d.uv_size, 0);
        assert_eq!(d.frame_byte_size(), 2);
        assert!(matches!(
            parse("2 1 0 2 2 1 2 2"),
            Err(HeaderError::Geometry(GeometryError::NonPositive { field: "y_size", value: 0 }))
        ));
    }

    #[test]
    fn test_hand_built_descriptor_sizes_saturate() {
        let d = ImageDescriptor {
            width: u32::MAX,
            height: u32::MAX,
            y_size: usize::MAX,
            uv_size: usize::MAX,
            y_row_stride: usize::MAX,
            y_pixel_stride: usize::MAX,
            uv_row_stride: usize::MAX,
            uv_pixel_stride: usize::MAX,
        };
        assert_eq!(d.frame_byte_size(), usize::MAX);
        assert_eq!(d.rgb_len(), usize::MAX);
    }

    #[test]
    fn test_display_matches_wire_format() {
        let d = parse("  640\t480 307200 153599 640 1 640 2 ").unwrap();
        assert_eq!(d.to_header(), "640 480 307200 153599 640 1 640 2");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[test]
        fn prop_header_round_trip() {
            proptest!(|(
                width in 1u32..=512,
                height in 1u32..=512,
                y_pixel_stride in 1usize..=2,
                row_pad in 0usize..=16,
                uv_pixel_stride in 1usize..=2,
                uv_size in 1usize..=200_000,
            )| {
                let y_row_stride = width as usize * y_pixel_stride + row_pad;
                let y_size = (height as usize - 1) * y_row_stride
                    + (width as usize - 1) * y_pixel_stride
                    + 1;
                let d = ImageDescriptor {
                    width,
                    height,
                    y_size,
                    uv_size,
                    y_row_stride,
                    y_pixel_stride,
                    uv_row_stride: y_row_stride,
                    uv_pixel_stride,
                };
                let parsed = parse_header(d.to_header().as_bytes(), &GeometryLimits::default()).unwrap();
                prop_assert_eq!(parsed, d);
                prop_assert_eq!(parsed.frame_byte_size(), y_size + 2 * uv_size);
            });
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic() {
            proptest!(|(raw in proptest::collection::vec(any::<u8>(), 0..=HEADER_MAX_BYTES))| {
                let limits = GeometryLimits::default();
                if let Ok(d) = parse_header(&raw, &limits) {
                    prop_assert!(d.frame_byte_size() <= limits.max_frame_bytes);
                    prop_assert!(d.width <= limits.max_dimension);
                    prop_assert!(d.height <= limits.max_dimension);
                    prop_assert!(d.rgb_len() <= 3 * d.y_size);
                }
            });
        }
    }
}
