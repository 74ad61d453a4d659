//! Error types for camwall core.
//!
//! Errors are layered the same way the session runs: transport reads fail
//! with [`StreamError`], header parsing fails with [`HeaderError`] (which
//! wraps [`GeometryError`] for out-of-range sizes), slot bookkeeping fails
//! with [`SlotError`], and everything that ends a session is folded into
//! [`SessionError`].

use std::time::Duration;

use thiserror::Error;

use crate::slots::SlotId;

// ============================================================================
// Transport
// ============================================================================

/// Failure while pulling bytes off a producer connection.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Peer closed the connection (a read returned zero bytes)
    #[error("peer closed the connection after {received} of {expected} bytes")]
    Eof { received: usize, expected: usize },

    /// Read returned an error
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    /// No bytes arrived within the idle timeout
    #[error("no data received for {0:?}")]
    Idle(Duration),
}

// ============================================================================
// Header / geometry
// ============================================================================

/// Header values that parse but describe an unusable frame geometry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    /// A header field was zero or negative (negative only, for `uv_size`)
    #[error("{field} is out of range (got {value})")]
    NonPositive { field: &'static str, value: i64 },

    /// Width or height above the configured bound
    #[error("{field} {value} exceeds the maximum dimension {max}")]
    DimensionTooLarge {
        field: &'static str,
        value: i64,
        max: u32,
    },

    /// Derived sizes do not fit in memory arithmetic
    #[error("frame geometry overflows")]
    Overflow,

    /// Frame would exceed the configured per-frame allocation bound
    #[error("frame size {size} exceeds the limit of {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// Luma row stride shorter than one row of samples
    #[error("y_row_stride {row_stride} is shorter than a row of {row_bytes} bytes")]
    OverlappingRows { row_stride: usize, row_bytes: usize },

    /// Strides address luma samples past the end of the Y plane
    #[error("last luma sample at offset {index} lies outside the {y_size}-byte Y plane")]
    YPlaneOverrun { index: usize, y_size: usize },
}

/// Failure while reading or parsing the header message.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The header read itself failed
    #[error("header read failed: {0}")]
    Read(#[from] std::io::Error),

    /// Connection closed before any header bytes arrived
    #[error("connection closed before the header arrived")]
    Empty,

    /// Wrong number of whitespace-separated fields
    #[error("expected 8 header fields, got {0}")]
    TokenCount(usize),

    /// A field is not a base-10 integer
    #[error("header field {field} is not an integer: {token:?}")]
    NotANumber { field: &'static str, token: String },

    /// Fields parsed but the geometry is unusable
    #[error("invalid geometry: {0}")]
    Geometry(#[from] GeometryError),
}

// ============================================================================
// Slot table
// ============================================================================

/// Slot table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    /// Every slot is occupied by a different address
    #[error("all {capacity} slots are occupied")]
    Busy { capacity: usize },

    /// Slot index out of range
    #[error("slot {0} does not exist")]
    UnknownSlot(SlotId),

    /// Slot has no occupant
    #[error("slot {0} is free")]
    SlotFree(SlotId),

    /// The lease no longer matches the slot's occupant (it was evicted or released)
    #[error("lease for slot {0} has expired")]
    LeaseExpired(SlotId),
}

// ============================================================================
// Session
// ============================================================================

/// Pixel conversion precondition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("frame is {actual} bytes, descriptor expects {expected}")]
    FrameLength { expected: usize, actual: usize },

    #[error("RGB buffer is {actual} bytes, descriptor expects {expected}")]
    OutputLength { expected: usize, actual: usize },
}

/// Reason a session ended.
///
/// Every session ends with one of these; a producer hanging up normally is
/// reported as [`SessionError::StreamClosed`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Header could not be read or parsed
    #[error("invalid header: {0}")]
    InvalidHeader(HeaderError),

    /// Header parsed but declared out-of-range geometry
    #[error("invalid geometry: {0}")]
    InvalidGeometry(GeometryError),

    /// Zero-byte or failed read while streaming frames
    #[error("stream closed: {0}")]
    StreamClosed(StreamError),

    /// Producer went silent for longer than the idle timeout
    #[error("idle for {0:?}")]
    IdleTimeout(Duration),

    /// Slot was reassigned (reconnect from the same address) or evicted by an operator
    #[error("evicted from slot")]
    Evicted,

    /// Internal conversion precondition failed
    #[error("conversion failed: {0}")]
    Convert(#[from] ConvertError),
}

impl SessionError {
    /// Whether this is an ordinary end of session rather than a protocol violation.
    pub fn is_clean_close(&self) -> bool {
        matches!(
            self,
            SessionError::StreamClosed(_) | SessionError::Evicted | SessionError::IdleTimeout(_)
        )
    }

    /// Short machine-friendly label, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::InvalidHeader(_) => "invalid_header",
            SessionError::InvalidGeometry(_) => "invalid_geometry",
            SessionError::StreamClosed(_) => "stream_closed",
            SessionError::IdleTimeout(_) => "idle_timeout",
            SessionError::Evicted => "evicted",
            SessionError::Convert(_) => "convert",
        }
    }
}

impl From<HeaderError> for SessionError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::Geometry(g) => SessionError::InvalidGeometry(g),
            other => SessionError::InvalidHeader(other),
        }
    }
}

impl From<StreamError> for SessionError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Idle(d) => SessionError::IdleTimeout(d),
            other => SessionError::StreamClosed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_header_error_maps_to_invalid_geometry() {
        let err: SessionError = HeaderError::Geometry(GeometryError::Overflow).into();
        assert!(matches!(err, SessionError::InvalidGeometry(GeometryError::Overflow)));
        assert_eq!(err.kind(), "invalid_geometry");
    }

    #[test]
    fn test_parse_header_error_maps_to_invalid_header() {
        let err: SessionError = HeaderError::TokenCount(3).into();
        assert!(matches!(err, SessionError::InvalidHeader(HeaderError::TokenCount(3))));
        assert!(!err.is_clean_close());
    }

    #[test]
    fn test_idle_stream_error_maps_to_idle_timeout() {
        let err: SessionError = StreamError::Idle(Duration::from_secs(5)).into();
        assert!(matches!(err, SessionError::IdleTimeout(d) if d == Duration::from_secs(5)));
        assert!(err.is_clean_close());
    }

    #[test]
    fn test_eof_is_clean_close() {
        let err: SessionError = StreamError::Eof { received: 3, expected: 6 }.into();
        assert!(err.is_clean_close());
        assert_eq!(err.kind(), "stream_closed");
        assert!(err.to_string().contains("3 of 6"));
    }
}
