//! camwall core - ingest of raw YUV 4:2:0 camera streams.
//!
//! This crate implements:
//! - Header parsing and geometry validation
//! - Frame reassembly over any async byte stream
//! - YUV 4:2:0 to packed RGB conversion
//! - The fixed-capacity slot table with replace-on-reconnect
//! - The per-connection session state machine
//! - The TCP acceptor and the render loop that feeds a [`render::Renderer`]

#![forbid(unsafe_code)]

// Protocol
pub mod image;
pub mod assembler;
pub mod convert;

// Sessions
pub mod slots;
pub mod session;
pub mod acceptor;
pub mod render;

// Supporting modules
pub mod errors;
pub mod metrics;

pub use acceptor::ConnectionAcceptor;
pub use convert::ChannelOrder;
pub use errors::{ConvertError, GeometryError, HeaderError, SessionError, SlotError, StreamError};
pub use image::{parse_header, GeometryLimits, ImageDescriptor};
pub use metrics::IngestMetrics;
pub use render::{run_render_loop, PresentedFrame, Renderer};
pub use session::{SessionConfig, SessionHandler, SessionReport, SessionState};
pub use slots::{SlotId, SlotLease, SlotTable};
