//! Frame reassembly from a byte stream.
//!
//! The wire carries no per-frame framing: a frame is simply the next
//! `frame_byte_size` bytes. TCP may hand those bytes over in any number of
//! short reads, so [`FrameAssembler`] loops until the frame is full, and
//! only ever hands back a complete frame or an error.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::errors::StreamError;

/// Reads exact-size frames, optionally bounding how long any single read may stall.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameAssembler {
    idle_timeout: Option<Duration>,
}

impl FrameAssembler {
    /// `None` waits forever for each read.
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self { idle_timeout }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// One transport read into `buf`. Returns the byte count, zero meaning EOF.
    pub async fn read_some<R>(&self, reader: &mut R, buf: &mut [u8]) -> Result<usize, StreamError>
    where
        R: AsyncRead + Unpin,
    {
        match self.idle_timeout {
            Some(limit) => match timeout(limit, reader.read(buf)).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(StreamError::Idle(limit)),
            },
            None => Ok(reader.read(buf).await?),
        }
    }

    /// Fill `frame` completely.
    ///
    /// On error the contents of `frame` are unspecified and must not be used.
    pub async fn read_frame<R>(&self, reader: &mut R, frame: &mut [u8]) -> Result<(), StreamError>
    where
        R: AsyncRead + Unpin,
    {
        let expected = frame.len();
        let mut received = 0;

        while received < expected {
            let n = self.read_some(reader, &mut frame[received..]).await?;
            if n == 0 {
                return Err(StreamError::Eof { received, expected });
            }
            received += n;
        }

        Ok(())
    }
}
