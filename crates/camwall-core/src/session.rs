//! Per-connection producer session.
//!
//! A session owns one connection and one slot lease. It reads the header
//! once, then decodes frames until the connection ends, the producer goes
//! idle, or the slot table evicts it:
//!
//! ```text
//! AwaitHeader --header ok--> Streaming --eof/error/idle/evicted--> Closed
//!      |                                                             ^
//!      +--------------invalid header/geometry, eof, evicted----------+
//! ```
//!
//! Whatever the reason, the slot is released on the way out (a no-op if
//! the slot already belongs to a newer session).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::assembler::FrameAssembler;
use crate::convert::{convert_into, ChannelOrder};
use crate::errors::{HeaderError, SessionError, StreamError};
use crate::image::{parse_header, GeometryLimits, ImageDescriptor, HEADER_MAX_BYTES};
use crate::metrics::IngestMetrics;
use crate::slots::{EvictionSignal, SlotLease, SlotTable};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitHeader,
    Streaming,
    Closed,
}

/// Per-session settings shared by every connection
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    pub limits: GeometryLimits,
    /// `None` waits indefinitely for producer bytes
    pub idle_timeout: Option<Duration>,
    pub channel_order: ChannelOrder,
}

/// How a session ended
#[derive(Debug)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub lease: SlotLease,
    pub descriptor: Option<ImageDescriptor>,
    pub frames: u64,
    pub bytes: u64,
    pub duration: Duration,
    pub reason: SessionError,
}

/// Drives one producer connection.
pub struct SessionHandler<S> {
    stream: S,
    peer: SocketAddr,
    lease: SlotLease,
    eviction: Option<EvictionSignal>,
    table: Arc<SlotTable>,
    metrics: Arc<IngestMetrics>,
    config: SessionConfig,
    assembler: FrameAssembler,
    state: SessionState,
    descriptor: Option<ImageDescriptor>,
    frames: u64,
    bytes: u64,
}

impl<S> SessionHandler<S>
where
    S: AsyncRead + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        lease: SlotLease,
        eviction: EvictionSignal,
        table: Arc<SlotTable>,
        metrics: Arc<IngestMetrics>,
        config: SessionConfig,
    ) -> Self {
        Self {
            stream,
            peer,
            lease,
            eviction: Some(eviction),
            table,
            metrics,
            assembler: FrameAssembler::new(config.idle_timeout),
            config,
            state: SessionState::AwaitHeader,
            descriptor: None,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion, releasing the slot and closing the stream.
    pub async fn run(mut self) -> SessionReport {
        let started = Instant::now();
        let slot = self.lease.slot_id();
        let mut eviction = self.eviction.take();

        let reason = tokio::select! {
            reason = self.drive() => reason,
            _ = wait_for_eviction(&mut eviction) => SessionError::Evicted,
        };

        self.state = SessionState::Closed;
        self.table.release(&self.lease);
        let duration = started.elapsed();
        self.metrics.record_session_end(&reason, duration);

        if reason.is_clean_close() {
            info!(
                slot,
                peer = %self.peer,
                reason = reason.kind(),
                frames = self.frames,
                bytes = self.bytes,
                "session closed: {reason}"
            );
        } else {
            warn!(
                slot,
                peer = %self.peer,
                reason = reason.kind(),
                frames = self.frames,
                bytes = self.bytes,
                "session failed: {reason}"
            );
        }

        SessionReport {
            peer: self.peer,
            lease: self.lease,
            descriptor: self.descriptor,
            frames: self.frames,
            bytes: self.bytes,
            duration,
            reason,
        }
    }

    /// Header then frames; only returns once the session must end.
    async fn drive(&mut self) -> SessionError {
        let descriptor = match self.read_header().await {
            Ok(descriptor) => descriptor,
            Err(e) => return e,
        };

        if self.table.set_descriptor(&self.lease, descriptor).is_err() {
            return SessionError::Evicted;
        }
        self.descriptor = Some(descriptor);
        self.state = SessionState::Streaming;

        info!(
            slot = self.lease.slot_id(),
            peer = %self.peer,
            width = descriptor.width,
            height = descriptor.height,
            y_size = descriptor.y_size,
            uv_size = descriptor.uv_size,
            frame_bytes = descriptor.frame_byte_size(),
            y_row_stride = descriptor.y_row_stride,
            y_pixel_stride = descriptor.y_pixel_stride,
            uv_row_stride = descriptor.uv_row_stride,
            uv_pixel_stride = descriptor.uv_pixel_stride,
            "header accepted"
        );

        match self.stream_frames(descriptor).await {
            Ok(()) => SessionError::Evicted,
            Err(e) => e,
        }
    }

    async fn read_header(&mut self) -> Result<ImageDescriptor, SessionError> {
        let mut raw = [0u8; HEADER_MAX_BYTES];
        let n = match self.assembler.read_some(&mut self.stream, &mut raw).await {
            Ok(0) => return Err(SessionError::InvalidHeader(HeaderError::Empty)),
            Ok(n) => n,
            Err(StreamError::Io(e)) => return Err(SessionError::InvalidHeader(HeaderError::Read(e))),
            Err(e) => return Err(e.into()),
        };

        parse_header(&raw[..n], &self.config.limits).map_err(|e| {
            debug!(peer = %self.peer, raw = %String::from_utf8_lossy(&raw[..n]), "rejected header");
            SessionError::from(e)
        })
    }

    /// Frame loop. Returns `Ok` only if the lease was lost between frames.
    async fn stream_frames(&mut self, descriptor: ImageDescriptor) -> Result<(), SessionError> {
        let mut frame = vec![0u8; descriptor.frame_byte_size()];
        let mut spare: Option<Vec<u8>> = None;

        loop {
            self.assembler.read_frame(&mut self.stream, &mut frame).await?;
            self.bytes += frame.len() as u64;

            let mut rgb = reusable_buffer(spare.take(), descriptor.rgb_len());
            convert_into(&frame, &descriptor, self.config.channel_order, &mut rgb)?;

            let previous = match self.table.publish(
                &self.lease,
                Arc::new(rgb),
                descriptor.width,
                descriptor.height,
            ) {
                Ok(previous) => previous,
                Err(_) => return Ok(()),
            };
            spare = previous.and_then(|buffer| Arc::try_unwrap(buffer).ok());

            self.frames += 1;
            self.metrics.record_frame(frame.len());
        }
    }
}

async fn wait_for_eviction(signal: &mut Option<EvictionSignal>) {
    match signal {
        Some(signal) => signal.evicted().await,
        None => std::future::pending().await,
    }
}

/// Reuse `previous` if it has the right size, otherwise allocate.
fn reusable_buffer(previous: Option<Vec<u8>>, len: usize) -> Vec<u8> {
    match previous {
        Some(buffer) if buffer.len() == len => buffer,
        _ => vec![0u8; len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn peer(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), 50000)
    }

    struct Harness {
        table: Arc<SlotTable>,
        metrics: Arc<IngestMetrics>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                table: Arc::new(SlotTable::new(2)),
                metrics: Arc::new(IngestMetrics::new().unwrap()),
            }
        }

        fn session(
            &self,
            host: u8,
            config: SessionConfig,
        ) -> (SessionHandler<DuplexStream>, DuplexStream, SlotLease) {
            let (server, client) = duplex(1024);
            let admission = self.table.acquire(peer(host).ip()).unwrap();
            self.metrics.record_accepted();
            let lease = admission.lease;
            let handler = SessionHandler::new(
                server,
                peer(host),
                lease,
                admission.eviction,
                self.table.clone(),
                self.metrics.clone(),
                config,
            );
            (handler, client, lease)
        }

        async fn wait_for_descriptor(&self, slot: usize) {
            let mut changes = self.table.subscribe();
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let has_descriptor = self.table.snapshot()[slot]
                        .occupant
                        .as_ref()
                        .is_some_and(|o| o.descriptor.is_some());
                    if has_descriptor {
                        return;
                    }
                    changes.changed().await.unwrap();
                }
            })
            .await
            .unwrap();
        }
    }

    #[test]
    fn test_reusable_buffer() {
        let kept = reusable_buffer(Some(vec![7; 6]), 6);
        assert_eq!(kept, vec![7; 6]);
        let fresh = reusable_buffer(Some(vec![7; 6]), 12);
        assert_eq!(fresh, vec![0; 12]);
        assert_eq!(reusable_buffer(None, 3), vec![0; 3]);
    }

    #[tokio::test]
    async fn test_gray_frame_is_published_then_eof_releases_slot() {
        let h = Harness::new();
        let (handler, mut client, lease) = h.session(1, SessionConfig::default());
        assert_eq!(handler.state(), SessionState::AwaitHeader);
        let task = tokio::spawn(handler.run());

        client.write_all(b"2 1 2 2 2 1 2 2").await.unwrap();
        h.wait_for_descriptor(lease.slot_id()).await;
        client.write_all(&[128; 6]).await.unwrap();
        client.write_all(&[128; 6]).await.unwrap();
        drop(client);

        let report = task.await.unwrap();
        assert!(matches!(report.reason, SessionError::StreamClosed(StreamError::Eof { received: 0, expected: 6 })));
        assert_eq!(report.frames, 2);
        assert_eq!(report.bytes, 12);
        assert_eq!(report.descriptor.map(|d| (d.width, d.height)), Some((2, 1)));
        assert_eq!(h.table.occupied(), 0);
        assert_eq!(h.metrics.frames_decoded(), 2);
        assert_eq!(h.metrics.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_published_frame_is_visible_in_snapshot() {
        let h = Harness::new();
        let (handler, mut client, lease) = h.session(1, SessionConfig::default());
        let mut changes = h.table.subscribe();
        let task = tokio::spawn(handler.run());

        client.write_all(b"2 1 2 2 2 1 2 2").await.unwrap();
        h.wait_for_descriptor(lease.slot_id()).await;
        client.write_all(&[128; 6]).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = h.table.snapshot()[0].occupant.as_ref().and_then(|o| o.frame.clone()) {
                    return frame;
                }
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(*frame.rgb, vec![128; 6]);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_header_frees_slot() {
        let h = Harness::new();
        let (handler, mut client, _) = h.session(1, SessionConfig::default());
        let task = tokio::spawn(handler.run());

        client.write_all(b"4 4 abc 8 4 1 4 2").await.unwrap();
        let report = task.await.unwrap();
        assert!(matches!(
            report.reason,
            SessionError::InvalidHeader(HeaderError::NotANumber { field: "y_size", .. })
        ));
        assert_eq!(report.frames, 0);
        assert_eq!(h.table.occupied(), 0);
        assert_eq!(h.metrics.invalid_headers(), 1);
    }

    #[tokio::test]
    async fn test_oversized_geometry_is_rejected_before_allocation() {
        let h = Harness::new();
        let config = SessionConfig {
            limits: GeometryLimits {
                max_dimension: 8192,
                max_frame_bytes: 1024,
            },
            ..SessionConfig::default()
        };
        let (handler, mut client, _) = h.session(1, config);
        let task = tokio::spawn(handler.run());

        client.write_all(b"64 64 4096 2048 64 1 64 2").await.unwrap();
        let report = task.await.unwrap();
        assert!(matches!(report.reason, SessionError::InvalidGeometry(_)));
        assert_eq!(h.table.occupied(), 0);
    }

    #[tokio::test]
    async fn test_close_before_header() {
        let h = Harness::new();
        let (handler, client, _) = h.session(1, SessionConfig::default());
        drop(client);
        let report = handler.run().await;
        assert!(matches!(report.reason, SessionError::InvalidHeader(HeaderError::Empty)));
        assert_eq!(h.table.occupied(), 0);
    }

    #[tokio::test]
    async fn test_truncated_frame_publishes_nothing() {
        let h = Harness::new();
        let (handler, mut client, lease) = h.session(1, SessionConfig::default());
        let task = tokio::spawn(handler.run());

        client.write_all(b"2 1 2 2 2 1 2 2").await.unwrap();
        h.wait_for_descriptor(lease.slot_id()).await;
        client.write_all(&[128; 4]).await.unwrap();
        drop(client);

        let report = task.await.unwrap();
        assert!(matches!(report.reason, SessionError::StreamClosed(StreamError::Eof { received: 4, expected: 6 })));
        assert_eq!(report.frames, 0);
        assert_eq!(h.metrics.frames_decoded(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_producer_times_out() {
        let h = Harness::new();
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_secs(30)),
            ..SessionConfig::default()
        };
        let (handler, mut client, lease) = h.session(1, config);
        let task = tokio::spawn(handler.run());

        client.write_all(b"2 1 2 2 2 1 2 2").await.unwrap();
        h.wait_for_descriptor(lease.slot_id()).await;

        let report = task.await.unwrap();
        assert!(matches!(report.reason, SessionError::IdleTimeout(d) if d == Duration::from_secs(30)));
        assert_eq!(h.table.occupied(), 0);
        assert_eq!(h.metrics.idle_timeouts(), 1);
        drop(client);
    }

    #[tokio::test]
    async fn test_reconnect_evicts_running_session() {
        let h = Harness::new();
        let (first, mut first_client, first_lease) = h.session(7, SessionConfig::default());
        let first_task = tokio::spawn(first.run());
        first_client.write_all(b"2 1 2 2 2 1 2 2").await.unwrap();
        h.wait_for_descriptor(first_lease.slot_id()).await;

        let (second, mut second_client, second_lease) = h.session(7, SessionConfig::default());
        assert_eq!(second_lease.slot_id(), first_lease.slot_id());

        let report = tokio::time::timeout(Duration::from_secs(5), first_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.reason, SessionError::Evicted));

        // The evicted session's release must not free the replacement's slot.
        assert_eq!(h.table.occupied(), 1);

        let second_task = tokio::spawn(second.run());
        second_client.write_all(b"2 1 2 2 2 1 2 2").await.unwrap();
        h.wait_for_descriptor(second_lease.slot_id()).await;
        drop(second_client);
        second_task.await.unwrap();
        assert_eq!(h.table.occupied(), 0);
    }

    #[tokio::test]
    async fn test_operator_eviction_ends_session() {
        let h = Harness::new();
        let (handler, _client, lease) = h.session(3, SessionConfig::default());
        let task = tokio::spawn(handler.run());

        h.table.evict(lease.slot_id()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.reason, SessionError::Evicted));
        assert!(report.reason.is_clean_close());
    }
}
