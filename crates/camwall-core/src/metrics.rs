//! Ingest metrics and Prometheus export

use std::time::{Duration, Instant};

use prometheus::core::Collector;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

use crate::errors::SessionError;

/// Counters for the ingest path
pub struct IngestMetrics {
    active_sessions: Gauge,
    connections_accepted: Counter,
    connections_rejected: Counter,
    evictions: Counter,
    invalid_headers: Counter,
    frames_decoded: Counter,
    bytes_received: Counter,
    idle_timeouts: Counter,
    session_duration: Histogram,
    registry: Registry,
    start_time: Instant,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl IngestMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let active_sessions = register(
            &registry,
            Gauge::with_opts(Opts::new(
                "camwall_active_sessions",
                "Number of producer sessions currently holding a slot",
            ))?,
        )?;
        let connections_accepted = register(
            &registry,
            Counter::with_opts(Opts::new(
                "camwall_connections_accepted_total",
                "Connections that were assigned a slot",
            ))?,
        )?;
        let connections_rejected = register(
            &registry,
            Counter::with_opts(Opts::new(
                "camwall_connections_rejected_total",
                "Connections closed because every slot was occupied",
            ))?,
        )?;
        let evictions = register(
            &registry,
            Counter::with_opts(Opts::new(
                "camwall_evictions_total",
                "Sessions ended by a reconnect from the same address or by an operator",
            ))?,
        )?;
        let invalid_headers = register(
            &registry,
            Counter::with_opts(Opts::new(
                "camwall_invalid_headers_total",
                "Sessions ended by an unparseable header or out-of-range geometry",
            ))?,
        )?;
        let frames_decoded = register(
            &registry,
            Counter::with_opts(Opts::new(
                "camwall_frames_decoded_total",
                "Frames reassembled, converted and published",
            ))?,
        )?;
        let bytes_received = register(
            &registry,
            Counter::with_opts(Opts::new(
                "camwall_bytes_received_total",
                "Frame payload bytes received",
            ))?,
        )?;
        let idle_timeouts = register(
            &registry,
            Counter::with_opts(Opts::new(
                "camwall_idle_timeouts_total",
                "Sessions ended because the producer went silent",
            ))?,
        )?;
        let session_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("camwall_session_duration_seconds", "Session duration in seconds")
                    .buckets(vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0, 86400.0]),
            )?,
        )?;

        Ok(Self {
            active_sessions,
            connections_accepted,
            connections_rejected,
            evictions,
            invalid_headers,
            frames_decoded,
            bytes_received,
            idle_timeouts,
            session_duration,
            registry,
            start_time: Instant::now(),
        })
    }

    pub fn record_accepted(&self) {
        self.connections_accepted.inc();
        self.active_sessions.inc();
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.inc();
    }

    pub fn record_eviction(&self) {
        self.evictions.inc();
    }

    pub fn record_frame(&self, bytes: usize) {
        self.frames_decoded.inc();
        self.bytes_received.inc_by(bytes as f64);
    }

    /// Account for a finished session.
    ///
    /// Evictions are counted where they are triggered, not here.
    pub fn record_session_end(&self, reason: &SessionError, duration: Duration) {
        self.active_sessions.dec();
        self.session_duration.observe(duration.as_secs_f64());
        match reason {
            SessionError::InvalidHeader(_) | SessionError::InvalidGeometry(_) => {
                self.invalid_headers.inc()
            }
            SessionError::IdleTimeout(_) => self.idle_timeouts.inc(),
            _ => {}
        }
    }

    /// Export Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.get() as u64
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.get() as u64
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.get() as u64
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.get() as u64
    }

    pub fn invalid_headers(&self) -> u64 {
        self.invalid_headers.get() as u64
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.get() as u64
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.get() as u64
    }

    pub fn idle_timeouts(&self) -> u64 {
        self.idle_timeouts.get() as u64
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Mean ingest rate since startup, in bytes per second.
    pub fn average_ingest_rate(&self) -> u64 {
        let uptime = self.uptime().as_secs_f64();
        if uptime > 0.0 {
            (self.bytes_received.get() / uptime) as u64
        } else {
            0
        }
    }
}
