//! Wall-clock capture around a single HTTP exchange.

use std::time::{Duration, Instant};

/// Per-phase breakdown of one HTTP exchange. Phases whose boundary
/// timestamps were not observed are zero; zero phases are not emitted to
/// histograms by the metric recording layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpTimings {
    pub dns: Duration,
    pub tcp_connect: Duration,
    pub tls_handshake: Duration,
    /// First response byte relative to request-body write completion.
    pub ttfb: Duration,
    pub transfer: Duration,
    pub total: Duration,
}

/// Records absolute timestamps around one exchange and converts them into
/// an [`HttpTimings`] by subtracting paired marks.
#[derive(Debug, Clone)]
pub struct TimingTracer {
    start: Instant,
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    wrote_request: Option<Instant>,
    first_byte: Option<Instant>,
}

impl TimingTracer {
    pub fn start() -> Self {
        TimingTracer {
            start: Instant::now(),
            dns_start: None,
            dns_done: None,
            connect_start: None,
            connect_done: None,
            tls_start: None,
            tls_done: None,
            wrote_request: None,
            first_byte: None,
        }
    }

    pub fn dns_start(&mut self) {
        self.dns_start = Some(Instant::now());
    }

    pub fn dns_done(&mut self) {
        self.dns_done = Some(Instant::now());
    }

    pub fn connect_start(&mut self) {
        self.connect_start = Some(Instant::now());
    }

    pub fn connect_done(&mut self) {
        self.connect_done = Some(Instant::now());
    }

    pub fn tls_start(&mut self) {
        self.tls_start = Some(Instant::now());
    }

    pub fn tls_done(&mut self) {
        self.tls_done = Some(Instant::now());
    }

    pub fn wrote_request(&mut self) {
        self.wrote_request = Some(Instant::now());
    }

    /// Records the first response byte; later calls keep the first mark.
    pub fn first_byte(&mut self) {
        self.first_byte.get_or_insert_with(Instant::now);
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Converts the recorded marks into phase durations. `transfer_done` is
    /// supplied by the caller once the response body has been drained.
    pub fn finish(&self, transfer_done: Instant) -> HttpTimings {
        let mut timings = HttpTimings {
            total: transfer_done.saturating_duration_since(self.start),
            ..Default::default()
        };

        if let (Some(start), Some(done)) = (self.dns_start, self.dns_done) {
            timings.dns = done.saturating_duration_since(start);
        }
        if let (Some(start), Some(done)) = (self.connect_start, self.connect_done) {
            timings.tcp_connect = done.saturating_duration_since(start);
        }
        if let (Some(start), Some(done)) = (self.tls_start, self.tls_done) {
            timings.tls_handshake = done.saturating_duration_since(start);
        }
        if let (Some(wrote), Some(first)) = (self.wrote_request, self.first_byte) {
            timings.ttfb = first.saturating_duration_since(wrote);
        }
        if let Some(first) = self.first_byte {
            timings.transfer = transfer_done.saturating_duration_since(first);
        }

        timings
    }
}
