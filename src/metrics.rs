//! Prometheus-compatible metrics endpoint
//!
//! Exposes host metrics in Prometheus text format.
//! Enabled by setting METRICS_PORT; endpoint: http://host:port/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics_http")]
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
#[cfg(feature = "metrics_http")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "metrics_http")]
use tokio::net::TcpListener;
#[cfg(feature = "metrics_http")]
use tracing::{debug, info};

const TICK_HISTORY: usize = 1000;

/// Metrics registry for one host
#[derive(Debug)]
pub struct Metrics {
    // Network
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_malformed: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    // Dispatch
    pub dispatch_misses: AtomicU64,
    pub handler_failures: AtomicU64,

    // World
    pub maps_active: AtomicU64,
    pub entities_active: AtomicU64,
    pub subscriptions_active: AtomicU64,
    pub moves_rejected: AtomicU64,
    pub rubber_bands: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_malformed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            dispatch_misses: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            maps_active: AtomicU64::new(0),
            entities_active: AtomicU64::new(0),
            subscriptions_active: AtomicU64::new(0),
            moves_rejected: AtomicU64::new(0),
            rubber_bands: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Decrement a gauge without wrapping below zero
    #[inline]
    pub fn decr(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("cellgrid_connections_active", "Open connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("cellgrid_connections_total", "Connections accepted since start", "counter",
            self.connections_total.load(Ordering::Relaxed));
        metric!("cellgrid_messages_sent_total", "Calls queued for sending", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("cellgrid_messages_received_total", "Calls parsed from the wire", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("cellgrid_messages_malformed_total", "Frames dropped as malformed", "counter",
            self.messages_malformed.load(Ordering::Relaxed));
        metric!("cellgrid_bytes_sent_total", "Bytes written to sockets", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("cellgrid_bytes_received_total", "Bytes read from sockets", "counter",
            self.bytes_received.load(Ordering::Relaxed));

        metric!("cellgrid_dispatch_misses_total", "Calls with no registered handler", "counter",
            self.dispatch_misses.load(Ordering::Relaxed));
        metric!("cellgrid_handler_failures_total", "Handlers that returned an error or panicked", "counter",
            self.handler_failures.load(Ordering::Relaxed));

        metric!("cellgrid_maps_active", "Map instances ticked last pass", "gauge",
            self.maps_active.load(Ordering::Relaxed));
        metric!("cellgrid_entities", "Live entities", "gauge",
            self.entities_active.load(Ordering::Relaxed));
        metric!("cellgrid_subscriptions", "Live connection-entity subscriptions", "gauge",
            self.subscriptions_active.load(Ordering::Relaxed));
        metric!("cellgrid_moves_rejected_total", "Move requests that failed validation", "counter",
            self.moves_rejected.load(Ordering::Relaxed));
        metric!("cellgrid_rubber_bands_total", "Corrections sent to clients", "counter",
            self.rubber_bands.load(Ordering::Relaxed));

        metric!("cellgrid_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("cellgrid_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("cellgrid_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("cellgrid_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("cellgrid_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("cellgrid_uptime_seconds", "Host uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
#[cfg(feature = "metrics_http")]
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(feature = "metrics_http")]
fn respond(metrics: &Metrics, request: &str) -> String {
    if request.starts_with("GET /metrics") {
        let body = metrics.to_prometheus();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK"
            .to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();

        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert!(metrics.tick_time_p99_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_decr_saturates() {
        let metrics = Metrics::new();
        Metrics::decr(&metrics.subscriptions_active);
        assert_eq!(metrics.subscriptions_active.load(Ordering::Relaxed), 0);

        Metrics::add(&metrics.subscriptions_active, 3);
        Metrics::decr(&metrics.subscriptions_active);
        assert_eq!(metrics.subscriptions_active.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.connections_active.store(5, Ordering::Relaxed);
        Metrics::incr(&metrics.dispatch_misses);

        let output = metrics.to_prometheus();

        assert!(output.contains("cellgrid_connections_active 5"));
        assert!(output.contains("cellgrid_dispatch_misses_total 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[cfg(feature = "metrics_http")]
    #[test]
    fn test_respond_routes() {
        let metrics = Metrics::new();
        assert!(respond(&metrics, "GET /metrics HTTP/1.1").contains("cellgrid_tick_count"));
        assert!(respond(&metrics, "GET /health HTTP/1.1").ends_with("OK"));
        assert!(respond(&metrics, "GET /nope HTTP/1.1").starts_with("HTTP/1.1 404"));
    }
}
