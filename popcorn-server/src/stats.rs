//! Rolling server metrics and the external stats sink
//!
//! Counters are plain atomics so every RPC handler can bump them without
//! coordination; the housekeeping loop snapshots them once per second and
//! pushes gauges through a [`StatsSink`]. The sink is the external
//! contract: everything beyond it (aggregation, dashboards) lives outside
//! this process.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// A single lock-free counter
#[derive(Debug, Default)]
pub struct AtomicStat {
    value: AtomicI64,
}

impl AtomicStat {
    /// Add one
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulate a duration in nanoseconds
    pub fn add_duration(&self, duration: Duration) {
        self.value
            .fetch_add(duration.as_nanos() as i64, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Current value interpreted as accumulated nanoseconds
    pub fn get_as_seconds(&self) -> f64 {
        self.get() as f64 / 1e9
    }
}

/// Call/error/latency counters of one RPC
#[derive(Debug, Default)]
pub struct RpcStats {
    /// Calls started
    pub calls: AtomicStat,
    /// Calls that ended in an error
    pub errors: AtomicStat,
    /// Total processing time
    pub processing_time: AtomicStat,
}

impl RpcStats {
    /// Count a call start and time it until the observer is finished
    pub fn start_call(&self) -> RpcObserver<'_> {
        self.calls.increment();
        RpcObserver {
            start: Instant::now(),
            stats: self,
        }
    }
}

/// Times one RPC call and records its outcome
pub struct RpcObserver<'a> {
    start: Instant,
    stats: &'a RpcStats,
}

impl RpcObserver<'_> {
    /// Record a successful call
    pub fn finish(self) {
        self.stats.processing_time.add_duration(self.start.elapsed());
    }

    /// Record a failed call
    pub fn finish_with_error(self) {
        self.stats.errors.increment();
        self.stats.processing_time.add_duration(self.start.elapsed());
    }
}

/// All rolling counters of one server process
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Files whose body was uploaded by a client
    pub transferred_files: AtomicStat,
    /// Compilations served straight from the object cache
    pub object_cache_hits: AtomicStat,
    /// StartSession RPC counters
    pub start_session: RpcStats,
    /// TransferFile RPC counters
    pub transfer_file: RpcStats,
    /// CompileSource RPC counters
    pub compile_source: RpcStats,
    /// CloseSession RPC counters
    pub close_session: RpcStats,
    /// Status RPC counters
    pub status: RpcStats,
}

/// Destination for gauge values flushed by the housekeeping loop
pub trait StatsSink: Send + Sync {
    /// Record one gauge value under a dotted metric name
    fn write_gauge(&self, name: &str, value: f64);

    /// Push everything recorded since the previous flush
    fn flush(&self);
}

/// Sink that drops every value; used when no stats address is configured
#[derive(Debug, Default)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn write_gauge(&self, _name: &str, _value: f64) {}

    fn flush(&self) {}
}

/// statsd gauge writer over UDP, one `popcorn.<name>:<value>|g` line per
/// datagram
#[derive(Debug)]
pub struct StatsdSink {
    socket: UdpSocket,
}

impl StatsdSink {
    /// Connect the UDP socket to the statsd address
    pub fn connect(address: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(address)?;
        Ok(Self { socket })
    }
}

impl StatsSink for StatsdSink {
    fn write_gauge(&self, name: &str, value: f64) {
        let line = format!("popcorn.{name}:{value}|g");
        if let Err(e) = self.socket.send(line.as_bytes()) {
            warn!("Failed to send stat {name}: {e}");
        }
    }

    fn flush(&self) {}
}

/// Write the call/error/latency triple of one RPC
pub fn write_rpc_gauges(sink: &dyn StatsSink, rpc_name: &str, stats: &RpcStats) {
    sink.write_gauge(&format!("rpc.{rpc_name}.calls"), stats.calls.get() as f64);
    sink.write_gauge(&format!("rpc.{rpc_name}.errors"), stats.errors.get() as f64);
    sink.write_gauge(
        &format!("rpc.{rpc_name}.processing_time"),
        stats.processing_time.get_as_seconds(),
    );
}
