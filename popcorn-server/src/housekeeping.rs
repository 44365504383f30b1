//! Periodic maintenance loop
//!
//! One task per server, ticking every second: flush metrics through the
//! configured sink, trim both file caches back to their soft limits, and
//! let the client registry do its (internally rate-limited) idle purge.

use crate::service::ServerState;
use crate::stats::{StatsSink, write_rpc_gauges};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Run the maintenance loop until shutdown is signalled
pub async fn run(
    state: Arc<ServerState>,
    sink: Box<dyn StatsSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush_stats(sink.as_ref(), &state);
                state.src_cache.purge_to_soft_limit();
                state.obj_cache.purge_to_soft_limit();
                state.clients.purge_outdated();
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Housekeeping loop stopped");
}

/// Push one snapshot of every rolling counter
pub fn flush_stats(sink: &dyn StatsSink, state: &ServerState) {
    sink.write_gauge("server.uptime", state.start_time.elapsed().as_secs_f64());

    sink.write_gauge("sessions.active", state.sessions.len() as f64);

    sink.write_gauge("caches.clients.count", state.clients.len() as f64);
    sink.write_gauge(
        "caches.clients.sampled_identity_entries",
        state.clients.sampled_identity_entries() as f64,
    );
    sink.write_gauge(
        "caches.system_headers.count",
        state.system_headers.len() as f64,
    );
    sink.write_gauge("caches.src_cache.count", state.src_cache.entry_count() as f64);
    sink.write_gauge(
        "caches.src_cache.bytes",
        state.src_cache.bytes_on_disk() as f64,
    );
    sink.write_gauge(
        "caches.src_cache.purged",
        state.src_cache.purged_entries() as f64,
    );
    sink.write_gauge("caches.obj_cache.count", state.obj_cache.entry_count() as f64);
    sink.write_gauge(
        "caches.obj_cache.bytes",
        state.obj_cache.bytes_on_disk() as f64,
    );
    sink.write_gauge(
        "caches.obj_cache.purged",
        state.obj_cache.purged_entries() as f64,
    );
    sink.write_gauge("caches.obj_cache.hits", state.stats.object_cache_hits.get() as f64);

    sink.write_gauge("transfers.in_flight", state.transfers.len() as f64);
    sink.write_gauge(
        "transfers.completed_uploads",
        state.stats.transferred_files.get() as f64,
    );

    write_rpc_gauges(sink, "start_session", &state.stats.start_session);
    write_rpc_gauges(sink, "transfer_file", &state.stats.transfer_file);
    write_rpc_gauges(sink, "compile_source", &state.stats.compile_source);
    write_rpc_gauges(sink, "close_session", &state.stats.close_session);
    write_rpc_gauges(sink, "status", &state.stats.status);

    sink.flush();
}
