//! `--check-servers`: query every configured server's Status RPC

use crate::error::Result;
use crate::settings::ClientSettings;
use popcorn_protocol::{Method, StatusReply, StatusRequest, connect, read_frame, write_frame};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

fn pretty_bytes(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const KIB: f64 = 1024.0;
    let value = bytes as f64;
    if value >= GIB {
        format!("{:.2}gb", value / GIB)
    } else if value >= MIB {
        format!("{:.2}mb", value / MIB)
    } else if value >= KIB {
        format!("{:.2}kb", value / KIB)
    } else {
        format!("{bytes}b")
    }
}

async fn query_status(address: &str) -> Result<(StatusReply, Duration)> {
    let start = Instant::now();
    let mut stream = connect(address, Method::Status).await?;
    write_frame(&mut stream, &StatusRequest::default()).await?;
    let reply: StatusReply = read_frame(&mut stream).await?;
    Ok((reply, start.elapsed()))
}

fn print_report(address: &str, outcome: &Result<(StatusReply, Duration)>) {
    match outcome {
        Ok((status, elapsed)) => {
            println!("Server {address}: ok");
            println!("  Version: {}", status.version.as_str());
            println!("  Uptime: {}s", status.uptime_secs);
            println!("  Processing time: {elapsed:?}");
            println!("  Active sessions: {}", status.active_sessions);
            println!("  Known clients: {}", status.known_clients);
            println!("  System headers: {}", status.system_headers);
            println!(
                "  Source cache: {} files, {}",
                status.src_cache_files,
                pretty_bytes(status.src_cache_bytes)
            );
            println!(
                "  Object cache: {} files, {}",
                status.obj_cache_files,
                pretty_bytes(status.obj_cache_bytes)
            );
        }
        Err(e) => {
            println!("Server {address}: unavailable");
            println!("  Error: {e}");
        }
    }
}

/// Query all configured servers concurrently and print one report each
pub async fn check_servers(settings: &ClientSettings) {
    if settings.servers.is_empty() {
        println!("No servers configured; set POPCORN_SERVERS");
        return;
    }
    let mut queries = JoinSet::new();
    for address in settings.servers.clone() {
        queries.spawn(async move {
            let outcome = query_status(&address).await;
            (address, outcome)
        });
    }
    while let Some(joined) = queries.join_next().await {
        if let Ok((address, outcome)) = joined {
            print_report(&address, &outcome);
        }
    }
}
