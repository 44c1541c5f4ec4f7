// src/metrics.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::info;

/// Process-wide counters shared by the reactor and all workers.
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub req_count: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            req_count: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn conns(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Log a stats summary every 5 seconds until shutdown.
pub fn spawn_reporter(metrics: Arc<ServerMetrics>, shutdown: Arc<AtomicBool>) {
    thread::Builder::new()
        .name("etude-metrics".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_secs(5));
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                info!(
                    active = metrics.conns(),
                    requests = metrics.req_count.load(Ordering::Relaxed),
                    bytes_sent = metrics.bytes_sent.load(Ordering::Relaxed),
                    "server stats"
                );
            }
        })
        .ok();
}
