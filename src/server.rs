// src/server.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::conn::Conn;
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::{self, ServerMetrics};
use crate::pool::ThreadPool;
use crate::reactor::{MAX_FD, Reactor};
use crate::syscalls::{self, Epoll};

/// Shared server context handed to every connection and worker: the epoll
/// handle, the metrics counters, and the document root. Replaces the
/// process-wide globals of the classic design.
pub struct ServerCtx {
    pub epoll: Epoll,
    pub metrics: Arc<ServerMetrics>,
    pub document_root: PathBuf,
}

pub struct Server {
    port: u16,
    document_root: PathBuf,
    workers: usize,
    max_connections: usize,
    queue_capacity: usize,
}

impl Server {
    pub fn bind(port: u16) -> Self {
        Self {
            port,
            document_root: PathBuf::from("./resource"),
            workers: num_cpus::get(),
            max_connections: MAX_FD,
            queue_capacity: 10_000,
        }
    }

    pub fn document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.document_root = root.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Serve until ctrl-c.
    pub fn serve(self) -> EtudeResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("received ctrl-c, initiating graceful shutdown");
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| EtudeError::Other(format!("failed to set ctrl-c handler: {}", e)))?;

        self.serve_with_shutdown(shutdown)
    }

    /// Serve until the given flag is raised. The reactor runs on the
    /// calling thread.
    pub fn serve_with_shutdown(self, shutdown: Arc<AtomicBool>) -> EtudeResult<()> {
        // A peer that resets mid-write must surface as EPIPE, not kill the
        // process.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let listen_fd = syscalls::create_listen_socket(self.port)?;
        let metrics = Arc::new(ServerMetrics::new());
        let ctx = Arc::new(ServerCtx {
            epoll: Epoll::new()?,
            metrics: Arc::clone(&metrics),
            document_root: self.document_root.clone(),
        });
        metrics::spawn_reporter(metrics, Arc::clone(&shutdown));

        let worker_ctx = Arc::clone(&ctx);
        let pool = ThreadPool::new(
            self.workers,
            self.queue_capacity,
            move |slot: Arc<Mutex<Conn>>| {
                let mut conn = slot.lock().unwrap();
                if !conn.process(&worker_ctx) {
                    conn.close(&worker_ctx);
                }
            },
        );

        info!(
            port = self.port,
            workers = self.workers,
            root = %self.document_root.display(),
            "etude listening"
        );

        let mut reactor = Reactor::new(ctx, listen_fd, pool, self.max_connections)?;
        reactor.run(&shutdown)
    }
}
