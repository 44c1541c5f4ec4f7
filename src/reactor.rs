// src/reactor.rs
//
// The single-threaded, edge-triggered readiness loop. It accepts, drains
// readable sockets into their connection buffers, hands parsed work to the
// pool, and performs vectored writes itself — writes are bounded and must
// not starve readiness polling behind the queue.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::conn::Conn;
use crate::pool::ThreadPool;
use crate::server::ServerCtx;
use crate::syscalls;
use crate::table::ConnTable;

/// Events processed per wait batch.
const MAX_EVENTS: usize = 1024;
/// Highest descriptor number the connection table tracks.
pub const MAX_FD: usize = 65536;
/// Listener token, distinct from any fd-valued token.
const LISTEN_TOKEN: u64 = u64::MAX;

pub struct Reactor {
    ctx: Arc<ServerCtx>,
    listen_fd: i32,
    table: ConnTable,
    pool: ThreadPool<Arc<Mutex<Conn>>>,
    max_connections: usize,
}

impl Reactor {
    pub fn new(
        ctx: Arc<ServerCtx>,
        listen_fd: i32,
        pool: ThreadPool<Arc<Mutex<Conn>>>,
        max_connections: usize,
    ) -> crate::error::EtudeResult<Self> {
        // The listener is edge-triggered but not oneshot; accept drains it.
        ctx.epoll.add(listen_fd, LISTEN_TOKEN, libc::EPOLLIN)?;
        Ok(Self {
            ctx,
            listen_fd,
            table: ConnTable::new(MAX_FD),
            pool,
            max_connections,
        })
    }

    /// Block on readiness until shutdown. A hard wait error terminates the
    /// loop and propagates; EINTR does not.
    pub fn run(&mut self, shutdown: &AtomicBool) -> crate::error::EtudeResult<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !shutdown.load(Ordering::Acquire) {
            // Bounded wait so the shutdown flag is observed.
            let n = self.ctx.epoll.wait(&mut events, 1000)?;
            for ev in &events[..n] {
                let token = ev.u64;
                if token == LISTEN_TOKEN {
                    self.accept_ready();
                    continue;
                }
                self.client_event(token as i32, ev.events);
            }
        }

        self.teardown();
        Ok(())
    }

    /// Accept until the kernel's pending queue is drained (edge-triggered).
    fn accept_ready(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if self.ctx.metrics.conns() >= self.max_connections {
                        info!(%peer, "connection table at capacity, dropping");
                        unsafe {
                            libc::close(fd);
                        }
                        continue;
                    }
                    let Some(slot) = self.table.insert(fd, peer) else {
                        warn!(fd, "descriptor outside connection table, dropping");
                        unsafe {
                            libc::close(fd);
                        }
                        continue;
                    };
                    if self.ctx.epoll.register_client(fd).is_err() {
                        slot.lock().unwrap().fd = -1;
                        unsafe {
                            libc::close(fd);
                        }
                        continue;
                    }
                    self.ctx.metrics.inc_conn();
                    debug!(fd, %peer, "accepted connection");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn client_event(&mut self, fd: i32, bits: u32) {
        let Some(slot) = self.table.get(fd) else {
            return;
        };

        if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLERR) as u32 != 0 {
            slot.lock().unwrap().close(&self.ctx);
        } else if bits & libc::EPOLLIN as u32 != 0 {
            let drained = slot.lock().unwrap().read();
            if drained {
                if let Err(rejected) = self.pool.enqueue(Arc::clone(&slot)) {
                    // Full queue: a definite close, never a silent drop.
                    warn!(fd, queued = self.pool.queued(), "worker queue full, closing connection");
                    rejected.lock().unwrap().close(&self.ctx);
                }
            } else {
                slot.lock().unwrap().close(&self.ctx);
            }
        } else if bits & libc::EPOLLOUT as u32 != 0 {
            let mut conn = slot.lock().unwrap();
            if !conn.write(&self.ctx) {
                conn.close(&self.ctx);
            }
        }
    }

    /// Orderly teardown: join the workers first so no connection is owned
    /// by a worker, then close everything still live.
    fn teardown(&mut self) {
        self.pool.shutdown();
        for slot in self.table.slots() {
            slot.lock().unwrap().close(&self.ctx);
        }
        unsafe {
            libc::close(self.listen_fd);
        }
        info!("reactor stopped");
    }
}
