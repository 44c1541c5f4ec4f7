// src/table.rs
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::conn::Conn;

/// Fixed-size connection table indexed by descriptor.
///
/// Each slot holds an `Arc<Mutex<Conn>>` that is allocated once and reused
/// for every connection the kernel hands out on that fd number. The table
/// is the sole owner of connection slots; the worker queue only carries
/// transient `Arc` clones. The slot mutex is never contended — the oneshot
/// re-arm discipline already guarantees a single toucher between events —
/// it just makes the hand-off explicit.
pub struct ConnTable {
    slots: Vec<Option<Arc<Mutex<Conn>>>>,
}

impl ConnTable {
    /// Allocate the slot array once, at startup. `max_fds` bounds the
    /// descriptor numbers we can track.
    pub fn new(max_fds: usize) -> Self {
        Self { slots: vec![None; max_fds] }
    }

    /// Bind a freshly accepted fd to its slot, reusing the slot's Conn if
    /// this fd number has been seen before. Returns None when the fd is
    /// outside the table.
    pub fn insert(&mut self, fd: i32, peer: SocketAddr) -> Option<Arc<Mutex<Conn>>> {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            return None;
        }
        match &self.slots[idx] {
            Some(slot) => {
                slot.lock().unwrap().reinit(fd, peer);
                Some(Arc::clone(slot))
            }
            None => {
                let conn = Arc::new(Mutex::new(Conn::new(fd, peer)));
                self.slots[idx] = Some(Arc::clone(&conn));
                Some(conn)
            }
        }
    }

    pub fn get(&self, fd: i32) -> Option<Arc<Mutex<Conn>>> {
        self.slots.get(fd as usize)?.as_ref().map(Arc::clone)
    }

    /// All slots ever allocated, live or not (`fd == -1` means closed).
    pub fn slots(&self) -> impl Iterator<Item = &Arc<Mutex<Conn>>> {
        self.slots.iter().flatten()
    }
}
