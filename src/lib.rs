// src/lib.rs
pub mod conn;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod sync;
pub mod syscalls;
pub mod table;

// Re-exports for users
pub use error::{EtudeError, EtudeResult};
pub use server::{Server, ServerCtx};
