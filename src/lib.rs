//! A generic, backend-agnostic resource pool for asynchronous, tokio-based
//! back-end sessions (database connections, transactional resources, or
//! any other expensive, reusable handle).
//!
//! Opening a new back-end session every time one is needed is both
//! inefficient and can exhaust the back-end under load. A pool built with
//! this crate maintains a bounded set of open sessions, handing them out
//! for repeated use and reclaiming leaked, idle, or aged entries in the
//! background.
//!
//! This crate is agnostic to the session type it manages. Implementors of
//! the [`EntryFactory`] trait supply the back-end-specific logic to open a
//! session, check its liveness, and (optionally) decide whether an
//! in-use session can be reused by the calling unit of work.
//!
//! ```ignore
//! let config = respool::Config::builder()
//!     .max_pool_size(10)
//!     .build();
//! let pool = respool::Pool::new(config, MyFactory::new()).await?;
//! let conn = pool.borrow().await?;
//! // `conn` derefs to `MyFactory::Connection`; dropping it returns the
//! // entry to the pool.
//! ```
#![deny(missing_docs, missing_debug_implementations)]

mod config;
mod entry;
mod error;
mod leak;
mod maintenance;
mod manager;
mod pool;
mod proxy;

pub use config::{Config, ConfigBuilder};
pub use error::PoolError;
pub use manager::EntryFactory;
pub use pool::{Pool, State};
pub use proxy::PooledConnection;
