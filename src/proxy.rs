use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::entry::Entry;
use crate::manager::EntryFactory;
use crate::pool::SharedPool;

/// The user-facing handle issued by an entry for a single borrow.
///
/// Dropping it returns the underlying connection to the pool (or, if the
/// entry was forcibly reaped while this proxy was outstanding, routes the
/// connection to [`EntryFactory::destroy_connection`] instead).
pub struct PooledConnection<M: EntryFactory> {
    entry: Arc<Entry<M>>,
    pool: Arc<SharedPool<M>>,
    connection: Option<M::Connection>,
}

impl<M: EntryFactory> PooledConnection<M> {
    pub(crate) fn new(entry: Arc<Entry<M>>, pool: Arc<SharedPool<M>>, connection: M::Connection) -> Self {
        PooledConnection {
            entry,
            pool,
            connection: Some(connection),
        }
    }
}

impl<M: EntryFactory> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("entry", &self.entry.id)
            .finish()
    }
}

impl<M: EntryFactory> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.connection.as_ref().expect("connection taken before drop")
    }
}

impl<M: EntryFactory> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.connection.as_mut().expect("connection taken before drop")
    }
}

impl<M: EntryFactory> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        self.pool.clone().on_proxy_dropped(self.entry.clone(), conn);
    }
}
