use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backtrace::Backtrace;
use tokio::time::Instant;
use tracing::warn;

use crate::leak;
use crate::manager::EntryFactory;

/// A non-owning callback registered by a listener interested in this
/// entry's termination. The pool registers one of these per entry to
/// learn when a slot frees up; other listeners (metrics, recycle
/// bookkeeping) may register their own.
pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

/// A handle returned by [`Entry::register_listener`], usable with
/// [`Entry::unregister_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListenerHandle(u64);

struct EntryState {
    creation_time: Instant,
    last_time_acquired: Instant,
    last_time_released: Instant,
    destroyed: bool,
    leak_stack: Option<Backtrace>,
}

/// One wrapped back-end session managed by the pool, plus its lifecycle
/// bookkeeping.
///
/// Availability is a derived predicate, not a stored enum: an entry is
/// *available* when its connection slot holds a value, it is not
/// currently claimed, and it has not been destroyed; *claimed* while
/// `being_acquired` is true and the slot has been emptied but no proxy
/// has been produced yet; *in-use* once a proxy has been produced (slot
/// empty, not claimed); *destroyed* once `state.destroyed` is set.
pub(crate) struct Entry<M: EntryFactory> {
    pub(crate) id: u64,
    connection: Mutex<Option<M::Connection>>,
    being_acquired: AtomicBool,
    state: Mutex<EntryState>,
    max_lifetime: Option<Duration>,
    /// Serializes `create_connection_proxy` and `destroy` against each
    /// other; held across back-end I/O, hence async-capable.
    io_guard: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl<M: EntryFactory> Entry<M> {
    pub(crate) fn new(id: u64, connection: M::Connection, max_lifetime: Option<Duration>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Entry {
            id,
            connection: Mutex::new(Some(connection)),
            being_acquired: AtomicBool::new(false),
            state: Mutex::new(EntryState {
                creation_time: now,
                last_time_acquired: now,
                last_time_released: now,
                destroyed: false,
                leak_stack: None,
            }),
            max_lifetime,
            io_guard: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Registers a non-owning termination listener, returning a handle
    /// usable with [`Entry::unregister_listener`].
    pub(crate) fn register_listener(&self, listener: Listener) -> ListenerHandle {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((id, listener));
        ListenerHandle(id)
    }

    /// Removes a previously registered listener. A no-op if already
    /// removed.
    #[allow(dead_code)]
    pub(crate) fn unregister_listener(&self, handle: ListenerHandle) {
        self.listeners.lock().unwrap().retain(|(id, _)| *id != handle.0);
    }

    /// True iff no outstanding proxy, not claimed, and not destroyed.
    pub(crate) fn is_available(&self) -> bool {
        !self.being_acquired.load(Ordering::Acquire)
            && self.connection.lock().unwrap().is_some()
            && !self.state.lock().unwrap().destroyed
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }

    /// Marks the entry destroyed directly, without touching the
    /// connection slot (used when the connection is held by a caller
    /// outside the slot, e.g. a broken connection found at return time).
    /// Returns `false` if already destroyed.
    pub(crate) fn mark_destroyed_direct(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return false;
        }
        state.destroyed = true;
        true
    }

    /// Atomic test-and-set: returns the connection iff the entry was
    /// available at call time, and the entry is now claimed. Never
    /// blocks.
    ///
    /// After a `Some` return, the caller MUST either complete
    /// [`Entry::create_connection_proxy`] or put the connection back via
    /// [`Entry::abandon_claim`].
    pub(crate) fn mark_as_being_acquired_if_available(&self) -> Option<M::Connection> {
        if self
            .being_acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        let mut slot = self.connection.lock().unwrap();
        if self.state.lock().unwrap().destroyed {
            drop(slot);
            self.being_acquired.store(false, Ordering::Release);
            return None;
        }

        match slot.take() {
            Some(conn) => Some(conn),
            None => {
                drop(slot);
                self.being_acquired.store(false, Ordering::Release);
                None
            }
        }
    }

    /// Peeks at an available entry's connection without claiming it, for
    /// the recycle scan.
    pub(crate) fn peek_available<R>(&self, f: impl FnOnce(&M::Connection) -> R) -> Option<R> {
        if self.being_acquired.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.connection.lock().unwrap();
        if self.state.lock().unwrap().destroyed {
            return None;
        }
        slot.as_ref().map(f)
    }

    /// Releases a claim without producing a proxy, returning the
    /// connection to the available state (unless the entry was
    /// destroyed in the interim, in which case the connection is simply
    /// dropped by the caller).
    pub(crate) fn abandon_claim(&self, conn: M::Connection) {
        let mut slot = self.connection.lock().unwrap();
        *slot = Some(conn);
        self.being_acquired.store(false, Ordering::Release);
    }

    pub(crate) fn max_lifetime_exceeded(&self) -> bool {
        match self.max_lifetime {
            Some(lifetime) => Instant::now().duration_since(self.state.lock().unwrap().creation_time) >= lifetime,
            None => false,
        }
    }

    pub(crate) fn reap_eligible(&self, reap_timeout: Duration) -> bool {
        if self.is_available() || self.is_destroyed() {
            return false;
        }
        Instant::now().duration_since(self.state.lock().unwrap().last_time_acquired) >= reap_timeout
    }

    pub(crate) fn idle_eligible(&self, max_idle: Duration) -> bool {
        if !self.is_available() {
            return false;
        }
        Instant::now().duration_since(self.state.lock().unwrap().last_time_released) >= max_idle
    }

    /// Completes claimed-for-acquisition -> in-use: snapshots a leak
    /// stack if globally armed, updates `last_time_acquired`, probes
    /// liveness (unless `skip_probe`, used by the recycle path), and
    /// returns the connection for the proxy to wrap. On probe failure
    /// the claim is released and the connection handed back to the
    /// caller for destruction.
    pub(crate) async fn create_connection_proxy(
        &self,
        mut conn: M::Connection,
        manager: &M,
        skip_probe: bool,
        test_query: Option<&str>,
    ) -> Result<M::Connection, (M::Error, M::Connection)> {
        let _guard = self.io_guard.lock().await;

        if leak::is_armed() {
            self.state.lock().unwrap().leak_stack = Some(Backtrace::new());
        }
        self.state.lock().unwrap().last_time_acquired = Instant::now();

        if !skip_probe {
            if let Err(e) = manager.test_underlying_connection(&mut conn, test_query).await {
                self.being_acquired.store(false, Ordering::Release);
                return Err((e, conn));
            }
        }

        self.being_acquired.store(false, Ordering::Release);
        Ok(conn)
    }

    /// Invokes each listener in registration order, then updates
    /// `last_time_released`. Called when a proxy is returned normally.
    pub(crate) fn fire_terminated(&self) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener();
        }
        self.state.lock().unwrap().last_time_released = Instant::now();
    }

    /// Puts a returned connection back into the available slot and fires
    /// termination listeners. Must only be called on an entry that is
    /// not destroyed and was not claimed for this connection.
    pub(crate) fn release_to_idle(&self, conn: M::Connection) {
        *self.connection.lock().unwrap() = Some(conn);
        self.fire_terminated();
    }

    /// Mutually exclusive per entry. If `reap` is true, logs the
    /// captured leak stack if present (disarming global capture), else
    /// logs a warning and arms global capture for the next reap. If
    /// `reap` is false and the entry is not currently available, this is
    /// a no-op, protecting in-flight work from concurrent shrink.
    ///
    /// Returns the connection to destroy, if one was present in the
    /// idle slot (an in-use entry reaped while checked out has no
    /// connection here; the caller that eventually returns it is
    /// responsible for routing it to `EntryFactory::destroy_connection`).
    pub(crate) async fn destroy(&self, reap: bool, resource_name: &str) -> Option<M::Connection> {
        if reap {
            let stack = self.state.lock().unwrap().leak_stack.take();
            match stack {
                Some(stack) => {
                    warn!(pool = resource_name, entry = self.id, ?stack, "reaped leaked entry");
                    leak::disarm();
                }
                None => {
                    warn!(
                        pool = resource_name,
                        entry = self.id,
                        "reaped leaked entry with no captured stack; arming leak capture"
                    );
                    leak::arm();
                }
            }
        } else if !self.is_available() {
            return None;
        }

        let _guard = self.io_guard.lock().await;
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return None;
        }
        state.destroyed = true;
        drop(state);

        self.connection.lock().unwrap().take()
    }

    /// Unconditionally marks the entry destroyed, bypassing the
    /// not-currently-available no-op guard `destroy` applies — used by
    /// pool shutdown, which must retire in-use entries too (the caller
    /// already logs the in-use warning). Unlike `destroy(reap: true)`,
    /// this does not touch the leak-capture flag.
    ///
    /// Returns the connection if one was present in the idle slot. An
    /// in-use entry's connection is not here (it is with the caller's
    /// outstanding proxy); once that proxy drops, `is_destroyed` being
    /// true routes it to `EntryFactory::destroy_connection` from there.
    pub(crate) async fn force_destroy(&self) -> Option<M::Connection> {
        let _guard = self.io_guard.lock().await;
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return None;
        }
        state.destroyed = true;
        drop(state);

        self.connection.lock().unwrap().take()
    }
}
