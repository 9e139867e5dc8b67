//! The periodic background task that performs reap-in-use, max-lifetime
//! eviction, top-up and idle shrink, in that order, on the cadence set by
//! `Config::maintenance_interval`.
//!
//! A self-rescheduling task holding a `Weak<SharedPool<M>>`, so it stops
//! on its own once the pool it serves is dropped.

use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::manager::EntryFactory;
use crate::pool::SharedPool;

pub(crate) fn spawn_maintenance<M: EntryFactory>(pool: Arc<SharedPool<M>>) -> tokio::task::JoinHandle<()> {
    let interval_period = pool.config.maintenance_interval;
    let weak = Arc::downgrade(&pool);
    drop(pool);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval_period);
        // The first tick fires immediately; skip it so maintenance doesn't
        // race the pool's own initial top-up.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(pool) = weak.upgrade() else {
                return;
            };
            run_one_tick(&pool).await;
        }
    })
}

async fn run_one_tick<M: EntryFactory>(pool: &Arc<SharedPool<M>>) {
    if pool.is_destroyed() {
        return;
    }

    reap_in_use(pool).await;
    evict_max_lifetime(pool).await;
    top_up(pool).await;
    shrink_idle(pool).await;
}

/// Step 1: forcibly destroys any in-use entry older than `reap_timeout`
/// since its last acquire, recovering leaked entries.
async fn reap_in_use<M: EntryFactory>(pool: &Arc<SharedPool<M>>) {
    let Some(reap_timeout) = pool.config.reap_timeout else {
        return;
    };

    for entry in pool.snapshot_entries() {
        if !entry.reap_eligible(reap_timeout) {
            continue;
        }
        if let Some(conn) = entry.destroy(true, pool.resource_name()).await {
            pool.remove_entry(&entry);
            pool.manager.destroy_connection(conn, true).await;
        } else {
            // No connection in the idle slot: the entry is in-use and the
            // outstanding proxy will route its connection to
            // `destroy_connection` once dropped, since `destroy` already
            // marked the entry destroyed.
            pool.remove_entry(&entry);
        }
        pool.notify.notify_one();
    }
}

/// Step 2: destroys available entries past their configured max lifetime.
async fn evict_max_lifetime<M: EntryFactory>(pool: &Arc<SharedPool<M>>) {
    for entry in pool.snapshot_entries() {
        if !entry.is_available() || !entry.max_lifetime_exceeded() {
            continue;
        }
        if let Some(conn) = entry.destroy(false, pool.resource_name()).await {
            pool.remove_entry(&entry);
            debug!(pool = pool.resource_name(), entry = entry.id, "evicted entry past max lifetime");
            pool.manager.destroy_connection(conn, false).await;
        }
    }
}

/// Step 3: creates entries until `min_pool_size` is reached. A creation
/// failure is logged and breaks the step; it is retried next tick.
async fn top_up<M: EntryFactory>(pool: &Arc<SharedPool<M>>) {
    while pool.total_size() < pool.config.min_pool_size {
        if let Err(e) = pool.grow_one().await {
            warn!(pool = pool.resource_name(), error = %e, "maintenance top-up failed, retrying next tick");
            break;
        }
    }
}

/// Step 4: destroys up to `total - min_pool_size` available entries that
/// have been idle past `max_idle_time`.
async fn shrink_idle<M: EntryFactory>(pool: &Arc<SharedPool<M>>) {
    let Some(max_idle) = pool.config.max_idle_time else {
        return;
    };

    let removable = pool.total_size().saturating_sub(pool.config.min_pool_size);
    if removable == 0 {
        return;
    }

    let mut shrunk = 0;
    for entry in pool.snapshot_entries() {
        if shrunk >= removable {
            break;
        }
        if !entry.idle_eligible(max_idle) {
            continue;
        }
        if let Some(conn) = entry.destroy(false, pool.resource_name()).await {
            pool.remove_entry(&entry);
            shrunk += 1;
            trace!(pool = pool.resource_name(), entry = entry.id, "shrank idle entry");
            pool.manager.destroy_connection(conn, false).await;
        }
    }
}
