use async_trait::async_trait;

/// A capability set supplying back-end-specific behavior to the pool.
///
/// The pool manages only the capability-bearing value — one `Entry<M>`
/// shape serves every back-end; what varies is the `EntryFactory`
/// implementation a caller plugs in. This bundles the entry-factory and
/// recycle-policy collaborators of the pool design into a single trait
/// rather than splitting them.
#[async_trait]
pub trait EntryFactory: Send + Sync + 'static {
    /// The back-end session type this manager deals with.
    type Connection: Send + 'static;
    /// The error type returned by `Connection`s.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a new back-end session. Returns an entry in state
    /// *available*. `default_isolation_level` is [`crate::Config`]'s
    /// configured value, passed through unexamined by the core.
    async fn create_pooled_entry(&self, default_isolation_level: Option<&str>) -> Result<Self::Connection, Self::Error>;

    /// Probes the connection's liveness. Invoked on every checkout
    /// (subject to configuration); failure here propagates as
    /// `CreateConnection` and causes the entry to be removed and
    /// destroyed. `test_query` is [`crate::Config`]'s configured opaque
    /// probe string, passed through unexamined by the core.
    async fn test_underlying_connection(
        &self,
        conn: &mut Self::Connection,
        test_query: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// A cheap, synchronous, best-effort check for a connection the
    /// back-end has already hung up on. Run when a proxy is returned;
    /// unlike `test_underlying_connection` this must not block or
    /// perform I/O.
    ///
    /// Defaults to `false` (assume healthy).
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Decides whether this available entry is already affiliated with
    /// the calling unit of work and should be preferred over the normal
    /// availability scan, bypassing the liveness probe.
    ///
    /// The core never inspects caller identity directly; it only asks
    /// this question. Defaults to `false`.
    fn can_be_recycled_for_calling_thread(&self, _conn: &Self::Connection) -> bool {
        false
    }

    /// Releases a back-end session. `reap` is true when the entry was
    /// forcibly destroyed for being in-use past `reap_timeout`.
    ///
    /// Defaults to doing nothing beyond dropping `conn`.
    async fn destroy_connection(&self, _conn: Self::Connection, _reap: bool) {}
}
