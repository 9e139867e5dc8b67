use std::time::Duration;

/// Read-only tuning parameters consumed by the entry, pool manager and
/// maintenance scheduler.
///
/// Build one with [`ConfigBuilder`], reached via [`Config::builder`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) borrow_timeout: Duration,
    pub(crate) max_idle_time: Option<Duration>,
    pub(crate) reap_timeout: Option<Duration>,
    pub(crate) max_lifetime: Option<Duration>,
    pub(crate) maintenance_interval: Duration,
    pub(crate) test_query: Option<String>,
    pub(crate) default_isolation_level: Option<String>,
    pub(crate) unique_resource_name: String,
}

impl Config {
    /// Returns a [`ConfigBuilder`] with default values.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// The target minimum number of entries maintenance tops up toward.
    pub fn min_pool_size(&self) -> u32 {
        self.min_pool_size
    }

    /// The hard cap for growth.
    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size
    }

    /// The name used to identify this pool in logs.
    pub fn unique_resource_name(&self) -> &str {
        &self.unique_resource_name
    }

    /// The opaque liveness probe string passed through to
    /// [`crate::EntryFactory::test_underlying_connection`].
    pub fn test_query(&self) -> Option<&str> {
        self.test_query.as_deref()
    }

    /// The default isolation level passed through to
    /// [`crate::EntryFactory::create_pooled_entry`].
    pub fn default_isolation_level(&self) -> Option<&str> {
        self.default_isolation_level.as_deref()
    }
}

/// A builder for a [`Config`].
///
/// Mirrors the option table of the pool's configuration surface: a value
/// of `0`/`None` for a timeout disables the policy it governs.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    min_pool_size: u32,
    max_pool_size: u32,
    borrow_timeout: Duration,
    max_idle_time: Option<Duration>,
    reap_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    maintenance_interval: Duration,
    test_query: Option<String>,
    default_isolation_level: Option<String>,
    unique_resource_name: String,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            min_pool_size: 0,
            max_pool_size: 10,
            borrow_timeout: Duration::from_secs(30),
            max_idle_time: None,
            reap_timeout: None,
            max_lifetime: None,
            maintenance_interval: Duration::from_secs(60),
            test_query: None,
            default_isolation_level: None,
            unique_resource_name: "pool".to_string(),
        }
    }
}

impl ConfigBuilder {
    /// Constructs a new `ConfigBuilder` initialized with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the target minimum number of entries maintenance tops up
    /// toward.
    ///
    /// Defaults to 0.
    pub fn min_pool_size(mut self, min_pool_size: u32) -> Self {
        self.min_pool_size = min_pool_size;
        self
    }

    /// Sets the hard cap for growth.
    ///
    /// Defaults to 10.
    pub fn max_pool_size(mut self, max_pool_size: u32) -> Self {
        assert!(max_pool_size > 0, "max_pool_size must be greater than zero!");
        self.max_pool_size = max_pool_size;
        self
    }

    /// Sets the maximum total wall-clock a borrower may wait.
    ///
    /// A value of zero means a borrower fails immediately if no entry is
    /// already available. Defaults to 30 seconds.
    pub fn borrow_timeout(mut self, borrow_timeout: Duration) -> Self {
        self.borrow_timeout = borrow_timeout;
        self
    }

    /// Sets the idle duration after which entries in excess of
    /// `min_pool_size` are destroyed. `None` (or zero) disables idle
    /// shrink.
    ///
    /// Defaults to `None`.
    pub fn max_idle_time(mut self, max_idle_time: Option<Duration>) -> Self {
        self.max_idle_time = non_zero(max_idle_time);
        self
    }

    /// Sets the in-use duration past which an entry is force-destroyed as
    /// leaked. `None` (or zero) disables reap.
    ///
    /// Defaults to `None`.
    pub fn reap_timeout(mut self, reap_timeout: Option<Duration>) -> Self {
        self.reap_timeout = non_zero(reap_timeout);
        self
    }

    /// Sets the maximum lifetime of an available entry, from creation.
    /// `None` (or zero) disables lifetime eviction.
    ///
    /// Defaults to `None`.
    pub fn max_lifetime(mut self, max_lifetime: Option<Duration>) -> Self {
        self.max_lifetime = non_zero(max_lifetime);
        self
    }

    /// Sets the period of the maintenance scheduler.
    ///
    /// A duration of zero is replaced with the default of 60 seconds.
    pub fn maintenance_interval(mut self, maintenance_interval: Duration) -> Self {
        self.maintenance_interval = if maintenance_interval.is_zero() {
            Duration::from_secs(60)
        } else {
            maintenance_interval
        };
        self
    }

    /// Sets the opaque liveness probe string passed through to entries.
    pub fn test_query(mut self, test_query: Option<String>) -> Self {
        self.test_query = test_query;
        self
    }

    /// Sets the default isolation level passed through to entries.
    pub fn default_isolation_level(mut self, default_isolation_level: Option<String>) -> Self {
        self.default_isolation_level = default_isolation_level;
        self
    }

    /// Sets the name used to identify this pool in logs.
    pub fn unique_resource_name(mut self, unique_resource_name: impl Into<String>) -> Self {
        self.unique_resource_name = unique_resource_name.into();
        self
    }

    /// Consumes the builder, returning a new, validated [`Config`].
    pub fn build(self) -> Config {
        assert!(
            self.min_pool_size <= self.max_pool_size,
            "min_pool_size must be no larger than max_pool_size"
        );
        Config {
            min_pool_size: self.min_pool_size,
            max_pool_size: self.max_pool_size,
            borrow_timeout: self.borrow_timeout,
            max_idle_time: self.max_idle_time,
            reap_timeout: self.reap_timeout,
            max_lifetime: self.max_lifetime,
            maintenance_interval: self.maintenance_interval,
            test_query: self.test_query,
            default_isolation_level: self.default_isolation_level,
            unique_resource_name: self.unique_resource_name,
        }
    }
}

fn non_zero(d: Option<Duration>) -> Option<Duration> {
    d.filter(|d| !d.is_zero())
}
