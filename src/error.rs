/// The pool's error type.
#[derive(thiserror::Error, Debug)]
pub enum PoolError<E> {
    /// The back-end session could not be opened, or failed its liveness
    /// probe.
    #[error("failed to create a back-end session: {0}")]
    CreateConnection(#[source] E),
    /// A borrow timed out with no entry acquired and the pool already at
    /// `max_pool_size`.
    #[error("timed out waiting for an available pooled entry")]
    PoolExhausted,
    /// The operation was attempted after [`crate::Pool::destroy`] was
    /// called.
    #[error("operation attempted after the pool was destroyed")]
    PoolDestroyed,
    /// Any other internal consistency failure.
    #[error("internal pool consistency error: {0}")]
    ConnectionPool(String),
}

impl<E> PoolError<E> {
    /// Returns the user error if this is a [`PoolError::CreateConnection`].
    pub fn into_user_error(self) -> Option<E> {
        match self {
            PoolError::CreateConnection(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> PartialEq for PoolError<E>
where
    E: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PoolError::CreateConnection(a), PoolError::CreateConnection(b)) => a == b,
            (PoolError::PoolExhausted, PoolError::PoolExhausted) => true,
            (PoolError::PoolDestroyed, PoolError::PoolDestroyed) => true,
            (PoolError::ConnectionPool(a), PoolError::ConnectionPool(b)) => a == b,
            _ => false,
        }
    }
}
