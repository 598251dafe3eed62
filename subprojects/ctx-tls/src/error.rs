//! Error type for TLS operations.

use crate::key::TlsKey;

/// Result type for TLS operations.
pub type Result<T> = core::result::Result<T, TlsError>;

/// Errors returned by the TLS manager.
///
/// Variants fall in two groups. Contract violations (see
/// [`TlsError::is_contract_violation`]) mean the caller broke the manager's
/// usage rules; they are logged at `error` level when raised. The rest are
/// runtime conditions the caller may recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TlsError {
    /// The shared database has not been initialized, or has been shut down.
    #[error("TLS database used before initialization or after shutdown")]
    Uninitialized,
    /// `shutdown` was called more times than `initialize`.
    #[error("TLS shutdown called without a matching initialize")]
    ShutdownUnderflow,
    /// An allocator could not provide memory for a context or an entry.
    #[error("out of memory")]
    OutOfMemory,
    /// The key is neither reserved, a tag, nor a dynamic key issued so far.
    #[error("key {0} was never allocated")]
    InvalidKey(TlsKey),
    /// No entry for the key exists in the calling context.
    #[error("key {0} is not acquired in the calling context")]
    NotFound(TlsKey),
    /// `unreference` would drive the reference count below zero.
    #[error("reference count of key {0} is already zero")]
    RefCountUnderflow(TlsKey),
    /// Another reference would overflow the entry's reference count.
    #[error("reference count of key {0} is at its maximum")]
    RefCountOverflow(TlsKey),
    /// The entry was allocated by a different allocator than the one given.
    #[error("key {0} released with a different allocator than it was acquired with")]
    AllocatorMismatch(TlsKey),
    /// An interrupt-only operation was called from a passive thread.
    #[error("operation requires interrupt context")]
    NotInInterrupt,
    /// The calling interrupt handler has no registered context.
    #[error("no interrupt context registered for the calling handler")]
    IsrNotRegistered,
    /// A context with the same identity is already registered.
    #[error("context {0:#x} is already registered")]
    ContextExists(u64),
    /// A fixed-capacity registry has no free slot.
    #[error("context registry exhausted ({capacity} slots)")]
    CapacityExhausted {
        /// Number of slots in the registry.
        capacity: usize,
    },
    /// The configuration cannot be used to build a database.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl TlsError {
    /// Whether this error means the caller broke the manager's contract, as
    /// opposed to a transient runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, Self::OutOfMemory | Self::InvalidConfig(_))
    }

    /// Logs the error through the `log` facade and returns it.
    pub(crate) fn report(self) -> Self {
        if self.is_contract_violation() {
            log::error!("TLS: {self}");
        } else {
            log::warn!("TLS: {self}");
        }
        self
    }
}
