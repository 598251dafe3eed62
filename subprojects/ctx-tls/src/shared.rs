//! # Shared database handle
//!
//! [`SharedTls`] lets several independent components share one database
//! without agreeing on who creates it. Each component calls
//! [`initialize`](SharedTls::initialize) when it starts and
//! [`shutdown`](SharedTls::shutdown) when it stops. The first initialize
//! builds the database and the last shutdown releases it.
//!
//! The handle is `const`-constructible, so it can live in a `static`:
//!
//! ```ignore
//! static TLS: SharedTls<StdPlatform, HeapAllocator, fn() -> Result<TlsDatabase<StdPlatform>>> =
//!     SharedTls::new(|| TlsDatabase::new(StdPlatform, HeapAllocator, TlsConfig::default()));
//! ```

use alloc::sync::Arc;

use ctx_tls_alloc::Allocator;
use ctx_tls_sync::Mutex;

use crate::{
    classify::Platform,
    database::TlsDatabase,
    error::{Result, TlsError},
};

struct State<P: Platform, A: Allocator> {
    init_count: usize,
    database: Option<Arc<TlsDatabase<P, A>>>,
}

/// Reference-counted owner of a lazily built [`TlsDatabase`].
pub struct SharedTls<P: Platform, A: Allocator, F> {
    factory: F,
    state: Mutex<State<P, A>>,
}

impl<P, A, F> SharedTls<P, A, F>
where
    P: Platform,
    A: Allocator,
    F: Fn() -> Result<TlsDatabase<P, A>>,
{
    /// Creates an uninitialized handle that builds its database with
    /// `factory`.
    pub const fn new(factory: F) -> Self {
        Self {
            factory,
            state: Mutex::new(State {
                init_count: 0,
                database: None,
            }),
        }
    }

    /// Adds an owner, building the database if this is the first one.
    ///
    /// # Errors
    ///
    /// Whatever the factory returns. The owner is not counted then, so a
    /// later call retries the construction.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.init_count == 0 {
            let database = (self.factory)().map_err(TlsError::report)?;
            state.database = Some(Arc::new(database));
        }
        state.init_count += 1;
        Ok(())
    }

    /// Removes an owner, releasing the database with the last one.
    ///
    /// The database is torn down once every [`Arc`] handed out by
    /// [`database`](Self::database) is gone as well.
    ///
    /// # Errors
    ///
    /// [`TlsError::ShutdownUnderflow`] if there is no owner left to remove.
    pub fn shutdown(&self) -> Result<()> {
        let retired = {
            let mut state = self.state.lock();
            match state.init_count {
                0 => return Err(TlsError::ShutdownUnderflow.report()),
                1 => {
                    state.init_count = 0;
                    state.database.take()
                }
                _ => {
                    state.init_count -= 1;
                    None
                }
            }
        };

        // Teardown runs outside the lock.
        drop(retired);
        Ok(())
    }

    /// The shared database.
    ///
    /// # Errors
    ///
    /// [`TlsError::Uninitialized`] between construction (or the last
    /// shutdown) and the next initialize.
    pub fn database(&self) -> Result<Arc<TlsDatabase<P, A>>> {
        self.state
            .lock()
            .database
            .clone()
            .ok_or_else(|| TlsError::Uninitialized.report())
    }

    /// Number of owners.
    pub fn init_count(&self) -> usize {
        self.state.lock().init_count
    }

    /// Whether a database is currently built.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().database.is_some()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use ctx_tls_alloc::HeapAllocator;

    use super::SharedTls;
    use crate::{
        config::TlsConfig,
        database::TlsDatabase,
        entry::EMPTY,
        error::{Result, TlsError},
        registry::RegistryKind,
        testing::{CountingAllocator, TestPlatform, value},
    };

    #[test]
    fn test_construction_and_teardown_happen_once() {
        let built = AtomicUsize::new(0);
        let fallback = CountingAllocator::new();
        let shared = SharedTls::new(|| {
            built.fetch_add(1, Ordering::Relaxed);
            TlsDatabase::new(TestPlatform, &fallback, TlsConfig::default())
        });

        for _ in 0..3 {
            shared.initialize().unwrap();
        }
        assert_eq!(built.load(Ordering::Relaxed), 1);
        assert_eq!(shared.init_count(), 3);

        let key = {
            let db = shared.database().unwrap();
            let key = db.alloc_key();
            db.acquire(key).unwrap();
            assert!(db.set(key, value(4)));
            key
        };
        assert!(fallback.live() > 0);

        shared.shutdown().unwrap();
        shared.shutdown().unwrap();
        // Still one owner: the same database, with its state.
        assert_eq!(shared.database().unwrap().get(key), value(4));

        shared.shutdown().unwrap();
        assert!(!shared.is_initialized());
        assert_eq!(fallback.live(), 0);
        assert_eq!(built.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reinitializing_builds_a_fresh_database() {
        let shared = SharedTls::new(|| TlsDatabase::new(TestPlatform, HeapAllocator, TlsConfig::default()));

        shared.initialize().unwrap();
        let db = shared.database().unwrap();
        let key = db.alloc_key();
        db.acquire(key).unwrap();
        drop(db);
        shared.shutdown().unwrap();

        shared.initialize().unwrap();
        let db = shared.database().unwrap();
        assert_eq!(db.get(key), EMPTY);
        assert_eq!(db.context_count(), 0);
        drop(db);
        shared.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_without_initialize_is_an_error() {
        let shared = SharedTls::new(|| TlsDatabase::new(TestPlatform, HeapAllocator, TlsConfig::default()));
        assert_eq!(shared.shutdown(), Err(TlsError::ShutdownUnderflow));

        shared.initialize().unwrap();
        shared.shutdown().unwrap();
        assert_eq!(shared.shutdown(), Err(TlsError::ShutdownUnderflow));
        assert_eq!(shared.init_count(), 0);
    }

    #[test]
    fn test_database_is_unavailable_until_initialized() {
        let shared = SharedTls::new(|| TlsDatabase::new(TestPlatform, HeapAllocator, TlsConfig::default()));
        assert_eq!(shared.database().err(), Some(TlsError::Uninitialized));

        shared.initialize().unwrap();
        assert!(shared.database().is_ok());
        shared.shutdown().unwrap();
        assert_eq!(shared.database().err(), Some(TlsError::Uninitialized));
    }

    #[test]
    fn test_failed_construction_is_not_counted() {
        let shared = SharedTls::new(|| -> Result<TlsDatabase<TestPlatform>> {
            let config = TlsConfig::default().with_isr_registry(RegistryKind::LockFree { capacity: 0 });
            TlsDatabase::new(TestPlatform, HeapAllocator, config)
        });

        assert!(matches!(shared.initialize(), Err(TlsError::InvalidConfig(_))));
        assert_eq!(shared.init_count(), 0);
        assert_eq!(shared.shutdown(), Err(TlsError::ShutdownUnderflow));
    }
}
