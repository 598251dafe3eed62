//! # Context classification
//!
//! Every operation first decides whether the caller is a passive thread or
//! an interrupt handler, since the two kinds live in different registries
//! and follow different allocation rules.
//!
//! The answer comes from one of two places, selected by [`ClassifierMode`]:
//!
//! - [`ClassifierMode::Host`] asks the [`Platform`] on every call.
//! - [`ClassifierMode::NestingCounter`] keeps one counter per processor,
//!   raised by interrupt registration and lowered by deregistration. The
//!   caller is in interrupt context while its processor's counter is
//!   non-zero. This suits hosts where ordinary threads can raise their
//!   interrupt level, so the hardware state says nothing useful, and where
//!   every code path that behaves like a handler registers itself.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, TlsError};

/// Host services the TLS manager depends on.
pub trait Platform: Send + Sync {
    /// Whether the caller runs in interrupt or handler context.
    fn in_interrupt(&self) -> bool;

    /// A stable, non-zero identity for the calling thread.
    fn current_thread_id(&self) -> u64;

    /// Index of the processor the caller runs on.
    fn current_processor(&self) -> usize {
        0
    }
}

/// Where the interrupt-context predicate comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifierMode {
    /// Ask [`Platform::in_interrupt`].
    #[default]
    Host,
    /// Track registration nesting per processor.
    NestingCounter {
        /// Number of processors; [`Platform::current_processor`] must stay
        /// below it.
        processors: usize,
    },
}

#[derive(Debug)]
pub(crate) struct Classifier {
    nesting: Option<Box<[AtomicU32]>>,
}

impl Classifier {
    pub(crate) fn new(mode: ClassifierMode) -> Result<Self> {
        let nesting = match mode {
            ClassifierMode::Host => None,
            ClassifierMode::NestingCounter { processors: 0 } => {
                return Err(TlsError::InvalidConfig("nesting counter needs at least one processor"));
            }
            ClassifierMode::NestingCounter { processors } => {
                let mut counters = Vec::new();
                counters
                    .try_reserve_exact(processors)
                    .map_err(|_| TlsError::OutOfMemory)?;
                counters.extend((0..processors).map(|_| AtomicU32::new(0)));
                Some(counters.into_boxed_slice())
            }
        };

        Ok(Self { nesting })
    }

    /// Whether registration itself marks the caller as a handler.
    pub(crate) fn counts_nesting(&self) -> bool {
        self.nesting.is_some()
    }

    pub(crate) fn is_interrupt<P: Platform + ?Sized>(&self, platform: &P) -> bool {
        match &self.nesting {
            None => platform.in_interrupt(),
            Some(_) => self
                .counter(platform)
                .is_some_and(|count| count.load(Ordering::Acquire) > 0),
        }
    }

    /// Records a handler registration on the current processor.
    pub(crate) fn enter<P: Platform + ?Sized>(&self, platform: &P) {
        if let Some(count) = self.counter(platform) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Records a handler deregistration on the current processor.
    pub(crate) fn leave<P: Platform + ?Sized>(&self, platform: &P) {
        if let Some(count) = self.counter(platform) {
            // Saturate; an unmatched leave is rejected before it gets here.
            let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    fn counter<P: Platform + ?Sized>(&self, platform: &P) -> Option<&AtomicU32> {
        let counters = self.nesting.as_deref()?;
        let cpu = platform.current_processor();
        let counter = counters.get(cpu);
        if counter.is_none() {
            log::error!(
                "TLS: processor {cpu} is outside the {} configured nesting counters",
                counters.len()
            );
        }
        counter
    }
}

#[cfg(feature = "std")]
pub use self::host::StdPlatform;

#[cfg(feature = "std")]
mod host {
    use core::sync::atomic::{AtomicU64, Ordering};

    use super::Platform;

    static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

    std::thread_local! {
        static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }

    /// Platform for ordinary user-mode processes, which never run handlers.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct StdPlatform;

    impl Platform for StdPlatform {
        fn in_interrupt(&self) -> bool {
            false
        }

        fn current_thread_id(&self) -> u64 {
            THREAD_ID.with(|id| *id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Classifier, ClassifierMode};
    use crate::{error::TlsError, testing::TestPlatform};

    #[test]
    fn test_host_mode_asks_the_platform() {
        let classifier = Classifier::new(ClassifierMode::Host).unwrap();
        assert!(!classifier.counts_nesting());
        assert!(!classifier.is_interrupt(&TestPlatform));
        TestPlatform::interrupt(|| assert!(classifier.is_interrupt(&TestPlatform)));
    }

    #[test]
    fn test_nesting_counter_tracks_each_processor() {
        let classifier = Classifier::new(ClassifierMode::NestingCounter { processors: 2 }).unwrap();
        let platform = TestPlatform;

        // The platform's own flag is ignored in this mode.
        TestPlatform::interrupt(|| assert!(!classifier.is_interrupt(&platform)));

        classifier.enter(&platform);
        classifier.enter(&platform);
        assert!(classifier.is_interrupt(&platform));

        TestPlatform::set_processor(1);
        assert!(!classifier.is_interrupt(&platform));
        TestPlatform::set_processor(0);

        classifier.leave(&platform);
        assert!(classifier.is_interrupt(&platform));
        classifier.leave(&platform);
        assert!(!classifier.is_interrupt(&platform));
        classifier.leave(&platform);
        assert!(!classifier.is_interrupt(&platform));
    }

    #[test]
    fn test_unknown_processors_are_never_in_interrupt() {
        let classifier = Classifier::new(ClassifierMode::NestingCounter { processors: 1 }).unwrap();
        TestPlatform::set_processor(5);
        classifier.enter(&TestPlatform);
        assert!(!classifier.is_interrupt(&TestPlatform));
        TestPlatform::set_processor(0);
    }

    #[test]
    fn test_zero_processors_is_a_config_error() {
        let err = Classifier::new(ClassifierMode::NestingCounter { processors: 0 }).unwrap_err();
        assert!(matches!(err, TlsError::InvalidConfig(_)));
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_std_threads_get_distinct_ids() {
        use super::{Platform, StdPlatform};

        let here = StdPlatform.current_thread_id();
        let there = std::thread::spawn(|| StdPlatform.current_thread_id())
            .join()
            .unwrap();
        assert_ne!(here, 0);
        assert_ne!(here, there);
        assert_eq!(here, StdPlatform.current_thread_id());
    }
}
