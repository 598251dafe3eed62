//! Database configuration.

use static_assertions::const_assert;

use crate::{
    classify::ClassifierMode,
    entry::Entry,
    error::{Result, TlsError},
    registry::{RegistryKind, StackGrowth},
};

/// Default number of interrupt slots in a lock-free registry.
pub const DEFAULT_ISR_SLOTS: usize = 64;

/// Default size, in entries, of each passive context's entry block.
pub const DEFAULT_ENTRY_BLOCK_ENTRIES: usize = 16;

const_assert!(DEFAULT_ISR_SLOTS > 0);

/// How a [`TlsDatabase`](crate::TlsDatabase) is put together.
///
/// ```ignore
/// let config = TlsConfig::default()
///     .with_isr_registry(RegistryKind::Locked)
///     .with_entry_block_entries(4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsConfig {
    /// Backend of the passive-thread registry.
    pub passive_registry: RegistryKind,
    /// Backend of the interrupt registry.
    pub isr_registry: RegistryKind,
    /// Source of the interrupt-context predicate.
    pub classifier: ClassifierMode,
    /// Direction of the host's stacks, for interrupt lookups.
    pub stack_growth: StackGrowth,
    /// Entries in the block each passive context carves at creation. Zero
    /// sends every entry straight to the fallback allocator.
    pub entry_block_entries: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            passive_registry: RegistryKind::Locked,
            isr_registry: RegistryKind::LockFree {
                capacity: DEFAULT_ISR_SLOTS,
            },
            classifier: ClassifierMode::Host,
            stack_growth: StackGrowth::Downward,
            entry_block_entries: DEFAULT_ENTRY_BLOCK_ENTRIES,
        }
    }
}

impl TlsConfig {
    /// One passive thread and at most one handler at a time.
    pub fn single_threaded() -> Self {
        Self {
            passive_registry: RegistryKind::Single,
            isr_registry: RegistryKind::Single,
            ..Self::default()
        }
    }

    pub fn with_passive_registry(mut self, kind: RegistryKind) -> Self {
        self.passive_registry = kind;
        self
    }

    pub fn with_isr_registry(mut self, kind: RegistryKind) -> Self {
        self.isr_registry = kind;
        self
    }

    pub fn with_classifier(mut self, mode: ClassifierMode) -> Self {
        self.classifier = mode;
        self
    }

    pub fn with_stack_growth(mut self, growth: StackGrowth) -> Self {
        self.stack_growth = growth;
        self
    }

    pub fn with_entry_block_entries(mut self, entries: usize) -> Self {
        self.entry_block_entries = entries;
        self
    }

    /// Checks that a database can be built from this configuration.
    ///
    /// # Errors
    ///
    /// [`TlsError::InvalidConfig`] naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        for kind in [self.passive_registry, self.isr_registry] {
            if kind == (RegistryKind::LockFree { capacity: 0 }) {
                return Err(TlsError::InvalidConfig("lock-free registry capacity is zero"));
            }
        }

        if self.classifier == (ClassifierMode::NestingCounter { processors: 0 }) {
            return Err(TlsError::InvalidConfig("nesting counter processor count is zero"));
        }

        if self.entry_block_entries.checked_mul(size_of::<Entry>()).is_none() {
            return Err(TlsError::InvalidConfig("entry block size overflows"));
        }

        Ok(())
    }

    /// Size in bytes of a passive context's entry block.
    pub(crate) fn entry_block_bytes(&self) -> usize {
        self.entry_block_entries.saturating_mul(size_of::<Entry>())
    }
}
