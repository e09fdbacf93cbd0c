//! Growth and reclamation strategies for the pool allocators.
//!
//! Both policies are small closed variant sets. A [`GrowthPolicy`] is
//! consulted exactly once per page creation, so no dispatch cost is paid on
//! the per-allocation hot path.

/// Rule determining the record count of each newly created page.
///
/// Larger pages mean fewer page-creation events for long-running allocators
/// at the cost of bigger single blocks; the accelerating variants trade
/// fragmentation against amortized allocation cost.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Every page holds exactly `records` records.
    FixedSize {
        /// Record count of every page.
        records: u32,
    },
    /// The page with 0-based ordinal `n` holds `base * (n + 1)²` records.
    Quadratic {
        /// Record count of the first page.
        base: u32,
    },
    /// The page with 0-based ordinal `n` holds `base * 2ⁿ` records.
    Exponential {
        /// Record count of the first page.
        base: u32,
    },
}

/// Hard ceiling on the record count of a single page. All growth formulas
/// saturate here; there is no unbounded page size.
pub const MAX_PAGE_RECORDS: u32 = 1 << 20;

impl GrowthPolicy {
    /// Record count for the page created while `ordinal` pages already
    /// exist. The result is clamped to `1..=MAX_PAGE_RECORDS`.
    pub(crate) fn records_for(self, ordinal: usize) -> u32 {
        let records = match self {
            GrowthPolicy::FixedSize { records } => u64::from(records),
            GrowthPolicy::Quadratic { base } => {
                let n = ordinal.min(MAX_PAGE_RECORDS as usize) as u64 + 1;
                u64::from(base).saturating_mul(n.saturating_mul(n))
            }
            GrowthPolicy::Exponential { base } => {
                // Shifts past 32 could drop bits; the clamp caps them anyway.
                match ordinal {
                    0..=31 => u64::from(base) << ordinal,
                    _ => u64::from(MAX_PAGE_RECORDS),
                }
            }
        };
        records.clamp(1, u64::from(MAX_PAGE_RECORDS)) as u32
    }
}

/// When fully-empty pages are returned to the backing store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum PurgePolicy {
    /// Empty pages are kept until an explicit purge or allocator teardown.
    #[default]
    Manual,
    /// A page is released as soon as it becomes fully empty.
    Auto,
}

/// An allocator whose purge policy can be read and replaced at runtime.
pub trait PurgePolicyHost {
    /// Purge policy currently in force.
    fn purge_policy(&self) -> PurgePolicy;
    /// Replaces the purge policy for all subsequent deallocations.
    fn set_purge_policy(&self, policy: PurgePolicy);
}

/// RAII guard that forces [`PurgePolicy::Manual`] for its lifetime.
///
/// Useful around a batch of allocations and deallocations that would
/// otherwise thrash page creation and destruction under `Auto`. The
/// previous policy is restored when the guard drops, on every exit path
/// including panics and early returns.
#[must_use = "the scope restores the policy when dropped"]
pub struct ManualPurgeScope<'a, H: PurgePolicyHost + ?Sized> {
    host: &'a H,
    previous: PurgePolicy,
}

impl<'a, H: PurgePolicyHost + ?Sized> ManualPurgeScope<'a, H> {
    /// Records the host's current policy and force-sets `Manual`.
    pub fn new(host: &'a H) -> Self {
        let previous = host.purge_policy();
        host.set_purge_policy(PurgePolicy::Manual);
        ManualPurgeScope { host, previous }
    }
}

impl<H: PurgePolicyHost + ?Sized> Drop for ManualPurgeScope<'_, H> {
    fn drop(&mut self) {
        self.host.set_purge_policy(self.previous);
    }
}

impl PurgePolicy {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            PurgePolicy::Manual => 0,
            PurgePolicy::Auto => 1,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PurgePolicy::Manual,
            _ => PurgePolicy::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size() {
        let policy = GrowthPolicy::FixedSize { records: 32 };
        for ordinal in 0..10 {
            assert_eq!(policy.records_for(ordinal), 32);
        }
    }

    #[test]
    fn test_quadratic() {
        let policy = GrowthPolicy::Quadratic { base: 4 };
        assert_eq!(policy.records_for(0), 4);
        assert_eq!(policy.records_for(1), 16);
        assert_eq!(policy.records_for(2), 36);
        assert_eq!(policy.records_for(3), 64);
    }

    #[test]
    fn test_exponential() {
        let policy = GrowthPolicy::Exponential { base: 8 };
        assert_eq!(policy.records_for(0), 8);
        assert_eq!(policy.records_for(1), 16);
        assert_eq!(policy.records_for(2), 32);
        assert_eq!(policy.records_for(10), 8192);
    }

    #[test]
    fn test_clamping() {
        assert_eq!(
            GrowthPolicy::Exponential { base: 2 }.records_for(63),
            MAX_PAGE_RECORDS
        );
        assert_eq!(
            GrowthPolicy::Exponential { base: 2 }.records_for(usize::MAX),
            MAX_PAGE_RECORDS
        );
        assert_eq!(
            GrowthPolicy::Quadratic { base: u32::MAX }.records_for(5),
            MAX_PAGE_RECORDS
        );
        assert_eq!(GrowthPolicy::FixedSize { records: 0 }.records_for(0), 1);
    }

    #[test]
    fn test_manual_purge_scope() {
        use core::cell::Cell;

        struct Host(Cell<PurgePolicy>);
        impl PurgePolicyHost for Host {
            fn purge_policy(&self) -> PurgePolicy {
                self.0.get()
            }
            fn set_purge_policy(&self, policy: PurgePolicy) {
                self.0.set(policy);
            }
        }

        let host = Host(Cell::new(PurgePolicy::Auto));
        {
            let _scope = ManualPurgeScope::new(&host);
            assert_eq!(host.purge_policy(), PurgePolicy::Manual);
            {
                // Nesting restores the outer scope's forced policy.
                let _inner = ManualPurgeScope::new(&host);
                assert_eq!(host.purge_policy(), PurgePolicy::Manual);
            }
            assert_eq!(host.purge_policy(), PurgePolicy::Manual);
        }
        assert_eq!(host.purge_policy(), PurgePolicy::Auto);

        // The restore runs on panic unwinds too.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = ManualPurgeScope::new(&host);
            panic!("interrupted batch");
        }));
        assert!(result.is_err());
        assert_eq!(host.purge_policy(), PurgePolicy::Auto);
    }

    #[test]
    fn test_purge_policy_roundtrip() {
        assert_eq!(PurgePolicy::from_u8(PurgePolicy::Auto.as_u8()), PurgePolicy::Auto);
        assert_eq!(PurgePolicy::from_u8(PurgePolicy::Manual.as_u8()), PurgePolicy::Manual);
    }
}
