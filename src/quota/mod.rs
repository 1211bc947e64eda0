//! Execution Quotas
//!
//! Stateless admission-control predicates evaluated against a usage
//! counter owned elsewhere (see [`admission`]).
//!
//! # Components
//!
//! - [`ExecutionQuota`]: a limit and the rule used to compare usage against it
//! - [`AdmissionController`]: synchronized usage accounting for admissions

pub mod admission;

pub use admission::{Admission, AdmissionController, AdmissionPermit, DenialReason};

use std::fmt;

/// How usage is compared with the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    /// No limit at all
    Unbounded,
    /// Usage must stay strictly below the limit
    Below,
    /// Usage may reach the limit
    AtMost,
}

/// An admission-control limit over a usage value.
///
/// Quotas never touch the usage they check; callers read the current usage
/// from a shared counter right before calling [`ExecutionQuota::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionQuota<T> {
    limit: Option<T>,
    bound: Bound,
}

impl<T> ExecutionQuota<T> {
    /// A quota that accepts any usage.
    pub fn never_violated() -> Self {
        Self {
            limit: None,
            bound: Bound::Unbounded,
        }
    }

    /// The configured limit, if any.
    pub fn limit(&self) -> Option<&T> {
        self.limit.as_ref()
    }

    /// Returns true when this quota never rejects anything.
    pub fn is_unbounded(&self) -> bool {
        self.bound == Bound::Unbounded
    }
}

impl<T: PartialOrd> ExecutionQuota<T> {
    /// Returns true if the given usage is admissible.
    pub fn check(&self, usage: &T) -> bool {
        match (&self.bound, &self.limit) {
            (Bound::Below, Some(limit)) => usage < limit,
            (Bound::AtMost, Some(limit)) => usage <= limit,
            _ => true,
        }
    }
}

impl ExecutionQuota<u32> {
    /// Admits while fewer than `max` executions of the user are running.
    pub fn max_parallel_executions_for_user(max: u32) -> Self {
        Self {
            limit: Some(max),
            bound: Bound::Below,
        }
    }
}

impl ExecutionQuota<u64> {
    /// Admits while the cache holds at most `max` bytes.
    pub fn max_bytes_in_cache(max: u64) -> Self {
        Self {
            limit: Some(max),
            bound: Bound::AtMost,
        }
    }
}

impl<T> Default for ExecutionQuota<T> {
    fn default() -> Self {
        Self::never_violated()
    }
}

impl<T: fmt::Display> fmt::Display for ExecutionQuota<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.bound, &self.limit) {
            (Bound::Below, Some(limit)) => write!(f, "< {}", limit),
            (Bound::AtMost, Some(limit)) => write!(f, "<= {}", limit),
            _ => write!(f, "unlimited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_violated() {
        let quota: ExecutionQuota<u64> = ExecutionQuota::never_violated();
        assert!(quota.check(&0));
        assert!(quota.check(&u64::MAX));
        assert!(quota.is_unbounded());
        assert_eq!(quota.limit(), None);
    }

    #[test]
    fn test_max_parallel_is_strict() {
        let quota = ExecutionQuota::max_parallel_executions_for_user(2);
        assert!(quota.check(&0));
        assert!(quota.check(&1));
        assert!(!quota.check(&2));
        assert!(!quota.check(&3));
    }

    #[test]
    fn test_max_parallel_zero_rejects_everything() {
        let quota = ExecutionQuota::max_parallel_executions_for_user(0);
        assert!(!quota.check(&0));
    }

    #[test]
    fn test_max_bytes_is_inclusive() {
        let quota = ExecutionQuota::max_bytes_in_cache(1_000);
        assert!(quota.check(&999));
        assert!(quota.check(&1_000));
        assert!(!quota.check(&1_001));
        assert_eq!(quota.limit(), Some(&1_000));
    }

    #[test]
    fn test_display() {
        assert_eq!(ExecutionQuota::max_parallel_executions_for_user(3).to_string(), "< 3");
        assert_eq!(ExecutionQuota::max_bytes_in_cache(10).to_string(), "<= 10");
        assert_eq!(ExecutionQuota::<u32>::default().to_string(), "unlimited");
    }
}
