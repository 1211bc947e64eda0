//! Admission Control
//!
//! Shared usage accounting for quota checks. All admissions for one
//! controller go through a single lock so that reading the current usage
//! and admitting a new execution happen as one step: two concurrent
//! requests can never both observe the same free slot or free cache space.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use super::ExecutionQuota;
use crate::process::PProcess;

/// Why an admission was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The user already runs as many executions as allowed
    TooManyExecutions { user: String, running: u32 },
    /// Admitting would push the cache beyond its limit
    CacheFull { used: u64, requested: u64 },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyExecutions { user, running } => write!(
                f,
                "user '{}' already has {} running executions",
                user, running
            ),
            Self::CacheFull { used, requested } => write!(
                f,
                "cache holds {} bytes, cannot reserve {} more",
                used, requested
            ),
        }
    }
}

/// Result of an admission attempt.
///
/// A denial is not an error: the caller refuses the request and may try
/// again later.
#[derive(Debug)]
pub enum Admission {
    Granted(AdmissionPermit),
    Denied(DenialReason),
}

impl Admission {
    /// Returns the permit if the admission was granted.
    pub fn permit(self) -> Option<AdmissionPermit> {
        match self {
            Self::Granted(permit) => Some(permit),
            Self::Denied(_) => None,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

#[derive(Debug, Default)]
struct Usage {
    running: HashMap<String, u32>,
    cache_bytes: u64,
}

/// Synchronized usage counters shared by every admission attempt.
#[derive(Debug, Clone, Default)]
pub struct AdmissionController {
    usage: Arc<Mutex<Usage>>,
}

impl AdmissionController {
    /// Creates a controller with no running executions and an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions currently admitted for a user.
    pub fn running_for(&self, user: &str) -> u32 {
        lock(&self.usage).running.get(user).copied().unwrap_or(0)
    }

    /// Bytes currently accounted in the cache.
    pub fn cache_bytes(&self) -> u64 {
        lock(&self.usage).cache_bytes
    }

    /// Tries to admit one execution for `user`.
    ///
    /// The parallelism quota is checked against the user's running count and
    /// the cache quota against the cache usage including `expected_bytes`.
    /// On success both counters are updated before the lock is released.
    pub fn try_admit(
        &self,
        user: &str,
        parallel: &ExecutionQuota<u32>,
        cache: &ExecutionQuota<u64>,
        expected_bytes: u64,
    ) -> Admission {
        let mut usage = lock(&self.usage);

        let running = usage.running.get(user).copied().unwrap_or(0);
        if !parallel.check(&running) {
            debug!("Denied execution for '{}': {} running", user, running);
            return Admission::Denied(DenialReason::TooManyExecutions {
                user: user.to_string(),
                running,
            });
        }

        let projected = usage.cache_bytes.saturating_add(expected_bytes);
        if !cache.check(&projected) {
            debug!(
                "Denied execution for '{}': cache {} + {} bytes",
                user, usage.cache_bytes, expected_bytes
            );
            return Admission::Denied(DenialReason::CacheFull {
                used: usage.cache_bytes,
                requested: expected_bytes,
            });
        }

        *usage.running.entry(user.to_string()).or_insert(0) += 1;
        usage.cache_bytes = projected;

        Admission::Granted(AdmissionPermit {
            user: user.to_string(),
            cache_bytes: expected_bytes,
            usage: Arc::clone(&self.usage),
        })
    }

    /// Tries to admit one execution of `process` over `input_bytes` of input.
    ///
    /// The cache reservation is the process's size forecast for that input,
    /// or nothing when the process declares no forecast.
    pub fn admit(&self, user: &str, process: &PProcess, input_bytes: u64) -> Admission {
        let expected = process.expected_output_bytes(input_bytes).unwrap_or(0);
        let admission = self.try_admit(
            user,
            process.parallel_quota(),
            process.cache_quota(),
            expected,
        );

        match &admission {
            Admission::Granted(_) => info!(
                "Admitted '{}' for user '{}' ({} bytes reserved)",
                process.name(),
                user,
                expected
            ),
            Admission::Denied(reason) => {
                info!("Refused '{}' for user '{}': {}", process.name(), user, reason)
            }
        }
        admission
    }

    /// Removes evicted bytes from the cache accounting.
    pub fn release_cache_bytes(&self, bytes: u64) {
        let mut usage = lock(&self.usage);
        usage.cache_bytes = usage.cache_bytes.saturating_sub(bytes);
    }
}

/// An admitted execution slot, released when dropped.
///
/// Cache bytes reserved at admission stay accounted after the permit is
/// dropped; they leave the cache through
/// [`AdmissionController::release_cache_bytes`].
#[derive(Debug)]
pub struct AdmissionPermit {
    user: String,
    cache_bytes: u64,
    usage: Arc<Mutex<Usage>>,
}

impl AdmissionPermit {
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Bytes reserved in the cache by this admission.
    pub fn cache_bytes(&self) -> u64 {
        self.cache_bytes
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut usage = lock(&self.usage);
        if let Some(count) = usage.running.get_mut(&self.user) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                usage.running.remove(&self.user);
            }
        }
    }
}

/// Locks the usage counters, recovering from a poisoned lock.
fn lock(usage: &Mutex<Usage>) -> MutexGuard<'_, Usage> {
    usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlimited_cache() -> ExecutionQuota<u64> {
        ExecutionQuota::never_violated()
    }

    #[test]
    fn test_parallel_slot_released_on_drop() {
        let controller = AdmissionController::new();
        let quota = ExecutionQuota::max_parallel_executions_for_user(2);

        let first = controller.try_admit("alice", &quota, &unlimited_cache(), 0);
        let second = controller.try_admit("alice", &quota, &unlimited_cache(), 0);
        assert!(first.is_granted());
        assert!(second.is_granted());

        let third = controller.try_admit("alice", &quota, &unlimited_cache(), 0);
        assert_eq!(
            third.permit().map(|p| p.user().to_string()),
            None,
            "third admission must be refused while two are outstanding"
        );
        assert_eq!(controller.running_for("alice"), 2);

        drop(first);
        assert_eq!(controller.running_for("alice"), 1);

        let retry = controller.try_admit("alice", &quota, &unlimited_cache(), 0);
        assert!(retry.is_granted());
        drop(second);
    }

    #[test]
    fn test_users_are_counted_separately() {
        let controller = AdmissionController::new();
        let quota = ExecutionQuota::max_parallel_executions_for_user(1);

        let alice = controller.try_admit("alice", &quota, &unlimited_cache(), 0);
        let bob = controller.try_admit("bob", &quota, &unlimited_cache(), 0);
        assert!(alice.is_granted());
        assert!(bob.is_granted());

        match controller.try_admit("alice", &quota, &unlimited_cache(), 0) {
            Admission::Denied(DenialReason::TooManyExecutions { user, running }) => {
                assert_eq!(user, "alice");
                assert_eq!(running, 1);
            }
            other => panic!("unexpected admission: {:?}", other),
        }
    }

    #[test]
    fn test_cache_quota_reserves_bytes() {
        let controller = AdmissionController::new();
        let parallel = ExecutionQuota::never_violated();
        let cache = ExecutionQuota::max_bytes_in_cache(100);

        let first = controller.try_admit("alice", &parallel, &cache, 60);
        assert!(first.is_granted());
        assert_eq!(controller.cache_bytes(), 60);

        match controller.try_admit("bob", &parallel, &cache, 41) {
            Admission::Denied(DenialReason::CacheFull { used, requested }) => {
                assert_eq!(used, 60);
                assert_eq!(requested, 41);
            }
            other => panic!("unexpected admission: {:?}", other),
        }

        // Reaching the limit exactly is allowed
        assert!(controller.try_admit("bob", &parallel, &cache, 40).is_granted());
        assert_eq!(controller.cache_bytes(), 100);
    }

    #[test]
    fn test_cache_bytes_survive_permit_until_evicted() {
        let controller = AdmissionController::new();
        let parallel = ExecutionQuota::never_violated();
        let cache = ExecutionQuota::max_bytes_in_cache(100);

        let permit = controller.try_admit("alice", &parallel, &cache, 80).permit();
        assert_eq!(permit.as_ref().map(|p| p.cache_bytes()), Some(80));
        drop(permit);
        assert_eq!(controller.cache_bytes(), 80);

        controller.release_cache_bytes(80);
        assert_eq!(controller.cache_bytes(), 0);
        assert!(controller.try_admit("alice", &parallel, &cache, 80).is_granted());
    }

    #[test]
    fn test_concurrent_admissions_never_overcommit() {
        let controller = AdmissionController::new();
        let quota = ExecutionQuota::max_parallel_executions_for_user(3);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let controller = controller.clone();
                std::thread::spawn(move || {
                    controller
                        .try_admit("alice", &quota, &ExecutionQuota::never_violated(), 0)
                        .permit()
                })
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(permits.len(), 3);
        assert_eq!(controller.running_for("alice"), 3);
    }
}
