//! Read-after-write confirmation.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::profile::Profile;
use crate::retry::{Attempt, CallContext, RetryError, RetryPolicy};
use crate::storage::ProfileStore;

/// Polls the profile store until a just-written profile can be read.
///
/// The first read happens immediately; later reads follow the retry policy.
/// Read errors do not end the wait: they are logged, retried, and the last
/// one is reported if the profile never shows up.
#[derive(Clone)]
pub struct VisibilityWaiter {
    store: Arc<dyn ProfileStore>,
    policy: RetryPolicy,
}

impl fmt::Debug for VisibilityWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityWaiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl VisibilityWaiter {
    /// Creates a waiter reading from `store`.
    pub fn new(store: Arc<dyn ProfileStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Waits until `profile_id` is readable and returns it.
    ///
    /// # Errors
    /// - `VisibilityTimeout` once the attempt budget is spent
    /// - `Interrupted` if `ctx` is cancelled or its deadline passes
    pub fn wait_for(&self, profile_id: &str, ctx: &CallContext) -> Result<Profile, ExecutionError> {
        let outcome = self.policy.run(ctx, |attempt| match self.store.get_profile(profile_id) {
            Ok(Some(profile)) => Attempt::Ready(profile),
            Ok(None) => {
                debug!(profile_id, attempt, "profile not visible yet");
                Attempt::Pending
            }
            Err(e) => {
                warn!(profile_id, attempt, error = %e, "read failed while waiting for profile");
                Attempt::Failed(e)
            }
        });

        match outcome {
            Ok(profile) => Ok(profile),
            Err(RetryError::Exhausted { attempts, last_error }) => {
                Err(ExecutionError::VisibilityTimeout {
                    profile_id: profile_id.to_string(),
                    attempts,
                    last_error,
                })
            }
            // Reads never abort.
            Err(RetryError::Aborted(e)) => Err(ExecutionError::storage("get_profile", profile_id, e)),
            Err(RetryError::Interrupted { interruption, .. }) => Err(ExecutionError::Interrupted {
                operation: "wait_for_visibility",
                profile_id: profile_id.to_string(),
                reason: interruption.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::storage::InMemoryProfileStore;

    fn waiter(store: &Arc<InMemoryProfileStore>, attempts: u32, delay_ms: u64) -> VisibilityWaiter {
        VisibilityWaiter::new(
            Arc::clone(store) as Arc<dyn ProfileStore>,
            RetryPolicy::fixed(attempts, Duration::from_millis(delay_ms)),
        )
    }

    #[test]
    fn immediate_visibility() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.insert_profile(Profile::skeleton("p-1")).unwrap();
        let got = waiter(&store, 1, 1).wait_for("p-1", &CallContext::background()).unwrap();
        assert_eq!(got.profile_id, "p-1");
    }

    #[test]
    fn waits_out_replication_lag() {
        let store = Arc::new(InMemoryProfileStore::with_visibility_lag(Duration::from_millis(30)));
        store.insert_profile(Profile::skeleton("p-1")).unwrap();
        let got = waiter(&store, 10, 20).wait_for("p-1", &CallContext::background());
        assert!(got.is_ok());
    }

    #[test]
    fn times_out_when_lag_exceeds_budget() {
        let store = Arc::new(InMemoryProfileStore::with_visibility_lag(Duration::from_secs(60)));
        store.insert_profile(Profile::skeleton("p-1")).unwrap();
        let err = waiter(&store, 3, 1).wait_for("p-1", &CallContext::background()).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::VisibilityTimeout { attempts: 3, last_error: None, .. }
        ));
    }

    #[test]
    fn read_errors_are_retried_and_reported() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.insert_profile(Profile::skeleton("p-1")).unwrap();
        store.inject_read_failures(2);
        assert!(waiter(&store, 3, 1).wait_for("p-1", &CallContext::background()).is_ok());

        store.inject_read_failures(5);
        let err = waiter(&store, 2, 1).wait_for("p-1", &CallContext::background()).unwrap_err();
        match err {
            ExecutionError::VisibilityTimeout { last_error, .. } => assert!(last_error.is_some()),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
