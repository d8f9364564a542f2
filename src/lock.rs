//! Per-profile mutual exclusion.
//!
//! [`LockCoordinator::acquire`] opens one session with the lock backend,
//! takes the lock named after the profile id, and hands back a
//! [`ProfileLease`]. The lease owns the session: dropping it releases the
//! key and then closes the session, on every exit path.
//!
//! Operations that touch two profiles take both locks through
//! [`LockCoordinator::acquire_all`], which always acquires in [`LockKey`]
//! order so two callers can never wait on each other.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::retry::{Attempt, CallContext, RetryError, RetryPolicy};
use crate::storage::{LockBackend, LockKey, LockSession, StorageError};

/// Acquires profile locks with bounded retries.
#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    policy: RetryPolicy,
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LockCoordinator {
    /// Creates a coordinator over `backend`.
    pub fn new(backend: Arc<dyn LockBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// The acquisition retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Takes the lock for `profile_id`.
    ///
    /// # Errors
    /// - `LockAcquisition` if the key stayed held for the whole budget
    /// - `Storage` if the backend fails; no further attempts are made
    /// - `Interrupted` if `ctx` is cancelled or its deadline passes
    pub fn acquire(&self, profile_id: &str, ctx: &CallContext) -> Result<ProfileLease, ExecutionError> {
        let key = LockKey::for_profile(profile_id);
        let mut session = self
            .backend
            .open_session()
            .map_err(|e| ExecutionError::storage("open_lock_session", profile_id, e))?;

        let outcome = self.policy.run(ctx, |attempt| match session.try_acquire(&key) {
            Ok(true) => Attempt::Ready(()),
            Ok(false) => {
                debug!(profile_id, attempt, "profile lock busy");
                Attempt::Pending
            }
            Err(e) => Attempt::Abort(e),
        });

        match outcome {
            Ok(()) => {
                debug!(profile_id, "profile lock acquired");
                Ok(ProfileLease {
                    session: Some(session),
                    key,
                })
            }
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(profile_id, attempts, "gave up waiting for profile lock");
                Err(ExecutionError::LockAcquisition {
                    profile_id: profile_id.to_string(),
                    attempts,
                })
            }
            Err(RetryError::Aborted(e)) => {
                Err(ExecutionError::storage("acquire_lock", profile_id, e))
            }
            Err(RetryError::Interrupted { interruption, .. }) => Err(ExecutionError::Interrupted {
                operation: "acquire_lock",
                profile_id: profile_id.to_string(),
                reason: interruption.to_string(),
            }),
        }
    }

    /// Takes the locks for every id in `profile_ids`, in key order.
    ///
    /// Duplicate ids are locked once. On failure the leases already taken
    /// are released before returning.
    ///
    /// # Errors
    /// Same as [`acquire`](Self::acquire), for the first id that fails.
    pub fn acquire_all(
        &self,
        profile_ids: &[&str],
        ctx: &CallContext,
    ) -> Result<Vec<ProfileLease>, ExecutionError> {
        let mut ordered: Vec<&str> = profile_ids.to_vec();
        ordered.sort_by_key(|id| LockKey::for_profile(*id));
        ordered.dedup();

        let mut leases = Vec::with_capacity(ordered.len());
        for profile_id in ordered {
            leases.push(self.acquire(profile_id, ctx)?);
        }
        Ok(leases)
    }
}

/// A held profile lock.
///
/// Released explicitly with [`release`](Self::release) or implicitly on
/// drop.
pub struct ProfileLease {
    session: Option<Box<dyn LockSession>>,
    key: LockKey,
}

impl fmt::Debug for ProfileLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileLease")
            .field("key", &self.key)
            .field("held", &self.session.is_some())
            .finish()
    }
}

impl ProfileLease {
    /// The locked key.
    #[must_use]
    pub const fn key(&self) -> &LockKey {
        &self.key
    }

    /// Releases the lock and closes the session.
    ///
    /// # Errors
    /// Returns the backend error if the release call failed. The session is
    /// closed regardless, which frees the key.
    pub fn release(mut self) -> Result<(), StorageError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), StorageError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let released = session.release(&self.key)?;
        if !released {
            warn!(key = %self.key, "lock was not held at release");
        }
        Ok(())
    }
}

impl Drop for ProfileLease {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(key = %self.key, error = %e, "failed to release profile lock");
        }
    }
}
