//! One-shot session recovery for auth-class failures.
//!
//! Kept apart from [`RetryPolicy`](super::RetryPolicy): a refresh is attempted
//! exactly once per recovery, and a failed refresh clears the cached session
//! instead of looping.

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Access to the application's cached session.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Exchange the refresh credential for a new session.
    async fn refresh_session(&self) -> Result<()>;

    /// Drop any cached session state so the user must sign in again.
    async fn clear_session(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// This call performed a successful refresh.
    Refreshed,
    /// Another caller refreshed while this one waited; nothing was attempted.
    AlreadyRecovered,
}

/// Serializes recoveries so concurrent auth failures share one refresh.
pub struct SessionRecovery {
    provider: Arc<dyn SessionProvider>,
    generation: AtomicU64,
    // Held across the refresh. Stores the latest attempt's outcome, `None`
    // before the first attempt.
    last_outcome: Mutex<Option<std::result::Result<(), String>>>,
}

impl SessionRecovery {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            provider,
            generation: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
        }
    }

    /// Number of completed recovery attempts, successful or not.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Attempt exactly one refresh.
    ///
    /// `observed_generation` is the [`generation`](Self::generation) seen when
    /// the failing call started. If an attempt has completed since, its
    /// outcome is shared and nothing is attempted. On refresh failure the
    /// session is cleared and `Error::ReauthenticationRequired` is returned.
    pub async fn recover(&self, observed_generation: u64) -> Result<RecoveryOutcome> {
        let mut last = self.last_outcome.lock().await;
        if self.generation() != observed_generation {
            return match &*last {
                Some(Err(message)) => Err(Error::ReauthenticationRequired {
                    message: message.clone(),
                }),
                _ => Ok(RecoveryOutcome::AlreadyRecovered),
            };
        }

        let outcome = self.provider.refresh_session().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                *last = Some(Ok(()));
                info!("session refreshed after auth failure");
                Ok(RecoveryOutcome::Refreshed)
            }
            Err(e) => {
                warn!("session refresh failed, clearing session: {}", e);
                self.provider.clear_session().await;
                let message = e.to_string();
                *last = Some(Err(message.clone()));
                Err(Error::ReauthenticationRequired { message })
            }
        }
    }
}
