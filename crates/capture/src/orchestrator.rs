//! Startup retry loop
//!
//! Each attempt runs discover → activate → stream. A run that ends because the
//! stream was cancelled counts as success; anything else is a failed attempt.
//! After `max_attempts` consecutive failures the loop gives up with
//! [`StartError::RetriesExhausted`], which the binary treats as fatal.

use crate::config::StartupSettings;
use crate::sink::SinkError;
use crate::usb::{ActivationError, CatalogError, ClaimError, RunSummary, StreamError};
use common::ShutdownSubscription;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("No device found{}", with_udid(udid))]
    NotFound { udid: Option<String> },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Activation failed: {0}")]
    Activation(#[from] ActivationError),

    #[error("Claim failed: {0}")]
    Claim(#[from] ClaimError),

    #[error("Streaming failed: {0}")]
    Stream(#[from] StreamError),

    #[error("Sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Attempt task failed: {0}")]
    Task(String),

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<StartError>,
    },
}

fn with_udid(udid: &Option<String>) -> String {
    udid.as_ref()
        .map(|u| format!(" with UDID {}", u))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StartupSettings::default())
    }
}

impl From<&StartupSettings> for RetryPolicy {
    fn from(settings: &StartupSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            delay: settings.retry_delay(),
        }
    }
}

/// How the retry loop ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// An attempt streamed and ended through cancellation
    Streamed { attempt: u32, summary: RunSummary },
    /// Shutdown arrived while waiting to retry
    Interrupted { attempts: u32 },
}

/// One discover → activate → stream attempt
pub trait StartAttempt {
    fn attempt(&mut self, attempt: u32)
    -> impl Future<Output = Result<RunSummary, StartError>> + Send;
}

/// Run attempts until one succeeds, shutdown arrives between attempts, or
/// `max_attempts` have failed
///
/// Takes one copy from `shutdown` when it ends the loop during a retry delay.
pub async fn start_with_retry<A: StartAttempt>(
    policy: RetryPolicy,
    shutdown: &ShutdownSubscription,
    attempt: &mut A,
) -> Result<StartOutcome, StartError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for n in 1..=max_attempts {
        info!("Attempt {} to start streaming", n);

        match attempt.attempt(n).await {
            Ok(summary) => {
                return Ok(StartOutcome::Streamed {
                    attempt: n,
                    summary,
                });
            }
            Err(e) => {
                warn!(attempt = n, max_attempts, "Start attempt failed: {}", e);
                last_error = Some(e);
            }
        }

        if n == max_attempts {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            Some(reason) = shutdown.recv() => {
                info!(%reason, "Shutdown during retry delay");
                return Ok(StartOutcome::Interrupted { attempts: n });
            }
        }
    }

    Err(StartError::RetriesExhausted {
        attempts: max_attempts,
        last: Box::new(last_error.unwrap_or(StartError::NotFound { udid: None })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_not_found_display() {
        let err = StartError::NotFound {
            udid: Some("abc".to_string()),
        };
        assert_eq!(err.to_string(), "No device found with UDID abc");
        assert_eq!(
            StartError::NotFound { udid: None }.to_string(),
            "No device found"
        );
    }
}
