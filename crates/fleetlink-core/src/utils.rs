/*!
 * Timing helpers shared by every transport.
 */
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::{self, Instant as TokioInstant};
use tracing::debug;

use crate::error::Error;

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `what` - Short description of the operation, used in the timeout message
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error naming `what`
pub async fn with_timeout<F, T, E>(duration: Duration, what: &str, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error>,
{
    match time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => {
            debug!("{} timed out after {:?}", what, duration);
            Err(Error::timeout(format!("{} timed out after {} ms", what, duration.as_millis())).into())
        }
    }
}

/// Milliseconds elapsed since `start`, saturating
pub fn elapsed_millis(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Which bound of a [`Deadline`] fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The overall bound elapsed
    Overall,
    /// The inactivity window elapsed
    Idle,
}

/// A restartable deadline: an overall bound plus an optional inactivity window.
///
/// The idle window is armed by the first [`Deadline::touch`] and restarted by
/// every later one; until then only the overall bound applies.
#[derive(Debug, Clone)]
pub struct Deadline {
    overall: TokioInstant,
    idle: Option<Duration>,
    idle_at: Option<TokioInstant>,
}

impl Deadline {
    /// A deadline with only an overall bound
    pub fn new(overall: Duration) -> Self {
        Self {
            overall: TokioInstant::now() + overall,
            idle: None,
            idle_at: None,
        }
    }

    /// A deadline with an overall bound and an inactivity window
    pub fn with_idle(overall: Duration, idle: Duration) -> Self {
        Self {
            idle: Some(idle),
            ..Self::new(overall)
        }
    }

    /// Record activity, restarting the inactivity window
    pub fn touch(&mut self) {
        if let Some(idle) = self.idle {
            self.idle_at = Some(TokioInstant::now() + idle);
        }
    }

    /// The instant at which the earliest armed bound fires
    pub fn expires_at(&self) -> TokioInstant {
        match self.idle_at {
            Some(idle_at) if idle_at < self.overall => idle_at,
            _ => self.overall,
        }
    }

    /// Time left before the deadline fires
    pub fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(TokioInstant::now())
    }

    /// True once either bound has passed
    pub fn is_expired(&self) -> bool {
        TokioInstant::now() >= self.expires_at()
    }

    /// Sleep until the deadline fires and report which bound did
    pub async fn wait(&self) -> Expiry {
        let at = self.expires_at();
        time::sleep_until(at).await;
        if self.idle_at == Some(at) && at < self.overall {
            Expiry::Idle
        } else {
            Expiry::Overall
        }
    }
}
