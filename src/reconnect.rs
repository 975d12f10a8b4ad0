use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use log::{debug, warn};

use crate::transport::{Result, SourceMessage, Transport, TransportError};

/// Backoff schedule for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries without bound.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (0-based): base * 2^attempt,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = match 1u32.checked_shl(attempt) {
            Some(factor) => factor,
            None => return self.max_delay,
        };
        self.base_delay
            .checked_mul(factor)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.map_or(false, |max| attempt >= max)
    }
}

/// Retry envelope around a [`Transport`].
///
/// Transient failures trigger backoff, reconnect, and re-selection of the
/// folder that was selected before the failure. The attempt counter resets
/// on every successful operation. The wrapper never deduplicates: resume
/// safety stays with the caller's checkpoint.
pub struct Reconnecting<T: Transport> {
    inner: T,
    policy: RetryPolicy,
    selected: Option<String>,
}

impl<T: Transport> Reconnecting<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Reconnecting {
            inner,
            policy,
            selected: None,
        }
    }

    fn run<R>(&mut self, mut op: impl FnMut(&mut T) -> Result<R>) -> Result<R> {
        let mut attempt = 0;
        loop {
            let err = match op(&mut self.inner) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };
            if self.policy.exhausted(attempt) {
                return Err(TransportError::RetriesExhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
            let delay = self.policy.delay_for(attempt);
            warn!("{}, retrying in {:?}", err, delay);
            thread::sleep(delay);
            attempt += 1;
            if let Err(err) = self.reestablish() {
                if !err.is_transient() {
                    return Err(err);
                }
                debug!("reconnect attempt failed: {}", err);
            }
        }
    }

    fn reestablish(&mut self) -> Result<()> {
        self.inner.reconnect()?;
        if let Some(folder) = self.selected.clone() {
            self.inner.select_folder(&folder)?;
        }
        Ok(())
    }

    pub fn list_folders(&mut self) -> Result<Vec<String>> {
        self.run(|t| t.list_folders())
    }

    pub fn select_folder(&mut self, folder: &str) -> Result<u32> {
        let count = self.run(|t| t.select_folder(folder))?;
        self.selected = Some(folder.to_string());
        Ok(count)
    }

    pub fn fetch_message(&mut self, index: u32) -> Result<SourceMessage> {
        self.run(|t| t.fetch_message(index))
    }

    pub fn create_folder(&mut self, folder: &str) -> Result<()> {
        self.run(|t| t.create_folder(folder))
    }

    pub fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        flags: &[String],
        internal_date: DateTime<FixedOffset>,
    ) -> Result<()> {
        self.run(|t| t.append(folder, body, flags, internal_date))
    }
}
