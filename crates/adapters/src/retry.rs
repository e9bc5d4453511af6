use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::AdapterError;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub sleep: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, sleep: Duration) -> Self {
        Self {
            max_attempts,
            sleep,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            sleep: Duration::from_secs(2),
        }
    }
}

pub fn call_with_retry<F, T>(mut f: F, policy: &RetryPolicy) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("[call_with_retry] attempt {attempt}/{attempts} failed: {err}");
                if attempt < attempts {
                    thread::sleep(policy.sleep);
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(attempts, err))
}
