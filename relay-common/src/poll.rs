// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::{DEFAULT_POLL_INTERVAL_SECONDS, DEFAULT_POLL_MAX_ATTEMPTS};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

impl PollPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: std::env::var("POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            max_attempts: std::env::var("POLL_MAX_ATTEMPTS")
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(defaults.max_attempts),
        }
    }

    /// Upper bound on time spent sleeping inside one `poll_until` call.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Converged(T),
    /// The attempt budget ran out; carries the last observed value.
    Exhausted(T),
}

/// Fetches once, then keeps sleeping and re-fetching until `is_done` holds or
/// `max_attempts` re-fetches have been spent. Fetch errors end the poll.
pub async fn poll_until<T, E, F, Fut, P>(
    policy: PollPolicy,
    sleeper: &dyn Sleeper,
    mut fetch: F,
    is_done: P,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let mut current = fetch().await?;
    let mut attempt = 0;

    loop {
        if is_done(&current) {
            return Ok(PollOutcome::Converged(current));
        }
        if attempt >= policy.max_attempts {
            return Ok(PollOutcome::Exhausted(current));
        }

        sleeper.sleep(policy.interval).await;
        current = fetch().await?;
        attempt += 1;
        debug!(attempt, max_attempts = policy.max_attempts, "poll attempt finished");
    }
}
