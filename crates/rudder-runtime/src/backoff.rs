//! Restart timing for failed controllers.

use std::time::Duration;

/// Backoff for controller restarts: the first restart is immediate, after
/// that the delay doubles from a base until hitting a cap.
pub struct RestartBackoff {
    base: Duration,
    cap: Duration,
    last: Option<Duration>,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            last: None,
        }
    }
}

impl RestartBackoff {
    /// Gets how long to wait before the next restart.
    pub fn next_duration(&mut self) -> Duration {
        let next = match self.last {
            None => Duration::from_secs(0),
            Some(last) if last.is_zero() => self.base,
            Some(last) => std::cmp::min(last * 2, self.cap),
        };

        self.last = Some(next);

        next
    }

    /// Waits the prescribed amount of time.
    pub async fn wait(&mut self) {
        let duration = self.next_duration();

        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_restart_is_immediate() {
        let mut backoff = RestartBackoff::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(0));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = RestartBackoff::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(0));
        assert_eq!(backoff.next_duration(), Duration::from_secs(1));
        assert_eq!(backoff.next_duration(), Duration::from_secs(2));
        assert_eq!(backoff.next_duration(), Duration::from_secs(4));
        assert_eq!(backoff.next_duration(), Duration::from_secs(8));
        assert_eq!(backoff.next_duration(), Duration::from_secs(16));
        assert_eq!(backoff.next_duration(), Duration::from_secs(30));
        assert_eq!(backoff.next_duration(), Duration::from_secs(30));
    }
}
