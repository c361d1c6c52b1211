//! Connectivity wait with exponential backoff.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use warmpool_state::Instance;

use crate::client::AgentClient;
use crate::error::{AgentError, AgentResult};

/// Exponential backoff: doubles after every failure up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
        }
    }

    /// The wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Probe the agent until it answers healthy or `deadline` elapses.
///
/// Returns the number of attempts it took.
pub async fn wait_healthy(
    client: &dyn AgentClient,
    instance: &Instance,
    deadline: Duration,
) -> AgentResult<u32> {
    let started = Instant::now();
    let mut backoff = Backoff::default();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let err = match client.health(instance).await {
            Ok(()) => {
                debug!(instance = %instance.id, attempts, "agent healthy");
                return Ok(attempts);
            }
            Err(e) => e,
        };

        let elapsed = started.elapsed();
        if elapsed >= deadline {
            warn!(
                instance = %instance.id,
                attempts,
                ?elapsed,
                error = %err,
                "agent never became healthy"
            );
            return Err(AgentError::Unreachable {
                attempts,
                elapsed,
                last: err.to_string(),
            });
        }

        let delay = backoff.next_delay().min(deadline - elapsed);
        debug!(instance = %instance.id, attempts, ?delay, error = %err, "agent not ready");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use warmpool_core::Platform;
    use warmpool_state::InstanceState;

    use super::*;

    /// Fails the first `failures` probes.
    struct FlakyAgent {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentClient for FlakyAgent {
        async fn health(&self, _instance: &Instance) -> AgentResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(AgentError::Status(503))
            } else {
                Ok(())
            }
        }

        async fn suspend(&self, _instance: &Instance) -> AgentResult<()> {
            Ok(())
        }
    }

    fn instance() -> Instance {
        Instance {
            id: "i-1".to_string(),
            name: "vm".to_string(),
            node_id: None,
            pool: "pool".to_string(),
            provider: "fake".to_string(),
            zone: String::new(),
            region: String::new(),
            size: String::new(),
            image: String::new(),
            platform: Platform::default(),
            variant_id: "default".to_string(),
            address: "10.0.0.1".to_string(),
            port: 9079,
            ca_cert: String::new(),
            ca_key: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            state: InstanceState::Created,
            is_hibernated: false,
            started: 0,
            updated: 0,
            owner_id: String::new(),
            stage: String::new(),
            runner_name: "runner".to_string(),
            storage_identifier: String::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_through_failures() {
        let agent = FlakyAgent {
            failures: 3,
            calls: AtomicU32::new(0),
        };
        let started = Instant::now();
        let attempts = wait_healthy(&agent, &instance(), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(attempts, 4);
        // 1s + 2s + 4s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let agent = FlakyAgent {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let started = Instant::now();
        let err = wait_healthy(&agent, &instance(), Duration::from_secs(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unreachable { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
    }
}
