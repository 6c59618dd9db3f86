//! Lazy, self-healing broker connections.
//!
//! A [`ConnectionManager`] owns at most one live connection. It is
//! established the first time something needs it and re-established, through
//! the patient [`RetryPolicy::connect`] pipeline, whenever the connection is
//! reported unhealthy or a caller invalidates it after detecting a closed
//! channel. Only errors classified transient by
//! [`QueueError::is_transient`] keep the pipeline going; anything else
//! (bad credentials, misconfiguration) propagates immediately.

use crate::retry::{PipelineError, RetryPolicy, retry_with_predicate};
use std::future::Future;
use std::pin::Pin;
use steadfast_core::queue::QueueError;
use tokio::sync::Mutex;

/// Factory for broker connections.
pub trait Connector: Send + Sync {
    /// The connection/channel type produced.
    type Connection: Clone + Send + Sync;

    /// Establish one connection. Called under the connection pipeline, so a
    /// single invocation should make exactly one attempt.
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Connection, QueueError>> + Send + '_>>;

    /// Cheap liveness check for a cached connection. Implementations that
    /// cannot observe liveness return `true` and rely on callers
    /// invalidating after a failed use.
    fn is_healthy(&self, connection: &Self::Connection) -> bool;
}

/// Caches one connection and re-establishes it on demand.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    current: Mutex<Option<C::Connection>>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager using the standard connect policy.
    pub fn new(connector: C) -> Self {
        Self::with_policy(connector, RetryPolicy::connect())
    }

    /// Create a manager with an explicit connect policy.
    pub fn with_policy(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            current: Mutex::new(None),
        }
    }

    /// Get a live connection, establishing or re-establishing one if
    /// needed. Concurrent callers share a single connect attempt.
    ///
    /// # Errors
    ///
    /// Returns the connection pipeline's terminal failure when the broker
    /// stays unreachable past the policy's budget, or
    /// [`PipelineError::Permanent`] for a non-transient connect error.
    pub async fn get(&self) -> Result<C::Connection, PipelineError<QueueError>> {
        let mut guard = self.current.lock().await;

        if let Some(connection) = guard.as_ref() {
            if self.connector.is_healthy(connection) {
                return Ok(connection.clone());
            }
            tracing::warn!("Cached broker connection unhealthy, reconnecting");
            *guard = None;
        }

        let connection = retry_with_predicate(
            &self.policy,
            || self.connector.connect(),
            QueueError::is_transient,
        )
        .await?;

        tracing::info!("Broker connection established");
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Drop the cached connection so the next [`get`](Self::get)
    /// reconnects. Called after a use of the connection failed with a
    /// transient error.
    pub async fn invalidate(&self) {
        let mut guard = self.current.lock().await;
        if guard.take().is_some() {
            tracing::warn!("Broker connection invalidated");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyConnector {
        attempts: Arc<AtomicUsize>,
        failures_before_success: usize,
    }

    impl Connector for FlakyConnector {
        type Connection = usize;

        fn connect(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Self::Connection, QueueError>> + Send + '_>>
        {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = n < self.failures_before_success;
            Box::pin(async move {
                if fail {
                    Err(QueueError::ConnectionFailed("refused".into()))
                } else {
                    Ok(n)
                }
            })
        }

        fn is_healthy(&self, _connection: &Self::Connection) -> bool {
            true
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::connect()
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn connects_lazily_and_caches() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_policy(
            FlakyConnector {
                attempts: Arc::clone(&attempts),
                failures_before_success: 0,
            },
            fast_policy(),
        );

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        let a = manager.get().await.unwrap();
        let b = manager.get().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn survives_transient_connect_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_policy(
            FlakyConnector {
                attempts: Arc::clone(&attempts),
                failures_before_success: 3,
            },
            fast_policy(),
        );

        manager.get().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn invalidate_forces_reconnect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_policy(
            FlakyConnector {
                attempts: Arc::clone(&attempts),
                failures_before_success: 0,
            },
            fast_policy(),
        );

        manager.get().await.unwrap();
        manager.invalidate().await;
        manager.get().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        type Connection = ();

        fn connect(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Self::Connection, QueueError>> + Send + '_>>
        {
            Box::pin(async {
                Err(QueueError::PublishFailed {
                    queue: String::new(),
                    reason: "sasl authentication failed".into(),
                })
            })
        }

        fn is_healthy(&self, (): &Self::Connection) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn non_transient_errors_propagate_immediately() {
        let manager = ConnectionManager::with_policy(RefusingConnector, fast_policy());
        let result = manager.get().await;
        assert!(matches!(result, Err(PipelineError::Permanent(_))));
    }
}
