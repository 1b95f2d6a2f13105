//! Queue wake-up publisher.
//!
//! The server publishes a fire-and-forget notification to [`DEFAULT_SUBJECT`]
//! after every successful `enqueue` so idle worker pools can skip their poll
//! backoff. Strictly a latency optimization: a worker that misses the
//! message (or never subscribed) still finds the job on its next `lease`
//! poll, so this uses core NATS pub/sub rather than JetStream — no
//! stream/consumer bookkeeping, no redelivery, nothing to reconcile.

use std::sync::Arc;

/// Subject the server publishes to and workers optionally subscribe to.
pub const DEFAULT_SUBJECT: &str = "noetl.queue.wake";

/// Publishes queue wake-up notifications.
#[derive(Clone)]
pub struct NatsPublisher {
    client: Arc<async_nats::Client>,
    subject: String,
}

impl NatsPublisher {
    pub fn new(client: Arc<async_nats::Client>) -> Self {
        Self {
            client,
            subject: DEFAULT_SUBJECT.to_string(),
        }
    }

    /// Publish a wake-up notification. Failures are the caller's to decide
    /// how to treat (logging-only is the usual choice, since this never
    /// affects correctness).
    pub async fn publish_wake(&self) -> Result<(), async_nats::PublishError> {
        self.client.publish(self.subject.clone(), "".into()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_subject_is_stable() {
        assert_eq!(DEFAULT_SUBJECT, "noetl.queue.wake");
    }
}
