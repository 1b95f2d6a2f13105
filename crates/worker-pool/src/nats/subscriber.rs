//! Best-effort wake-up signal for the lease-poll loop. Purely an
//! optimization: polling alone is already correct, this just shortens the
//! gap between an enqueue and the next lease attempt. Core NATS pub/sub,
//! no JetStream — a dropped wake-up just means the worker notices new work
//! on its next poll tick instead of immediately.

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::mpsc;

/// Subject the control plane publishes to after every successful enqueue.
pub const WAKE_SUBJECT: &str = "noetl.queue.wake";

/// Subscribes to [`WAKE_SUBJECT`] and forwards a wake signal to `tx` for
/// every message received. Runs until the connection drops.
pub async fn run_wake_listener(nats_url: &str, tx: mpsc::Sender<()>) -> Result<()> {
    let client = async_nats::connect(nats_url).await?;
    let mut subscriber = client.subscribe(WAKE_SUBJECT).await?;

    tracing::info!(url = %nats_url, subject = WAKE_SUBJECT, "subscribed to queue wake-up notifications");

    while subscriber.next().await.is_some() {
        // A full channel means a wake is already pending; dropping this one
        // is harmless, the poll loop will pick up everything on its next pass.
        let _ = tx.try_send(());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_subject_is_stable() {
        assert_eq!(WAKE_SUBJECT, "noetl.queue.wake");
    }
}
