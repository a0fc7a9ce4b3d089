//! Visibility heartbeat: while a handler runs, cooperatively extend a
//! message's visibility timeout so the broker doesn't redeliver it out from
//! under an in-flight handler.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_sqs::Client;
use tokio::sync::Notify;
use tracing::warn;

pub struct Heartbeat {
    cancel: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
    client: Client,
    queue_url: String,
    receipt_handle: String,
    visibility_timeout_seconds: i32,
}

impl Heartbeat {
    pub fn spawn(
        client: Client,
        queue_url: String,
        receipt_handle: String,
        interval: Duration,
        visibility_timeout_seconds: i32,
    ) -> Self {
        let cancel = Arc::new(Notify::new());
        let cancel_inner = cancel.clone();
        let task_client = client.clone();
        let task_queue_url = queue_url.clone();
        let task_receipt_handle = receipt_handle.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = task_client
                            .change_message_visibility()
                            .queue_url(&task_queue_url)
                            .receipt_handle(&task_receipt_handle)
                            .visibility_timeout(visibility_timeout_seconds)
                            .send()
                            .await
                        {
                            warn!(error = %e, "visibility heartbeat extension failed");
                        }
                    }
                    _ = cancel_inner.notified() => break,
                }
            }
        });

        Self {
            cancel,
            handle,
            client,
            queue_url,
            receipt_handle,
            visibility_timeout_seconds,
        }
    }

    /// Cancel the background extender and make one best-effort final
    /// extension, covering the gap between the handler returning and the
    /// caller's own delete/requeue/visibility-lapse decision.
    pub async fn stop(self) {
        self.cancel.notify_one();
        self.handle.abort();
        let _ = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(self.visibility_timeout_seconds)
            .send()
            .await;
    }
}
