use {
    async_trait::async_trait,
    aws_sdk_sqs::types::QueueAttributeName,
    thiserror::Error,
    tracing::instrument,
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue receive failed: {0}")]
    Receive(String),

    #[error("Queue delete failed: {0}")]
    Delete(String),

    #[error("Queue attributes unavailable: {0}")]
    Attributes(String),
}

/// A message leased from the queue. The lease lasts for the visibility
/// timeout passed to `receive`; deleting before it lapses settles the
/// message, anything else returns it to the queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub visible: u64,
    pub delayed: u64,
    pub not_visible: u64,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn receive(
        &self,
        batch_size: i32,
        wait_seconds: i32,
        visibility_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    #[instrument(skip(self))]
    async fn receive(
        &self,
        batch_size: i32,
        wait_seconds: i32,
        visibility_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(batch_size)
            .wait_time_seconds(wait_seconds)
            .visibility_timeout(visibility_seconds)
            .send()
            .await
            .map_err(|e| QueueError::Receive(e.to_string()))?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| {
                Some(QueueMessage {
                    message_id: message.message_id?,
                    receipt_handle: message.receipt_handle?,
                    body: message.body?,
                })
            })
            .collect())
    }

    #[instrument(skip_all)]
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Attributes(e.to_string()))?;

        let attributes = output.attributes.unwrap_or_default();
        let count = |name: &QueueAttributeName| {
            attributes
                .get(name)
                .and_then(|value| value.parse().ok())
                .unwrap_or(0)
        };

        Ok(QueueStats {
            visible: count(&QueueAttributeName::ApproximateNumberOfMessages),
            delayed: count(&QueueAttributeName::ApproximateNumberOfMessagesDelayed),
            not_visible: count(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
        })
    }
}
