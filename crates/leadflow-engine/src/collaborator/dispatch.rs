//! Recorded outbound dispatch.
//!
//! [`RecordedDispatch`] is the only writer of `message_sent` and
//! `message_delivery_failed` events. Each event's dedupe key is
//! `<correlation_ref>:<provider_message_id>`, so a replayed receipt for the
//! same physical send is stored once, and a correlation ref that already has
//! a successful send is not sent again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use leadflow_core::events::{Event, EventType};
use leadflow_core::types::{Destination, Timestamp};
use leadflow_storage::EventRepository;

use crate::error::ExecutionError;

use super::{with_timeout, DeliveryStatus, DispatchChannel, DispatchReceipt};

/// Result of a recorded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(DispatchReceipt),
    /// A successful send for this correlation ref is already on record.
    AlreadySent,
}

pub struct RecordedDispatch {
    channel: Arc<dyn DispatchChannel>,
    events: Arc<EventRepository>,
    timeout: Duration,
}

impl RecordedDispatch {
    pub fn new(
        channel: Arc<dyn DispatchChannel>,
        events: Arc<EventRepository>,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            events,
            timeout,
        }
    }

    /// Send `content` to `destination` on behalf of `subject_id`.
    ///
    /// A provider-reported failure is recorded as `message_delivery_failed`
    /// and returned as [`ExecutionError::Delivery`]. Transport errors
    /// (timeouts, rate limits) record nothing: no physical send is known to
    /// have happened.
    pub async fn send(
        &self,
        subject_id: Uuid,
        destination: &Destination,
        content: &str,
        correlation_ref: &str,
    ) -> Result<Delivery, ExecutionError> {
        if self.events.has_sent(correlation_ref)? {
            info!(subject_id = %subject_id, correlation_ref, "Send already recorded, skipping");
            return Ok(Delivery::AlreadySent);
        }

        let receipt = with_timeout(
            self.timeout,
            self.channel.send(destination, content, correlation_ref),
        )
        .await?;

        let event_type = match receipt.status {
            DeliveryStatus::Delivered => EventType::MessageSent,
            DeliveryStatus::Failed => EventType::MessageDeliveryFailed,
        };
        let event = Event::new(subject_id, event_type, Timestamp::now())
            .with_metadata("correlation_ref", correlation_ref)
            .with_metadata("destination", destination.to_string())
            .with_metadata("provider_status", receipt.provider_status.clone())
            .with_metadata("provider_message_id", receipt.provider_message_id.clone())
            .with_dedupe_key(format!(
                "{}:{}",
                correlation_ref, receipt.provider_message_id
            ));
        let recorded = self.events.append(&event)?;

        match receipt.status {
            DeliveryStatus::Delivered => {
                info!(
                    subject_id = %subject_id,
                    correlation_ref,
                    provider_message_id = %receipt.provider_message_id,
                    recorded,
                    "Message dispatched"
                );
                Ok(Delivery::Sent(receipt))
            }
            DeliveryStatus::Failed => {
                warn!(
                    subject_id = %subject_id,
                    correlation_ref,
                    provider_status = %receipt.provider_status,
                    "Message delivery failed"
                );
                Err(ExecutionError::Delivery(format!(
                    "{} reported {}",
                    destination, receipt.provider_status
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::mock::MockDispatch;
    use crate::error::CollaboratorError;
    use leadflow_storage::Database;

    fn setup(channel: Arc<MockDispatch>) -> (RecordedDispatch, Arc<EventRepository>) {
        let events = Arc::new(EventRepository::new(Arc::new(
            Database::in_memory().unwrap(),
        )));
        (
            RecordedDispatch::new(channel, Arc::clone(&events), Duration::from_secs(1)),
            events,
        )
    }

    fn sms() -> Destination {
        Destination::Sms("5550102030".to_string())
    }

    #[tokio::test]
    async fn test_send_records_one_event() {
        let channel = Arc::new(MockDispatch::new());
        let (dispatch, events) = setup(Arc::clone(&channel));
        let lead = Uuid::new_v4();

        let delivery = dispatch.send(lead, &sms(), "hello", "appr-1").await.unwrap();
        assert!(matches!(delivery, Delivery::Sent(_)));

        let timeline = events.list_for_subject(lead).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_type, EventType::MessageSent);
        assert_eq!(timeline[0].metadata["correlation_ref"], "appr-1");
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_second_send_for_same_ref_is_skipped() {
        let channel = Arc::new(MockDispatch::new());
        let (dispatch, events) = setup(Arc::clone(&channel));
        let lead = Uuid::new_v4();

        dispatch.send(lead, &sms(), "hello", "appr-1").await.unwrap();
        let again = dispatch.send(lead, &sms(), "hello", "appr-1").await.unwrap();

        assert_eq!(again, Delivery::AlreadySent);
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(
            events.count_for_subject(lead, EventType::MessageSent).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_replayed_receipt_is_recorded_once() {
        // The provider reports the same message id for a second send with
        // the same correlation ref, e.g. its own idempotency layer.
        let channel = Arc::new(MockDispatch::with_fixed_message_id("prov-42"));
        let (dispatch, events) = setup(Arc::clone(&channel));
        let lead = Uuid::new_v4();

        let (dest_a, dest_b) = (sms(), sms());
        let (a, b) = tokio::join!(
            dispatch.send(lead, &dest_a, "hello", "appr-1"),
            dispatch.send(lead, &dest_b, "hello", "appr-1"),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(
            events.count_for_subject(lead, EventType::MessageSent).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_delivery_recorded_and_returned() {
        let channel = Arc::new(MockDispatch::failing_delivery("undeliverable"));
        let (dispatch, events) = setup(channel);
        let lead = Uuid::new_v4();

        let err = dispatch.send(lead, &sms(), "hello", "appr-1").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Delivery(_)));
        assert_eq!(
            events
                .count_for_subject(lead, EventType::MessageDeliveryFailed)
                .unwrap(),
            1
        );
        // A failed delivery does not block a later retry.
        assert!(!events.has_sent("appr-1").unwrap());
    }

    #[tokio::test]
    async fn test_transport_error_records_nothing() {
        let channel = Arc::new(MockDispatch::erroring(CollaboratorError::RateLimited));
        let (dispatch, events) = setup(channel);
        let lead = Uuid::new_v4();

        let err = dispatch.send(lead, &sms(), "hello", "appr-1").await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Collaborator(CollaboratorError::RateLimited)
        ));
        assert!(events.list_for_subject(lead).unwrap().is_empty());
    }
}
