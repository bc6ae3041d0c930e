//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the transport between worker roles. It makes few assumptions:
//!
//! - **Transport-agnostic**: in-memory queues, Redis Streams, NATS JetStream.
//! - **At-least-once per durable group**: a message counts as delivered only
//!   once a consumer acknowledges it; an unacknowledged delivery becomes
//!   visible again after the implementation's visibility window and is
//!   redelivered to any live consumer in the group.
//! - **Per-subject order, until redelivery**: payload order is preserved per
//!   subject per publisher, but there is no cross-subject ordering and a
//!   nak/timeout can reorder within a subject.
//!
//! Duplicate delivery is therefore *normal*, not exceptional; every consumer
//! must be idempotent against the state store, never against worker memory.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// How a consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Processing finished; remove the message from the group's pending set.
    Ack,
    /// Processing failed; make the message immediately available again.
    Nak,
}

/// One delivery of a message to one consumer in a durable group.
///
/// Dropping a delivery without settling it is safe: the message stays
/// pending and redelivers after the visibility window — the same path a
/// crashed consumer takes.
pub struct Delivery<M> {
    message: M,
    attempt: u32,
    responder: Option<Box<dyn FnOnce(AckDisposition) + Send>>,
}

impl<M> Delivery<M> {
    pub fn new(
        message: M,
        attempt: u32,
        responder: impl FnOnce(AckDisposition) + Send + 'static,
    ) -> Self {
        Self {
            message,
            attempt,
            responder: Some(Box::new(responder)),
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    /// Delivery attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ack(mut self) {
        if let Some(respond) = self.responder.take() {
            respond(AckDisposition::Ack);
        }
    }

    pub fn nak(mut self) {
        if let Some(respond) = self.responder.take() {
            respond(AckDisposition::Nak);
        }
    }
}

impl<M: core::fmt::Debug> core::fmt::Debug for Delivery<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Receive-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusRecvError {
    #[error("no message within the timeout")]
    Timeout,
    #[error("subscription closed")]
    Closed,
}

/// A durable-group subscription: competing consumers created with the same
/// (subject, group) share acknowledgment state and split the messages.
pub trait BusSubscription<M>: Send {
    /// Block for up to `timeout` waiting for the next delivery.
    fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<M>, BusRecvError>;
}

/// Durable, ordered-per-subject publish/subscribe transport.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;
    type Subscription: BusSubscription<M> + 'static;

    fn publish(&self, subject: &str, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self, subject: &str, durable_group: &str) -> Self::Subscription;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M>,
{
    type Error = B::Error;
    type Subscription = B::Subscription;

    fn publish(&self, subject: &str, message: M) -> Result<(), Self::Error> {
        (**self).publish(subject, message)
    }

    fn subscribe(&self, subject: &str, durable_group: &str) -> Self::Subscription {
        (**self).subscribe(subject, durable_group)
    }
}
