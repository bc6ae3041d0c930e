//! In-memory event bus for tests/dev.
//!
//! Honours the durable-group contract: competing consumers on the same
//! (subject, group) split the messages, unacknowledged deliveries reappear
//! after the visibility window with a bumped attempt counter, and a nak
//! requeues immediately.
//!
//! Delivery to a group starts at its first subscription; retaining history
//! for groups that do not exist yet is the durable backend's job.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::bus::{AckDisposition, BusRecvError, BusSubscription, Delivery, EventBus};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

struct QueuedMessage<M> {
    message: M,
    attempt: u32,
}

struct InFlightMessage<M> {
    id: u64,
    message: M,
    attempt: u32,
    deadline: Instant,
}

struct GroupQueue<M> {
    ready: VecDeque<QueuedMessage<M>>,
    in_flight: Vec<InFlightMessage<M>>,
    next_delivery_id: u64,
}

impl<M> Default for GroupQueue<M> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: Vec::new(),
            next_delivery_id: 0,
        }
    }
}

struct GroupState<M> {
    queue: Mutex<GroupQueue<M>>,
    available: Condvar,
}

impl<M> Default for GroupState<M> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(GroupQueue::default()),
            available: Condvar::new(),
        }
    }
}

fn settle<M>(group: &GroupState<M>, delivery_id: u64, disposition: AckDisposition) {
    // Lenient on poisoning: a poisoned group simply stops settling, and the
    // visibility timeout takes over.
    if let Ok(mut queue) = group.queue.lock() {
        if let Some(pos) = queue
            .in_flight
            .iter()
            .position(|entry| entry.id == delivery_id)
        {
            let entry = queue.in_flight.remove(pos);
            if disposition == AckDisposition::Nak {
                queue.ready.push_back(QueuedMessage {
                    message: entry.message,
                    attempt: entry.attempt + 1,
                });
                group.available.notify_one();
            }
        }
    }
}

/// In-memory durable-group pub/sub bus.
pub struct InMemoryEventBus<M> {
    visibility: Duration,
    subjects: Mutex<HashMap<String, HashMap<String, Arc<GroupState<M>>>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Shorter windows make redelivery tests fast.
    pub fn with_visibility_timeout(visibility: Duration) -> Self {
        Self {
            visibility,
            subjects: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;
    type Subscription = InMemorySubscription<M>;

    fn publish(&self, subject: &str, message: M) -> Result<(), Self::Error> {
        let subjects = self
            .subjects
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;

        if let Some(groups) = subjects.get(subject) {
            for group in groups.values() {
                let mut queue = group.queue.lock().map_err(|_| InMemoryBusError::Poisoned)?;
                queue.ready.push_back(QueuedMessage {
                    message: message.clone(),
                    attempt: 1,
                });
                group.available.notify_one();
            }
        }

        Ok(())
    }

    fn subscribe(&self, subject: &str, durable_group: &str) -> Self::Subscription {
        let group = {
            // If the lock is poisoned we still hand out a subscription backed
            // by a fresh group; it just won't receive messages.
            match self.subjects.lock() {
                Ok(mut subjects) => Arc::clone(
                    subjects
                        .entry(subject.to_string())
                        .or_default()
                        .entry(durable_group.to_string())
                        .or_insert_with(|| Arc::new(GroupState::default())),
                ),
                Err(_) => Arc::new(GroupState::default()),
            }
        };

        InMemorySubscription {
            group,
            visibility: self.visibility,
        }
    }
}

/// Handle onto one durable group's shared queue.
pub struct InMemorySubscription<M> {
    group: Arc<GroupState<M>>,
    visibility: Duration,
}

fn next_wakeup<M>(queue: &GroupQueue<M>, deadline: Instant, now: Instant) -> Duration {
    let mut until = deadline;
    for entry in &queue.in_flight {
        if entry.deadline < until {
            until = entry.deadline;
        }
    }
    until
        .saturating_duration_since(now)
        .max(Duration::from_millis(1))
}

impl<M> BusSubscription<M> for InMemorySubscription<M>
where
    M: Clone + Send + 'static,
{
    fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<M>, BusRecvError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self
            .group
            .queue
            .lock()
            .map_err(|_| BusRecvError::Closed)?;

        loop {
            let now = Instant::now();

            // Expired in-flight entries become available again.
            let mut i = 0;
            while i < queue.in_flight.len() {
                if queue.in_flight[i].deadline <= now {
                    let entry = queue.in_flight.remove(i);
                    queue.ready.push_back(QueuedMessage {
                        message: entry.message,
                        attempt: entry.attempt + 1,
                    });
                } else {
                    i += 1;
                }
            }

            if let Some(next) = queue.ready.pop_front() {
                let id = queue.next_delivery_id;
                queue.next_delivery_id += 1;
                queue.in_flight.push(InFlightMessage {
                    id,
                    message: next.message.clone(),
                    attempt: next.attempt,
                    deadline: now + self.visibility,
                });

                let group = Arc::clone(&self.group);
                return Ok(Delivery::new(next.message, next.attempt, move |disposition| {
                    settle(&group, id, disposition)
                }));
            }

            if now >= deadline {
                return Err(BusRecvError::Timeout);
            }

            let wait = next_wakeup(&queue, deadline, now);
            let (guard, _) = self
                .group
                .available
                .wait_timeout(queue, wait)
                .map_err(|_| BusRecvError::Closed)?;
            queue = guard;
        }
    }
}
