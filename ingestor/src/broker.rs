//! Per-device broadcast groups.
//!
//! Every open subscription owns a bounded queue; the broker keeps the sending half of each
//! queue in the group named after the device. Publishing never waits on a subscriber: a full
//! queue drops the message for that subscriber only.

use crate::metrics::{ACTIVE_SUBSCRIBERS, PUBLISHED_TOTAL, SUBSCRIBER_DROPS_TOTAL};
use crate::model::{DeviceId, TelemetryRecord};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker is unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        SubscriberId(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The broker's side of one subscriber: an id plus the sender into its queue.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    tx: mpsc::Sender<TelemetryRecord>,
}

impl SubscriberHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

/// Outcome of a single publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

type Members = HashMap<SubscriberId, mpsc::Sender<TelemetryRecord>>;

#[derive(Default)]
struct Groups {
    closed: bool,
    by_device: HashMap<DeviceId, Members>,
}

pub struct Broker {
    groups: RwLock<Groups>,
    queue_capacity: usize,
}

impl Broker {
    pub fn new(queue_capacity: usize) -> Self {
        Broker {
            groups: RwLock::new(Groups::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Creates a fresh subscriber queue. The handle is not a member of any group yet.
    pub fn handle(&self) -> (SubscriberHandle, mpsc::Receiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        (
            SubscriberHandle {
                id: SubscriberId::new(),
                tx,
            },
            rx,
        )
    }

    /// Adds `handle` to the group, creating the group if needed. Joining twice is a no-op.
    pub fn join(&self, group: &DeviceId, handle: &SubscriberHandle) -> Result<(), BrokerError> {
        let mut groups = self.write();
        if groups.closed {
            return Err(BrokerError::Unavailable);
        }

        groups
            .by_device
            .entry(group.clone())
            .or_default()
            .insert(handle.id, handle.tx.clone());

        debug!(device_id = %group, subscriber = %handle.id, "joined group");
        Ok(())
    }

    /// Removes the subscriber from the group. Unknown groups and subscribers are ignored.
    /// An emptied group is discarded.
    pub fn leave(&self, group: &DeviceId, id: SubscriberId) {
        let mut groups = self.write();

        let emptied = match groups.by_device.get_mut(group) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };

        if emptied {
            groups.by_device.remove(group);
        }

        debug!(device_id = %group, subscriber = %id, "left group");
    }

    /// Delivers `record` to every current member of the group without blocking.
    pub fn publish(
        &self,
        group: &DeviceId,
        record: &TelemetryRecord,
    ) -> Result<Delivery, BrokerError> {
        let groups = self.read();
        if groups.closed {
            return Err(BrokerError::Unavailable);
        }

        let mut delivery = Delivery::default();
        let Some(members) = groups.by_device.get(group) else {
            return Ok(delivery);
        };

        for (id, tx) in members {
            match tx.try_send(record.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    SUBSCRIBER_DROPS_TOTAL.inc();
                    warn!(
                        device_id = %group,
                        subscriber = %id,
                        category = record.category().as_str(),
                        "subscriber queue full, dropping message"
                    );
                }
                // Receiver is gone and its leave is about to run
                Err(TrySendError::Closed(_)) => delivery.dropped += 1,
            }
        }

        PUBLISHED_TOTAL.inc();
        Ok(delivery)
    }

    /// Joins a new subscriber to `group` and returns its receiving end. Dropping the
    /// returned [`Subscription`] leaves the group.
    pub fn subscribe(self: &Arc<Self>, group: DeviceId) -> Result<Subscription, BrokerError> {
        let (handle, rx) = self.handle();
        self.join(&group, &handle)?;
        ACTIVE_SUBSCRIBERS.inc();

        Ok(Subscription {
            rx,
            membership: Membership {
                broker: Arc::clone(self),
                group,
                id: handle.id(),
            },
        })
    }

    pub fn member_count(&self, group: &DeviceId) -> usize {
        self.read().by_device.get(group).map_or(0, HashMap::len)
    }

    pub fn group_count(&self) -> usize {
        self.read().by_device.len()
    }

    /// Shuts the broker down. All groups are dropped, which ends every subscription's
    /// stream; later joins and publishes fail with [`BrokerError::Unavailable`].
    pub fn close(&self) {
        let mut groups = self.write();
        groups.closed = true;
        let dropped = groups.by_device.len();
        groups.by_device.clear();
        info!(groups = dropped, "broker closed");
    }

    fn read(&self) -> RwLockReadGuard<'_, Groups> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Groups> {
        self.groups.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Group membership held by one connection. Leaves the group when dropped.
struct Membership {
    broker: Arc<Broker>,
    group: DeviceId,
    id: SubscriberId,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.broker.leave(&self.group, self.id);
        ACTIVE_SUBSCRIBERS.dec();
    }
}

/// A joined subscriber: the receiving end of its queue plus the membership guard.
pub struct Subscription {
    rx: mpsc::Receiver<TelemetryRecord>,
    membership: Membership,
}

impl Subscription {
    /// Next published record, or `None` once the broker dropped this subscriber's group.
    pub async fn recv(&mut self) -> Option<TelemetryRecord> {
        self.rx.recv().await
    }

    pub fn id(&self) -> SubscriberId {
        self.membership.id
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<TelemetryRecord> {
        self.rx.try_recv().ok()
    }
}
