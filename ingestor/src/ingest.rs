use crate::broker::{Broker, BrokerError, Delivery};
use crate::errors::Result;
use crate::metrics::BROKER_FAILURES_TOTAL;
use crate::model::{Category, TelemetryRecord};
use crate::store::TelemetryStore;
use std::sync::Arc;
use tracing::{debug, error};

/// Persists validated records and publishes them to the device's group.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn TelemetryStore>,
    broker: Arc<Broker>,
    persist_actuator_events: bool,
}

/// What happened after a record was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub persisted: bool,
    pub published: std::result::Result<Delivery, BrokerError>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        broker: Arc<Broker>,
        persist_actuator_events: bool,
    ) -> Self {
        Self {
            store,
            broker,
            persist_actuator_events,
        }
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Writes `record` to the store (unless it is an actuator event and those are not
    /// persisted), then publishes it. A failed write returns before anything is published.
    /// A failed publish does not fail the call: the record is already durable, so the
    /// failure is logged, counted and returned in [`Ingested::published`].
    pub async fn ingest(&self, record: TelemetryRecord) -> Result<Ingested> {
        let persist =
            record.category() != Category::Actuator || self.persist_actuator_events;

        if persist {
            self.store.insert(&record).await?;
        }

        let published = self.broker.publish(record.device_id(), &record);
        match &published {
            Ok(delivery) => debug!(
                device_id = %record.device_id(),
                category = record.category().as_str(),
                delivered = delivery.delivered,
                dropped = delivery.dropped,
                "record published"
            ),
            Err(e) => {
                BROKER_FAILURES_TOTAL.inc();
                error!(
                    device_id = %record.device_id(),
                    category = record.category().as_str(),
                    persisted = persist,
                    "failed to publish record: {}",
                    e
                );
            }
        }

        Ok(Ingested {
            persisted: persist,
            published,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::{ActuatorEvent, DeviceId, SensorFields, SensorReading};
    use crate::store::InMemoryTelemetryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FailingStore;

    #[async_trait]
    impl TelemetryStore for FailingStore {
        async fn insert(&self, _record: &TelemetryRecord) -> Result<()> {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }

        async fn latest(
            &self,
            _device_id: &DeviceId,
            _category: Category,
        ) -> Result<Option<TelemetryRecord>> {
            Ok(None)
        }
    }

    fn sensor(device: &str) -> TelemetryRecord {
        TelemetryRecord::Sensor(SensorReading {
            device_id: DeviceId::new(device),
            timestamp: Utc::now(),
            fields: SensorFields {
                temperature: Some(22.0),
                ..Default::default()
            },
        })
    }

    fn actuator(device: &str) -> TelemetryRecord {
        TelemetryRecord::Actuator(ActuatorEvent {
            device_id: DeviceId::new(device),
            timestamp: Utc::now(),
            action: "irrigate".to_string(),
            duration: Some(10.0),
            intensity: None,
        })
    }

    #[tokio::test]
    async fn test_persists_then_publishes() {
        let store = Arc::new(InMemoryTelemetryStore::new());
        let broker = Arc::new(Broker::new(4));
        let gateway = Gateway::new(store.clone(), broker.clone(), false);
        let device = DeviceId::new("1");
        let mut sub = broker.subscribe(device.clone()).unwrap();

        let outcome = gateway.ingest(sensor("1")).await.unwrap();

        assert!(outcome.persisted);
        assert_eq!(outcome.published, Ok(Delivery { delivered: 1, dropped: 0 }));
        assert_eq!(store.count(&device, Category::Sensor).await, 1);
        assert_eq!(sub.recv().await.unwrap().category(), Category::Sensor);
    }

    #[test]
    fn test_persistence_failure_prevents_publish() {
        tokio_test::block_on(async {
            let broker = Arc::new(Broker::new(4));
            let gateway = Gateway::new(Arc::new(FailingStore), broker.clone(), false);
            let mut sub = broker.subscribe(DeviceId::new("1")).unwrap();

            assert!(gateway.ingest(sensor("1")).await.is_err());
            assert!(sub.try_recv().is_none());
        });
    }

    #[tokio::test]
    async fn test_actuator_events_publish_without_persisting_by_default() {
        let store = Arc::new(InMemoryTelemetryStore::new());
        let broker = Arc::new(Broker::new(4));
        let gateway = Gateway::new(store.clone(), broker.clone(), false);
        let device = DeviceId::new("1");
        let mut sub = broker.subscribe(device.clone()).unwrap();

        let outcome = gateway.ingest(actuator("1")).await.unwrap();

        assert!(!outcome.persisted);
        assert_eq!(store.count(&device, Category::Actuator).await, 0);
        assert_eq!(sub.recv().await.unwrap().category(), Category::Actuator);
    }

    #[test]
    fn test_actuator_persistence_can_be_enabled() {
        tokio_test::block_on(async {
            let store = Arc::new(InMemoryTelemetryStore::new());
            let gateway = Gateway::new(store.clone(), Arc::new(Broker::new(4)), true);

            let outcome = gateway.ingest(actuator("1")).await.unwrap();

            assert!(outcome.persisted);
            assert_eq!(store.count(&DeviceId::new("1"), Category::Actuator).await, 1);
        });
    }

    #[tokio::test]
    async fn test_closed_broker_still_acknowledges_persisted_record() {
        let store = Arc::new(InMemoryTelemetryStore::new());
        let broker = Arc::new(Broker::new(4));
        broker.close();
        let gateway = Gateway::new(store.clone(), broker, false);

        let outcome = gateway.ingest(sensor("1")).await.unwrap();

        assert!(outcome.persisted);
        assert_eq!(outcome.published, Err(BrokerError::Unavailable));
        assert_eq!(store.count(&DeviceId::new("1"), Category::Sensor).await, 1);
    }
}
