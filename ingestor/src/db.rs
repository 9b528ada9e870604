use crate::errors::{Error, Result};
use crate::metrics::{DB_FAILURES_TOTAL, PERSIST_LATENCY_SECONDS};
use crate::model::{
    ActuatorEvent, Category, DeviceId, DeviceStatusReading, SensorFields, SensorReading,
    TelemetryRecord,
};
use crate::store::TelemetryStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const MAX_INSERT_ATTEMPTS: u32 = 5;

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_once(&self, record: &TelemetryRecord) -> Result<()> {
        match record {
            TelemetryRecord::Sensor(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO sensor_readings
                        (device_id, ts, temperature, humidity, soil_moisture, light_intensity, ph_level, battery_level)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(r.device_id.as_str())
                .bind(r.timestamp)
                .bind(r.fields.temperature)
                .bind(r.fields.humidity)
                .bind(r.fields.soil_moisture)
                .bind(r.fields.light_intensity)
                .bind(r.fields.ph_level)
                .bind(r.fields.battery_level)
                .execute(&self.pool)
                .await?;
            }
            TelemetryRecord::Status(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO device_statuses
                        (device_id, ts, online, cpu_usage, memory_usage, disk_usage, signal_strength, additional_info)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(r.device_id.as_str())
                .bind(r.timestamp)
                .bind(r.online)
                .bind(r.cpu_usage)
                .bind(r.memory_usage)
                .bind(r.disk_usage)
                .bind(r.signal_strength)
                .bind(&r.additional_info)
                .execute(&self.pool)
                .await?;
            }
            TelemetryRecord::Actuator(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO actuator_events (device_id, ts, action, duration, intensity)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(r.device_id.as_str())
                .bind(r.timestamp)
                .bind(&r.action)
                .bind(r.duration)
                .bind(r.intensity)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn insert(&self, record: &TelemetryRecord) -> Result<()> {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.insert_once(record).await {
                Ok(()) => {
                    PERSIST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                    return Ok(());
                }
                Err(Error::Database(db_err)) => {
                    DB_FAILURES_TOTAL.inc();
                    if attempts >= MAX_INSERT_ATTEMPTS || !is_transient_error(&db_err) {
                        error!(
                            device_id = %record.device_id(),
                            category = record.category().as_str(),
                            "Database insert failed permanently after {} attempts: {}",
                            attempts, db_err
                        );
                        return Err(Error::Database(db_err));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, MAX_INSERT_ATTEMPTS, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Database insert failed with non-database error: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn latest(
        &self,
        device_id: &DeviceId,
        category: Category,
    ) -> Result<Option<TelemetryRecord>> {
        let record = match category {
            Category::Sensor => sqlx::query_as::<_, SensorRow>(
                r#"
                SELECT device_id, ts, temperature, humidity, soil_moisture, light_intensity, ph_level, battery_level
                FROM sensor_readings
                WHERE device_id = $1
                ORDER BY ts DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(device_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(TelemetryRecord::from),
            Category::Status => sqlx::query_as::<_, StatusRow>(
                r#"
                SELECT device_id, ts, online, cpu_usage, memory_usage, disk_usage, signal_strength, additional_info
                FROM device_statuses
                WHERE device_id = $1
                ORDER BY ts DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(device_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(TelemetryRecord::from),
            Category::Actuator => sqlx::query_as::<_, ActuatorRow>(
                r#"
                SELECT device_id, ts, action, duration, intensity
                FROM actuator_events
                WHERE device_id = $1
                ORDER BY ts DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(device_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(TelemetryRecord::from),
        };

        Ok(record)
    }
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    device_id: String,
    ts: DateTime<Utc>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil_moisture: Option<f64>,
    light_intensity: Option<f64>,
    ph_level: Option<f64>,
    battery_level: Option<f64>,
}

impl From<SensorRow> for TelemetryRecord {
    fn from(row: SensorRow) -> Self {
        TelemetryRecord::Sensor(SensorReading {
            device_id: DeviceId::new(row.device_id),
            timestamp: row.ts,
            fields: SensorFields {
                temperature: row.temperature,
                humidity: row.humidity,
                soil_moisture: row.soil_moisture,
                light_intensity: row.light_intensity,
                ph_level: row.ph_level,
                battery_level: row.battery_level,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    device_id: String,
    ts: DateTime<Utc>,
    online: bool,
    cpu_usage: Option<f64>,
    memory_usage: Option<f64>,
    disk_usage: Option<f64>,
    signal_strength: Option<f64>,
    additional_info: Option<serde_json::Value>,
}

impl From<StatusRow> for TelemetryRecord {
    fn from(row: StatusRow) -> Self {
        TelemetryRecord::Status(DeviceStatusReading {
            device_id: DeviceId::new(row.device_id),
            timestamp: row.ts,
            online: row.online,
            cpu_usage: row.cpu_usage,
            memory_usage: row.memory_usage,
            disk_usage: row.disk_usage,
            signal_strength: row.signal_strength,
            additional_info: row.additional_info,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActuatorRow {
    device_id: String,
    ts: DateTime<Utc>,
    action: String,
    duration: Option<f64>,
    intensity: Option<f64>,
}

impl From<ActuatorRow> for TelemetryRecord {
    fn from(row: ActuatorRow) -> Self {
        TelemetryRecord::Actuator(ActuatorEvent {
            device_id: DeviceId::new(row.device_id),
            timestamp: row.ts,
            action: row.action,
            duration: row.duration,
            intensity: row.intensity,
        })
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-class SQLSTATEs
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
