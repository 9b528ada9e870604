use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Display format for timestamps on the dashboard wire, e.g. `07.03.2025 14:05:09`.
pub const DISPLAY_TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Opaque device key. Payloads may carry it as a JSON integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(from = "RawDeviceId")]
pub struct DeviceId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDeviceId {
    Int(i64),
    Text(String),
}

impl From<RawDeviceId> for DeviceId {
    fn from(raw: RawDeviceId) -> Self {
        match raw {
            RawDeviceId::Int(id) => DeviceId(id.to_string()),
            RawDeviceId::Text(id) => DeviceId(id.trim().to_string()),
        }
    }
}

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Telemetry category. Selects the table a record lives in and the frame tag it travels under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Sensor,
    Status,
    Actuator,
}

impl Category {
    /// Snapshot replay order.
    pub const REPLAY_ORDER: [Category; 3] = [Category::Sensor, Category::Actuator, Category::Status];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sensor => "sensor",
            Category::Status => "status",
            Category::Actuator => "actuator",
        }
    }
}

/// Sensor metrics. Only the fields present in the inbound payload are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_intensity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub device_id: DeviceId,
    #[serde(serialize_with = "display_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: SensorFields,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusReading {
    pub device_id: DeviceId,
    #[serde(serialize_with = "display_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorEvent {
    pub device_id: DeviceId,
    #[serde(serialize_with = "display_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
}

/// One immutable telemetry observation.
///
/// Serializes directly into the dashboard frame: `{"type": "<category>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum TelemetryRecord {
    #[serde(rename = "send_sensor_data")]
    Sensor(SensorReading),
    #[serde(rename = "device_status_data")]
    Status(DeviceStatusReading),
    #[serde(rename = "send_actuator_data")]
    Actuator(ActuatorEvent),
}

impl TelemetryRecord {
    pub fn category(&self) -> Category {
        match self {
            TelemetryRecord::Sensor(_) => Category::Sensor,
            TelemetryRecord::Status(_) => Category::Status,
            TelemetryRecord::Actuator(_) => Category::Actuator,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            TelemetryRecord::Sensor(r) => &r.device_id,
            TelemetryRecord::Status(r) => &r.device_id,
            TelemetryRecord::Actuator(r) => &r.device_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TelemetryRecord::Sensor(r) => r.timestamp,
            TelemetryRecord::Status(r) => r.timestamp,
            TelemetryRecord::Actuator(r) => r.timestamp,
        }
    }
}

/// Inbound ingestion body. Both halves are optional so that absence is reported
/// as a validation error rather than a deserialization failure.
#[derive(Debug, Deserialize)]
pub struct Submission<D> {
    pub device_id: Option<DeviceId>,
    pub data: Option<D>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SensorData {
    pub timestamp: Option<DateTime<Utc>>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub light_intensity: Option<f64>,
    pub ph_level: Option<f64>,
    pub battery_level: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusData {
    pub timestamp: Option<DateTime<Utc>>,
    pub online: Option<bool>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub signal_strength: Option<f64>,
    pub additional_info: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActuatorData {
    pub timestamp: Option<DateTime<Utc>>,
    pub action: Option<String>,
    pub duration: Option<f64>,
    pub intensity: Option<f64>,
}

/// Ingestion acknowledgement, always `{"status":"sent"}`.
#[derive(Debug, Serialize)]
pub struct Sent {
    pub status: &'static str,
}

impl Sent {
    pub fn new() -> Self {
        Sent { status: "sent" }
    }
}

impl Default for Sent {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest record per category for one device, as returned by the snapshot route.
#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub device_id: DeviceId,
    pub records: Vec<TelemetryRecord>,
}

fn display_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&ts.format(DISPLAY_TIMESTAMP_FORMAT))
}
