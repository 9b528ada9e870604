use crate::errors::{Error, Result};
use crate::metrics::IMPLAUSIBLE_VALUES_TOTAL;
use crate::model::{
    ActuatorData, ActuatorEvent, DeviceId, DeviceStatusReading, SensorData, SensorFields,
    SensorReading, StatusData, Submission, TelemetryRecord,
};
use chrono::{DateTime, Utc};
use tracing::warn;

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const PERCENT_MIN: f64 = 0.0;
const PERCENT_MAX: f64 = 100.0;
const PH_MIN: f64 = 0.0;
const PH_MAX: f64 = 14.0;

/// Sensor metrics in the order they are looked for. Only the first one present is persisted.
const SENSOR_PRECEDENCE: [SensorMetric; 5] = [
    SensorMetric::Humidity,
    SensorMetric::Temperature,
    SensorMetric::SoilMoisture,
    SensorMetric::LightIntensity,
    SensorMetric::PhLevel,
];

#[derive(Debug, Clone, Copy)]
enum SensorMetric {
    Humidity,
    Temperature,
    SoilMoisture,
    LightIntensity,
    PhLevel,
}

impl SensorMetric {
    fn name(self) -> &'static str {
        match self {
            SensorMetric::Humidity => "humidity",
            SensorMetric::Temperature => "temperature",
            SensorMetric::SoilMoisture => "soil_moisture",
            SensorMetric::LightIntensity => "light_intensity",
            SensorMetric::PhLevel => "ph_level",
        }
    }

    fn read(self, data: &SensorData) -> Option<f64> {
        match self {
            SensorMetric::Humidity => data.humidity,
            SensorMetric::Temperature => data.temperature,
            SensorMetric::SoilMoisture => data.soil_moisture,
            SensorMetric::LightIntensity => data.light_intensity,
            SensorMetric::PhLevel => data.ph_level,
        }
    }

    fn write(self, fields: &mut SensorFields, value: f64) {
        let slot = match self {
            SensorMetric::Humidity => &mut fields.humidity,
            SensorMetric::Temperature => &mut fields.temperature,
            SensorMetric::SoilMoisture => &mut fields.soil_moisture,
            SensorMetric::LightIntensity => &mut fields.light_intensity,
            SensorMetric::PhLevel => &mut fields.ph_level,
        };
        *slot = Some(value);
    }

    fn bounds(self) -> (f64, f64) {
        match self {
            SensorMetric::Temperature => (TEMP_MIN, TEMP_MAX),
            SensorMetric::Humidity | SensorMetric::SoilMoisture => (PERCENT_MIN, PERCENT_MAX),
            SensorMetric::LightIntensity => (0.0, f64::INFINITY),
            SensorMetric::PhLevel => (PH_MIN, PH_MAX),
        }
    }
}

/// Builds the sensor record for a submission, keeping only the highest-precedence metric.
///
/// Only a missing `device_id`, missing `data` or the absence of every recognized metric is
/// rejected. Implausible values are kept, but logged and counted.
pub fn sensor_reading(
    submission: Submission<SensorData>,
    now: DateTime<Utc>,
) -> Result<TelemetryRecord> {
    let (device_id, data) = split(submission)?;

    let (metric, value) = SENSOR_PRECEDENCE
        .iter()
        .find_map(|metric| metric.read(&data).map(|value| (*metric, value)))
        .ok_or_else(|| {
            let names: Vec<&str> = SENSOR_PRECEDENCE.iter().map(|m| m.name()).collect();
            Error::Validation(format!(
                "data must contain at least one of: {}",
                names.join(", ")
            ))
        })?;
    let (min, max) = metric.bounds();
    plausible(&device_id, metric.name(), value, min, max);

    let mut fields = SensorFields::default();
    metric.write(&mut fields, value);

    if let Some(battery) = data.battery_level {
        plausible(&device_id, "battery_level", battery, PERCENT_MIN, PERCENT_MAX);
        fields.battery_level = Some(battery);
    }

    Ok(TelemetryRecord::Sensor(SensorReading {
        device_id,
        timestamp: data.timestamp.unwrap_or(now),
        fields,
    }))
}

pub fn device_status(
    submission: Submission<StatusData>,
    now: DateTime<Utc>,
) -> Result<TelemetryRecord> {
    let (device_id, data) = split(submission)?;

    let online = data
        .online
        .ok_or_else(|| Error::Validation("data.online is required".to_string()))?;

    for (name, value) in [
        ("cpu_usage", data.cpu_usage),
        ("memory_usage", data.memory_usage),
        ("disk_usage", data.disk_usage),
    ] {
        if let Some(value) = value {
            plausible(&device_id, name, value, PERCENT_MIN, PERCENT_MAX);
        }
    }

    Ok(TelemetryRecord::Status(DeviceStatusReading {
        device_id,
        timestamp: data.timestamp.unwrap_or(now),
        online,
        cpu_usage: data.cpu_usage,
        memory_usage: data.memory_usage,
        disk_usage: data.disk_usage,
        signal_strength: data.signal_strength,
        additional_info: data.additional_info,
    }))
}

pub fn actuator_event(
    submission: Submission<ActuatorData>,
    now: DateTime<Utc>,
) -> Result<TelemetryRecord> {
    let (device_id, data) = split(submission)?;

    let action = data
        .action
        .ok_or_else(|| Error::Validation("data.action is required".to_string()))?;

    if let Some(duration) = data.duration {
        plausible(&device_id, "duration", duration, 0.0, f64::INFINITY);
    }
    if let Some(intensity) = data.intensity {
        plausible(&device_id, "intensity", intensity, PERCENT_MIN, PERCENT_MAX);
    }

    Ok(TelemetryRecord::Actuator(ActuatorEvent {
        device_id,
        timestamp: data.timestamp.unwrap_or(now),
        action,
        duration: data.duration,
        intensity: data.intensity,
    }))
}

fn split<D>(submission: Submission<D>) -> Result<(DeviceId, D)> {
    let device_id = submission
        .device_id
        .ok_or_else(|| Error::Validation("device_id is required".to_string()))?;
    if device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    let data = submission
        .data
        .ok_or_else(|| Error::Validation("data is required".to_string()))?;

    Ok((device_id, data))
}

/// Flags a value outside its physical range. Returns whether it was inside.
fn plausible(device_id: &DeviceId, name: &str, value: f64, min: f64, max: f64) -> bool {
    if (min..=max).contains(&value) {
        return true;
    }

    IMPLAUSIBLE_VALUES_TOTAL.inc();
    warn!(
        device_id = %device_id,
        field = name,
        value,
        "value outside [{}, {}], keeping it",
        min,
        max
    );
    false
}
