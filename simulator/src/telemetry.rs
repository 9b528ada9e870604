use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Body shape accepted by every ingestion route.
#[derive(Debug, Clone, Serialize)]
pub struct Submission<D> {
    pub device_id: u64,
    pub data: D,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorData {
    pub timestamp: DateTime<Utc>,
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
    pub battery_level: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub timestamp: DateTime<Utc>,
    pub online: bool,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub signal_strength: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorData {
    pub timestamp: DateTime<Utc>,
    pub action: &'static str,
    pub duration: f64,
    pub intensity: f64,
}

const ACTIONS: [&str; 4] = ["irrigate", "open_vent", "close_vent", "lights_on"];

/// A sensor reading carrying one metric, as a single-metric field device would send.
pub fn sensor(rng: &mut impl Rng) -> SensorData {
    let mut data = SensorData {
        timestamp: Utc::now(),
        battery_level: if rng.gen_bool(0.02) {
            rng.gen_range(0.0..20.0) // 2% low battery
        } else {
            rng.gen_range(20.0..100.0)
        },
        ..Default::default()
    };

    match rng.gen_range(0..5) {
        0 => data.temperature = Some(rng.gen_range(15.0..35.0)),
        1 => data.humidity = Some(rng.gen_range(30.0..80.0)),
        2 => data.soil_moisture = Some(rng.gen_range(10.0..60.0)),
        3 => data.light_intensity = Some(rng.gen_range(0.0..50_000.0)),
        _ => data.ph_level = Some(rng.gen_range(5.5..7.5)),
    }

    data
}

pub fn status(rng: &mut impl Rng) -> StatusData {
    StatusData {
        timestamp: Utc::now(),
        online: !rng.gen_bool(0.05),
        cpu_usage: rng.gen_range(1.0..90.0),
        memory_usage: rng.gen_range(10.0..80.0),
        disk_usage: rng.gen_range(5.0..70.0),
        signal_strength: rng.gen_range(-95.0..-40.0),
    }
}

pub fn actuator(rng: &mut impl Rng) -> ActuatorData {
    ActuatorData {
        timestamp: Utc::now(),
        action: ACTIONS[rng.gen_range(0..ACTIONS.len())],
        duration: rng.gen_range(5.0..600.0),
        intensity: rng.gen_range(10.0..100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_carries_exactly_one_metric() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let data = sensor(&mut rng);
            let present = [
                data.temperature,
                data.humidity,
                data.soil_moisture,
                data.light_intensity,
                data.ph_level,
            ]
            .iter()
            .filter(|v| v.is_some())
            .count();
            assert_eq!(present, 1);
            assert!((0.0..=100.0).contains(&data.battery_level));
        }
    }

    #[test]
    fn test_submission_shape() {
        let mut rng = rand::thread_rng();
        let body = serde_json::to_value(Submission {
            device_id: 3,
            data: actuator(&mut rng),
        })
        .unwrap();
        assert_eq!(body["device_id"], 3);
        assert!(body["data"]["action"].is_string());
    }
}
