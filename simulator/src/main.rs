mod telemetry;

use clap::Parser;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use telemetry::Submission;
use tracing::{debug, info, warn};

/// Posts randomized farm telemetry to the ingestor.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    /// Base URL of the ingestor
    #[arg(long, env = "INGESTOR_URL", default_value = "http://localhost:8080")]
    target: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: u64,

    /// Identifier of the first simulated device
    #[arg(long, env = "FIRST_DEVICE_ID", default_value_t = 1)]
    first_device_id: u64,

    /// Sensor readings per second across all devices
    #[arg(long, env = "RATE", default_value_t = 10)]
    rate: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting farm device simulator");
    info!(
        "Target: {}, Rate: {} req/s, Devices: {} (from id {})",
        args.target, args.rate, args.devices, args.first_device_id
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let mut rng = rand::thread_rng();
    let mut ticker = tokio::time::interval(tick_period(args.rate));
    let mut counter = 0u64;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                info!("Stopping after {} sensor readings", counter);
                return Ok(());
            }
        }

        let device_id = args.first_device_id + counter % args.devices.max(1);
        counter += 1;

        post(&client, &args.target, "sensor", device_id, telemetry::sensor(&mut rng)).await;

        if rng.gen_bool(0.2) {
            post(&client, &args.target, "status", device_id, telemetry::status(&mut rng)).await;
        }
        if rng.gen_bool(0.05) {
            post(&client, &args.target, "actuator", device_id, telemetry::actuator(&mut rng)).await;
        }

        if counter % 1000 == 0 {
            info!("Posted {} sensor readings", counter);
        }
    }
}

/// Interval between ticks for `rate` requests per second, never shorter than 1µs.
fn tick_period(rate: u64) -> Duration {
    Duration::from_micros((1_000_000 / rate.max(1)).max(1))
}

async fn post<D: Serialize>(
    client: &reqwest::Client,
    target: &str,
    category: &str,
    device_id: u64,
    data: D,
) {
    let url = format!("{}/api/v1/telemetry/{}", target.trim_end_matches('/'), category);
    let body = Submission { device_id, data };

    match client.post(&url).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            debug!(device_id, category, "posted");
        }
        Ok(response) => {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(device_id, category, %status, "ingestor rejected telemetry: {}", text);
        }
        Err(e) => {
            warn!(device_id, category, "Failed to post telemetry: {}", e);
        }
    }
}
