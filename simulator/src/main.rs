mod telemetry;

use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::{Duration, Instant};
use telemetry::Device;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes simulated vehicle telemetry to `telemetry/<device_id>`.
#[derive(Debug, Parser)]
#[command(name = "telemetry-simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Messages per second across all devices.
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Stop after this many messages.
    #[arg(long, env = "COUNT")]
    count: Option<u64>,
}

const BURST_SIZE: u64 = 200;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let rate = args.rate.max(1);
    let num_devices = args.devices.max(1);

    info!("Starting telemetry simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}, Count: {:?}",
        args.broker, args.port, rate, num_devices, args.count
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut rng = rand::thread_rng();
    let mut devices: Vec<Device> = (0..num_devices)
        .map(|i| Device::new(format!("dev-{}", i), &mut rng))
        .collect();

    let burst_size = BURST_SIZE.min(rate);
    let burst_interval = Duration::from_micros(burst_size * 1_000_000 / rate);
    info!(
        "Publishing in bursts of {} messages every {:?}",
        burst_size, burst_interval
    );

    let mut sent = 0u64;
    let mut next_device = 0usize;
    let start = Instant::now();

    'publish: loop {
        let burst_start = Instant::now();

        for _ in 0..burst_size {
            if args.count.is_some_and(|count| sent >= count) {
                break 'publish;
            }

            let reading = devices[next_device].next_reading(&mut rng);
            next_device = (next_device + 1) % devices.len();

            let topic = format!("telemetry/{}", reading.device_id);
            let payload = match serde_json::to_vec(&reading) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };

            match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => {
                    sent += 1;
                    if sent % 10_000 == 0 {
                        info!("Published {} messages", sent);
                    }
                }
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?}; broker may be overloaded",
                elapsed, burst_interval
            );
        }
    }

    // Let the eventloop hand off in-flight QoS 1 publishes before exiting.
    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Err(e) = client.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }

    info!(
        "Published {} messages in {:.1}s",
        sent,
        start.elapsed().as_secs_f64()
    );
}
