use crate::errors::{Error, Result};
use crate::gateway::IngestGateway;
use crate::metrics::MESSAGES_TOTAL;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    topic: String,
    gateway: Arc<IngestGateway>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", topic);

    let mut connected_before = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();

                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                if let Err(e) =
                    gateway.accept_payload(&publish.payload, topic_device(&publish.topic))
                {
                    debug!("Rejected message on {}: {}", publish.topic, e);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker");
                // The broker lost our session on reconnect: subscribe again.
                if connected_before && !ack.session_present {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        error!("Failed to re-subscribe to {}: {}", topic, e);
                    }
                }
                connected_before = true;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc automatically reconnects, so we just log and continue
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Device id encoded as the last segment of `telemetry/<device_id>`.
fn topic_device(topic: &str) -> Option<&str> {
    topic
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && *segment != topic)
}
