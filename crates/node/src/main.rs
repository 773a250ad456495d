mod sim;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Dialect, FieldSim, LastSeenStyle};

fn now_epoch_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "dev-1".to_string());
    let dialect = Dialect::from_str_lossy(&env::var("DIALECT").unwrap_or_default());
    let style = LastSeenStyle::from_str_lossy(&env::var("LAST_SEEN_STYLE").unwrap_or_default());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    info!(%device_id, %dialect, %style, sample_every_s, "node starting");

    let client_id = format!("farmdash-node-{device_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let sim = Arc::new(Mutex::new(FieldSim::new(dialect)));
    let started = Instant::now();

    // ── Command listener ────────────────────────────────────────────
    // Handles relay/mode commands and config pushes from the hub, and keeps
    // the connection alive.
    {
        let sim = Arc::clone(&sim);
        let client = client.clone();
        let device_id = device_id.clone();

        tokio::spawn(async move {
            let relay_set = format!("farm/{device_id}/relay/set");
            let mode_set = format!("farm/{device_id}/mode/set");
            let config = format!("farm/{device_id}/config");
            let relay_status = format!("farm/{device_id}/relay/status");
            let mode_status = format!("farm/{device_id}/mode");

            let mut mode = "manual".to_string();

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("node connected to mqtt");
                        for topic in [&relay_set, &mode_set, &config] {
                            if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await
                            {
                                error!(topic = %topic, "subscribe failed: {e}");
                            }
                        }
                        // Announce authoritative state on (re)connect.
                        let state = if sim.lock().await.relay_on() { "on" } else { "off" };
                        let _ = client
                            .publish(
                                relay_status.as_str(),
                                QoS::AtLeastOnce,
                                true,
                                state.as_bytes().to_vec(),
                            )
                            .await;
                        let _ = client
                            .publish(
                                mode_status.as_str(),
                                QoS::AtLeastOnce,
                                true,
                                mode.clone().into_bytes(),
                            )
                            .await;
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        if p.topic == relay_set {
                            // RelayCommand json: {"value":"on",...}
                            let desired = serde_json::from_slice::<serde_json::Value>(&p.payload)
                                .ok()
                                .and_then(|v| v["value"].as_str().map(str::to_string));
                            match desired.as_deref() {
                                Some("on") | Some("off") => {
                                    let on = desired.as_deref() == Some("on");
                                    sim.lock().await.set_relay(on);
                                    info!(relay = %if on { "on" } else { "off" }, "relay command applied");
                                    // Echo the authoritative state back, retained.
                                    let state = if on { "on" } else { "off" };
                                    let _ = client
                                        .publish(
                                            relay_status.as_str(),
                                            QoS::AtLeastOnce,
                                            true,
                                            state.as_bytes().to_vec(),
                                        )
                                        .await;
                                }
                                _ => warn!("bad relay command payload"),
                            }
                        } else if p.topic == mode_set {
                            let requested = String::from_utf8_lossy(&p.payload)
                                .trim()
                                .to_lowercase();
                            if requested == "auto" || requested == "manual" {
                                mode = requested.clone();
                                info!(%mode, "irrigation mode applied");
                                let _ = client
                                    .publish(
                                        mode_status.as_str(),
                                        QoS::AtLeastOnce,
                                        true,
                                        requested.into_bytes(),
                                    )
                                    .await;
                            } else {
                                warn!("bad mode payload '{requested}'");
                            }
                        } else if p.topic == config {
                            info!(bytes = p.payload.len(), "config snapshot received");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt error: {e}. retrying...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    // ── Telemetry loop ──────────────────────────────────────────────
    let sensors_topic = format!("farm/{device_id}/sensors");
    let meta_topic = format!("farm/{device_id}/meta");

    loop {
        let now_ms = now_epoch_ms();
        let payload = {
            let mut s = sim.lock().await;
            s.tick();
            serde_json::to_vec(&s.telemetry(now_ms)).unwrap()
        };

        if let Err(e) = client
            .publish(sensors_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            error!("telemetry publish error: {e}");
        }

        let marker = style.marker(started.elapsed().as_secs() as i64, now_ms);
        let meta = serde_json::to_vec(&serde_json::json!({ "lastSeen": marker })).unwrap();
        if let Err(e) = client
            .publish(meta_topic.as_str(), QoS::AtLeastOnce, false, meta)
            .await
        {
            error!("meta publish error: {e}");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
