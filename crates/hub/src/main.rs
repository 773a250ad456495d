mod config;
mod db;
mod error;
mod liveness;
mod mqtt;
mod normalize;
mod registry;
mod relay;
mod rules;
mod session;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use liveness::{now_epoch_ms, Transition};
use mqtt::DeviceTopic;
use state::{CoreState, Principal, SharedState};
use web::AppCtx;

#[tokio::main]
async fn main() -> Result<()> {
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
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:farmdash.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (principal + assignment seeds) ──────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    let principal = Principal {
        user_id: cfg.principal.user_id.clone(),
        email: cfg.principal.email.clone(),
    };

    // ── Shared state ────────────────────────────────────────────────
    let shared: SharedState = Arc::new(RwLock::new(CoreState::new(Some(principal.clone()))));
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ── MQTT client ─────────────────────────────────────────────────
    let client_id = format!("farmdash-hub-{}", principal.user_id);
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Assignment registry bootstrap ───────────────────────────────
    let view = registry::refresh(&db, &principal.user_id).await?;
    info!(
        user = %principal.user_id,
        devices = view.devices.len(),
        "assignments loaded"
    );
    {
        let mut st = shared.write().await;
        st.devices = view.devices.clone();
        st.active = view.active.clone();
        if let Some(active) = &view.active {
            if view.fell_back {
                st.record_assignment(format!("active device selected: {}", active.device_id));
            }
        }
    }

    if let Some(active) = &view.active {
        session::activate(&shared, &client, &active.device_id)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open device session: {e}"))?;
        info!(device = %active.device_id, "device session opened");
    } else {
        warn!("no devices assigned to this user yet");
    }

    // ── Web server ──────────────────────────────────────────────────
    let ctx = AppCtx {
        shared: Arc::clone(&shared),
        db: db.clone(),
        mqtt: client.clone(),
    };
    tokio::spawn(async move {
        web::serve(ctx).await;
    });

    // ── Liveness watchdog ───────────────────────────────────────────
    tokio::spawn(liveness::watchdog(Arc::clone(&shared)));

    // ── MQTT dispatch loop ──────────────────────────────────────────
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_publish(&shared, &p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let topics = {
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                    st.session
                        .as_ref()
                        .map(|s| s.subscription_topics())
                        .unwrap_or_default()
                };
                // The broker forgets subscriptions across reconnects.
                for topic in topics {
                    if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                        error!(topic = %topic, "resubscribe failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");

                // Read channels are gone: treat transport loss as device
                // loss rather than displaying stale data indefinitely.
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                let went_offline = st.session.as_mut().map(|s| {
                    let transition = s.subscription_failure();
                    (s.device_id.clone(), transition)
                });
                if let Some((device_id, Transition::WentOffline)) = went_offline {
                    st.record_liveness(format!("{device_id}: offline (transport failure)"));
                }
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// What a handled publish wants recorded in the event feed once the session
/// borrow is released.
enum Recorded {
    Nothing,
    Telemetry(String),
    Liveness(String),
    Relay(String),
    Error(String),
}

async fn handle_publish(shared: &SharedState, topic: &str, payload: &[u8]) {
    let Some((device_id, kind)) = mqtt::parse_device_topic(topic) else {
        debug!(topic, "unhandled topic");
        return;
    };

    let mut st = shared.write().await;

    let recorded = {
        let Some(session) = st.session.as_mut() else {
            return;
        };
        // A late message for a previously selected device must not bleed
        // into the current session.
        if session.device_id != device_id {
            debug!(topic, "message for non-active device ignored");
            return;
        }

        match kind {
            DeviceTopic::Sensors => match serde_json::from_slice::<normalize::RawRecord>(payload) {
                Ok(raw) => {
                    if session.apply_sensors(&raw) {
                        Recorded::Telemetry(format!(
                            "{device_id}: reading applied (soil {:.1}%)",
                            session.reading.soil_moisture_pct
                        ))
                    } else {
                        Recorded::Nothing
                    }
                }
                Err(e) => {
                    warn!(topic, "bad telemetry json: {e}");
                    Recorded::Error(format!("bad telemetry json: {e}"))
                }
            },
            DeviceTopic::Meta => match serde_json::from_slice::<mqtt::MetaMsg>(payload) {
                Ok(meta) => {
                    match session.apply_meta(meta.last_seen_raw(), now_epoch_ms(), Instant::now())
                    {
                        Transition::WentOnline => {
                            Recorded::Liveness(format!("{device_id}: online"))
                        }
                        Transition::WentOffline => {
                            Recorded::Liveness(format!("{device_id}: offline (stale marker)"))
                        }
                        Transition::None => Recorded::Nothing,
                    }
                }
                Err(e) => {
                    warn!(topic, "bad meta json: {e}");
                    Recorded::Error(format!("bad meta json: {e}"))
                }
            },
            DeviceTopic::RelayStatus => match mqtt::parse_relay_status(payload) {
                Ok(status) => {
                    session.apply_relay_status(status);
                    Recorded::Relay(format!("{device_id}: relay reported {status}"))
                }
                Err(msg) => {
                    warn!(topic, "{msg}");
                    Recorded::Error(msg)
                }
            },
            DeviceTopic::Mode => match mqtt::parse_mode(payload) {
                Ok(mode) => {
                    session.apply_mode(mode);
                    Recorded::Nothing
                }
                Err(msg) => {
                    warn!(topic, "{msg}");
                    Recorded::Error(msg)
                }
            },
        }
    };

    match recorded {
        Recorded::Nothing => {}
        Recorded::Telemetry(detail) => st.record_telemetry(detail),
        Recorded::Liveness(detail) => st.record_liveness(detail),
        Recorded::Relay(detail) => st.record_relay(detail),
        Recorded::Error(detail) => st.record_error(detail),
    }
}
