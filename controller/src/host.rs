use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use irrigator_common::{
    blink_pattern, decode, Clock, DecodeError, EngineAction, LinkState, OutputState,
    RuntimeConfig, Schedule, ScheduleDefaults, ScheduleEngine, TimeReading, HEARTBEAT_PAYLOAD,
    TOPIC_ACK, TOPIC_CONFIG, TOPIC_CONTROL, TOPIC_HEARTBEAT,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<ScheduleEngine>>,
    clock: SystemClock,
    mqtt: AsyncClient,
    mqtt_connected: Arc<AtomicBool>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    schedule_path: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
    defaults: ScheduleDefaults,
    lock: Arc<Mutex<()>>,
}

/// Host time source. The OS clock is NTP-disciplined, so a successful epoch
/// read counts as synchronized; anything else falls back to uptime.
#[derive(Clone, Copy)]
struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeReading {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(epoch) => TimeReading::Absolute(epoch.as_secs()),
            Err(_) => TimeReading::Relative(uptime_secs()),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = {
        let store = AppStore::new(ScheduleDefaults::default());
        store.load_runtime_config().await.unwrap_or_else(|err| {
            warn!("failed to load runtime config from store: {err:#}");
            RuntimeConfig::default()
        })
    };
    apply_env_overrides(&mut runtime);

    let store = AppStore::new(runtime.defaults);
    let schedule = store.load_schedule().await.unwrap_or_else(|err| {
        warn!("failed to load schedule from store: {err:#}");
        Schedule::first_boot(&runtime.defaults)
    });
    info!(
        "schedule loaded: interval {}s, duration {}s, next_on {}, off_time {}, is_on {}",
        schedule.interval, schedule.duration, schedule.next_on_time, schedule.off_time,
        schedule.is_on,
    );

    let clock = SystemClock;
    let mut engine = ScheduleEngine::new(schedule, runtime.defaults);
    let boot_actions = engine.boot(clock.now());

    let mut mqtt_options = MqttOptions::new(
        runtime.network.mqtt_client_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        clock,
        mqtt,
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        store,
    };

    execute_engine_actions(&app_state, boot_actions).await;

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), runtime.tick_interval_ms);
    spawn_heartbeat_loop(app_state.clone(), runtime.heartbeat_interval_ms);
    spawn_indicator_loop(app_state.clone());

    info!(
        "controller running against mqtt://{}:{}",
        runtime.network.mqtt_host, runtime.network.mqtt_port
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_CONFIG, TOPIC_CONTROL] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    app_state.mqtt_connected.store(true, Ordering::Relaxed);
                    if let Err(err) = subscribe_topics(&app_state.mqtt).await {
                        warn!("mqtt re-subscribe failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    app_state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, tick_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));

        loop {
            interval.tick().await;

            let actions = {
                let mut engine = app_state.engine.lock().await;
                engine.tick(app_state.clock.now())
            };

            if !actions.is_empty() {
                execute_engine_actions(&app_state, actions).await;
            }
        }
    });
}

fn spawn_heartbeat_loop(app_state: AppState, heartbeat_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));

        loop {
            interval.tick().await;

            if !app_state.mqtt_connected.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(err) = app_state
                .mqtt
                .publish(TOPIC_HEARTBEAT, QoS::AtMostOnce, false, HEARTBEAT_PAYLOAD)
                .await
            {
                warn!("heartbeat publish failed: {err}");
            }
        }
    });
}

// The host build has no LED; the loop keeps the cadence observable in logs
// and documents where the device build drives the pin.
fn spawn_indicator_loop(app_state: AppState) {
    tokio::spawn(async move {
        loop {
            let link = if app_state.mqtt_connected.load(Ordering::Relaxed) {
                LinkState::BrokerConnected
            } else {
                LinkState::BrokerConnecting
            };
            let pattern = blink_pattern(link);

            debug!("indicator {:?}: lit for {}ms", link, pattern.on_ms);
            tokio::time::sleep(Duration::from_millis(pattern.on_ms)).await;
            tokio::time::sleep(Duration::from_millis(pattern.off_ms)).await;
        }
    });
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return;
    }
    let Ok(message) = core::str::from_utf8(payload) else {
        warn!("dropping non-utf8 MQTT payload on topic {topic}");
        return;
    };
    info!("incoming: {topic} - {message}");

    match decode(topic, message) {
        Ok(command) => {
            let actions = {
                let mut engine = app_state.engine.lock().await;
                engine.apply(command, app_state.clock.now())
            };
            execute_engine_actions(app_state, actions).await;
        }
        Err(DecodeError::UnhandledTopic(_)) => {}
        Err(err) => warn!("rejected command on {topic}: {err}"),
    }
}

async fn execute_engine_actions(app_state: &AppState, actions: Vec<EngineAction>) {
    for action in actions {
        match action {
            // The ESP32 build drives the relay GPIO here.
            EngineAction::EnergizeRelay => info!("relay energized"),
            EngineAction::DeenergizeRelay => info!("relay de-energized"),
            EngineAction::Ack(output) => publish_ack(app_state, output).await,
            EngineAction::Persist => {
                let schedule = app_state.engine.lock().await.schedule().clone();
                if let Err(err) = app_state.store.save_schedule(&schedule).await {
                    // Best-effort: in-memory state stays authoritative and
                    // the next successful write reconciles the store.
                    warn!("schedule persist failed: {err:#}");
                }
            }
        }
    }
}

async fn publish_ack(app_state: &AppState, output: OutputState) {
    if !app_state.mqtt_connected.load(Ordering::Relaxed) {
        debug!("ack {} dropped; broker disconnected", output.as_str());
        return;
    }

    if let Err(err) = app_state
        .mqtt
        .publish(TOPIC_ACK, QoS::AtMostOnce, false, output.as_str())
        .await
    {
        warn!("ack publish failed: {err}");
    }
}

impl AppStore {
    fn new(defaults: ScheduleDefaults) -> Self {
        let data_dir = std::env::var("IRRIGATOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.irrigator"));

        Self {
            schedule_path: Arc::new(data_dir.join("schedule.json")),
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            defaults,
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_schedule(&self) -> anyhow::Result<Schedule> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.schedule_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<Schedule>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Ok(Schedule::first_boot(&self.defaults))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.schedule_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(schedule)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn uptime_secs() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}
