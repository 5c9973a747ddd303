use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use irrigator_common::{
    blink_pattern, decode, Clock, DecodeError, EngineAction, LinkState, NetworkConfig,
    OutputState, RuntimeConfig, Schedule, ScheduleDefaults, ScheduleEngine, TimeReading,
    HEARTBEAT_PAYLOAD, TOPIC_ACK, TOPIC_CONFIG, TOPIC_CONTROL, TOPIC_HEARTBEAT,
};

const NVS_NAMESPACE: &str = "irrigator";
const NVS_KEY_INTERVAL: &str = "interval";
const NVS_KEY_DURATION: &str = "duration";
const NVS_KEY_NEXT_ON: &str = "next_on";
const NVS_KEY_OFF_TIME: &str = "off_time";
const NVS_KEY_IS_ON: &str = "is_on";

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const RELAY_PIN: i32 = 5;
const STATUS_LED_PIN: i32 = 2;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const PROVISIONING_AP_SSID: &str = "IrrigatorController-AP";
const PROVISIONING_AP_PASSWORD: &str = "IrrigatorSetup";
const CONTROL_LOOP_SLEEP_MS: u64 = 100;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<ScheduleEngine>>,
    clock: Arc<EspClock>,
    relay: Arc<Mutex<Relay>>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    mqtt_connected: Arc<AtomicBool>,
    store: NvsStore,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    defaults: ScheduleDefaults,
    lock: Arc<Mutex<()>>,
}

struct Relay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

/// Device time source: uptime until the first SNTP synchronization
/// completes, epoch seconds afterwards. The latch never clears — once the
/// system clock has been set it stays trustworthy even through re-syncs.
struct EspClock {
    sntp: EspSntp<'static>,
    synced: AtomicBool,
}

impl Clock for EspClock {
    fn now(&self) -> TimeReading {
        if !self.synced.load(Ordering::Relaxed)
            && self.sntp.get_sync_status() == SyncStatus::Completed
        {
            self.synced.store(true, Ordering::Relaxed);
        }

        if self.synced.load(Ordering::Relaxed) {
            match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(epoch) => TimeReading::Absolute(epoch.as_secs()),
                Err(_) => TimeReading::Relative(monotonic_ms() / 1_000),
            }
        } else {
            TimeReading::Relative(monotonic_ms() / 1_000)
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = RuntimeConfig::default();
    ensure_network_defaults(&mut runtime.network);

    let store = NvsStore {
        partition: nvs_partition.clone(),
        defaults: runtime.defaults,
        lock: Arc::new(Mutex::new(())),
    };

    // Load the schedule before any networking so it keeps running offline.
    let schedule = store.load_schedule().unwrap_or_else(|err| {
        warn!("failed to load schedule from NVS: {err:#}");
        Schedule::first_boot(&runtime.defaults)
    });
    info!(
        "schedule loaded: interval {}s, duration {}s, next_on {}, off_time {}, is_on {}",
        schedule.interval, schedule.duration, schedule.next_on_time, schedule.off_time,
        schedule.is_on,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut status_led = init_status_led(STATUS_LED_PIN);
    let relay = init_relay(RELAY_PIN)?;

    let wifi = match connect_wifi(modem, sys_loop, &runtime.network)
        .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => wifi,
        WifiStartup::Provisioning(wifi) => {
            warn!(
                "wifi station connection unavailable; provisioning AP `{}` is up",
                PROVISIONING_AP_SSID
            );
            let _wifi = wifi;
            provisioning_idle_loop(&mut status_led);
        }
    };

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    let clock = Arc::new(EspClock {
        sntp,
        synced: AtomicBool::new(false),
    });

    let mut engine = ScheduleEngine::new(schedule, runtime.defaults);
    let boot_actions = engine.boot(clock.now());

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;

    let state = SharedState {
        engine: Arc::new(Mutex::new(engine)),
        clock,
        relay: Arc::new(Mutex::new(relay)),
        mqtt: Arc::new(Mutex::new(mqtt_client)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        store,
    };

    execute_engine_actions(&state, boot_actions);

    subscribe_topics(&state.mqtt)?;
    spawn_mqtt_receiver(state.clone(), mqtt_conn);
    spawn_control_loop(
        state,
        status_led,
        runtime.tick_interval_ms,
        runtime.heartbeat_interval_ms,
    );

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }
    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
    if let Some(host) = option_env!("MQTT_HOST") {
        network.mqtt_host = host.to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    network: &NetworkConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), None)?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(WifiStartup::Connected(esp_wifi));
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    let _ = wifi.stop();
    start_provisioning_ap(&mut wifi)?;
    Ok(WifiStartup::Provisioning(esp_wifi))
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{PROVISIONING_AP_SSID}`");
    Ok(())
}

fn provisioning_idle_loop(status_led: &mut Option<StatusLed>) -> ! {
    loop {
        update_status_led(status_led, LinkState::NetworkFailed, monotonic_ms());
        thread::sleep(Duration::from_millis(CONTROL_LOOP_SLEEP_MS));
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap();
    for topic in [TOPIC_CONFIG, TOPIC_CONTROL] {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        if let Err(err) = subscribe_topics(&state.mqtt) {
                            warn!("mqtt re-subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Only full payloads are processed.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }

                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }

                        if let Ok(message) = core::str::from_utf8(data) {
                            handle_mqtt_message(&state, topic, message);
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&state.mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) {
    info!("incoming: {topic} - {message}");

    match decode(topic, message) {
        Ok(command) => {
            let actions = {
                let mut engine = state.engine.lock().unwrap();
                engine.apply(command, state.clock.now())
            };
            execute_engine_actions(state, actions);
        }
        Err(DecodeError::UnhandledTopic(_)) => {}
        Err(err) => warn!("rejected command on {topic}: {err}"),
    }
}

fn spawn_control_loop(
    state: SharedState,
    mut status_led: Option<StatusLed>,
    tick_interval_ms: u64,
    heartbeat_interval_ms: u64,
) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = init_watchdog(WATCHDOG_TIMEOUT_SEC)
                .and_then(|()| add_current_task_to_watchdog())
            {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_tick_ms = 0_u64;
            let mut last_heartbeat_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                let link = if !is_wifi_station_connected() {
                    LinkState::NetworkConnecting
                } else if !state.mqtt_connected.load(Ordering::Relaxed) {
                    LinkState::BrokerConnecting
                } else {
                    LinkState::BrokerConnected
                };
                update_status_led(&mut status_led, link, now_ms);

                if now_ms.saturating_sub(last_heartbeat_ms) >= heartbeat_interval_ms {
                    last_heartbeat_ms = now_ms;
                    publish_heartbeat(&state);
                }

                if now_ms.saturating_sub(last_tick_ms) >= tick_interval_ms {
                    last_tick_ms = now_ms;
                    let actions = {
                        let mut engine = state.engine.lock().unwrap();
                        engine.tick(state.clock.now())
                    };
                    execute_engine_actions(&state, actions);
                }

                thread::sleep(Duration::from_millis(CONTROL_LOOP_SLEEP_MS));
            }
        })
        .expect("failed to spawn control loop thread");
}

fn execute_engine_actions(state: &SharedState, actions: Vec<EngineAction>) {
    for action in actions {
        match action {
            EngineAction::EnergizeRelay => drive_relay(state, true),
            EngineAction::DeenergizeRelay => drive_relay(state, false),
            EngineAction::Ack(output) => publish_ack(state, output),
            EngineAction::Persist => {
                let schedule = state.engine.lock().unwrap().schedule().clone();
                if let Err(err) = state.store.save_schedule(&schedule) {
                    // Best-effort: in-memory state stays authoritative and
                    // the next successful write reconciles NVS.
                    warn!("schedule persist failed: {err:#}");
                }
            }
        }
    }
}

fn drive_relay(state: &SharedState, on: bool) {
    let mut relay = state.relay.lock().unwrap();
    if let Err(err) = relay.set(on) {
        warn!("failed to drive relay: {err:#}");
    } else {
        info!("relay {}", if on { "energized" } else { "de-energized" });
    }
}

fn publish_ack(state: &SharedState, output: OutputState) {
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return;
    }

    let mut mqtt = state.mqtt.lock().unwrap();
    if let Err(err) = mqtt.publish(
        TOPIC_ACK,
        QoS::AtMostOnce,
        false,
        output.as_str().as_bytes(),
    ) {
        warn!("ack publish failed: {err:?}");
    }
}

fn publish_heartbeat(state: &SharedState) {
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return;
    }

    let mut mqtt = state.mqtt.lock().unwrap();
    if let Err(err) = mqtt.publish(
        TOPIC_HEARTBEAT,
        QoS::AtMostOnce,
        false,
        HEARTBEAT_PAYLOAD.as_bytes(),
    ) {
        warn!("heartbeat publish failed: {err:?}");
    }
}

impl Relay {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        if on {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        Ok(())
    }
}

impl NvsStore {
    fn load_schedule(&self) -> anyhow::Result<Schedule> {
        let _guard = self.lock.lock().unwrap();
        let nvs = self.open()?;

        Ok(Schedule {
            interval: nvs
                .get_u64(NVS_KEY_INTERVAL)?
                .unwrap_or(self.defaults.interval_secs),
            duration: nvs
                .get_u64(NVS_KEY_DURATION)?
                .unwrap_or(self.defaults.duration_secs),
            next_on_time: nvs
                .get_u64(NVS_KEY_NEXT_ON)?
                .unwrap_or(self.defaults.turn_on_epoch),
            off_time: nvs.get_u64(NVS_KEY_OFF_TIME)?.unwrap_or(0),
            is_on: nvs.get_u64(NVS_KEY_IS_ON)?.unwrap_or(0) != 0,
        })
    }

    fn save_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open()?;

        nvs.set_u64(NVS_KEY_INTERVAL, schedule.interval)?;
        nvs.set_u64(NVS_KEY_DURATION, schedule.duration)?;
        nvs.set_u64(NVS_KEY_NEXT_ON, schedule.next_on_time)?;
        nvs.set_u64(NVS_KEY_OFF_TIME, schedule.off_time)?;
        nvs.set_u64(NVS_KEY_IS_ON, u64::from(schedule.is_on))?;
        Ok(())
    }

    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }
}

fn init_relay(pin: i32) -> anyhow::Result<Relay> {
    let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .map_err(|err| anyhow!("relay unavailable on GPIO{pin}: {err}"))?;
    // Hardware always comes up de-energized; boot reconciliation may
    // re-energize to match persisted state.
    driver.set_low()?;
    Ok(Relay { pin: driver })
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn update_status_led(status_led: &mut Option<StatusLed>, link: LinkState, now_ms: u64) {
    let pattern = blink_pattern(link);
    let desired_on = now_ms % (pattern.on_ms + pattern.off_ms) < pattern.on_ms;

    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
