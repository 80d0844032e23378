//! Embassy task wiring for the C-MCU: one task drives the link to the
//! RT-MCU and fans status out to [`RuntimeState`] and the external sinks,
//! mirroring how `main.cpp`'s loop calls `PicoUART::loop()` then pushes
//! whatever changed to the web server / cloud / MQTT client. A concrete
//! board crate supplies the UART halves and the sink implementations and
//! spawns this from its own `#[embassy_executor::main]`.

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Ticker};
use embedded_io_async::Read;

use brewos_shared::link::FrameSink;
use brewos_shared::packet::Packet;
use brewos_shared::payload::{AlarmPayload, StatusPayload};

use crate::external::{CloudLink, MqttSink, WebSink};
use crate::link::{ClientEvent, PicoLink, WeightStopLine};
use crate::runtime_state::{detect_changes, ChangedFields, RuntimeSnapshot, RuntimeState};

/// How often a full (not delta) snapshot goes to the web sink even with no
/// changed fields, so a client that just connected sees current state
/// promptly rather than waiting for the next change.
const FULL_BROADCAST_INTERVAL_MS: u64 = 5000;

fn elapsed_ms(start: Instant) -> u64 {
    Instant::now().duration_since(start).as_millis()
}

/// Map a freshly received [`StatusPayload`] onto the fields of
/// [`RuntimeSnapshot`] it owns, leaving scale/WiFi/Pico connectivity fields
/// untouched (those are updated by their own sources, not the RT-MCU link).
pub fn apply_status(snapshot: &mut RuntimeSnapshot, status: &StatusPayload) {
    snapshot.brew_temp_c10 = status.brew_temp;
    snapshot.steam_temp_c10 = status.steam_temp;
    snapshot.group_temp_c10 = status.group_temp;
    snapshot.pressure_bar100 = status.pressure;
    snapshot.brew_setpoint_c10 = status.brew_setpoint;
    snapshot.steam_setpoint_c10 = status.steam_setpoint;
    snapshot.brew_output_pct = status.brew_output;
    snapshot.steam_output_pct = status.steam_output;
    snapshot.pump_output_pct = status.pump_output;
    snapshot.machine_state = status.state;
    snapshot.flags = status.flags;
    snapshot.water_level_pct = status.water_level;
    snapshot.power_watts = status.power_watts;
    snapshot.uptime_ms = status.uptime_ms;
    snapshot.brew_count = status.brew_count;
    snapshot.cleaning_reminder = status.cleaning_reminder != 0;
    snapshot.pico_connected = true;
}

/// Route one parsed packet: status updates [`RuntimeState`] and returns the
/// changed-field bitset (if any), an alarm is forwarded to the cloud/MQTT
/// sinks, everything else is dropped (boot/config handling is out of this
/// task's scope — a board crate's setup routine owns the boot handshake).
pub async fn handle_event<W: WeightStopLine, C: CloudLink, M: MqttSink>(
    event: ClientEvent,
    runtime: &RuntimeState,
    cloud: &mut C,
    mqtt: &mut M,
) -> Option<ChangedFields> {
    match event {
        ClientEvent::Status(pkt) => {
            let status = StatusPayload::decode(&pkt.payload)?;
            let prev = runtime.get().await;
            let changed = runtime
                .update(|snap| {
                    apply_status(snap, &status);
                    detect_changes(&prev, snap)
                })
                .await;
            mqtt.publish_status(&status);
            Some(changed)
        }
        ClientEvent::Alarm(pkt) => {
            if let Some(alarm) = AlarmPayload::decode(&pkt.payload) {
                cloud.send_alarm(alarm.code, alarm.severity);
            }
            None
        }
        _ => None,
    }
}

/// Main C-MCU comms loop: feeds received bytes through [`PicoLink`], ticks
/// its retry table, and fans status changes out to the runtime snapshot and
/// external sinks. Runs forever; a board binary spawns one instance per
/// UART pair.
#[embassy_executor::task]
pub async fn comms_task<const N: usize, U, S, W, WS, C, M>(
    runtime: &'static RuntimeState,
    mut uart_rx: U,
    mut uart_tx: S,
    mut client: PicoLink<N, W>,
    mut web: WS,
    mut cloud: C,
    mut mqtt: M,
) -> !
where
    U: Read + 'static,
    S: FrameSink + 'static,
    W: WeightStopLine + 'static,
    WS: WebSink + 'static,
    C: CloudLink + 'static,
    M: MqttSink + 'static,
{
    let start = Instant::now();
    let mut rx_buf = [0u8; 8];
    let mut tick = Ticker::every(Duration::from_millis(100));
    let mut last_full_broadcast_ms: u64 = 0;

    let _ = client.begin_handshake(&mut uart_tx, elapsed_ms(start));

    loop {
        let read_fut = uart_rx.read(&mut rx_buf);
        match select(read_fut, tick.next()).await {
            Either::First(Ok(n)) => {
                for &b in &rx_buf[..n] {
                    if let Ok(Some(pkt)) = client.on_byte(b, elapsed_ms(start)) {
                        if let Ok(event) = client.on_packet(&mut uart_tx, pkt, elapsed_ms(start)) {
                            if let Some(changed) = handle_event(event, runtime, &mut cloud, &mut mqtt).await {
                                if !changed.is_empty() {
                                    let snap = runtime.get().await;
                                    web.send_delta(&snap, changed);
                                    if cloud.connected() {
                                        cloud.send_status(&snap);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Either::First(Err(_)) => {
                // UART error: drop this read cycle, the frame decoder will
                // resynchronise on the next sync byte either way.
            }
            Either::Second(()) => {
                let _ = client.tick(&mut uart_tx, elapsed_ms(start));
                let now = elapsed_ms(start);
                if now.saturating_sub(last_full_broadcast_ms) >= FULL_BROADCAST_INTERVAL_MS {
                    let snap = runtime.get().await;
                    web.send_full(&snap);
                    last_full_broadcast_ms = now;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullCloud {
        connected: bool,
        last_alarm: Option<(u8, u8)>,
    }
    impl CloudLink for NullCloud {
        fn connected(&self) -> bool {
            self.connected
        }
        fn send_status(&mut self, _snapshot: &RuntimeSnapshot) {}
        fn send_alarm(&mut self, code: u8, severity: u8) {
            self.last_alarm = Some((code, severity));
        }
    }

    struct NullMqtt;
    impl MqttSink for NullMqtt {
        fn publish_status(&mut self, _payload: &StatusPayload) {}
    }

    #[test]
    fn apply_status_maps_every_live_field() {
        let mut snap = RuntimeSnapshot::default();
        let status = StatusPayload {
            brew_temp: 930,
            steam_temp: 1400,
            group_temp: 900,
            pressure: 850,
            brew_setpoint: 935,
            steam_setpoint: 1450,
            brew_output: 60,
            steam_output: 0,
            pump_output: 100,
            state: 4,
            flags: 0b0011,
            water_level: 80,
            power_watts: 1200,
            uptime_ms: 60_000,
            shot_start_timestamp_ms: 0,
            heating_strategy: 1,
            cleaning_reminder: 1,
            brew_count: 57,
        };
        apply_status(&mut snap, &status);
        assert_eq!(snap.brew_temp_c10, 930);
        assert_eq!(snap.pump_output_pct, 100);
        assert_eq!(snap.machine_state, 4);
        assert!(snap.cleaning_reminder);
        assert!(snap.pico_connected);
        assert_eq!(snap.brew_count, 57);
    }

    #[test]
    fn handle_event_status_updates_runtime_and_reports_change() {
        let runtime = RuntimeState::new();
        let mut cloud = NullCloud { connected: false, last_alarm: None };
        let mut mqtt = NullMqtt;

        let mut buf = [0u8; StatusPayload::SIZE];
        StatusPayload {
            brew_temp: 930,
            ..Default::default()
        }
        .encode(&mut buf);
        let pkt = Packet::new(brewos_shared::types::MessageType::Status as u8, 0, &buf).unwrap();

        let changed = crate::block_on(handle_event(ClientEvent::Status(pkt), &runtime, &mut cloud, &mut mqtt));
        assert!(changed.unwrap().contains(ChangedFields::TEMPERATURE));
        let snap = crate::block_on(runtime.get());
        assert_eq!(snap.brew_temp_c10, 930);
    }

    #[test]
    fn handle_event_alarm_forwards_to_cloud() {
        let runtime = RuntimeState::new();
        let mut cloud = NullCloud { connected: false, last_alarm: None };
        let mut mqtt = NullMqtt;

        let mut buf = [0u8; AlarmPayload::SIZE];
        AlarmPayload { code: 3, severity: 2, value: 0 }.encode(&mut buf);
        let pkt = Packet::new(brewos_shared::types::MessageType::Alarm as u8, 0, &buf).unwrap();

        let result = crate::block_on(handle_event(ClientEvent::Alarm(pkt), &runtime, &mut cloud, &mut mqtt));
        assert!(result.is_none());
        assert_eq!(cloud.last_alarm, Some((3, 2)));
    }
}
