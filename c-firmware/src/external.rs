//! Trait boundary to the out-of-scope collaborators named in spec §1's "OUT
//! OF SCOPE" list and realized in spec §6's external interfaces: LVGL
//! display, WebSocket/web server, cloud push, MQTT, WiFi station/AP, and the
//! BLE scale driver. None of those are implemented here; this module only
//! defines the narrow seams the core depends on, mirroring how
//! `pico_protocol_handler.cpp` hands a parsed status off to `main.cpp`
//! through a function pointer rather than owning the web/cloud/MQTT code
//! itself.
//!
//! A concrete C-MCU board binary implements these traits against its own
//! WiFi stack, TLS client, and MQTT library and wires them into
//! [`crate::tasks`]; this crate only calls through them.

use brewos_shared::payload::StatusPayload;

use crate::runtime_state::{ChangedFields, RuntimeSnapshot};

/// Sink for local WebSocket clients. The core calls this with a delta (on
/// change, per [`ChangedFields`]) or a periodic full snapshot; the
/// implementation owns JSON/MsgPack framing and the actual socket set.
pub trait WebSink {
    fn send_delta(&mut self, snapshot: &RuntimeSnapshot, changed: ChangedFields);
    fn send_full(&mut self, snapshot: &RuntimeSnapshot);
}

/// Persistent cloud link. `connected()` gates whether the core should even
/// attempt to forward a snapshot; the backoff/reconnect policy (spec §5
/// "Cloud backoff is non-blocking") lives entirely on the implementation's
/// side, not here.
pub trait CloudLink {
    fn connected(&self) -> bool;
    fn send_status(&mut self, snapshot: &RuntimeSnapshot);
    fn send_alarm(&mut self, code: u8, severity: u8);
}

/// MQTT publish sink for the subset of topics the core feeds (status,
/// alarms); subscription/command handling is out of scope here.
pub trait MqttSink {
    fn publish_status(&mut self, payload: &StatusPayload);
}

/// BLE scale driver, consumed by brew-by-weight. Quirks of any particular
/// scale protocol are entirely the implementor's concern; the core only
/// needs a weight/flow-rate sample and a staleness check.
pub trait ScaleSource {
    /// Latest weight in grams, `None` if no scale is connected or the last
    /// sample is stale.
    fn weight_g(&self) -> Option<f32>;
    fn flow_rate_g_per_s(&self) -> Option<f32>;
    fn is_stable(&self) -> bool;
}
