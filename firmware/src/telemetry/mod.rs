//! Mirrors controller telemetry to the debug console.
//!
//! The core records structured events in its ring buffer; this module drains
//! the records the console has not seen yet and prints them through defmt on
//! the target or stdout on host builds.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use bilateral_core::controller::Telemetry;
use bilateral_core::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecord};
use bilateral_core::time::Instant;

/// Console level used for a telemetry event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Picks the console level for an event.
pub const fn severity(event: TelemetryEventKind) -> Severity {
    match event {
        TelemetryEventKind::ConnectionLost
        | TelemetryEventKind::ReconnectFailed
        | TelemetryEventKind::ActuatorsForcedOff => Severity::Error,
        TelemetryEventKind::LateActivation(_)
        | TelemetryEventKind::SyncFailed
        | TelemetryEventKind::SampleRejected
        | TelemetryEventKind::StaleCommand
        | TelemetryEventKind::MalformedFrame
        | TelemetryEventKind::KeepaliveMissed
        | TelemetryEventKind::PhoneLost
        | TelemetryEventKind::TransportError
        | TelemetryEventKind::CommandRejected => Severity::Warn,
        _ => Severity::Info,
    }
}

/// Logs every record added since the previous call. Returns how many.
pub fn mirror(telemetry: &mut Telemetry) -> usize {
    let mut emitted = 0;
    telemetry.drain_new(|record| {
        log_record(record);
        emitted += 1;
    });
    emitted
}

fn log_record(record: &TelemetryRecord<Instant>) {
    let level = severity(record.event);
    let timestamp_us = record.timestamp.as_micros();
    match record.details {
        TelemetryPayload::Transition(transition) => emit_transition(
            level,
            timestamp_us,
            transition.from.name(),
            transition.to.name(),
        ),
        TelemetryPayload::Sync(sync) => {
            emit_value(level, timestamp_us, record.event, "offset_us", sync.offset_us);
        }
        TelemetryPayload::Lateness(late) => emit_value(
            level,
            timestamp_us,
            record.event,
            "late_us",
            i64::try_from(late.as_micros()).unwrap_or(i64::MAX),
        ),
        TelemetryPayload::Sequence { rejected, .. } => {
            emit_value(level, timestamp_us, record.event, "seq", i64::from(rejected));
        }
        TelemetryPayload::Link { count } => {
            emit_value(level, timestamp_us, record.event, "count", i64::from(count));
        }
        TelemetryPayload::Count(count) => {
            emit_value(level, timestamp_us, record.event, "count", i64::from(count));
        }
        TelemetryPayload::Battery { millivolts, .. } => {
            emit_value(level, timestamp_us, record.event, "mv", i64::from(millivolts));
        }
        TelemetryPayload::None => emit_event(level, timestamp_us, record.event),
    }
}

#[cfg(target_os = "none")]
fn emit_transition(level: Severity, timestamp_us: u64, from: &'static str, to: &'static str) {
    match level {
        Severity::Info => defmt::info!("telemetry:state {} -> {} t={}us", from, to, timestamp_us),
        Severity::Warn => defmt::warn!("telemetry:state {} -> {} t={}us", from, to, timestamp_us),
        Severity::Error => {
            defmt::error!("telemetry:state {} -> {} t={}us", from, to, timestamp_us);
        }
    }
}

#[cfg(not(target_os = "none"))]
fn emit_transition(level: Severity, timestamp_us: u64, from: &'static str, to: &'static str) {
    println!("telemetry:state [{level:?}] {from} -> {to} t={timestamp_us}us");
}

#[cfg(target_os = "none")]
fn emit_value(
    level: Severity,
    timestamp_us: u64,
    event: TelemetryEventKind,
    label: &'static str,
    value: i64,
) {
    let event = defmt::Display2Format(&event);
    match level {
        Severity::Info => defmt::info!("telemetry:{} {}={} t={}us", event, label, value, timestamp_us),
        Severity::Warn => defmt::warn!("telemetry:{} {}={} t={}us", event, label, value, timestamp_us),
        Severity::Error => {
            defmt::error!("telemetry:{} {}={} t={}us", event, label, value, timestamp_us);
        }
    }
}

#[cfg(not(target_os = "none"))]
fn emit_value(
    level: Severity,
    timestamp_us: u64,
    event: TelemetryEventKind,
    label: &'static str,
    value: i64,
) {
    println!("telemetry:{event} [{level:?}] {label}={value} t={timestamp_us}us");
}

#[cfg(target_os = "none")]
fn emit_event(level: Severity, timestamp_us: u64, event: TelemetryEventKind) {
    let event = defmt::Display2Format(&event);
    match level {
        Severity::Info => defmt::info!("telemetry:{} t={}us", event, timestamp_us),
        Severity::Warn => defmt::warn!("telemetry:{} t={}us", event, timestamp_us),
        Severity::Error => defmt::error!("telemetry:{} t={}us", event, timestamp_us),
    }
}

#[cfg(not(target_os = "none"))]
fn emit_event(level: Severity, timestamp_us: u64, event: TelemetryEventKind) {
    println!("telemetry:{event} [{level:?}] t={timestamp_us}us");
}
