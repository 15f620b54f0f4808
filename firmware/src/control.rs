//! Glue between queued [`ControlEvent`]s and the controller.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use bilateral_core::controller::{Controller, ControllerError};
use bilateral_core::dispatcher::Actuator;
use bilateral_core::session::SessionState;
use bilateral_core::time::Instant;

use crate::inputs::ButtonAction;
use crate::link::{ControlEvent, QueueTransport};
use crate::status;

pub type Device<'a, A> = Controller<A, QueueTransport<'a>>;

/// Applies one inbound event at `now`.
///
/// `seed` is only consumed when the event starts a session.
pub fn handle_event<A: Actuator>(
    controller: &mut Device<'_, A>,
    event: ControlEvent,
    now: Instant,
    seed: u32,
) -> Result<(), ControllerError> {
    match event {
        ControlEvent::Bytes(chunk) => {
            let accepted = controller.on_receive(&chunk);
            if accepted < chunk.len() {
                log_overflow(chunk.len() - accepted);
            }
        }
        ControlEvent::PeerUp => {
            controller.transport_mut().set_connected(true);
            status::record_peer_link(true);
            controller.on_connected(now);
        }
        ControlEvent::PeerDown => {
            controller.transport_mut().set_connected(false);
            status::record_peer_link(false);
            controller.on_disconnected(now);
        }
        ControlEvent::PhoneUp => controller.on_phone_restored(now),
        ControlEvent::PhoneDown => controller.on_phone_lost(now),
        ControlEvent::Button(ButtonAction::Emergency) => controller.emergency_stop(now)?,
        ControlEvent::Button(ButtonAction::Toggle) => toggle_session(controller, now, seed)?,
    }
    Ok(())
}

fn toggle_session<A: Actuator>(
    controller: &mut Device<'_, A>,
    now: Instant,
    seed: u32,
) -> Result<(), ControllerError> {
    match controller.current_state() {
        SessionState::Ready => controller.start_session(now, seed),
        SessionState::Running
        | SessionState::Paused
        | SessionState::LowBattery
        | SessionState::PhoneDisconnected => controller.stop_session(now),
        SessionState::Error => controller.reset(now),
        _ => Ok(()),
    }
}

/// Copies the controller's externally visible state into the status atomics.
pub fn publish<A: Actuator>(controller: &Device<'_, A>) {
    status::record_state(controller.current_state());
    let (offset, valid) = controller.current_offset();
    status::record_offset(offset, valid);
}

#[cfg(target_os = "none")]
pub fn log_rejected(err: ControllerError) {
    defmt::warn!("control: {}", defmt::Display2Format(&err));
}

#[cfg(not(target_os = "none"))]
pub fn log_rejected(err: ControllerError) {
    println!("control: {err}");
}

#[cfg(target_os = "none")]
fn log_overflow(dropped: usize) {
    defmt::warn!("control: receive ring full, dropped {} bytes", dropped);
}

#[cfg(not(target_os = "none"))]
fn log_overflow(dropped: usize) {
    println!("control: receive ring full, dropped {dropped} bytes");
}
