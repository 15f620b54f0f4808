use embassy_futures::select::{Either, select};
use embassy_time::{Instant as EmbassyInstant, Timer};

use bilateral_core::config::{ControllerConfig, DeviceRole};
use bilateral_core::controller::Controller;
use bilateral_core::time::Instant;

use super::Motors;
use crate::battery::BatteryAdc;
use crate::control::{self, Device};
use crate::link::{InboundQueue, OutboundQueue, QueueTransport};
use crate::status;
use crate::telemetry;
use crate::timebase;

/// Retry spacing for a first battery read the ADC could not complete.
const BATTERY_RETRY: core::time::Duration = core::time::Duration::from_millis(10);

fn now() -> Instant {
    timebase::to_core(EmbassyInstant::now())
}

/// Session seed from the free-running timer; only needs to differ per session.
#[allow(clippy::cast_possible_truncation)]
fn session_seed() -> u32 {
    let micros = EmbassyInstant::now().as_micros();
    (micros ^ (micros >> 32)) as u32
}

/// Owns the controller and runs its cooperative loop.
#[embassy_executor::task]
pub async fn run(
    role: DeviceRole,
    inbound: &'static InboundQueue,
    outbound: &'static OutboundQueue,
    motors: Motors,
    mut battery: BatteryAdc<'static>,
) -> ! {
    let transport = QueueTransport::new(outbound.sender());
    let mut controller: Device<'static, Motors> =
        Controller::new(ControllerConfig::for_role(role), motors, transport);
    let events = inbound.receiver();
    let mut battery_floor: Option<Instant> = None;

    loop {
        let current = now();
        let floor_passed = battery_floor.is_none_or(|floor| current.has_reached(floor));
        if floor_passed && controller.battery_sample_due(current) {
            match battery.sample() {
                Some(millivolts) => {
                    battery_floor = None;
                    status::record_battery(millivolts);
                    controller.on_battery_sample(millivolts, current);
                }
                None => {
                    defmt::warn!("control: battery read failed");
                    // Keep the schedule moving on the last good reading.
                    match status::battery_mv() {
                        Some(previous) => controller.on_battery_sample(previous, current),
                        None => battery_floor = Some(current + BATTERY_RETRY),
                    }
                }
            }
        }

        controller.poll(current);
        control::publish(&controller);
        telemetry::mirror(controller.telemetry_mut());

        let wake = timebase::wake_at(controller.next_deadline(), current, battery_floor);
        match select(events.receive(), Timer::at(timebase::to_embassy(wake))).await {
            Either::First(event) => {
                if let Err(err) = control::handle_event(&mut controller, event, now(), session_seed()) {
                    control::log_rejected(err);
                }
            }
            Either::Second(()) => {}
        }
    }
}
