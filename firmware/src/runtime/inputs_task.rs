use embassy_stm32::gpio::{Input, Output};
use embassy_time::{Duration, Instant, Ticker};

use crate::inputs::{ButtonTracker, Debounced, SAMPLE_PERIOD};
use crate::link::{ControlEvent, InboundQueue};
use crate::status;

/// Samples the radio status pins and the session button, and drives the
/// status LED from the shared snapshot.
#[embassy_executor::task]
pub async fn run(
    inbound: &'static InboundQueue,
    peer_pin: Input<'static>,
    phone_pin: Option<Input<'static>>,
    button_pin: Input<'static>,
    mut led: Output<'static>,
) -> ! {
    let events = inbound.sender();
    let mut peer = Debounced::new(false);
    let mut phone = Debounced::new(false);
    let mut button = ButtonTracker::new();
    let mut ticker = Ticker::every(Duration::from_micros(
        u64::try_from(SAMPLE_PERIOD.as_micros()).unwrap_or(10_000),
    ));
    let started = Instant::now();

    loop {
        ticker.next().await;

        if let Some(up) = peer.update(peer_pin.is_high()) {
            defmt::info!("inputs: peer link {}", if up { "up" } else { "down" });
            let event = if up { ControlEvent::PeerUp } else { ControlEvent::PeerDown };
            events.send(event).await;
        }

        if let Some(pin) = phone_pin.as_ref()
            && let Some(up) = phone.update(pin.is_high())
        {
            let event = if up { ControlEvent::PhoneUp } else { ControlEvent::PhoneDown };
            events.send(event).await;
        }

        // Button pulls the line low while pressed.
        if let Some(action) = button.update(button_pin.is_low()) {
            events.send(ControlEvent::Button(action)).await;
        }

        let elapsed = core::time::Duration::from_micros(started.elapsed().as_micros());
        let pattern = status::indicator(&status::snapshot());
        if status::indicator_level(pattern, elapsed) {
            led.set_high();
        } else {
            led.set_low();
        }
    }
}
