//! Motor driver outputs.
//!
//! Each finger has one enable line on the motor driver. The driver handles
//! resonance tracking itself, so the MCU only switches channels on and off;
//! an amplitude of zero leaves the channel released.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use bilateral_core::dispatcher::Actuator;
use bilateral_core::pattern::{FINGER_COUNT, Finger};

use crate::status;

/// Single enable line for one motor channel.
pub trait DrivePin {
    fn set_driven(&mut self, driven: bool);
}

/// Four enable lines indexed by [`Finger`].
pub struct MotorBank<P: DrivePin> {
    pins: [P; FINGER_COUNT],
    driven: [bool; FINGER_COUNT],
}

impl<P: DrivePin> MotorBank<P> {
    /// Takes ownership of the lines and releases every channel.
    pub fn new(mut pins: [P; FINGER_COUNT]) -> Self {
        for (index, pin) in pins.iter_mut().enumerate() {
            pin.set_driven(false);
            status::record_channel(index, false);
        }
        Self {
            pins,
            driven: [false; FINGER_COUNT],
        }
    }

    pub fn is_driven(&self, finger: Finger) -> bool {
        self.driven[finger.as_index()]
    }

    fn drive(&mut self, finger: Finger, driven: bool) {
        let index = finger.as_index();
        self.pins[index].set_driven(driven);
        self.driven[index] = driven;
        status::record_channel(index, driven);
    }
}

impl<P: DrivePin> Actuator for MotorBank<P> {
    fn activate(&mut self, finger: Finger, amplitude: u8) {
        self.drive(finger, amplitude > 0);
    }

    fn deactivate(&mut self, finger: Finger) {
        self.drive(finger, false);
    }
}

#[cfg(target_os = "none")]
impl DrivePin for embassy_stm32::gpio::Output<'static> {
    fn set_driven(&mut self, driven: bool) {
        if driven {
            self.set_high();
        } else {
            self.set_low();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bilateral_core::pattern::ALL_FINGERS;

    #[derive(Default)]
    struct FakePin {
        level: bool,
        writes: u8,
    }

    impl DrivePin for FakePin {
        fn set_driven(&mut self, driven: bool) {
            self.level = driven;
            self.writes += 1;
        }
    }

    fn bank() -> MotorBank<FakePin> {
        MotorBank::new([
            FakePin::default(),
            FakePin::default(),
            FakePin::default(),
            FakePin::default(),
        ])
    }

    #[test]
    fn construction_releases_every_line() {
        let bank = bank();
        assert!(bank.pins.iter().all(|pin| pin.writes == 1 && !pin.level));
    }

    #[test]
    fn zero_amplitude_keeps_the_channel_released() {
        let mut bank = bank();
        bank.activate(Finger::Ring, 0);
        assert!(!bank.is_driven(Finger::Ring));

        bank.activate(Finger::Ring, 80);
        assert!(bank.is_driven(Finger::Ring));
        assert!(bank.pins[Finger::Ring.as_index()].level);
    }

    #[test]
    fn deactivate_all_releases_driven_channels() {
        let mut bank = bank();
        bank.activate(Finger::Index, 100);
        bank.activate(Finger::Pinky, 100);

        bank.deactivate_all();

        assert!(ALL_FINGERS.iter().all(|finger| !bank.is_driven(*finger)));
    }
}
