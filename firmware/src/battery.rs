//! Battery voltage sampling.
//!
//! The cell is measured through a resistor divider on an ADC pin. The ADC
//! reference is the MCU supply, which sags together with the cell, so every
//! reading is paired with a VREFINT conversion and scaled by the factory
//! calibration constant rather than assuming a fixed 3.3 V rail.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

/// Supply voltage at which VREFINT_CAL was captured.
pub const VREFINT_CAL_MV: u32 = 3_000;
/// Full-scale count of the 12-bit converter.
pub const ADC_FULL_SCALE: u32 = 4_095;
/// Cell voltage is divided by this before reaching the pin.
pub const DIVIDER_RATIO: u32 = 2;

/// Supply voltage implied by a VREFINT reading, if the reading is usable.
pub fn supply_millivolts(vrefint_cal: u16, vrefint_raw: u16) -> Option<u32> {
    if vrefint_raw == 0 {
        return None;
    }
    Some(VREFINT_CAL_MV * u32::from(vrefint_cal) / u32::from(vrefint_raw))
}

/// Converts a divided cell reading into cell millivolts.
#[allow(clippy::cast_possible_truncation)]
pub fn cell_millivolts(vrefint_cal: u16, vrefint_raw: u16, cell_raw: u16) -> Option<u16> {
    let supply = supply_millivolts(vrefint_cal, vrefint_raw)?;
    let pin_mv = supply * u32::from(cell_raw) / ADC_FULL_SCALE;
    let cell = pin_mv * DIVIDER_RATIO;
    Some(cell.min(u32::from(u16::MAX)) as u16)
}

#[cfg(target_os = "none")]
pub use target::BatteryAdc;

#[cfg(target_os = "none")]
mod target {
    use core::ptr;

    use embassy_stm32::Peri;
    use embassy_stm32::adc::{Adc, SampleTime, VrefInt};
    use embassy_stm32::peripherals::{ADC1, PA0};

    use super::cell_millivolts;

    /// Factory-programmed VREFINT reading taken at 3.0 V.
    const VREFINT_CAL_ADDR: *const u16 = 0x1FFF_75AA as *const u16;

    fn read_vrefint_calibration() -> u16 {
        unsafe { ptr::read_volatile(VREFINT_CAL_ADDR) }
    }

    /// Blocking ADC reader for the battery divider.
    pub struct BatteryAdc<'d> {
        adc: Adc<'d, ADC1>,
        vrefint: VrefInt,
        cell: Peri<'d, PA0>,
        calibration: u16,
        discard_next: bool,
    }

    impl<'d> BatteryAdc<'d> {
        pub fn new(mut adc: Adc<'d, ADC1>, cell: Peri<'d, PA0>) -> Self {
            adc.set_sample_time(SampleTime::CYCLES160_5);
            let vrefint = adc.enable_vrefint();
            Self {
                adc,
                vrefint,
                cell,
                calibration: read_vrefint_calibration(),
                discard_next: true,
            }
        }

        /// Takes one paired reading; `None` when the reference read back zero.
        pub fn sample(&mut self) -> Option<u16> {
            if self.discard_next {
                // First conversion after enabling VREFINT is unsettled.
                let _ = self.adc.blocking_read(&mut self.vrefint);
                self.discard_next = false;
            }

            let vrefint_raw = self.adc.blocking_read(&mut self.vrefint);
            let cell_raw = self.adc.blocking_read(&mut self.cell);
            cell_millivolts(self.calibration, vrefint_raw, cell_raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_supply_matches_calibration() {
        assert_eq!(supply_millivolts(1_650, 1_650), Some(3_000));
        assert_eq!(supply_millivolts(1_650, 1_500), Some(3_300));
        assert_eq!(supply_millivolts(1_650, 0), None);
    }

    #[test]
    fn divided_reading_scales_back_to_the_cell() {
        // 3.3 V rail, pin at half scale.
        let cell = cell_millivolts(1_650, 1_500, 2_048).expect("usable reference");
        assert!((3_290..=3_310).contains(&cell), "cell {cell} mV");
    }
}
