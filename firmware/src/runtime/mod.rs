use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::adc::Adc;
use embassy_stm32::gpio::{Input, Level, Output, Pull, Speed};
use embassy_sync::channel::Channel;

use bilateral_core::config::DeviceRole;

use crate::actuator::MotorBank;
use crate::battery::BatteryAdc;
use crate::link::{InboundQueue, OutboundQueue};

mod control_task;
mod inputs_task;
mod link_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(super) static INBOUND_QUEUE: InboundQueue = Channel::new();
pub(super) static OUTBOUND_QUEUE: OutboundQueue = Channel::new();

pub(super) type Motors = MotorBank<Output<'static>>;

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        PA0,
        PA4,
        PA5,
        PA6,
        PA7,
        PA8,
        PA9,
        PB0,
        PB1,
        PB3,
        PB4,
        PC6,
        ADC1,
        USART5,
        ..
    } = hal::init(config);

    // Role strap: pulled up on the primary board, tied low on the secondary.
    let role = if Input::new(PB3, Pull::Up).is_high() {
        DeviceRole::Primary
    } else {
        DeviceRole::Secondary
    };
    defmt::info!("bilateral: booting as {}", role.name());

    let motors = MotorBank::new([
        Output::new(PA4, Level::Low, Speed::Low),
        Output::new(PA5, Level::Low, Speed::Low),
        Output::new(PA6, Level::Low, Speed::Low),
        Output::new(PA7, Level::Low, Speed::Low),
    ]);
    let battery = BatteryAdc::new(Adc::new(ADC1), PA0);

    spawner
        .spawn(link_task::run(&INBOUND_QUEUE, &OUTBOUND_QUEUE, USART5, PB0, PB1))
        .expect("failed to spawn link task");

    spawner
        .spawn(inputs_task::run(
            &INBOUND_QUEUE,
            Input::new(PA8, Pull::Down),
            (role == DeviceRole::Primary).then(|| Input::new(PA9, Pull::Down)),
            Input::new(PB4, Pull::Up),
            Output::new(PC6, Level::Low, Speed::Low),
        ))
        .expect("failed to spawn inputs task");

    spawner
        .spawn(control_task::run(role, &INBOUND_QUEUE, &OUTBOUND_QUEUE, motors, battery))
        .expect("failed to spawn control task");

    core::future::pending::<()>().await;
}
