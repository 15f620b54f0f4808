use embassy_futures::join::join;
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use static_cell::StaticCell;

use crate::link::{ControlEvent, InboundQueue, LINK_CHUNK_SIZE, OutboundQueue, chunks};

const LINK_UART_BUFFER_SIZE: usize = 256;
const RADIO_UART_BAUD: u32 = 115_200;
const ERROR_BACKOFF: Duration = Duration::from_millis(5);

static UART_TX_BUFFER: StaticCell<[u8; LINK_UART_BUFFER_SIZE]> = StaticCell::new();
static UART_RX_BUFFER: StaticCell<[u8; LINK_UART_BUFFER_SIZE]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

/// Shuttles bytes between the radio module UART and the control task.
#[embassy_executor::task]
pub async fn run(
    inbound: &'static InboundQueue,
    outbound: &'static OutboundQueue,
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = RADIO_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        UART_TX_BUFFER.init([0; LINK_UART_BUFFER_SIZE]),
        UART_RX_BUFFER.init([0; LINK_UART_BUFFER_SIZE]),
        UartIrqs,
        config,
    )
    .expect("failed to initialize radio UART");

    let (mut uart_tx, mut uart_rx) = uart.split();
    let frames = outbound.receiver();
    let events = inbound.sender();

    let to_radio = async move {
        loop {
            let frame = frames.receive().await;
            if uart_tx.write_all(&frame).await.is_err() {
                defmt::warn!("link: UART write error, dropped {} bytes", frame.len());
                Timer::after(ERROR_BACKOFF).await;
                continue;
            }
            if uart_tx.flush().await.is_err() {
                defmt::warn!("link: UART flush error");
                Timer::after(ERROR_BACKOFF).await;
            }
        }
    };

    let from_radio = async move {
        let mut ingress = [0u8; LINK_CHUNK_SIZE];
        loop {
            match uart_rx.read(&mut ingress).await {
                Ok(count) if count > 0 => {
                    for chunk in chunks(&ingress[..count]) {
                        events.send(ControlEvent::Bytes(chunk)).await;
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    defmt::warn!("link: UART read error");
                    Timer::after(ERROR_BACKOFF).await;
                }
            }
        }
    };

    join(to_radio, from_radio).await;
    loop {
        core::future::pending::<()>().await;
    }
}
