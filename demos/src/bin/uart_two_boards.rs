//! Two boards exchange a message over USART1 in asynchronous (UART) mode, with interrupt
//! transfers. The controller sends a message, then receives the echo and compares; the
//! responder receives the message and sends it back. Messages A and B alternate.
//!
//! Cross PA9 (TX) and PA10 (RX) between the boards, and connect GND. Flash one board with
//! `--features responder`.

#![no_std]
#![no_main]

use cortex_m::asm;
use cortex_m_rt::{entry, exception};
use hal::{
    access_global,
    clocks::Clocks,
    cortex,
    error::Error,
    init_globals, make_globals, mx,
    pac::{self, USART1, interrupt},
    tick,
    transfer::{AppStatus, ComLink, Exchange, MessagePair, Role, TransferFlags},
    usart::{Usart, UsartConfig, UsartEvent},
};
use stm32u5_demos::{EXCHANGE_PERIOD_MS, MESSAGE_A, MESSAGE_B, MESSAGE_LEN};

const BAUD: u32 = 115_200;

#[cfg(not(feature = "responder"))]
const ROLE: Role = Role::Controller;
#[cfg(feature = "responder")]
const ROLE: Role = Role::Responder;

make_globals!((UART, Usart<USART1>));

static FLAGS: TransferFlags = TransferFlags::new();

struct UartLink;

fn with_uart<T>(f: impl FnOnce(&mut Usart<USART1>) -> Result<T, Error>) -> Result<T, Error> {
    critical_section::with(|cs| match UART.borrow(cs).borrow_mut().as_mut() {
        Some(uart) => f(uart),
        None => Err(Error::InvalidParam),
    })
}

impl ComLink for UartLink {
    fn start_tx(&mut self, buf: &[u8]) -> Result<(), Error> {
        with_uart(|uart| uart.write_it(buf))
    }

    fn start_rx(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        with_uart(|uart| uart.read_it(buf))
    }

    fn last_error(&self) -> u32 {
        with_uart(|uart| Ok(uart.last_error())).unwrap_or(0)
    }

    fn abort(&mut self) {
        let _ = with_uart(|uart| {
            uart.abort();
            Ok(())
        });
    }

    fn wait_for_interrupt(&mut self) {
        asm::wfi();
    }

    fn delay_ms(&mut self, ms: u32) {
        tick::delay(ms);
    }
}

struct App {
    link: UartLink,
    exchange: Exchange,
    messages: MessagePair<'static>,
    rx: [u8; MESSAGE_LEN],
}

fn app_init(regs: USART1, clock_cfg: &Clocks) -> Option<App> {
    let uart = mx::mx_usart1_init(regs, BAUD, UsartConfig::default(), clock_cfg).ok()?;
    init_globals!((UART, uart));

    cortex::enable_irq(pac::Interrupt::USART1);

    defmt::info!("UART two-board exchange: {}", ROLE);

    Some(App {
        link: UartLink,
        exchange: Exchange {
            retry_delay_ms: 10,
            ..Exchange::new(ROLE)
        },
        messages: MessagePair::new(MESSAGE_A, MESSAGE_B),
        rx: [0; MESSAGE_LEN],
    })
}

fn app_process(app: &mut App) -> AppStatus {
    let tx = app.messages.next();
    let outcome = app.exchange.run(&mut app.link, &FLAGS, tx, &mut app.rx);
    let status = stm32u5_demos::report(&outcome);

    if ROLE == Role::Controller && status == AppStatus::Ok {
        tick::delay(EXCHANGE_PERIOD_MS);
    }
    status
}

fn app_deinit(_app: App) -> AppStatus {
    cortex::disable_irq(pac::Interrupt::USART1);
    critical_section::with(|cs| {
        if let Some(uart) = UART.borrow(cs).take() {
            uart.deinit();
        }
    });
    AppStatus::Ok
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let dp = pac::Peripherals::take().unwrap();

    let clock_cfg = mx::mx_system_init(&mut cp.SYST).unwrap();

    stm32u5_demos::run(app_init(dp.USART1, &clock_cfg), app_process, app_deinit)
}

#[interrupt]
fn USART1() {
    critical_section::with(|cs| {
        access_global!(UART, uart, cs);
        match uart.on_interrupt() {
            Some(UsartEvent::TxComplete) => FLAGS.set_tx_complete(),
            Some(UsartEvent::RxComplete) => FLAGS.set_rx_complete(),
            Some(UsartEvent::Error(_)) => FLAGS.set_error(),
            None => (),
        }
    });
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}
