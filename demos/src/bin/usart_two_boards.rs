//! Two boards exchange a message over USART1 in synchronous mode. The controller is the
//! synchronous master and drives the clock on PA8; the responder is a synchronous slave.
//! The controller sends a message, then clocks the echo back in by sending filler frames;
//! the responder receives the message and loads it for sending. Messages A and B alternate.
//!
//! Connect PA8 (CK) to PA8, cross PA9 (TX) and PA10 (RX), and connect GND. Flash one board
//! with `--features responder`.

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
    usart::{SyncMode, Usart, UsartConfig, UsartEvent},
};
use stm32u5_demos::{EXCHANGE_PERIOD_MS, MESSAGE_A, MESSAGE_B, MESSAGE_LEN};

const BAUD: u32 = 115_200;
/// Time the master leaves the slave to load its reply before clocking it in, in ms.
const TURNAROUND_MS: u32 = 2;

#[cfg(not(feature = "responder"))]
const ROLE: Role = Role::Controller;
#[cfg(feature = "responder")]
const ROLE: Role = Role::Responder;

/// Sent by the master while it receives, to generate the clock.
static FILLER: [u8; MESSAGE_LEN] = [0xff; MESSAGE_LEN];

make_globals!((USART, Usart<USART1>));

static FLAGS: TransferFlags = TransferFlags::new();

struct UsartLink;

fn with_usart<T>(f: impl FnOnce(&mut Usart<USART1>) -> Result<T, Error>) -> Result<T, Error> {
    critical_section::with(|cs| match USART.borrow(cs).borrow_mut().as_mut() {
        Some(usart) => f(usart),
        None => Err(Error::InvalidParam),
    })
}

impl ComLink for UsartLink {
    fn start_tx(&mut self, buf: &[u8]) -> Result<(), Error> {
        with_usart(|usart| usart.write_it(buf))
    }

    fn start_rx(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let len = buf.len();
        with_usart(|usart| usart.read_it(buf))?;

        if ROLE == Role::Controller {
            tick::delay(TURNAROUND_MS);
            with_usart(|usart| usart.write_it(&FILLER[..len]))?;
        }
        Ok(())
    }

    fn last_error(&self) -> u32 {
        with_usart(|usart| Ok(usart.last_error())).unwrap_or(0)
    }

    fn abort(&mut self) {
        let _ = with_usart(|usart| {
            usart.abort();
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
    link: UsartLink,
    exchange: Exchange,
    messages: MessagePair<'static>,
    rx: [u8; MESSAGE_LEN],
}

fn app_init(regs: USART1, clock_cfg: &Clocks) -> Option<App> {
    let sync = match ROLE {
        Role::Controller => SyncMode::Master {
            cpol: false,
            cpha: false,
            last_bit_clock: true,
        },
        Role::Responder => SyncMode::Slave {
            cpol: false,
            cpha: false,
        },
    };
    let cfg = UsartConfig {
        sync,
        ..Default::default()
    };
    let usart = mx::mx_usart1_init(regs, BAUD, cfg, clock_cfg).ok()?;
    init_globals!((USART, usart));

    cortex::enable_irq(pac::Interrupt::USART1);

    defmt::info!("USART synchronous two-board exchange: {}", ROLE);

    Some(App {
        link: UsartLink,
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
        if let Some(usart) = USART.borrow(cs).take() {
            usart.deinit();
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
        access_global!(USART, usart, cs);
        match usart.on_interrupt() {
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
