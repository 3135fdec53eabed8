//! Two boards exchange a message over I2C1, with interrupt transfers. The controller writes a
//! message to the responder's address, then reads it back and compares; the responder
//! receives it and echoes it. Messages A and B alternate on each exchange.
//!
//! Connect PB8 (SCL), PB9 (SDA) and GND of both boards, with pull-ups on SCL and SDA. Flash
//! one board with `--features responder`.

#![no_std]
#![no_main]

use cortex_m::asm;
use cortex_m_rt::{entry, exception};
use hal::{
    access_global,
    clocks::Clocks,
    cortex,
    error::Error,
    i2c::{I2c, I2cConfig, I2cEvent},
    init_globals, make_globals, mx,
    pac::{self, I2C1, interrupt},
    tick,
    transfer::{AppStatus, ComLink, Exchange, MessagePair, Role, TransferFlags},
};
use stm32u5_demos::{EXCHANGE_PERIOD_MS, MESSAGE_A, MESSAGE_B, MESSAGE_LEN};

/// The responder's 7-bit address.
const RESPONDER_ADDR: u16 = 0x30;

#[cfg(not(feature = "responder"))]
const ROLE: Role = Role::Controller;
#[cfg(feature = "responder")]
const ROLE: Role = Role::Responder;

make_globals!((I2C, I2c<I2C1>));

static FLAGS: TransferFlags = TransferFlags::new();

/// The I2C handle lives in a global, shared with its interrupt handlers.
struct I2cLink;

fn with_i2c<T>(f: impl FnOnce(&mut I2c<I2C1>) -> Result<T, Error>) -> Result<T, Error> {
    critical_section::with(|cs| match I2C.borrow(cs).borrow_mut().as_mut() {
        Some(i2c) => f(i2c),
        None => Err(Error::InvalidParam),
    })
}

impl ComLink for I2cLink {
    fn start_tx(&mut self, buf: &[u8]) -> Result<(), Error> {
        match ROLE {
            Role::Controller => with_i2c(|i2c| i2c.write_it(RESPONDER_ADDR, buf)),
            Role::Responder => with_i2c(|i2c| i2c.slave_write_it(buf)),
        }
    }

    fn start_rx(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        match ROLE {
            Role::Controller => with_i2c(|i2c| i2c.read_it(RESPONDER_ADDR, buf)),
            Role::Responder => with_i2c(|i2c| i2c.slave_read_it(buf)),
        }
    }

    fn last_error(&self) -> u32 {
        with_i2c(|i2c| Ok(i2c.last_error())).unwrap_or(0)
    }

    fn abort(&mut self) {
        let _ = with_i2c(|i2c| {
            i2c.abort();
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
    link: I2cLink,
    exchange: Exchange,
    messages: MessagePair<'static>,
    rx: [u8; MESSAGE_LEN],
}

fn app_init(regs: I2C1, clock_cfg: &Clocks) -> Option<App> {
    let cfg = I2cConfig {
        speed: 400_000,
        own_address: (ROLE == Role::Responder).then_some(RESPONDER_ADDR),
        ..Default::default()
    };
    let i2c = mx::mx_i2c1_init(regs, cfg, clock_cfg).ok()?;
    init_globals!((I2C, i2c));

    cortex::enable_irq(pac::Interrupt::I2C1_EV);
    cortex::enable_irq(pac::Interrupt::I2C1_ER);

    defmt::info!("I2C two-board exchange: {}", ROLE);

    Some(App {
        link: I2cLink,
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
    cortex::disable_irq(pac::Interrupt::I2C1_EV);
    cortex::disable_irq(pac::Interrupt::I2C1_ER);
    critical_section::with(|cs| {
        if let Some(i2c) = I2C.borrow(cs).take() {
            i2c.deinit();
        }
    });
    AppStatus::Ok
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let dp = pac::Peripherals::take().unwrap();

    let clock_cfg = mx::mx_system_init(&mut cp.SYST).unwrap();

    stm32u5_demos::run(app_init(dp.I2C1, &clock_cfg), app_process, app_deinit)
}

fn on_i2c_interrupt() {
    critical_section::with(|cs| {
        access_global!(I2C, i2c, cs);
        match i2c.on_interrupt() {
            Some(I2cEvent::TxComplete) => FLAGS.set_tx_complete(),
            Some(I2cEvent::RxComplete) => FLAGS.set_rx_complete(),
            Some(I2cEvent::Error(_)) => FLAGS.set_error(),
            None => (),
        }
    });
}

#[interrupt]
fn I2C1_EV() {
    on_i2c_interrupt();
}

#[interrupt]
fn I2C1_ER() {
    on_i2c_interrupt();
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}
