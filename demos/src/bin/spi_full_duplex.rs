//! Two boards exchange a message over SPI1 in full duplex, with blocking transfers. Both
//! boards send the same message while receiving the other's, and compare. The controller is
//! the SPI master and starts an exchange every second; the responder is the slave and waits
//! for it. Messages A and B alternate.
//!
//! Connect PA5 (SCK), PA6 (MISO), PA7 (MOSI) and GND of both boards. Flash one board with
//! `--features responder`.

#![no_std]
#![no_main]

use cortex_m_rt::{entry, exception};
use hal::{
    clocks::Clocks,
    mx,
    pac::{self, SPI1},
    spi::{Spi, SpiConfig, SpiRole},
    tick,
    transfer::{AppStatus, Exchange, MessagePair, Role},
};
use stm32u5_demos::{EXCHANGE_PERIOD_MS, MESSAGE_A, MESSAGE_B, MESSAGE_LEN};

const SPI_MAX_HZ: u32 = 1_000_000;

#[cfg(not(feature = "responder"))]
const ROLE: Role = Role::Controller;
#[cfg(feature = "responder")]
const ROLE: Role = Role::Responder;

struct App {
    spi: Spi<SPI1>,
    exchange: Exchange,
    messages: MessagePair<'static>,
    rx: [u8; MESSAGE_LEN],
}

fn app_init(regs: SPI1, clock_cfg: &Clocks) -> Option<App> {
    let cfg = match ROLE {
        Role::Controller => SpiConfig::default(),
        // The slave waits as long as it takes for the master to start.
        Role::Responder => SpiConfig {
            role: SpiRole::Slave,
            timeout_ms: tick::MAX_DELAY,
            ..Default::default()
        },
    };
    let spi = mx::mx_spi1_init(regs, cfg, SPI_MAX_HZ, clock_cfg).ok()?;

    defmt::info!("SPI full-duplex exchange: {}", ROLE);

    Some(App {
        spi,
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
    let outcome = app.exchange.run_full_duplex(&mut app.spi, tx, &mut app.rx);
    let status = stm32u5_demos::report(&outcome);

    if ROLE == Role::Controller && status == AppStatus::Ok {
        tick::delay(EXCHANGE_PERIOD_MS);
    }
    status
}

fn app_deinit(app: App) -> AppStatus {
    app.spi.deinit();
    AppStatus::Ok
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let dp = pac::Peripherals::take().unwrap();

    let clock_cfg = mx::mx_system_init(&mut cp.SYST).unwrap();

    stm32u5_demos::run(app_init(dp.SPI1, &clock_cfg), app_process, app_deinit)
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}
