//#![deny(warnings)]
#![no_std]
#![no_main]

mod bus;
mod steps;

use atsam4_hal as _;
use defmt_rtt as _;
use panic_probe as _;

defmt::timestamp!("{=u64:us}", {
    app::monotonics::now().duration_since_epoch().to_micros()
});

#[rtic::app(device = atsam4_hal::pac, dispatchers = [AES, USART0, USART1])]
mod app {
    use atsam4_hal as hal;

    use defmt::info;
    use dwt_systick_monotonic::DwtSystick;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embedded_hal::blocking::delay::DelayUs;
    use embedded_hal::digital::v2::InputPin;
    use fugit::ExtU64;
    use hal::{
        clock::{ClockController, MainClock, SlowClock},
        gpio::{GpioExt, Input, Output, Pc12, Pc14, PioX, Ports, PullUp, PushPull},
        watchdog::{Watchdog, WatchdogDisable},
    };
    use static_cell::StaticCell;
    use tmc2660::{Controller, SPI_CLOCK_HZ};

    use crate::bus::PdcBus;
    use crate::steps::StepPlan;

    const MONO_HZ: u32 = 120_000_000;
    #[monotonic(binds = SysTick, default = true, priority = 1)]
    type Monotonic = DwtSystick<MONO_HZ>;

    /// Driver slots populated on this board.
    const NUM_DRIVERS: usize = 4;

    type BoardPin = PioX<Output<PushPull>>;
    type Drivers =
        Controller<CriticalSectionRawMutex, PdcBus, BoardPin, BoardPin, &'static StepPlan, NUM_DRIVERS>;

    static DRIVERS: StaticCell<Drivers> = StaticCell::new();
    static STEP_PLAN: StepPlan = StepPlan::new();

    /// Busy-wait delay for the short settle times in the power-up path.
    pub struct CycleDelay;

    impl DelayUs<u32> for CycleDelay {
        fn delay_us(&mut self, us: u32) {
            cortex_m::asm::delay(us * (MONO_HZ / 1_000_000));
        }
    }

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        drivers: &'static Drivers,
        isr_drivers: &'static Drivers,
        tick_drivers: &'static Drivers,
        power_good: Pc12<Input<PullUp>>,
        power_fail: Pc14<Input<PullUp>>,
        delay: CycleDelay,
    }

    #[init]
    fn init(mut ctx: init::Context) -> (Shared, Local, init::Monotonics) {
        let mut clocks = ClockController::new(
            ctx.device.PMC,
            &ctx.device.SUPC,
            &ctx.device.EFC,
            MainClock::Crystal12Mhz,
            SlowClock::RcOscillator32Khz,
        );

        let gpio_ports = Ports::new(
            (
                ctx.device.PIOA,
                clocks.peripheral_clocks.pio_a.into_enabled_clock(),
            ),
            (
                ctx.device.PIOB,
                clocks.peripheral_clocks.pio_b.into_enabled_clock(),
            ),
            (
                ctx.device.PIOC,
                clocks.peripheral_clocks.pio_c.into_enabled_clock(),
            ),
            (
                ctx.device.PIOD,
                clocks.peripheral_clocks.pio_d.into_enabled_clock(),
            ),
            (
                ctx.device.PIOE,
                clocks.peripheral_clocks.pio_e.into_enabled_clock(),
            ),
        );

        Watchdog::new(ctx.device.WDT).disable();

        let pins = gpio_ports.split();
        let matrix = &ctx.device.MATRIX;

        // SPI pins are fixed function; chip selects are paced by software.
        let _miso = pins.pa12.into_peripheral_function_a(matrix);
        let _mosi = pins.pa13.into_peripheral_function_a(matrix);
        let _spck = pins.pa14.into_peripheral_function_a(matrix);

        let chip_selects: [BoardPin; NUM_DRIVERS] = [
            pins.pd25.into_push_pull_output(matrix).downgrade(),
            pins.pd26.into_push_pull_output(matrix).downgrade(),
            pins.pd27.into_push_pull_output(matrix).downgrade(),
            pins.pd28.into_push_pull_output(matrix).downgrade(),
        ];
        let enable = pins.pd29.into_push_pull_output(matrix).downgrade();
        let power_good = pins.pc12.into_pull_up_input(matrix);
        let power_fail = pins.pc14.into_pull_up_input(matrix);

        let bus = PdcBus::new(
            ctx.device.SPI,
            clocks.peripheral_clocks.spi.into_enabled_clock(),
            SPI_CLOCK_HZ,
        );

        let drivers: &'static Drivers =
            DRIVERS.init(Controller::new(bus, chip_selects, enable, &STEP_PLAN));

        let mono = DwtSystick::new(
            &mut ctx.core.DCB,
            ctx.core.DWT,
            ctx.core.SYST,
            MONO_HZ,
        );

        info!("motionboard up, {} driver slots", NUM_DRIVERS);
        poll_power::spawn().ok();
        tick::spawn().ok();

        (
            Shared {},
            Local {
                drivers,
                isr_drivers: drivers,
                tick_drivers: drivers,
                power_good,
                power_fail,
                delay: CycleDelay,
            },
            init::Monotonics(mono),
        )
    }

    /// End-of-receive interrupt: one driver's frame has completed and the
    /// ring advances.
    #[task(binds = SPI, priority = 3, local = [isr_drivers])]
    fn spi(ctx: spi::Context) {
        ctx.local.isr_drivers.on_spi_interrupt();
    }

    /// Track the driver power rail and keep the ring running.
    #[task(priority = 1, local = [drivers, power_good, delay])]
    fn poll_power(ctx: poll_power::Context) {
        let powered = matches!(ctx.local.power_good.is_high(), Ok(true));
        ctx.local.drivers.spin(powered, ctx.local.delay);
        poll_power::spawn_after(2u64.millis()).ok();
    }

    /// Fast supply monitor. Runs above the SPI interrupt; `turn_drivers_off`
    /// shares no lock with the ring, so a brown-out releases the enable line
    /// without waiting for a frame in progress.
    #[task(priority = 4, local = [tick_drivers, power_fail])]
    fn tick(ctx: tick::Context) {
        if matches!(ctx.local.power_fail.is_low(), Ok(true)) {
            ctx.local.tick_drivers.turn_drivers_off();
        }
        tick::spawn_after(1u64.millis()).ok();
    }
}
