//! The shared-bus scheduler and the driver-indexed entry points.
//!
//! One SPI frame is in flight at any time. The end-of-receive interrupt
//! parses the readback for the driver that owned the frame and immediately
//! hands the bus to the next driver in the ring, so every driver sends one
//! frame before any sends two. The bus and chip selects live behind a
//! blocking mutex locked only for the few pin and register pokes around DMA
//! setup; the shared enable line has its own cell so the power-fail path
//! never contends with a frame in progress. Everything else shared with the
//! interrupt is a word-sized atomic.

#[cfg(not(test))]
use defmt::info;
#[cfg(test)]
use log::info;

use core::cell::RefCell;
use core::convert::Infallible;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::OutputPin;

use crate::driver::{DriverMode, DriverState};
use crate::regs::{self, Status};

/// The SPI controller behind the driver ring.
///
/// Implementations reset the controller for every frame: the TMC2660 latches
/// its shift register on a chip select edge, so each 3-byte exchange is
/// self-contained.
pub trait DriverBus {
    /// Reset the SPI controller, program a full-duplex 3-byte DMA exchange
    /// and enable the end-of-receive interrupt. The matching chip select is
    /// already low when this is called.
    fn start_exchange(&mut self, frame: [u8; 3]);

    /// The three bytes clocked in during the exchange that just completed.
    fn response(&mut self) -> [u8; 3];

    /// Enable the SPI interrupt vector ahead of the first exchange of a
    /// powered session.
    fn listen(&mut self);

    /// Disable the end-of-receive interrupt; the ring stops until the next
    /// power-up.
    fn halt(&mut self);
}

/// One driver's active-low chip select line.
pub trait ChipSelect {
    fn select(&mut self);
    fn deselect(&mut self);
}

impl<P> ChipSelect for P
where
    P: OutputPin<Error = Infallible>,
{
    fn select(&mut self) {
        let _ = self.set_low();
    }

    fn deselect(&mut self) {
        let _ = self.set_high();
    }
}

/// The shared active-low enable line powering the output stages of every
/// driver on the board.
pub trait EnableLine {
    fn enable(&mut self);
    fn disable(&mut self);
}

impl<P> EnableLine for P
where
    P: OutputPin<Error = Infallible>,
{
    fn enable(&mut self) {
        let _ = self.set_low();
    }

    fn disable(&mut self) {
        let _ = self.set_high();
    }
}

/// Live step timing from the motion planner.
pub trait StepTiming {
    /// Current full-step interval of an axis in step-clock ticks, 0 when the
    /// axis is not stepping. Called from the SPI interrupt, so it must be
    /// reentrant and lock-free.
    fn step_interval(&self, axis: u32, microstep_shift: u32) -> u32;
}

impl<T: StepTiming> StepTiming for &T {
    fn step_interval(&self, axis: u32, microstep_shift: u32) -> u32 {
        (*self).step_interval(axis, microstep_shift)
    }
}

// Ring slot meaning "no frame in flight".
const IDLE: usize = usize::MAX;

struct Io<B, P, const N: usize> {
    bus: B,
    selects: [P; N],
}

/// State machine for a ring of `N` drivers sharing one SPI bus.
///
/// All methods take `&self`: the controller is designed to sit in a static
/// and be reached from the main thread, the SPI interrupt and a tick
/// interrupt at once. The mutex type `M` must mask, while locked, every
/// interrupt that enters the controller (a critical section mutex on
/// single-core parts). Locks are held only for the pin and register
/// accesses they guard, never across status bookkeeping or calls into the
/// motion planner.
pub struct Controller<M, B, P, EN, T, const N: usize>
where
    M: RawMutex,
{
    io: Mutex<M, RefCell<Io<B, P, N>>>,
    // The enable line is deliberately not part of `io`: the tick-interrupt
    // power-fail path must reach it without sharing any state with the SPI
    // interrupt.
    enable: Mutex<M, RefCell<EN>>,
    drivers: [DriverState; N],
    timing: T,
    current: AtomicUsize,
    powered: AtomicBool,
}

impl<M, B, P, EN, T, const N: usize> Controller<M, B, P, EN, T, N>
where
    M: RawMutex,
    B: DriverBus,
    P: ChipSelect,
    EN: EnableLine,
    T: StepTiming,
{
    /// Build the controller with every driver disabled and flagged for a
    /// full register download. Axes are identity-mapped to driver slots
    /// until remapped. Power is assumed absent until the first `spin(true)`.
    pub fn new(bus: B, mut selects: [P; N], mut enable: EN, timing: T) -> Self {
        enable.disable();
        for select in &mut selects {
            select.deselect();
        }
        #[allow(clippy::cast_possible_truncation)]
        let drivers = core::array::from_fn(|i| DriverState::new(i as u32));
        Self {
            io: Mutex::new(RefCell::new(Io { bus, selects })),
            enable: Mutex::new(RefCell::new(enable)),
            drivers,
            timing,
            current: AtomicUsize::new(IDLE),
            powered: AtomicBool::new(false),
        }
    }

    /// Direct access to one driver's shadow state.
    pub fn driver(&self, index: usize) -> Option<&DriverState> {
        self.drivers.get(index)
    }

    pub fn set_axis_number(&self, driver: usize, axis: u32) {
        if let Some(d) = self.drivers.get(driver) {
            d.set_axis_number(axis);
        }
    }

    pub fn set_current(&self, driver: usize, milliamps: f32) {
        if let Some(d) = self.drivers.get(driver) {
            d.set_current(milliamps);
        }
    }

    pub fn enable_drive(&self, driver: usize, enable: bool) {
        if let Some(d) = self.drivers.get(driver) {
            d.enable(enable);
        }
    }

    pub fn read_live_status(&self, driver: usize) -> Status {
        self.drivers
            .get(driver)
            .map_or(Status::default(), DriverState::read_live_status)
    }

    pub fn read_accumulated_status(&self, driver: usize, bits_to_keep: u32) -> Status {
        self.drivers
            .get(driver)
            .map_or(Status::default(), |d| d.read_accumulated_status(bits_to_keep))
    }

    /// Set the microstep resolution and interpolation flag. `microsteps`
    /// must be a power of two in 1 ..= 256; anything else returns false and
    /// leaves the driver untouched.
    pub fn set_microstepping(&self, driver: usize, microsteps: u32, interpolate: bool) -> bool {
        let Some(d) = self.drivers.get(driver) else {
            return false;
        };
        if microsteps == 0 || microsteps > 256 || !microsteps.is_power_of_two() {
            return false;
        }
        d.set_microstepping(microsteps.trailing_zeros(), interpolate);
        true
    }

    /// Microstep count and interpolation flag; (1, false) for an unpopulated
    /// slot.
    pub fn microstepping(&self, driver: usize) -> (u32, bool) {
        self.drivers
            .get(driver)
            .map_or((1, false), DriverState::microstepping)
    }

    pub fn set_driver_mode(&self, driver: usize, mode: DriverMode) -> bool {
        self.drivers
            .get(driver)
            .map_or(false, |d| d.set_driver_mode(mode))
    }

    pub fn driver_mode(&self, driver: usize) -> Option<DriverMode> {
        self.drivers.get(driver).map(DriverState::driver_mode)
    }

    pub fn set_chopper_control(&self, driver: usize, value: u32) -> bool {
        self.drivers
            .get(driver)
            .map_or(false, |d| d.set_chop_conf(value))
    }

    pub fn chopper_control(&self, driver: usize) -> u32 {
        self.drivers.get(driver).map_or(0, DriverState::chop_conf)
    }

    pub fn set_off_time(&self, driver: usize, off_time: u32) -> bool {
        self.drivers
            .get(driver)
            .map_or(false, |d| d.set_off_time(off_time))
    }

    pub fn off_time(&self, driver: usize) -> u32 {
        self.drivers.get(driver).map_or(0, DriverState::off_time)
    }

    pub fn set_stall_threshold(&self, driver: usize, threshold: i32) {
        if let Some(d) = self.drivers.get(driver) {
            d.set_stall_threshold(threshold);
        }
    }

    pub fn set_stall_filter(&self, driver: usize, filtered: bool) {
        if let Some(d) = self.drivers.get(driver) {
            d.set_stall_filter(filtered);
        }
    }

    pub fn set_stall_minimum_steps_per_second(&self, driver: usize, steps_per_second: u32) {
        if let Some(d) = self.drivers.get(driver) {
            d.set_stall_minimum_steps_per_second(steps_per_second);
        }
    }

    pub fn set_cool_step(&self, driver: usize, config: u16) {
        if let Some(d) = self.drivers.get(driver) {
            d.set_cool_step(config);
        }
    }

    pub fn append_stall_config<W: fmt::Write>(&self, driver: usize, out: &mut W) -> fmt::Result {
        self.drivers
            .get(driver)
            .map_or(Ok(()), |d| d.append_stall_config(out))
    }

    pub fn append_driver_status<W: fmt::Write>(&self, driver: usize, out: &mut W) -> fmt::Result {
        self.drivers
            .get(driver)
            .map_or(Ok(()), |d| d.append_driver_status(out))
    }

    /// Track the driver power rail.
    ///
    /// On a rising edge the shared enable line is asserted, the chips get
    /// 10 us to wake, and every register of every driver is queued for
    /// retransmission. The ring is then (re)armed if no frame is in flight.
    /// On a falling edge the enable line is released; the interrupt notices
    /// the power state at its next completion and stops re-arming.
    pub fn spin<D: DelayUs<u32>>(&self, powered: bool, delay: &mut D) {
        let was_powered = self.powered.swap(powered, Ordering::AcqRel);
        if powered {
            if !was_powered {
                info!("driver power up, resyncing {} drivers", N);
                self.enable.lock(|enable| enable.borrow_mut().enable());
                delay.delay_us(10);
                for driver in &self.drivers {
                    driver.write_all();
                }
            }
            if N != 0 && self.current.load(Ordering::Acquire) == IDLE {
                self.io.lock(|io| {
                    let io = &mut *io.borrow_mut();
                    // Re-check under the lock; the interrupt cannot run here
                    // but an earlier spin may already have armed the ring.
                    if self.current.load(Ordering::Acquire) == IDLE {
                        io.bus.listen();
                        self.start_transfer(0, io);
                    }
                });
            }
        } else if was_powered {
            info!("driver power lost");
            self.enable.lock(|enable| enable.borrow_mut().disable());
        }
    }

    /// Emergency stop for the power-fail path. Callable from a tick
    /// interrupt even while `spin` or the SPI interrupt is executing: it
    /// touches only the enable cell, never the bus lock, so it does not wait
    /// on a frame in progress. The enable line is released immediately and
    /// the ring parks itself at the next frame completion.
    pub fn turn_drivers_off(&self) {
        self.enable.lock(|enable| enable.borrow_mut().disable());
        self.powered.store(false, Ordering::Release);
    }

    /// Send the next pending register of driver `index`. Runs with the io
    /// lock held, which keeps the SPI interrupt masked during DMA setup.
    fn start_transfer(&self, index: usize, io: &mut Io<B, P, N>) {
        self.current.store(index, Ordering::Release);
        let value = self.drivers[index].take_pending_register();
        io.selects[index].select();
        io.bus.start_exchange(regs::encode_frame(value));
    }

    /// End-of-receive interrupt body: parse the completed frame and hand the
    /// bus to the next driver in the ring, or park it if power is gone.
    ///
    /// The bus lock is taken twice, each time for a handful of register
    /// accesses. Status decoding, telemetry updates and the step-interval
    /// query run between the two sections with no interrupts masked; they
    /// touch only atomics and the caller-supplied motion planner.
    pub fn on_spi_interrupt(&self) {
        let index = self.current.load(Ordering::Acquire);
        if index != IDLE {
            let response = self.io.lock(|io| {
                let io = &mut *io.borrow_mut();
                io.selects[index].deselect();
                io.bus.response()
            });
            if self.powered.load(Ordering::Acquire) {
                let driver = &self.drivers[index];
                let interval = self
                    .timing
                    .step_interval(driver.axis_number(), driver.microstep_shift());
                driver.complete_transfer(regs::decode_status(response), interval);
                let next = if index + 1 == N { 0 } else { index + 1 };
                self.io
                    .lock(|io| self.start_transfer(next, &mut *io.borrow_mut()));
                return;
            }
        }
        // Power is down or nothing was in flight: stop polling.
        self.io.lock(|io| io.borrow_mut().bus.halt());
        self.current.store(IDLE, Ordering::Release);
    }
}

#[cfg(not(any(not(test), target_arch = "arm")))]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::string::String;
    use std::vec::Vec;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::{ChipSelect, Controller, DriverBus, EnableLine, StepTiming};
    use crate::driver::DriverMode;
    use crate::regs::{self, chopconf, drvctrl, sgcsconf, Status};
    use crate::STEP_CLOCK_HZ;

    #[derive(Default)]
    struct BusLog {
        frames: RefCell<Vec<[u8; 3]>>,
        reply: Cell<[u8; 3]>,
        listening: Cell<bool>,
        halts: Cell<u32>,
    }

    struct ScriptBus(Rc<BusLog>);

    impl DriverBus for ScriptBus {
        fn start_exchange(&mut self, frame: [u8; 3]) {
            self.0.frames.borrow_mut().push(frame);
        }

        fn response(&mut self) -> [u8; 3] {
            self.0.reply.get()
        }

        fn listen(&mut self) {
            self.0.listening.set(true);
        }

        fn halt(&mut self) {
            self.0.halts.set(self.0.halts.get() + 1);
        }
    }

    // true = chip select asserted (line low).
    struct CsPin(Rc<Cell<bool>>);

    impl ChipSelect for CsPin {
        fn select(&mut self) {
            self.0.set(true);
        }

        fn deselect(&mut self) {
            self.0.set(false);
        }
    }

    // true = enable line asserted (drivers powered on).
    struct EnablePin(Rc<Cell<bool>>);

    impl EnableLine for EnablePin {
        fn enable(&mut self) {
            self.0.set(true);
        }

        fn disable(&mut self) {
            self.0.set(false);
        }
    }

    // Reports the same interval for every axis.
    struct Planner(Rc<Cell<u32>>);

    impl StepTiming for Planner {
        fn step_interval(&self, _axis: u32, _microstep_shift: u32) -> u32 {
            self.0.get()
        }
    }

    struct NoDelay;

    impl embedded_hal::blocking::delay::DelayUs<u32> for NoDelay {
        fn delay_us(&mut self, _us: u32) {}
    }

    type TestController<const N: usize> =
        Controller<NoopRawMutex, ScriptBus, CsPin, EnablePin, Planner, N>;

    struct Rig<const N: usize> {
        controller: TestController<N>,
        bus: Rc<BusLog>,
        cs: [Rc<Cell<bool>>; N],
        enable: Rc<Cell<bool>>,
        interval: Rc<Cell<u32>>,
    }

    impl<const N: usize> Rig<N> {
        fn new() -> Self {
            let bus = Rc::new(BusLog::default());
            let cs: [Rc<Cell<bool>>; N] = core::array::from_fn(|_| Rc::new(Cell::new(true)));
            let enable = Rc::new(Cell::new(true));
            let interval = Rc::new(Cell::new(0));
            let controller = Controller::new(
                ScriptBus(bus.clone()),
                core::array::from_fn(|i| CsPin(cs[i].clone())),
                EnablePin(enable.clone()),
                Planner(interval.clone()),
            );
            Self {
                controller,
                bus,
                cs,
                enable,
                interval,
            }
        }

        fn power_up(&self) {
            self.controller.spin(true, &mut NoDelay);
        }

        // Complete `count` in-flight frames, letting the ring advance.
        fn pump(&self, count: usize) {
            for _ in 0..count {
                self.controller.on_spi_interrupt();
            }
        }

        // Power up and drain the initial full register download plus the
        // frame left in flight, so the next frames are keep-alives.
        fn drain(&self) {
            self.power_up();
            self.pump(5 * N);
            self.bus.frames.borrow_mut().clear();
        }

        fn sent(&self) -> Vec<[u8; 3]> {
            self.bus.frames.borrow().clone()
        }
    }

    fn frame_value(frame: [u8; 3]) -> u32 {
        u32::from(frame[0]) << 16 | u32::from(frame[1]) << 8 | u32::from(frame[2])
    }

    fn address(frame: [u8; 3]) -> u32 {
        frame_value(frame) & !regs::DATA_MASK
    }

    // The reply occupies the top 20 of the 24 received bits.
    fn reply_frame(status: u32) -> [u8; 3] {
        let wire = status << 4;
        [(wire >> 16) as u8, (wire >> 8) as u8, wire as u8]
    }

    #[test]
    fn construction_leaves_bus_quiet() {
        let rig = Rig::<4>::new();
        assert!(!rig.enable.get());
        assert!(rig.cs.iter().all(|cs| !cs.get()));
        assert!(rig.sent().is_empty());
        assert_eq!(rig.controller.read_live_status(0), Status::default());
    }

    #[test]
    fn power_up_downloads_every_register_round_robin() {
        let rig = Rig::<4>::new();
        rig.power_up();
        assert!(rig.enable.get());
        assert!(rig.bus.listening.get());
        // Driver 0's first frame is in flight with only its select asserted.
        assert!(rig.cs[0].get());
        assert!(!rig.cs[1].get() && !rig.cs[2].get() && !rig.cs[3].get());

        rig.pump(19);
        let sent = rig.sent();
        assert_eq!(sent.len(), 20);
        // Priority order per driver, round-robin across drivers: four
        // DRVCTRL frames, then four SGCSCONF frames, and so on.
        let expected = [
            regs::REG_DRVCTRL,
            regs::REG_SGCSCONF,
            regs::REG_CHOPCONF,
            regs::REG_DRVCONF,
            regs::REG_SMARTEN,
        ];
        for (i, frame) in sent.iter().enumerate() {
            assert_eq!(address(*frame), expected[i / 4], "frame {i}");
        }

        // With nothing dirty the ring falls back to coolStep keep-alives.
        rig.pump(4);
        let sent = rig.sent();
        for frame in &sent[20..] {
            assert_eq!(address(*frame), regs::REG_SMARTEN);
        }
    }

    #[test]
    fn microstepping_round_trip() {
        let rig = Rig::<1>::new();
        rig.drain();

        assert!(rig.controller.set_microstepping(0, 16, true));
        rig.pump(1);
        let frame = *rig.sent().last().unwrap();
        assert_eq!(address(frame), regs::REG_DRVCTRL);
        assert_eq!(frame_value(frame) & drvctrl::MRES_MASK, 4);
        assert_ne!(frame_value(frame) & drvctrl::INTPOL, 0);
        assert_eq!(rig.controller.microstepping(0), (16, true));

        assert!(rig.controller.set_microstepping(0, 256, false));
        assert_eq!(rig.controller.microstepping(0), (256, false));

        // Rejected values leave the configuration untouched.
        for bad in [0, 3, 12, 512, 1024] {
            assert!(!rig.controller.set_microstepping(0, bad, true));
        }
        assert!(!rig.controller.set_microstepping(9, 16, true));
        assert_eq!(rig.controller.microstepping(0), (256, false));
        assert_eq!(rig.controller.microstepping(9), (1, false));
    }

    #[test]
    fn enable_rewrites_only_the_off_time() {
        let rig = Rig::<1>::new();
        rig.drain();

        // Already disabled: no frame beyond the keep-alive.
        rig.controller.enable_drive(0, false);
        rig.pump(1);
        assert_eq!(address(*rig.sent().last().unwrap()), regs::REG_SMARTEN);

        rig.controller.enable_drive(0, true);
        rig.pump(1);
        let frame = *rig.sent().last().unwrap();
        assert_eq!(address(frame), regs::REG_CHOPCONF);
        assert_eq!(frame_value(frame) & chopconf::TOFF_MASK, 4);

        // Enabling twice queues nothing new.
        rig.controller.enable_drive(0, true);
        rig.pump(1);
        assert_eq!(address(*rig.sent().last().unwrap()), regs::REG_SMARTEN);

        rig.controller.enable_drive(0, false);
        rig.pump(1);
        let frame = *rig.sent().last().unwrap();
        assert_eq!(address(frame), regs::REG_CHOPCONF);
        assert_eq!(frame_value(frame) & chopconf::TOFF_MASK, 0);
        // The user's off time survives the disable.
        assert_eq!(rig.controller.off_time(0), 4);
    }

    #[test]
    fn stall_flag_suppressed_outside_step_window() {
        let rig = Rig::<1>::new();
        rig.power_up();
        rig.controller.enable_drive(0, true);
        rig.controller.set_stall_minimum_steps_per_second(0, 100);
        let max_interval = STEP_CLOCK_HZ / 100;

        // Stepping too slowly: stall flag and load window are both ignored.
        rig.interval.set(STEP_CLOCK_HZ / 50);
        rig.bus
            .reply
            .set(reply_frame(Status::SG | (500 << Status::LOAD_SHIFT)));
        rig.pump(1);
        assert!(!rig.controller.read_live_status(0).stalled());
        let mut report = String::new();
        rig.controller.append_driver_status(0, &mut report).unwrap();
        assert!(report.contains("SG min/max not available"), "{report}");

        // Exactly at the window boundary the flag is honored.
        rig.interval.set(max_interval);
        rig.pump(1);
        let status = rig.controller.read_live_status(0);
        assert!(status.stalled());
        let mut report = String::new();
        rig.controller.append_driver_status(0, &mut report).unwrap();
        assert!(report.contains("SG min/max 500/500"), "{report}");

        // One tick past the boundary it is suppressed again.
        rig.interval.set(max_interval + 1);
        rig.pump(1);
        assert!(!rig.controller.read_live_status(0).stalled());

        // Not stepping at all.
        rig.interval.set(0);
        rig.pump(1);
        assert!(!rig.controller.read_live_status(0).stalled());
    }

    #[test]
    fn live_status_hides_stall_while_disabled() {
        let rig = Rig::<1>::new();
        rig.power_up();
        rig.controller.enable_drive(0, true);
        rig.controller.set_stall_minimum_steps_per_second(0, 100);
        rig.interval.set(STEP_CLOCK_HZ / 200);
        rig.bus.reply.set(reply_frame(Status::SG));
        rig.pump(1);
        assert!(rig.controller.read_live_status(0).stalled());

        rig.controller.enable_drive(0, false);
        assert!(!rig.controller.read_live_status(0).stalled());

        // Re-enabling clears the latched stall flag in the same observation.
        rig.controller.enable_drive(0, true);
        assert!(!rig.controller.read_live_status(0).stalled());
        assert!(!rig
            .controller
            .read_accumulated_status(0, u32::MAX)
            .stalled());
    }

    #[test]
    fn accumulated_status_clears_only_consumed_bits() {
        let rig = Rig::<1>::new();
        rig.power_up();
        rig.controller.enable_drive(0, true);
        rig.controller.set_stall_minimum_steps_per_second(0, 100);
        rig.interval.set(STEP_CLOCK_HZ / 150);

        rig.bus.reply.set(reply_frame(Status::SG));
        rig.pump(1);
        rig.bus.reply.set(reply_frame(Status::OT));
        rig.pump(1);

        // Consume everything except the overtemperature latch.
        let drained = rig.controller.read_accumulated_status(0, Status::OT);
        assert!(drained.stalled());
        assert!(drained.over_temperature());

        rig.bus.reply.set(reply_frame(Status::OTPW));
        rig.pump(1);
        let drained = rig.controller.read_accumulated_status(0, 0);
        assert!(!drained.stalled());
        assert!(drained.over_temperature());
        assert!(drained.over_temperature_warning());

        // Fully drained: nothing new has occurred since.
        assert_eq!(rig.controller.read_accumulated_status(0, u32::MAX).bits(), 0);
    }

    #[test]
    fn current_encoding_is_clamped() {
        let rig = Rig::<1>::new();
        rig.drain();

        let cs_field = |rig: &Rig<1>| {
            let frame = *rig.sent().last().unwrap();
            assert_eq!(address(frame), regs::REG_SGCSCONF);
            frame_value(frame) & sgcsconf::CS_MASK
        };

        rig.controller.set_current(0, 50.0);
        rig.pump(1);
        assert_eq!(cs_field(&rig), 0); // clamped up to 100 mA

        rig.controller.set_current(0, 2000.0);
        rig.pump(1);
        assert_eq!(cs_field(&rig), (32 * 2000 - 1600) / 3236);

        rig.controller.set_current(0, 5000.0);
        rig.pump(1);
        assert_eq!(cs_field(&rig), (32 * 2400 - 1600) / 3236); // clamped down
    }

    #[test]
    fn power_cycle_forces_full_resync() {
        let rig = Rig::<2>::new();
        rig.drain();

        // A single setter queues a single register frame; the ring needs up
        // to one full revolution of keep-alives to reach driver 0 again.
        assert!(rig.controller.set_microstepping(0, 32, false));
        rig.pump(2);
        let drvctrl_frames = rig
            .sent()
            .iter()
            .filter(|f| address(**f) == regs::REG_DRVCTRL)
            .count();
        assert_eq!(drvctrl_frames, 1);

        // Power drops: the ring parks at the next completion.
        rig.controller.spin(false, &mut NoDelay);
        assert!(!rig.enable.get());
        rig.pump(1);
        assert_eq!(rig.bus.halts.get(), 1);
        assert!(rig.cs.iter().all(|cs| !cs.get()));
        rig.bus.frames.borrow_mut().clear();

        // Power returns: every register of every driver goes out before the
        // first keep-alive, including the registers never touched since init.
        rig.controller.spin(true, &mut NoDelay);
        assert!(rig.enable.get());
        rig.pump(10);
        let sent = rig.sent();
        assert_eq!(sent.len(), 11); // 2 x 5 register frames + 1 keep-alive in flight
        for reg in [
            regs::REG_DRVCTRL,
            regs::REG_SGCSCONF,
            regs::REG_CHOPCONF,
            regs::REG_DRVCONF,
            regs::REG_SMARTEN,
        ] {
            let count = sent[..10].iter().filter(|f| address(**f) == reg).count();
            assert_eq!(count, 2, "register {reg:#x}");
        }
        assert_eq!(address(sent[10]), regs::REG_SMARTEN);
    }

    #[test]
    fn turn_drivers_off_is_immediate() {
        let rig = Rig::<1>::new();
        rig.power_up();
        rig.pump(2);
        rig.controller.turn_drivers_off();
        assert!(!rig.enable.get());

        let frames = rig.sent().len();
        rig.pump(1);
        assert_eq!(rig.sent().len(), frames);
        assert_eq!(rig.bus.halts.get(), 1);
        assert!(!rig.cs[0].get());
    }

    #[test]
    fn off_time_validation() {
        let rig = Rig::<1>::new();

        assert!(!rig.controller.set_off_time(0, 0));
        assert!(!rig.controller.set_off_time(0, 16));
        assert!(rig.controller.set_off_time(0, 15));
        assert_eq!(rig.controller.off_time(0), 15);
        assert!(rig.controller.set_off_time(0, 1)); // default blanking != 0

        // With zero blanking an off time of 1 would lock the device up.
        let chop = chopconf::toff(2) | chopconf::hstrt(3) | chopconf::hend(3);
        assert!(rig.controller.set_chopper_control(0, chop));
        assert!(!rig.controller.set_off_time(0, 1));
        assert_eq!(rig.controller.off_time(0), 2);
    }

    #[test]
    fn chopper_control_round_trip() {
        let rig = Rig::<1>::new();

        let value = chopconf::tbl(1)
            | chopconf::hdec(2)
            | chopconf::hend(7)
            | chopconf::hstrt(5)
            | chopconf::toff(9);
        assert!(rig.controller.set_chopper_control(0, value | 0xFFFE_0000));
        assert_eq!(rig.controller.chopper_control(0), value);

        assert!(!rig.controller.set_chopper_control(0, chopconf::tbl(2)));
        assert_eq!(rig.controller.chopper_control(0), value);
    }

    #[test]
    fn driver_mode_maps_to_chopper_bits() {
        let rig = Rig::<1>::new();

        assert_eq!(rig.controller.driver_mode(0), Some(DriverMode::SpreadCycle));

        assert!(rig
            .controller
            .set_driver_mode(0, DriverMode::ConstantOffTime));
        assert_eq!(
            rig.controller.driver_mode(0),
            Some(DriverMode::ConstantOffTime)
        );
        assert_ne!(rig.controller.chopper_control(0) & chopconf::CHM, 0);
        assert_eq!(rig.controller.chopper_control(0) & chopconf::RNDTF, 0);

        assert!(rig.controller.set_driver_mode(0, DriverMode::RandomOffTime));
        assert_eq!(
            rig.controller.driver_mode(0),
            Some(DriverMode::RandomOffTime)
        );

        assert!(rig.controller.set_driver_mode(0, DriverMode::SpreadCycle));
        assert_eq!(
            rig.controller.chopper_control(0) & (chopconf::CHM | chopconf::RNDTF),
            0
        );

        assert_eq!(rig.controller.driver_mode(3), None);
    }

    #[test]
    fn out_of_range_indices_are_ignored() {
        let rig = Rig::<2>::new();

        rig.controller.set_current(7, 1200.0);
        rig.controller.enable_drive(7, true);
        rig.controller.set_stall_threshold(7, 10);
        rig.controller.set_cool_step(7, 0x1234);
        assert!(!rig.controller.set_off_time(7, 4));
        assert!(!rig.controller.set_chopper_control(7, chopconf::toff(4)));
        assert_eq!(rig.controller.chopper_control(7), 0);
        assert_eq!(rig.controller.off_time(7), 0);
        assert_eq!(rig.controller.read_live_status(7), Status::default());
        assert_eq!(
            rig.controller.read_accumulated_status(7, u32::MAX),
            Status::default()
        );

        let mut report = String::new();
        rig.controller.append_driver_status(7, &mut report).unwrap();
        rig.controller.append_stall_config(7, &mut report).unwrap();
        assert!(report.is_empty());

        // Nothing got queued for the real drivers.
        rig.drain();
        rig.pump(1);
        assert_eq!(address(*rig.sent().last().unwrap()), regs::REG_SMARTEN);
    }

    #[test]
    fn stall_config_report() {
        let rig = Rig::<1>::new();
        rig.controller.set_stall_threshold(0, -10);
        rig.controller.set_stall_filter(0, true);
        rig.controller.set_stall_minimum_steps_per_second(0, 250);
        rig.controller.set_cool_step(0, 0x00A1);

        let mut report = String::new();
        rig.controller.append_stall_config(0, &mut report).unwrap();
        assert_eq!(report, "stall threshold -10, filter on, steps/sec 250, coolstep a1");
    }

    #[test]
    fn driver_status_report_flags() {
        let rig = Rig::<1>::new();
        rig.power_up();
        rig.controller.enable_drive(0, true);

        rig.bus
            .reply
            .set(reply_frame(Status::OT | Status::S2G | Status::OLA));
        rig.pump(1);
        let mut report = String::new();
        rig.controller.append_driver_status(0, &mut report).unwrap();
        assert!(report.contains("temperature-shutdown!"), "{report}");
        assert!(report.contains("short-to-ground"), "{report}");
        assert!(report.contains("open-load-A"), "{report}");

        // Open load flags are meaningless at standstill.
        rig.bus.reply.set(reply_frame(Status::OLA | Status::STST));
        rig.pump(1);
        let mut report = String::new();
        rig.controller.append_driver_status(0, &mut report).unwrap();
        assert!(!report.contains("open-load-A"), "{report}");
        assert!(report.contains("standstill"), "{report}");

        rig.bus.reply.set(reply_frame(0));
        rig.pump(1);
        let mut report = String::new();
        rig.controller.append_driver_status(0, &mut report).unwrap();
        assert!(report.contains(" ok"), "{report}");
    }
}
