//! Shadow state for a single TMC2660.
//!
//! Every field shared with the polling interrupt is a word-sized atomic: the
//! main thread runs the setters, the bus interrupt drains the dirty mask and
//! stores telemetry, and neither side ever blocks the other. A register word
//! is always stored before its dirty bit is raised, so the interrupt cannot
//! send a stale value.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use defmt::Format;

use crate::regs::{self, chopconf, drvctrl, sgcsconf, Status};
use crate::STEP_CLOCK_HZ;

/// Chopper commutation variants, selected through the CHM and RNDTF bits.
#[derive(Debug, Format, PartialEq, Eq, Clone, Copy)]
pub enum DriverMode {
    SpreadCycle,
    ConstantOffTime,
    RandomOffTime,
}

// Register indices in send-priority order, most urgent first.
pub(crate) const DRIVE_CONTROL: usize = 0;
pub(crate) const STALL_GUARD_CONFIG: usize = 1;
pub(crate) const CHOPPER_CONTROL: usize = 2;
pub(crate) const DRIVE_CONFIG: usize = 3;
pub(crate) const SMART_ENABLE: usize = 4;
pub(crate) const NUM_REGISTERS: usize = 5;

const ALL_REGISTERS: u32 = (1 << NUM_REGISTERS as u32) - 1;

/// Motor current ceiling in milliamps.
pub const MAX_MOTOR_CURRENT: f32 = 2400.0;

// x16 microstepping with interpolation, stall detection tuned for roughly one
// revolution per second on a 1.8 degree motor, as the datasheet suggests.
const DEFAULT_MICROSTEP_SHIFT: u32 = 4;
const DEFAULT_STALL_THRESHOLD: i32 = 1;
const DEFAULT_MIN_STEPS_PER_SECOND: u32 = 200;

/// Shadow registers and runtime telemetry of one driver.
pub struct DriverState {
    registers: [AtomicU32; NUM_REGISTERS],
    dirty: AtomicU32,
    configured_chop: AtomicU32,
    enabled: AtomicBool,
    axis_number: AtomicU32,
    microstep_shift: AtomicU32,
    max_stall_interval: AtomicU32,
    min_load: AtomicU32,
    max_load: AtomicU32,
    last_status: AtomicU32,
    accumulated_status: AtomicU32,
}

impl DriverState {
    pub(crate) fn new(axis_number: u32) -> Self {
        let mut registers = [0; NUM_REGISTERS];
        registers[DRIVE_CONTROL] = regs::DEFAULT_DRVCTRL;
        registers[STALL_GUARD_CONFIG] = regs::DEFAULT_SGCSCONF;
        // Zero off time keeps the driver disabled at startup.
        registers[CHOPPER_CONTROL] = regs::DEFAULT_CHOPCONF & !chopconf::TOFF_MASK;
        registers[DRIVE_CONFIG] = regs::DEFAULT_DRVCONF;
        registers[SMART_ENABLE] = regs::DEFAULT_SMARTEN;
        let state = Self {
            registers: registers.map(AtomicU32::new),
            dirty: AtomicU32::new(ALL_REGISTERS),
            configured_chop: AtomicU32::new(regs::DEFAULT_CHOPCONF),
            enabled: AtomicBool::new(false),
            axis_number: AtomicU32::new(axis_number),
            microstep_shift: AtomicU32::new(DEFAULT_MICROSTEP_SHIFT),
            max_stall_interval: AtomicU32::new(0),
            min_load: AtomicU32::new(1023),
            max_load: AtomicU32::new(0),
            last_status: AtomicU32::new(0),
            accumulated_status: AtomicU32::new(0),
        };
        state.set_microstepping(DEFAULT_MICROSTEP_SHIFT, true);
        state.set_stall_threshold(DEFAULT_STALL_THRESHOLD);
        state.set_stall_filter(false);
        state.set_stall_minimum_steps_per_second(DEFAULT_MIN_STEPS_PER_SECOND);
        state
    }

    /// Update one shadow register and flag it for transmission.
    fn update_register(&self, index: usize, value: u32) {
        self.registers[index].store(value, Ordering::Relaxed);
        self.dirty.fetch_or(1 << index, Ordering::Release);
    }

    pub fn set_axis_number(&self, axis: u32) {
        self.axis_number.store(axis, Ordering::Relaxed);
    }

    pub fn axis_number(&self) -> u32 {
        self.axis_number.load(Ordering::Relaxed)
    }

    pub fn microstep_shift(&self) -> u32 {
        self.microstep_shift.load(Ordering::Relaxed)
    }

    /// Set the motor current in milliamps, clamped to 100 ..= 2400 mA.
    ///
    /// The scale formula assumes 0.051 ohm sense resistors in the high
    /// sensitivity range (VSENSE set), which gives 101 mA per scale step up
    /// to 3.236 A. Boards with a different sense resistor need a different
    /// divisor here.
    pub fn set_current(&self, milliamps: f32) {
        let milliamps = milliamps.clamp(100.0, MAX_MOTOR_CURRENT) as u32;
        let cs_bits = (32 * milliamps - 1600) / 3236;
        let value = (self.registers[STALL_GUARD_CONFIG].load(Ordering::Relaxed)
            & !sgcsconf::CS_MASK)
            | sgcsconf::cs(cs_bits);
        self.update_register(STALL_GUARD_CONFIG, value);
    }

    /// Logically enable or disable the driver.
    ///
    /// The device has no enable input; a zero off time in the chopper
    /// register stops commutation instead. Enabling clears the stall flag
    /// from both status words because the device will not refresh it until
    /// the motor reaches the next full step position.
    pub fn enable(&self, enable: bool) {
        if self.enabled.load(Ordering::Relaxed) == enable {
            return;
        }
        if enable {
            self.accumulated_status.fetch_and(!Status::SG, Ordering::Relaxed);
            self.last_status.fetch_and(!Status::SG, Ordering::Relaxed);
        }
        self.enabled.store(enable, Ordering::Relaxed);
        self.update_chop_conf();
    }

    fn update_chop_conf(&self) {
        let configured = self.configured_chop.load(Ordering::Relaxed);
        let value = if self.enabled.load(Ordering::Relaxed) {
            configured
        } else {
            configured & !chopconf::TOFF_MASK
        };
        self.update_register(CHOPPER_CONTROL, value);
    }

    /// Validate and adopt a new chopper configuration, keeping the current
    /// enable state. Returns false for an off time of 0 (that would disable
    /// the driver) and for an off time of 1 with zero blanking (the device
    /// would lock up); the old configuration stays in place.
    pub fn set_chop_conf(&self, value: u32) -> bool {
        let toff = value & chopconf::TOFF_MASK;
        if toff == 0 || (toff == 1 && value & chopconf::TBL_MASK == 0) {
            return false;
        }
        self.configured_chop
            .store((value & regs::DATA_MASK) | regs::REG_CHOPCONF, Ordering::Relaxed);
        self.update_chop_conf();
        true
    }

    pub fn chop_conf(&self) -> u32 {
        self.configured_chop.load(Ordering::Relaxed) & regs::DATA_MASK
    }

    /// Replace only the off time field of the chopper configuration.
    pub fn set_off_time(&self, off_time: u32) -> bool {
        if off_time > 15 {
            return false;
        }
        let configured = self.configured_chop.load(Ordering::Relaxed);
        self.set_chop_conf((configured & !chopconf::TOFF_MASK) | chopconf::toff(off_time))
    }

    pub fn off_time(&self) -> u32 {
        self.configured_chop.load(Ordering::Relaxed) & chopconf::TOFF_MASK
    }

    pub fn set_driver_mode(&self, mode: DriverMode) -> bool {
        let configured = self.configured_chop.load(Ordering::Relaxed);
        let value = match mode {
            DriverMode::SpreadCycle => configured & !(chopconf::RNDTF | chopconf::CHM),
            DriverMode::ConstantOffTime => (configured & !chopconf::RNDTF) | chopconf::CHM,
            DriverMode::RandomOffTime => configured | chopconf::RNDTF | chopconf::CHM,
        };
        self.set_chop_conf(value)
    }

    pub fn driver_mode(&self) -> DriverMode {
        let configured = self.configured_chop.load(Ordering::Relaxed);
        if configured & chopconf::CHM == 0 {
            DriverMode::SpreadCycle
        } else if configured & chopconf::RNDTF == 0 {
            DriverMode::ConstantOffTime
        } else {
            DriverMode::RandomOffTime
        }
    }

    /// Set the microstep resolution to `1 << shift` (shift 0 ..= 8) and the
    /// step interpolation flag.
    pub fn set_microstepping(&self, shift: u32, interpolate: bool) {
        let shift = shift.min(8);
        self.microstep_shift.store(shift, Ordering::Relaxed);
        let mut value =
            self.registers[DRIVE_CONTROL].load(Ordering::Relaxed) & !drvctrl::MRES_MASK;
        value |= drvctrl::mres(8 - shift);
        if interpolate {
            value |= drvctrl::INTPOL;
        } else {
            value &= !drvctrl::INTPOL;
        }
        self.update_register(DRIVE_CONTROL, value);
    }

    /// Microstep count and interpolation flag.
    pub fn microstepping(&self) -> (u32, bool) {
        let interpolation =
            self.registers[DRIVE_CONTROL].load(Ordering::Relaxed) & drvctrl::INTPOL != 0;
        (1 << self.microstep_shift.load(Ordering::Relaxed), interpolation)
    }

    /// Stall threshold, clamped to -64 ..= 63 and encoded as 7-bit two's
    /// complement in the SGT field.
    pub fn set_stall_threshold(&self, threshold: i32) {
        #[allow(clippy::cast_sign_loss)]
        let sgt = (threshold.clamp(-64, 63) as u32) & 127;
        let value = (self.registers[STALL_GUARD_CONFIG].load(Ordering::Relaxed)
            & !sgcsconf::SGT_MASK)
            | (sgt << sgcsconf::SGT_SHIFT);
        self.update_register(STALL_GUARD_CONFIG, value);
    }

    pub fn set_stall_filter(&self, filtered: bool) {
        let value = self.registers[STALL_GUARD_CONFIG].load(Ordering::Relaxed);
        let value = if filtered {
            value | sgcsconf::SFILT
        } else {
            value & !sgcsconf::SFILT
        };
        self.update_register(STALL_GUARD_CONFIG, value);
    }

    /// Slowest step rate at which stall readings are still meaningful; below
    /// it the interrupt suppresses the stall flag.
    pub fn set_stall_minimum_steps_per_second(&self, steps_per_second: u32) {
        self.max_stall_interval
            .store(STEP_CLOCK_HZ / steps_per_second.max(1), Ordering::Relaxed);
    }

    pub fn set_cool_step(&self, config: u16) {
        self.update_register(SMART_ENABLE, regs::REG_SMARTEN | u32::from(config));
    }

    /// Flag every register for retransmission, used when driver power
    /// returns and the chips are back at their reset values.
    pub fn write_all(&self) {
        self.dirty.store(ALL_REGISTERS, Ordering::Release);
    }

    /// Last parsed status, limited to the reported bits. The stall flag reads
    /// as clear while the driver is disabled.
    pub fn read_live_status(&self) -> Status {
        let status = self.last_status.load(Ordering::Relaxed) & Status::REPORT_MASK;
        if self.enabled.load(Ordering::Relaxed) {
            Status::from_bits(status)
        } else {
            Status::from_bits(status & !Status::SG)
        }
    }

    /// Drain the status accumulator.
    ///
    /// Returns everything collected since the previous drain and keeps only
    /// the bits in `bits_to_keep`, so callers clear exactly the bits they
    /// consume. The swap is a single atomic fetch-AND.
    pub fn read_accumulated_status(&self, bits_to_keep: u32) -> Status {
        let mask = if self.enabled.load(Ordering::Relaxed) {
            u32::MAX
        } else {
            !Status::SG
        };
        let status = self
            .accumulated_status
            .fetch_and(bits_to_keep & mask, Ordering::AcqRel);
        Status::from_bits(status & Status::REPORT_MASK & mask)
    }

    /// Record the readback of a completed frame. `interval` is the current
    /// full-step interval of the axis in step-clock ticks, 0 when idle. The
    /// stall flag is only trusted inside the configured step-rate window; the
    /// load min/max only accumulate there too.
    pub(crate) fn complete_transfer(&self, status: u32, interval: u32) {
        let mut status = status;
        if interval == 0 || interval > self.max_stall_interval.load(Ordering::Relaxed) {
            status &= !Status::SG;
        } else {
            let load = (status >> Status::LOAD_SHIFT) & 1023;
            if load < self.min_load.load(Ordering::Relaxed) {
                self.min_load.store(load, Ordering::Relaxed);
            }
            if load > self.max_load.load(Ordering::Relaxed) {
                self.max_load.store(load, Ordering::Relaxed);
            }
        }
        self.last_status.store(status, Ordering::Relaxed);
        self.accumulated_status.fetch_or(status, Ordering::Relaxed);
    }

    /// Pick the register for the next bus slot: the most urgent dirty one, or
    /// the coolStep register as a harmless status keep-alive.
    pub(crate) fn take_pending_register(&self) -> u32 {
        let dirty = self.dirty.load(Ordering::Acquire);
        let index = if dirty == 0 {
            SMART_ENABLE
        } else {
            let index = dirty.trailing_zeros() as usize;
            self.dirty.fetch_and(!(1 << index), Ordering::AcqRel);
            index
        };
        self.registers[index].load(Ordering::Relaxed)
    }

    fn reset_load_registers(&self) {
        self.min_load.store(1023, Ordering::Relaxed);
        self.max_load.store(0, Ordering::Relaxed);
    }

    /// Append the stall detection setup to a report line.
    pub fn append_stall_config<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let value = self.registers[STALL_GUARD_CONFIG].load(Ordering::Relaxed);
        let filtered = value & sgcsconf::SFILT != 0;
        #[allow(clippy::cast_possible_wrap)]
        let mut threshold = ((value & sgcsconf::SGT_MASK) >> sgcsconf::SGT_SHIFT) as i32;
        if threshold >= 64 {
            threshold -= 128;
        }
        let interval = self.max_stall_interval.load(Ordering::Relaxed).max(1);
        write!(
            out,
            "stall threshold {}, filter {}, steps/sec {}, coolstep {:x}",
            threshold,
            if filtered { "on" } else { "off" },
            STEP_CLOCK_HZ / interval,
            self.registers[SMART_ENABLE].load(Ordering::Relaxed) & 0xFFFF,
        )
    }

    /// Append the driver alarms and the observed StallGuard load window to a
    /// report line, then restart min/max tracking.
    pub fn append_driver_status<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let status = Status::from_bits(self.last_status.load(Ordering::Relaxed));
        if status.over_temperature() {
            out.write_str(" temperature-shutdown!")?;
        } else if status.over_temperature_warning() {
            out.write_str(" temperature-warning")?;
        }
        if status.short_to_ground() {
            out.write_str(" short-to-ground")?;
        }
        if status.open_load_a() && !status.standstill() {
            out.write_str(" open-load-A")?;
        }
        if status.open_load_b() && !status.standstill() {
            out.write_str(" open-load-B")?;
        }
        if status.standstill() {
            out.write_str(" standstill")?;
        } else if status.bits()
            & (Status::OT | Status::OTPW | Status::S2G | Status::OLA | Status::OLB)
            == 0
        {
            out.write_str(" ok")?;
        }

        let min_load = self.min_load.load(Ordering::Relaxed);
        let max_load = self.max_load.load(Ordering::Relaxed);
        if min_load <= max_load {
            write!(out, ", SG min/max {min_load}/{max_load}")?;
        } else {
            out.write_str(", SG min/max not available")?;
        }
        self.reset_load_registers();
        Ok(())
    }
}
