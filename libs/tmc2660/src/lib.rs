#![cfg_attr(any(not(test), target_arch = "arm"), no_std)]

pub mod controller;
pub mod driver;
pub mod regs;

pub use controller::{ChipSelect, Controller, DriverBus, EnableLine, StepTiming};
pub use driver::{DriverMode, DriverState, MAX_MOTOR_CURRENT};
pub use regs::Status;

/// The firmware-wide step clock used to measure inter-step intervals:
/// the 120 MHz master clock divided by 128.
pub const STEP_CLOCK_HZ: u32 = 937_500;

/// SPI clock for the driver ring. 2 MHz is a compromise: fast enough to walk
/// a ten-driver ring in about 170 us, slow enough that polling the drivers
/// stays a small fraction of CPU time.
pub const SPI_CLOCK_HZ: u32 = 2_000_000;

#[cfg(not(any(not(test), target_arch = "arm")))]
mod tests {
    use super::regs::{self, chopconf, decode_status, encode_frame, Status};

    #[test]
    fn frame_encoding() {
        // The 20-bit word rides in the low bits of the 24-bit transfer; the
        // device only keeps the last 20 bits it saw before chip select rose.
        assert_eq!(encode_frame(0x901B4), [0x09, 0x01, 0xB4]);
        assert_eq!(encode_frame(0xE0001), [0x0E, 0x00, 0x01]);
        assert_eq!(encode_frame(0x00000), [0x00, 0x00, 0x00]);
    }

    #[test]
    fn status_decoding() {
        // The readback occupies the top 20 of the 24 received bits.
        assert_eq!(decode_status([0xFF, 0xFF, 0xF0]), 0xF_FFFF);
        assert_eq!(decode_status([0x00, 0x00, 0x10]), 0x1);
        // Load value 0x155 with the stall flag set:
        // 0101_0101_01 in bits 19..10, SG in bit 0.
        let word = (0x155 << Status::LOAD_SHIFT) | Status::SG;
        let frame = [
            (word >> 12) as u8,
            (word >> 4) as u8,
            ((word << 4) & 0xF0) as u8,
        ];
        assert_eq!(decode_status(frame), word);
        let status = Status::from_bits(word);
        assert!(status.stalled());
        assert_eq!(status.load(), 0x155);
        assert!(!status.standstill());
    }

    #[test]
    fn default_chopper_register_matches_datasheet_example() {
        assert_eq!(regs::DEFAULT_CHOPCONF, 0x901B4);
        assert_eq!(regs::DEFAULT_CHOPCONF & chopconf::TOFF_MASK, 4);
    }

    #[test]
    fn status_flags() {
        let status = Status::from_bits(Status::OT | Status::OLB | (3 << 3));
        assert!(status.over_temperature());
        assert!(!status.over_temperature_warning());
        assert!(status.short_to_ground());
        assert!(status.open_load_b());
        assert!(!status.open_load_a());
        assert_eq!(status.load(), 0);
    }
}
