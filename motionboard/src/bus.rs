//! The SPI + PDC back end of the driver ring.
//!
//! One 3-byte frame per exchange: the PDC clocks the frame out and the
//! readback in without CPU involvement, then the end-of-receive interrupt
//! fires. The SPI controller is reset for every frame so a ring restart
//! never sees stale receive data.

use core::marker::PhantomData;
use core::sync::atomic::{compiler_fence, Ordering};

use atsam4_hal::clock::{get_master_clock_frequency, Enabled, SpiClock};
use atsam4_hal::pac::{Interrupt, SPI};
use cortex_m::peripheral::NVIC;
use tmc2660::DriverBus;

/// SPI master wired to the TMC2660 ring.
///
/// The PDC reads the transfer buffers in place, so the bus must not move
/// while a frame is in flight; it lives inside the controller static.
pub struct PdcBus {
    spi: SPI,
    clock: PhantomData<SpiClock<Enabled>>,
    out: [u8; 4],
    input: [u8; 4],
}

impl PdcBus {
    /// Claim the SPI peripheral and set it up for the driver ring: master
    /// mode with fault detection disabled, 8-bit transfers, clock idle high
    /// with data captured on the rising edge, chip select paced by the
    /// firmware (CSAAT set).
    pub fn new(spi: SPI, _clock: SpiClock<Enabled>, baud: u32) -> Self {
        let mck = get_master_clock_frequency();
        let scbr = (mck.raw() / baud) as u8;
        unsafe {
            spi.cr.write_with_zero(|w| w.swrst().set_bit());

            // SPI_MR and SPI_CSR are write protected after reset.
            spi.wpmr
                .write_with_zero(|w| w.wpkey().bits(0x535049).wpen().clear_bit());

            spi.mr
                .write_with_zero(|w| w.mstr().set_bit().modfdis().set_bit());

            spi.csr[0].write_with_zero(|w| {
                w.cpol()
                    .set_bit()
                    .csaat()
                    .set_bit()
                    .bits_()
                    .bits(0) // 8-bit transfers
                    .scbr()
                    .bits(scbr)
            });
        }
        Self {
            spi,
            clock: PhantomData,
            out: [0; 4],
            input: [0; 4],
        }
    }
}

impl DriverBus for PdcBus {
    fn start_exchange(&mut self, frame: [u8; 3]) {
        unsafe {
            // Park the PDC and the SPI while the descriptors change, and
            // drop any stale receive data.
            self.spi
                .ptcr
                .write_with_zero(|w| w.rxtdis().set_bit().txtdis().set_bit());
            self.spi.cr.write_with_zero(|w| w.spidis().set_bit());
        }
        let _ = self.spi.rdr.read();

        self.out[..3].copy_from_slice(&frame);
        self.spi
            .rpr
            .write(|w| unsafe { w.rxptr().bits(self.input.as_ptr() as u32) });
        self.spi.rcr.write(|w| unsafe { w.rxctr().bits(3) });
        self.spi
            .tpr
            .write(|w| unsafe { w.txptr().bits(self.out.as_ptr() as u32) });
        self.spi.tcr.write(|w| unsafe { w.txctr().bits(3) });

        compiler_fence(Ordering::Release);
        unsafe {
            self.spi
                .ptcr
                .write_with_zero(|w| w.rxten().set_bit().txten().set_bit());
            self.spi.ier.write_with_zero(|w| w.endrx().set_bit());
            self.spi.cr.write_with_zero(|w| w.spien().set_bit());
        }
    }

    fn response(&mut self) -> [u8; 3] {
        compiler_fence(Ordering::Acquire);
        [self.input[0], self.input[1], self.input[2]]
    }

    fn listen(&mut self) {
        unsafe { NVIC::unmask(Interrupt::SPI) };
    }

    fn halt(&mut self) {
        unsafe { self.spi.idr.write_with_zero(|w| w.endrx().set_bit()) };
    }
}
