//! Register level driver for the NXP SC16IS741 SPI-UART bridge.

use crate::{error::BusError, platform::BridgeBus, Config};

/// Register addresses in the general register set.
pub mod reg {
    pub const RHR: u8 = 0x00;
    pub const THR: u8 = 0x00;
    pub const IER: u8 = 0x01;
    pub const FCR: u8 = 0x02;
    pub const IIR: u8 = 0x02;
    pub const LCR: u8 = 0x03;
    pub const MCR: u8 = 0x04;
    pub const LSR: u8 = 0x05;
    pub const MSR: u8 = 0x06;
    pub const SPR: u8 = 0x07;
    /// Shares its address with MSR while `MCR[2]` is set
    pub const TCR: u8 = 0x06;
    /// Shares its address with SPR while `MCR[2]` is set
    pub const TLR: u8 = 0x07;
    pub const TXLVL: u8 = 0x08;
    pub const RXLVL: u8 = 0x09;
    pub const UARTRST: u8 = 0x0E;
    pub const EFCR: u8 = 0x0F;

    // special register set, LCR[7] = 1 and LCR != 0xBF
    pub const DLL: u8 = 0x00;
    pub const DLH: u8 = 0x01;

    // enhanced register set, LCR = 0xBF
    pub const EFR: u8 = 0x02;
}

pub mod bits {
    pub const LCR_GENERAL: u8 = 0x00;
    pub const LCR_SPECIAL: u8 = 0x80;
    pub const LCR_ENHANCED: u8 = 0xBF;
    pub const LCR_8N1: u8 = 0x03;
    pub const LCR_BREAK: u8 = 0x40;

    pub const FCR_FIFO_ENABLE: u8 = 0x01;
    pub const FCR_RX_RESET: u8 = 0x02;
    pub const FCR_TX_RESET: u8 = 0x04;
    pub const FCR_RX_TRIGGER_56: u8 = 0b10 << 6;
    pub const FCR_TX_TRIGGER_56: u8 = 0b11 << 4;

    pub const UARTRST_SOFT: u8 = 0x08;
    pub const EFR_ENHANCED: u8 = 0x10;
    pub const MCR_TCR_TLR: u8 = 0x04;

    pub const IER_RHR: u8 = 0x01;
    pub const IER_THR: u8 = 0x02;
    pub const IER_RLS: u8 = 0x04;

    pub const IIR_NO_PENDING: u8 = 0x01;

    pub const LSR_DATA_READY: u8 = 0x01;
    pub const LSR_OVERRUN: u8 = 0x02;
    pub const LSR_FIFO_ERROR: u8 = 0x80;
}

pub const FIFO_SIZE: usize = 64;

const PING_PATTERN: u8 = 0x5A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Access {
    Read,
    Write,
}

/// Address octet: bit 7 read, bits 6:3 register, bits 2:1 channel (always 0).
pub const fn addr_byte(access: Access, register: u8) -> u8 {
    let rnw = match access {
        Access::Read => 0x80,
        Access::Write => 0x00,
    };
    rnw | ((register & 0x0F) << 3)
}

pub const fn decode_addr(byte: u8) -> (Access, u8) {
    let access = if byte & 0x80 != 0 {
        Access::Read
    } else {
        Access::Write
    };
    (access, (byte >> 3) & 0x0F)
}

/// Decoded `IIR` source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrqCause {
    RxLineError,
    RxData,
    RxTimeout,
    TxReady,
    ModemStatus,
    None,
}

impl IrqCause {
    pub const fn from_iir(iir: u8) -> Self {
        if iir & bits::IIR_NO_PENDING != 0 {
            return Self::None;
        }
        match (iir >> 1) & 0x1F {
            3 => Self::RxLineError,
            2 => Self::RxData,
            6 => Self::RxTimeout,
            1 => Self::TxReady,
            0 => Self::ModemStatus,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FifoReset {
    Rx,
    Tx,
    Both,
}

/// Copies of write-only or set-up registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Shadow {
    divisor: u16,
    ier: u8,
    fcr: u8,
    tlr: u8,
}

pub struct Bridge<B> {
    bus: B,
    shadow: Shadow,
}

impl<B: BridgeBus> Bridge<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            shadow: Shadow::default(),
        }
    }

    pub fn release(self) -> B {
        self.bus
    }

    pub fn read_reg(&mut self, register: u8) -> Result<u8, BusError> {
        let word = u16::from(addr_byte(Access::Read, register)) << 8;
        let rx = self.bus.transfer_word(word).map_err(|e| {
            error!("bridge read {} failed: {:?}", register, defmt_debug(&e));
            BusError::Transfer
        })?;
        Ok((rx & 0xFF) as u8)
    }

    pub fn write_reg(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        let word = (u16::from(addr_byte(Access::Write, register)) << 8) | u16::from(value);
        self.bus.transfer_word(word).map(|_| ()).map_err(|e| {
            error!("bridge write {} failed: {:?}", register, defmt_debug(&e));
            BusError::Transfer
        })
    }

    pub fn read_fifo(&mut self, buf: &mut [u8]) -> Result<(), BusError> {
        self.bus
            .read_block(addr_byte(Access::Read, reg::RHR), buf)
            .map_err(|_| BusError::Transfer)
    }

    pub fn write_fifo(&mut self, data: &[u8]) -> Result<(), BusError> {
        self.bus
            .write_block(addr_byte(Access::Write, reg::THR), data)
            .map_err(|_| BusError::Transfer)
    }

    pub fn interrupt_cause(&mut self) -> Result<IrqCause, BusError> {
        self.read_reg(reg::IIR).map(IrqCause::from_iir)
    }

    pub fn rx_level(&mut self) -> Result<usize, BusError> {
        self.read_reg(reg::RXLVL).map(usize::from)
    }

    pub fn tx_space(&mut self) -> Result<usize, BusError> {
        self.read_reg(reg::TXLVL).map(usize::from)
    }

    pub fn line_status(&mut self) -> Result<u8, BusError> {
        self.read_reg(reg::LSR)
    }

    pub fn reset_fifo(&mut self, which: FifoReset) -> Result<(), BusError> {
        let flush = match which {
            FifoReset::Rx => bits::FCR_RX_RESET,
            FifoReset::Tx => bits::FCR_TX_RESET,
            FifoReset::Both => bits::FCR_RX_RESET | bits::FCR_TX_RESET,
        };
        self.write_reg(reg::FCR, self.shadow.fcr | flush)
    }

    pub fn flush_rx(&mut self) -> Result<(), BusError> {
        self.reset_fifo(FifoReset::Rx)
    }

    /// Start of the startup sequence; the chip needs about 1 ms before it
    /// accepts [`Bridge::configure`].
    pub fn soft_reset(&mut self) -> Result<(), BusError> {
        self.shadow = Shadow::default();
        self.write_reg(reg::UARTRST, bits::UARTRST_SOFT)
    }

    /// Enhanced functions, FIFO triggers, baud divisor and 8-N-1 framing.
    pub fn configure(&mut self, config: &Config) -> Result<(), BusError> {
        // enhanced functions unlock TLR/TCR and the FCR TX trigger bits
        self.write_reg(reg::LCR, bits::LCR_ENHANCED)?;
        let efr = self.read_reg(reg::EFR)?;
        self.write_reg(reg::EFR, efr | bits::EFR_ENHANCED)?;
        self.write_reg(reg::LCR, bits::LCR_GENERAL)?;

        self.shadow.fcr = bits::FCR_FIFO_ENABLE | bits::FCR_RX_TRIGGER_56 | bits::FCR_TX_TRIGGER_56;
        self.write_reg(reg::FCR, self.shadow.fcr)?;

        // TLR overrides the FCR levels with a granularity of 4
        self.shadow.tlr = ((config.rx_trigger.min(60) / 4) << 4) | (config.tx_trigger.min(60) / 4);
        let mcr = self.read_reg(reg::MCR)?;
        self.write_reg(reg::MCR, mcr | bits::MCR_TCR_TLR)?;
        self.write_reg(reg::TLR, self.shadow.tlr)?;
        self.write_reg(reg::MCR, mcr & !bits::MCR_TCR_TLR)?;

        self.shadow.divisor = config.divisor();
        let [dlh, dll] = self.shadow.divisor.to_be_bytes();
        self.write_reg(reg::LCR, bits::LCR_SPECIAL)?;
        self.write_reg(reg::DLL, dll)?;
        self.write_reg(reg::DLH, dlh)?;
        self.write_reg(reg::LCR, bits::LCR_GENERAL)?;

        self.write_reg(reg::LCR, bits::LCR_8N1)
    }

    /// Write and read back the scratch-pad register.
    pub fn ping(&mut self) -> Result<(), BusError> {
        self.write_reg(reg::SPR, PING_PATTERN)?;
        match self.read_reg(reg::SPR)? {
            PING_PATTERN => Ok(()),
            other => {
                warn!("bridge scratch-pad mismatch: {}", other);
                Err(BusError::Ping)
            }
        }
    }

    /// RX data, THR empty and line status interrupts; stale RX is dropped.
    pub fn enable_irq(&mut self) -> Result<(), BusError> {
        self.shadow.ier = bits::IER_RHR | bits::IER_THR | bits::IER_RLS;
        self.write_reg(reg::IER, self.shadow.ier)?;
        self.flush_rx()
    }

    pub fn disable_irq(&mut self) -> Result<(), BusError> {
        self.shadow.ier = 0;
        self.write_reg(reg::IER, 0)
    }

    pub fn set_break(&mut self, on: bool) -> Result<(), BusError> {
        let lcr = self.read_reg(reg::LCR)?;
        let lcr = if on {
            lcr | bits::LCR_BREAK
        } else {
            lcr & !bits::LCR_BREAK
        };
        self.write_reg(reg::LCR, lcr)
    }

    #[cfg(test)]
    pub(crate) fn bus(&mut self) -> &mut B {
        &mut self.bus
    }
}

#[cfg(not(feature = "defmt"))]
fn defmt_debug<E: core::fmt::Debug>(e: &E) -> &E {
    e
}

#[cfg(feature = "defmt")]
fn defmt_debug<E: core::fmt::Debug>(e: &E) -> defmt::Debug2Format<'_, E> {
    defmt::Debug2Format(e)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::Emulator;

    #[test]
    fn addr_byte_round_trip() {
        for register in 0..16 {
            for access in [Access::Read, Access::Write] {
                assert_eq!(decode_addr(addr_byte(access, register)), (access, register));
            }
        }
        assert_eq!(addr_byte(Access::Read, reg::RXLVL), 0xC8);
        assert_eq!(addr_byte(Access::Write, reg::LCR), 0x18);
    }

    #[test]
    fn iir_sources() {
        assert_eq!(IrqCause::from_iir(0x01), IrqCause::None);
        assert_eq!(IrqCause::from_iir(0xC1), IrqCause::None);
        assert_eq!(IrqCause::from_iir(0x06), IrqCause::RxLineError);
        assert_eq!(IrqCause::from_iir(0x04), IrqCause::RxData);
        assert_eq!(IrqCause::from_iir(0xCC), IrqCause::RxTimeout);
        assert_eq!(IrqCause::from_iir(0x02), IrqCause::TxReady);
        assert_eq!(IrqCause::from_iir(0x00), IrqCause::ModemStatus);
    }

    #[test]
    fn startup_programs_registers() {
        let emu = Emulator::new();
        let mut bridge = Bridge::new(emu.bus());

        bridge.soft_reset().unwrap();
        bridge.configure(&Config::default()).unwrap();
        bridge.ping().unwrap();
        bridge.enable_irq().unwrap();

        let e = emu.state();
        assert_eq!(e.efr & bits::EFR_ENHANCED, bits::EFR_ENHANCED);
        assert_eq!((e.dll, e.dlh), (0x04, 0x00));
        assert_eq!(e.lcr, bits::LCR_8N1);
        assert_eq!(e.tlr, 0xEE);
        assert_eq!(e.ier, 0x07);
        assert_eq!(e.mcr & bits::MCR_TCR_TLR, 0);
    }

    #[test]
    fn ping_detects_broken_path() {
        let emu = Emulator::new();
        emu.state().spi_broken = true;
        let mut bridge = Bridge::new(emu.bus());
        assert_eq!(bridge.ping(), Err(BusError::Ping));
    }
}
