//! Board seams: GPIO, SPI transport to the bridge, time and cooperative yield.
//!
//! The driver never touches hardware directly. A board provides a
//! [`Platform`] for pins and time, and a [`BridgeBus`] for the SPI link to the
//! SC16IS741. The bridge interrupt line must be routed by the board to
//! [`crate::Iop::service_irq`].

use embassy_time::{Duration, Instant};
use embedded_hal::spi::{Operation, SpiDevice};

pub type PinId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinMode {
    Input,
    InputPullUp,
    InputPullDown,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

/// Named locks a multitasking host may back with a real mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MutexId {
    AtCmd,
}

/// Pins, time and scheduling as consumed by the driver.
pub trait Platform {
    /// Acquire a digital line. Opening an already open pin is a no-op.
    fn open_pin(&mut self, pin: PinId, mode: PinMode);
    fn close_pin(&mut self, pin: PinId);
    /// `true` when the line reads high.
    fn read_pin(&mut self, pin: PinId) -> bool;
    fn write_pin(&mut self, pin: PinId, high: bool);

    /// Bind the bridge interrupt. The handler the board installs must call
    /// [`crate::Iop::service_irq`]; it runs in interrupt context.
    fn attach_irq(&mut self, pin: PinId, edge: Edge);
    fn detach_irq(&mut self, pin: PinId);

    /// Monotonic millisecond counter. Wraps; callers compare with
    /// `wrapping_sub`.
    fn millis(&self) -> u32;

    /// Blocking wait, yielding to the host while it waits.
    fn delay_ms(&mut self, ms: u32);

    fn yield_now(&mut self);

    fn mutex_take(&mut self, _id: MutexId, _timeout_ms: u32) -> bool {
        true
    }

    fn mutex_give(&mut self, _id: MutexId) {}
}

/// SPI transport to the bridge.
pub trait BridgeBus {
    type Error: core::fmt::Debug;

    /// Full-duplex 16 bit exchange, most significant byte first.
    fn transfer_word(&mut self, word: u16) -> Result<u16, Self::Error>;

    /// Send `addr` followed by `data`.
    fn write_block(&mut self, addr: u8, data: &[u8]) -> Result<(), Self::Error>;

    /// Send `addr`, then clock `buf.len()` bytes in.
    fn read_block(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), Self::Error>;
}

/// Wiring of the modem carrier to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinConfig {
    pub spi_cs: PinId,
    pub irq: PinId,
    /// High while the module is powered
    pub status: PinId,
    /// Pulse high to toggle module power
    pub power_key: PinId,
    /// Active high
    pub reset: PinId,
    pub ring_urc: PinId,
    pub connected: PinId,
    pub wake: PinId,
}

pub const FEATHER_UXPLOR: PinConfig = PinConfig {
    spi_cs: 13,
    irq: 12,
    status: 19,
    power_key: 11,
    reset: 10,
    ring_urc: 15,
    connected: 17,
    wake: 18,
};

pub const RPI_UXPLOR: PinConfig = PinConfig {
    spi_cs: 0,
    irq: 22,
    status: 13,
    power_key: 24,
    reset: 23,
    ring_urc: 0,
    connected: 0,
    wake: 0,
};

/// [`BridgeBus`] over any embedded-hal SPI device. Chip select is handled by
/// the device.
pub struct SpiBridge<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> SpiBridge<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    pub fn release(self) -> SPI {
        self.spi
    }
}

impl<SPI: SpiDevice> BridgeBus for SpiBridge<SPI> {
    type Error = SPI::Error;

    fn transfer_word(&mut self, word: u16) -> Result<u16, Self::Error> {
        let mut buf = word.to_be_bytes();
        self.spi.transfer_in_place(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn write_block(&mut self, addr: u8, data: &[u8]) -> Result<(), Self::Error> {
        self.spi
            .transaction(&mut [Operation::Write(&[addr]), Operation::Write(data)])
    }

    fn read_block(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.spi
            .transaction(&mut [Operation::Write(&[addr]), Operation::Read(buf)])
    }
}

/// Numbered GPIO access, as supplied by the board.
pub trait Gpio {
    fn open(&mut self, pin: PinId, mode: PinMode);
    fn close(&mut self, pin: PinId);
    fn read(&mut self, pin: PinId) -> bool;
    fn write(&mut self, pin: PinId, high: bool);
    fn attach_irq(&mut self, pin: PinId, edge: Edge);
    fn detach_irq(&mut self, pin: PinId);
}

/// [`Platform`] with time taken from `embassy-time` and pins from a [`Gpio`].
pub struct EmbassyPlatform<G> {
    gpio: G,
    idle: fn(),
}

impl<G: Gpio> EmbassyPlatform<G> {
    pub fn new(gpio: G) -> Self {
        Self {
            gpio,
            idle: core::hint::spin_loop,
        }
    }

    /// Hook run on every yield, e.g. to feed a watchdog.
    #[must_use]
    pub fn with_idle(mut self, idle: fn()) -> Self {
        self.idle = idle;
        self
    }
}

impl<G: Gpio> Platform for EmbassyPlatform<G> {
    fn open_pin(&mut self, pin: PinId, mode: PinMode) {
        self.gpio.open(pin, mode)
    }

    fn close_pin(&mut self, pin: PinId) {
        self.gpio.close(pin)
    }

    fn read_pin(&mut self, pin: PinId) -> bool {
        self.gpio.read(pin)
    }

    fn write_pin(&mut self, pin: PinId, high: bool) {
        self.gpio.write(pin, high)
    }

    fn attach_irq(&mut self, pin: PinId, edge: Edge) {
        self.gpio.attach_irq(pin, edge)
    }

    fn detach_irq(&mut self, pin: PinId) {
        self.gpio.detach_irq(pin)
    }

    fn millis(&self) -> u32 {
        Instant::now().as_millis() as u32
    }

    fn delay_ms(&mut self, ms: u32) {
        let until = Instant::now() + Duration::from_millis(ms.into());
        while Instant::now() < until {
            self.yield_now();
        }
    }

    fn yield_now(&mut self) {
        (self.idle)()
    }
}
