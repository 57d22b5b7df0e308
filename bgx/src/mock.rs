//! Scripted SC16IS741 + modem emulator for host tests.
//!
//! The [`Emulator`] decodes the register traffic of the driver, keeps a 64 byte
//! RX FIFO and records everything written to THR. A script of
//! `(expected bytes, reply)` pairs stands in for the modem: once the bytes the
//! host sent contain the expected sequence, the reply is queued for reception.
//! [`MockPlatform`] advances a virtual clock on every yield and runs the IOP
//! interrupt whenever the emulated IRQ line is asserted.

use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use crate::bridge::{bits, decode_addr, reg, Access, FIFO_SIZE};
use crate::platform::{BridgeBus, Edge, MutexId, PinConfig, PinId, PinMode, Platform};
use crate::Iop;

/// Bytes moved from the modem side into the FIFO per millisecond.
const RX_BURST: usize = 56;

struct Exchange {
    expect: Vec<u8>,
    reply: Vec<u8>,
    delay_ms: u32,
}

/// Register file and modem side of the emulator.
pub struct EmuState {
    pub lcr: u8,
    pub efr: u8,
    pub dll: u8,
    pub dlh: u8,
    pub mcr: u8,
    pub tlr: u8,
    pub tcr: u8,
    pub ier: u8,
    pub fcr: u8,
    pub spr: u8,
    /// Scratch-pad reads return garbage
    pub spi_broken: bool,
    /// Every transfer fails
    pub bus_error: bool,

    pub clock: u32,
    pub status_high: bool,
    status_rise_at: Option<u32>,
    status_fall_at: Option<u32>,
    /// Boot time after a power key pulse; `None` ignores the key
    pub boot_ms: Option<u32>,
    pub pin_log: Vec<(u32, PinId, bool)>,

    rx_fifo: VecDeque<u8>,
    pending_rx: VecDeque<u8>,
    timed: Vec<(u32, Vec<u8>)>,
    thr_pending: bool,
    tx_log: Vec<u8>,
    typed: Vec<u8>,
    script: VecDeque<Exchange>,
}

impl EmuState {
    fn new() -> Self {
        Self {
            lcr: 0x1D,
            efr: 0,
            dll: 0,
            dlh: 0,
            mcr: 0,
            tlr: 0,
            tcr: 0,
            ier: 0,
            fcr: 0,
            spr: 0xFF,
            spi_broken: false,
            bus_error: false,
            clock: 0,
            status_high: false,
            status_rise_at: None,
            status_fall_at: None,
            boot_ms: None,
            pin_log: Vec::new(),
            rx_fifo: VecDeque::new(),
            pending_rx: VecDeque::new(),
            timed: Vec::new(),
            thr_pending: false,
            tx_log: Vec::new(),
            typed: Vec::new(),
            script: VecDeque::new(),
        }
    }

    fn soft_reset(&mut self) {
        self.lcr = 0x1D;
        self.efr = 0;
        self.mcr = 0;
        self.ier = 0;
        self.fcr = 0;
        self.tlr = 0;
        self.tcr = 0;
        self.rx_fifo.clear();
        self.thr_pending = false;
    }

    fn iir(&mut self) -> u8 {
        if self.ier & bits::IER_RHR != 0 && !self.rx_fifo.is_empty() {
            if self.rx_fifo.len() >= RX_BURST {
                0x04
            } else {
                0x0C
            }
        } else if self.ier & bits::IER_THR != 0 && self.thr_pending {
            self.thr_pending = false;
            0x02
        } else {
            bits::IIR_NO_PENDING
        }
    }

    fn read(&mut self, register: u8) -> u8 {
        let special = self.lcr & 0x80 != 0;
        let enhanced = self.lcr == bits::LCR_ENHANCED;
        let tcr_tlr = self.mcr & bits::MCR_TCR_TLR != 0;
        match register {
            reg::DLL if special => self.dll,
            reg::DLH if special => self.dlh,
            reg::EFR if enhanced => self.efr,
            reg::RHR => self.rx_fifo.pop_front().unwrap_or(0),
            reg::IER => self.ier,
            reg::IIR => self.iir(),
            reg::LCR => self.lcr,
            reg::MCR => self.mcr,
            reg::LSR => {
                let ready = if self.rx_fifo.is_empty() {
                    0
                } else {
                    bits::LSR_DATA_READY
                };
                0x60 | ready
            }
            reg::TCR if tcr_tlr => self.tcr,
            reg::MSR => 0,
            reg::TLR if tcr_tlr => self.tlr,
            reg::SPR if self.spi_broken => !self.spr,
            reg::SPR => self.spr,
            reg::TXLVL => FIFO_SIZE as u8,
            reg::RXLVL => self.rx_fifo.len() as u8,
            _ => 0,
        }
    }

    fn write(&mut self, register: u8, value: u8) {
        let special = self.lcr & 0x80 != 0;
        let enhanced = self.lcr == bits::LCR_ENHANCED;
        let tcr_tlr = self.mcr & bits::MCR_TCR_TLR != 0;
        match register {
            reg::DLL if special => self.dll = value,
            reg::DLH if special => self.dlh = value,
            reg::EFR if enhanced => self.efr = value,
            reg::THR => self.transmit(&[value]),
            reg::IER => self.ier = value,
            reg::FCR => {
                if value & bits::FCR_RX_RESET != 0 {
                    self.rx_fifo.clear();
                }
                self.fcr = value & !(bits::FCR_RX_RESET | bits::FCR_TX_RESET);
            }
            reg::LCR => self.lcr = value,
            reg::MCR => self.mcr = value,
            reg::TCR if tcr_tlr => self.tcr = value,
            reg::TLR if tcr_tlr => self.tlr = value,
            reg::SPR => self.spr = value,
            reg::UARTRST if value & bits::UARTRST_SOFT != 0 => self.soft_reset(),
            _ => {}
        }
    }

    fn transmit(&mut self, data: &[u8]) {
        self.tx_log.extend_from_slice(data);
        self.typed.extend_from_slice(data);
        if self.ier & bits::IER_THR != 0 {
            self.thr_pending = true;
        }
        while let Some(next) = self.script.front() {
            let Some(pos) = find(&self.typed, &next.expect) else {
                break;
            };
            let Some(exchange) = self.script.pop_front() else {
                break;
            };
            self.typed.drain(..pos + exchange.expect.len());
            if exchange.delay_ms == 0 {
                self.pending_rx.extend(exchange.reply);
            } else {
                self.timed.push((self.clock + exchange.delay_ms, exchange.reply));
            }
        }
    }

    fn status(&mut self) -> bool {
        let mut due: Vec<(u32, bool)> = [
            self.status_rise_at.map(|t| (t, true)),
            self.status_fall_at.map(|t| (t, false)),
        ]
        .into_iter()
        .flatten()
        .filter(|(t, _)| *t <= self.clock)
        .collect();
        due.sort();
        for (t, level) in due {
            self.status_high = level;
            if level {
                self.status_rise_at = self.status_rise_at.filter(|r| *r != t);
            } else {
                self.status_fall_at = self.status_fall_at.filter(|f| *f != t);
            }
        }
        self.status_high
    }

    fn boot_at(&mut self, at: u32) {
        self.status_rise_at = Some(at);
        self.timed.push((at + 200, b"\r\nRDY\r\n\r\nAPP RDY\r\n".to_vec()));
    }

    fn power_key_pulse(&mut self, held: u32) {
        let Some(boot) = self.boot_ms else {
            return;
        };
        if !self.status() {
            if held >= 100 {
                self.boot_at(self.clock + boot);
            }
        } else if held >= 650 {
            self.status_fall_at = Some(self.clock + 300);
        }
    }

    fn reset_pulse(&mut self, held: u32) {
        let Some(boot) = self.boot_ms else {
            return;
        };
        if held >= 150 {
            self.status_fall_at = Some(self.clock + 1);
            self.boot_at(self.clock + boot);
        }
    }

    fn advance(&mut self, ms: u32) -> u32 {
        self.clock += ms;
        let now = self.clock;
        let mut i = 0;
        while i < self.timed.len() {
            if self.timed[i].0 <= now {
                let (_, bytes) = self.timed.remove(i);
                self.pending_rx.extend(bytes);
            } else {
                i += 1;
            }
        }
        if self.fcr & bits::FCR_FIFO_ENABLE != 0 {
            let room = FIFO_SIZE.saturating_sub(self.rx_fifo.len()).min(RX_BURST);
            for _ in 0..room {
                match self.pending_rx.pop_front() {
                    Some(b) => self.rx_fifo.push_back(b),
                    None => break,
                }
            }
        }
        now
    }

    fn irq_asserted(&self) -> bool {
        (self.ier & bits::IER_RHR != 0 && !self.rx_fifo.is_empty())
            || (self.ier & bits::IER_THR != 0 && self.thr_pending)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Shared handle to the emulated bridge and modem.
#[derive(Clone)]
pub struct Emulator {
    state: Rc<RefCell<EmuState>>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(EmuState::new())),
        }
    }

    pub fn bus(&self) -> MockBus {
        MockBus {
            state: self.state.clone(),
        }
    }

    pub fn state(&self) -> RefMut<'_, EmuState> {
        self.state.borrow_mut()
    }

    /// Reply with `reply` once the host has sent `expect`.
    pub fn respond(&self, expect: &[u8], reply: &[u8]) -> &Self {
        self.respond_after(expect, 0, reply)
    }

    pub fn respond_after(&self, expect: &[u8], delay_ms: u32, reply: &[u8]) -> &Self {
        self.state().script.push_back(Exchange {
            expect: expect.to_vec(),
            reply: reply.to_vec(),
            delay_ms,
        });
        self
    }

    /// Queue unsolicited modem output.
    pub fn inject(&self, bytes: &[u8]) {
        self.state().pending_rx.extend(bytes.iter().copied());
    }

    pub fn inject_at(&self, at_ms: u32, bytes: &[u8]) {
        self.state().timed.push((at_ms, bytes.to_vec()));
    }

    /// Module already powered and running.
    pub fn powered(&self) {
        self.state().status_high = true;
    }

    /// Status pin goes high at `at_ms`.
    pub fn status_rises_at(&self, at_ms: u32) {
        self.state().status_rise_at = Some(at_ms);
    }

    pub fn status_falls_at(&self, at_ms: u32) {
        self.state().status_fall_at = Some(at_ms);
    }

    pub fn tx_log(&self) -> Vec<u8> {
        self.state().tx_log.clone()
    }

    pub fn take_tx(&self) -> Vec<u8> {
        core::mem::take(&mut self.state().tx_log)
    }

    pub fn script_done(&self) -> bool {
        self.state().script.is_empty()
    }

    pub fn now(&self) -> u32 {
        self.state().clock
    }

    fn advance(&self, ms: u32) -> u32 {
        self.state().advance(ms)
    }

    fn irq_asserted(&self) -> bool {
        self.state().irq_asserted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockBusError;

/// [`BridgeBus`] view of the emulator.
pub struct MockBus {
    state: Rc<RefCell<EmuState>>,
}

impl BridgeBus for MockBus {
    type Error = MockBusError;

    fn transfer_word(&mut self, word: u16) -> Result<u16, Self::Error> {
        let mut s = self.state.borrow_mut();
        if s.bus_error {
            return Err(MockBusError);
        }
        let [addr, data] = word.to_be_bytes();
        let (access, register) = decode_addr(addr);
        match access {
            Access::Read => Ok(u16::from(s.read(register))),
            Access::Write => {
                s.write(register, data);
                Ok(0)
            }
        }
    }

    fn write_block(&mut self, addr: u8, data: &[u8]) -> Result<(), Self::Error> {
        let mut s = self.state.borrow_mut();
        if s.bus_error {
            return Err(MockBusError);
        }
        match decode_addr(addr) {
            (Access::Write, reg::THR) => s.transmit(data),
            (_, register) => {
                for &b in data {
                    s.write(register, b);
                }
            }
        }
        Ok(())
    }

    fn read_block(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), Self::Error> {
        let mut s = self.state.borrow_mut();
        if s.bus_error {
            return Err(MockBusError);
        }
        let (_, register) = decode_addr(addr);
        for slot in buf.iter_mut() {
            *slot = s.read(register);
        }
        Ok(())
    }
}

/// [`Platform`] on a virtual clock; every yield advances it by 1 ms.
pub struct MockPlatform<'a> {
    emu: Emulator,
    iop: Option<&'a Iop<'a, MockBus>>,
    pins: PinConfig,
    levels: [bool; 64],
    irq_attached: bool,
    key_down_at: Option<u32>,
    reset_down_at: Option<u32>,
    /// Non-recursive command mutex
    cmd_mutex: bool,
}

impl<'a> MockPlatform<'a> {
    pub fn new(emu: &Emulator, pins: PinConfig) -> Self {
        Self {
            emu: emu.clone(),
            iop: None,
            pins,
            levels: [false; 64],
            irq_attached: false,
            key_down_at: None,
            reset_down_at: None,
            cmd_mutex: false,
        }
    }

    /// Route the emulated IRQ line to `iop`.
    pub fn with_iop(mut self, iop: &'a Iop<'a, MockBus>) -> Self {
        self.iop = Some(iop);
        self
    }

    pub fn irq_attached(&self) -> bool {
        self.irq_attached
    }

    pub fn mutex_held(&self) -> bool {
        self.cmd_mutex
    }
}

impl<'a> Platform for MockPlatform<'a> {
    fn open_pin(&mut self, _pin: PinId, _mode: PinMode) {}

    fn close_pin(&mut self, _pin: PinId) {}

    fn read_pin(&mut self, pin: PinId) -> bool {
        if pin == self.pins.status {
            return self.emu.state().status();
        }
        self.levels.get(pin as usize).copied().unwrap_or(false)
    }

    fn write_pin(&mut self, pin: PinId, high: bool) {
        let now = self.millis();
        if let Some(level) = self.levels.get_mut(pin as usize) {
            *level = high;
        }
        let mut emu = self.emu.state();
        emu.pin_log.push((now, pin, high));
        if pin == self.pins.power_key {
            match (high, self.key_down_at.take()) {
                (true, _) => self.key_down_at = Some(now),
                (false, Some(t)) => emu.power_key_pulse(now - t),
                (false, None) => {}
            }
        } else if pin == self.pins.reset {
            match (high, self.reset_down_at.take()) {
                (true, _) => self.reset_down_at = Some(now),
                (false, Some(t)) => emu.reset_pulse(now - t),
                (false, None) => {}
            }
        }
    }

    fn attach_irq(&mut self, _pin: PinId, _edge: Edge) {
        self.irq_attached = true;
    }

    fn detach_irq(&mut self, _pin: PinId) {
        self.irq_attached = false;
    }

    fn mutex_take(&mut self, _id: MutexId, _timeout_ms: u32) -> bool {
        !core::mem::replace(&mut self.cmd_mutex, true)
    }

    fn mutex_give(&mut self, _id: MutexId) {
        self.cmd_mutex = false;
    }

    fn millis(&self) -> u32 {
        self.emu.now()
    }

    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            self.yield_now();
        }
    }

    fn yield_now(&mut self) {
        let now = self.emu.advance(1);
        if let Some(iop) = self.iop {
            if self.irq_attached && self.emu.irq_asserted() {
                iop.service_irq(now);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::platform::FEATHER_UXPLOR;

    #[test]
    fn script_replies_after_expected_bytes() {
        let emu = Emulator::new();
        emu.respond(b"AT\r", b"\r\nOK\r\n");
        let mut bus = emu.bus();
        bus.write_block(0x00, b"A").unwrap();
        assert!(!emu.script_done());
        bus.write_block(0x00, b"T\r").unwrap();
        assert!(emu.script_done());
        assert_eq!(emu.tx_log(), b"AT\r");

        // nothing reaches the FIFO before it is enabled
        emu.state().advance(1);
        assert_eq!(emu.state().read(reg::RXLVL), 0);
        emu.state().write(reg::FCR, bits::FCR_FIFO_ENABLE);
        emu.state().advance(1);
        assert_eq!(emu.state().read(reg::RXLVL), 6);
    }

    #[test]
    fn power_key_boots_module() {
        let emu = Emulator::new();
        emu.state().boot_ms = Some(2000);
        let mut platform = MockPlatform::new(&emu, FEATHER_UXPLOR);
        let key = FEATHER_UXPLOR.power_key;
        platform.write_pin(key, true);
        platform.delay_ms(500);
        platform.write_pin(key, false);
        assert!(!platform.read_pin(FEATHER_UXPLOR.status));
        platform.delay_ms(2000);
        assert!(platform.read_pin(FEATHER_UXPLOR.status));
    }
}
