//! Power sequencing, resets and the start-up handshake.

use crate::atcmd::Options;
use crate::modem::{AppEvent, DeviceState, Modem, ResetKind};
use crate::platform::{BridgeBus, Edge, Platform};
use crate::Error;

const PING_ATTEMPTS: u8 = 5;
const PING_GAP_MS: u32 = 10;
const BREAK_MS: u32 = 10;
const ATTENTION_TIMEOUT_MS: u32 = 500;
const ESC: u8 = 0x1B;

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Status line of the module.
    pub fn is_powered(&mut self) -> bool {
        self.platform.read_pin(self.pins.status)
    }

    /// Reset and program the bridge, verify the SPI path, then enable the
    /// bridge interrupt.
    pub(crate) fn bring_up_bridge(&mut self) -> Result<(), Error> {
        self.iop.with_bridge(|b| b.disable_irq())?;
        self.iop.with_bridge(|b| b.soft_reset())?;
        self.platform.delay_ms(1);
        self.iop.with_bridge(|b| b.configure(&self.config))?;

        let mut verified = false;
        for attempt in 0..PING_ATTEMPTS {
            if self.iop.with_bridge(|b| b.ping()).is_ok() {
                verified = true;
                break;
            }
            debug!("bridge ping attempt {} failed", attempt + 1);
            self.platform.delay_ms(PING_GAP_MS);
        }
        if !verified {
            self.notify(AppEvent::SpiFault, "scratch-pad read back mismatch");
            return Err(Error::Internal);
        }

        self.iop.reset();
        self.iop.with_bridge(|b| b.enable_irq())?;
        if !self.irq_attached {
            self.platform.attach_irq(self.pins.irq, Edge::Falling);
            self.irq_attached = true;
        }
        Ok(())
    }

    /// Switch the module on. Returns `false` when it was already powered, in
    /// which case no `APP RDY` will follow.
    pub fn power_on(&mut self) -> Result<bool, Error> {
        if self.is_powered() {
            debug!("module already powered");
            if matches!(self.state, DeviceState::PowerOff | DeviceState::Fault) {
                self.state = DeviceState::PowerOn;
            }
            return Ok(false);
        }

        info!("powering on module");
        self.state = DeviceState::PoweringOn;
        self.app_ready_seen = false;
        self.platform.write_pin(self.pins.power_key, true);
        self.platform.delay_ms(self.config.power_on_hold);
        self.platform.write_pin(self.pins.power_key, false);

        let start = self.now();
        loop {
            if self.is_powered() {
                info!("module powered after {} ms", self.now().wrapping_sub(start));
                self.state = DeviceState::PowerOn;
                return Ok(true);
            }
            if self.now().wrapping_sub(start) >= self.config.status_timeout {
                error!("status line did not rise");
                self.state = DeviceState::Fault;
                self.notify(AppEvent::HwInitFailed, "module did not power on");
                return Err(Error::Timeout);
            }
            self.platform.delay_ms(self.config.status_poll);
        }
    }

    pub fn power_off(&mut self) -> Result<(), Error> {
        if self.is_powered() {
            info!("powering off module");
            self.platform.write_pin(self.pins.power_key, true);
            self.platform.delay_ms(self.config.power_off_hold);
            self.platform.write_pin(self.pins.power_key, false);

            if !self.await_status(false, self.config.status_timeout) {
                warn!("status line still high after power off");
                return Err(Error::Timeout);
            }
        }
        self.state = DeviceState::PowerOff;
        self.clear_data_state();
        Ok(())
    }

    fn await_status(&mut self, high: bool, timeout_ms: u32) -> bool {
        let start = self.now();
        while self.is_powered() != high {
            if self.now().wrapping_sub(start) >= timeout_ms {
                return false;
            }
            self.platform.delay_ms(self.config.status_poll.min(10));
        }
        true
    }

    /// Bring the module up to application ready: bridge, power, `APP RDY`
    /// and the start commands. Calling it again while ready only repeats the
    /// start commands.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state == DeviceState::AppReady {
            return self.run_start_commands();
        }

        self.bring_up_bridge()?;
        let fresh = self.power_on()?;
        self.await_app_ready(fresh)
    }

    /// Wait for `APP RDY` after a power-up, or check that a module that was
    /// already running answers, then run the start commands.
    fn await_app_ready(&mut self, fresh: bool) -> Result<(), Error> {
        if fresh {
            let start = self.now();
            while !self.app_ready_seen {
                if self.now().wrapping_sub(start) >= self.config.app_ready_timeout {
                    warn!("no APP RDY within {} ms", self.config.app_ready_timeout);
                    break;
                }
                self.do_work();
                self.platform.yield_now();
            }
        }
        if !fresh || !self.app_ready_seen {
            self.await_attention()?;
        }
        self.run_start_commands()
    }

    /// `AT` exchange used when the module never announced itself.
    fn await_attention(&mut self) -> Result<(), Error> {
        for _ in 0..self.config.start_cmd_attempts {
            self.begin(format_args!("AT"), Options::default().timeout(ATTENTION_TIMEOUT_MS))?;
            if self.await_result().is_ok() {
                return Ok(());
            }
        }
        if self.recover() {
            return Ok(());
        }
        self.fault(Error::Timeout)
    }

    /// Last attempt on a silent module: it may sit at a data prompt or in
    /// transparent mode. Escape both and ask again.
    fn recover(&mut self) -> bool {
        warn!("module silent, leaving data mode");
        if self.iop.send(&[ESC], true).is_err() || self.exit_data_mode().is_err() {
            return false;
        }
        let opts = Options::default().timeout(ATTENTION_TIMEOUT_MS);
        if self.begin(format_args!("AT"), opts).is_err() {
            return false;
        }
        self.await_result().is_ok()
    }

    fn run_start_commands(&mut self) -> Result<(), Error> {
        if !self.await_lock(self.config.cmd_timeout) {
            return Err(Error::Conflict);
        }
        let opts = Options::default().timeout(self.config.start_cmd_timeout);
        let commands = self.config.start_commands;
        for cmd in commands {
            let mut res = Err(Error::Timeout);
            for attempt in 0..self.config.start_cmd_attempts {
                self.begin(format_args!("{}", cmd), opts)?;
                res = self.await_result();
                if res.is_ok() {
                    break;
                }
                debug!("start command {} attempt {} failed: {:?}", cmd, attempt + 1, res);
            }
            if let Err(e) = res {
                error!("start command {} failed", cmd);
                return self.fault(e);
            }
        }
        self.state = DeviceState::AppReady;
        info!("module ready");
        Ok(())
    }

    fn fault(&mut self, e: Error) -> Result<(), Error> {
        self.clear_data_state();
        self.state = DeviceState::Fault;
        self.notify(AppEvent::HardLogicFault, "module not answering");
        Err(e)
    }

    /// Reset the module and go through start-up again.
    pub fn reset(&mut self, kind: ResetKind) -> Result<(), Error> {
        info!("module reset: {:?}", kind);
        match kind {
            ResetKind::Software => {
                if !self.software_reset()? {
                    warn!("software reset not confirmed, power cycling");
                    self.power_cycle()?;
                }
            }
            ResetKind::Hardware => {
                self.clear_data_state();
                self.platform.write_pin(self.pins.reset, true);
                self.platform.delay_ms(self.config.reset_hold);
                self.platform.write_pin(self.pins.reset, false);
                self.state = DeviceState::PoweringOn;
                self.app_ready_seen = false;
                if !self.await_status(true, self.config.status_timeout) {
                    self.state = DeviceState::Fault;
                    self.notify(AppEvent::HwInitFailed, "module did not restart");
                    return Err(Error::Timeout);
                }
                self.state = DeviceState::PowerOn;
            }
            ResetKind::PowerCycle => self.power_cycle()?,
        }
        self.await_app_ready(true)
    }

    /// `AT+CFUN=1,1`; `Ok(false)` when the status line did not cycle.
    fn software_reset(&mut self) -> Result<bool, Error> {
        // drop out of any transparent transfer first
        self.iop.with_bridge(|b| b.set_break(true))?;
        self.platform.delay_ms(BREAK_MS);
        self.iop.with_bridge(|b| b.set_break(false))?;

        self.clear_data_state();
        self.app_ready_seen = false;
        self.iop.send(b"AT+CFUN=1,1\r", true)?;
        self.state = DeviceState::PoweringOn;

        let timeout = self.config.sw_reset_timeout;
        if !self.await_status(false, timeout) || !self.await_status(true, timeout) {
            return Ok(false);
        }
        self.state = DeviceState::PowerOn;
        Ok(true)
    }

    fn power_cycle(&mut self) -> Result<(), Error> {
        self.power_off()?;
        self.platform.delay_ms(self.config.power_cycle_gap);
        self.app_ready_seen = false;
        self.power_on()?;
        Ok(())
    }

    /// Power the module down and silence the bridge.
    pub fn stop(&mut self) -> Result<(), Error> {
        let res = self.power_off();
        if self.irq_attached {
            self.platform.detach_irq(self.pins.irq);
            self.irq_attached = false;
        }
        self.iop.with_bridge(|b| b.disable_irq())?;
        res
    }

    /// Drop in-flight command, receive and stream state after the module
    /// went away or stopped answering. Registered streams stay registered but
    /// are marked closed.
    pub(crate) fn clear_data_state(&mut self) {
        self.iop.reset();
        self.iop.clear_cancel();
        self.release_lock();
        self.ird = crate::streams::socket::Ird::Idle;
        for ctx in 0..self.streams.len() as u8 {
            self.iop.with_rx(|rx| {
                if let Some(pages) = rx.pages_mut(ctx) {
                    pages.clear();
                }
            });
            if let Some(stream) = self.streams[ctx as usize].as_mut() {
                stream.mark_closed();
            }
        }
        self.network.clear();
    }
}

#[cfg(test)]
mod test {
    use core::cell::RefCell;

    use super::*;
    use crate::mock::{Emulator, MockBus, MockPlatform};
    use crate::platform::FEATHER_UXPLOR;
    use crate::{Config, Iop};

    type TestModem<'a> = Modem<'a, MockBus, MockPlatform<'a>>;

    fn modem<'a>(iop: &'a Iop<'a, MockBus>, emu: &Emulator) -> TestModem<'a> {
        let _ = env_logger::builder().is_test(true).try_init();
        let platform = MockPlatform::new(emu, FEATHER_UXPLOR).with_iop(iop);
        Modem::new(iop, emu.bus(), platform, FEATHER_UXPLOR, Config::default())
    }

    fn script_start(emu: &Emulator) {
        emu.respond(b"ATE0\r", b"ATE0\r\r\nOK\r\n")
            .respond(b"ATV1\r", b"\r\nOK\r\n")
            .respond(b"AT+IFC=2,2\r", b"\r\nOK\r\n");
    }

    #[test]
    fn power_on_waits_for_status() {
        let emu = Emulator::new();
        emu.status_rises_at(3000);
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);

        assert_eq!(modem.power_on(), Ok(true));
        assert_eq!(modem.state(), DeviceState::PowerOn);
        assert!((3000..=3100).contains(&emu.now()));

        let key = FEATHER_UXPLOR.power_key;
        let log = emu.state().pin_log.clone();
        let presses: std::vec::Vec<_> = log.iter().filter(|(_, pin, _)| *pin == key).collect();
        assert_eq!(presses.len(), 3);
        assert_eq!(presses[2].0 - presses[1].0, 500);
    }

    #[test]
    fn power_on_failure_is_fault() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let events = RefCell::new(std::vec::Vec::new());
        let notify = |event: AppEvent, _: &str| events.borrow_mut().push(event);
        let mut modem = modem(&iop, &emu).with_notifier(&notify);

        assert_eq!(modem.power_on(), Err(Error::Timeout));
        assert_eq!(modem.state(), DeviceState::Fault);
        assert_eq!(events.borrow().as_slice(), &[AppEvent::HwInitFailed]);
    }

    #[test]
    fn already_powered_skips_key() {
        let emu = Emulator::new();
        emu.powered();
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);

        assert_eq!(modem.power_on(), Ok(false));
        assert_eq!(modem.state(), DeviceState::PowerOn);
        let key = FEATHER_UXPLOR.power_key;
        assert!(!emu.state().pin_log.iter().any(|(_, pin, high)| *pin == key && *high));
    }

    #[test]
    fn start_from_cold() {
        let emu = Emulator::new();
        emu.state().boot_ms = Some(2000);
        script_start(&emu);
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);

        assert_eq!(modem.start(), Ok(()));
        assert_eq!(modem.state(), DeviceState::AppReady);
        assert!(emu.script_done());
        assert!(modem.platform().irq_attached());
        assert_eq!(emu.tx_log(), b"ATE0\rATV1\rAT+IFC=2,2\r");
    }

    #[test]
    fn start_on_running_module_checks_attention() {
        let emu = Emulator::new();
        emu.powered();
        emu.respond(b"AT\r", b"\r\nOK\r\n");
        script_start(&emu);
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);

        assert_eq!(modem.start(), Ok(()));
        assert_eq!(emu.tx_log(), b"AT\rATE0\rATV1\rAT+IFC=2,2\r");
    }

    #[test]
    fn second_start_only_repeats_start_commands() {
        let emu = Emulator::new();
        emu.powered();
        emu.respond(b"AT\r", b"\r\nOK\r\n");
        script_start(&emu);
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);
        modem.start().unwrap();
        emu.take_tx();
        let pins_before = emu.state().pin_log.len();

        script_start(&emu);
        assert_eq!(modem.start(), Ok(()));
        assert_eq!(modem.state(), DeviceState::AppReady);
        assert_eq!(emu.tx_log(), b"ATE0\rATV1\rAT+IFC=2,2\r");
        assert_eq!(emu.state().pin_log.len(), pins_before);
    }

    #[test]
    fn silent_module_is_hard_fault() {
        let emu = Emulator::new();
        emu.powered();
        let iop = Iop::new();
        let events = RefCell::new(std::vec::Vec::new());
        let notify = |event: AppEvent, _: &str| events.borrow_mut().push(event);
        let mut modem = modem(&iop, &emu).with_notifier(&notify);

        assert!(modem.start().is_err());
        assert_eq!(modem.state(), DeviceState::Fault);
        assert_eq!(events.borrow().as_slice(), &[AppEvent::HardLogicFault]);
        assert!(!modem.is_locked());
    }

    #[test]
    fn module_stuck_in_data_mode_recovers() {
        let emu = Emulator::new();
        emu.powered();
        emu.respond(b"+++AT\r", b"\r\nOK\r\n");
        script_start(&emu);
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);

        assert_eq!(modem.start(), Ok(()));
        assert_eq!(modem.state(), DeviceState::AppReady);
        assert!(emu.tx_log().starts_with(b"AT\rAT\r\x1b+++AT\r"));
    }

    #[test]
    fn broken_spi_reported() {
        let emu = Emulator::new();
        emu.state().spi_broken = true;
        let iop = Iop::new();
        let events = RefCell::new(std::vec::Vec::new());
        let notify = |event: AppEvent, _: &str| events.borrow_mut().push(event);
        let mut modem = modem(&iop, &emu).with_notifier(&notify);

        assert_eq!(modem.start(), Err(Error::Internal));
        assert_eq!(events.borrow().as_slice(), &[AppEvent::SpiFault]);
    }

    #[test]
    fn app_ready_while_running_is_reset() {
        let emu = Emulator::new();
        emu.powered();
        emu.respond(b"AT\r", b"\r\nOK\r\n");
        script_start(&emu);
        let iop = Iop::new();
        let events = RefCell::new(std::vec::Vec::new());
        let notify = |event: AppEvent, _: &str| events.borrow_mut().push(event);
        let mut modem = modem(&iop, &emu).with_notifier(&notify);
        modem.start().unwrap();

        emu.inject(b"\r\nAPP RDY\r\n");
        modem.platform().delay_ms(2);
        modem.do_work();
        assert_eq!(events.borrow().as_slice(), &[AppEvent::ResetDetected]);
    }

    #[test]
    fn hardware_reset_restarts() {
        let emu = Emulator::new();
        emu.powered();
        emu.state().boot_ms = Some(1000);
        emu.respond(b"AT\r", b"\r\nOK\r\n");
        script_start(&emu);
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);
        modem.start().unwrap();

        script_start(&emu);
        assert_eq!(modem.reset(ResetKind::Hardware), Ok(()));
        assert_eq!(modem.state(), DeviceState::AppReady);
        assert!(emu.script_done());
    }

    #[test]
    fn power_off_waits_for_status_low() {
        let emu = Emulator::new();
        emu.powered();
        emu.state().boot_ms = Some(1000);
        let iop = Iop::new();
        let mut modem = modem(&iop, &emu);

        assert_eq!(modem.power_off(), Ok(()));
        assert_eq!(modem.state(), DeviceState::PowerOff);
        assert!(!modem.is_powered());
        assert!(emu.now() >= 1800);
    }
}
