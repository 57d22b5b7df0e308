//! AT command engine: one command in flight per modem, guarded by a lock.
//!
//! A command is formatted into the command buffer, sent through the IOP and
//! completed by polling its parser over the captured response. The lock is
//! released automatically on a final result, or by the caller for compound
//! commands that transfer a payload after a prompt.

pub mod parser;

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::helpers::{LossyStr, SliceExt};
use crate::iop::Expect;
use crate::modem::{DeviceState, Modem};
use crate::platform::{BridgeBus, MutexId, Platform};
use crate::Error;

pub use parser::{ParseResult, ParserKind, Standard, CONNECT_PROMPT, DATA_PROMPT};

pub const CMD_BUFFER_SIZE: usize = 448;
pub const RESPONSE_SIZE: usize = 1024;
pub const ERROR_DETAIL_SIZE: usize = 18;
/// Last bytes kept of a response that outgrew the capture, enough for its
/// closing line.
const TAIL_SIZE: usize = 32;

const CTRL_Z: u8 = 0x1A;
const ESCAPE_GUARD_MS: u32 = 1000;

/// Per-command options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Options {
    pub parser: ParserKind,
    /// `None` uses the configured default
    pub timeout_ms: Option<u32>,
    /// Keep the lock after the final result
    pub keep_lock: bool,
}

impl Options {
    pub const fn new(parser: ParserKind) -> Self {
        Self {
            parser,
            timeout_ms: None,
            keep_lock: false,
        }
    }

    #[must_use]
    pub const fn timeout(mut self, ms: u32) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn keep_lock(mut self) -> Self {
        self.keep_lock = true;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new(ParserKind::Ok)
    }
}

/// Command control: the command in flight and its captured response.
pub(crate) struct AtCmd {
    cmd: String<CMD_BUFFER_SIZE>,
    response: Vec<u8, RESPONSE_SIZE>,
    tail: Vec<u8, TAIL_SIZE>,
    /// Received bytes did not fit the capture
    truncated: bool,
    error_detail: String<ERROR_DETAIL_SIZE>,
    parser: ParserKind,
    result: ParseResult,
    status: Option<Result<(), Error>>,
    value: Option<i32>,
    locked: bool,
    auto_release: bool,
    invoked_at: u32,
    finished_at: u32,
    timeout: u32,
}

impl AtCmd {
    pub(crate) const fn new() -> Self {
        Self {
            cmd: String::new(),
            response: Vec::new(),
            tail: Vec::new(),
            truncated: false,
            error_detail: String::new(),
            parser: ParserKind::Ok,
            result: ParseResult::PENDING,
            status: None,
            value: None,
            locked: false,
            auto_release: true,
            invoked_at: 0,
            finished_at: 0,
            timeout: 0,
        }
    }

    pub(crate) fn locked(&self) -> bool {
        self.locked
    }

    fn reset_result(&mut self) {
        self.response.clear();
        self.tail.clear();
        self.truncated = false;
        self.error_detail.clear();
        self.result = ParseResult::PENDING;
        self.status = None;
        self.value = None;
    }
}

/// Feed bytes that missed the capture into the rolling tail. The first
/// overflow seeds it with the end of the capture, so a closing line split
/// across the boundary is still whole.
fn keep_tail(tail: &mut Vec<u8, TAIL_SIZE>, captured: &[u8], dropped: &[u8]) {
    if dropped.is_empty() {
        return;
    }
    if tail.is_empty() {
        let seed = captured.len().saturating_sub(TAIL_SIZE / 2);
        let _ = tail.extend_from_slice(&captured[seed..]);
    }
    let keep = dropped.len().min(TAIL_SIZE);
    let shift = (tail.len() + keep).saturating_sub(TAIL_SIZE);
    if shift > 0 {
        tail.rotate_left(shift);
        tail.truncate(tail.len() - shift);
    }
    let _ = tail.extend_from_slice(&dropped[dropped.len() - keep..]);
}

fn map_result(result: ParseResult) -> Result<(), Error> {
    if result.is_success() {
        Ok(())
    } else if result.contains(ParseResult::MODULE_ERROR) {
        Err(Error::ModuleError)
    } else if result.contains(ParseResult::COUNT_SHORT)
        || result.contains(ParseResult::PREAMBLE_MISSING)
    {
        Err(Error::NotFound)
    } else {
        Err(Error::Internal)
    }
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Send `cmd` if the lock is free. Completes with [`Modem::await_result`].
    pub fn try_invoke(&mut self, cmd: &str) -> Result<(), Error> {
        self.try_invoke_with(format_args!("{}", cmd), Options::default())
    }

    pub fn try_invoke_fmt(&mut self, args: core::fmt::Arguments<'_>) -> Result<(), Error> {
        self.try_invoke_with(args, Options::default())
    }

    pub fn try_invoke_with(
        &mut self,
        args: core::fmt::Arguments<'_>,
        opts: Options,
    ) -> Result<(), Error> {
        if self.state != DeviceState::AppReady {
            return Err(Error::NotReady);
        }
        if self.at.locked {
            return Err(Error::Conflict);
        }
        self.begin(args, opts)
    }

    /// Wait for the lock, send, and wait for the final result.
    pub fn invoke(&mut self, args: core::fmt::Arguments<'_>, opts: Options) -> Result<(), Error> {
        if self.state != DeviceState::AppReady {
            return Err(Error::NotReady);
        }
        let timeout = opts.timeout_ms.unwrap_or(self.config.cmd_timeout);
        if !self.await_lock(timeout) {
            return Err(Error::Conflict);
        }
        self.begin(args, opts)?;
        self.await_result()
    }

    /// Issue the next command of a compound sequence while holding the lock.
    pub fn invoke_reuse_lock(
        &mut self,
        args: core::fmt::Arguments<'_>,
        opts: Options,
    ) -> Result<(), Error> {
        if !self.at.locked {
            return Err(Error::PreconditionFailed);
        }
        self.format_command(args)?;
        self.dispatch(opts)?;
        self.await_result()
    }

    /// Compound command: wait for `prompt`, push `payload`, then complete with
    /// the parser in `finish`. The lock is held from the command until the
    /// final result.
    pub fn invoke_with_payload(
        &mut self,
        args: core::fmt::Arguments<'_>,
        prompt: &'static str,
        payload: &[u8],
        finish: Options,
    ) -> Result<(), Error> {
        if self.state != DeviceState::AppReady {
            return Err(Error::NotReady);
        }
        if !self.await_lock(self.config.cmd_timeout) {
            return Err(Error::Conflict);
        }
        let opts = Options::new(ParserKind::Prompt(prompt))
            .timeout(self.config.prompt_timeout)
            .keep_lock();
        self.begin(args, opts)?;
        if let Err(e) = self.await_result() {
            // no prompt: the module is not waiting for data
            self.release_lock();
            return Err(e);
        }

        self.rearm_parser(finish);
        if let Err(e) = self.send_data(payload) {
            warn!("payload transfer failed: {:?}", e);
            return self.exit_text_mode().and(Err(e));
        }
        self.await_result()
    }

    /// Like [`Modem::invoke`], with the interrupt told to route the payload
    /// behind a bulk header to a stream. The header is armed only once the
    /// lock is ours.
    pub(crate) fn invoke_expecting(
        &mut self,
        args: core::fmt::Arguments<'_>,
        expect: Expect,
        opts: Options,
    ) -> Result<(), Error> {
        if self.state != DeviceState::AppReady {
            return Err(Error::NotReady);
        }
        if !self.await_lock(opts.timeout_ms.unwrap_or(self.config.cmd_timeout)) {
            return Err(Error::Conflict);
        }
        let ctx = match expect {
            Expect::Ird { ctx, .. } | Expect::Connect { ctx, .. } => ctx,
        };
        self.iop.with_rx(|rx| rx.expect(expect));
        if let Err(e) = self.begin(args, opts) {
            self.iop.with_rx(|rx| rx.clear_expect());
            return Err(e);
        }
        let res = self.await_result();
        // result before the transfer ended
        self.iop.with_rx(|rx| {
            if rx.armed_ctx() == Some(ctx) {
                rx.disarm();
            }
        });
        res
    }

    /// Spin until the command lock is free.
    pub fn await_lock(&mut self, timeout_ms: u32) -> bool {
        let start = self.now();
        while self.at.locked {
            if self.now().wrapping_sub(start) > timeout_ms {
                warn!("command lock still held after {} ms", timeout_ms);
                return false;
            }
            self.do_work();
            self.platform.yield_now();
        }
        true
    }

    /// Format, lock and send. Bypasses the ready check, so the controller can
    /// use it for the start commands.
    pub(crate) fn begin(
        &mut self,
        args: core::fmt::Arguments<'_>,
        opts: Options,
    ) -> Result<(), Error> {
        self.format_command(args)?;
        if !self.platform.mutex_take(MutexId::AtCmd, self.config.cmd_timeout) {
            return Err(Error::Conflict);
        }
        self.at.locked = true;
        self.dispatch(opts)
    }

    fn format_command(&mut self, args: core::fmt::Arguments<'_>) -> Result<(), Error> {
        self.at.cmd.clear();
        if self.at.cmd.write_fmt(args).is_err() || self.at.cmd.push('\r').is_err() {
            warn!("command does not fit the command buffer");
            return Err(Error::BadRequest);
        }
        Ok(())
    }

    /// Send the formatted command; the lock is already ours.
    fn dispatch(&mut self, opts: Options) -> Result<(), Error> {
        self.at.auto_release = !opts.keep_lock;
        self.at.parser = opts.parser;
        self.at.timeout = opts.timeout_ms.unwrap_or(self.config.cmd_timeout);
        self.at.reset_result();
        self.iop.clear_cancel();
        self.iop.with_rx(|rx| rx.restart_response());

        let now = self.now();
        self.at.invoked_at = now;
        debug!("--> {:?}", LossyStr(self.at.cmd.as_bytes()));
        if let Err(e) = self.iop.send(self.at.cmd.as_bytes(), true) {
            self.release_lock();
            return Err(e);
        }
        Ok(())
    }

    /// Poll the command in flight. `None` while no final result is known.
    pub fn read_result(&mut self) -> Option<Result<(), Error>> {
        if let Some(status) = self.at.status {
            return Some(status);
        }

        let AtCmd { response, tail, .. } = &mut self.at;
        let (copied, lost) = self.iop.with_rx(|rx| {
            let settled = rx.settled();
            let room = response.capacity() - response.len();
            let n = settled.len().min(room);
            let _ = response.extend_from_slice(&settled[..n]);
            // bytes past the capture only feed the tail
            keep_tail(tail, response, &settled[n..]);
            let total = settled.len();
            let lost = n < total || rx.command_overflow();
            rx.consume(total);
            rx.restart_response();
            (total, lost)
        });
        if copied > 0 {
            trace!("<-- {:?}", LossyStr(&self.at.response));
        }
        if lost && !self.at.truncated {
            warn!("response exceeds {} bytes", RESPONSE_SIZE);
            self.at.truncated = true;
        }

        let outcome = parser::parse(&self.at.parser, &self.at.response);
        let mut result = outcome.result;
        if self.at.truncated {
            if result.is_pending() {
                result = parser::closing(&self.at.parser, &self.at.response, &self.at.tail);
            }
            result = result | ParseResult::EXCESS_RECV;
        }
        self.at.result = result;
        self.at.value = outcome.value.or(self.at.value);

        let status = if result.is_pending() {
            if self.now().wrapping_sub(self.at.invoked_at) <= self.at.timeout {
                return None;
            }
            warn!("command timed out: {:?}", LossyStr(self.at.cmd.as_bytes()));
            Err(Error::Timeout)
        } else {
            if !outcome.detail.is_empty() {
                let detail = core::str::from_utf8(outcome.detail).unwrap_or("");
                crate::helpers::copy_str(&mut self.at.error_detail, detail);
            }
            map_result(result)
        };
        self.finish(status);
        Some(status)
    }

    fn finish(&mut self, status: Result<(), Error>) {
        self.at.status = Some(status);
        self.at.finished_at = self.now();
        if let Err(e) = status {
            debug!("command failed: {:?} {:?}", e, self.at.error_detail.as_str());
        }
        self.iop.with_rx(|rx| rx.clear_expect());
        // a timeout always gives the lock back
        if self.at.auto_release || status == Err(Error::Timeout) {
            self.release_lock();
        }
    }

    /// Loop until the command in flight has a final result, or is cancelled.
    pub fn await_result(&mut self) -> Result<(), Error> {
        loop {
            self.do_work();
            if let Some(status) = self.read_result() {
                return status;
            }
            if self.iop.cancel_requested() {
                self.iop.clear_cancel();
                info!("command cancelled");
                self.finish(Err(Error::Cancelled));
                self.release_lock();
                return Err(Error::Cancelled);
            }
            self.platform.yield_now();
        }
    }

    /// Switch the parser of the command in flight, keeping the lock, and clear
    /// the captured response. Used after a data prompt.
    pub(crate) fn rearm_parser(&mut self, opts: Options) {
        self.at.parser = opts.parser;
        self.at.auto_release = !opts.keep_lock;
        self.at.timeout = opts.timeout_ms.unwrap_or(self.config.cmd_timeout);
        self.at.reset_result();
        self.at.invoked_at = self.now();
        self.iop.with_rx(|rx| rx.restart_response());
    }

    /// Release the lock; returns the command's duration in ms.
    pub fn close(&mut self) -> u32 {
        self.release_lock();
        self.at.finished_at.wrapping_sub(self.at.invoked_at)
    }

    pub(crate) fn release_lock(&mut self) {
        if self.at.locked {
            self.at.locked = false;
            self.platform.mutex_give(MutexId::AtCmd);
        }
    }

    /// Push a payload after a data prompt, in pieces when it exceeds the TX
    /// ring.
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), Error> {
        let start = self.now();
        let mut rest = data;
        while !rest.is_empty() {
            let free = self.iop.tx_free();
            if free == 0 {
                if self.now().wrapping_sub(start) > self.config.prompt_timeout {
                    return Err(Error::Timeout);
                }
                self.platform.yield_now();
                continue;
            }
            let n = free.min(rest.len());
            self.iop.send(&rest[..n], true)?;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Terminate an accept-data prompt with Ctrl-Z and give up the lock.
    pub fn exit_text_mode(&mut self) -> Result<(), Error> {
        let res = self.iop.send(&[CTRL_Z], true);
        self.release_lock();
        res
    }

    /// `+++` escape from transparent data mode, with the required guard times.
    pub fn exit_data_mode(&mut self) -> Result<(), Error> {
        self.platform.delay_ms(ESCAPE_GUARD_MS);
        self.iop.send(b"+++", true)?;
        self.platform.delay_ms(ESCAPE_GUARD_MS);
        self.release_lock();
        Ok(())
    }

    /// Captured response of the last command, lossily decoded.
    pub fn response(&self) -> &str {
        match core::str::from_utf8(&self.at.response) {
            Ok(s) => s,
            Err(e) => core::str::from_utf8(&self.at.response[..e.valid_up_to()]).unwrap_or(""),
        }
    }

    /// Integer extracted by the parser, if any.
    pub fn value(&self) -> Option<i32> {
        self.at.value
    }

    pub fn error_detail(&self) -> &str {
        &self.at.error_detail
    }

    /// Numeric code of the last command; `None` while it is pending.
    pub fn result_code(&self) -> Option<u16> {
        self.at.status.map(|s| crate::error::result_code(&s))
    }

    pub fn is_locked(&self) -> bool {
        self.at.locked
    }

    /// Text after `preamble` up to the end of its line.
    pub(crate) fn response_line(&self, preamble: &str) -> Option<&[u8]> {
        let resp = &self.at.response[..];
        let start = resp.find(preamble.as_bytes())? + preamble.len();
        let rest = &resp[start..];
        let end = rest.iter().position(|&c| c == b'\r' || c == b'\n').unwrap_or(rest.len());
        Some(&rest[..end])
    }

    /// Integer tokens of the line following `preamble`.
    pub(crate) fn response_ints<const N: usize>(&self, preamble: &str) -> Vec<Option<i32>, N> {
        let mut out = Vec::new();
        if let Some(line) = self.response_line(preamble) {
            for token in line.split(|&c| c == b',').take(N) {
                let _ = out.push(crate::helpers::parse_int(token));
            }
        }
        out
    }

    /// Non-empty lines of the response that are not the final `OK`.
    pub(crate) fn response_lines(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.at
            .response
            .split(|&c| c == b'\n')
            .map(|l| l.trim(b"\r "))
            .filter(|l| !l.is_empty() && *l != b"OK")
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::mock::{Emulator, MockBus, MockPlatform};
    use crate::platform::FEATHER_UXPLOR;
    use crate::{Config, Iop};

    pub(crate) type TestModem<'a> = Modem<'a, MockBus, MockPlatform<'a>>;

    /// A modem that is already application ready, with the bridge configured
    /// and the interrupt attached.
    pub(crate) fn ready<'a>(iop: &'a Iop<'a, MockBus>, emu: &Emulator) -> TestModem<'a> {
        let _ = env_logger::builder().is_test(true).try_init();
        let platform = MockPlatform::new(emu, FEATHER_UXPLOR).with_iop(iop);
        let mut modem = Modem::new(iop, emu.bus(), platform, FEATHER_UXPLOR, Config::default());
        modem.bring_up_bridge().unwrap();
        modem.state = DeviceState::AppReady;
        emu.take_tx();
        modem
    }

    #[test]
    fn at_ok() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(b"AT\r", b"\r\nOK\r\n");
        modem.try_invoke("AT").unwrap();
        assert_eq!(modem.await_result(), Ok(()));
        assert_eq!(emu.tx_log(), b"AT\r");
        assert_eq!(modem.result_code(), Some(200));
        assert!(!modem.is_locked());
    }

    #[test]
    fn urc_hidden_from_response() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(
            b"AT+QISTATE?\r",
            b"\r\n+QIURC: \"recv\",3\r\n\r\n\
              +QISTATE: 3,\"TCP\",\"1.2.3.4\",80,4000,2,1,3,0,\"usbmodem\"\r\n\r\nOK\r\n",
        );
        modem.try_invoke("AT+QISTATE?").unwrap();
        assert_eq!(modem.await_result(), Ok(()));
        assert!(!modem.response().contains("QIURC"));
        assert!(modem.response().contains("+QISTATE: 3"));
        assert_eq!(iop.with_rx(|rx| rx.data_pending()), 1 << 3);
    }

    #[test]
    fn one_command_at_a_time() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(b"AT\r", b"\r\nOK\r\n");
        assert!(modem.try_invoke("AT").is_ok());
        assert_eq!(modem.try_invoke("AT+CSQ"), Err(Error::Conflict));
        assert_eq!(modem.await_result(), Ok(()));
        assert!(modem.try_invoke("AT").is_ok());
    }

    #[test]
    fn cancel_releases_lock() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        modem
            .try_invoke_with(format_args!("AT+COPS=?"), Options::default().timeout(180_000))
            .unwrap();
        modem.cancel();
        let start = modem.now();
        assert_eq!(modem.await_result(), Err(Error::Cancelled));
        assert!(modem.now() - start <= 1);
        assert!(!modem.is_locked());
        assert_eq!(modem.result_code(), Some(499));
    }

    #[test]
    fn timeout_releases_lock() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        modem.try_invoke("AT+QPING=1,\"example.com\"").unwrap();
        assert_eq!(modem.await_result(), Err(Error::Timeout));
        assert!(modem.now() >= 800);
        assert!(!modem.is_locked());
        assert_eq!(modem.result_code(), Some(408));
    }

    #[test]
    fn module_error_detail() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(b"AT+QIACT=1\r", b"\r\n+CME ERROR: 550\r\n");
        let res = modem.invoke(format_args!("AT+QIACT=1"), Options::default());
        assert_eq!(res, Err(Error::ModuleError));
        assert_eq!(modem.error_detail(), "550");
        assert_eq!(modem.result_code(), Some(405));
    }

    #[test]
    fn not_ready_before_app_ready() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        modem.state = DeviceState::PowerOn;
        assert_eq!(modem.try_invoke("AT"), Err(Error::NotReady));
        assert!(emu.tx_log().is_empty());
    }

    #[test]
    fn oversize_command_rejected() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let long = [b'A'; CMD_BUFFER_SIZE];
        let long = core::str::from_utf8(&long).unwrap();
        assert_eq!(modem.try_invoke(long), Err(Error::BadRequest));
        assert!(!modem.is_locked());
        assert!(emu.tx_log().is_empty());
    }

    #[test]
    fn reply_longer_than_a_fifo_page() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        let mut reply = std::vec::Vec::from(&b"\r\n"[..]);
        for i in 0..12 {
            let line = std::format!("+QFLST: \"UFS:log_{:02}.txt\",{}\r\n", i, 100 * i);
            reply.extend_from_slice(line.as_bytes());
        }
        reply.extend_from_slice(b"\r\nOK\r\n");
        assert!(reply.len() > 256);

        emu.respond(b"AT+QFLST=\"*\"\r", &reply);
        assert_eq!(modem.invoke(format_args!("AT+QFLST=\"*\""), Options::default()), Ok(()));
        assert_eq!(modem.response_lines().count(), 12);
        assert_eq!(modem.response().len(), reply.len());
    }

    #[test]
    fn reply_beyond_capture_still_completes() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        let mut reply = std::vec::Vec::from(&b"\r\n"[..]);
        while reply.len() < RESPONSE_SIZE + 200 {
            reply.extend_from_slice(b"+QIACT: 1,1,1,\"10.64.1.7\"\r\n");
        }
        reply.extend_from_slice(b"\r\nOK\r\n");

        emu.respond(b"AT+QIACT?\r", &reply).respond(b"AT\r", b"\r\nERROR\r\n");
        assert_eq!(modem.invoke(format_args!("AT+QIACT?"), Options::default()), Ok(()));
        assert_eq!(modem.response().len(), RESPONSE_SIZE);
        assert!(modem.at.result.contains(ParseResult::EXCESS_RECV));

        // the next command starts from a clean capture
        assert_eq!(modem.invoke(format_args!("AT"), Options::default()), Err(Error::ModuleError));
        assert!(!modem.at.result.contains(ParseResult::EXCESS_RECV));
    }

    #[test]
    fn reuse_lock_runs_follow_up_command() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        assert_eq!(
            modem.invoke_reuse_lock(format_args!("AT"), Options::default()),
            Err(Error::PreconditionFailed)
        );

        emu.respond(b"AT+QFOPEN=\"UFS:a.txt\"\r", b"\r\n+QFOPEN: 1027\r\n\r\nOK\r\n")
            .respond(b"AT+QFCLOSE=1027\r", b"\r\nOK\r\n")
            .respond(b"AT\r", b"\r\nOK\r\n");
        modem
            .try_invoke_with(
                format_args!("AT+QFOPEN=\"UFS:a.txt\""),
                Options::default().keep_lock(),
            )
            .unwrap();
        assert_eq!(modem.await_result(), Ok(()));
        assert!(modem.is_locked());
        assert!(modem.platform().mutex_held());

        assert_eq!(
            modem.invoke_reuse_lock(format_args!("AT+QFCLOSE=1027"), Options::default()),
            Ok(())
        );
        assert!(!modem.is_locked());
        assert!(!modem.platform().mutex_held());
        assert_eq!(modem.invoke(format_args!("AT"), Options::default()), Ok(()));
        assert!(emu.script_done());
    }

    #[test]
    fn standard_parser_value() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(b"AT+CSQ\r", b"\r\n+CSQ: 24,99\r\n\r\nOK\r\n");
        let layout = Standard::new("+CSQ: ", "OK\r\n").tokens(2).value(0);
        let opts = Options::new(ParserKind::Standard(layout));
        modem.invoke(format_args!("AT+CSQ"), opts).unwrap();
        assert_eq!(modem.value(), Some(24));
        assert_eq!(modem.response_ints::<2>("+CSQ: ").as_slice(), &[Some(24), Some(99)]);
    }
}
