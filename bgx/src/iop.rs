//! I/O processor: everything the bridge interrupt touches.
//!
//! The interrupt drains the bridge RX FIFO and routes every byte either into
//! the command buffer (command mode) or into the receive pages of the armed
//! stream (data mode). Complete lines in command mode are checked for URCs;
//! recognised ones are cut out of the command buffer before any AT parser can
//! see them, and some of them arm a stream for the bytes that follow.
//!
//! All of it lives behind a `critical_section::Mutex`. The foreground only
//! borrows it for short, non-blocking sections.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use heapless::{Deque, Vec};

use crate::bridge::{reg, Bridge, IrqCause, FIFO_SIZE};
use crate::buffers::{CoreBuffer, Page, RxPages, TxRing};
use crate::error::BusError;
use crate::helpers::LossyStr;
use crate::platform::BridgeBus;
use crate::urc::{self, Urc, UrcEvent};
use crate::Error;

pub const CORE_BUFFER_SIZE: usize = 1024;
pub const TX_BUFFER_SIZE: usize = 1024;
/// Number of stream slots, indexed by context id.
pub const STREAM_SLOTS: usize = 8;

const ISR_ROUNDS: usize = 120;
const LINE_DETECT_SIZE: usize = 48;
const EVENT_QUEUE_SIZE: usize = 8;
const TRAILER_MAX: usize = 16;

/// Closing sequence of a `+QMTRECV` message.
pub const MQTT_TRAILER: &[u8] = b"\"\r\n";
/// Closing sequence of `AT+QHTTPREAD` data, before the `+QHTTPREAD:` line.
pub const HTTP_TRAILER: &[u8] = b"\r\nOK\r\n\r\n";

/// Matches a closing byte sequence at the end of a stream.
///
/// With `strip` the bytes that could still turn out to be part of the
/// sequence are held back, so the sequence itself never reaches the stream.
pub(crate) struct Trailer {
    pattern: &'static [u8],
    window: Vec<u8, TRAILER_MAX>,
    strip: bool,
}

impl Trailer {
    pub(crate) fn new(pattern: &'static [u8], strip: bool) -> Self {
        debug_assert!(!pattern.is_empty() && pattern.len() <= TRAILER_MAX);
        Self {
            pattern,
            window: Vec::new(),
            strip,
        }
    }

    /// Feed one byte, passing stream bytes to `emit`. Returns `true` when the
    /// sequence has completed.
    fn feed(&mut self, byte: u8, mut emit: impl FnMut(&[u8])) -> bool {
        if !self.strip {
            emit(&[byte]);
        }
        // the window is always a proper prefix of the pattern here
        let _ = self.window.push(byte);
        loop {
            if self.window.as_slice() == self.pattern {
                self.window.clear();
                return true;
            }
            if self.pattern.starts_with(&self.window) {
                return false;
            }
            let first = self.window.remove(0);
            if self.strip {
                emit(&[first]);
            }
        }
    }
}

/// How the end of an armed transfer is found.
pub(crate) enum Framing {
    /// Exactly this many more bytes
    Length(usize),
    Trailer(Trailer),
}

struct Armed {
    ctx: u8,
    framing: Framing,
    spill: bool,
}

/// Header line a pending bulk read is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// `+QIRD: <n>`, or `+QSSLRECV: <n>` for TLS sockets
    Ird { ctx: u8, tls: bool },
    /// `CONNECT[ <n>]`; without a length the data ends at `trailer`
    Connect { ctx: u8, trailer: &'static [u8] },
}

/// Receive side state: command buffer, URC line detection and stream pages.
pub(crate) struct RxRouter<'a> {
    core: CoreBuffer<CORE_BUFFER_SIZE>,
    line: Vec<u8, LINE_DETECT_SIZE>,
    line_start: usize,
    line_done: bool,
    streams: [Option<RxPages<'a>>; STREAM_SLOTS],
    armed: Option<Armed>,
    /// Rest of a message nobody receives, dropped up to its trailer
    discard: Option<Trailer>,
    expect: Option<Expect>,
    announced: Option<(u8, usize)>,
    completed: u8,
    data_pending: u8,
    events: Deque<UrcEvent, EVENT_QUEUE_SIZE>,
}

impl<'a> RxRouter<'a> {
    pub(crate) const fn new() -> Self {
        Self {
            core: CoreBuffer::new(),
            line: Vec::new(),
            line_start: 0,
            line_done: false,
            streams: [None, None, None, None, None, None, None, None],
            armed: None,
            discard: None,
            expect: None,
            announced: None,
            completed: 0,
            data_pending: 0,
            events: Deque::new(),
        }
    }

    /// Route a chunk drained from the bridge.
    pub(crate) fn ingest(&mut self, data: &[u8], now: u32) {
        let mut i = 0;
        while i < data.len() {
            if self.discard.is_some() {
                i += self.route_discard(&data[i..]);
            } else if self.armed.is_some() {
                i += self.route_armed(&data[i..], now);
            } else {
                self.push_command(data[i], now);
                i += 1;
            }
        }
        self.core.mark_scanned();
    }

    fn route_armed(&mut self, bytes: &[u8], now: u32) -> usize {
        let Some(armed) = self.armed.as_mut() else {
            return 0;
        };
        let ctx = armed.ctx;
        let spill = armed.spill;
        let Some(pages) = self.streams[ctx as usize].as_mut() else {
            warn!("stream {} armed without receive pages", ctx);
            self.armed = None;
            return 0;
        };
        let was_overflow = pages.overflow();

        let (used, done) = match &mut armed.framing {
            Framing::Length(remaining) => {
                let n = bytes.len().min(*remaining);
                pages.write(&bytes[..n], now, spill);
                *remaining -= n;
                (n, *remaining == 0)
            }
            Framing::Trailer(trailer) => {
                let mut used = bytes.len();
                let mut done = false;
                for (k, &b) in bytes.iter().enumerate() {
                    if trailer.feed(b, |out| {
                        pages.write(out, now, spill);
                    }) {
                        used = k + 1;
                        done = true;
                        break;
                    }
                }
                (used, done)
            }
        };

        if pages.overflow() && !was_overflow {
            error!("stream {} receive overflow", ctx);
            self.push_event(UrcEvent::Overflow(ctx));
        }
        if done {
            self.finish_armed();
        }
        used
    }

    fn route_discard(&mut self, bytes: &[u8]) -> usize {
        let Some(trailer) = self.discard.as_mut() else {
            return 0;
        };
        for (k, &b) in bytes.iter().enumerate() {
            if trailer.feed(b, |_| {}) {
                self.discard = None;
                self.restart_line();
                return k + 1;
            }
        }
        bytes.len()
    }

    fn finish_armed(&mut self) {
        if let Some(armed) = self.armed.take() {
            trace!("stream {} transfer complete", armed.ctx);
            self.completed |= 1 << armed.ctx;
        }
        self.restart_line();
    }

    fn restart_line(&mut self) {
        self.line.clear();
        self.line_start = self.core.head();
        self.line_done = false;
    }

    fn push_command(&mut self, byte: u8, now: u32) {
        let was_full = self.core.overflow();
        if !self.core.push(byte) && !was_full {
            warn!("command buffer full");
        }
        let _ = self.line.push(byte);

        if byte == b'\n' {
            self.complete_line(now);
            self.line.clear();
            self.line_start = self.core.head();
            self.line_done = false;
        } else if byte == b',' && !self.line_done && self.line.starts_with(urc::MQTT_RECV_PREFIX) {
            self.line_done = true;
            self.arm_mqtt(now);
        }
    }

    fn strip_line(&mut self) {
        self.core.truncate(self.line_start);
    }

    fn complete_line(&mut self, now: u32) {
        let text = trim_eol(&self.line);

        if let Some(expect) = self.expect {
            match expect {
                Expect::Ird { ctx, tls } => {
                    let prefix = if tls {
                        urc::SSL_RECV_PREFIX
                    } else {
                        urc::IRD_PREFIX
                    };
                    if let Some(n) = urc::ird_header(text, prefix) {
                        self.strip_line();
                        self.expect = None;
                        self.announced = Some((ctx, n));
                        if n > 0 {
                            self.arm(ctx, Framing::Length(n), true, now);
                        }
                        return;
                    }
                }
                Expect::Connect { ctx, trailer } => {
                    if let Some(len) = urc::connect_header(text) {
                        self.strip_line();
                        self.expect = None;
                        let framing = match len {
                            Some(0) => {
                                self.announced = Some((ctx, 0));
                                return;
                            }
                            Some(n) => {
                                self.announced = Some((ctx, n));
                                Framing::Length(n)
                            }
                            None => Framing::Trailer(Trailer::new(trailer, true)),
                        };
                        self.arm(ctx, framing, true, now);
                        return;
                    }
                }
            }
        }

        let Some(found) = urc::classify(text) else {
            return;
        };
        debug!("urc {:?}", LossyStr(text));
        match found {
            Urc::RecvPending(ctx) => {
                if (ctx as usize) < STREAM_SLOTS {
                    self.data_pending |= 1 << ctx;
                }
            }
            Urc::SocketClosed(ctx) => self.push_event(UrcEvent::SocketClosed(ctx)),
            Urc::PdpDeactivated(ctx) => self.push_event(UrcEvent::PdpDeactivated(ctx)),
            Urc::MqttStatus(ctx, err) => self.push_event(UrcEvent::MqttClosed { ctx, err }),
            Urc::MqttDisconnect(ctx) => self.push_event(UrcEvent::MqttDisconnected(ctx)),
            Urc::AppReady => self.push_event(UrcEvent::AppReady),
        }
        if found.strip() {
            self.strip_line();
        }
    }

    /// `+QMTRECV: <ctx>,` seen: the rest of the message belongs to the stream.
    fn arm_mqtt(&mut self, now: u32) {
        let Some(ctx) = urc::mqtt_recv_ctx(&self.line) else {
            return;
        };
        let Some(pages) = self
            .streams
            .get_mut(ctx as usize)
            .and_then(|slot| slot.as_mut())
        else {
            warn!("mqtt message for unregistered context {}, dropped", ctx);
            self.strip_line();
            self.line.clear();
            self.discard = Some(Trailer::new(MQTT_TRAILER, true));
            return;
        };
        pages.begin_frame(now);
        pages.write(&self.line, now, false);
        self.strip_line();
        self.line.clear();
        self.armed = Some(Armed {
            ctx,
            framing: Framing::Trailer(Trailer::new(MQTT_TRAILER, false)),
            spill: false,
        });
    }

    pub(crate) fn arm(&mut self, ctx: u8, framing: Framing, spill: bool, now: u32) {
        if let Some(pages) = self.streams.get_mut(ctx as usize).and_then(|s| s.as_mut()) {
            pages.begin_frame(now);
        }
        self.completed &= !(1 << ctx);
        self.armed = Some(Armed { ctx, framing, spill });
    }

    pub(crate) fn disarm(&mut self) {
        if self.armed.take().is_some() {
            self.restart_line();
        }
    }

    pub(crate) fn armed_ctx(&self) -> Option<u8> {
        self.armed.as_ref().map(|a| a.ctx)
    }

    fn push_event(&mut self, event: UrcEvent) {
        if self.events.push_back(event).is_err() {
            warn!("event queue full, dropping {:?}", event);
        }
    }

    pub(crate) fn pop_event(&mut self) -> Option<UrcEvent> {
        self.events.pop_front()
    }

    pub(crate) fn expect(&mut self, expect: Expect) {
        self.expect = Some(expect);
        self.announced = None;
    }

    pub(crate) fn clear_expect(&mut self) {
        self.expect = None;
    }

    /// Length announced by the last matched bulk header for `ctx`.
    pub(crate) fn take_announced(&mut self, ctx: u8) -> Option<usize> {
        match self.announced {
            Some((c, n)) if c == ctx => {
                self.announced = None;
                Some(n)
            }
            _ => None,
        }
    }

    /// Whether a framed transfer for `ctx` ended since the last call.
    pub(crate) fn take_completed(&mut self, ctx: u8) -> bool {
        let bit = 1 << ctx;
        let done = self.completed & bit != 0;
        self.completed &= !bit;
        done
    }

    pub(crate) fn data_pending(&self) -> u8 {
        self.data_pending
    }

    pub(crate) fn set_data_pending(&mut self, ctx: u8) {
        self.data_pending |= 1 << ctx;
    }

    pub(crate) fn clear_data_pending(&mut self, ctx: u8) {
        self.data_pending &= !(1 << ctx);
    }

    pub(crate) fn register(&mut self, ctx: u8, pages: RxPages<'a>) -> Result<(), Error> {
        let slot = self.streams.get_mut(ctx as usize).ok_or(Error::BadRequest)?;
        if slot.is_some() {
            return Err(Error::Conflict);
        }
        *slot = Some(pages);
        Ok(())
    }

    pub(crate) fn unregister(&mut self, ctx: u8) -> Option<RxPages<'a>> {
        if self.armed_ctx() == Some(ctx) {
            self.disarm();
        }
        self.data_pending &= !(1 << ctx);
        self.completed &= !(1 << ctx);
        self.streams.get_mut(ctx as usize).and_then(Option::take)
    }

    pub(crate) fn pages(&self, ctx: u8) -> Option<&RxPages<'a>> {
        self.streams.get(ctx as usize).and_then(Option::as_ref)
    }

    pub(crate) fn pages_mut(&mut self, ctx: u8) -> Option<&mut RxPages<'a>> {
        self.streams.get_mut(ctx as usize).and_then(Option::as_mut)
    }

    pub(crate) fn take_page(&mut self, ctx: u8, pull_partial: bool) -> Option<Page<'a>> {
        self.pages_mut(ctx)?.take(pull_partial)
    }

    pub(crate) fn give_back(&mut self, ctx: u8, page: Page<'a>) {
        if let Some(pages) = self.pages_mut(ctx) {
            pages.give_back(page);
        }
    }

    /// Received command-mode bytes that can no longer be stripped.
    ///
    /// A partial line that may still become a URC or an expected header is
    /// held back until its line feed arrives.
    pub(crate) fn settled(&self) -> &[u8] {
        let unread = self.core.unread();
        let held = self.expect.is_some()
            || matches!(self.line.first(), Some(b'+') | Some(b'A'));
        if held {
            let tail = self.core.head() - unread.len();
            &unread[..self.line_start.saturating_sub(tail)]
        } else {
            unread
        }
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.core.consume(n);
    }

    /// Drop stale and already consumed bytes. An unconsumed partial line is
    /// kept, it may still turn into a URC.
    pub(crate) fn restart_response(&mut self) {
        let tail = self.core.head() - self.core.unread().len();
        let removed = self.core.discard_before(self.line_start.max(tail));
        self.line_start = self.line_start.saturating_sub(removed);
    }

    pub(crate) fn command_overflow(&self) -> bool {
        self.core.overflow()
    }

    /// Back to a clean command mode; stream registrations survive.
    pub(crate) fn clear(&mut self) {
        self.core.clear();
        self.line.clear();
        self.line_start = 0;
        self.line_done = false;
        self.armed = None;
        self.discard = None;
        self.expect = None;
        self.announced = None;
        self.completed = 0;
        self.data_pending = 0;
        self.events.clear();
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    use crate::helpers::SliceExt;
    line.trim(b"\r\n")
}

struct Shared<'a, B> {
    bridge: Option<Bridge<B>>,
    tx: TxRing<TX_BUFFER_SIZE>,
    bus_faults: u16,
    rx: RxRouter<'a>,
}

/// State shared between the bridge interrupt and the driver.
///
/// Usually placed in a `static` so that the board's interrupt handler can
/// reach it:
///
/// ```ignore
/// static IOP: Iop<'static, SpiBridge<MySpi>> = Iop::new();
///
/// #[interrupt]
/// fn GPIO_BANK0() {
///     IOP.service_irq(now_ms());
/// }
/// ```
pub struct Iop<'a, B> {
    shared: Mutex<RefCell<Shared<'a, B>>>,
    cancel: AtomicBool,
}

impl<'a, B> Iop<'a, B> {
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Shared {
                bridge: None,
                tx: TxRing::new(),
                bus_faults: 0,
                rx: RxRouter::new(),
            })),
            cancel: AtomicBool::new(false),
        }
    }

    /// Abort the wait of the command in flight. Safe from any context.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    pub(crate) fn with_rx<R>(&self, f: impl FnOnce(&mut RxRouter<'a>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.shared.borrow(cs).borrow_mut().rx))
    }
}

impl<'a, B> Default for Iop<'a, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, B: BridgeBus> Iop<'a, B> {
    /// Bridge interrupt entry point.
    pub fn service_irq(&self, now_ms: u32) {
        critical_section::with(|cs| self.shared.borrow(cs).borrow_mut().service(now_ms))
    }

    pub(crate) fn install(&self, bridge: Bridge<B>) {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow(cs).borrow_mut();
            shared.bridge = Some(bridge);
            shared.tx.clear();
            shared.rx.clear();
        })
    }

    pub(crate) fn uninstall(&self) -> Option<Bridge<B>> {
        critical_section::with(|cs| self.shared.borrow(cs).borrow_mut().bridge.take())
    }

    pub(crate) fn with_bridge<R>(
        &self,
        f: impl FnOnce(&mut Bridge<B>) -> Result<R, BusError>,
    ) -> Result<R, Error> {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow(cs).borrow_mut();
            let bridge = shared.bridge.as_mut().ok_or(Error::Internal)?;
            f(bridge).map_err(Error::from)
        })
    }

    /// Queue bytes for the modem. With `immediate` the FIFO is primed right
    /// away; the interrupt keeps it fed afterwards.
    pub(crate) fn send(&self, data: &[u8], immediate: bool) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow(cs).borrow_mut();
            if shared.tx.free() < data.len() {
                return Err(Error::Overflow);
            }
            shared.tx.push_slice(data);
            if immediate {
                let Shared { bridge, tx, .. } = &mut *shared;
                let bridge = bridge.as_mut().ok_or(Error::Internal)?;
                pump_tx(bridge, tx)?;
            }
            Ok(())
        })
    }

    pub(crate) fn tx_free(&self) -> usize {
        critical_section::with(|cs| self.shared.borrow(cs).borrow().tx.free())
    }

    /// Bridge transfers that failed inside the interrupt since the last call.
    pub(crate) fn take_bus_faults(&self) -> u16 {
        critical_section::with(|cs| {
            core::mem::take(&mut self.shared.borrow(cs).borrow_mut().bus_faults)
        })
    }

    /// Drop queued TX bytes and all receive state.
    pub(crate) fn reset(&self) {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow(cs).borrow_mut();
            shared.tx.clear();
            shared.rx.clear();
        })
    }
}

impl<'a, B: BridgeBus> Shared<'a, B> {
    fn service(&mut self, now: u32) {
        let Shared {
            bridge,
            tx,
            rx,
            bus_faults,
            ..
        } = self;
        let Some(bridge) = bridge.as_mut() else {
            return;
        };

        // the loop ends on an IIR read that shows nothing pending
        for round in 0.. {
            if round == ISR_ROUNDS {
                warn!("bridge interrupt still pending after {} rounds", round);
                break;
            }
            let res = match bridge.interrupt_cause() {
                Ok(IrqCause::None) => break,
                Ok(IrqCause::RxLineError) => {
                    warn!("bridge line error, flushing rx");
                    bridge.flush_rx()
                }
                Ok(IrqCause::RxData | IrqCause::RxTimeout) => drain_rx(bridge, rx, now),
                Ok(IrqCause::TxReady) => pump_tx(bridge, tx).map(|_| ()),
                Ok(IrqCause::ModemStatus) => bridge.read_reg(reg::MSR).map(|_| ()),
                Err(e) => Err(e),
            };
            if res.is_err() {
                *bus_faults = bus_faults.saturating_add(1);
                break;
            }
        }
    }
}

fn drain_rx<B: BridgeBus>(
    bridge: &mut Bridge<B>,
    rx: &mut RxRouter<'_>,
    now: u32,
) -> Result<(), BusError> {
    let level = bridge.rx_level()?.min(FIFO_SIZE);
    if level == 0 {
        return Ok(());
    }
    let mut chunk = [0u8; FIFO_SIZE];
    bridge.read_fifo(&mut chunk[..level])?;
    rx.ingest(&chunk[..level], now);
    Ok(())
}

fn pump_tx<B: BridgeBus, const N: usize>(
    bridge: &mut Bridge<B>,
    tx: &mut TxRing<N>,
) -> Result<usize, BusError> {
    if tx.is_empty() {
        return Ok(0);
    }
    let space = bridge.tx_space()?.min(FIFO_SIZE);
    if space == 0 {
        return Ok(0);
    }
    let mut chunk = [0u8; FIFO_SIZE];
    let n = tx.pop(&mut chunk[..space]);
    bridge.write_fifo(&chunk[..n])?;
    Ok(n)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffers::split_pages;

    fn feed(rx: &mut RxRouter<'_>, data: &[u8], chunk: usize) {
        for (i, part) in data.chunks(chunk).enumerate() {
            rx.ingest(part, i as u32);
        }
    }

    fn drain(rx: &mut RxRouter<'_>) -> std::vec::Vec<u8> {
        let out = rx.settled().to_vec();
        rx.consume(out.len());
        out
    }

    #[test]
    fn trailer_holds_back_closing_bytes() {
        let mut t = Trailer::new(HTTP_TRAILER, true);
        let mut out = std::vec::Vec::new();
        let mut done = false;
        for &b in b"body\r\nOK\r\nmore\r\nOK\r\n\r\n" {
            done = t.feed(b, |s| out.extend_from_slice(s));
            if done {
                break;
            }
        }
        assert!(done);
        assert_eq!(out, b"body\r\nOK\r\nmore");
    }

    #[test]
    fn urc_stripped_across_chunks() {
        let mut rx = RxRouter::new();
        let stream = b"\r\n+QISTATE: 3,\"TCP\"\r\n\r\n+QIURC: \"recv\",3\r\n\r\nOK\r\n";
        // every chunk size, including ones that split the URC mid-line
        for chunk in 1..=stream.len() {
            rx.clear();
            let mut seen = std::vec::Vec::new();
            for (i, part) in stream.chunks(chunk).enumerate() {
                rx.ingest(part, i as u32);
                seen.extend(drain(&mut rx));
            }
            assert_eq!(seen, b"\r\n+QISTATE: 3,\"TCP\"\r\n\r\n\r\nOK\r\n");
            assert_eq!(rx.data_pending(), 1 << 3);
        }
    }

    #[test]
    fn events_queued_and_stripped() {
        let mut rx = RxRouter::new();
        feed(
            &mut rx,
            b"\r\nAPP RDY\r\n\r\n+QIURC: \"closed\",2\r\n\r\n+QMTDISC: 1,0\r\n",
            7,
        );
        assert_eq!(rx.pop_event(), Some(UrcEvent::AppReady));
        assert_eq!(rx.pop_event(), Some(UrcEvent::SocketClosed(2)));
        assert_eq!(rx.pop_event(), Some(UrcEvent::MqttDisconnected(1)));
        assert_eq!(rx.pop_event(), None);
        assert_eq!(drain(&mut rx), b"\r\n\r\n\r\n+QMTDISC: 1,0\r\n");
    }

    #[test]
    fn ird_payload_spliced_out() {
        let mut buf = [0u8; 256];
        let mut rx = RxRouter::new();
        rx.register(3, RxPages::new(split_pages(&mut buf).unwrap())).unwrap();
        rx.expect(Expect::Ird { ctx: 3, tls: false });

        feed(&mut rx, b"\r\n+QIRD: 5\r\nHE\r\nO\r\n\r\nOK\r\n", 4);
        assert_eq!(rx.take_announced(3), Some(5));
        assert!(rx.take_completed(3));
        assert_eq!(rx.armed_ctx(), None);
        assert_eq!(drain(&mut rx), b"\r\n\r\n\r\nOK\r\n");

        let page = rx.take_page(3, true).unwrap();
        assert_eq!(page.unread(), b"HE\r\nO");
        rx.give_back(3, page);
    }

    #[test]
    fn empty_ird_arms_nothing() {
        let mut buf = [0u8; 256];
        let mut rx = RxRouter::new();
        rx.register(0, RxPages::new(split_pages(&mut buf).unwrap())).unwrap();
        rx.expect(Expect::Ird { ctx: 0, tls: false });
        feed(&mut rx, b"\r\n+QIRD: 0\r\n\r\nOK\r\n", 64);
        assert_eq!(rx.take_announced(0), Some(0));
        assert_eq!(rx.armed_ctx(), None);
        assert_eq!(rx.pages(0).unwrap().pending(), 0);
    }

    #[test]
    fn mqtt_message_moves_to_stream() {
        let mut buf = [0u8; 256];
        let mut rx = RxRouter::new();
        rx.register(5, RxPages::new(split_pages(&mut buf).unwrap())).unwrap();

        let msg = b"\r\n+QMTRECV: 5,17,\"devices/42/cmd/blink\",\"ok\"\r\n";
        feed(&mut rx, msg, 5);
        assert!(rx.take_completed(5));
        assert_eq!(drain(&mut rx), b"\r\n");
        let page = rx.take_page(5, true).unwrap();
        assert_eq!(page.unread(), &msg[2..]);
        rx.give_back(5, page);

        // the line after the message is back in command mode
        feed(&mut rx, b"\r\nOK\r\n", 64);
        assert_eq!(drain(&mut rx), b"\r\nOK\r\n");
    }

    #[test]
    fn http_read_trailer_goes_to_command_buffer() {
        let mut buf = [0u8; 256];
        let mut rx = RxRouter::new();
        rx.register(7, RxPages::new(split_pages(&mut buf).unwrap())).unwrap();
        rx.expect(Expect::Connect {
            ctx: 7,
            trailer: HTTP_TRAILER,
        });
        feed(
            &mut rx,
            b"\r\nCONNECT\r\n<html>OK</html>\r\nOK\r\n\r\n+QHTTPREAD: 0\r\n",
            9,
        );
        assert!(rx.take_completed(7));
        assert_eq!(drain(&mut rx), b"\r\n+QHTTPREAD: 0\r\n");
        assert_eq!(rx.take_page(7, true).unwrap().unread(), b"<html>OK</html>");
    }

    #[test]
    fn long_stream_swaps_pages() {
        let mut buf = [0u8; 4096];
        let mut rx = RxRouter::new();
        rx.register(1, RxPages::new(split_pages(&mut buf).unwrap())).unwrap();
        rx.arm(1, Framing::Length(2050), true, 0);

        let data: std::vec::Vec<u8> = (0..2050u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut swapped_at = None;
        for (i, part) in data.chunks(FIFO_SIZE).enumerate() {
            let before = rx.pages(1).unwrap().iop_page();
            rx.ingest(part, i as u32);
            if swapped_at.is_none() && rx.pages(1).unwrap().iop_page() != before {
                swapped_at = Some((i + 1) * FIFO_SIZE);
            }
            assert!(rx.pages(1).unwrap().is_consistent());
        }
        assert!(swapped_at.unwrap() >= 2049);
        assert!(!rx.pages(1).unwrap().overflow());
        assert!(rx.take_completed(1));

        let mut delivered = std::vec::Vec::new();
        let mut deliveries = 0;
        while let Some(page) = rx.take_page(1, true) {
            delivered.extend_from_slice(page.unread());
            deliveries += 1;
            rx.give_back(1, page);
        }
        assert_eq!(deliveries, 2);
        assert_eq!(delivered, data);
    }

    #[test]
    fn partial_urc_line_is_held_back() {
        let mut rx = RxRouter::new();
        rx.ingest(b"\r\nOK\r\n+QIURC: \"re", 0);
        assert_eq!(rx.settled(), b"\r\nOK\r\n");
        rx.ingest(b"> ", 1);
        assert_eq!(rx.settled(), b"\r\nOK\r\n");
        rx.clear();
        rx.ingest(b"\r\n> ", 2);
        assert_eq!(rx.settled(), b"\r\n> ");
    }
}
