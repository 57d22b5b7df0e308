//! TCP, UDP and TLS sockets, and the IRD receive flow that pulls their data.

use crate::atcmd::{Options, ParserKind, Standard, DATA_PROMPT};
use crate::iop::Expect;
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

use super::{DataReceiver, Protocol, StreamCtrl, DATA_CONTEXTS};

/// Largest payload a single `AT+QISEND` accepts.
pub const SEND_MAX: usize = 1460;
const IRD_REQ_MAX: usize = 1500;
const OPEN_TIMEOUT_MS: u32 = 60_000;
const CLOSE_TIMEOUT_MS: u32 = 10_000;
const SEND_TIMEOUT_MS: u32 = 5_000;

const OPEN_RESULT: Standard = Standard::new("+QIOPEN: ", "\r\n").tokens(2).value(1);
const SSL_OPEN_RESULT: Standard = Standard::new("+QSSLOPEN: ", "\r\n").tokens(2).value(1);
const SEND_RESULT: Standard = Standard::new("SEND OK", "\r\n");
const STATE_RESULT: Standard = Standard::new("+QISTATE: ", "OK\r\n").optional().value(5);

/// Socket state value reported by `AT+QISTATE` for a connected socket.
const QISTATE_CONNECTED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketState {
    Closed,
    Open,
}

/// Handle to an initialized socket context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Socket {
    ctx: u8,
}

impl Socket {
    pub fn ctx(&self) -> u8 {
        self.ctx
    }
}

pub(crate) struct SocketCtrl<'a> {
    pub(crate) protocol: Protocol,
    pub(crate) state: SocketState,
    pub(crate) receiver: DataReceiver<'a>,
    /// Received bytes are dropped instead of delivered
    pub(crate) flushing: bool,
}

impl<'a> SocketCtrl<'a> {
    pub(crate) fn mark_closed(&mut self) {
        self.state = SocketState::Closed;
        self.flushing = false;
    }
}

/// Progress of the bulk read pulling a socket's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ird {
    Idle,
    /// `AT+QIRD` sent, size header not seen yet
    Pending { ctx: u8, since: u32 },
    /// Header announced `left` more payload bytes
    Receiving { ctx: u8, left: usize, since: u32 },
    /// Payload delivered, waiting for the final result
    Finishing { ctx: u8, empty: bool },
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Claim context `ctx` for a socket. Received data goes to `receiver`.
    pub fn socket_init(
        &mut self,
        ctx: u8,
        protocol: Protocol,
        buffer: &'a mut [u8],
        receiver: DataReceiver<'a>,
    ) -> Result<Socket, Error> {
        let supported = matches!(protocol, Protocol::Tcp | Protocol::Udp | Protocol::Ssl);
        if ctx >= DATA_CONTEXTS || !supported {
            return Err(Error::BadRequest);
        }
        let ctrl = SocketCtrl {
            protocol,
            state: SocketState::Closed,
            receiver,
            flushing: false,
        };
        self.register_stream(ctx, buffer, StreamCtrl::Socket(ctrl))?;
        Ok(Socket { ctx })
    }

    fn socket_ctrl(&mut self, sock: Socket) -> Result<&mut SocketCtrl<'a>, Error> {
        match self.stream_mut(sock.ctx) {
            Some(StreamCtrl::Socket(s)) => Ok(s),
            _ => Err(Error::PreconditionFailed),
        }
    }

    /// Connect to `host:port`. A non-zero `local_port` binds UDP sockets.
    pub fn socket_open(
        &mut self,
        sock: Socket,
        host: &str,
        port: u16,
        local_port: u16,
    ) -> Result<(), Error> {
        let ctx = sock.ctx;
        let ctrl = self.socket_ctrl(sock)?;
        if ctrl.state == SocketState::Open {
            return Err(Error::Conflict);
        }
        let protocol = ctrl.protocol;
        let pdp = self.config.data_context;

        let res = match protocol {
            Protocol::Ssl => self.invoke(
                format_args!("AT+QSSLOPEN={},{},{},\"{}\",{}", pdp, ctx, ctx, host, port),
                Options::new(ParserKind::Standard(SSL_OPEN_RESULT)).timeout(OPEN_TIMEOUT_MS),
            ),
            Protocol::Udp if local_port != 0 => self.invoke(
                format_args!(
                    "AT+QIOPEN={},{},\"UDP\",\"{}\",{},{}",
                    pdp, ctx, host, port, local_port
                ),
                Options::new(ParserKind::Standard(OPEN_RESULT)).timeout(OPEN_TIMEOUT_MS),
            ),
            _ => {
                let name = if protocol == Protocol::Udp { "UDP" } else { "TCP" };
                self.invoke(
                    format_args!("AT+QIOPEN={},{},\"{}\",\"{}\",{}", pdp, ctx, name, host, port),
                    Options::new(ParserKind::Standard(OPEN_RESULT)).timeout(OPEN_TIMEOUT_MS),
                )
            }
        };
        res?;

        match self.value() {
            Some(0) => {}
            Some(563) => return Err(Error::Conflict),
            Some(566 | 569) => return Err(Error::GatewayTimeout),
            other => {
                warn!("socket {} open failed: {:?}", ctx, other);
                return Err(Error::Unavailable);
            }
        }
        self.reset_stream_pages(ctx);
        self.iop.with_rx(|rx| rx.clear_data_pending(ctx));
        self.socket_ctrl(sock)?.state = SocketState::Open;
        info!("socket {} open", ctx);
        Ok(())
    }

    /// Close the socket and free its context. Closing a released socket is a
    /// no-op.
    pub fn socket_close(&mut self, sock: Socket) -> Result<(), Error> {
        let ctx = sock.ctx;
        let (protocol, state) = match self.stream(ctx) {
            Some(StreamCtrl::Socket(s)) => (s.protocol, s.state),
            Some(_) => return Err(Error::PreconditionFailed),
            None => return Ok(()),
        };

        let mut res = Ok(());
        if state == SocketState::Open {
            let opts = Options::default().timeout(CLOSE_TIMEOUT_MS);
            res = if protocol == Protocol::Ssl {
                self.invoke(format_args!("AT+QSSLCLOSE={}", ctx), opts)
            } else {
                self.invoke(format_args!("AT+QICLOSE={}", ctx), opts)
            };
        }
        if let Ird::Pending { ctx: c, .. }
        | Ird::Receiving { ctx: c, .. }
        | Ird::Finishing { ctx: c, .. } = self.ird
        {
            if c == ctx {
                self.abort_ird();
            }
        }
        self.release_stream(ctx);
        res
    }

    /// Send `data` through `AT+QISEND`.
    pub fn socket_send(&mut self, sock: Socket, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() || data.len() > SEND_MAX {
            return Err(Error::BadRequest);
        }
        if self.socket_ctrl(sock)?.state != SocketState::Open {
            return Err(Error::PreconditionFailed);
        }
        self.invoke_with_payload(
            format_args!("AT+QISEND={},{}", sock.ctx, data.len()),
            DATA_PROMPT,
            data,
            Options::new(ParserKind::Standard(SEND_RESULT)).timeout(SEND_TIMEOUT_MS),
        )
    }

    /// Pull whatever the module holds for the socket now, without waiting for
    /// a receive notification.
    pub fn socket_read(&mut self, sock: Socket) -> Result<(), Error> {
        if self.socket_ctrl(sock)?.state != SocketState::Open {
            return Err(Error::PreconditionFailed);
        }
        self.iop.with_rx(|rx| rx.set_data_pending(sock.ctx));
        self.do_work();
        Ok(())
    }

    /// Read and drop everything pending on the socket.
    pub fn socket_flush(&mut self, sock: Socket) -> Result<(), Error> {
        let ctrl = self.socket_ctrl(sock)?;
        if ctrl.state != SocketState::Open {
            return Err(Error::PreconditionFailed);
        }
        ctrl.flushing = true;
        self.iop.with_rx(|rx| rx.set_data_pending(sock.ctx));

        let start = self.now();
        let mut res = Ok(());
        while self.iop.with_rx(|rx| rx.data_pending()) & (1 << sock.ctx) != 0
            || self.ird != Ird::Idle
        {
            if self.now().wrapping_sub(start) > self.config.ird_timeout {
                res = Err(Error::Timeout);
                break;
            }
            self.do_work();
            self.platform.yield_now();
        }
        self.reset_stream_pages(sock.ctx);
        if let Ok(ctrl) = self.socket_ctrl(sock) {
            ctrl.flushing = false;
        }
        res
    }

    /// Ask the module for the socket's connection state.
    pub fn socket_state(&mut self, sock: Socket) -> Result<SocketState, Error> {
        self.socket_ctrl(sock)?;
        self.invoke(
            format_args!("AT+QISTATE=1,{}", sock.ctx),
            Options::new(ParserKind::Standard(STATE_RESULT)),
        )?;
        let state = if self.value() == Some(QISTATE_CONNECTED) {
            SocketState::Open
        } else {
            SocketState::Closed
        };
        self.socket_ctrl(sock)?.state = state;
        Ok(state)
    }

    pub(crate) fn on_socket_closed(&mut self, ctx: u8) {
        if let Some(StreamCtrl::Socket(s)) = self.stream_mut(ctx) {
            warn!("socket {} closed by remote", ctx);
            s.mark_closed();
        }
    }

    /// Drive the bulk read of pending socket data, one socket at a time.
    pub(crate) fn service_ird(&mut self) {
        match self.ird {
            Ird::Idle => self.start_ird(),
            Ird::Pending { ctx, since } => {
                if let Some(n) = self.iop.with_rx(|rx| rx.take_announced(ctx)) {
                    trace!("ird {}: {} bytes announced", ctx, n);
                    let now = self.now();
                    self.ird = if n == 0 {
                        Ird::Finishing { ctx, empty: true }
                    } else {
                        Ird::Receiving { ctx, left: n, since: now }
                    };
                    return;
                }
                match self.read_result() {
                    Some(Err(Error::Timeout)) => self.ird_fault(ctx),
                    // final result without a size header
                    Some(res) => {
                        warn!("ird {} ended without data: {:?}", ctx, res);
                        self.iop.with_rx(|rx| rx.clear_data_pending(ctx));
                        self.finish_ird(res);
                    }
                    None if self.now().wrapping_sub(since) > self.config.ird_timeout => {
                        self.ird_fault(ctx)
                    }
                    None => {}
                }
            }
            Ird::Receiving { ctx, left, since } => {
                let completed = self.iop.with_rx(|rx| rx.take_completed(ctx));
                let pull = completed || self.stream_idle(ctx);
                let (receiver, flushing) = match self.stream(ctx) {
                    Some(StreamCtrl::Socket(s)) => (s.receiver, s.flushing),
                    _ => {
                        self.abort_ird();
                        return;
                    }
                };
                let n = self.pull_pages(ctx, pull, |data| {
                    if !flushing {
                        receiver(ctx, data);
                    }
                });
                let left = left.saturating_sub(n);
                let now = self.now();
                if completed || left == 0 {
                    if left != 0 {
                        warn!("ird {}: {} bytes lost", ctx, left);
                    }
                    self.ird = Ird::Finishing { ctx, empty: false };
                } else if n > 0 {
                    self.ird = Ird::Receiving { ctx, left, since: now };
                } else if now.wrapping_sub(since) > self.config.ird_timeout {
                    self.ird_fault(ctx);
                } else {
                    self.ird = Ird::Receiving { ctx, left, since };
                }
            }
            Ird::Finishing { ctx, empty } => {
                if let Some(res) = self.read_result() {
                    if empty || res.is_err() {
                        self.iop.with_rx(|rx| rx.clear_data_pending(ctx));
                        if let Some(StreamCtrl::Socket(s)) = self.stream_mut(ctx) {
                            s.flushing = false;
                        }
                    }
                    self.finish_ird(res);
                }
            }
        }
    }

    fn start_ird(&mut self) {
        if self.at.locked() {
            return;
        }
        let pending = self.iop.with_rx(|rx| rx.data_pending());
        if pending == 0 {
            return;
        }

        for step in 1..=DATA_CONTEXTS {
            let ctx = (self.ird_cursor + step) % DATA_CONTEXTS;
            if pending & (1 << ctx) == 0 {
                continue;
            }
            let tls = match self.stream(ctx) {
                Some(StreamCtrl::Socket(s)) if s.state == SocketState::Open => {
                    s.protocol == Protocol::Ssl
                }
                _ => {
                    trace!("dropping receive notice for context {}", ctx);
                    self.iop.with_rx(|rx| rx.clear_data_pending(ctx));
                    continue;
                }
            };
            let req = self
                .iop
                .with_rx(|rx| rx.pages(ctx).map_or(0, |p| p.page_size()))
                .min(IRD_REQ_MAX);

            self.ird_cursor = ctx;
            self.iop.with_rx(|rx| rx.expect(Expect::Ird { ctx, tls }));
            let opts = Options::default().timeout(self.config.ird_timeout).keep_lock();
            let res = if tls {
                self.begin(format_args!("AT+QSSLRECV={},{}", ctx, req), opts)
            } else {
                self.begin(format_args!("AT+QIRD={},{}", ctx, req), opts)
            };
            match res {
                Ok(()) => {
                    let now = self.now();
                    self.ird = Ird::Pending { ctx, since: now };
                }
                Err(e) => {
                    warn!("ird {} not sent: {:?}", ctx, e);
                    self.iop.with_rx(|rx| rx.clear_expect());
                }
            }
            return;
        }
    }

    fn finish_ird(&mut self, res: Result<(), Error>) {
        if let Err(e) = res {
            debug!("ird result {:?}", e);
        }
        self.close();
        self.ird = Ird::Idle;
    }

    fn ird_fault(&mut self, ctx: u8) {
        error!("ird {}: no data within {} ms", ctx, self.config.ird_timeout);
        self.abort_ird();
        self.iop.with_rx(|rx| rx.clear_data_pending(ctx));
        self.notify(crate::modem::AppEvent::ProtocolFault, "bulk read header timeout");
    }

    fn abort_ird(&mut self) {
        self.iop.with_rx(|rx| {
            rx.clear_expect();
            rx.disarm();
        });
        self.release_lock();
        self.ird = Ird::Idle;
    }
}

#[cfg(test)]
mod test {
    use core::cell::RefCell;
    use std::vec::Vec;

    use super::*;
    use crate::atcmd::test::{ready, TestModem};
    use crate::mock::Emulator;
    use crate::Iop;

    fn open(modem: &mut TestModem<'_>, emu: &Emulator, sock: Socket) {
        let cmd = std::format!("AT+QIOPEN=1,{},\"TCP\",\"example.com\",80\r", sock.ctx());
        let reply = std::format!("\r\nOK\r\n\r\n+QIOPEN: {},0\r\n", sock.ctx());
        emu.respond(cmd.as_bytes(), reply.as_bytes());
        modem.socket_open(sock, "example.com", 80, 0).unwrap();
        emu.take_tx();
    }

    fn pump(modem: &mut TestModem<'_>, ms: u32) {
        for _ in 0..ms {
            modem.do_work();
            modem.platform().yield_now();
        }
    }

    #[test]
    fn send_with_prompt() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(3, Protocol::Tcp, &mut buf, &receiver).unwrap();
        open(&mut modem, &emu, sock);

        emu.respond(b"AT+QISEND=3,5\r", b"> ")
            .respond(b"HELLO", b"\r\nSEND OK\r\n");
        assert_eq!(modem.socket_send(sock, b"HELLO"), Ok(()));
        assert_eq!(emu.tx_log(), b"AT+QISEND=3,5\rHELLO");
        assert_eq!(modem.result_code(), Some(200));
        assert!(!modem.is_locked());
    }

    #[test]
    fn send_rejected_without_prompt() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(0, Protocol::Tcp, &mut buf, &receiver).unwrap();
        assert_eq!(modem.socket_send(sock, b"x"), Err(Error::PreconditionFailed));

        open(&mut modem, &emu, sock);
        emu.respond(b"AT+QISEND=0,1\r", b"\r\nERROR\r\n");
        assert_eq!(modem.socket_send(sock, b"x"), Err(Error::ModuleError));
        assert!(!modem.is_locked());
        assert_eq!(emu.tx_log(), b"AT+QISEND=0,1\r");
    }

    #[test]
    fn received_data_pulled_with_ird() {
        let emu = Emulator::new();
        let mut buf = [0u8; 512];
        let got = RefCell::new(Vec::new());
        let receiver = |ctx: u8, data: &[u8]| {
            assert_eq!(ctx, 1);
            got.borrow_mut().extend_from_slice(data);
        };
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(1, Protocol::Tcp, &mut buf, &receiver).unwrap();
        open(&mut modem, &emu, sock);

        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let mut reply = b"\r\n+QIRD: 200\r\n".to_vec();
        reply.extend_from_slice(&payload);
        reply.extend_from_slice(b"\r\n\r\nOK\r\n");
        emu.respond(b"AT+QIRD=1,256\r", &reply)
            .respond(b"AT+QIRD=1,256\r", b"\r\n+QIRD: 0\r\n\r\nOK\r\n");
        emu.inject(b"\r\n+QIURC: \"recv\",1\r\n");

        pump(&mut modem, 100);
        assert_eq!(got.borrow().as_slice(), payload.as_slice());
        assert_eq!(emu.tx_log(), b"AT+QIRD=1,256\rAT+QIRD=1,256\r");
        assert_eq!(iop.with_rx(|rx| rx.data_pending()), 0);
        assert_eq!(modem.ird, Ird::Idle);
        assert!(!modem.is_locked());
    }

    #[test]
    fn missing_ird_header_is_protocol_fault() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let events = RefCell::new(Vec::new());
        let notify = |e: crate::modem::AppEvent, _: &str| events.borrow_mut().push(e);
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu).with_notifier(&notify);
        let sock = modem.socket_init(2, Protocol::Tcp, &mut buf, &receiver).unwrap();
        open(&mut modem, &emu, sock);

        emu.inject(b"\r\n+QIURC: \"recv\",2\r\n");
        pump(&mut modem, 10_100);
        assert_eq!(events.borrow().as_slice(), &[crate::modem::AppEvent::ProtocolFault]);
        assert!(!modem.is_locked());
    }

    #[test]
    fn close_twice_is_noop() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(4, Protocol::Tcp, &mut buf, &receiver).unwrap();
        open(&mut modem, &emu, sock);

        emu.respond(b"AT+QICLOSE=4\r", b"\r\nOK\r\n");
        assert_eq!(modem.socket_close(sock), Ok(()));
        assert_eq!(modem.socket_close(sock), Ok(()));
        assert_eq!(emu.tx_log(), b"AT+QICLOSE=4\r");
        assert!(modem.stream(4).is_none());
    }

    #[test]
    fn remote_close_marks_socket() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(0, Protocol::Tcp, &mut buf, &receiver).unwrap();
        open(&mut modem, &emu, sock);

        emu.inject(b"\r\n+QIURC: \"closed\",0\r\n");
        pump(&mut modem, 3);
        assert_eq!(modem.socket_send(sock, b"x"), Err(Error::PreconditionFailed));
    }

    #[test]
    fn open_failure_maps_module_code() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(0, Protocol::Tcp, &mut buf, &receiver).unwrap();

        emu.respond(
            b"AT+QIOPEN=1,0,\"TCP\",\"example.com\",80\r",
            b"\r\nOK\r\n\r\n+QIOPEN: 0,563\r\n",
        );
        assert_eq!(modem.socket_open(sock, "example.com", 80, 0), Err(Error::Conflict));
    }

    #[test]
    fn flush_discards_pending_data() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let got = RefCell::new(0usize);
        let receiver = |_: u8, data: &[u8]| *got.borrow_mut() += data.len();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(5, Protocol::Tcp, &mut buf, &receiver).unwrap();
        open(&mut modem, &emu, sock);

        emu.respond(b"AT+QIRD=5,128\r", b"\r\n+QIRD: 4\r\njunk\r\n\r\nOK\r\n")
            .respond(b"AT+QIRD=5,128\r", b"\r\n+QIRD: 0\r\n\r\nOK\r\n");
        assert_eq!(modem.socket_flush(sock), Ok(()));
        assert_eq!(*got.borrow(), 0);
        assert!(emu.script_done());
    }

    #[test]
    fn state_query() {
        let emu = Emulator::new();
        let mut buf = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        let sock = modem.socket_init(3, Protocol::Tcp, &mut buf, &receiver).unwrap();

        emu.respond(
            b"AT+QISTATE=1,3\r",
            b"\r\n+QISTATE: 3,\"TCP\",\"1.2.3.4\",80,4000,2,1,3,0,\"usbmodem\"\r\n\r\nOK\r\n",
        );
        assert_eq!(modem.socket_state(sock), Ok(SocketState::Open));
        emu.respond(b"AT+QISTATE=1,3\r", b"\r\nOK\r\n");
        assert_eq!(modem.socket_state(sock), Ok(SocketState::Closed));
    }
}
