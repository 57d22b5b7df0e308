//! Stream dispatcher.
//!
//! Every stream owns a caller supplied receive buffer, split into two pages
//! that the interrupt fills and [`Modem::do_work`] hands to the stream's
//! receiver. Contexts `0..=5` are shared between sockets and MQTT sessions;
//! the HTTP client and the file system have a slot of their own.

pub mod file;
pub mod http;
pub mod mqtt;
pub mod socket;

use crate::buffers::{split_pages, RxPages};
use crate::iop::STREAM_SLOTS;
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

use self::file::FileCtrl;
use self::http::HttpCtrl;
use self::mqtt::MqttCtrl;
use self::socket::SocketCtrl;

/// Contexts available to sockets and MQTT sessions.
pub const DATA_CONTEXTS: u8 = 6;
pub const FILE_CTX: u8 = 6;
pub const HTTP_CTX: u8 = 7;

/// Bulk data receiver: context and the bytes delivered. Runs inside
/// [`Modem::do_work`] and must not call back into the modem.
pub type DataReceiver<'a> = &'a dyn Fn(u8, &[u8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    Tcp,
    Udp,
    /// TCP over TLS
    Ssl,
    Mqtt,
    Http,
    File,
}

pub(crate) enum StreamCtrl<'a> {
    Socket(SocketCtrl<'a>),
    Mqtt(MqttCtrl<'a>),
    Http(HttpCtrl<'a>),
    File(FileCtrl<'a>),
}

impl<'a> StreamCtrl<'a> {
    pub(crate) fn protocol(&self) -> Protocol {
        match self {
            Self::Socket(s) => s.protocol,
            Self::Mqtt(_) => Protocol::Mqtt,
            Self::Http(_) => Protocol::Http,
            Self::File(_) => Protocol::File,
        }
    }

    /// The module lost the connection state behind this stream.
    pub(crate) fn mark_closed(&mut self) {
        match self {
            Self::Socket(s) => s.mark_closed(),
            Self::Mqtt(m) => m.mark_closed(),
            Self::Http(h) => h.mark_closed(),
            Self::File(f) => f.mark_closed(),
        }
    }
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Validate the buffer and the context, then give the interrupt its
    /// pages.
    pub(crate) fn register_stream(
        &mut self,
        ctx: u8,
        buffer: &'a mut [u8],
        ctrl: StreamCtrl<'a>,
    ) -> Result<(), Error> {
        let slot = self.streams.get(ctx as usize).ok_or(Error::BadRequest)?;
        if slot.is_some() {
            return Err(Error::Conflict);
        }
        let pages = RxPages::new(split_pages(buffer)?);
        self.iop.with_rx(|rx| rx.register(ctx, pages))?;
        debug!("stream {} registered as {:?}", ctx, ctrl.protocol());
        self.streams[ctx as usize] = Some(ctrl);
        Ok(())
    }

    /// Free the slot of `ctx`. Its buffer is no longer written.
    pub(crate) fn release_stream(&mut self, ctx: u8) {
        self.iop.with_rx(|rx| rx.unregister(ctx));
        if let Some(slot) = self.streams.get_mut(ctx as usize) {
            *slot = None;
        }
    }

    pub(crate) fn stream(&self, ctx: u8) -> Option<&StreamCtrl<'a>> {
        self.streams.get(ctx as usize).and_then(Option::as_ref)
    }

    pub(crate) fn stream_mut(&mut self, ctx: u8) -> Option<&mut StreamCtrl<'a>> {
        self.streams.get_mut(ctx as usize).and_then(Option::as_mut)
    }

    /// A receive page of `ctx` ran out of room since the stream was last
    /// reset.
    pub fn stream_overflow(&self, ctx: u8) -> bool {
        self.iop
            .with_rx(|rx| rx.pages(ctx).map_or(false, RxPages::overflow))
    }

    /// Discard everything buffered for `ctx` and clear its overflow flag.
    pub(crate) fn reset_stream_pages(&self, ctx: u8) {
        self.iop.with_rx(|rx| {
            if let Some(pages) = rx.pages_mut(ctx) {
                pages.clear();
            }
        });
    }

    /// Hand the pages of `ctx` to `f` until none is left. With
    /// `pull_partial` the page still being filled is taken as well.
    pub(crate) fn pull_pages(
        &self,
        ctx: u8,
        pull_partial: bool,
        mut f: impl FnMut(&[u8]),
    ) -> usize {
        let mut delivered = 0;
        while let Some(page) = self.iop.with_rx(|rx| rx.take_page(ctx, pull_partial)) {
            let data = page.unread();
            if !data.is_empty() {
                trace!("stream {}: {} bytes from page {}", ctx, data.len(), page.index());
                delivered += data.len();
                f(data);
            }
            self.iop.with_rx(|rx| rx.give_back(ctx, page));
        }
        delivered
    }

    /// Whether the armed transfer of `ctx` went quiet for the idle window.
    pub(crate) fn stream_idle(&self, ctx: u8) -> bool {
        let now = self.now();
        let window = self.config.rx_idle_pull;
        self.iop.with_rx(|rx| {
            rx.pages(ctx)
                .map_or(false, |p| p.pending() > 0 && p.idle_ms(now) >= window)
        })
    }

    pub(crate) fn dispatch_streams(&mut self) {
        self.service_ird();
        for ctx in 0..STREAM_SLOTS as u8 {
            match self.stream(ctx) {
                Some(StreamCtrl::Mqtt(_)) => self.dispatch_mqtt(ctx),
                Some(StreamCtrl::Http(_) | StreamCtrl::File(_)) => self.dispatch_bulk(ctx),
                _ => {}
            }
        }
    }

    /// HTTP and file reads: full pages any time, the rest once the transfer
    /// ended or stalled.
    fn dispatch_bulk(&mut self, ctx: u8) {
        let armed = self.iop.with_rx(|rx| rx.armed_ctx()) == Some(ctx);
        let pull = !armed || self.stream_idle(ctx);
        let receiver = match self.stream(ctx) {
            Some(StreamCtrl::Http(h)) => h.receiver,
            Some(StreamCtrl::File(f)) => f.receiver,
            _ => return,
        };
        let n = self.pull_pages(ctx, pull, |data| receiver(ctx, data));
        if n > 0 {
            match self.stream_mut(ctx) {
                Some(StreamCtrl::Http(h)) => h.received += n,
                Some(StreamCtrl::File(f)) => f.received += n,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::atcmd::test::ready;
    use crate::mock::Emulator;
    use crate::Iop;

    #[test]
    fn registration_is_validated() {
        let emu = Emulator::new();
        let mut small = [0u8; 128];
        let mut odd = [0u8; 300];
        let mut a = [0u8; 256];
        let mut b = [0u8; 256];
        let mut c = [0u8; 256];
        let receiver = |_: u8, _: &[u8]| {};
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        assert_eq!(
            modem.socket_init(0, Protocol::Tcp, &mut small, &receiver).err(),
            Some(Error::BadRequest)
        );
        assert_eq!(
            modem.socket_init(0, Protocol::Tcp, &mut odd, &receiver).err(),
            Some(Error::BadRequest)
        );
        assert_eq!(
            modem.socket_init(DATA_CONTEXTS, Protocol::Tcp, &mut c, &receiver).err(),
            Some(Error::BadRequest)
        );
        assert!(modem.socket_init(2, Protocol::Tcp, &mut a, &receiver).is_ok());
        assert_eq!(
            modem.socket_init(2, Protocol::Udp, &mut b, &receiver).err(),
            Some(Error::Conflict)
        );
        assert_eq!(modem.stream(2).map(StreamCtrl::protocol), Some(Protocol::Tcp));
    }

    #[test]
    fn bulk_stream_delivers_after_transfer() {
        let emu = Emulator::new();
        let mut buf = [0u8; 512];
        let got = core::cell::RefCell::new(std::vec::Vec::new());
        let receiver = |ctx: u8, data: &[u8]| {
            assert_eq!(ctx, FILE_CTX);
            got.borrow_mut().extend_from_slice(data);
        };
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        modem.file_init(&mut buf, &receiver).unwrap();

        let payload: std::vec::Vec<u8> = (0..600u32).map(|i| b'a' + (i % 26) as u8).collect();
        let mut reply = b"\r\nCONNECT 600\r\n".to_vec();
        reply.extend_from_slice(&payload);
        reply.extend_from_slice(b"\r\nOK\r\n");
        emu.respond(b"AT+QFREAD=3,600\r", &reply);

        assert_eq!(modem.file_read(3, 600), Ok(600));
        assert_eq!(got.borrow().as_slice(), payload.as_slice());
        assert!(!modem.stream_overflow(FILE_CTX));
    }
}
