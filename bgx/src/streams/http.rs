//! HTTP(S) client on the module's HTTP stack.
//!
//! A request pushes the URL, issues the GET or POST and reports the status
//! line; the body is fetched separately with [`Modem::http_read`] and
//! streamed to the receiver through the HTTP context.

use crate::atcmd::{Options, ParserKind, Standard, CONNECT_PROMPT};
use crate::iop::{Expect, HTTP_TRAILER};
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

use super::{DataReceiver, StreamCtrl, HTTP_CTX};

/// Longest URL `AT+QHTTPURL` accepts.
pub const URL_MAX: usize = 700;
/// Seconds the module waits for URL and POST body input.
const INPUT_TIMEOUT_SECS: u32 = 5;
/// Margin over the module side timeout.
const RESULT_MARGIN_MS: u32 = 5_000;

const GET_RESULT: Standard = Standard::new("+QHTTPGET: ", "\r\n").tokens(1).value(0);
const POST_RESULT: Standard = Standard::new("+QHTTPPOST: ", "\r\n").tokens(1).value(0);
const READ_RESULT: Standard = Standard::new("+QHTTPREAD: ", "\r\n").tokens(1).value(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HttpOptions {
    /// TLS context used for `https://` URLs
    pub tls_ctx: Option<u8>,
    /// The POST body carries its own request header
    pub request_header: bool,
    /// Deliver the response header ahead of the body
    pub response_header: bool,
}

/// Status line of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HttpResponse {
    pub status: u16,
    /// `None` for chunked responses
    pub content_length: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Response waiting to be read
    Responded,
}

pub(crate) struct HttpCtrl<'a> {
    pub(crate) receiver: DataReceiver<'a>,
    pub(crate) received: usize,
    options: HttpOptions,
    configured: bool,
    phase: Phase,
}

impl<'a> HttpCtrl<'a> {
    pub(crate) fn mark_closed(&mut self) {
        self.phase = Phase::Idle;
        self.received = 0;
        // module side settings are lost with the module state
        self.configured = false;
    }
}

/// `+QHTTPGET`/`+QHTTPPOST`/`+QHTTPREAD` error codes.
fn map_http_error(code: i32) -> Error {
    match code {
        702 | 728 => Error::GatewayTimeout,
        703 | 704 => Error::Conflict,
        711 | 712 | 713 | 714 | 715 | 716 | 717 => Error::Unavailable,
        719 | 720 => Error::BadRequest,
        _ => Error::ModuleError,
    }
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Claim the HTTP context. Response bodies go to `receiver`.
    pub fn http_init(
        &mut self,
        buffer: &'a mut [u8],
        receiver: DataReceiver<'a>,
    ) -> Result<(), Error> {
        let ctrl = HttpCtrl {
            receiver,
            received: 0,
            options: HttpOptions::default(),
            configured: false,
            phase: Phase::Idle,
        };
        self.register_stream(HTTP_CTX, buffer, StreamCtrl::Http(ctrl))
    }

    fn http_ctrl(&mut self) -> Result<&mut HttpCtrl<'a>, Error> {
        match self.stream_mut(HTTP_CTX) {
            Some(StreamCtrl::Http(h)) => Ok(h),
            _ => Err(Error::PreconditionFailed),
        }
    }

    /// Store new request options; they are sent with the next request.
    pub fn http_configure(&mut self, options: HttpOptions) -> Result<(), Error> {
        let ctrl = self.http_ctrl()?;
        ctrl.options = options;
        ctrl.configured = false;
        Ok(())
    }

    fn http_apply_config(&mut self) -> Result<(), Error> {
        let ctrl = self.http_ctrl()?;
        if ctrl.configured {
            return Ok(());
        }
        let options = ctrl.options;
        let pdp = self.config.data_context;

        self.invoke(format_args!("AT+QHTTPCFG=\"contextid\",{}", pdp), Options::default())?;
        self.invoke(
            format_args!("AT+QHTTPCFG=\"responseheader\",{}", u8::from(options.response_header)),
            Options::default(),
        )?;
        self.invoke(
            format_args!("AT+QHTTPCFG=\"requestheader\",{}", u8::from(options.request_header)),
            Options::default(),
        )?;
        if let Some(tls) = options.tls_ctx {
            self.invoke(format_args!("AT+QHTTPCFG=\"sslctxid\",{}", tls), Options::default())?;
        }
        self.http_ctrl()?.configured = true;
        Ok(())
    }

    fn http_set_url(&mut self, url: &str) -> Result<(), Error> {
        if url.is_empty() || url.len() > URL_MAX {
            return Err(Error::BadRequest);
        }
        let https = url.len() >= 8 && url.as_bytes()[..8].eq_ignore_ascii_case(b"https://");
        if https && self.http_ctrl()?.options.tls_ctx.is_none() {
            return Err(Error::PreconditionFailed);
        }
        self.http_ctrl()?.phase = Phase::Idle;
        self.http_apply_config()?;
        self.invoke_with_payload(
            format_args!("AT+QHTTPURL={},{}", url.len(), INPUT_TIMEOUT_SECS),
            CONNECT_PROMPT,
            url.as_bytes(),
            Options::default().timeout(INPUT_TIMEOUT_SECS * 1000 + RESULT_MARGIN_MS),
        )
    }

    fn http_request_timeout(&self) -> u32 {
        u32::from(self.config.http_timeout_secs) * 1000 + RESULT_MARGIN_MS
    }

    /// Status line out of `+QHTTPGET: <err>,<status>[,<length>]`.
    fn http_status(&mut self, preamble: &str) -> Result<HttpResponse, Error> {
        let ints = self.response_ints::<3>(preamble);
        let err = ints.first().copied().flatten().ok_or(Error::NotFound)?;
        if err != 0 {
            warn!("http request failed: {}", err);
            return Err(map_http_error(err));
        }
        let status = ints.get(1).copied().flatten().ok_or(Error::NotFound)?;
        let response = HttpResponse {
            status: u16::try_from(status).map_err(|_| Error::Internal)?,
            content_length: ints.get(2).copied().flatten().and_then(|n| u32::try_from(n).ok()),
        };
        debug!("http status {}", response.status);
        self.http_ctrl()?.phase = Phase::Responded;
        Ok(response)
    }

    pub fn http_get(&mut self, url: &str) -> Result<HttpResponse, Error> {
        self.http_set_url(url)?;
        let timeout = self.http_request_timeout();
        let secs = self.config.http_timeout_secs;
        self.invoke(
            format_args!("AT+QHTTPGET={}", secs),
            Options::new(ParserKind::Standard(GET_RESULT)).timeout(timeout),
        )?;
        self.http_status("+QHTTPGET: ")
    }

    /// GET with a caller built request header, `\r\n\r\n` terminated. Needs
    /// [`HttpOptions::request_header`].
    pub fn http_get_with_header(
        &mut self,
        url: &str,
        header: &[u8],
    ) -> Result<HttpResponse, Error> {
        if !self.http_ctrl()?.options.request_header {
            return Err(Error::PreconditionFailed);
        }
        if header.is_empty() {
            return Err(Error::BadRequest);
        }
        self.http_set_url(url)?;
        let timeout = self.http_request_timeout();
        let secs = self.config.http_timeout_secs;
        self.invoke_with_payload(
            format_args!("AT+QHTTPGET={},{}", secs, header.len()),
            CONNECT_PROMPT,
            header,
            Options::new(ParserKind::Standard(GET_RESULT)).timeout(timeout),
        )?;
        self.http_status("+QHTTPGET: ")
    }

    /// POST `body` to `url`. With [`HttpOptions::request_header`] the body
    /// starts with the complete request header.
    pub fn http_post(&mut self, url: &str, body: &[u8]) -> Result<HttpResponse, Error> {
        self.http_set_url(url)?;
        let timeout = self.http_request_timeout();
        let secs = self.config.http_timeout_secs;
        self.invoke_with_payload(
            format_args!("AT+QHTTPPOST={},{},{}", body.len(), INPUT_TIMEOUT_SECS, secs),
            CONNECT_PROMPT,
            body,
            Options::new(ParserKind::Standard(POST_RESULT)).timeout(timeout),
        )?;
        self.http_status("+QHTTPPOST: ")
    }

    /// Stream the response body of the last request to the receiver. Returns
    /// the body size.
    pub fn http_read(&mut self) -> Result<usize, Error> {
        let ctrl = self.http_ctrl()?;
        if ctrl.phase != Phase::Responded {
            return Err(Error::PreconditionFailed);
        }
        ctrl.received = 0;

        let expect = Expect::Connect {
            ctx: HTTP_CTX,
            trailer: HTTP_TRAILER,
        };
        let timeout = self.http_request_timeout();
        let secs = self.config.http_timeout_secs;
        let res = self.invoke_expecting(
            format_args!("AT+QHTTPREAD={}", secs),
            expect,
            Options::new(ParserKind::Standard(READ_RESULT)).timeout(timeout),
        );
        self.iop.with_rx(|rx| {
            rx.take_completed(HTTP_CTX);
            rx.take_announced(HTTP_CTX)
        });
        let received = self.finish_bulk(HTTP_CTX);
        self.http_ctrl()?.phase = Phase::Idle;
        res?;

        match self.value() {
            Some(0) => Ok(received),
            Some(code) => Err(map_http_error(code)),
            None => Err(Error::NotFound),
        }
    }
}
