//! MQTT client on the module's MQTT stack.
//!
//! Incoming publishes arrive as `+QMTRECV: <ctx>,<msg_id>,"<topic>","<payload>"`.
//! The interrupt moves each of them into the session's receive pages; this
//! module splits the pages back into messages and matches them against the
//! subscription table.

use heapless::{String, Vec};
use nom::{
    bytes::complete::{tag, take_until},
    character::complete::{char, u16 as dec_u16, u32 as dec_u32, u8 as dec_u8},
    combinator::opt,
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};

use crate::atcmd::{Options, ParserKind, Standard, DATA_PROMPT};
use crate::helpers::SliceExt;
use crate::iop::MQTT_TRAILER;
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::urc::MQTT_RECV_PREFIX;
use crate::Error;

use super::{StreamCtrl, DATA_CONTEXTS};

pub const MAX_SUBSCRIPTIONS: usize = 4;
pub const TOPIC_SIZE: usize = 96;
/// Largest payload `AT+QMTPUB` accepts.
pub const PUBLISH_MAX: usize = 1548;

const OPEN_TIMEOUT_MS: u32 = 45_000;
const CONNECT_TIMEOUT_MS: u32 = 60_000;
const SUBSCRIBE_TIMEOUT_MS: u32 = 30_000;
const CLOSE_TIMEOUT_MS: u32 = 10_000;

const OPEN_RESULT: Standard = Standard::new("+QMTOPEN: ", "\r\n").tokens(2).value(1);
const CONNECT_RESULT: Standard = Standard::new("+QMTCONN: ", "\r\n").tokens(3).value(2);
const SUBSCRIBE_RESULT: Standard = Standard::new("+QMTSUB: ", "\r\n").tokens(3).value(2);
const UNSUBSCRIBE_RESULT: Standard = Standard::new("+QMTUNS: ", "\r\n").tokens(3).value(2);
const PUBLISH_RESULT: Standard = Standard::new("+QMTPUB: ", "\r\n").tokens(3).value(2);
const DISCONNECT_RESULT: Standard = Standard::new("+QMTDISC: ", "\r\n").tokens(2).value(1);
const CLOSE_RESULT: Standard = Standard::new("+QMTCLOSE: ", "\r\n").tokens(2).value(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttState {
    Closed,
    /// Network connection to the broker up
    Open,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// A message received on a subscribed topic.
///
/// Without the length field in `+QMTRECV` a message ends at the first `"\r\n`,
/// so a payload carrying that sequence arrives truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqttMessage<'m> {
    pub ctx: u8,
    pub msg_id: u16,
    /// Subscribed topic; for a `#` subscription the part before the wildcard
    pub topic: &'m str,
    /// Topic levels matched by a trailing `#`, empty otherwise
    pub topic_vars: &'m str,
    pub payload: &'m [u8],
}

pub type MqttReceiver<'a> = &'a dyn Fn(&MqttMessage<'_>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mqtt {
    ctx: u8,
}

impl Mqtt {
    pub fn ctx(&self) -> u8 {
        self.ctx
    }
}

pub(crate) struct MqttCtrl<'a> {
    pub(crate) state: MqttState,
    receiver: MqttReceiver<'a>,
    subscriptions: Vec<String<TOPIC_SIZE>, MAX_SUBSCRIPTIONS>,
    last_msg_id: u16,
}

impl<'a> MqttCtrl<'a> {
    pub(crate) fn mark_closed(&mut self) {
        self.state = MqttState::Closed;
    }

    fn next_msg_id(&mut self) -> u16 {
        // 0 is reserved for QoS 0 publishes
        self.last_msg_id = self.last_msg_id.checked_add(1).unwrap_or(1);
        self.last_msg_id
    }

    /// Split `topic` into the matched subscription and the wildcard levels.
    fn matches<'t>(&self, topic: &'t str) -> Option<(&'t str, &'t str)> {
        self.subscriptions.iter().find_map(|sub| match sub.strip_suffix('#') {
            Some(prefix) => topic.strip_prefix(prefix).map(|vars| {
                let base = &topic[..prefix.len()];
                (base.strip_suffix('/').unwrap_or(base), vars)
            }),
            None => (sub.as_str() == topic).then_some((topic, "")),
        })
    }
}

struct Raw<'m> {
    ctx: u8,
    msg_id: u16,
    topic: &'m [u8],
    payload: &'m [u8],
}

/// One `+QMTRECV` message, optionally with the payload length some firmware
/// inserts before the payload.
fn message(input: &[u8]) -> IResult<&[u8], Raw<'_>> {
    let (rest, (ctx, msg_id, topic, _, payload)) = tuple((
        preceded(tag(MQTT_RECV_PREFIX), dec_u8),
        preceded(char(','), dec_u16),
        preceded(char(','), delimited(char('"'), take_until("\""), char('"'))),
        preceded(char(','), opt(terminated(dec_u32, char(',')))),
        terminated(preceded(char('"'), take_until(MQTT_TRAILER)), tag(MQTT_TRAILER)),
    ))(input)?;
    Ok((
        rest,
        Raw {
            ctx,
            msg_id,
            topic,
            payload,
        },
    ))
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Claim context `ctx` for an MQTT session.
    pub fn mqtt_init(
        &mut self,
        ctx: u8,
        buffer: &'a mut [u8],
        receiver: MqttReceiver<'a>,
    ) -> Result<Mqtt, Error> {
        if ctx >= DATA_CONTEXTS {
            return Err(Error::BadRequest);
        }
        let ctrl = MqttCtrl {
            state: MqttState::Closed,
            receiver,
            subscriptions: Vec::new(),
            last_msg_id: 0,
        };
        self.register_stream(ctx, buffer, StreamCtrl::Mqtt(ctrl))?;
        Ok(Mqtt { ctx })
    }

    fn mqtt_ctrl(&mut self, m: Mqtt) -> Result<&mut MqttCtrl<'a>, Error> {
        match self.stream_mut(m.ctx) {
            Some(StreamCtrl::Mqtt(c)) => Ok(c),
            _ => Err(Error::PreconditionFailed),
        }
    }

    pub fn mqtt_state(&mut self, m: Mqtt) -> Result<MqttState, Error> {
        Ok(self.mqtt_ctrl(m)?.state)
    }

    /// Open the network connection to the broker. With `ssl` the session uses
    /// the TLS context of the same number, see [`Modem::tls_configure`].
    pub fn mqtt_open(&mut self, m: Mqtt, host: &str, port: u16, ssl: bool) -> Result<(), Error> {
        let ctx = m.ctx;
        if self.mqtt_ctrl(m)?.state != MqttState::Closed {
            return Ok(());
        }
        if ssl {
            self.invoke(format_args!("AT+QMTCFG=\"ssl\",{},1,{}", ctx, ctx), Options::default())?;
        }
        // MQTT 3.1.1
        self.invoke(format_args!("AT+QMTCFG=\"version\",{},4", ctx), Options::default())?;
        self.invoke(
            format_args!("AT+QMTOPEN={},\"{}\",{}", ctx, host, port),
            Options::new(ParserKind::Standard(OPEN_RESULT)).timeout(OPEN_TIMEOUT_MS),
        )?;

        match self.value() {
            Some(0) => {
                self.mqtt_ctrl(m)?.state = MqttState::Open;
                info!("mqtt {} open", ctx);
                Ok(())
            }
            Some(-1 | 1) => Err(Error::BadRequest),
            Some(2) => Err(Error::Conflict),
            Some(4) => Err(Error::NotFound),
            _ => Err(Error::GatewayTimeout),
        }
    }

    pub fn mqtt_connect(
        &mut self,
        m: Mqtt,
        client_id: &str,
        username: &str,
        password: &str,
        clean_session: bool,
    ) -> Result<(), Error> {
        let ctx = m.ctx;
        match self.mqtt_ctrl(m)?.state {
            MqttState::Connected => return Ok(()),
            MqttState::Closed => return Err(Error::PreconditionFailed),
            MqttState::Open => {}
        }
        self.invoke(
            format_args!("AT+QMTCFG=\"session\",{},{}", ctx, u8::from(clean_session)),
            Options::default(),
        )?;
        self.invoke(
            format_args!("AT+QMTCONN={},\"{}\",\"{}\",\"{}\"", ctx, client_id, username, password),
            Options::new(ParserKind::Standard(CONNECT_RESULT)).timeout(CONNECT_TIMEOUT_MS),
        )?;

        match self.value() {
            Some(0) => {
                self.mqtt_ctrl(m)?.state = MqttState::Connected;
                info!("mqtt {} connected", ctx);
                Ok(())
            }
            // unacceptable protocol version
            Some(1) => Err(Error::ModuleError),
            Some(2 | 4 | 5) => Err(Error::Unauthorized),
            Some(3) => Err(Error::Unavailable),
            _ => Err(Error::Internal),
        }
    }

    /// Subscribe to `topic`. A trailing `#` delivers the matched levels
    /// separately as [`MqttMessage::topic_vars`].
    pub fn mqtt_subscribe(&mut self, m: Mqtt, topic: &str, qos: Qos) -> Result<(), Error> {
        let ctx = m.ctx;
        let ctrl = self.mqtt_ctrl(m)?;
        if ctrl.state != MqttState::Connected {
            return Err(Error::PreconditionFailed);
        }
        if ctrl.subscriptions.iter().any(|s| s.as_str() == topic) {
            return Ok(());
        }
        let mut entry = String::new();
        entry.push_str(topic).map_err(|_| Error::BadRequest)?;
        ctrl.subscriptions.push(entry).map_err(|_| Error::Conflict)?;
        let msg_id = ctrl.next_msg_id();

        let res = self.invoke(
            format_args!("AT+QMTSUB={},{},\"{}\",{}", ctx, msg_id, topic, qos as u8),
            Options::new(ParserKind::Standard(SUBSCRIBE_RESULT)).timeout(SUBSCRIBE_TIMEOUT_MS),
        );
        let res = match (res, self.value()) {
            (Ok(()), Some(2)) => Err(Error::Unavailable),
            (res, _) => res,
        };
        if res.is_err() {
            self.mqtt_ctrl(m)?.subscriptions.retain(|s| s.as_str() != topic);
        }
        res
    }

    pub fn mqtt_unsubscribe(&mut self, m: Mqtt, topic: &str) -> Result<(), Error> {
        let ctx = m.ctx;
        let ctrl = self.mqtt_ctrl(m)?;
        if ctrl.state != MqttState::Connected {
            return Err(Error::PreconditionFailed);
        }
        ctrl.subscriptions.retain(|s| s.as_str() != topic);
        let msg_id = ctrl.next_msg_id();
        self.invoke(
            format_args!("AT+QMTUNS={},{},\"{}\"", ctx, msg_id, topic),
            Options::new(ParserKind::Standard(UNSUBSCRIBE_RESULT)).timeout(SUBSCRIBE_TIMEOUT_MS),
        )
    }

    pub fn mqtt_publish(
        &mut self,
        m: Mqtt,
        topic: &str,
        qos: Qos,
        payload: &[u8],
    ) -> Result<(), Error> {
        let ctx = m.ctx;
        if payload.len() > PUBLISH_MAX {
            return Err(Error::BadRequest);
        }
        let ctrl = self.mqtt_ctrl(m)?;
        if ctrl.state != MqttState::Connected {
            return Err(Error::PreconditionFailed);
        }
        let msg_id = if qos == Qos::AtMostOnce { 0 } else { ctrl.next_msg_id() };

        let finish = Options::new(ParserKind::Standard(PUBLISH_RESULT))
            .timeout(self.config.mqtt_publish_timeout);
        self.invoke_with_payload(
            format_args!(
                "AT+QMTPUB={},{},{},0,\"{}\",{}",
                ctx,
                msg_id,
                qos as u8,
                topic,
                payload.len()
            ),
            DATA_PROMPT,
            payload,
            finish,
        )?;
        match self.value() {
            Some(2) => Err(Error::Unavailable),
            _ => Ok(()),
        }
    }

    /// Disconnect, close the broker connection and free the context. Closing
    /// a released session is a no-op.
    pub fn mqtt_close(&mut self, m: Mqtt) -> Result<(), Error> {
        let ctx = m.ctx;
        let state = match self.stream(ctx) {
            Some(StreamCtrl::Mqtt(c)) => c.state,
            Some(_) => return Err(Error::PreconditionFailed),
            None => return Ok(()),
        };
        // the disconnect confirmation doubles as a URC, not ours to report
        self.mqtt_ctrl(m)?.state = MqttState::Closed;

        let mut res = Ok(());
        if state == MqttState::Connected {
            res = self.invoke(
                format_args!("AT+QMTDISC={}", ctx),
                Options::new(ParserKind::Standard(DISCONNECT_RESULT)).timeout(CLOSE_TIMEOUT_MS),
            );
        }
        if state == MqttState::Open || res.is_err() {
            res = self.invoke(
                format_args!("AT+QMTCLOSE={}", ctx),
                Options::new(ParserKind::Standard(CLOSE_RESULT)).timeout(CLOSE_TIMEOUT_MS),
            );
        }
        self.release_stream(ctx);
        res
    }

    /// Ask the module for the session state and update the cached one.
    pub fn mqtt_status(&mut self, m: Mqtt) -> Result<MqttState, Error> {
        let ctx = m.ctx;
        self.mqtt_ctrl(m)?;
        self.invoke(format_args!("AT+QMTCONN?"), Options::default())?;

        let mut state = MqttState::Closed;
        for line in self.response_lines() {
            let Some(fields) = line.strip_prefix(b"+QMTCONN: ") else {
                continue;
            };
            let mut ints = fields.split(|&c| c == b',').map(crate::helpers::parse_int);
            if ints.next().flatten() != Some(i32::from(ctx)) {
                continue;
            }
            state = match ints.next().flatten() {
                Some(1 | 2) => MqttState::Open,
                Some(3) => MqttState::Connected,
                _ => MqttState::Closed,
            };
        }
        self.mqtt_ctrl(m)?.state = state;
        Ok(state)
    }

    /// `true` when the session was open and is now closed.
    pub(crate) fn on_mqtt_closed(&mut self, ctx: u8) -> bool {
        match self.stream_mut(ctx) {
            Some(StreamCtrl::Mqtt(c)) if c.state != MqttState::Closed => {
                c.mark_closed();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn dispatch_mqtt(&mut self, ctx: u8) {
        let armed = self.iop.with_rx(|rx| rx.armed_ctx()) == Some(ctx);
        if armed {
            let now = self.now();
            let timeout = self.config.ird_timeout;
            let stalled = self
                .iop
                .with_rx(|rx| rx.pages(ctx).map_or(false, |p| p.idle_ms(now) > timeout));
            if stalled {
                warn!("mqtt {}: message never terminated, dropping it", ctx);
                self.iop.with_rx(|rx| rx.disarm());
                self.reset_stream_pages(ctx);
                return;
            }
        }

        let Some(StreamCtrl::Mqtt(ctrl)) = self.stream(ctx) else {
            return;
        };
        // while armed only pages holding complete messages are taken
        self.pull_pages(ctx, !armed, |data| {
            let mut rest = data.trim_start(b"\r\n");
            while !rest.is_empty() {
                match message(rest) {
                    Ok((next, raw)) => {
                        deliver(ctrl, &raw);
                        rest = next.trim_start(b"\r\n");
                    }
                    Err(_) => {
                        warn!("mqtt {}: malformed message dropped", ctx);
                        break;
                    }
                }
            }
        });
    }
}

fn deliver(ctrl: &MqttCtrl<'_>, raw: &Raw<'_>) {
    let Ok(topic) = core::str::from_utf8(raw.topic) else {
        warn!("mqtt topic is not utf-8");
        return;
    };
    let Some((topic, topic_vars)) = ctrl.matches(topic) else {
        debug!("mqtt message on unsubscribed topic {}", topic);
        return;
    };
    (ctrl.receiver)(&MqttMessage {
        ctx: raw.ctx,
        msg_id: raw.msg_id,
        topic,
        topic_vars,
        payload: raw.payload,
    });
}
