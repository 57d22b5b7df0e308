//! Recognition of unsolicited result codes and bulk-transfer header lines.
//!
//! All parsers work on a single line with the line terminator removed.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, space0, u8 as dec_u8},
    combinator::{all_consuming, map, map_res, opt, rest},
    sequence::{delimited, preceded, separated_pair, terminated, tuple},
    IResult,
};

/// Unsolicited events handed from the interrupt to the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UrcEvent {
    SocketClosed(u8),
    PdpDeactivated(u8),
    /// `+QMTSTAT: <ctx>,<err>`
    MqttClosed { ctx: u8, err: u8 },
    /// `+QMTDISC: <ctx>,<result>`
    MqttDisconnected(u8),
    AppReady,
    /// A receive page filled while no free page was left
    Overflow(u8),
}

/// Classified URC line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Urc {
    RecvPending(u8),
    SocketClosed(u8),
    PdpDeactivated(u8),
    MqttStatus(u8, u8),
    MqttDisconnect(u8),
    AppReady,
}

impl Urc {
    /// Whether the line is removed from the command buffer. `+QMTDISC` is
    /// also the final response of `AT+QMTDISC` and stays visible.
    pub(crate) fn strip(&self) -> bool {
        !matches!(self, Urc::MqttDisconnect(_))
    }
}

pub const MQTT_RECV_PREFIX: &[u8] = b"+QMTRECV: ";
pub const IRD_PREFIX: &[u8] = b"+QIRD: ";
pub const SSL_RECV_PREFIX: &[u8] = b"+QSSLRECV: ";

fn socket_urc(input: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((tag("+QIURC: "), tag("+QSSLURC: ")))(input)
}

fn quoted_event<'a>(name: &'static str) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], u8> {
    preceded(
        tuple((socket_urc, char('"'), tag(name), tag("\","))),
        dec_u8,
    )
}

fn urc(input: &[u8]) -> IResult<&[u8], Urc> {
    alt((
        map(quoted_event("recv"), Urc::RecvPending),
        map(quoted_event("closed"), Urc::SocketClosed),
        map(
            preceded(tag("+QIURC: \"pdpdeact\","), dec_u8),
            Urc::PdpDeactivated,
        ),
        map(
            preceded(
                tag("+QMTSTAT: "),
                separated_pair(dec_u8, char(','), dec_u8),
            ),
            |(ctx, err)| Urc::MqttStatus(ctx, err),
        ),
        map(
            preceded(tag("+QMTDISC: "), terminated(dec_u8, rest)),
            Urc::MqttDisconnect,
        ),
        map(tag("APP RDY"), |_| Urc::AppReady),
    ))(input)
}

/// Classify a complete line.
pub(crate) fn classify(line: &[u8]) -> Option<Urc> {
    urc(line).ok().map(|(_, u)| u)
}

fn length(input: &[u8]) -> IResult<&[u8], usize> {
    map_res(digit1, |d: &[u8]| {
        core::str::from_utf8(d)
            .map_err(|_| ())
            .and_then(|s| s.parse::<usize>().map_err(|_| ()))
    })(input)
}

/// `+QIRD: <n>` (or the TLS variant) announcing `n` data bytes.
pub(crate) fn ird_header(line: &[u8], prefix: &[u8]) -> Option<usize> {
    let parsed: IResult<&[u8], usize> =
        preceded(tag(prefix), terminated(length, opt(preceded(char(','), rest))))(line);
    parsed.ok().map(|(_, n)| n)
}

/// `CONNECT` or `CONNECT <n>`. The outer `Option` tells whether the line is a
/// CONNECT line at all.
pub(crate) fn connect_header(line: &[u8]) -> Option<Option<usize>> {
    let parsed: IResult<&[u8], Option<usize>> = all_consuming(preceded(
        tag("CONNECT"),
        opt(preceded(space0, length)),
    ))(line);
    parsed.ok().map(|(_, n)| n)
}

/// Context of a `+QMTRECV: <ctx>,` prefix, once the comma has arrived.
pub(crate) fn mqtt_recv_ctx(partial: &[u8]) -> Option<u8> {
    let parsed: IResult<&[u8], u8> =
        delimited(tag(MQTT_RECV_PREFIX), dec_u8, char(','))(partial);
    parsed.ok().map(|(_, ctx)| ctx)
}
