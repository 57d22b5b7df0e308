//! Response parsers run over the captured response of the command in flight.

use core::ops::BitOr;

use crate::helpers::{parse_int, SliceExt};

/// Outcome bits reported by a parser.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseResult(u8);

impl ParseResult {
    pub const PENDING: Self = Self(0);
    pub const PREAMBLE_MISSING: Self = Self(0x01);
    pub const COUNT_SHORT: Self = Self(0x02);
    pub const MODULE_ERROR: Self = Self(0x04);
    pub const EXCESS_RECV: Self = Self(0x20);
    pub const SUCCESS: Self = Self(0x40);
    pub const ERROR: Self = Self(0x80);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_pending(self) -> bool {
        self.0 & (Self::SUCCESS.0 | Self::ERROR.0) == 0
    }

    pub const fn is_success(self) -> bool {
        self.contains(Self::SUCCESS)
    }

    pub const fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }
}

impl BitOr for ParseResult {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::fmt::Debug for ParseResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ParseResult({:#04x})", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ParseResult {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "ParseResult({=u8:#x})", self.0)
    }
}

/// Response tag, token and terminator layout of a command's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Standard {
    pub preamble: &'static str,
    /// Without a preamble the reply still succeeds once `finale` arrives
    pub required: bool,
    pub delimiters: &'static str,
    pub tokens_required: u8,
    /// Token converted into the command's integer value
    pub value_token: Option<u8>,
    pub finale: &'static str,
    pub min_len: u16,
}

impl Standard {
    pub const fn new(preamble: &'static str, finale: &'static str) -> Self {
        Self {
            preamble,
            required: true,
            delimiters: ",",
            tokens_required: 0,
            value_token: None,
            finale,
            min_len: 0,
        }
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub const fn delimiters(mut self, delimiters: &'static str) -> Self {
        self.delimiters = delimiters;
        self
    }

    #[must_use]
    pub const fn tokens(mut self, required: u8) -> Self {
        self.tokens_required = required;
        self
    }

    #[must_use]
    pub const fn value(mut self, token: u8) -> Self {
        self.value_token = Some(token);
        self
    }

    #[must_use]
    pub const fn min_len(mut self, len: u16) -> Self {
        self.min_len = len;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParserKind {
    /// Completes on `OK\r\n`
    Ok,
    /// Completes once the prompt text shows up, e.g. `"> "` or `"CONNECT\r\n"`
    Prompt(&'static str),
    Standard(Standard),
}

impl Default for ParserKind {
    fn default() -> Self {
        Self::Ok
    }
}

pub const DATA_PROMPT: &str = "> ";
pub const CONNECT_PROMPT: &str = "CONNECT\r\n";

const OK_FINALE: &[u8] = b"OK\r\n";
const CME_ERROR: &[u8] = b"+CME ERROR: ";
const CMS_ERROR: &[u8] = b"+CMS ERROR: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outcome<'r> {
    pub result: ParseResult,
    pub value: Option<i32>,
    /// Text following `+CME ERROR:` / `+CMS ERROR:`
    pub detail: &'r [u8],
}

impl<'r> Outcome<'r> {
    const fn pending() -> Self {
        Self::of(ParseResult::PENDING)
    }

    const fn of(result: ParseResult) -> Self {
        Self {
            result,
            value: None,
            detail: &[],
        }
    }
}

/// Whether `line` appears in `buf` as a line of its own.
fn has_line(buf: &[u8], line: &[u8]) -> bool {
    let mut rest = buf;
    while let Some(pos) = rest.find(line) {
        let starts_line = pos == 0 || rest[pos - 1] == b'\n';
        let after = &rest[pos + line.len()..];
        if starts_line && after.starts_with(b"\r") {
            return true;
        }
        rest = &rest[pos + 1..];
    }
    false
}

/// Module error reported in the response, once its line is complete.
fn module_error(buf: &[u8]) -> Option<Outcome<'_>> {
    for tag in [CME_ERROR, CMS_ERROR] {
        if let Some(pos) = buf.find(tag) {
            let text = &buf[pos + tag.len()..];
            let end = text.iter().position(|&c| c == b'\r' || c == b'\n')?;
            return Some(Outcome {
                detail: &text[..end],
                ..Outcome::of(ParseResult::ERROR | ParseResult::MODULE_ERROR)
            });
        }
    }
    if has_line(buf, b"ERROR") {
        return Some(Outcome::of(ParseResult::ERROR | ParseResult::MODULE_ERROR));
    }
    None
}

pub(crate) fn parse<'r>(kind: &ParserKind, buf: &'r [u8]) -> Outcome<'r> {
    if let Some(err) = module_error(buf) {
        return err;
    }
    match kind {
        ParserKind::Ok => {
            if buf.find(OK_FINALE).is_some() {
                Outcome::of(ParseResult::SUCCESS)
            } else {
                Outcome::pending()
            }
        }
        ParserKind::Prompt(prompt) => {
            if buf.find(prompt.as_bytes()).is_some() {
                Outcome::of(ParseResult::SUCCESS)
            } else {
                Outcome::pending()
            }
        }
        ParserKind::Standard(layout) => standard(layout, buf),
    }
}

/// Final result of a reply whose end no longer fits the capture. `captured`
/// is the start of the reply, `tail` its most recent bytes.
pub(crate) fn closing(kind: &ParserKind, captured: &[u8], tail: &[u8]) -> ParseResult {
    if module_error(tail).is_some() {
        return ParseResult::ERROR | ParseResult::MODULE_ERROR;
    }
    let finale = match kind {
        ParserKind::Ok => OK_FINALE,
        ParserKind::Prompt(prompt) => prompt.as_bytes(),
        ParserKind::Standard(layout) => layout.finale.as_bytes(),
    };
    if tail.find(finale).is_none() {
        return ParseResult::PENDING;
    }
    match kind {
        ParserKind::Standard(layout)
            if layout.required && captured.find(layout.preamble.as_bytes()).is_none() =>
        {
            ParseResult::ERROR | ParseResult::PREAMBLE_MISSING
        }
        _ => ParseResult::SUCCESS,
    }
}

fn standard<'r>(p: &Standard, buf: &'r [u8]) -> Outcome<'r> {
    let preamble = p.preamble.as_bytes();
    let finale = p.finale.as_bytes();

    let framing = if p.required {
        preamble.len() + finale.len()
    } else {
        finale.len()
    };
    let needed = usize::from(p.min_len).max(framing);
    if buf.len() < needed {
        return Outcome::pending();
    }

    let body_start = match buf.find(preamble) {
        Some(pos) => pos + preamble.len(),
        // the reply is complete without the tag
        None if buf.find(finale).is_some() => {
            return if p.required {
                Outcome::of(ParseResult::ERROR | ParseResult::PREAMBLE_MISSING)
            } else {
                Outcome::of(ParseResult::SUCCESS)
            };
        }
        None => return Outcome::pending(),
    };

    let Some(body_len) = buf[body_start..].find(finale) else {
        return Outcome::pending();
    };
    let body = &buf[body_start..body_start + body_len];

    let delimiters = p.delimiters.as_bytes();
    let mut count = 0u8;
    let mut value = None;
    for token in body.split(|c| delimiters.contains(c)) {
        if Some(count) == p.value_token {
            value = parse_int(token.trim(b" \r\n"));
        }
        count = count.saturating_add(1);
    }
    if body.trim(b" \r\n").is_empty() {
        count = 0;
    }

    if count < p.tokens_required {
        return Outcome {
            value,
            ..Outcome::of(ParseResult::ERROR | ParseResult::COUNT_SHORT)
        };
    }
    Outcome {
        value,
        ..Outcome::of(ParseResult::SUCCESS)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const QISTATE: Standard = Standard::new("+QISTATE: ", "\r\n").tokens(6).value(5);

    #[test]
    fn ok_parser() {
        assert!(parse(&ParserKind::Ok, b"\r\n").result.is_pending());
        assert!(parse(&ParserKind::Ok, b"\r\nOK\r\n").result.is_success());
    }

    #[test]
    fn module_errors_carry_detail() {
        let out = parse(&ParserKind::Ok, b"\r\n+CME ERROR: 515\r\n");
        assert!(out.result.contains(ParseResult::MODULE_ERROR));
        assert!(out.result.is_error());
        assert_eq!(out.detail, b"515");

        let out = parse(&ParserKind::Ok, b"\r\n+CMS ERROR: 305\r\n");
        assert_eq!(out.detail, b"305");

        // a detail without its line end is not final yet
        assert!(parse(&ParserKind::Ok, b"\r\n+CME ERROR: 51").result.is_pending());

        let out = parse(&ParserKind::Ok, b"\r\nERROR\r\n");
        assert!(out.result.contains(ParseResult::MODULE_ERROR));
        assert!(out.detail.is_empty());
        assert!(parse(&ParserKind::Ok, b"\r\n+QFLST: \"ERROR.txt\",4\r\n").result.is_pending());
    }

    #[test]
    fn prompts() {
        let prompt = ParserKind::Prompt(DATA_PROMPT);
        assert!(parse(&prompt, b"\r\n").result.is_pending());
        assert!(parse(&prompt, b"\r\n> ").result.is_success());
        let connect = ParserKind::Prompt(CONNECT_PROMPT);
        assert!(parse(&connect, b"\r\nCONNECT").result.is_pending());
        assert!(parse(&connect, b"\r\nCONNECT\r\n").result.is_success());
    }

    #[test]
    fn standard_tokens_and_value() {
        let kind = ParserKind::Standard(QISTATE);
        let out = parse(
            &kind,
            b"\r\n+QISTATE: 3,\"TCP\",\"1.2.3.4\",80,4000,2,1,3,0,\"usbmodem\"\r\n\r\nOK\r\n",
        );
        assert!(out.result.is_success());
        assert_eq!(out.value, Some(2));

        let out = parse(&kind, b"\r\n+QISTATE: 3,\"TCP\"\r\n");
        assert!(out.result.contains(ParseResult::COUNT_SHORT));
        assert!(out.result.is_error());
    }

    #[test]
    fn standard_waits_for_finale() {
        let kind = ParserKind::Standard(Standard::new("+CSQ: ", "OK\r\n").value(0));
        assert!(parse(&kind, b"\r\n+CSQ: 20,99\r\n").result.is_pending());
        let out = parse(&kind, b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n");
        assert!(out.result.is_success());
        assert_eq!(out.value, Some(20));
    }

    #[test]
    fn missing_preamble() {
        let required = ParserKind::Standard(Standard::new("+QMTOPEN: ", "\r\n"));
        assert!(parse(&required, b"\r\n").result.is_pending());
        let out = parse(&required, b"\r\nSEND FAIL\r\n");
        assert!(out.result.contains(ParseResult::PREAMBLE_MISSING));

        let optional = ParserKind::Standard(Standard::new("+QIACT: ", "OK\r\n").optional());
        assert!(parse(&optional, b"\r\nOK\r\n").result.is_success());
    }

    #[test]
    fn closing_line_of_oversized_reply() {
        let ok = ParserKind::Ok;
        assert!(closing(&ok, b"\r\n+QFLST: ", b"\"a.txt\",1\r\n").is_pending());
        assert!(closing(&ok, b"\r\n+QFLST: ", b"t\",1\r\n\r\nOK\r\n").is_success());
        let err = closing(&ok, b"\r\n+QFLST: ", b"\r\n+CME ERROR: 3\r\n");
        assert!(err.contains(ParseResult::MODULE_ERROR));

        let layout = ParserKind::Standard(Standard::new("+QIACT: ", "OK\r\n"));
        assert!(closing(&layout, b"\r\n+QIACT: 1,1", b"\r\nOK\r\n").is_success());
        let missing = closing(&layout, b"\r\n+QIND: ", b"\r\nOK\r\n");
        assert!(missing.contains(ParseResult::PREAMBLE_MISSING));
    }

    #[test]
    fn min_len_defers() {
        let kind = ParserKind::Standard(Standard::new("", "\r\n").min_len(10));
        assert!(parse(&kind, b"\r\n8675\r\n").result.is_pending());
        assert!(parse(&kind, b"\r\n86753090\r\n").result.is_success());
    }
}
