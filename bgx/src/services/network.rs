//! Network operator, radio access settings and packet data (PDP) contexts.

use heapless::{String, Vec};

use crate::atcmd::Options;
use crate::helpers::{copy_str, parse_int};
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

pub const MAX_PDP_CONTEXTS: usize = 4;
pub const OPERATOR_SIZE: usize = 32;

const ACTIVATE_TIMEOUT_MS: u32 = 150_000;
const DEACTIVATE_TIMEOUT_MS: u32 = 40_000;
const QUERY_TIMEOUT_MS: u32 = 20_000;
const OPERATOR_POLL_MS: u32 = 1_000;
/// Upper bound for [`Modem::await_operator`].
const OPERATOR_WAIT_MAX_MS: u32 = 300_000;

/// LTE category the module is registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IotMode {
    #[default]
    Unknown,
    M1,
    Nb1,
    Gsm,
}

/// Network categories searched under LTE, `AT+QCFG="iotopmode"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IotOpMode {
    M1 = 0,
    Nb1 = 1,
    M1Nb1 = 2,
}

/// Radio access technologies searched, `AT+QCFG="nwscanmode"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanMode {
    Auto = 0,
    GsmOnly = 1,
    LteOnly = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdpProtocol {
    Ipv4 = 1,
    Ipv6 = 2,
    Ipv4v6 = 3,
}

impl PdpProtocol {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Ipv4),
            2 => Some(Self::Ipv6),
            3 => Some(Self::Ipv4v6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthMethod {
    None = 0,
    Pap = 1,
    Chap = 2,
    PapOrChap = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdpContext {
    pub id: u8,
    pub active: bool,
    pub protocol: PdpProtocol,
    pub ip: String<40>,
}

/// Operator and packet network state, refreshed by queries and by the
/// `pdpdeact` notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub operator: String<OPERATOR_SIZE>,
    pub iot_mode: IotMode,
    pub contexts: Vec<PdpContext, MAX_PDP_CONTEXTS>,
}

impl NetworkInfo {
    pub fn context(&self, id: u8) -> Option<&PdpContext> {
        self.contexts.iter().find(|c| c.id == id)
    }

    pub fn is_active(&self, id: u8) -> bool {
        self.context(id).map_or(false, |c| c.active)
    }

    pub(crate) fn deactivated(&mut self, id: u8) {
        if let Some(ctx) = self.contexts.iter_mut().find(|c| c.id == id) {
            ctx.active = false;
            ctx.ip.clear();
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// `+COPS: <mode>,<format>,"<operator>",<act>`
fn parse_operator(line: &[u8]) -> Option<(&str, IotMode)> {
    let start = line.iter().position(|&c| c == b'"')? + 1;
    let len = line[start..].iter().position(|&c| c == b'"')?;
    let name = core::str::from_utf8(&line[start..start + len]).ok()?;
    let act = line[start + len + 1..]
        .strip_prefix(b",")
        .and_then(parse_int);
    let mode = match act {
        Some(8) => IotMode::M1,
        Some(9) => IotMode::Nb1,
        _ => IotMode::Gsm,
    };
    Some((name, mode))
}

/// `+QIACT: <id>,<state>,<type>[,"<ip>"]`
fn parse_context(fields: &[u8]) -> Option<PdpContext> {
    let mut tokens = fields.split(|&c| c == b',');
    let id = u8::try_from(parse_int(tokens.next()?)?).ok()?;
    let active = parse_int(tokens.next()?)? == 1;
    let protocol = PdpProtocol::from_code(parse_int(tokens.next()?)?)?;
    let mut ip = String::new();
    if let Some(addr) = tokens.next() {
        let addr = addr.strip_prefix(b"\"").unwrap_or(addr);
        let addr = addr.strip_suffix(b"\"").unwrap_or(addr);
        copy_str(&mut ip, core::str::from_utf8(addr).ok()?);
    }
    Some(PdpContext {
        id,
        active,
        protocol,
        ip,
    })
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Last known network state.
    pub fn network(&self) -> &NetworkInfo {
        &self.network
    }

    /// Poll `AT+COPS?` until the module reports an operator, then refresh the
    /// PDP contexts. Gives up after `wait_ms`, or when cancelled.
    pub fn await_operator(&mut self, wait_ms: u32) -> Result<&NetworkInfo, Error> {
        let wait_ms = wait_ms.min(OPERATOR_WAIT_MAX_MS);
        let start = self.now();
        self.network.operator.clear();
        self.network.iot_mode = IotMode::Unknown;

        loop {
            self.invoke(format_args!("AT+COPS?"), Options::default())?;
            if let Some((name, mode)) = self.response_line("+COPS: ").and_then(parse_operator) {
                let mut operator = String::new();
                copy_str(&mut operator, name);
                self.network.operator = operator;
                self.network.iot_mode = mode;
            }
            if !self.network.operator.is_empty() {
                break;
            }
            if self.now().wrapping_sub(start) >= wait_ms {
                return Err(Error::Timeout);
            }
            if self.iop.cancel_requested() {
                self.iop.clear_cancel();
                return Err(Error::Cancelled);
            }
            self.platform.delay_ms(OPERATOR_POLL_MS);
        }
        info!("operator {} ({:?})", self.network.operator.as_str(), self.network.iot_mode);

        self.fetch_pdp_contexts()?;
        Ok(&self.network)
    }

    /// Refresh the PDP context table with `AT+QIACT?`.
    pub fn fetch_pdp_contexts(&mut self) -> Result<&[PdpContext], Error> {
        self.invoke(format_args!("AT+QIACT?"), Options::default().timeout(QUERY_TIMEOUT_MS))?;
        let mut contexts = Vec::new();
        for line in self.response_lines() {
            let Some(ctx) = line.strip_prefix(b"+QIACT: ").and_then(parse_context) else {
                continue;
            };
            if contexts.push(ctx).is_err() {
                break;
            }
        }
        self.network.contexts = contexts;
        Ok(&self.network.contexts)
    }

    pub fn pdp_activate(&mut self, id: u8) -> Result<(), Error> {
        self.invoke(
            format_args!("AT+QIACT={}", id),
            Options::default().timeout(ACTIVATE_TIMEOUT_MS),
        )?;
        self.fetch_pdp_contexts()?;
        Ok(())
    }

    pub fn pdp_deactivate(&mut self, id: u8) -> Result<(), Error> {
        self.invoke(
            format_args!("AT+QIDEACT={}", id),
            Options::default().timeout(DEACTIVATE_TIMEOUT_MS),
        )?;
        self.network.deactivated(id);
        Ok(())
    }

    /// Set the APN of context `id`.
    pub fn pdp_configure(&mut self, id: u8, protocol: PdpProtocol, apn: &str) -> Result<(), Error> {
        self.invoke(
            format_args!("AT+QICSGP={},{},\"{}\"", id, protocol as u8, apn),
            Options::default(),
        )
    }

    /// Set the APN and credentials of IPv4 context `id`.
    pub fn pdp_configure_auth(
        &mut self,
        id: u8,
        apn: &str,
        username: &str,
        password: &str,
        auth: AuthMethod,
    ) -> Result<(), Error> {
        self.invoke(
            format_args!(
                "AT+QICSGP={},1,\"{}\",\"{}\",\"{}\",{}",
                id, apn, username, password, auth as u8
            ),
            Options::default(),
        )
    }

    /// RAT search order, e.g. `"020301"` for M1, NB1, GSM.
    pub fn set_scan_sequence(&mut self, sequence: &str) -> Result<(), Error> {
        if sequence.is_empty() || !sequence.bytes().all(|c| c.is_ascii_digit()) {
            return Err(Error::BadRequest);
        }
        self.invoke(format_args!("AT+QCFG=\"nwscanseq\",{}", sequence), Options::default())
    }

    pub fn set_scan_mode(&mut self, mode: ScanMode) -> Result<(), Error> {
        self.invoke(format_args!("AT+QCFG=\"nwscanmode\",{}", mode as u8), Options::default())
    }

    pub fn set_iot_mode(&mut self, mode: IotOpMode) -> Result<(), Error> {
        self.invoke(format_args!("AT+QCFG=\"iotopmode\",{}", mode as u8), Options::default())
    }

    /// Access technology, operator code and band from `AT+QNWINFO`, e.g.
    /// `"CAT-M1","311480","LTE BAND 13",5230`.
    pub fn network_details(&mut self) -> Result<String<64>, Error> {
        self.invoke(format_args!("AT+QNWINFO"), Options::default())?;
        let line = self.response_line("+QNWINFO: ").ok_or(Error::NotFound)?;
        let mut out = String::new();
        copy_str(&mut out, core::str::from_utf8(line).map_err(|_| Error::Internal)?);
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use core::cell::RefCell;
    use std::vec::Vec as StdVec;

    use super::*;
    use crate::atcmd::test::{ready, TestModem};
    use crate::mock::Emulator;
    use crate::modem::AppEvent;
    use crate::Iop;

    fn pump(modem: &mut TestModem<'_>, ms: u32) {
        for _ in 0..ms {
            modem.do_work();
            modem.platform().yield_now();
        }
    }

    #[test]
    fn operator_and_contexts() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(b"AT+COPS?\r", b"\r\n+COPS: 0\r\n\r\nOK\r\n")
            .respond(b"AT+COPS?\r", b"\r\n+COPS: 0,0,\"AT&T\",8\r\n\r\nOK\r\n")
            .respond(
                b"AT+QIACT?\r",
                b"\r\n+QIACT: 1,1,1,\"10.160.46.12\"\r\n+QIACT: 2,0,1\r\n\r\nOK\r\n",
            );
        let net = modem.await_operator(5_000).unwrap().clone();
        assert_eq!(net.operator, "AT&T");
        assert_eq!(net.iot_mode, IotMode::M1);
        assert_eq!(net.contexts.len(), 2);
        assert_eq!(net.context(1).map(|c| c.ip.as_str()), Some("10.160.46.12"));
        assert!(net.is_active(1));
        assert!(!net.is_active(2));
        assert!(emu.now() >= OPERATOR_POLL_MS);
    }

    #[test]
    fn operator_wait_times_out() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);
        for _ in 0..3 {
            emu.respond(b"AT+COPS?\r", b"\r\n+COPS: 0\r\n\r\nOK\r\n");
        }
        assert_eq!(modem.await_operator(1_500).err(), Some(Error::Timeout));
        assert!(modem.network().operator.is_empty());
    }

    #[test]
    fn deactivation_notice_updates_table() {
        let emu = Emulator::new();
        let events = RefCell::new(StdVec::new());
        let notify = |e: AppEvent, _: &str| events.borrow_mut().push(e);
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu).with_notifier(&notify);

        emu.respond(b"AT+QIACT=1\r", b"\r\nOK\r\n")
            .respond(b"AT+QIACT?\r", b"\r\n+QIACT: 1,1,1,\"10.0.0.7\"\r\n\r\nOK\r\n");
        modem.pdp_activate(1).unwrap();
        assert!(modem.network().is_active(1));

        emu.inject(b"\r\n+QIURC: \"pdpdeact\",1\r\n");
        pump(&mut modem, 3);
        assert!(!modem.network().is_active(1));
        assert_eq!(events.borrow().as_slice(), &[AppEvent::PdpDeactivated]);
    }

    #[test]
    fn configuration_commands() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(b"AT+QICSGP=1,1,\"hologram\"\r", b"\r\nOK\r\n")
            .respond(b"AT+QICSGP=2,1,\"corp\",\"u\",\"p\",2\r", b"\r\nOK\r\n")
            .respond(b"AT+QCFG=\"nwscanseq\",020301\r", b"\r\nOK\r\n")
            .respond(b"AT+QCFG=\"nwscanmode\",3\r", b"\r\nOK\r\n")
            .respond(b"AT+QCFG=\"iotopmode\",2\r", b"\r\nOK\r\n");
        modem.pdp_configure(1, PdpProtocol::Ipv4, "hologram").unwrap();
        modem.pdp_configure_auth(2, "corp", "u", "p", AuthMethod::Chap).unwrap();
        modem.set_scan_sequence("020301").unwrap();
        modem.set_scan_mode(ScanMode::LteOnly).unwrap();
        modem.set_iot_mode(IotOpMode::M1Nb1).unwrap();
        assert!(emu.script_done());

        assert_eq!(modem.set_scan_sequence("02,03"), Err(Error::BadRequest));
    }

    #[test]
    fn context_table_keeps_protocols() {
        let emu = Emulator::new();
        let iop = Iop::new();
        let mut modem = ready(&iop, &emu);

        emu.respond(
            b"AT+QIACT?\r",
            b"\r\n+QIACT: 1,1,1,\"10.160.46.12\"\r\n\
              +QIACT: 2,1,2,\"2001:db8:0:0:0:0:0:1\"\r\n\
              +QIACT: 3,0,3\r\n\
              +QIACT: 4,1,3,\"10.0.0.9\"\r\n\r\nOK\r\n",
        );
        let contexts = modem.fetch_pdp_contexts().unwrap();
        let summary: StdVec<_> = contexts.iter().map(|c| (c.id, c.active, c.protocol)).collect();
        assert_eq!(
            summary,
            [
                (1, true, PdpProtocol::Ipv4),
                (2, true, PdpProtocol::Ipv6),
                (3, false, PdpProtocol::Ipv4v6),
                (4, true, PdpProtocol::Ipv4v6),
            ]
        );
        assert_eq!(contexts[1].ip, "2001:db8:0:0:0:0:0:1");
        assert!(contexts[2].ip.is_empty());
        assert_eq!(modem.network().context(4).map(|c| c.ip.as_str()), Some("10.0.0.9"));
    }

    #[test]
    fn context_parser() {
        let ctx = parse_context(b"3,0,1").unwrap();
        assert_eq!((ctx.id, ctx.active, ctx.ip.as_str()), (3, false, ""));
        assert_eq!(ctx.protocol, PdpProtocol::Ipv4);
        assert!(parse_context(b"x,1").is_none());
        assert!(parse_context(b"1,1").is_none());
        assert!(parse_context(b"1,1,7,\"10.0.0.1\"").is_none());
        assert_eq!(parse_operator(b"0,0,\"Verizon\",9").map(|o| o.1), Some(IotMode::Nb1));
        assert_eq!(parse_operator(b"0"), None);
    }
}
