//! Module identity and radio signal.

use heapless::String;

use crate::atcmd::{Options, ParserKind, Standard};
use crate::helpers::copy_str;
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

const ICCID_RESULT: Standard = Standard::new("+ICCID: ", "OK\r\n").tokens(1);
const CSQ_RESULT: Standard = Standard::new("+CSQ: ", "OK\r\n").tokens(2).value(0);

/// `AT+CSQ` value when the signal is not known or not detectable.
const CSQ_UNKNOWN: u8 = 99;

/// Identity of the module and its SIM, read once and cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemInfo {
    pub imei: String<16>,
    pub iccid: String<24>,
    pub firmware: String<40>,
    /// Manufacturer and model, e.g. `Quectel BG96`
    pub mfg_model: String<40>,
}

/// Received signal strength as reported by `AT+CSQ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Signal {
    pub csq: u8,
}

impl Signal {
    pub fn is_known(&self) -> bool {
        self.csq <= 31
    }

    pub fn percent(&self) -> u8 {
        if !self.is_known() {
            return 0;
        }
        (u16::from(self.csq) * 100 / 31) as u8
    }

    /// RSSI in dBm, -113 when unknown.
    pub fn dbm(&self) -> i16 {
        if !self.is_known() {
            return -113;
        }
        -113 + 2 * i16::from(self.csq)
    }

    /// Bars out of `count` for a signal indicator; full at 80 %.
    pub fn bars(&self, count: u8) -> u8 {
        if count == 0 || !self.is_known() {
            return 0;
        }
        let span = 100 / u16::from(count);
        let percent = (u16::from(self.percent()) + 20).min(100);
        (percent / span).min(u16::from(count)) as u8
    }
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Read the fields not cached yet. A failing query leaves its field empty
    /// and is retried on the next call.
    pub fn modem_info(&mut self) -> Result<&ModemInfo, Error> {
        if self.info.imei.is_empty() {
            self.invoke(format_args!("AT+GSN"), Options::default())?;
            let imei = self.first_line();
            copy_str(&mut self.info.imei, imei.as_str());
        }
        if self.info.firmware.is_empty() {
            self.invoke(format_args!("AT+QGMR"), Options::default())?;
            let fw = self.first_line();
            copy_str(&mut self.info.firmware, fw.as_str());
        }
        if self.info.mfg_model.is_empty() {
            self.invoke(format_args!("ATI"), Options::default())?;
            let mut model: String<40> = String::new();
            for line in self.response_lines().take_while(|l| !l.starts_with(b"Revision")) {
                let Ok(text) = core::str::from_utf8(line) else {
                    continue;
                };
                if !model.is_empty() && model.push(' ').is_err() {
                    break;
                }
                if model.push_str(text).is_err() {
                    break;
                }
            }
            self.info.mfg_model = model;
        }
        if self.info.iccid.is_empty() {
            self.invoke(
                format_args!("AT+ICCID"),
                Options::new(ParserKind::Standard(ICCID_RESULT)),
            )?;
            let iccid = self
                .response_line("+ICCID: ")
                .and_then(|l| core::str::from_utf8(l).ok())
                .unwrap_or("");
            let mut value: String<24> = String::new();
            copy_str(&mut value, iccid);
            self.info.iccid = value;
        }
        Ok(&self.info)
    }

    pub fn signal(&mut self) -> Result<Signal, Error> {
        self.invoke(format_args!("AT+CSQ"), Options::new(ParserKind::Standard(CSQ_RESULT)))?;
        let csq = self.value().and_then(|v| u8::try_from(v).ok()).unwrap_or(CSQ_UNKNOWN);
        Ok(Signal { csq })
    }

    /// First line of the last response, empty when there is none.
    fn first_line(&self) -> String<40> {
        let mut out = String::new();
        let first = self.response_lines().next();
        if let Some(text) = first.and_then(|l| core::str::from_utf8(l).ok()) {
            copy_str(&mut out, text);
        }
        out
    }
}
