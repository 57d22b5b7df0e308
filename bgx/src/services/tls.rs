//! TLS context settings (`AT+QSSLCFG`). A context is referenced by number from
//! TLS sockets, MQTT sessions and the HTTP client.

use crate::atcmd::{Options, ParserKind, Standard};
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

/// Contexts the module provides.
pub const TLS_CONTEXTS: u8 = 6;

const VERSION_RESULT: Standard = Standard::new("+QSSLCFG: ", "OK\r\n").tokens(3).value(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TlsVersion {
    Ssl30 = 0,
    Tls10 = 1,
    Tls11 = 2,
    Tls12 = 3,
    #[default]
    Any = 4,
}

impl TlsVersion {
    fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Ssl30,
            1 => Self::Tls10,
            2 => Self::Tls11,
            3 => Self::Tls12,
            4 => Self::Any,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityLevel {
    #[default]
    NoAuthentication = 0,
    Server = 1,
    ServerAndClient = 2,
}

/// IANA cipher suite number, `0xFFFF` lets the module pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    pub const ANY: Self = Self(0xFFFF);
    pub const RSA_AES_128_CBC_SHA: Self = Self(0x002F);
    pub const RSA_AES_256_CBC_SHA: Self = Self(0x0035);
    pub const RSA_AES_256_CBC_SHA256: Self = Self(0x003D);
    pub const ECDHE_RSA_AES_128_CBC_SHA: Self = Self(0xC013);
    pub const ECDHE_RSA_AES_256_CBC_SHA: Self = Self(0xC014);
    pub const ECDHE_RSA_AES_128_CBC_SHA256: Self = Self(0xC027);
    pub const ECDHE_RSA_AES_256_CBC_SHA384: Self = Self(0xC028);
    pub const ECDHE_RSA_AES_128_GCM_SHA256: Self = Self(0xC02F);
}

impl Default for CipherSuite {
    fn default() -> Self {
        Self::ANY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TlsConfig {
    pub version: TlsVersion,
    pub cipher: CipherSuite,
    /// Skip the certificate validity period check
    pub ignore_local_time: bool,
    pub security: SecurityLevel,
    pub sni: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            version: TlsVersion::Any,
            cipher: CipherSuite::ANY,
            ignore_local_time: true,
            security: SecurityLevel::NoAuthentication,
            sni: false,
        }
    }
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Apply `config` to TLS context `ctx`.
    pub fn tls_configure(&mut self, ctx: u8, config: &TlsConfig) -> Result<(), Error> {
        if ctx >= TLS_CONTEXTS {
            return Err(Error::BadRequest);
        }
        self.invoke(
            format_args!("AT+QSSLCFG=\"sslversion\",{},{}", ctx, config.version as u8),
            Options::default(),
        )?;
        self.invoke(
            format_args!("AT+QSSLCFG=\"ciphersuite\",{},0X{:04X}", ctx, config.cipher.0),
            Options::default(),
        )?;
        self.invoke(
            format_args!(
                "AT+QSSLCFG=\"ignorelocaltime\",{},{}",
                ctx,
                u8::from(config.ignore_local_time)
            ),
            Options::default(),
        )?;
        self.invoke(
            format_args!("AT+QSSLCFG=\"seclevel\",{},{}", ctx, config.security as u8),
            Options::default(),
        )?;
        self.invoke(
            format_args!("AT+QSSLCFG=\"sni\",{},{}", ctx, u8::from(config.sni)),
            Options::default(),
        )
    }

    /// Trusted CA certificate for `ctx`, a file on the module file system.
    pub fn tls_set_ca_cert(&mut self, ctx: u8, file: &str) -> Result<(), Error> {
        if ctx >= TLS_CONTEXTS || file.is_empty() {
            return Err(Error::BadRequest);
        }
        self.invoke(format_args!("AT+QSSLCFG=\"cacert\",{},\"{}\"", ctx, file), Options::default())
    }

    pub fn tls_version(&mut self, ctx: u8) -> Result<TlsVersion, Error> {
        if ctx >= TLS_CONTEXTS {
            return Err(Error::BadRequest);
        }
        self.invoke(
            format_args!("AT+QSSLCFG=\"sslversion\",{}", ctx),
            Options::new(ParserKind::Standard(VERSION_RESULT)),
        )?;
        self.value().and_then(TlsVersion::from_code).ok_or(Error::NotFound)
    }
}
