//! GNSS receiver: on, off and position fixes.

use heapless::String;

use crate::atcmd::{Options, ParserKind, Standard};
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

/// Fields of an `AT+QGPSLOC=2` answer.
const LOCATION_FIELDS: u8 = 11;
const LOCATION_RESULT: Standard = Standard::new("+QGPSLOC: ", "OK\r\n").tokens(LOCATION_FIELDS);

/// `+CME ERROR` the module reports while it has no fix.
pub const NO_FIX: &str = "516";

/// A position fix, from
/// `+QGPSLOC: <utc>,<lat>,<lon>,<hdop>,<alt>,<fix>,<cog>,<spkm>,<spkn>,<date>,<nsat>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// `hhmmss.s`
    pub utc: String<10>,
    /// Decimal degrees, south negative
    pub lat: f64,
    /// Decimal degrees, west negative
    pub lon: f64,
    pub hdop: f32,
    /// Meters above sea level
    pub altitude: f32,
    /// 2 for a 2D fix, 3 for 3D
    pub fix: u8,
    /// Course over ground, degrees
    pub course: f32,
    pub speed_kmh: f32,
    pub speed_kn: f32,
    /// `ddmmyy`
    pub date: String<6>,
    pub satellites: u8,
}

fn parse_location(fields: &[u8]) -> Option<Location> {
    let text = core::str::from_utf8(fields).ok()?;
    let mut it = text.split(',').map(str::trim);
    let mut utc = String::new();
    utc.push_str(it.next()?).ok()?;
    let lat = it.next()?.parse().ok()?;
    let lon = it.next()?.parse().ok()?;
    let hdop = it.next()?.parse().ok()?;
    let altitude = it.next()?.parse().ok()?;
    let fix = it.next()?.parse().ok()?;
    let course = it.next()?.parse().ok()?;
    let speed_kmh = it.next()?.parse().ok()?;
    let speed_kn = it.next()?.parse().ok()?;
    let mut date = String::new();
    date.push_str(it.next()?).ok()?;
    let satellites = it.next()?.parse().ok()?;

    Some(Location {
        utc,
        lat,
        lon,
        hdop,
        altitude,
        fix,
        course,
        speed_kmh,
        speed_kn,
        date,
        satellites,
    })
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    pub fn gnss_on(&mut self) -> Result<(), Error> {
        self.invoke(format_args!("AT+QGPS=1"), Options::default())
    }

    pub fn gnss_off(&mut self) -> Result<(), Error> {
        self.invoke(format_args!("AT+QGPSEND"), Options::default())
    }

    /// Current fix. Without one the module answers `+CME ERROR: 516`, see
    /// [`NO_FIX`] and [`Modem::error_detail`].
    pub fn gnss_location(&mut self) -> Result<Location, Error> {
        self.invoke(
            format_args!("AT+QGPSLOC=2"),
            Options::new(ParserKind::Standard(LOCATION_RESULT)),
        )?;
        let line = self.response_line("+QGPSLOC: ").ok_or(Error::NotFound)?;
        parse_location(line).ok_or_else(|| {
            warn!("unreadable location fix");
            Error::Internal
        })
    }
}
