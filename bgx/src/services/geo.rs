//! Geo-fences evaluated by the GNSS receiver.
//!
//! Fences are created without boundary notifications; the application asks
//! for the current relation with [`Modem::geo_query`].

use core::fmt;

use crate::atcmd::{Options, ParserKind, Standard};
use crate::helpers::parse_int;
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

/// Highest fence id the module accepts.
pub const MAX_GEO_ID: u8 = 9;

const QUERY_RESULT: Standard = Standard::new("+QCFGEXT: \"querygeo\",", "OK\r\n").tokens(2);

/// A point in decimal degrees, south and west negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lon)
    }
}

/// Boundary of a fence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fence {
    /// Center and radius in meters
    Circle { center: Point, radius_m: f64 },
    /// Center and a point on the perimeter
    CircleThrough { center: Point, edge: Point },
    Triangle([Point; 3]),
    Quadrangle([Point; 4]),
}

impl Fence {
    fn shape(&self) -> u8 {
        match self {
            Fence::Circle { .. } => 0,
            Fence::CircleThrough { .. } => 1,
            Fence::Triangle(_) => 2,
            Fence::Quadrangle(_) => 3,
        }
    }
}

/// `<shape>,<lat1>,<lon1>,...` as `addgeo` expects it.
impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shape())?;
        match self {
            Fence::Circle { center, radius_m } => write!(f, ",{},{:.6}", center, radius_m),
            Fence::CircleThrough { center, edge } => write!(f, ",{},{}", center, edge),
            Fence::Triangle(points) => points.iter().try_for_each(|p| write!(f, ",{}", p)),
            Fence::Quadrangle(points) => points.iter().try_for_each(|p| write!(f, ",{}", p)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GeoPosition {
    Unknown = 0,
    Inside = 1,
    Outside = 2,
}

/// `+QCFGEXT: "querygeo",<id>,<position>`
fn parse_position(fields: &[u8], id: u8) -> Option<GeoPosition> {
    let mut tokens = fields.split(|&c| c == b',');
    if parse_int(tokens.next()?)? != i32::from(id) {
        return None;
    }
    match parse_int(tokens.next()?)? {
        0 => Some(GeoPosition::Unknown),
        1 => Some(GeoPosition::Inside),
        2 => Some(GeoPosition::Outside),
        _ => None,
    }
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    pub fn geo_add(&mut self, id: u8, fence: &Fence) -> Result<(), Error> {
        if id > MAX_GEO_ID {
            return Err(Error::BadRequest);
        }
        self.invoke(
            format_args!("AT+QCFGEXT=\"addgeo\",{},0,{}", id, fence),
            Options::default(),
        )
    }

    pub fn geo_delete(&mut self, id: u8) -> Result<(), Error> {
        if id > MAX_GEO_ID {
            return Err(Error::BadRequest);
        }
        self.invoke(format_args!("AT+QCFGEXT=\"deletegeo\",{}", id), Options::default())
    }

    /// Relation of the last fix to fence `id`.
    pub fn geo_query(&mut self, id: u8) -> Result<GeoPosition, Error> {
        if id > MAX_GEO_ID {
            return Err(Error::BadRequest);
        }
        self.invoke(
            format_args!("AT+QCFGEXT=\"querygeo\",{}", id),
            Options::new(ParserKind::Standard(QUERY_RESULT)),
        )?;
        let line = self.response_line("+QCFGEXT: \"querygeo\",").ok_or(Error::NotFound)?;
        parse_position(line, id).ok_or_else(|| {
            warn!("unreadable geo-fence answer");
            Error::Internal
        })
    }
}
