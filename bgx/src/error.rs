/// Errors surfaced by the driver.
///
/// Every variant maps onto the HTTP-style numeric result code the modem API
/// reports, see [`Error::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Invalid caller parameters, no I/O was performed
    BadRequest,
    /// Server refused the credentials (MQTT connect)
    Unauthorized,
    /// Expected response tag absent, or too few response tokens
    NotFound,
    /// `+CME ERROR` / `+CMS ERROR` or a bare `ERROR` reported by the module
    ModuleError,
    /// No completion within the timeout window
    Timeout,
    /// Command lock already held, or the resource is in a conflicting state
    Conflict,
    /// The operation requires a step that has not happened yet
    PreconditionFailed,
    /// Wait aborted through [`crate::Modem::cancel`]
    Cancelled,
    /// Unknown parse state or bridge failure
    Internal,
    /// A receive page or the TX ring ran out of space
    Overflow,
    /// Command issued while the modem is not application ready
    NotReady,
    /// Remote end reported itself unavailable
    Unavailable,
    /// Remote end did not answer in time
    GatewayTimeout,
}

impl Error {
    pub const fn code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::ModuleError => 405,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::Cancelled => 499,
            Self::Internal | Self::Overflow => 500,
            Self::NotReady | Self::Unavailable => 503,
            Self::GatewayTimeout => 504,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Result code reported for a successful operation.
pub const SUCCESS: u16 = 200;

/// Collapse an operation result into its numeric code.
pub fn result_code<T>(res: &Result<T, Error>) -> u16 {
    match res {
        Ok(_) => SUCCESS,
        Err(e) => e.code(),
    }
}

/// Failure on the SPI path to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// The underlying transfer reported an error
    Transfer,
    /// Scratch-pad read back differed from what was written
    Ping,
}

impl From<BusError> for Error {
    fn from(_: BusError) -> Self {
        Error::Internal
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(Error::Timeout.code(), 408);
        assert_eq!(Error::Conflict.code(), 409);
        assert_eq!(Error::ModuleError.code(), 405);
        assert_eq!(Error::Cancelled.code(), 499);
        assert_eq!(result_code::<()>(&Ok(())), 200);
        assert_eq!(result_code::<()>(&Err(Error::NotReady)), 503);
    }
}
