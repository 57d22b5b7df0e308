//! Driver for Quectel BG96/BG95/BG77 LTE-M modems attached through an NXP
//! SC16IS741 SPI-UART bridge.
//!
//! The crate is built around three parts:
//!
//! - [`Iop`], the interrupt side. It drains the bridge FIFO, cuts unsolicited
//!   result codes out of the command stream and routes bulk payloads into
//!   the receive buffers of the streams.
//! - The AT command engine on [`Modem`]: one command in flight, guarded by a
//!   lock, completed by a pluggable response parser.
//! - The stream dispatcher, moving received data to the application from
//!   [`Modem::do_work`]: sockets, MQTT sessions, the HTTP client and the file
//!   system.
//!
//! Everything runs on the caller's thread except [`Iop::service_irq`], which
//! the platform binds to the falling edge of the bridge IRQ line.
//!
//! ### Usage
//! ```ignore
//! static IOP: bgx::Iop<'static, SpiBridge<MySpi>> = bgx::Iop::new();
//!
//! // Board GPIO interrupt handler, falling edge of the bridge IRQ line.
//! fn on_bridge_irq() {
//!     IOP.service_irq(embassy_time::Instant::now().as_millis() as u32);
//! }
//!
//! let platform = EmbassyPlatform::new(gpio);
//! let bus = SpiBridge::new(spi);
//! let mut modem = Modem::new(&IOP, bus, platform, FEATHER_UXPLOR, Config::default());
//! modem.start()?;
//!
//! let sock = modem.socket_init(0, Protocol::Tcp, &mut RX_BUF, &on_data)?;
//! modem.socket_open(sock, "example.com", 80, 0)?;
//! modem.socket_send(sock, b"GET / HTTP/1.0\r\n\r\n")?;
//! loop {
//!     modem.do_work();
//! }
//! ```
//!
//! ### Logging
//! Enable either the `log` or the `defmt` feature. Without them the driver
//! logs nothing.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

#[cfg(all(feature = "std", not(test)))]
extern crate std;

pub mod atcmd;
pub mod bridge;
pub mod buffers;
mod config;
mod controller;
mod error;
pub(crate) mod helpers;
mod iop;
#[cfg(any(test, feature = "std"))]
pub mod mock;
mod modem;
pub mod platform;
pub mod services;
pub mod streams;
mod urc;

pub use self::atcmd::{Options, ParseResult, ParserKind, Standard};
pub use self::config::{Config, DEFAULT_START_COMMANDS};
pub use self::error::{result_code, BusError, Error, SUCCESS};
pub use self::helpers::LossyStr;
pub use self::iop::{Iop, CORE_BUFFER_SIZE, STREAM_SLOTS, TX_BUFFER_SIZE};
pub use self::modem::{AppEvent, DeviceState, Modem, Notifier, ResetKind};
pub use self::platform::{
    BridgeBus, Edge, EmbassyPlatform, Gpio, MutexId, PinConfig, PinId, PinMode, Platform,
    SpiBridge, FEATHER_UXPLOR, RPI_UXPLOR,
};
pub use self::streams::file::{FileEntry, FsInfo, OpenMode, SeekFrom};
pub use self::streams::http::{HttpOptions, HttpResponse};
pub use self::streams::mqtt::{Mqtt, MqttMessage, MqttReceiver, MqttState, Qos};
pub use self::streams::socket::{Socket, SocketState};
pub use self::streams::{DataReceiver, Protocol};
pub use self::urc::UrcEvent;
