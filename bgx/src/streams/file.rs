//! Module flash file system (UFS).
//!
//! File reads stream through the dedicated file context: the interrupt moves
//! the payload behind `CONNECT <n>` into the receive pages, the dispatcher
//! hands it to the receiver given to [`Modem::file_init`].

use heapless::String;

use crate::atcmd::{Options, ParserKind, Standard, CONNECT_PROMPT};
use crate::iop::Expect;
use crate::modem::Modem;
use crate::platform::{BridgeBus, Platform};
use crate::Error;

use super::{DataReceiver, StreamCtrl, FILE_CTX};

pub const FILENAME_SIZE: usize = 80;
/// Largest chunk a single `AT+QFWRITE` takes.
pub const WRITE_MAX: usize = 1024;

const FILE_TIMEOUT_MS: u32 = 5_000;
const READ_TRAILER: &[u8] = b"\r\nOK\r\n";

const INFO_RESULT: Standard = Standard::new("+QFLDS: ", "OK\r\n").tokens(2);
const OPEN_RESULT: Standard = Standard::new("+QFOPEN: ", "OK\r\n").tokens(1).value(0);
const POSITION_RESULT: Standard = Standard::new("+QFPOSITION: ", "OK\r\n").tokens(1).value(0);
const WRITE_RESULT: Standard = Standard::new("+QFWRITE: ", "OK\r\n").tokens(2).value(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenMode {
    /// Open, creating the file if missing
    Create = 0,
    /// Create, or truncate an existing file
    Overwrite = 1,
    ReadOnly = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SeekFrom {
    Start = 0,
    Current = 1,
    End = 2,
}

/// Storage figures of the file system, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FsInfo {
    pub free: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String<FILENAME_SIZE>,
    pub size: u32,
}

pub(crate) struct FileCtrl<'a> {
    pub(crate) receiver: DataReceiver<'a>,
    pub(crate) received: usize,
}

impl<'a> FileCtrl<'a> {
    pub(crate) fn mark_closed(&mut self) {
        self.received = 0;
    }
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Give the file system a receive buffer for [`Modem::file_read`].
    pub fn file_init(
        &mut self,
        buffer: &'a mut [u8],
        receiver: DataReceiver<'a>,
    ) -> Result<(), Error> {
        let ctrl = FileCtrl { receiver, received: 0 };
        self.register_stream(FILE_CTX, buffer, StreamCtrl::File(ctrl))
    }

    pub fn file_info(&mut self) -> Result<FsInfo, Error> {
        self.invoke(
            format_args!("AT+QFLDS=\"UFS\""),
            Options::new(ParserKind::Standard(INFO_RESULT)),
        )?;
        match self.response_ints::<2>("+QFLDS: ").as_slice() {
            [Some(free), Some(total)] => Ok(FsInfo {
                free: *free as u32,
                total: *total as u32,
            }),
            _ => Err(Error::NotFound),
        }
    }

    /// Call `f` for every file matching `pattern`, `*` for all. Returns the
    /// number of entries seen.
    pub fn file_list(
        &mut self,
        pattern: &str,
        mut f: impl FnMut(&FileEntry),
    ) -> Result<usize, Error> {
        self.invoke(
            format_args!("AT+QFLST=\"{}\"", pattern),
            Options::default().timeout(FILE_TIMEOUT_MS),
        )?;
        let mut count = 0;
        for line in self.response_lines() {
            let Some(fields) = line.strip_prefix(b"+QFLST: ") else {
                continue;
            };
            let Some(entry) = parse_entry(fields) else {
                warn!("unreadable file list entry");
                continue;
            };
            f(&entry);
            count += 1;
        }
        Ok(count)
    }

    /// Open `name` and return the module's file handle.
    pub fn file_open(&mut self, name: &str, mode: OpenMode) -> Result<u32, Error> {
        if name.is_empty() || name.len() > FILENAME_SIZE {
            return Err(Error::BadRequest);
        }
        self.invoke(
            format_args!("AT+QFOPEN=\"{}\",{}", name, mode as u8),
            Options::new(ParserKind::Standard(OPEN_RESULT)).timeout(FILE_TIMEOUT_MS),
        )?;
        let handle = self.value().ok_or(Error::NotFound)?;
        debug!("file {} open as {}", name, handle);
        Ok(handle as u32)
    }

    pub fn file_close(&mut self, handle: u32) -> Result<(), Error> {
        self.invoke(format_args!("AT+QFCLOSE={}", handle), Options::default())
    }

    /// Read up to `len` bytes into the file receiver. Returns the number of
    /// bytes delivered, 0 at the end of the file.
    pub fn file_read(&mut self, handle: u32, len: usize) -> Result<usize, Error> {
        match self.stream_mut(FILE_CTX) {
            Some(StreamCtrl::File(f)) => f.received = 0,
            _ => return Err(Error::PreconditionFailed),
        }
        if len == 0 {
            return Err(Error::BadRequest);
        }
        let expect = Expect::Connect {
            ctx: FILE_CTX,
            trailer: READ_TRAILER,
        };
        let res = self.invoke_expecting(
            format_args!("AT+QFREAD={},{}", handle, len),
            expect,
            Options::default().timeout(FILE_TIMEOUT_MS),
        );
        let announced = self.iop.with_rx(|rx| {
            rx.take_completed(FILE_CTX);
            rx.take_announced(FILE_CTX)
        });
        let received = self.finish_bulk(FILE_CTX);
        res?;

        match announced {
            Some(n) if n != received => {
                warn!("file read: {} bytes announced, {} delivered", n, received);
                Err(Error::Overflow)
            }
            _ => Ok(received),
        }
    }

    /// Write `data` at the current position. Returns the bytes written and
    /// the new file size.
    pub fn file_write(&mut self, handle: u32, data: &[u8]) -> Result<(u32, u32), Error> {
        if data.is_empty() || data.len() > WRITE_MAX {
            return Err(Error::BadRequest);
        }
        self.invoke_with_payload(
            format_args!("AT+QFWRITE={},{}", handle, data.len()),
            CONNECT_PROMPT,
            data,
            Options::new(ParserKind::Standard(WRITE_RESULT)).timeout(FILE_TIMEOUT_MS),
        )?;
        match self.response_ints::<2>("+QFWRITE: ").as_slice() {
            [Some(written), Some(total)] => Ok((*written as u32, *total as u32)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn file_seek(&mut self, handle: u32, offset: u32, from: SeekFrom) -> Result<(), Error> {
        self.invoke(
            format_args!("AT+QFSEEK={},{},{}", handle, offset, from as u8),
            Options::default(),
        )
    }

    pub fn file_position(&mut self, handle: u32) -> Result<u32, Error> {
        self.invoke(
            format_args!("AT+QFPOSITION={}", handle),
            Options::new(ParserKind::Standard(POSITION_RESULT)),
        )?;
        self.value().map(|v| v as u32).ok_or(Error::NotFound)
    }

    /// Cut the file at the current position.
    pub fn file_truncate(&mut self, handle: u32) -> Result<(), Error> {
        self.invoke(format_args!("AT+QFTUCAT={}", handle), Options::default())
    }

    /// Delete `name`; `*` deletes every file.
    pub fn file_delete(&mut self, name: &str) -> Result<(), Error> {
        if name.is_empty() || name.len() > FILENAME_SIZE {
            return Err(Error::BadRequest);
        }
        self.invoke(
            format_args!("AT+QFDEL=\"{}\"", name),
            Options::default().timeout(FILE_TIMEOUT_MS),
        )
    }

    /// Deliver what is left in the pages of a finished bulk transfer and
    /// return the transfer's total.
    pub(crate) fn finish_bulk(&mut self, ctx: u8) -> usize {
        let receiver = match self.stream(ctx) {
            Some(StreamCtrl::File(f)) => f.receiver,
            Some(StreamCtrl::Http(h)) => h.receiver,
            _ => return 0,
        };
        let n = self.pull_pages(ctx, true, |data| receiver(ctx, data));
        match self.stream_mut(ctx) {
            Some(StreamCtrl::File(f)) => {
                f.received += n;
                f.received
            }
            Some(StreamCtrl::Http(h)) => {
                h.received += n;
                h.received
            }
            _ => n,
        }
    }
}

/// `"<name>",<size>`
fn parse_entry(fields: &[u8]) -> Option<FileEntry> {
    let fields = fields.strip_prefix(b"\"")?;
    let end = fields.iter().position(|&c| c == b'"')?;
    let name = core::str::from_utf8(&fields[..end]).ok()?;
    let size = crate::helpers::parse_int(fields[end + 1..].strip_prefix(b",")?)?;

    let mut entry = FileEntry {
        name: String::new(),
        size: u32::try_from(size).ok()?,
    };
    entry.name.push_str(name).ok()?;
    Some(entry)
}
