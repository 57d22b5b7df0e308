//! Byte stores shared between the bridge interrupt and the foreground.
//!
//! - [`TxRing`]: foreground pushes command and payload bytes, the interrupt
//!   drains them into the bridge FIFO.
//! - [`CoreBuffer`]: command-mode receive buffer the AT parsers read from.
//! - [`Page`] / [`RxPages`]: the split-page double buffer of a stream. One page
//!   is always owned by the interrupt side, the other is free, filled or lent
//!   to the consumer.

use heapless::{Deque, Vec};

use crate::Error;

/// Smallest stream buffer accepted, two pages of 128 bytes.
pub const MIN_STREAM_BUFFER: usize = 256;
const STREAM_BUFFER_GRANULE: usize = 128;

pub struct TxRing<const N: usize> {
    queue: Deque<u8, N>,
}

impl<const N: usize> TxRing<N> {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    /// `false` when the ring is full.
    pub fn push(&mut self, byte: u8) -> bool {
        self.queue.push_back(byte).is_ok()
    }

    /// Push as much of `data` as fits, returning the accepted prefix length.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        data.iter().take_while(|&&b| self.push(b)).count()
    }

    pub fn pop(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        for slot in buf.iter_mut() {
            match self.queue.pop_front() {
                Some(b) => *slot = b,
                None => break,
            }
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn free(&self) -> usize {
        N - self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear()
    }
}

impl<const N: usize> Default for TxRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear command-mode receive buffer.
///
/// `tail..head` is what the AT parser has not consumed yet, `prev_head..head`
/// the bytes that arrived since the last scan.
pub struct CoreBuffer<const N: usize> {
    buf: Vec<u8, N>,
    tail: usize,
    prev_head: usize,
    overflow: bool,
}

impl<const N: usize> CoreBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            tail: 0,
            prev_head: 0,
            overflow: false,
        }
    }

    pub fn push(&mut self, byte: u8) -> bool {
        if self.buf.push(byte).is_err() {
            self.overflow = true;
            return false;
        }
        true
    }

    pub fn head(&self) -> usize {
        self.buf.len()
    }

    pub fn unread(&self) -> &[u8] {
        &self.buf[self.tail..]
    }

    pub fn fresh(&self) -> &[u8] {
        &self.buf[self.prev_head..]
    }

    pub fn consume(&mut self, n: usize) {
        self.tail = (self.tail + n).min(self.buf.len());
    }

    pub fn mark_scanned(&mut self) {
        self.prev_head = self.buf.len();
    }

    /// Cut everything from `at` onwards, used to strip a URC line.
    pub fn truncate(&mut self, at: usize) {
        self.buf.truncate(at);
        self.tail = self.tail.min(at);
        self.prev_head = self.prev_head.min(at);
    }

    /// Drop everything before `keep_from`, moving the remainder to the start.
    /// Returns the number of bytes removed.
    pub fn discard_before(&mut self, keep_from: usize) -> usize {
        let keep_from = keep_from.min(self.buf.len());
        let remaining = self.buf.len() - keep_from;
        self.buf.copy_within(keep_from.., 0);
        self.buf.truncate(remaining);
        self.tail = self.tail.saturating_sub(keep_from);
        self.prev_head = self.prev_head.saturating_sub(keep_from);
        self.overflow = false;
        keep_from
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.tail = 0;
        self.prev_head = 0;
        self.overflow = false;
    }
}

impl<const N: usize> Default for CoreBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// One half of a stream's receive buffer. Offsets are relative to the page
/// base, so `0 <= tail <= head <= capacity` always holds.
pub struct Page<'a> {
    index: u8,
    data: &'a mut [u8],
    head: usize,
    tail: usize,
    prev_head: usize,
}

impl<'a> Page<'a> {
    fn new(index: u8, data: &'a mut [u8]) -> Self {
        Self {
            index,
            data,
            head: 0,
            tail: 0,
            prev_head: 0,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.head - self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn free(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.tail..self.head]
    }

    /// Bytes written since the last call to [`Page::mark`].
    pub fn fresh(&self) -> &[u8] {
        &self.data[self.prev_head..self.head]
    }

    pub fn mark(&mut self) {
        self.prev_head = self.head;
    }

    pub fn consume(&mut self, n: usize) {
        self.tail = (self.tail + n).min(self.head);
        if self.tail == self.head {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.prev_head = 0;
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data[self.head..self.head + n].copy_from_slice(&bytes[..n]);
        self.head += n;
        n
    }

    pub(crate) fn is_consistent(&self) -> bool {
        self.tail <= self.head && self.prev_head <= self.head && self.head <= self.data.len()
    }
}

/// Page size for a caller supplied buffer of `total` bytes.
pub const fn page_size(total: usize) -> usize {
    (total - total % STREAM_BUFFER_GRANULE) / 2
}

/// Split a stream buffer into its two pages.
pub fn split_pages(buf: &mut [u8]) -> Result<(Page<'_>, Page<'_>), Error> {
    if buf.len() < MIN_STREAM_BUFFER || buf.len() % STREAM_BUFFER_GRANULE != 0 {
        return Err(Error::BadRequest);
    }
    let page = page_size(buf.len());
    let (first, rest) = buf.split_at_mut(page);
    let (second, _) = rest.split_at_mut(page);
    Ok((Page::new(0, first), Page::new(1, second)))
}

/// Where the page that is not owned by the interrupt currently is.
enum Spare<'a> {
    /// Lent to the consumer
    Consumer,
    /// Empty, available for a swap
    Drained(Page<'a>),
    /// Full, waiting for the consumer
    Filled(Page<'a>),
}

/// The two pages of a registered stream, as held on the interrupt side.
pub struct RxPages<'a> {
    iop: Page<'a>,
    spare: Spare<'a>,
    overflow: bool,
    last_rx_at: u32,
}

impl<'a> RxPages<'a> {
    pub fn new(pages: (Page<'a>, Page<'a>)) -> Self {
        let (iop, spare) = pages;
        Self {
            iop,
            spare: Spare::Drained(spare),
            overflow: false,
            last_rx_at: 0,
        }
    }

    pub fn iop_page(&self) -> u8 {
        self.iop.index
    }

    pub fn app_page(&self) -> u8 {
        1 - self.iop.index
    }

    pub fn page_size(&self) -> usize {
        self.iop.capacity()
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn idle_ms(&self, now: u32) -> u32 {
        now.wrapping_sub(self.last_rx_at)
    }

    /// Bytes held on the interrupt side, not yet handed to the consumer.
    pub fn pending(&self) -> usize {
        let spare = match &self.spare {
            Spare::Filled(p) => p.len(),
            _ => 0,
        };
        self.iop.len() + spare
    }

    /// Interrupt side append. When the IOP page fills up and `spill` is set,
    /// the free page is swapped in and writing continues there.
    pub fn write(&mut self, mut bytes: &[u8], now: u32, spill: bool) -> usize {
        let mut written = 0;
        while !bytes.is_empty() {
            let n = self.iop.write(bytes);
            written += n;
            bytes = &bytes[n..];
            if bytes.is_empty() {
                break;
            }
            if !spill || !self.swap_in_drained() {
                self.overflow = true;
                break;
            }
        }
        if written > 0 {
            self.last_rx_at = now;
        }
        written
    }

    /// Give a new frame a page of its own when the free page allows it.
    pub fn begin_frame(&mut self, now: u32) {
        if !self.iop.is_empty() {
            self.swap_in_drained();
        }
        self.last_rx_at = now;
    }

    fn swap_in_drained(&mut self) -> bool {
        match core::mem::replace(&mut self.spare, Spare::Consumer) {
            Spare::Drained(fresh) => {
                let filled = core::mem::replace(&mut self.iop, fresh);
                self.spare = Spare::Filled(filled);
                true
            }
            other => {
                self.spare = other;
                false
            }
        }
    }

    /// Hand a page to the consumer: a filled page if there is one, otherwise
    /// (with `pull_partial`) the partly filled IOP page swapped against the
    /// free one.
    pub fn take(&mut self, pull_partial: bool) -> Option<Page<'a>> {
        match core::mem::replace(&mut self.spare, Spare::Consumer) {
            Spare::Filled(page) => Some(page),
            Spare::Drained(fresh) if pull_partial && !self.iop.is_empty() => {
                Some(core::mem::replace(&mut self.iop, fresh))
            }
            other => {
                self.spare = other;
                None
            }
        }
    }

    /// Return a page taken with [`RxPages::take`].
    pub fn give_back(&mut self, mut page: Page<'a>) {
        debug_assert!(matches!(self.spare, Spare::Consumer));
        page.reset();
        self.spare = Spare::Drained(page);
    }

    /// Drop all buffered bytes. The consumer page must have been returned.
    pub fn clear(&mut self) {
        self.iop.reset();
        self.spare = match core::mem::replace(&mut self.spare, Spare::Consumer) {
            Spare::Filled(mut page) | Spare::Drained(mut page) => {
                page.reset();
                Spare::Drained(page)
            }
            Spare::Consumer => Spare::Consumer,
        };
        self.overflow = false;
    }

    pub(crate) fn is_consistent(&self) -> bool {
        let spare = match &self.spare {
            Spare::Drained(p) | Spare::Filled(p) => p.is_consistent() && p.index != self.iop.index,
            Spare::Consumer => true,
        };
        self.iop.is_consistent() && spare
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tx_ring_accepts_prefix() {
        let mut ring = TxRing::<8>::new();
        assert_eq!(ring.push_slice(b"AT+QIRD=3\r"), 8);
        assert!(!ring.push(b'x'));

        let mut out = [0u8; 5];
        assert_eq!(ring.pop(&mut out), 5);
        assert_eq!(&out, b"AT+QI");
        assert_eq!(ring.push_slice(b"xyz"), 3);

        let mut out = [0u8; 16];
        let n = ring.pop(&mut out);
        assert_eq!(&out[..n], b"RD=xyz");
        assert!(ring.is_empty());
    }

    #[test]
    fn tx_ring_order_preserved() {
        // pushes interleaved with pops never reorder or invent bytes
        let mut ring = TxRing::<16>::new();
        let mut pushed = std::vec::Vec::new();
        let mut popped = std::vec::Vec::new();
        for round in 0u8..40 {
            let chunk: std::vec::Vec<u8> =
                (0..(round % 7)).map(|i| round.wrapping_mul(7) ^ i).collect();
            let n = ring.push_slice(&chunk);
            pushed.extend_from_slice(&chunk[..n]);

            let mut out = [0u8; 5];
            let m = ring.pop(&mut out[..(round as usize % 5)]);
            popped.extend_from_slice(&out[..m]);
            assert!(popped.len() <= pushed.len());
        }
        let mut out = [0u8; 16];
        let m = ring.pop(&mut out);
        popped.extend_from_slice(&out[..m]);
        assert_eq!(pushed, popped);
    }

    #[test]
    fn core_buffer_strip_and_discard() {
        let mut core = CoreBuffer::<32>::new();
        for &b in b"\r\nOK\r\n+QIURC" {
            core.push(b);
        }
        core.truncate(6);
        assert_eq!(core.unread(), b"\r\nOK\r\n");
        core.consume(2);
        assert_eq!(core.unread(), b"OK\r\n");
        core.discard_before(4);
        assert_eq!(core.unread(), b"\r\n");
        assert_eq!(core.head(), 2);
    }

    #[test]
    fn core_buffer_overflow_flag() {
        let mut core = CoreBuffer::<4>::new();
        assert!(b"1234".iter().all(|&b| core.push(b)));
        assert!(!core.push(b'5'));
        assert!(core.overflow());
        core.clear();
        assert!(!core.overflow());
    }

    #[test]
    fn stream_buffer_validation() {
        let mut small = [0u8; 128];
        assert!(split_pages(&mut small).is_err());
        let mut odd = [0u8; 300];
        assert!(split_pages(&mut odd).is_err());
        let mut ok = [0u8; 4096];
        let (a, b) = split_pages(&mut ok).unwrap();
        assert_eq!((a.capacity(), b.capacity()), (2048, 2048));
        assert_eq!(page_size(4096 + 100), 2048);
    }

    #[test]
    fn pages_spill_and_swap() {
        let mut buf = [0u8; 256];
        let mut pages = RxPages::new(split_pages(&mut buf).unwrap());
        assert_eq!(pages.iop_page(), 0);

        let data: std::vec::Vec<u8> = (0..130u8).collect();
        assert_eq!(pages.write(&data, 1, true), 130);
        assert!(!pages.overflow());
        assert_eq!(pages.iop_page(), 1);
        assert_eq!(pages.app_page(), 0);
        assert!(pages.is_consistent());

        let first = pages.take(false).unwrap();
        assert_eq!(first.unread(), &data[..128]);
        // both halves are spoken for: a further fill of the IOP page overflows
        assert_eq!(pages.write(&[0u8; 200], 2, true), 126);
        assert!(pages.overflow());
        pages.give_back(first);

        let second = pages.take(true).unwrap();
        assert_eq!(&second.unread()[..2], &data[128..]);
        assert_eq!(second.index(), 1);
        assert_eq!(pages.iop_page(), 0);
        assert!(pages.is_consistent());
    }

    #[test]
    fn partial_pull_needs_data() {
        let mut buf = [0u8; 256];
        let mut pages = RxPages::new(split_pages(&mut buf).unwrap());
        assert!(pages.take(true).is_none());
        pages.write(b"hi", 5, false);
        assert!(pages.take(false).is_none());
        let page = pages.take(true).unwrap();
        assert_eq!(page.unread(), b"hi");
        assert_ne!(page.index(), pages.iop_page());
        pages.give_back(page);
        assert_eq!(pages.idle_ms(25), 20);
    }

    #[test]
    fn frame_start_moves_to_clean_page() {
        let mut buf = [0u8; 256];
        let mut pages = RxPages::new(split_pages(&mut buf).unwrap());
        pages.write(b"first", 0, false);
        pages.begin_frame(1);
        pages.write(b"second", 2, false);
        assert_eq!(pages.take(false).unwrap().unread(), b"first");
        assert_eq!(pages.pending(), 6);
    }
}
