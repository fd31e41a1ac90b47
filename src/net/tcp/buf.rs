//! TCP input and output buffers (`spec.md` §3 "Input buffer"/"Output
//! buffer", §4.4 "Buffering").

use crate::alloc::page::{alloc_pages, Page};
use crate::buf::Cursor;
use crate::error::{Error, Result};

/// A connection's receive scratch: one page, read via a cursor
/// (`spec.md` §3, "a read/write cursor over a contiguous payload region
/// whose total size is one page").
///
/// Detaching (see [`Connection::detach_input_buffer`][crate::net::tcp::Connection::detach_input_buffer])
/// hands the whole `InputBuffer` to the caller and replaces it with a fresh
/// one; there is no separate "owning connection" pointer to update because
/// ownership itself moves.
pub struct InputBuffer {
    page: Page,
    r: usize,
    w: usize,
}

impl InputBuffer {
    pub(crate) fn new() -> Result<InputBuffer> {
        let page = alloc_pages(1).ok_or(Error::OutOfMemory)?;
        Ok(InputBuffer { page, r: 0, w: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.page.len()
    }

    pub fn readable_len(&self) -> usize {
        self.w - self.r
    }

    pub fn writable_len(&self) -> usize {
        self.page.len() - self.w
    }

    pub fn is_full(&self) -> bool {
        self.w == self.page.len()
    }

    /// The bytes received since the last callback, plus any residue left
    /// unread by a previous one.
    pub fn readable(&self) -> &[u8] {
        &self.page.as_slice()[self.r..self.w]
    }

    /// A cursor view over the buffer, for callers that want the byte-order
    /// integer codecs rather than raw slice access.
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::from_raw_parts(self.page.as_mut_slice(), self.r, self.w)
    }

    fn sync_positions(&mut self, r: usize, w: usize) {
        self.r = r;
        self.w = w;
    }

    /// Consume (advance past) up to `n` readable bytes. Returns the number
    /// actually consumed.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.readable_len());
        self.r += n;
        n
    }

    /// Move unread bytes to the front of the region, reclaiming the space
    /// before them. Errors with [`Error::Overflow`] only if the buffer is
    /// already full and nothing can be reclaimed (`spec.md` §4.4).
    pub fn repackage(&mut self) -> Result<()> {
        let (ok, r, w) = {
            let mut cursor = Cursor::from_raw_parts(self.page.as_mut_slice(), self.r, self.w);
            let ok = cursor.repackage();
            let (r, w) = cursor.positions();
            (ok, r, w)
        };
        self.sync_positions(r, w);
        if ok {
            Ok(())
        } else {
            Err(Error::Overflow)
        }
    }

    /// The writable range's address and length, for the backend to read
    /// OS data directly into.
    pub(crate) fn writable_ptr_len(&mut self) -> (*mut u8, usize) {
        let w = self.w;
        let ptr = unsafe { self.page.as_mut_slice().as_mut_ptr().add(w) };
        (ptr, self.page.len() - w)
    }

    /// Record that `n` bytes were written into the writable range by the
    /// backend, advancing `w`. Errors with [`Error::Overflow`] if `n`
    /// doesn't fit (it always should, since the backend was only ever
    /// given `writable_len()` bytes to fill).
    pub(crate) fn commit_write(&mut self, n: usize) -> Result<()> {
        if n > self.page.len() - self.w {
            return Err(Error::Overflow);
        }
        self.w += n;
        Ok(())
    }

    /// Replace this buffer in place with a freshly allocated one, handing
    /// back the original (`spec.md` §4.4 "detach", design note in
    /// `spec.md` §9: "the connection holds a pointer-to-pointer into its
    /// own buffer field, and detach swaps in a freshly allocated buffer
    /// while handing the old one to the caller").
    ///
    /// Takes `&mut self` rather than a connection handle because the
    /// callback that wants to detach already holds `&mut InputBuffer` (it's
    /// the argument `on_read` was called with); swapping through that
    /// reference avoids re-entering the connection's own borrow while still
    /// inside its callback dispatch.
    pub fn detach(&mut self) -> Result<InputBuffer> {
        let fresh = InputBuffer::new()?;
        Ok(std::mem::replace(self, fresh))
    }
}

/// A send-side payload, handed to [`Connection::write`][crate::net::tcp::Connection::write]
/// and returned unchanged to `on_write` on completion
/// (`spec.md` §3, "Output buffer").
pub struct OutputBuffer {
    data: OutputData,
}

enum OutputData {
    Owned(Vec<u8>),
    Page(Page, usize),
}

impl OutputBuffer {
    pub fn from_vec(data: Vec<u8>) -> OutputBuffer {
        OutputBuffer { data: OutputData::Owned(data) }
    }

    /// Wrap a page-allocated payload of `len` bytes (`spec.md` §3,
    /// "user-allocated, often from the page allocator").
    pub fn from_page(page: Page, len: usize) -> OutputBuffer {
        let len = len.min(page.len());
        OutputBuffer { data: OutputData::Page(page, len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            OutputData::Owned(v) => v,
            OutputData::Page(page, len) => &page.as_slice()[..*len],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn as_ptr_len(&self) -> (*const u8, usize) {
        let slice = self.as_slice();
        (slice.as_ptr(), slice.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repackage_moves_residue_and_overflow_only_when_stuck() {
        let mut buf = InputBuffer::new().unwrap();
        let (ptr, len) = buf.writable_ptr_len();
        let payload = b"hello";
        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len()) };
        let _ = len;
        buf.commit_write(payload.len()).unwrap();
        buf.consume(2);
        assert_eq!(buf.readable(), b"llo");
        buf.repackage().unwrap();
        assert_eq!(buf.readable(), b"llo");
        assert_eq!(buf.writable_len(), buf.capacity() - 3);
    }

    #[test]
    fn output_buffer_exposes_its_slice() {
        let out = OutputBuffer::from_vec(b"Hello, Arrowhead!\0".to_vec());
        assert_eq!(out.len(), 18);
        assert_eq!(out.as_slice(), b"Hello, Arrowhead!\0");
    }
}
