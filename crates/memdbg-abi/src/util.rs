//! Helpers shared by the ABI entry points.

use std::borrow::Cow;
use std::collections::HashSet;
use std::ffi::{CStr, c_char, c_int};
use std::io::{self, Write};

use memdbg_membrane::CallSite;
use parking_lot::Mutex;

/// File names seen so far. Entries live for the rest of the process.
static FILES: Mutex<Option<HashSet<&'static str>>> = Mutex::new(None);

/// Turn a C `__FILE__` string into a `'static` name, interning by content.
///
/// # Safety
///
/// `file` must be null or a valid NUL-terminated string.
pub(crate) unsafe fn intern_file(file: *const c_char) -> &'static str {
    if file.is_null() {
        return CallSite::UNKNOWN.file;
    }
    // SAFETY: caller contract.
    let name = unsafe { CStr::from_ptr(file) }.to_string_lossy();
    let mut files = FILES.lock();
    let known = files.get_or_insert_with(HashSet::new);
    if let Some(&interned) = known.get(name.as_ref()) {
        return interned;
    }
    let interned: &'static str = Box::leak(name.into_owned().into_boxed_str());
    known.insert(interned);
    interned
}

/// # Safety
///
/// `file` must be null or a valid NUL-terminated string.
pub(crate) unsafe fn site(file: *const c_char, line: c_int) -> CallSite {
    // SAFETY: caller contract.
    let file = unsafe { intern_file(file) };
    CallSite::new(file, u32::try_from(line).unwrap_or(0))
}

/// # Safety
///
/// `msg` must be null or a valid NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn message<'a>(msg: *const c_char) -> Cow<'a, str> {
    if msg.is_null() {
        return Cow::Borrowed("");
    }
    // SAFETY: caller contract.
    unsafe { CStr::from_ptr(msg) }.to_string_lossy()
}

/// `io::Write` over a C `FILE*`.
struct FileSink(*mut libc::FILE);

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // SAFETY: the stream was handed to us by the caller and is open.
        let written = unsafe { libc::fwrite(buf.as_ptr().cast(), 1, buf.len(), self.0) };
        if written == 0 {
            return Err(io::Error::other("fwrite wrote nothing"));
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        // SAFETY: as above.
        if unsafe { libc::fflush(self.0) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Run `f` against the given stream, or stderr when it is null.
///
/// # Safety
///
/// `stream` must be null or an open `FILE*`.
pub(crate) unsafe fn with_stream<R>(
    stream: *mut libc::FILE,
    f: impl FnOnce(&mut dyn Write) -> R,
) -> R {
    if stream.is_null() {
        f(&mut io::stderr().lock())
    } else {
        f(&mut FileSink(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_str() {
        let a = unsafe { intern_file(c"src/a.c".as_ptr()) };
        let b = unsafe { intern_file(c"src/a.c".as_ptr()) };
        assert_eq!(a, "src/a.c");
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn null_file_is_unknown() {
        let site = unsafe { site(std::ptr::null(), 9) };
        assert_eq!(site, CallSite::new(CallSite::UNKNOWN.file, 9));
    }

    #[test]
    fn negative_line_clamps_to_zero() {
        assert_eq!(unsafe { site(c"x.c".as_ptr(), -3) }.line, 0);
    }

    #[test]
    fn null_message_is_empty() {
        assert_eq!(unsafe { message(std::ptr::null()) }, "");
        assert_eq!(unsafe { message(c"phase 2".as_ptr()) }, "phase 2");
    }
}
