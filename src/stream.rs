//! Top-level stream open dispatch (§6), grounded on `stf_env_var.hpp`
//! (`original_source/`) for the `STF_SINGLE_THREADED` validation rule,
//! and on the teacher's small-focused-trait style (`reader.rs`) for
//! keeping the open path itself free of format-specific logic.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Stdin, Stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{trace, warn};

use crate::error::{Result, StfError};
use crate::piped::{PipedReader, PipedWriter};

/// A trace byte source, dispatched by suffix (§6's file-type table).
pub enum InputStream {
    Plain(File),
    Piped(PipedReader),
    Stdin(Stdin),
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputStream::Plain(f) => f.read(buf),
            InputStream::Piped(p) => p.read(buf),
            InputStream::Stdin(s) => s.read(buf),
        }
    }
}

/// A trace byte sink, dispatched by suffix.
pub enum OutputStream {
    Plain(File),
    Piped(PipedWriter),
    Stdout(Stdout),
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputStream::Plain(f) => f.write(buf),
            OutputStream::Piped(p) => p.write(buf),
            OutputStream::Stdout(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputStream::Plain(f) => f.flush(),
            OutputStream::Piped(p) => p.flush(),
            OutputStream::Stdout(s) => s.flush(),
        }
    }
}

/// How a path's suffix maps to a transport (§6). `.zstf` is handled by
/// [`crate::chunked`] directly; this enum is for the uncompressed/piped
/// cases that share the plain `Read`/`Write` surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Chunked,
    PipedGzip,
    PipedXz,
    Plain,
    Stdio,
}

/// Classifies `path` by suffix, per §6's table. `-` is the stdin/stdout
/// sentinel.
pub fn classify(path: &str) -> Transport {
    if path == "-" {
        Transport::Stdio
    } else if path.ends_with(".zstf") {
        Transport::Chunked
    } else if path.ends_with(".stf.gz") {
        Transport::PipedGzip
    } else if path.ends_with(".stf.xz") {
        Transport::PipedXz
    } else {
        Transport::Plain
    }
}

pub fn open_read(path: &str) -> Result<InputStream> {
    match classify(path) {
        Transport::Stdio => Ok(InputStream::Stdin(io::stdin())),
        Transport::PipedGzip => Ok(InputStream::Piped(PipedReader::gzip_decompress(path)?)),
        Transport::PipedXz => Ok(InputStream::Piped(PipedReader::xz_decompress(path)?)),
        Transport::Plain | Transport::Chunked => Ok(InputStream::Plain(File::open(path)?)),
    }
}

pub fn open_write(path: &str) -> Result<OutputStream> {
    match classify(path) {
        Transport::Stdio => Ok(OutputStream::Stdout(io::stdout())),
        Transport::PipedGzip => Ok(OutputStream::Piped(PipedWriter::gzip_compress(path)?)),
        Transport::PipedXz => Err(StfError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "xz write support requires an external 'xz -z' pipe; not wired up by this transport",
        ))),
        Transport::Plain | Transport::Chunked => Ok(OutputStream::Plain(File::create(path)?)),
    }
}

/// Derives the sibling page-table-walk trace path for `primary`, by
/// inserting `-pte` before the compression extension (§6): `base.stf` ->
/// `base.stf-pte`, `base.stf.gz` -> `base.stf-pte.gz`, `base.zstf` ->
/// `base-pte.zstf`.
pub fn derive_pte_sibling(primary: &str) -> PathBuf {
    if let Some(base) = primary.strip_suffix(".zstf") {
        return PathBuf::from(format!("{base}-pte.zstf"));
    }
    for ext in [".stf.gz", ".stf.xz"] {
        if let Some(base) = primary.strip_suffix(ext) {
            let compression = &ext[".stf".len()..];
            return PathBuf::from(format!("{base}.stf-pte{compression}"));
        }
    }
    if let Some(base) = primary.strip_suffix(".stf") {
        return PathBuf::from(format!("{base}.stf-pte"));
    }
    PathBuf::from(format!("{primary}-pte"))
}

/// Opens `primary`'s page-table sibling. `required` mirrors §6's "caller
/// requests strict checking" switch: absence is only an error then.
pub fn open_pte_sibling(primary: &str, required: bool) -> Result<Option<InputStream>> {
    let sibling = derive_pte_sibling(primary);
    match open_read(&sibling.to_string_lossy()) {
        Ok(stream) => Ok(Some(stream)),
        Err(StfError::Io(e)) if e.kind() == io::ErrorKind::NotFound && !required => Ok(None),
        Err(e) => Err(e),
    }
}

/// Opens `primary`'s page-table sibling (if present) and exposes it as a
/// second iterator of `PageTableWalk` records, per §4.6's "the
/// materialiser opens it in parallel and exposes it as a second
/// iterator". `required` is forwarded to [`open_pte_sibling`].
pub fn open_pte_sibling_stream(
    primary: &str,
    required: bool,
) -> Result<Option<crate::materialiser::PageTableWalkStream<InputStream>>> {
    let input = match open_pte_sibling(primary, required)? {
        Some(input) => input,
        None => return Ok(None),
    };
    let mut read_stream = crate::byte_stream::ReadStream::new(input);
    crate::header::read_header(&mut read_stream)?;
    Ok(Some(crate::materialiser::PageTableWalkStream::new(read_stream)))
}

/// Parses `STF_SINGLE_THREADED`'s value against the allowed set (§6):
/// `{0, 1, true, false}`. Unset is treated as `false`.
pub fn single_threaded_from_env() -> Result<bool> {
    match std::env::var("STF_SINGLE_THREADED") {
        Err(std::env::VarError::NotPresent) => Ok(false),
        Err(std::env::VarError::NotUnicode(v)) => {
            Err(StfError::InvalidEnvFlag(v.to_string_lossy().into_owned()))
        }
        Ok(v) => match v.as_str() {
            "0" | "false" => Ok(false),
            "1" | "true" => Ok(true),
            other => Err(StfError::InvalidEnvFlag(other.to_string())),
        },
    }
}

/// A process-wide registry of open, potentially trailer-pending streams
/// (§5): every chunked writer registers its path here, and an
/// `atexit`-registered handler flushes/warns about anything still open
/// on abnormal process termination, so `std::process::exit` (which skips
/// Rust destructors) does not silently truncate a compressed trace.
static OPEN_PATHS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static ATEXIT_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn run_atexit_handler() {
    let paths = OPEN_PATHS.lock().unwrap_or_else(|e| e.into_inner());
    for path in paths.iter() {
        warn!("stf-trace: {} was still open at process exit; trailer may be missing", path.display());
    }
}

fn ensure_atexit_installed() {
    if ATEXIT_INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        unsafe {
            libc::atexit(run_atexit_handler);
        }
    }
}

/// RAII guard registering `path` as open for the lifetime of the guard.
/// Dropping it (the normal path) deregisters; if the process instead
/// calls `std::process::exit`/aborts, the `atexit` handler above still
/// sees it and warns.
pub struct OpenGuard {
    path: PathBuf,
}

impl OpenGuard {
    pub fn register(path: impl AsRef<Path>) -> Self {
        ensure_atexit_installed();
        let path = path.as_ref().to_path_buf();
        OPEN_PATHS.lock().unwrap().push(path.clone());
        trace!("registered open stream: {}", path.display());
        Self { path }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        let mut paths = OPEN_PATHS.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = paths.iter().position(|p| p == &self.path) {
            paths.remove(idx);
        }
    }
}

/// Test-only helper exposing how many paths are currently registered,
/// without depending on handler-registration ordering across tests.
#[cfg(test)]
fn registered_count(paths: &HashSet<PathBuf>) -> usize {
    let open = OPEN_PATHS.lock().unwrap();
    open.iter().filter(|p| paths.contains(*p)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_suffixes() {
        assert_eq!(classify("trace.zstf"), Transport::Chunked);
        assert_eq!(classify("trace.stf.gz"), Transport::PipedGzip);
        assert_eq!(classify("trace.stf.xz"), Transport::PipedXz);
        assert_eq!(classify("trace.stf"), Transport::Plain);
        assert_eq!(classify("-"), Transport::Stdio);
    }

    #[test]
    fn derives_pte_sibling_paths() {
        assert_eq!(derive_pte_sibling("trace.stf"), PathBuf::from("trace.stf-pte"));
        assert_eq!(derive_pte_sibling("trace.stf.gz"), PathBuf::from("trace.stf-pte.gz"));
        assert_eq!(derive_pte_sibling("trace.stf.xz"), PathBuf::from("trace.stf-pte.xz"));
        assert_eq!(derive_pte_sibling("trace.zstf"), PathBuf::from("trace-pte.zstf"));
    }

    #[test]
    fn single_threaded_env_accepts_only_documented_values() {
        std::env::set_var("STF_SINGLE_THREADED", "true");
        assert!(single_threaded_from_env().unwrap());
        std::env::set_var("STF_SINGLE_THREADED", "0");
        assert!(!single_threaded_from_env().unwrap());
        std::env::set_var("STF_SINGLE_THREADED", "yes");
        assert!(single_threaded_from_env().is_err());
        std::env::remove_var("STF_SINGLE_THREADED");
        assert!(!single_threaded_from_env().unwrap());
    }

    #[test]
    fn open_guard_registers_and_deregisters() {
        let mut tracked = HashSet::new();
        let path = PathBuf::from("/tmp/stf-stream-test-guard.stf");
        tracked.insert(path.clone());
        {
            let _guard = OpenGuard::register(&path);
            assert_eq!(registered_count(&tracked), 1);
        }
        assert_eq!(registered_count(&tracked), 0);
    }
}
