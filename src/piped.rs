//! Piped child-process trace sources/sinks (§4.2's "pipe" transport),
//! grounded on `trailofbits-mttn`'s `Command::new(...).args(...).spawn()`
//! tracee-launch pattern — the pack's only child-process precedent.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use log::debug;

use crate::error::{Result, StfError};

fn io_err(e: io::Error) -> StfError {
    StfError::Io(e)
}

/// A trace read through a decompressing/preprocessing child process, e.g.
/// `gzip -dc trace.stf.gz` or `sh trace.stf.sh`. The child's stdout is the
/// byte source; the child is reaped on drop.
pub struct PipedReader {
    child: Child,
    stdout: ChildStdout,
}

impl PipedReader {
    /// Spawns `program arg... [extra_arg]` with stdout piped back to the
    /// caller. `extra_arg`, when given, is appended last (the path for
    /// `gzip -dc <path>`/`xz -dc <path>`, or omitted for `sh <path>`
    /// where the path is already in `args`).
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(io_err)?;
        debug!("spawned '{program} {}' as pid {} for reading", args.join(" "), child.id());
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok(Self { child, stdout })
    }

    pub fn gzip_decompress(path: &str) -> Result<Self> {
        Self::spawn("gzip", &["-dc", path])
    }

    pub fn xz_decompress(path: &str) -> Result<Self> {
        Self::spawn("xz", &["-dc", path])
    }

    /// Runs `path` as a shell script that itself produces an STF trace on
    /// stdout (the `.sh`-suffixed transport named in SPEC_FULL.md).
    pub fn shell_script(path: &str) -> Result<Self> {
        Self::spawn("sh", &[path])
    }
}

impl Read for PipedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for PipedReader {
    fn drop(&mut self) {
        match self.child.wait() {
            Ok(status) if !status.success() => {
                debug!("piped reader child pid {} exited with {status}", self.child.id());
            }
            Err(e) => debug!("failed to reap piped reader child: {e}"),
            _ => {}
        }
    }
}

/// A trace written through a compressing child process, e.g.
/// `gzip -c > trace.stf.gz`. The child's stdin is the byte sink.
pub struct PipedWriter {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl PipedWriter {
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(io_err)?;
        debug!("spawned '{program} {}' as pid {} for writing", args.join(" "), child.id());
        let stdin = child.stdin.take();
        Ok(Self { child, stdin })
    }

    pub fn gzip_compress(path: &str) -> Result<Self> {
        let file = std::fs::File::create(path).map_err(io_err)?;
        Self::spawn_into("gzip", &["-c"], file)
    }

    fn spawn_into(program: &str, args: &[&str], out: std::fs::File) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(io_err)?;
        debug!("spawned '{program} {}' as pid {} for writing", args.join(" "), child.id());
        let stdin = child.stdin.take();
        Ok(Self { child, stdin })
    }

    /// Closes stdin (signalling EOF to the child) and waits for it to
    /// exit, returning an error if it exited non-zero.
    pub fn finish(mut self) -> Result<()> {
        self.stdin.take();
        let status = self.child.wait().map_err(io_err)?;
        if !status.success() {
            return Err(StfError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("piped writer child exited with {status}"),
            )));
        }
        Ok(())
    }
}

impl Write for PipedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdin
            .as_mut()
            .expect("write after finish")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin
            .as_mut()
            .expect("write after finish")
            .flush()
    }
}

impl Drop for PipedWriter {
    fn drop(&mut self) {
        self.stdin.take();
        if let Err(e) = self.child.wait() {
            debug!("failed to reap piped writer child: {e}");
        }
    }
}
