//! Abstract append-only sink (§4.1 C8). File I/O primitives are named
//! out of scope in §1; this is the narrow trait the rest of the
//! pipeline is written against, plus a straightforward concrete
//! implementation over anything that is `std::io::Write`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// A sink a `Session` can append trace bytes to. One instance per
/// session; `File` mode and `IpcStream` mode both implement this, the
/// latter over whatever transport the IPC layer handed the pipeline
/// (out of scope here, see §1).
pub trait StreamWriter: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Wraps any `Write` implementor (a file, a Unix socket, an in-memory
/// buffer for tests) as a `StreamWriter`.
pub struct GenericStreamWriter<W: Write + Send> {
    inner: W,
}

impl<W: Write + Send> GenericStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write + Send> StreamWriter for GenericStreamWriter<W> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Opens (truncating) a file-mode sink at `path`.
pub fn file_sink(path: impl AsRef<Path>) -> io::Result<GenericStreamWriter<BufWriter<File>>> {
    let file = File::create(path)?;
    Ok(GenericStreamWriter::new(BufWriter::new(file)))
}

/// In-memory sink for tests and for the CLI's `--inspect` round trip:
/// captures everything written so it can be parsed back without
/// touching the filesystem.
#[derive(Default)]
pub struct MemoryStreamWriter {
    buf: Mutex<Vec<u8>>,
}

impl MemoryStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }
}

impl StreamWriter for MemoryStreamWriter {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_accumulates_writes() {
        let mut sink = MemoryStreamWriter::new();
        sink.write_all(b"hello").unwrap();
        sink.write_all(b" world").unwrap();
        assert_eq!(sink.snapshot(), b"hello world");
    }

    #[test]
    fn file_sink_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.nettrace");
        {
            let mut sink = file_sink(&path).unwrap();
            sink.write_all(b"trace-bytes").unwrap();
            sink.flush().unwrap();
        }
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"trace-bytes");
    }
}
