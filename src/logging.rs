//! Line-prefixing writers for phase output

use std::io::{self, Write};
use tracing::debug;

/// Prefixes every complete line with `[<name>] ` before passing it on.
///
/// Partial lines are held until a newline arrives or the writer is flushed.
/// A trailing carriage return is dropped from each line.
pub struct PrefixWriter<W: Write> {
    prefix: String,
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> PrefixWriter<W> {
    pub fn new(name: &str, inner: W) -> Self {
        Self {
            prefix: format!("[{}] ", name),
            inner,
            buf: Vec::new(),
        }
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.inner)
    }

    fn emit(&mut self, line: &[u8]) -> io::Result<()> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        self.inner.write_all(self.prefix.as_bytes())?;
        self.inner.write_all(line)?;
        self.inner.write_all(b"\n")
    }
}

impl<W: Write> Write for PrefixWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1])?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest)?;
        }
        self.inner.flush()
    }
}

/// Sends every line written to it to the `debug` log
#[derive(Debug, Default)]
pub struct TraceWriter {
    buf: Vec<u8>,
}

impl TraceWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Write for TraceWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            debug!("{}", String::from_utf8_lossy(&line[..line.len() - 1]));
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            debug!("{}", String::from_utf8_lossy(&rest));
        }
        Ok(())
    }
}

/// Where phase transcripts go
pub enum PhaseOutput {
    /// Print to the terminal
    Stdout,
    /// Emit at `debug` level
    Trace,
}

impl PhaseOutput {
    pub fn for_verbosity(verbose: bool) -> Self {
        if verbose {
            PhaseOutput::Stdout
        } else {
            PhaseOutput::Trace
        }
    }

    /// Writer for one stream of `phase`
    pub fn writer(&self, phase: &str) -> Box<dyn Write + Send> {
        match self {
            PhaseOutput::Stdout => Box::new(PrefixWriter::new(phase, io::stdout())),
            PhaseOutput::Trace => Box::new(PrefixWriter::new(phase, TraceWriter::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_complete_lines() {
        let mut w = PrefixWriter::new("detector", Vec::new());
        w.write_all(b"one\ntwo\n").unwrap();
        assert_eq!(w.into_inner().unwrap(), b"[detector] one\n[detector] two\n");
    }

    #[test]
    fn buffers_partial_lines() {
        let mut w = PrefixWriter::new("builder", Vec::new());
        w.write_all(b"hel").unwrap();
        w.write_all(b"lo\nwor").unwrap();
        assert_eq!(w.inner, b"[builder] hello\n");
        w.flush().unwrap();
        assert_eq!(w.inner, b"[builder] hello\n[builder] wor\n");
    }

    #[test]
    fn drops_carriage_returns() {
        let mut w = PrefixWriter::new("exporter", Vec::new());
        w.write_all(b"windows\r\n").unwrap();
        assert_eq!(w.into_inner().unwrap(), b"[exporter] windows\n");
    }

    #[test]
    fn trace_writer_accepts_everything() {
        let mut w = TraceWriter::new();
        assert_eq!(w.write(b"line\npartial").unwrap(), 12);
        w.flush().unwrap();
        assert!(w.buf.is_empty());
    }
}
