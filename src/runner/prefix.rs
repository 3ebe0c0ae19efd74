//! Line-prefixing writer for captured command output.

use std::io::{self, Write};
use std::path::Path;

/// Writes `prefix` in front of every line that passes through to `inner`.
///
/// The writer remembers whether the last byte it saw was a line terminator, so output
/// that arrives in fragments (the normal case when copying from a pipe) is prefixed once
/// per line and never mid-line. A trailing partial line gets its prefix when it starts,
/// not when it ends.
pub struct PrefixWriter<W> {
    inner: W,
    prefix: Vec<u8>,
    at_line_start: bool,
}

impl<W: Write> PrefixWriter<W> {
    pub fn new(inner: W, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into().into_bytes(),
            at_line_start: true,
        }
    }

    /// Prefix lines with `[name] `, where `name` is the program's file name.
    pub fn for_program(inner: W, program: &str) -> Self {
        Self::new(inner, format!("[{}] ", program_name(program)))
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        if self.at_line_start {
            self.inner.write_all(&self.prefix)?;
            self.at_line_start = false;
        }
        self.inner.write_all(line)?;
        if line.ends_with(b"\n") {
            self.at_line_start = true;
        }
        Ok(())
    }
}

impl<W: Write> Write for PrefixWriter<W> {
    /// Consumes whole lines. An error from `inner` is only returned when nothing was
    /// consumed yet; otherwise the count of lines already passed through is reported.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut consumed = 0;
        while consumed < buf.len() {
            let rest = &buf[consumed..];
            let len = rest
                .iter()
                .position(|&b| b == b'\n')
                .map_or(rest.len(), |newline| newline + 1);
            match self.write_line(&rest[..len]) {
                Ok(()) => consumed += len,
                Err(err) if consumed == 0 => return Err(err),
                Err(_) => break,
            }
        }
        Ok(consumed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `/usr/bin/pip3` -> `pip3`; anything without a file name is used verbatim.
pub fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}
