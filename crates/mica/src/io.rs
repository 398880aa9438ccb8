//! Output abstraction for the `print` native.
//!
//! Program output never goes to stdout directly; it flows through a
//! [`PrintWriter`] supplied by the host, so embedders can capture or
//! discard it.

use std::io::{self, Write as _};

/// Handles output produced by `print`.
///
/// `stdout_write` receives one formatted argument at a time, with no
/// separators; spaces and the trailing newline arrive via `stdout_push`.
pub trait PrintWriter {
    fn stdout_write(&mut self, output: &str);

    fn stdout_push(&mut self, end: char);
}

/// Default writer: straight to stdout, flushed on newline.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: &str) {
        let _ = io::stdout().write_all(output.as_bytes());
    }

    fn stdout_push(&mut self, end: char) {
        let mut buf = [0u8; 4];
        let _ = io::stdout().write_all(end.encode_utf8(&mut buf).as_bytes());
        if end == '\n' {
            let _ = io::stdout().flush();
        }
    }
}

/// Collects all output into a string. Useful for tests and for hosts that
/// want program output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: &str) {
        self.0.push_str(output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: &str) {}

    fn stdout_push(&mut self, _end: char) {}
}
