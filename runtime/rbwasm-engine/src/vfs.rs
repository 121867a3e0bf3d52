//! Filesystem-level write capture.
//!
//! A second capture point besides the syscall shim, kept for callers that
//! inspect the filesystem adapter directly rather than the import table.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::shim::{FdKind, OutputSink};

/// Minimal in-memory descriptor-keyed store. Only the write path matters to
/// the host; everything else about the guest's filesystem is out of scope.
#[derive(Debug, Default)]
pub struct VirtualFs {
    streams: BTreeMap<i32, Vec<u8>>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the descriptor's buffer, returning the byte count written.
    pub fn write_sync(&mut self, fd: i32, bytes: &[u8]) -> usize {
        self.streams.entry(fd).or_default().extend_from_slice(bytes);
        bytes.len()
    }

    pub fn contents(&self, fd: i32) -> &[u8] {
        self.streams.get(&fd).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Wraps a filesystem's write path: stdout/stderr writes are decoded and
/// forwarded to the sink, then every write (standard stream or not) is
/// delegated to the inner filesystem unchanged.
pub struct CaptureFs {
    inner: VirtualFs,
    sink: Arc<dyn OutputSink>,
}

impl CaptureFs {
    pub fn new(inner: VirtualFs, sink: Arc<dyn OutputSink>) -> Self {
        Self { inner, sink }
    }

    pub fn write_sync(&mut self, fd: i32, bytes: &[u8]) -> usize {
        if let FdKind::StandardStream(label) = FdKind::classify(fd) {
            self.sink.print(&String::from_utf8_lossy(bytes), label);
        }
        self.inner.write_sync(fd, bytes)
    }

    pub fn inner(&self) -> &VirtualFs {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::shim::StreamLabel;

    #[derive(Default)]
    struct SinkSpy {
        calls: Mutex<Vec<(String, StreamLabel)>>,
    }

    impl OutputSink for SinkSpy {
        fn print(&self, text: &str, stream: StreamLabel) {
            self.calls.lock().unwrap().push((text.to_string(), stream));
        }
    }

    #[test]
    fn stdout_writes_are_captured_and_delegated() {
        let sink = Arc::new(SinkSpy::default());
        let mut fs = CaptureFs::new(VirtualFs::new(), sink.clone());

        assert_eq!(fs.write_sync(1, b"hi"), 2);

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("hi".to_string(), StreamLabel::Stdout)]);
        // Delegation still happened: the inner fs saw the bytes too.
        assert_eq!(fs.inner().contents(1), b"hi");
    }

    #[test]
    fn other_descriptors_pass_through_silently() {
        let sink = Arc::new(SinkSpy::default());
        let mut fs = CaptureFs::new(VirtualFs::new(), sink.clone());

        fs.write_sync(7, b"scratch");

        assert!(sink.calls.lock().unwrap().is_empty());
        assert_eq!(fs.inner().contents(7), b"scratch");
    }

    #[test]
    fn interleaved_streams_keep_their_labels() {
        let sink = Arc::new(SinkSpy::default());
        let mut fs = CaptureFs::new(VirtualFs::new(), sink.clone());

        fs.write_sync(1, b"out");
        fs.write_sync(2, b"err");
        fs.write_sync(1, b"more");

        let calls = sink.calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[
                ("out".to_string(), StreamLabel::Stdout),
                ("err".to_string(), StreamLabel::Stderr),
                ("more".to_string(), StreamLabel::Stdout),
            ]
        );
    }
}
