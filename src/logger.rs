use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::info;

/// Concurrent-safe capture of child stderr. The buffer is drained on
/// read so recent output can be attached to at most one failure
/// message.
#[derive(Clone, Default)]
pub struct BufferedLogSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl BufferedLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    pub fn reset(&self) {
        self.buf.lock().clear();
    }

    pub fn write(&self, data: &[u8]) {
        self.buf.lock().extend_from_slice(data);
    }

    /// Drain the buffer into a string.
    pub fn read_all(&self) -> String {
        let drained = std::mem::take(&mut *self.buf.lock());
        String::from_utf8_lossy(&drained).into_owned()
    }
}

/// Stream a child's stdout into the log, one line at a time, tagged
/// with the owning host.
pub fn stream_stdout(host: String, stdout: ChildStdout) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(host = %host, "{}", line);
        }
    });
}

/// Capture a child's stderr into the buffered sink.
pub fn capture_stderr(sink: BufferedLogSink, mut stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.write(&buf[..n]),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_drain() {
        let sink = BufferedLogSink::new();
        assert!(sink.is_empty());

        sink.write(b"panic: boom\n");
        sink.write(b"goroutine 1\n");
        assert_eq!(sink.len(), 24);

        assert_eq!(sink.read_all(), "panic: boom\ngoroutine 1\n");
        assert!(sink.is_empty());
        assert_eq!(sink.read_all(), "");
    }

    #[test]
    fn test_reset() {
        let sink = BufferedLogSink::new();
        sink.write(b"stale");
        sink.reset();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_clones_share_the_buffer() {
        let sink = BufferedLogSink::new();
        let writer = sink.clone();
        writer.write(b"shared");
        assert_eq!(sink.read_all(), "shared");
    }
}
