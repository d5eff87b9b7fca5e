//! In-process ring buffer of formatted log lines.
//!
//! [`LogBuffer`] implements [`MakeWriter`], so it plugs into a second
//! `tracing_subscriber::fmt` layer next to the console one. Each event is
//! written through a fresh [`LogBufferWriter`], which hands its complete
//! lines to the ring when dropped.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::fmt::MakeWriter;

/// Shared, bounded buffer of the most recent log lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// The last `n` lines, oldest first, optionally only those containing
    /// `needle`.
    pub fn tail(&self, n: usize, needle: Option<&str>) -> Vec<String> {
        let lines = self.lock();
        let mut out: Vec<String> = lines
            .iter()
            .rev()
            .filter(|line| needle.is_none_or(|needle| line.contains(needle)))
            .take(n)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-event writer handed out by [`LogBuffer`].
pub struct LogBufferWriter {
    buf: Vec<u8>,
    target: LogBuffer,
}

impl io::Write for LogBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogBufferWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.target.push(line);
        }
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferWriter {
            buf: Vec::new(),
            target: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_ring_evicts_oldest() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.tail(10, None), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.tail(1, None), vec!["line 4"]);
    }

    #[test]
    fn test_tail_filters_by_needle() {
        let buffer = LogBuffer::new(10);
        buffer.push("poll 18/HIRIPRO-01/datos ok");
        buffer.push("poll 18/HIRIPRO-02/datos ok");
        buffer.push("poll 18/HIRIPRO-01/datos empty");

        let lines = buffer.tail(10, Some("HIRIPRO-01"));
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("empty"));
        assert!(buffer.tail(10, Some("nothing")).is_empty());
    }

    #[test]
    fn test_writer_splits_lines_on_drop() {
        let buffer = LogBuffer::new(10);
        {
            let mut writer = buffer.make_writer();
            writer.write_all(b"first\nsec").unwrap();
            writer.write_all(b"ond\n\n").unwrap();
            assert!(buffer.is_empty());
        }
        assert_eq!(buffer.tail(10, None), vec!["first", "second"]);
    }

    #[test]
    fn test_captures_tracing_events() {
        let buffer = LogBuffer::new(10);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(buffer.clone())
            .with_ansi(false);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("collector started for 18/HIRIPRO-01/datos");
        });

        let lines = buffer.tail(10, Some("collector started"));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("INFO"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = LogBuffer::new(0);
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.tail(5, None), vec!["b"]);
    }
}
