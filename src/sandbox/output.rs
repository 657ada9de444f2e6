//! Bounded stdout/stderr capture shared between a runner and its readers.

use std::sync::{Arc, Mutex, PoisonError};

/// Which stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

#[derive(Debug, Default)]
struct Buffer {
    text: String,
    dropped: usize,
}

impl Buffer {
    fn append(&mut self, chunk: &str, limit: usize) {
        let room = limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let cut = floor_char_boundary(chunk, room);
        self.text.push_str(&chunk[..cut]);
        self.dropped += chunk.len() - cut;
    }

    fn render(&self) -> String {
        if self.dropped == 0 {
            return self.text.clone();
        }
        let mut rendered = self.text.clone();
        if !rendered.is_empty() && !rendered.ends_with('\n') {
            rendered.push('\n');
        }
        rendered.push_str(&truncation_marker(self.dropped));
        rendered
    }
}

#[derive(Debug, Default)]
struct Inner {
    stdout: Buffer,
    stderr: Buffer,
}

/// Cloneable handle to a pair of size-bounded output buffers.
///
/// Each stream keeps at most `limit` bytes. Anything beyond that is counted
/// and reported through a truncation marker when rendered.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    limit: usize,
    inner: Arc<Mutex<Inner>>,
}

/// Marker appended to rendered output when bytes were dropped.
#[must_use]
pub fn truncation_marker(dropped: usize) -> String {
    format!("[output truncated: {dropped} bytes dropped]")
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

impl OutputCapture {
    /// Create an empty capture keeping at most `limit` bytes per stream.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Append a raw chunk to `stream`.
    pub fn append(&self, stream: Stream, chunk: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match stream {
            Stream::Stdout => inner.stdout.append(chunk, self.limit),
            Stream::Stderr => inner.stderr.append(chunk, self.limit),
        }
    }

    /// Append one line, adding the trailing newline.
    pub fn push_line(&self, stream: Stream, line: &str) {
        let mut chunk = String::with_capacity(line.len() + 1);
        chunk.push_str(line);
        chunk.push('\n');
        self.append(stream, &chunk);
    }

    /// Replace stdout with a fresh snapshot, as read from a terminal pane.
    pub fn replace_stdout(&self, snapshot: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.stdout = Buffer::default();
        inner.stdout.append(snapshot, self.limit);
    }

    /// Rendered stdout, including the truncation marker when bytes were dropped.
    #[must_use]
    pub fn stdout(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.stdout.render()
    }

    /// Rendered stderr, including the truncation marker when bytes were dropped.
    #[must_use]
    pub fn stderr(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.stderr.render()
    }

    /// Whether either stream dropped bytes.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.stdout.dropped > 0 || inner.stderr.dropped > 0
    }

    /// Stdout followed by stderr, rendered as one text block.
    #[must_use]
    pub fn combined(&self) -> String {
        let stdout = self.stdout();
        let stderr = self.stderr();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout,
            (true, false) => stderr,
            (false, false) => {
                let mut text = stdout;
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&stderr);
                text
            }
        }
    }

    /// The last `max` non-empty lines of [`Self::combined`].
    #[must_use]
    pub fn tail_lines(&self, max: usize) -> Vec<String> {
        let combined = self.combined();
        let lines: Vec<&str> = combined.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(max);
        lines.into_iter().skip(skip).map(str::to_owned).collect()
    }
}
