use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy)]
enum Retain {
    Head,
    Tail,
}

#[derive(Debug)]
struct StreamBuffer {
    data: VecDeque<u8>,
    cap: usize,
    retain: Retain,
    truncated: bool,
}

impl StreamBuffer {
    fn new(cap: usize, retain: Retain) -> Self {
        Self {
            data: VecDeque::new(),
            cap,
            retain,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        match self.retain {
            Retain::Head => {
                let remaining = self.cap.saturating_sub(self.data.len());
                let to_copy = remaining.min(bytes.len());
                self.data.extend(&bytes[..to_copy]);
                if to_copy < bytes.len() {
                    self.truncated = true;
                }
            }
            Retain::Tail => {
                self.data.extend(bytes);
                if self.data.len() > self.cap {
                    let excess = self.data.len() - self.cap;
                    self.data.drain(..excess);
                    self.truncated = true;
                }
            }
        }
    }

    fn to_vec(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }
}

/// Both streams interleaved in arrival order, as a sliding window over
/// absolute byte offsets.
#[derive(Debug)]
struct OutputLog {
    data: VecDeque<u8>,
    base: u64,
    cap: usize,
}

impl OutputLog {
    fn push(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
        if self.data.len() > self.cap {
            let excess = self.data.len() - self.cap;
            self.data.drain(..excess);
            self.base += excess as u64;
        }
    }

    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub start: u64,
    pub offset: u64,
    pub dropped: u64,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct OutputSnapshot {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(Debug)]
struct Inner {
    stdout: StreamBuffer,
    stdout_limit: usize,
    stderr: StreamBuffer,
    log: OutputLog,
    frozen: bool,
}

/// Output of one process, shared between the stream readers (writers) and
/// any number of monitors. Each append happens under one write lock so a
/// reader never sees half a chunk.
#[derive(Debug)]
pub struct OutputCapture {
    inner: RwLock<Inner>,
}

impl OutputCapture {
    pub fn new(max_output_bytes: usize, max_log_bytes: usize) -> Self {
        Self::with_parse_limit(max_output_bytes, max_output_bytes, max_log_bytes)
    }

    /// Holds up to `max_parse_bytes` of stdout so a document larger than
    /// the returned window can still be parsed whole. Snapshots only ever
    /// expose the first `max_output_bytes`.
    pub fn with_parse_limit(
        max_output_bytes: usize,
        max_parse_bytes: usize,
        max_log_bytes: usize,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                stdout: StreamBuffer::new(max_parse_bytes.max(max_output_bytes), Retain::Head),
                stdout_limit: max_output_bytes,
                stderr: StreamBuffer::new(max_output_bytes, Retain::Tail),
                log: OutputLog {
                    data: VecDeque::new(),
                    base: 0,
                    cap: max_log_bytes,
                },
                frozen: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends are dropped once the capture is frozen.
    pub fn append(&self, stream: Stream, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.write();
        if inner.frozen {
            return;
        }
        match stream {
            Stream::Stdout => inner.stdout.push(bytes),
            Stream::Stderr => inner.stderr.push(bytes),
        }
        inner.log.push(bytes);
    }

    pub fn freeze(&self) {
        self.write().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.read().frozen
    }

    /// Absolute offset one past the last retained byte.
    pub fn offset(&self) -> u64 {
        self.read().log.end()
    }

    /// Output appended at or after `since`. The chunk starts on a character
    /// boundary and, while the capture is live, stops short of an unfinished
    /// UTF-8 sequence; the returned `offset` is where the next call should
    /// resume.
    pub fn tail(&self, since: u64) -> LogChunk {
        let inner = self.read();
        let log = &inner.log;
        let end = log.end();
        let dropped = log.base.saturating_sub(since);
        let mut from = (since.clamp(log.base, end) - log.base) as usize;
        while log.data.get(from).is_some_and(|byte| is_continuation(*byte)) {
            from += 1;
        }
        let start = log.base + from as u64;
        let mut bytes: Vec<u8> = log.data.range(from..).copied().collect();
        if !inner.frozen {
            bytes.truncate(complete_utf8_len(&bytes));
        }
        LogChunk {
            start,
            offset: start + bytes.len() as u64,
            dropped,
            data: String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    /// Last `lines` lines of the retained log, as a chunk ending at the
    /// current offset.
    pub fn tail_lines(&self, lines: usize) -> LogChunk {
        let inner = self.read();
        let log = &inner.log;
        let bytes: Vec<u8> = log.data.iter().copied().collect();
        let from = last_lines_start(&bytes, lines);
        LogChunk {
            start: log.base + from as u64,
            offset: log.end(),
            dropped: 0,
            data: String::from_utf8_lossy(&bytes[from..]).into_owned(),
        }
    }

    /// Last `lines` lines of stderr, or of the combined log when stderr is empty.
    pub fn diagnostic_tail(&self, lines: usize) -> Option<String> {
        let inner = self.read();
        let source = if inner.stderr.data.is_empty() {
            &inner.log.data
        } else {
            &inner.stderr.data
        };
        let bytes: Vec<u8> = source.iter().copied().collect();
        let tail = last_lines(&String::from_utf8_lossy(&bytes), lines);
        (!tail.trim().is_empty()).then_some(tail)
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        let inner = self.read();
        let held = inner.stdout.data.len();
        OutputSnapshot {
            stdout: inner.stdout.data.range(..held.min(inner.stdout_limit)).copied().collect(),
            stderr: inner.stderr.to_vec(),
            stdout_truncated: inner.stdout.truncated || held > inner.stdout_limit,
            stderr_truncated: inner.stderr.truncated,
        }
    }

    /// Everything held from stdout for parsing, and whether it hit the
    /// parse limit.
    pub fn parse_source(&self) -> (Vec<u8>, bool) {
        let inner = self.read();
        (inner.stdout.to_vec(), inner.stdout.truncated)
    }
}

pub(crate) fn last_lines(text: &str, lines: usize) -> String {
    let start = last_lines_start(text.as_bytes(), lines);
    String::from_utf8_lossy(&text.as_bytes()[start..]).into_owned()
}

/// Index where the last `lines` lines of `bytes` begin. A trailing newline
/// does not open a new line.
fn last_lines_start(bytes: &[u8], lines: usize) -> usize {
    if lines == 0 {
        return bytes.len();
    }
    let body = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    body.iter()
        .enumerate()
        .rev()
        .filter(|(_, byte)| **byte == b'\n')
        .nth(lines - 1)
        .map(|(idx, _)| idx + 1)
        .unwrap_or(0)
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        if is_continuation(byte) {
            continue;
        }
        let width = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return len,
        };
        return if back < width { len - back } else { len };
    }
    len
}
