//! Named, append-only log channels.
//!
//! Every channel is a plain text file `<dir>/<name>.log`. Writers only ever
//! append; readers pass their own byte offset, so any number of readers can
//! scan a channel while a child process is still writing to it.
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::LogError;

/// Poll interval used by [`LogFollower`] when it reaches end-of-file.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A pattern that matched a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMatch {
    /// The pattern source as it was configured.
    pub pattern: String,
    /// The matching line, trimmed.
    pub line: String,
}

/// An ordered set of case-insensitive regular expressions.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<(String, Regex)>,
}

impl PatternSet {
    /// Compiles every pattern case-insensitively, preserving order.
    pub fn new<I, S>(patterns: I) -> Result<Self, LogError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let source = pattern.as_ref().to_string();
                RegexBuilder::new(&source)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (source.clone(), regex))
                    .map_err(|err| LogError::InvalidPattern {
                        pattern: source,
                        source: err,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    /// Returns the first pattern matching `line`, in configured order.
    pub fn first_match(&self, line: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(line))
            .map(|(source, _)| source.as_str())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Owns the directory holding every log channel of a run.
#[derive(Debug, Clone)]
pub struct LogSink {
    dir: PathBuf,
}

impl LogSink {
    /// Creates a sink rooted at `dir`. Nothing is touched on disk until [`LogSink::setup`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates the log directory.
    pub fn setup(&self) -> Result<(), LogError> {
        fs::create_dir_all(&self.dir).map_err(|source| LogError::Io {
            path: self.dir.display().to_string(),
            source,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing channel `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.log"))
    }

    /// Truncates (or creates) channel `name`.
    ///
    /// Reader offsets held for this channel are stale afterwards and must be reset to 0.
    pub fn init(&self, name: &str) -> Result<PathBuf, LogError> {
        self.setup()?;
        let path = self.path(name);
        File::create(&path).map_err(|source| io_error(&path, source))?;
        debug!("Initialized log channel '{name}' at {}", path.display());
        Ok(path)
    }

    /// Opens channel `name` for appending, creating it if needed.
    pub fn open_append(&self, name: &str) -> Result<File, LogError> {
        self.setup()?;
        let path = self.path(name);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))
    }

    /// Appends a single line to channel `name`.
    pub fn append_line(&self, name: &str, line: &str) -> Result<(), LogError> {
        let mut file = self.open_append(name)?;
        writeln!(file, "{line}").map_err(|source| io_error(&self.path(name), source))
    }

    /// Current end-of-file offset of channel `name`, 0 when it does not exist.
    pub fn end_offset(&self, name: &str) -> u64 {
        fs::metadata(self.path(name))
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    /// Returns the last `n` lines of channel `name` in file order.
    ///
    /// A missing or unreadable file yields an empty list. A torn final line from a
    /// concurrent writer is returned as-is.
    pub fn tail(&self, name: &str, n: usize) -> Vec<String> {
        if n == 0 {
            return Vec::new();
        }

        let file = match File::open(self.path(name)) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        let mut buffer: VecDeque<String> = VecDeque::with_capacity(n);
        for line in RawLines::new(BufReader::new(file)) {
            if buffer.len() == n {
                buffer.pop_front();
            }
            buffer.push_back(line);
        }

        buffer.into_iter().collect()
    }

    /// [`LogSink::tail`] joined with newlines, for error context.
    pub fn tail_string(&self, name: &str, n: usize) -> String {
        self.tail(name, n).join("\n")
    }

    /// Scans channel `name` from `from_offset` to the current end for the first line
    /// matching any of `patterns`.
    ///
    /// Lines are checked in file order and, per line, patterns in configured order.
    /// A missing file is "no match".
    pub fn search(
        &self,
        name: &str,
        patterns: &PatternSet,
        from_offset: u64,
    ) -> Option<LogMatch> {
        let path = self.path(name);
        let mut file = File::open(&path).ok()?;
        if from_offset > 0 {
            file.seek(SeekFrom::Start(from_offset)).ok()?;
        }

        RawLines::new(BufReader::new(file)).find_map(|line| {
            patterns.first_match(&line).map(|pattern| LogMatch {
                pattern: pattern.to_string(),
                line: line.trim().to_string(),
            })
        })
    }

    /// Follows channel `name` starting at `from_offset`, yielding appended lines forever.
    pub fn follow(&self, name: &str, from_offset: u64) -> LogFollower {
        LogFollower {
            path: self.path(name),
            offset: from_offset,
            poll_interval: FOLLOW_POLL_INTERVAL,
            reader: None,
            pending: Vec::new(),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LogError {
    LogError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Iterates over lines without failing on invalid UTF-8 or a missing trailing newline.
struct RawLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> RawLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for RawLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(strip_newline(&self.buf)),
        }
    }
}

fn strip_newline(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    if end > 0 && bytes[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && bytes[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Endless iterator over lines appended to a channel.
///
/// End-of-file means "wait": `next` sleeps for the poll interval and retries, so it
/// only returns once a complete line is available. A channel that shrinks below the
/// current offset (re-initialized) is followed again from the start.
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
    poll_interval: Duration,
    reader: Option<BufReader<File>>,
    pending: Vec<u8>,
}

impl LogFollower {
    /// Overrides the end-of-file poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Offset just past the last line yielded.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn open(&mut self) -> bool {
        if self.reader.is_some() {
            return true;
        }

        let Ok(mut file) = File::open(&self.path) else {
            return false;
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return false;
        }
        self.pending.clear();
        self.reader = Some(BufReader::new(file));
        true
    }

    fn truncated(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.len() < self.offset)
            .unwrap_or(true)
    }
}

impl Iterator for LogFollower {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if !self.open() {
                thread::sleep(self.poll_interval);
                continue;
            }

            let read = match self.reader.as_mut() {
                Some(reader) => reader.read_until(b'\n', &mut self.pending),
                None => continue,
            };

            match read {
                Ok(_) if self.pending.ends_with(b"\n") => {
                    self.offset += self.pending.len() as u64;
                    let line = strip_newline(&self.pending);
                    self.pending.clear();
                    return Some(line);
                }
                Ok(_) => {
                    if self.truncated() {
                        debug!("Log {} was truncated; following from start", self.path.display());
                        self.offset = 0;
                        self.reader = None;
                    }
                    thread::sleep(self.poll_interval);
                }
                Err(_) => {
                    self.reader = None;
                    thread::sleep(self.poll_interval);
                }
            }
        }
    }
}
