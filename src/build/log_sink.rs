//! Append-only console capture for one build.
//!
//! The supervisor is the only writer; it appends lines without seeking.
//! Readers either tail the last N lines or read incrementally from a byte
//! offset. Nothing is ever rewritten, so successive polls see a growing view.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::errors::BuildError;

const TAIL_CHUNK: u64 = 8 * 1024;

// CSI sequences (colours, cursor moves) and OSC sequences (titles, links)
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").unwrap()
});

/// Remove ANSI colour and cursor escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// A chunk returned by [`LogSink::read_since`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogChunk {
    pub content: String,
    /// Byte offset to pass on the next call.
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_build(logs_dir: &Path, build_id: &str) -> Self {
        Self::new(logs_dir.join(format!("{}.log", build_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the stream for appending, creating it if needed.
    pub async fn writer(&self) -> Result<LogWriter, BuildError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BuildError::storage(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| BuildError::storage(&self.path, e))?;
        Ok(LogWriter {
            file,
            path: self.path.clone(),
        })
    }

    fn open_for_read(&self) -> Result<Option<(std::fs::File, u64)>, BuildError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BuildError::storage(&self.path, e)),
        };
        let len = file
            .metadata()
            .map_err(|e| BuildError::storage(&self.path, e))?
            .len();
        Ok(Some((file, len)))
    }

    /// Current length of the stream in bytes (0 if nothing was written yet).
    pub fn size(&self) -> Result<u64, BuildError> {
        Ok(self.open_for_read()?.map(|(_, len)| len).unwrap_or(0))
    }

    /// Read backwards from the end until `enough` says the buffer suffices.
    fn read_tail_bytes(&self, enough: impl Fn(&[u8]) -> bool) -> Result<Vec<u8>, BuildError> {
        let Some((mut file, len)) = self.open_for_read()? else {
            return Ok(Vec::new());
        };
        let mut pos = len;
        let mut buf: Vec<u8> = Vec::new();
        while pos > 0 && !enough(&buf) {
            let step = TAIL_CHUNK.min(pos);
            pos -= step;
            let mut chunk = vec![0u8; step as usize];
            file.seek(SeekFrom::Start(pos))
                .and_then(|_| file.read_exact(&mut chunk))
                .map_err(|e| BuildError::storage(&self.path, e))?;
            chunk.extend_from_slice(&buf);
            buf = chunk;
        }
        Ok(buf)
    }

    /// The last `max_lines` lines, oldest first, with ANSI codes stripped.
    pub fn tail(&self, max_lines: usize) -> Result<Vec<String>, BuildError> {
        if max_lines == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.read_tail_bytes(|buf| {
            buf.iter().filter(|b| **b == b'\n').count() > max_lines
        })?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].iter().map(|line| strip_ansi(line)).collect())
    }

    /// The last `max_chars` characters of the stream, ANSI codes stripped.
    pub fn tail_chars(&self, max_chars: usize) -> Result<String, BuildError> {
        // Four bytes per char covers any UTF-8 sequence; escapes get extra slack.
        let want = (max_chars as u64).saturating_mul(4).saturating_add(256);
        let bytes = self.read_tail_bytes(|buf| buf.len() as u64 >= want)?;
        let text = strip_ansi(&String::from_utf8_lossy(&bytes));
        Ok(super::classifier::tail_chars(&text, max_chars).to_string())
    }

    /// Complete lines appended after `offset`, plus the offset to resume from.
    ///
    /// A trailing partial line is left for the next call.
    pub fn read_since(&self, offset: u64) -> Result<LogChunk, BuildError> {
        self.read_lines_since(offset, usize::MAX)
    }

    /// Like [`read_since`](Self::read_since), but stops after `max_lines`
    /// lines. The returned offset points just past the last line returned,
    /// so the next call resumes where this one stopped.
    pub fn read_lines_since(&self, offset: u64, max_lines: usize) -> Result<LogChunk, BuildError> {
        let unchanged = || LogChunk {
            content: String::new(),
            offset,
        };
        let Some((mut file, len)) = self.open_for_read()? else {
            return Ok(unchanged());
        };
        if len <= offset || max_lines == 0 {
            return Ok(unchanged());
        }
        let mut bytes = Vec::with_capacity((len - offset) as usize);
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.take(len - offset).read_to_end(&mut bytes))
            .map_err(|e| BuildError::storage(&self.path, e))?;

        let complete = bytes
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .take(max_lines)
            .last()
            .map(|(idx, _)| idx + 1)
            .unwrap_or(0);
        bytes.truncate(complete);
        Ok(LogChunk {
            content: strip_ansi(&String::from_utf8_lossy(&bytes)),
            offset: offset + complete as u64,
        })
    }
}

/// Append handle held by the supervisor's output pump.
pub struct LogWriter {
    file: tokio::fs::File,
    path: PathBuf,
}

impl LogWriter {
    /// Append one line. Flushed immediately so tailing readers see it.
    pub async fn append_line(&mut self, line: &str) -> Result<(), BuildError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.file
            .write_all(&bytes)
            .await
            .map_err(|e| BuildError::storage(&self.path, e))?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), BuildError> {
        self.file
            .flush()
            .await
            .map_err(|e| BuildError::storage(&self.path, e))
    }
}
