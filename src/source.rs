// src/source.rs - Line sources for job streaming
use async_stream::try_stream;
use futures_core::Stream;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::job::JobSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
enum Origin {
    File(PathBuf),
    Text(String),
}

/// A line-oriented instruction source with its line count computed up front.
#[derive(Debug, Clone)]
pub struct InstructionSource {
    origin: Origin,
    total_lines: u64,
}

impl InstructionSource {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let total_lines = count_file_lines(&path).await?;
        tracing::debug!("{} has {} lines", path.display(), total_lines);
        Ok(Self { origin: Origin::File(path), total_lines })
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut counter = LineCounter::default();
        counter.feed(text.as_bytes());
        Self { origin: Origin::Text(text), total_lines: counter.finish() }
    }

    pub async fn open(source: &JobSource) -> Result<Self, SourceError> {
        match source {
            JobSource::Path(path) => Self::from_path(path).await,
            JobSource::Text(text) => Ok(Self::from_text(text.clone())),
        }
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Stream the lines without their terminators, splitting on the same
    /// separators `total_lines` counts. Files are read lazily and decoded
    /// lossily, so a stray Latin-1 byte in a comment does not end the job.
    pub fn lines(self) -> impl Stream<Item = Result<String, SourceError>> + Send + 'static {
        try_stream! {
            let mut splitter = LineSplitter::default();
            match self.origin {
                Origin::Text(text) => {
                    for line in splitter.feed(text.as_bytes()) {
                        yield line;
                    }
                }
                Origin::File(path) => {
                    let io_err = |source| SourceError::Io { path: path.clone(), source };
                    let mut file = tokio::fs::File::open(&path).await.map_err(io_err)?;
                    let mut chunk = vec![0u8; 64 * 1024];
                    loop {
                        let n = file.read(&mut chunk).await.map_err(io_err)?;
                        if n == 0 {
                            break;
                        }
                        for line in splitter.feed(&chunk[..n]) {
                            yield line;
                        }
                    }
                }
            }
            if let Some(line) = splitter.finish() {
                yield line;
            }
        }
    }
}

async fn count_file_lines(path: &Path) -> Result<u64, SourceError> {
    let io_err = |source| SourceError::Io { path: path.to_path_buf(), source };
    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let mut counter = LineCounter::default();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        counter.feed(&chunk[..n]);
    }
    Ok(counter.finish())
}

/// What one byte means for line splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Content,
    /// End of line. `strip` lead bytes of a multi-byte separator were
    /// already taken as content and belong to the separator.
    Separator { strip: usize },
    /// The `\n` of a `\r\n` pair.
    Ignored,
}

/// Recognizes `\r\n`, `\n`, `\r`, U+0085, U+2028 and U+2029 over bytes fed
/// in arbitrary chunks.
#[derive(Debug, Default)]
struct SeparatorScanner {
    prev: [u8; 2],
    after_cr: bool,
}

impl SeparatorScanner {
    fn scan(&mut self, b: u8) -> Scan {
        let was_cr = std::mem::take(&mut self.after_cr);
        let scan = match b {
            b'\n' if was_cr => Scan::Ignored,
            b'\n' => Scan::Separator { strip: 0 },
            b'\r' => {
                self.after_cr = true;
                Scan::Separator { strip: 0 }
            }
            0x85 if self.prev[1] == 0xC2 => Scan::Separator { strip: 1 },
            0xA8 | 0xA9 if self.prev == [0xE2, 0x80] => Scan::Separator { strip: 2 },
            _ => Scan::Content,
        };
        self.prev = [self.prev[1], b];
        scan
    }
}

/// Counts lines; a trailing unterminated line counts as one more.
#[derive(Debug, Default)]
pub struct LineCounter {
    scanner: SeparatorScanner,
    lines: u64,
    open: bool,
}

impl LineCounter {
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match self.scanner.scan(b) {
                Scan::Content => self.open = true,
                Scan::Separator { .. } => {
                    self.lines += 1;
                    self.open = false;
                }
                Scan::Ignored => {}
            }
        }
    }

    pub fn finish(&self) -> u64 {
        self.lines + u64::from(self.open)
    }
}

/// Splits bytes into lines with the same rules as [`LineCounter`].
#[derive(Debug, Default)]
struct LineSplitter {
    scanner: SeparatorScanner,
    line: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match self.scanner.scan(b) {
                Scan::Content => self.line.push(b),
                Scan::Separator { strip } => {
                    let keep = self.line.len().saturating_sub(strip);
                    self.line.truncate(keep);
                    lines.push(decode(&std::mem::take(&mut self.line)));
                }
                Scan::Ignored => {}
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.line.is_empty() {
            return None;
        }
        Some(decode(&std::mem::take(&mut self.line)))
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
