use std::io;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::transcript::{read_transcript, turns_from_lines};
use crate::types::ChatTurn;

/// Default chunk size for backward reading: 8KB.
const CHUNK_SIZE: u64 = 8 * 1024;

/// Files smaller than this are read in full even when only the tail is wanted.
pub const TAIL_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// Yields the lines of a file from EOF toward BOF.
///
/// Bytes are pulled in fixed-size chunks from the end; a line spanning
/// several chunks is assembled before it is returned. Empty lines (including
/// the one implied by a trailing newline) are skipped.
pub struct BackwardLineReader {
    file: tokio::fs::File,
    /// Offset of the first byte not yet pulled into `pending`.
    remaining: u64,
    /// Bytes read but not yet returned, in file order.
    pending: Vec<u8>,
    chunk_size: u64,
}

impl BackwardLineReader {
    pub async fn open(path: &Path) -> io::Result<Self> {
        Self::with_chunk_size(path, CHUNK_SIZE).await
    }

    pub async fn with_chunk_size(path: &Path, chunk_size: u64) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let remaining = file.metadata().await?.len();
        Ok(Self {
            file,
            remaining,
            pending: Vec::new(),
            chunk_size: chunk_size.max(1),
        })
    }

    /// True once every byte of the file has been returned.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0 && self.pending.is_empty()
    }

    /// The next line walking backward, or `None` at the start of the file.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(newline) = memchr::memrchr(b'\n', &self.pending) {
                let line = self.pending.split_off(newline + 1);
                self.pending.truncate(newline);
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.remaining == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.pending);
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            self.pull_chunk().await?;
        }
    }

    async fn pull_chunk(&mut self) -> io::Result<()> {
        let chunk_len = self.remaining.min(self.chunk_size);
        let offset = self.remaining - chunk_len;

        self.file.seek(io::SeekFrom::Start(offset)).await?;
        let mut chunk = vec![0u8; chunk_len as usize];
        self.file.read_exact(&mut chunk).await?;

        chunk.extend_from_slice(&self.pending);
        self.pending = chunk;
        self.remaining = offset;
        Ok(())
    }
}

/// Read the last `n` lines from a file without loading the entire file.
///
/// Returns lines in chronological order (oldest first). A trailing newline at
/// EOF does not produce an empty last line.
pub async fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut reader = BackwardLineReader::open(path).await?;
    let mut lines = Vec::with_capacity(n);
    while lines.len() < n {
        match reader.next_line().await? {
            Some(line) => lines.push(line),
            None => break,
        }
    }
    lines.reverse();
    Ok(lines)
}

/// The last `limit` chat turns of a transcript, read from the end.
///
/// At least `2 × limit` lines are buffered before parsing, since meta lines
/// and tool traffic produce no turns. If that still yields fewer than `limit`
/// turns the buffer target doubles until it does or the file start is reached.
pub(crate) async fn tail_turns(
    reader: &mut BackwardLineReader,
    limit: usize,
) -> io::Result<Vec<ChatTurn>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    // Newest first while collecting.
    let mut lines: Vec<String> = Vec::new();
    let mut target = limit.saturating_mul(2);
    loop {
        while lines.len() < target {
            match reader.next_line().await? {
                Some(line) => lines.push(line),
                None => break,
            }
        }

        let turns = turns_from_lines(lines.iter().rev().map(String::as_str));
        if turns.len() >= limit || reader.is_exhausted() {
            let skip = turns.len().saturating_sub(limit);
            return Ok(turns.into_iter().skip(skip).collect());
        }
        target = target.saturating_mul(2);
    }
}

/// Chat turns of a transcript, optionally capped to the most recent `limit`.
///
/// Small files (and uncapped requests) take the full-read path. Large files
/// are read backward; any failure there falls back to the full read so the
/// caller never sees a partial result.
pub async fn read_recent_turns(path: &Path, limit: Option<usize>) -> Result<Vec<ChatTurn>, ParseError> {
    let Some(limit) = limit else {
        return read_transcript(path).await;
    };

    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| ParseError::io(path, e))?
        .len();

    if size >= TAIL_THRESHOLD_BYTES {
        let tailed = async {
            let mut reader = BackwardLineReader::open(path).await?;
            tail_turns(&mut reader, limit).await
        }
        .await;
        match tailed {
            Ok(turns) => return Ok(turns),
            Err(e) => warn!(path = %path.display(), error = %e, "Tail read failed; falling back to full read"),
        }
    } else {
        debug!(path = %path.display(), size, "Small transcript; reading in full");
    }

    let turns = read_transcript(path).await?;
    let skip = turns.len().saturating_sub(limit);
    Ok(turns.into_iter().skip(skip).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn turn_line(n: usize, ts_secs: u64) -> String {
        format!(
            r#"{{"uuid":"u{n}","timestamp":"2026-01-01T00:{:02}:{:02}Z","type":"{}","message":{{"content":"message {n} {}"}}}}"#,
            (ts_secs / 60) % 60,
            ts_secs % 60,
            if n % 2 == 0 { "user" } else { "assistant" },
            "x".repeat(n % 7),
        )
    }

    #[tokio::test]
    async fn tail_0_lines_returns_empty() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "line1").unwrap();
        writeln!(f, "line2").unwrap();
        f.flush().unwrap();

        let result = tail_lines(f.path(), 0).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn tail_fewer_than_n() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "alpha").unwrap();
        writeln!(f, "beta").unwrap();
        writeln!(f, "gamma").unwrap();
        f.flush().unwrap();

        let result = tail_lines(f.path(), 100).await.unwrap();
        assert_eq!(result, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn tail_last_5() {
        let mut f = NamedTempFile::new().unwrap();
        for i in 0..1000 {
            writeln!(f, "line{}", i).unwrap();
        }
        f.flush().unwrap();

        let result = tail_lines(f.path(), 5).await.unwrap();
        assert_eq!(
            result,
            vec!["line995", "line996", "line997", "line998", "line999"]
        );
    }

    #[tokio::test]
    async fn tail_empty_file() {
        let f = NamedTempFile::new().unwrap();
        let result = tail_lines(f.path(), 10).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn tail_large_lines() {
        // Lines longer than the 8KB chunk size.
        let mut f = NamedTempFile::new().unwrap();
        let big_line_a = "A".repeat(10_000);
        let big_line_b = "B".repeat(12_000);
        let big_line_c = "C".repeat(9_000);
        writeln!(f, "{}", big_line_a).unwrap();
        writeln!(f, "{}", big_line_b).unwrap();
        writeln!(f, "{}", big_line_c).unwrap();
        f.flush().unwrap();

        let result = tail_lines(f.path(), 2).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], big_line_b);
        assert_eq!(result[1], big_line_c);
    }

    #[tokio::test]
    async fn tail_no_trailing_newline() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "line1\nline2\nline3").unwrap();
        f.flush().unwrap();

        let result = tail_lines(f.path(), 2).await.unwrap();
        assert_eq!(result, vec!["line2", "line3"]);
    }

    #[tokio::test]
    async fn backward_reader_walks_whole_file() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "a\n\nbb\nccc\n").unwrap();
        f.flush().unwrap();

        let mut reader = BackwardLineReader::with_chunk_size(f.path(), 2).await.unwrap();
        let mut seen = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["ccc", "bb", "a"]);
        assert!(reader.is_exhausted());
    }

    #[tokio::test]
    async fn tail_turns_skips_lines_without_turns() {
        let mut f = NamedTempFile::new().unwrap();
        for n in 0..10 {
            writeln!(f, "{}", turn_line(n, n as u64)).unwrap();
        }
        // A long run of lines that yield nothing forces the target to grow.
        for _ in 0..50 {
            writeln!(f, r#"{{"type":"progress","data":{{}}}}"#).unwrap();
        }
        f.flush().unwrap();

        let mut reader = BackwardLineReader::with_chunk_size(f.path(), 64).await.unwrap();
        let turns = tail_turns(&mut reader, 3).await.unwrap();
        let uuids: Vec<_> = turns.iter().map(|t| t.uuid.clone().unwrap()).collect();
        assert_eq!(uuids, vec!["u7", "u8", "u9"]);
    }

    #[tokio::test]
    async fn read_recent_turns_small_file_slices_from_end() {
        let mut f = NamedTempFile::new().unwrap();
        for n in 0..20 {
            writeln!(f, "{}", turn_line(n, n as u64)).unwrap();
        }
        f.flush().unwrap();

        let turns = read_recent_turns(f.path(), Some(4)).await.unwrap();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].uuid.as_deref(), Some("u16"));

        let all = read_recent_turns(f.path(), None).await.unwrap();
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn read_recent_turns_large_file_matches_full_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.jsonl");

        let mut content = String::new();
        let mut n = 0;
        while content.len() < (TAIL_THRESHOLD_BYTES as usize) + 4096 {
            content.push_str(&turn_line(n, n as u64));
            content.push('\n');
            n += 1;
        }
        tokio::fs::write(&path, &content).await.unwrap();

        let full = read_transcript(&path).await.unwrap();
        let tailed = read_recent_turns(&path, Some(25)).await.unwrap();
        assert_eq!(tailed.as_slice(), &full[full.len() - 25..]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_tail_equals_full_suffix(
            count in 0usize..120,
            noise_every in 2usize..9,
            limit in 1usize..40,
            chunk in 16u64..512,
        ) {
            let mut f = NamedTempFile::new().unwrap();
            for n in 0..count {
                writeln!(f, "{}", turn_line(n, n as u64)).unwrap();
                if n % noise_every == 0 {
                    writeln!(f, r#"{{"type":"system","content":"noise"}}"#).unwrap();
                }
            }
            f.flush().unwrap();

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (full, tailed) = rt.block_on(async {
                let full = read_transcript(f.path()).await.unwrap();
                let mut reader = BackwardLineReader::with_chunk_size(f.path(), chunk).await.unwrap();
                let tailed = tail_turns(&mut reader, limit).await.unwrap();
                (full, tailed)
            });

            let start = full.len().saturating_sub(limit);
            prop_assert_eq!(tailed.as_slice(), &full[start..]);
        }
    }
}
