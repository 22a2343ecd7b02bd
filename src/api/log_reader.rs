// src/api/log_reader.rs
//
// Tails a job's stdout/stderr files for `GET /jobs/query/{id}`: truncates
// to the last 1000 lines with a leading marker. Reads from the end of the
// file in bounded, geometrically growing chunks rather than loading the
// whole file, so a multi-gigabyte log doesn't get pulled into memory to
// answer a query for its last 1000 lines.

use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const MAX_LINES: usize = 1000;
const TRUNCATION_MARKER: &str = "... [output truncated, showing last 1000 lines] ...\n";
const CHUNK_SIZE: u64 = 64 * 1024;

pub async fn tail(path: &Path) -> String {
    let Ok(bytes) = read_tail_chunk(path).await else {
        return String::new();
    };
    tail_bytes(&bytes)
}

/// Reads growing chunks from the end of the file until the chunk holds more
/// than `MAX_LINES` newlines (enough to slice the last `MAX_LINES` lines
/// from) or the whole file has been read.
async fn read_tail_chunk(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_len = file.metadata().await?.len();
    if file_len == 0 {
        return Ok(Vec::new());
    }

    let mut read_size = CHUNK_SIZE.min(file_len);
    loop {
        let start = file_len - read_size;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; read_size as usize];
        file.read_exact(&mut buf).await?;

        let newline_count = buf.iter().filter(|&&b| b == b'\n').count();
        if newline_count > MAX_LINES || read_size == file_len {
            return Ok(buf);
        }
        read_size = (read_size * 2).min(file_len);
    }
}

fn tail_bytes(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.len() <= MAX_LINES {
        return text.into_owned();
    }
    let truncated = lines.split_off(lines.len() - MAX_LINES);
    let mut out = String::with_capacity(truncated.iter().map(|l| l.len() + 1).sum::<usize>() + TRUNCATION_MARKER.len());
    out.push_str(TRUNCATION_MARKER);
    for line in truncated {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_files_pass_through_unmodified() {
        let content = "line1\nline2\n";
        assert_eq!(tail_bytes(content.as_bytes()), content);
    }

    #[test]
    fn long_files_are_truncated_to_last_1000_lines_with_marker() {
        let content: String = (0..2000).map(|i| format!("line{i}\n")).collect();
        let result = tail_bytes(content.as_bytes());
        assert!(result.starts_with(TRUNCATION_MARKER));
        assert!(result.contains("line1999"));
        assert!(!result.contains("line0\n"));
    }

    #[tokio::test]
    async fn tail_reads_last_lines_of_a_large_file_without_loading_it_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        let content: String = (0..5000).map(|i| format!("line{i}\n")).collect();
        tokio::fs::write(&path, content.as_bytes()).await.unwrap();

        let result = tail(&path).await;
        assert!(result.starts_with(TRUNCATION_MARKER));
        assert!(result.contains("line4999"));
        assert!(!result.contains("line0\n"));
    }

    #[tokio::test]
    async fn tail_of_missing_file_is_empty() {
        let result = tail(std::path::Path::new("/nonexistent/path/to/a/log")).await;
        assert_eq!(result, "");
    }
}
