use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use hostbot_process::ScriptName;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub fn log_path(logs_dir: &Path, name: &ScriptName) -> PathBuf {
    logs_dir.join(name.log_file_name())
}

/// Opens the script's log for appending; the handle is cloned into the
/// child's stdout/stderr.
pub fn open_append(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

pub fn write_marker(file: &mut std::fs::File, message: &str) -> io::Result<()> {
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
    writeln!(file, "[hostbot {now}] {message}")
}

/// Appends a marker when no handle is open (the process already exited).
pub fn append_marker(path: &Path, message: &str) -> io::Result<()> {
    let mut f = open_append(path)?;
    write_marker(&mut f, message)
}

/// Reads bytes appended after `offset`, keeping at most the trailing
/// `limit_bytes` of them. Returns the chunk and the new offset.
///
/// If the file shrank below `offset` it was replaced; reading restarts at 0.
pub async fn read_since(path: &Path, offset: u64, limit_bytes: usize) -> io::Result<(Vec<u8>, u64)> {
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };

    let mut cursor = if offset > size { 0 } else { offset };
    if size == cursor {
        return Ok((Vec::new(), size));
    }
    cursor = cursor.max(size.saturating_sub(limit_bytes as u64));

    let to_read = (size - cursor) as usize;
    let mut f = tokio::fs::File::open(path).await?;
    f.seek(io::SeekFrom::Start(cursor)).await?;
    let mut buf = vec![0u8; to_read];
    f.read_exact(&mut buf).await?;
    Ok((buf, size))
}

/// The last `limit_bytes` of the log, or `None` if nothing was logged yet.
pub async fn tail(path: &Path, limit_bytes: usize) -> io::Result<Option<String>> {
    if tokio::fs::metadata(path).await.is_err() {
        return Ok(None);
    }
    let (buf, _) = read_since(path, 0, limit_bytes).await?;
    Ok(Some(trailing_text(&buf, limit_bytes)))
}

/// Best-effort UTF-8 rendering of the end of `buf`, never longer than
/// `max_bytes`. A cut drops the partial first line.
pub fn trailing_text(buf: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(buf);
    if text.len() <= max_bytes {
        return text.into_owned();
    }

    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    let mut tail = &text[start..];
    if let Some(nl) = tail.find('\n')
        && nl + 1 < tail.len()
    {
        tail = &tail[nl + 1..];
    }
    tail.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_since_returns_only_appended_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bot.py.log");
        std::fs::write(&path, b"first\n").unwrap();

        let start = std::fs::metadata(&path).unwrap().len();
        assert_eq!(start, 6);

        let mut f = open_append(&path).unwrap();
        f.write_all(b"second\n").unwrap();

        let (chunk, next) = read_since(&path, start, 1024).await.unwrap();
        assert_eq!(chunk, b"second\n");
        assert_eq!(next, 13);

        let (chunk, next) = read_since(&path, next, 1024).await.unwrap();
        assert!(chunk.is_empty());
        assert_eq!(next, 13);
    }

    #[tokio::test]
    async fn read_since_bounds_to_trailing_window_and_handles_truncation() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("x.log");
        std::fs::write(&path, b"0123456789").unwrap();

        let (chunk, next) = read_since(&path, 0, 4).await.unwrap();
        assert_eq!(chunk, b"6789");
        assert_eq!(next, 10);

        std::fs::write(&path, b"ab").unwrap();
        let (chunk, next) = read_since(&path, 10, 4).await.unwrap();
        assert_eq!(chunk, b"ab");
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn tail_of_missing_log_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(tail(&dir.path().join("none.log"), 100).await.unwrap().is_none());
    }

    #[test]
    fn trailing_text_drops_partial_line_and_respects_utf8() {
        assert_eq!(trailing_text(b"short", 100), "short");
        let got = trailing_text("line one\nline two\nline three\n".as_bytes(), 16);
        assert_eq!(got, "line three\n");

        let s = "ééééé\nok".as_bytes();
        let got = trailing_text(s, 5);
        assert!(got.len() <= 5);
        assert!(got.ends_with("ok"));
    }

    #[test]
    fn markers_append() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("m.log");
        append_marker(&path, "started").unwrap();
        append_marker(&path, "stopped").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().ends_with("] started"));
    }
}
