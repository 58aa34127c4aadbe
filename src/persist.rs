//! Shared on-disk persistence primitives.
//!
//! Every JSON artifact is replaced atomically (write-to-temp-then-rename) and
//! every JSONL artifact is append-only with a trailing newline per record.
//! Readers tail files in bounded chunks and never need the writer's lock.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Atomically replace `path` with `bytes`.
///
/// The temp file lives in the same directory so the rename stays on one
/// filesystem and is atomic.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "seshat".into())
    ));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Atomically replace `path` with the pretty-printed JSON of `value`.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &bytes)
}

/// Read and parse a JSON file. `Ok(None)` when the file does not exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Append one line to a JSONL file, creating it if needed.
///
/// The newline is written together with the payload so concurrent tail
/// readers never observe a record without its terminator.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    f.write_all(buf.as_bytes())
}

/// Tail-read up to `max_lines` complete lines from the end of `path`,
/// reading backwards in `chunk_size` slices without loading the whole file.
///
/// A partial (unterminated) last line is ignored; callers decide what to do
/// with lines that fail to parse.
pub fn tail_lines(path: &Path, max_lines: usize, chunk_size: usize) -> std::io::Result<Vec<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len == 0 || max_lines == 0 {
        return Ok(Vec::new());
    }

    let chunk = chunk_size.max(1) as u64;
    let mut end = len;
    let mut pending: Vec<u8> = Vec::new();
    let mut lines: Vec<String> = Vec::new();

    // Drop a trailing partial record (no newline terminator yet).
    let mut truncated_partial = false;

    while end > 0 && lines.len() < max_lines {
        let start = end.saturating_sub(chunk);
        let mut buf = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        buf.extend_from_slice(&pending);
        pending.clear();

        if !truncated_partial {
            if let Some(last) = buf.last() {
                if *last != b'\n' {
                    // Keep only up to the final newline in this pass.
                    if let Some(pos) = buf.iter().rposition(|b| *b == b'\n') {
                        buf.truncate(pos + 1);
                    } else {
                        pending = buf;
                        end = start;
                        continue;
                    }
                }
            }
            truncated_partial = true;
        }

        // Split complete lines; the first segment may continue further back.
        let mut segments: Vec<&[u8]> = buf.split(|b| *b == b'\n').collect();
        // split() yields a trailing empty segment for a newline-terminated buffer.
        if segments.last().is_some_and(|s| s.is_empty()) {
            segments.pop();
        }
        if start > 0 && !segments.is_empty() {
            pending = segments.remove(0).to_vec();
        }
        for seg in segments.iter().rev() {
            if lines.len() >= max_lines {
                break;
            }
            lines.push(String::from_utf8_lossy(seg).into_owned());
        }
        end = start;
    }

    // If no newline was found anywhere the whole file is one partial record;
    // `pending` is dropped along with any other unterminated tail.

    lines.reverse();
    Ok(lines)
}

/// Count newline-terminated records in a file by streaming it.
pub fn count_lines(path: &Path) -> std::io::Result<u64> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut buf = [0u8; 64 * 1024];
    let mut count = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        count += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
    }
    Ok(count)
}
