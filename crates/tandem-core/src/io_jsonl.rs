//! JSON Lines helpers for ledger transcripts.
//!
//! A transcript is the append-only log of [`Observed`] steps, one JSON object
//! per line (`.jsonl` and `.ndjson` alike). Replaying one through
//! [`crate::verify`] reproduces every participant's view of the run, so a
//! watcher can tail the file while a ledger appends to it.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;

use crate::io::ensure_parent_dir;
use crate::ledger::Observed;

/// Line-by-line reader yielding `Result<T>`; a bad line does not end the stream.
pub struct JsonlIter<T> {
    rdr: BufReader<File>,
    buf: String,
    line_no: usize,
    item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for JsonlIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        let read = self.rdr.read_line(&mut self.buf);
        self.line_no += 1;
        let line_no = self.line_no;
        match read {
            Ok(0) => None,
            Ok(_) => {
                let line = self.buf.trim_end_matches(|c| c == '\n' || c == '\r');
                if line.is_empty() {
                    return Some(Err(anyhow::anyhow!("line {line_no}: empty")));
                }
                Some(serde_json::from_str(line).with_context(|| format!("line {line_no}: bad entry")))
            }
            Err(e) => Some(Err(e).with_context(|| format!("line {line_no}: read failed"))),
        }
    }
}

/// Stream any JSONL file of `T`.
pub fn stream_jsonl<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<JsonlIter<T>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(JsonlIter {
        rdr: BufReader::new(f),
        buf: String::with_capacity(4 << 10),
        line_no: 0,
        item: PhantomData,
    })
}

/// Stream a transcript.
pub fn stream_transcript_jsonl<P: AsRef<Path>>(path: P) -> Result<JsonlIter<Observed>> {
    stream_jsonl(path)
}

/// Write a whole transcript, replacing the file.
pub fn write_transcript_jsonl<P: AsRef<Path>>(path: P, entries: &[Observed]) -> Result<()> {
    write_jsonl(path, entries)
}

/// Append one accepted step.
pub fn append_transcript_jsonl<P: AsRef<Path>>(path: P, entry: &Observed) -> Result<()> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer(&mut w, entry).context("serialize transcript entry")?;
    w.write_all(b"\n").context("write newline")?;
    w.flush().context("flush transcript")
}

/// Generic JSONL writer.
pub fn write_jsonl<P: AsRef<Path>, T: Serialize>(path: P, items: &[T]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    for it in items {
        serde_json::to_writer(&mut w, it).context("serialize jsonl item")?;
        w.write_all(b"\n").context("write newline")?;
    }
    w.flush().context("flush writer")?;
    Ok(())
}
