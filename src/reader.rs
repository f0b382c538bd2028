//! Line-buffered reader over a child's merged output pipe.
//!
//! A pump thread performs the blocking reads and hands raw chunks over a
//! channel, so the supervisor loop can wait with a short quantum and still
//! check its timers and the answer relay between polls. Lines are split at the
//! byte level and decoded lossily, so a multi-byte character split across two
//! reads is never mangled and invalid UTF-8 never aborts narration.
//!
//! Memory is bounded on both sides: the pump blocks once `PUMP_DEPTH` chunks
//! are queued, and an unterminated line longer than `MAX_LINE_BYTES` is cut
//! into fragments at a character boundary.

use std::io::{ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::debug;

const READ_CHUNK: usize = 4096;
/// Chunks queued between the pump and the loop before the pump waits.
const PUMP_DEPTH: usize = 64;
/// Longest line handed out in one piece.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Result of one bounded poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    /// Complete lines (newline stripped). At end of stream the last entry may
    /// be the trailing unterminated fragment.
    Lines(Vec<String>),
    /// Bytes arrived but no line is complete yet.
    Pending,
    /// Nothing arrived within the wait.
    Idle,
    /// The stream is drained. Every further poll returns `Closed`.
    Closed,
}

enum Chunk {
    Data(Vec<u8>),
    Eof,
}

/// Incremental, non-restartable line reader.
pub struct OutputReader {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl OutputReader {
    /// Start pumping `source` on a background thread.
    pub fn new<R: Read + Send + 'static>(mut source: R) -> Self {
        let (tx, rx) = mpsc::sync_channel(PUMP_DEPTH);
        thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Chunk::Data(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("output pipe read error (child likely exited): {e}");
                        break;
                    }
                }
            }
            let _ = tx.send(Chunk::Eof);
        });

        Self {
            rx,
            pending: Vec::new(),
            eof: false,
            closed: false,
        }
    }

    /// Wait at most `wait` for output and return whatever lines are complete.
    pub fn poll(&mut self, wait: Duration) -> Poll {
        if self.closed {
            return Poll::Closed;
        }

        if !self.eof {
            match self.rx.recv_timeout(wait) {
                Ok(Chunk::Data(bytes)) => {
                    self.pending.extend_from_slice(&bytes);
                    self.drain_ready();
                }
                Ok(Chunk::Eof) | Err(RecvTimeoutError::Disconnected) => self.eof = true,
                Err(RecvTimeoutError::Timeout) => return Poll::Idle,
            }
        }

        let mut lines = self.split_lines();
        if self.eof {
            if let Some(rest) = self.take_partial() {
                lines.push(rest);
            }
            self.closed = true;
            if lines.is_empty() {
                return Poll::Closed;
            }
        }

        if lines.is_empty() {
            Poll::Pending
        } else {
            Poll::Lines(lines)
        }
    }

    /// The unterminated fragment currently buffered, decoded lossily.
    pub fn partial(&self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(decode(&self.pending))
        }
    }

    /// Remove and return the unterminated fragment.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        Some(decode(&bytes))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn drain_ready(&mut self) {
        while self.pending.len() < MAX_LINE_BYTES {
            match self.rx.try_recv() {
                Ok(Chunk::Data(bytes)) => self.pending.extend_from_slice(&bytes),
                Ok(Chunk::Eof) | Err(TryRecvError::Disconnected) => {
                    self.eof = true;
                    return;
                }
                Err(TryRecvError::Empty) => return,
            }
        }
    }

    fn split_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            push_bounded(&mut lines, &self.pending[start..end]);
            start = end + 1;
        }
        self.pending.drain(..start);

        while self.pending.len() > MAX_LINE_BYTES {
            let cut = char_boundary(&self.pending, MAX_LINE_BYTES);
            lines.push(decode(&self.pending[..cut]));
            self.pending.drain(..cut);
        }
        lines
    }
}

fn push_bounded(lines: &mut Vec<String>, mut bytes: &[u8]) {
    while bytes.len() > MAX_LINE_BYTES {
        let cut = char_boundary(bytes, MAX_LINE_BYTES);
        lines.push(decode(&bytes[..cut]));
        bytes = &bytes[cut..];
    }
    lines.push(decode(bytes));
}

/// Largest cut `<= limit` that does not land inside a UTF-8 sequence.
fn char_boundary(bytes: &[u8], limit: usize) -> usize {
    let is_continuation = |b: u8| b & 0b1100_0000 == 0b1000_0000;
    (limit.saturating_sub(3)..=limit)
        .rev()
        .find(|&i| i > 0 && !is_continuation(bytes[i]))
        .unwrap_or(limit)
}

fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    /// Yields one pre-split chunk per `read` call.
    struct Chunked(VecDeque<Vec<u8>>);

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.0.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    fn collect(mut reader: OutputReader) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            match reader.poll(Duration::from_millis(200)) {
                Poll::Lines(lines) => out.extend(lines),
                Poll::Pending | Poll::Idle => {}
                Poll::Closed => return out,
            }
        }
    }

    fn chunked(parts: &[&[u8]]) -> OutputReader {
        OutputReader::new(Chunked(parts.iter().map(|p| p.to_vec()).collect()))
    }

    #[test]
    fn reassembles_lines_split_across_reads() {
        let reader = chunked(&[b"hel", b"lo\nwor", b"ld\n"]);
        assert_eq!(collect(reader), vec!["hello", "world"]);
    }

    #[test]
    fn trailing_partial_is_flushed_at_eof() {
        let reader = chunked(&[b"a\nb\nBackup? Y/n: "]);
        assert_eq!(collect(reader), vec!["a", "b", "Backup? Y/n: "]);
    }

    #[test]
    fn crlf_is_trimmed() {
        let reader = chunked(&[b"one\r\ntwo\r\n"]);
        assert_eq!(collect(reader), vec!["one", "two"]);
    }

    #[test]
    fn invalid_utf8_becomes_replacement_char() {
        let reader = chunked(&[b"ok \xff\xfe end\n"]);
        let lines = collect(reader);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains('\u{FFFD}'));
        assert!(lines[0].ends_with("end"));
    }

    #[test]
    fn multibyte_char_split_across_reads_survives() {
        // U+26A0 is E2 9A A0
        let reader = chunked(&[b"\xe2\x9a", b"\xa0 warn\n"]);
        assert_eq!(collect(reader), vec!["\u{26A0} warn"]);
    }

    #[test]
    fn endless_line_is_cut_into_bounded_fragments() {
        let long = vec![b'x'; MAX_LINE_BYTES * 3 + 10];
        let reader = chunked(&[&long, b"\nend\n"]);
        let lines = collect(reader);

        assert_eq!(lines.last().map(String::as_str), Some("end"));
        let body = &lines[..lines.len() - 1];
        assert_eq!(body.len(), 4);
        assert!(body.iter().all(|l| l.len() <= MAX_LINE_BYTES));
        assert_eq!(body.iter().map(String::len).sum::<usize>(), long.len());
    }

    #[test]
    fn fragment_cut_keeps_characters_whole() {
        let mut bytes = vec![b'x'; MAX_LINE_BYTES - 1];
        bytes.extend_from_slice("\u{26A0}".as_bytes());
        bytes.extend_from_slice(&[b'y'; 8]);
        let reader = chunked(&[&bytes]);
        let lines = collect(reader);

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES - 1);
        assert_eq!(lines[1], "\u{26A0}yyyyyyyy");
        assert!(!lines.concat().contains('\u{FFFD}'));
    }

    #[test]
    fn closed_is_sticky() {
        let mut reader = chunked(&[]);
        assert_eq!(reader.poll(Duration::from_millis(200)), Poll::Closed);
        assert!(reader.is_closed());
        assert_eq!(reader.poll(Duration::from_millis(10)), Poll::Closed);
    }

    #[test]
    fn partial_can_be_taken_before_newline() {
        let (read_end, mut write_end) = std::io::pipe().unwrap();
        let mut reader = OutputReader::new(read_end);
        std::io::Write::write_all(&mut write_end, b"Backup? Y/n: ").unwrap();

        let mut polls = 0;
        while reader.partial().is_none() && polls < 50 {
            reader.poll(Duration::from_millis(20));
            polls += 1;
        }
        assert_eq!(reader.partial().as_deref(), Some("Backup? Y/n: "));
        assert_eq!(reader.take_partial().as_deref(), Some("Backup? Y/n: "));
        assert!(reader.partial().is_none());

        std::io::Write::write_all(&mut write_end, b"y\n").unwrap();
        drop(write_end);
        assert_eq!(collect(reader), vec!["y"]);
    }

    #[test]
    fn idle_when_writer_is_silent() {
        let (read_end, _write_end) = std::io::pipe().unwrap();
        let mut reader = OutputReader::new(read_end);
        assert_eq!(reader.poll(Duration::from_millis(20)), Poll::Idle);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn chunking_never_changes_lines(
            text in "[a-z \n]{0,200}",
            cuts in proptest::collection::vec(1usize..16, 0..20),
        ) {
            let bytes = text.as_bytes();
            let mut parts = Vec::new();
            let mut pos = 0;
            for cut in cuts {
                if pos >= bytes.len() {
                    break;
                }
                let end = (pos + cut).min(bytes.len());
                parts.push(bytes[pos..end].to_vec());
                pos = end;
            }
            if pos < bytes.len() {
                parts.push(bytes[pos..].to_vec());
            }

            let expected: Vec<String> = {
                let mut v: Vec<String> = text.split('\n').map(str::to_string).collect();
                if v.last().is_some_and(|s| s.is_empty()) {
                    v.pop();
                }
                v
            };
            let reader = OutputReader::new(Chunked(parts.into_iter().collect()));
            prop_assert_eq!(collect(reader), expected);
        }
    }
}
