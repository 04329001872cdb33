//! Labeled-output wire format for session commands.
//!
//! Inside a session, every command's stdout and stderr are re-tagged at the
//! shell layer: two reader jobs copy the command's named pipes into a single
//! per-command log file, prefixing each line with a three-byte marker —
//! `\x01\x01\x01` for stdout, `\x02\x02\x02` for stderr. The exit status
//! lives in a separate file, written only after the command and both readers
//! have finished, so completion is a single filesystem event rather than an
//! in-band sentinel.
//!
//! Three identical control bytes have negligible collision probability with
//! real program output. Lines carrying neither prefix are discarded.

use serde::Serialize;

/// Line prefix marking a stdout line in the log file.
pub const STDOUT_PREFIX: [u8; 3] = [0x01, 0x01, 0x01];

/// Line prefix marking a stderr line in the log file.
pub const STDERR_PREFIX: [u8; 3] = [0x02, 0x02, 0x02];

/// Which of the command's two output streams a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Fully demultiplexed output of a completed command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Classify one log line (without its trailing newline) by prefix.
///
/// Returns the stream and the payload bytes, or `None` for unprefixed lines.
fn classify_line(line: &[u8]) -> Option<(OutputStream, &[u8])> {
    if line.len() >= 3 {
        if line[..3] == STDOUT_PREFIX {
            return Some((OutputStream::Stdout, &line[3..]));
        }
        if line[..3] == STDERR_PREFIX {
            return Some((OutputStream::Stderr, &line[3..]));
        }
    }
    None
}

/// Consume complete (`\n`-terminated) lines from `bytes[from..]`.
///
/// Returns the labeled chunks — payload with its newline restored — and the
/// byte offset just past the last consumed line. A trailing unterminated
/// fragment (the command is still writing) is left for the next call.
///
/// This is the incremental form used by the streaming poll loop; `from` is
/// the offset returned by the previous call.
pub fn drain_lines(bytes: &[u8], from: usize) -> (Vec<(OutputStream, String)>, usize) {
    let mut chunks = Vec::new();
    let mut cursor = from.min(bytes.len());
    while let Some(nl) = bytes[cursor..].iter().position(|&b| b == b'\n') {
        let line = &bytes[cursor..cursor + nl];
        if let Some((stream, payload)) = classify_line(line) {
            let mut data = String::from_utf8_lossy(payload).into_owned();
            data.push('\n');
            chunks.push((stream, data));
        }
        cursor += nl + 1;
    }
    (chunks, cursor)
}

/// Parse a complete per-command log file into stdout and stderr.
///
/// A trailing unterminated fragment is classified and appended without a
/// newline; unprefixed lines are discarded.
#[must_use]
pub fn parse_log(bytes: &[u8]) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    let (chunks, cursor) = drain_lines(bytes, 0);
    for (stream, data) in chunks {
        match stream {
            OutputStream::Stdout => parsed.stdout.push_str(&data),
            OutputStream::Stderr => parsed.stderr.push_str(&data),
        }
    }
    if cursor < bytes.len() {
        if let Some((stream, payload)) = classify_line(&bytes[cursor..]) {
            let data = String::from_utf8_lossy(payload);
            match stream {
                OutputStream::Stdout => parsed.stdout.push_str(&data),
                OutputStream::Stderr => parsed.stderr.push_str(&data),
            }
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(lines: &[(&[u8; 3], &str)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (prefix, payload) in lines {
            bytes.extend_from_slice(&prefix[..]);
            bytes.extend_from_slice(payload.as_bytes());
            bytes.push(b'\n');
        }
        bytes
    }

    #[test]
    fn parse_separates_streams() {
        let bytes = log(&[
            (&STDOUT_PREFIX, "out"),
            (&STDERR_PREFIX, "err"),
            (&STDOUT_PREFIX, "out2"),
        ]);
        let parsed = parse_log(&bytes);
        assert_eq!(parsed.stdout, "out\nout2\n");
        assert_eq!(parsed.stderr, "err\n");
    }

    #[test]
    fn parse_discards_unprefixed_lines() {
        let mut bytes = log(&[(&STDOUT_PREFIX, "kept")]);
        bytes.extend_from_slice(b"stray line\n");
        let parsed = parse_log(&bytes);
        assert_eq!(parsed.stdout, "kept\n");
        assert_eq!(parsed.stderr, "");
    }

    #[test]
    fn parse_tolerates_trailing_fragment() {
        let mut bytes = log(&[(&STDOUT_PREFIX, "done")]);
        bytes.extend_from_slice(&STDERR_PREFIX);
        bytes.extend_from_slice(b"partial");
        let parsed = parse_log(&bytes);
        assert_eq!(parsed.stdout, "done\n");
        assert_eq!(parsed.stderr, "partial");
    }

    #[test]
    fn parse_preserves_control_bytes_in_payload() {
        // Payload may itself contain a prefix byte; only the line head counts.
        let bytes = log(&[(&STDOUT_PREFIX, "a\x01b")]);
        let parsed = parse_log(&bytes);
        assert_eq!(parsed.stdout, "a\x01b\n");
    }

    #[test]
    fn drain_is_incremental() {
        let mut bytes = log(&[(&STDOUT_PREFIX, "first")]);
        let (chunks, offset) = drain_lines(&bytes, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], (OutputStream::Stdout, "first\n".to_string()));
        assert_eq!(offset, bytes.len());

        bytes.extend_from_slice(&STDERR_PREFIX);
        bytes.extend_from_slice(b"sec");
        let (chunks, offset2) = drain_lines(&bytes, offset);
        assert!(chunks.is_empty());
        assert_eq!(offset2, offset);

        bytes.extend_from_slice(b"ond\n");
        let (chunks, _) = drain_lines(&bytes, offset2);
        assert_eq!(chunks, vec![(OutputStream::Stderr, "second\n".to_string())]);
    }

    #[test]
    fn drain_empty_input() {
        let (chunks, offset) = drain_lines(b"", 0);
        assert!(chunks.is_empty());
        assert_eq!(offset, 0);
    }
}
