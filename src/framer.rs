//! Binary-safe incremental extraction of Assuan commands, INQUIRE D-blocks,
//! and response termination markers from a byte stream.
//!
//! The framer never interprets payload semantics: it only finds line
//! boundaries and the three terminator keywords (`OK`, `ERR`, `INQUIRE`).
//! Every byte handed to [`Framer::push`] either stays buffered or is
//! returned verbatim as part of exactly one extracted frame.

/// Which of the three Assuan terminators a completed response line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Ok,
    Err,
    Inquire,
}

/// Result of scanning a buffer for a terminal response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub complete: bool,
    pub kind: Option<ResponseKind>,
}

impl Completion {
    const NOT_COMPLETE: Completion = Completion { complete: false, kind: None };

    fn terminal(kind: ResponseKind) -> Completion {
        Completion { complete: true, kind: Some(kind) }
    }
}

/// Stateful byte buffer plus the two frame extractors the proxy state
/// machine drives. Which extractor to call is a decision the state machine
/// makes (command mode vs. inquire mode) — the framer itself holds no mode,
/// only the residual bytes.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Framer { buffer: Vec::new() }
    }

    /// Append bytes to the internal buffer. Never fails, never inspects
    /// payload contents.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet framed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// In command mode: return the bytes up to and including the next
    /// `\n`, or `None` if no newline is buffered yet.
    pub fn extract_command(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        Some(self.buffer.drain(..=pos).collect())
    }

    /// In inquire mode: return the bytes up to and including the first
    /// occurrence of the literal sequence `END\n`, or `None` if it has not
    /// been seen yet. `END\n` may appear anywhere in the buffered bytes;
    /// the first occurrence terminates the block.
    pub fn extract_inquire_block(&mut self) -> Option<Vec<u8>> {
        let end = find_subsequence(&self.buffer, b"END\n")?;
        let frame_len = end + 4;
        Some(self.buffer.drain(..frame_len).collect())
    }

    /// Determine whether `buf` ends in a terminal Assuan response line.
    ///
    /// A response is terminal iff, scanning lines delimited by `\n`, the
    /// last non-empty line (after right-trimming trailing whitespace and
    /// ignoring trailing blank lines) begins with `OK`, `ERR `, or
    /// `INQUIRE `, each with the required trailing content. Any other
    /// final line (`S …`, `D …`, `# …`, blank only) is not complete. A
    /// buffer with no trailing `\n` is never complete.
    pub fn detect_response_completion(buf: &[u8]) -> Completion {
        if !buf.ends_with(b"\n") {
            return Completion::NOT_COMPLETE;
        }

        let mut lines: Vec<&[u8]> = buf.split(|&b| b == b'\n').collect();
        // split() on a trailing-\n buffer always leaves one empty trailing
        // element; drop it before walking backwards over blank lines.
        if matches!(lines.last(), Some(l) if l.is_empty()) {
            lines.pop();
        }

        while let Some(&line) = lines.last() {
            let trimmed = rtrim_whitespace(line);
            if trimmed.is_empty() {
                lines.pop();
                continue;
            }
            return classify_line(trimmed);
        }

        Completion::NOT_COMPLETE
    }
}

fn classify_line(line: &[u8]) -> Completion {
    if line == b"OK" || (line.starts_with(b"OK") && line[2..].starts_with(b" ")) {
        return Completion::terminal(ResponseKind::Ok);
    }
    if let Some(rest) = line.strip_prefix(b"ERR ") {
        if !rest.is_empty() {
            return Completion::terminal(ResponseKind::Err);
        }
    }
    if let Some(rest) = line.strip_prefix(b"INQUIRE ") {
        if !rest.is_empty() {
            return Completion::terminal(ResponseKind::Inquire);
        }
    }
    Completion::NOT_COMPLETE
}

fn rtrim_whitespace(mut line: &[u8]) -> &[u8] {
    while matches!(line.last(), Some(b) if b.is_ascii_whitespace()) {
        line = &line[..line.len() - 1];
    }
    line
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_mode_splits_on_newline() {
        let mut framer = Framer::new();
        framer.push(b"GETINFO version\nBYE");
        assert_eq!(framer.extract_command().unwrap(), b"GETINFO version\n");
        assert_eq!(framer.extract_command(), None);
        assert_eq!(&framer.buffer, b"BYE");
    }

    #[test]
    fn command_mode_streams_across_chunk_boundaries() {
        let mut framer = Framer::new();
        framer.push(b"GETIN");
        assert_eq!(framer.extract_command(), None);
        framer.push(b"FO version\n");
        assert_eq!(framer.extract_command().unwrap(), b"GETINFO version\n");
    }

    #[test]
    fn inquire_block_extracts_up_to_first_end() {
        let mut framer = Framer::new();
        framer.push(b"D line1\nD line2\nEND\n");
        let block = framer.extract_inquire_block().unwrap();
        assert_eq!(block, b"D line1\nD line2\nEND\n".to_vec());
        assert!(framer.is_empty());
    }

    #[test]
    fn inquire_block_waits_for_end_marker() {
        let mut framer = Framer::new();
        framer.push(b"D partial");
        assert_eq!(framer.extract_inquire_block(), None);
        framer.push(b"\nEND\n");
        assert_eq!(
            framer.extract_inquire_block().unwrap(),
            b"D partial\nEND\n".to_vec()
        );
    }

    #[test]
    fn completion_detects_ok_after_status_lines() {
        let input = b"S PROGRESS 50 100\nS PROGRESS 100 100\nOK\n";
        let c = Framer::detect_response_completion(input);
        assert_eq!(c, Completion::terminal(ResponseKind::Ok));
    }

    #[test]
    fn completion_requires_trailing_newline() {
        let input = b"S PROGRESS 50 100\nS PROGRESS 100 100\nOK";
        let c = Framer::detect_response_completion(input);
        assert_eq!(c, Completion::NOT_COMPLETE);
    }

    #[test]
    fn completion_ok_with_trailing_text() {
        let c = Framer::detect_response_completion(b"OK closing connection\n");
        assert_eq!(c, Completion::terminal(ResponseKind::Ok));
    }

    #[test]
    fn completion_rejects_okay_lookalike() {
        // "OKAY" must not be mistaken for "OK " + trailing text.
        let c = Framer::detect_response_completion(b"OKAY\n");
        assert_eq!(c, Completion::NOT_COMPLETE);
    }

    #[test]
    fn completion_detects_err() {
        let c = Framer::detect_response_completion(b"ERR 67109139 No such key\n");
        assert_eq!(c, Completion::terminal(ResponseKind::Err));
    }

    #[test]
    fn completion_detects_inquire() {
        let c = Framer::detect_response_completion(b"INQUIRE PASSPHRASE\n");
        assert_eq!(c, Completion::terminal(ResponseKind::Inquire));
    }

    #[test]
    fn completion_ignores_trailing_blank_lines() {
        let c = Framer::detect_response_completion(b"OK\n\n\n");
        assert_eq!(c, Completion::terminal(ResponseKind::Ok));
    }

    #[test]
    fn completion_trailing_comment_is_not_complete() {
        let c = Framer::detect_response_completion(b"OK\n# just a comment\n");
        assert_eq!(c, Completion::NOT_COMPLETE);
    }

    #[test]
    fn byte_transparency_every_value_round_trips() {
        for byte in 0u8..=255 {
            let mut framer = Framer::new();
            let mut payload = vec![byte, byte, byte];
            payload.push(b'\n');
            framer.push(&payload);
            let frame = framer.extract_command().unwrap();
            assert_eq!(frame, payload);
        }
    }

    #[test]
    fn push_is_lossless_across_arbitrary_chunking() {
        let input: Vec<u8> = (0u8..=255).cycle().take(5000).collect();
        let mut whole = Framer::new();
        whole.push(&input);

        let mut chunked = Framer::new();
        for chunk in input.chunks(37) {
            chunked.push(chunk);
        }

        assert_eq!(whole.buffer, chunked.buffer);
        assert_eq!(whole.buffer, input);
    }
}
