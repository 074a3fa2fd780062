//! DATA phase message accumulation.
//!
//! Message bytes are dot-stuffed as they arrive from the client and are
//! kept that way; the terminator is never part of a buffered message and
//! is appended again when the message is relayed.
use memchr::memmem;

pub const DATA_TERMINATOR: &[u8] = b"\r\n.\r\n";

/// The terminator when the message is empty and the client sends the
/// final dot on the very first line.
const EMPTY_MESSAGE_TERMINATOR: &[u8] = b".\r\n";

pub const DEFAULT_MESSAGE_SIZE_LIMIT: usize = 10_240_000;

#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// No terminator yet; nothing is to be sent anywhere
    Continue,
    /// The terminator was seen
    Complete {
        /// The message, without its terminator
        message: Vec<u8>,
        /// Anything the client pipelined after the terminator
        trailing: Vec<u8>,
    },
    /// The message reached the size limit
    Overflow(AfterOverflow),
}

/// What to do with the rest of the client's input once a message
/// has been abandoned for being too large.
#[derive(Debug, PartialEq, Eq)]
pub enum AfterOverflow {
    /// The terminator was already seen; these bytes follow it
    Trailing(Vec<u8>),
    /// The terminator is still to come; discard input until the
    /// scanner finds it.
    Discard(TerminatorScanner),
}

/// Accumulates the message of one DATA transaction
#[derive(Debug, PartialEq, Eq)]
pub struct DataPhaseBuffer {
    buffer: Vec<u8>,
    limit: usize,
}

impl DataPhaseBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: vec![],
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append a chunk of client input.
    ///
    /// A message whose length reaches the limit overflows, whether or
    /// not its terminator has been seen. Trailing bytes that may turn out
    /// to be the start of the terminator do not count towards the limit.
    pub fn push(&mut self, chunk: &[u8]) -> DataOutcome {
        let search_from = self.buffer.len().saturating_sub(DATA_TERMINATOR.len() - 1);
        self.buffer.extend_from_slice(chunk);

        match find_terminator(&self.buffer, search_from) {
            Some((message_end, terminator_end)) => {
                let trailing = self.buffer.split_off(terminator_end);
                let mut message = std::mem::take(&mut self.buffer);
                message.truncate(message_end);
                if message.len() >= self.limit {
                    DataOutcome::Overflow(AfterOverflow::Trailing(trailing))
                } else {
                    DataOutcome::Complete { message, trailing }
                }
            }
            None if self.buffer.len() - partial_terminator_len(&self.buffer) >= self.limit => {
                let scanner = TerminatorScanner::resume_after(&self.buffer);
                self.buffer = vec![];
                DataOutcome::Overflow(AfterOverflow::Discard(scanner))
            }
            None => DataOutcome::Continue,
        }
    }
}

/// Returns the end of the message and the end of the terminator
pub fn find_terminator(buf: &[u8], search_from: usize) -> Option<(usize, usize)> {
    if buf.starts_with(EMPTY_MESSAGE_TERMINATOR) {
        return Some((0, EMPTY_MESSAGE_TERMINATOR.len()));
    }
    memmem::find(&buf[search_from..], DATA_TERMINATOR).map(|idx| {
        let start = search_from + idx;
        (start, start + DATA_TERMINATOR.len())
    })
}

/// The length of the longest suffix of `buf` that could still grow into
/// the terminator
fn partial_terminator_len(buf: &[u8]) -> usize {
    if EMPTY_MESSAGE_TERMINATOR.starts_with(buf) {
        return buf.len();
    }
    (1..DATA_TERMINATOR.len())
        .rev()
        .find(|&len| buf.ends_with(&DATA_TERMINATOR[..len]))
        .unwrap_or(0)
}

/// Watches a stream of message bytes for the terminator without
/// retaining them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatorScanner {
    tail: Vec<u8>,
}

impl Default for TerminatorScanner {
    fn default() -> Self {
        // The body starts on a fresh line, which lets a leading ".\r\n"
        // match the full terminator.
        Self {
            tail: b"\r\n".to_vec(),
        }
    }
}

impl TerminatorScanner {
    /// A scanner that has already seen `seen` from the start of the body
    pub fn resume_after(seen: &[u8]) -> Self {
        let mut scanner = Self::default();
        scanner.remember(seen);
        scanner
    }

    /// Returns the offset into `chunk` just past the terminator, if the
    /// terminator completes within `chunk`.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        let carried = self.tail.len();
        let mut boundary = self.tail.clone();
        boundary.extend_from_slice(&chunk[..chunk.len().min(DATA_TERMINATOR.len() - 1)]);

        if let Some(idx) = memmem::find(&boundary, DATA_TERMINATOR) {
            return Some(idx + DATA_TERMINATOR.len() - carried);
        }
        if let Some(idx) = memmem::find(chunk, DATA_TERMINATOR) {
            return Some(idx + DATA_TERMINATOR.len());
        }

        self.remember(chunk);
        None
    }

    fn remember(&mut self, bytes: &[u8]) {
        let keep = DATA_TERMINATOR.len() - 1;
        self.tail.extend_from_slice(&bytes[bytes.len().saturating_sub(keep)..]);
        let excess = self.tail.len().saturating_sub(keep);
        self.tail.drain(..excess);
    }
}
