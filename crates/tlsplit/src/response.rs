//! Classification of replies coming back from the destination server.
//!
//! Every predicate looks at all CRLF delimited lines of the buffer rather
//! than at its first three bytes, so that a status line buried inside a
//! pipelined batch of replies is still recognized.
use crate::address::lines;

pub const CODE_SERVICE_READY: &[u8; 3] = b"220";
pub const CODE_ACTION_COMPLETED: &[u8; 3] = b"250";
pub const CODE_START_MAIL_INPUT: &[u8; 3] = b"354";

/// Replies larger than this are passed on without waiting for their
/// final line.
pub const MAX_REPLY_FRAME: usize = 64 * 1024;

/// The parts of the destination leg state that the predicates depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportState {
    /// The destination leg is TLS wrapped
    pub tls: bool,
    /// Client traffic is suspended while the upgrade is negotiated
    pub locked: bool,
}

/// Returns true if any line of `reply` starts with `code` followed by
/// a space, a dash or the end of the line.
pub fn has_reply_code(reply: &[u8], code: &[u8; 3]) -> bool {
    lines(reply).any(|line| line_has_code(line, code))
}

fn line_has_code(line: &[u8], code: &[u8; 3]) -> bool {
    line.starts_with(code) && matches!(line.get(3), None | Some(b' ') | Some(b'-'))
}

/// Returns true if any line advertises `capability` as its keyword
pub fn has_capability(reply: &[u8], capability: &str) -> bool {
    lines(reply).any(|line| {
        line.len() > 4
            && line_has_code(line, CODE_ACTION_COMPLETED)
            && line[4..]
                .split(|b| b.is_ascii_whitespace())
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(capability.as_bytes()))
    })
}

/// An EHLO response from a server that offers STARTTLS on a leg that
/// has not been upgraded yet.
pub fn is_ehlo_response_with_starttls(reply: &[u8], state: TransportState) -> bool {
    !state.tls
        && !state.locked
        && has_reply_code(reply, CODE_ACTION_COMPLETED)
        && has_capability(reply, "STARTTLS")
}

/// A multi-line EHLO response that does not offer STARTTLS
pub fn is_ehlo_response_without_starttls(reply: &[u8], state: TransportState) -> bool {
    !state.tls
        && !state.locked
        && lines(reply).any(|line| line.starts_with(b"250-"))
        && !has_capability(reply, "STARTTLS")
}

/// The destination accepted the STARTTLS command issued by the proxy
pub fn is_ready_for_starttls(reply: &[u8], state: TransportState) -> bool {
    !state.tls && state.locked && has_reply_code(reply, CODE_SERVICE_READY)
}

/// The destination is ready to receive message content
pub fn is_data_phase_entry(reply: &[u8]) -> bool {
    has_reply_code(reply, CODE_START_MAIL_INPUT)
}

pub fn is_action_completed(reply: &[u8]) -> bool {
    has_reply_code(reply, CODE_ACTION_COMPLETED)
}

/// Returns true if the last command in a client chunk is a bare `DATA`
pub fn is_data_command(chunk: &[u8]) -> bool {
    lines(chunk)
        .last()
        .is_some_and(|line| line.trim_ascii().eq_ignore_ascii_case(b"DATA"))
}

/// Returns true if `buf` ends with a complete final reply line; that is
/// a line of the form `ddd<SP>text<CRLF>` or `ddd<CRLF>`.
pub fn ends_with_final_reply(buf: &[u8]) -> bool {
    let Some(body) = buf.strip_suffix(b"\n") else {
        return false;
    };
    let start = memchr::memrchr(b'\n', body).map(|idx| idx + 1).unwrap_or(0);
    let line = &buf[start..];
    line.len() >= 3
        && line[..3].iter().all(u8::is_ascii_digit)
        && matches!(line.get(3), Some(b' ') | Some(b'\r') | Some(b'\n'))
}

/// Splits off the first complete reply (up to and including its final
/// line) from `buf`. Returns `None` if `buf` does not contain one.
pub fn split_first_reply(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut offset = 0;
    while offset < buf.len() {
        let end = memchr::memchr(b'\n', &buf[offset..])? + offset + 1;
        let line = &buf[offset..end];
        if line.get(3) != Some(&b'-') {
            return Some(buf.split_at(end));
        }
        offset = end;
    }
    None
}

/// Accumulates reads from the destination until they end in a final
/// reply line, so that multi-line replies are mediated as a unit.
#[derive(Debug, Default)]
pub struct ReplyFramer {
    buffer: Vec<u8>,
}

impl ReplyFramer {
    /// Append `chunk` and return the framed reply bytes when complete
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        if ends_with_final_reply(&self.buffer) || self.buffer.len() >= MAX_REPLY_FRAME {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// Take whatever is buffered, complete or not
    pub fn drain(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
