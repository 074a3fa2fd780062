//! Removal of the STARTTLS capability from an EHLO response.
//!
//! The client must never learn that the server offers STARTTLS; the
//! proxy negotiates it with the destination on the client's behalf.

pub const STARTTLS_COMMAND: &[u8] = b"STARTTLS\r\n";

const TERMINAL_LINE: &[u8] = b"250 STARTTLS\r\n";
const INTERMEDIATE_LINE: &[u8] = b"250-STARTTLS\r\n";

/// Which form of the capability line was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// `250 STARTTLS` was the final line; the preceding line was
    /// promoted to be the new final line.
    Terminal,
    /// A `250-STARTTLS` continuation line was removed
    Intermediate,
    /// Neither canonical line was present; the reply is unchanged
    NotFound,
}

impl RewriteOutcome {
    pub fn removed(self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Remove the STARTTLS capability line from an EHLO response.
///
/// The result is still a well formed multi-line reply: every line but
/// the last uses `250-` and the last uses `250 `.
pub fn remove_starttls(mut reply: Vec<u8>) -> (Vec<u8>, RewriteOutcome) {
    if let Some(start) = find_line(&reply, INTERMEDIATE_LINE) {
        reply.drain(start..start + INTERMEDIATE_LINE.len());
        return (reply, RewriteOutcome::Intermediate);
    }

    if let Some(start) = find_line(&reply, TERMINAL_LINE) {
        if start + TERMINAL_LINE.len() == reply.len() {
            reply.truncate(start);
            if let Some(prev) = last_line_start(&reply) {
                if reply[prev..].starts_with(b"250-") {
                    reply[prev + 3] = b' ';
                }
            }
            return (reply, RewriteOutcome::Terminal);
        }
    }

    (reply, RewriteOutcome::NotFound)
}

/// Find `line` in `buf` where it begins at the start of a line
fn find_line(buf: &[u8], line: &[u8]) -> Option<usize> {
    memchr::memmem::find_iter(buf, line).find(|&idx| idx == 0 || buf[idx - 1] == b'\n')
}

fn last_line_start(buf: &[u8]) -> Option<usize> {
    let body = buf.strip_suffix(b"\n")?;
    Some(memchr::memrchr(b'\n', body).map(|idx| idx + 1).unwrap_or(0))
}
