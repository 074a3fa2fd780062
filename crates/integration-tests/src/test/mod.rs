
/// A small message, terminated with CRLF as the client sends it
pub const CONTENT: &[u8] =
    b"From: alice@example.com\r\nTo: bob@example.net\r\nSubject: hello\r\n\r\nHi Bob\r\n";
