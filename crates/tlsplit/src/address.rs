//! Envelope metadata extraction from raw client command bytes.
//!
//! The matchers here are deliberately permissive. Carriers in the wild send
//! local parts with leading dots, consecutive dots and leading hyphens, and
//! some clients put whitespace around the colon of `MAIL FROM:`; all of that
//! is accepted verbatim so that the metadata is captured anyway.

/// An address found in a `MAIL FROM` or `RCPT TO` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPath<'a> {
    /// The bytes strictly between `<` and `>`
    pub address: &'a [u8],
    /// The full command line the address was found on, without CRLF
    pub line: &'a [u8],
    /// True when the command has whitespace around the colon, or more than
    /// one space between the verb and its keyword; RFC 5321 section 3.3
    /// permits neither.
    pub rfc_violation: bool,
}

/// Locate a `MAIL FROM:<...>` command in a possibly pipelined chunk
pub fn extract_mail_from(chunk: &[u8]) -> Option<ExtractedPath<'_>> {
    extract_path(chunk, b"MAIL", b"FROM")
}

/// Locate a `RCPT TO:<...>` command in a possibly pipelined chunk
pub fn extract_rcpt_to(chunk: &[u8]) -> Option<ExtractedPath<'_>> {
    extract_path(chunk, b"RCPT", b"TO")
}

/// Locate a `HELO` or `EHLO` command and return the trimmed remainder
/// of its line as the declared hostname.
pub fn extract_helo(chunk: &[u8]) -> Option<&[u8]> {
    for line in lines(chunk) {
        let line = line.trim_ascii_start();
        let rest = match strip_prefix_ignore_case(line, b"EHLO")
            .or_else(|| strip_prefix_ignore_case(line, b"HELO"))
        {
            Some(rest) => rest,
            None => continue,
        };
        if !rest.first().is_some_and(u8::is_ascii_whitespace) {
            continue;
        }
        let hostname = rest.trim_ascii();
        if !hostname.is_empty() {
            return Some(hostname);
        }
    }
    None
}

/// Split an address at its last `@` and return the domain part
pub fn domain_of(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

fn extract_path<'a>(chunk: &'a [u8], verb: &[u8], keyword: &[u8]) -> Option<ExtractedPath<'a>> {
    for line in lines(chunk) {
        if let Some(found) = match_path(line, verb, keyword) {
            return Some(found);
        }
    }
    None
}

fn match_path<'a>(line: &'a [u8], verb: &[u8], keyword: &[u8]) -> Option<ExtractedPath<'a>> {
    let rest = strip_prefix_ignore_case(line.trim_ascii_start(), verb)?;

    let (verb_gap, rest) = skip_spaces(rest);
    if verb_gap == 0 {
        return None;
    }
    let rest = strip_prefix_ignore_case(rest, keyword)?;
    let (before_colon, rest) = skip_spaces(rest);
    let rest = rest.strip_prefix(b":")?;
    let (after_colon, rest) = skip_spaces(rest);
    let rest = rest.strip_prefix(b"<")?;

    let end = memchr::memchr(b'>', rest)?;
    let address = &rest[..end];
    if !is_email_shaped(address) {
        return None;
    }

    Some(ExtractedPath {
        address,
        line,
        rfc_violation: verb_gap > 1 || before_colon > 0 || after_colon > 0,
    })
}

/// Something that looks enough like `local@domain` to be worth recording.
/// The local part is not validated any further.
fn is_email_shaped(address: &[u8]) -> bool {
    let Some(at) = memchr::memrchr(b'@', address) else {
        return false;
    };
    at > 0
        && at + 1 < address.len()
        && !address
            .iter()
            .any(|&b| b.is_ascii_whitespace() || b == b'<' || b == b'>')
}

fn skip_spaces(bytes: &[u8]) -> (usize, &[u8]) {
    let count = bytes.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
    (count, &bytes[count..])
}

fn strip_prefix_ignore_case<'a>(bytes: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&bytes[prefix.len()..])
    } else {
        None
    }
}

/// Iterate the lines of a chunk with any CR/LF line ending removed
pub(crate) fn lines(chunk: &[u8]) -> impl Iterator<Item = &[u8]> {
    chunk
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn mail_from(cmd: &str) -> Option<(String, bool)> {
        extract_mail_from(cmd.as_bytes()).map(|found| {
            (
                String::from_utf8_lossy(found.address).to_string(),
                found.rfc_violation,
            )
        })
    }

    fn rcpt_to(cmd: &str) -> Option<(String, bool)> {
        extract_rcpt_to(cmd.as_bytes()).map(|found| {
            (
                String::from_utf8_lossy(found.address).to_string(),
                found.rfc_violation,
            )
        })
    }

    #[test]
    fn helo_and_ehlo() {
        for cmd in [
            "EHLO mx.example.local\r\n",
            "HELO mx.example.local\r\n",
            "ehlo mx.example.local\r\n",
            "helo mx.example.local\r\n",
            "Ehlo mx.example.local\r\n",
            "Helo   mx.example.local  \r\n",
        ] {
            assert_equal!(
                extract_helo(cmd.as_bytes()),
                Some(&b"mx.example.local"[..]),
                "{cmd:?}"
            );
        }
        assert_equal!(extract_helo(b"EHLO\r\n"), None);
        assert_equal!(extract_helo(b"EHLOmx.example.local\r\n"), None);
        assert_equal!(extract_helo(b"MAIL FROM:<a@b.c>\r\n"), None);
    }

    #[test]
    fn mail_from_with_parameters() {
        assert_equal!(
            mail_from("MAIL FROM:<b-ob+foo@e-xample.local> SIZE=4095\r\n"),
            Some(("b-ob+foo@e-xample.local".to_string(), false))
        );
        // Sender Rewriting Scheme
        assert_equal!(
            mail_from("MAIL FROM:<SRS0=x/Eg=D3=example.test=alice@example.com> SIZE=4095\r\n"),
            Some((
                "SRS0=x/Eg=D3=example.test=alice@example.com".to_string(),
                false
            ))
        );
    }

    #[test]
    fn pipelined_commands() {
        let chunk = "MAIL FROM:<bob@example.local> SIZE=4095\r\n\
                     RCPT TO:<alice@example.com> ORCPT=rfc822;bob@example.local\r\n\
                     DATA\r\n";
        assert_equal!(
            mail_from(chunk),
            Some(("bob@example.local".to_string(), false))
        );
        assert_equal!(
            rcpt_to(chunk),
            Some(("alice@example.com".to_string(), false))
        );
    }

    #[test]
    fn case_insensitive() {
        assert_equal!(
            mail_from("mail from:<alice@example.test> SIZE=4095\r\n"),
            Some(("alice@example.test".to_string(), false))
        );
        assert_equal!(
            mail_from("Mail From:<Alice@Example.COM>\r\n"),
            Some(("Alice@Example.COM".to_string(), false))
        );
        assert_equal!(
            rcpt_to("Rcpt To:<charlie@example.net>\r\n"),
            Some(("charlie@example.net".to_string(), false))
        );
    }

    #[test]
    fn spacing_violations_are_flagged_but_captured() {
        for (cmd, violation) in [
            ("MAIL FROM:<alice@example.com>\r\n", false),
            ("MAIL FROM: <alice@example.com>\r\n", true),
            ("MAIL FROM : <alice@example.com>\r\n", true),
            ("MAIL  FROM:<alice@example.com>\r\n", true),
        ] {
            assert_equal!(
                mail_from(cmd),
                Some(("alice@example.com".to_string(), violation)),
                "{cmd:?}"
            );
        }
        assert_equal!(
            rcpt_to("RCPT TO: <bob@example.com>\r\n"),
            Some(("bob@example.com".to_string(), true))
        );
    }

    #[test]
    fn carrier_local_parts() {
        for addr in [
            "user..name@example.com",
            "user...name@example.com",
            "username.@example.com",
            "-username@example.com",
            ".username@example.com",
            "user--name@example.com",
            "-user..name.@example.com",
        ] {
            assert_equal!(
                mail_from(&format!("MAIL FROM:<{addr}>\r\n")),
                Some((addr.to_string(), false))
            );
            assert_equal!(
                rcpt_to(&format!("RCPT TO:<{addr}>\r\n")),
                Some((addr.to_string(), false))
            );
        }
    }

    #[test]
    fn non_addresses_are_ignored() {
        assert_equal!(mail_from("MAIL FROM:<>\r\n"), None);
        assert_equal!(mail_from("MAIL FROM:<postmaster>\r\n"), None);
        assert_equal!(mail_from("MAIL FROM:<alice@example.com\r\n"), None);
        assert_equal!(mail_from("MAILFROM:<alice@example.com>\r\n"), None);
        assert_equal!(rcpt_to("MAIL FROM:<alice@example.com>\r\n"), None);
    }

    #[test]
    fn domains() {
        assert_equal!(domain_of("alice@example.com"), Some("example.com"));
        assert_equal!(domain_of("odd@local@example.org"), Some("example.org"));
        assert_equal!(domain_of("nobody"), None);
        assert_equal!(domain_of("trailing@"), None);
    }
}
