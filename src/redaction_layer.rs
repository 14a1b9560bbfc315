use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r#"(?i)(sk-[A-Za-z0-9_-]{20,}|Bearer\s+[^\s"']+|"?(?:refresh_token|access_token)"?\s*[:=]\s*"?[^\s",}]+|PARLEY_(?:API_TOKEN|REFRESH_TOKEN|ENCRYPTION_KEY)=[^\s]+)"#
    ).expect("Invalid redaction regex");
}

/// Scrubs credentials from log output before it reaches the inner writer.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = REDACTION_REGEX.replace_all(&input, "[REDACTED]");
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub fn redact(input: &str) -> String {
    REDACTION_REGEX.replace_all(input, "[REDACTED]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_scrubbed() {
        let line = r#"POST /refresh Authorization: Bearer abc.def.ghi body {"refresh_token": "r-123"}"#;
        let out = redact(line);
        assert!(!out.contains("abc.def.ghi"));
        assert!(!out.contains("r-123"));
        assert!(out.contains("POST /refresh"));
    }

    #[test]
    fn test_writer_passes_clean_text_through() {
        let mut sink = Vec::new();
        {
            let mut w = RedactingWriter::new(&mut sink);
            if let Err(e) = w.write_all(b"turn closed PARLEY_API_TOKEN=xyz") {
                panic!("write failed: {}", e);
            }
        }
        assert_eq!(String::from_utf8_lossy(&sink), "turn closed [REDACTED]");
    }
}
