//! Verification record parsing.
//!
//! A record is a run of `key=value` lines:
//!
//! ```text
//! pattern=MODHOST_PLUGIN_VERIFICATION_DATA
//! version=0.1.0
//! debug=false
//! buildkey=x86_64-unknown-linux-gnu rustc-1.85.0 full-config
//! ```
//!
//! It ends at the first NUL byte, an empty line or the end of the buffer.
//! A line cut off before its newline is malformed, never silently dropped.

use std::fmt;

use modhost_sdk::VERIFICATION_PATTERN;

use crate::version::PackedVersion;

/// Upper bound on the bytes a record may span.
pub const MAX_RECORD_LEN: usize = 4096;

/// Fields of a parsed verification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    pub version: PackedVersion,
    pub debug: bool,
    pub build_key: String,
}

impl VerificationRecord {
    pub fn new(version: PackedVersion, debug: bool, build_key: impl Into<String>) -> Self {
        Self {
            version,
            debug,
            build_key: build_key.into(),
        }
    }

    /// Render the record the way plugins embed it.
    pub fn encode(&self) -> String {
        format!(
            "{}\nversion={}\ndebug={}\nbuildkey={}\n",
            VERIFICATION_PATTERN, self.version, self.debug, self.build_key
        )
    }

    /// Parse a record starting at `data`.
    pub fn parse(data: &[u8]) -> Result<Self, RecordError> {
        let mut version = None;
        let mut debug = None;
        let mut build_key = None;

        let mut tokenizer = Tokenizer::new(data);
        loop {
            match tokenizer.next_field() {
                Token::Field(key, value) => match key {
                    b"version" => {
                        let text = std::str::from_utf8(value)
                            .map_err(|_| RecordError::InvalidVersion(lossy(value)))?;
                        let parsed = PackedVersion::parse(text)
                            .ok_or_else(|| RecordError::InvalidVersion(text.to_string()))?;
                        version = Some(parsed);
                    }
                    b"debug" => debug = Some(value == b"true"),
                    b"buildkey" => build_key = Some(lossy(value)),
                    _ => {}
                },
                Token::End => break,
                Token::Malformed(offset) => return Err(RecordError::Malformed { offset }),
            }
        }

        Ok(Self {
            version: version.ok_or(RecordError::MissingField("version"))?,
            debug: debug.ok_or(RecordError::MissingField("debug"))?,
            build_key: build_key.ok_or(RecordError::MissingField("buildkey"))?,
        })
    }
}

impl fmt::Display for VerificationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {}, {}, build key \"{}\"",
            self.version,
            if self.debug { "debug" } else { "release" },
            self.build_key
        )
    }
}

/// Record parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("malformed verification record at byte {offset}")]
    Malformed { offset: usize },

    #[error("verification record lacks the \"{0}\" field")]
    MissingField(&'static str),

    #[error("invalid version \"{0}\" in verification record")]
    InvalidVersion(String),
}

/// One tokenizer step.
#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Field(&'a [u8], &'a [u8]),
    End,
    Malformed(usize),
}

struct Tokenizer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(data: &'a [u8]) -> Self {
        let capped = &data[..data.len().min(MAX_RECORD_LEN)];
        let end = capped.iter().position(|&b| b == 0).unwrap_or(capped.len());
        Self {
            data: &capped[..end],
            pos: 0,
        }
    }

    fn next_field(&mut self) -> Token<'a> {
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return Token::End;
        }
        let Some(line_len) = rest.iter().position(|&b| b == b'\n') else {
            return Token::Malformed(self.pos);
        };
        let line = &rest[..line_len];
        if line.is_empty() {
            return Token::End;
        }
        let Some(eq) = line.iter().position(|&b| b == b'=') else {
            return Token::Malformed(self.pos);
        };
        if eq == 0 {
            return Token::Malformed(self.pos);
        }
        self.pos += line_len + 1;
        Token::Field(&line[..eq], strip_cr(&line[eq + 1..]))
    }
}

fn strip_cr(value: &[u8]) -> &[u8] {
    value.strip_suffix(b"\r").unwrap_or(value)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
