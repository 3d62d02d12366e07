// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framing contract for incoming telemetry lines.
//!
//! A line is accepted as a frame when, after stripping whitespace and `:`
//! separators and uppercasing, it is made only of hex digits, is at least
//! [`MIN_FRAME_LEN`] characters long and starts with [`FRAME_HEADER`]. The
//! payload itself is never decoded; accepted frames are passed through in
//! their normalized form.

use derive_more::Display;

use crate::errors::FrameError;

/// Protocol marker every frame must start with.
pub const FRAME_HEADER: &str = "FEDC";

/// Minimum number of hex characters in a normalized frame.
pub const MIN_FRAME_LEN: usize = 32;

/// A validated, normalized (uppercase, separator-free) hex frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub struct HexFrame(String);

impl HexFrame {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `max` characters, for log lines.
    pub fn preview(&self, max: usize) -> &str {
        preview(&self.0, max)
    }
}

/// Strips whitespace and `:` separators and uppercases what remains.
pub fn normalize(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .flat_map(char::to_uppercase)
        .collect()
}

/// Checks `line` against the framing contract.
///
/// Rules are evaluated in order and the first failing rule decides the
/// error: empty, non-hex characters, too short, wrong header.
///
/// ```
/// use tcp_ingestion::frame::validate;
///
/// let frame = validate("fe dc:0116 0985 2275 4E00 0000 0103 001E 0000").unwrap();
/// assert_eq!(frame.as_str(), "FEDC0116098522754E0000000103001E0000");
/// assert!(validate("FEDC1234").is_err());
/// ```
pub fn validate(line: &str) -> Result<HexFrame, FrameError> {
    if line.trim().is_empty() {
        return Err(FrameError::Empty);
    }

    let normalized = normalize(line);
    if normalized.is_empty() {
        return Err(FrameError::Empty);
    }

    if let Some((position, found)) = normalized
        .char_indices()
        .find(|(_, c)| !c.is_ascii_hexdigit())
    {
        return Err(FrameError::NonHex { found, position });
    }

    if normalized.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort {
            length: normalized.len(),
            minimum: MIN_FRAME_LEN,
        });
    }

    if !normalized.starts_with(FRAME_HEADER) {
        return Err(FrameError::BadHeader {
            found: preview(&normalized, 8).to_string(),
            expected: FRAME_HEADER,
        });
    }

    Ok(HexFrame(normalized))
}

/// Returns at most `max` characters of `s` without splitting a code point.
pub(crate) fn preview(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE_FRAME: &str = "FEDC0116098522754E0000000103001E00000032000000640000000A00000014000000050000012C000000500000000000000001";

    #[test]
    fn accepts_sample_frame() {
        let frame = validate(SAMPLE_FRAME).unwrap();
        assert_eq!(frame.as_str(), SAMPLE_FRAME);
    }

    #[test]
    fn accepts_lowercase_with_separators() {
        let line = "fe dc:01 16 09 85 22 75 4e 00 00 00 01 03 00 1e 00";
        let frame = validate(line).unwrap();
        assert_eq!(frame.as_str(), "FEDC0116098522754E0000000103001E00");
    }

    #[test]
    fn rejects_empty_and_blank_lines() {
        assert_eq!(validate(""), Err(FrameError::Empty));
        assert_eq!(validate("   \t "), Err(FrameError::Empty));
        assert_eq!(validate(" :: : "), Err(FrameError::Empty));
    }

    #[test]
    fn rejects_wrong_header() {
        let line = format!("AAAA{}", "0".repeat(60));
        assert_eq!(
            validate(&line),
            Err(FrameError::BadHeader {
                found: "AAAA0000".to_string(),
                expected: FRAME_HEADER
            })
        );
    }

    #[test]
    fn rejects_short_frame() {
        assert_eq!(
            validate("FEDC1234"),
            Err(FrameError::TooShort {
                length: 8,
                minimum: MIN_FRAME_LEN
            })
        );
    }

    #[test]
    fn non_hex_is_reported_before_length() {
        assert_eq!(
            validate("FEDCXY"),
            Err(FrameError::NonHex {
                found: 'X',
                position: 4
            })
        );
    }

    #[test]
    fn length_is_checked_before_header() {
        let err = validate("ABCD").unwrap_err();
        assert!(matches!(err, FrameError::TooShort { length: 4, .. }));
    }

    #[test]
    fn exactly_minimum_length_is_accepted() {
        let line = format!("FEDC{}", "0".repeat(MIN_FRAME_LEN - 4));
        assert!(validate(&line).is_ok());
        let line = format!("FEDC{}", "0".repeat(MIN_FRAME_LEN - 5));
        assert!(validate(&line).is_err());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("abc", 10), "abc");
    }

    fn is_acceptable(normalized: &str) -> bool {
        !normalized.is_empty()
            && normalized.chars().all(|c| c.is_ascii_hexdigit())
            && normalized.len() >= MIN_FRAME_LEN
            && normalized.starts_with(FRAME_HEADER)
    }

    proptest! {
        #[test]
        fn accepts_iff_contract_holds(line in "[0-9a-fA-FxyzXYZ :\t]{0,80}") {
            let normalized = normalize(&line);
            prop_assert_eq!(validate(&line).is_ok(), is_acceptable(&normalized));
        }

        #[test]
        fn valid_frames_always_accepted(body in "[0-9A-F]{28,120}") {
            let line = format!("FEDC{body}");
            let frame = validate(&line).unwrap();
            prop_assert_eq!(frame.as_str(), line.as_str());
        }

        #[test]
        fn separators_and_case_do_not_matter(body in "[0-9a-f]{28,64}", sep in "[ :\t]{0,2}") {
            let upper = format!("FEDC{}", body.to_uppercase());
            let spaced: String = format!("fe{sep}dc{sep}{body}");
            prop_assert_eq!(normalize(&spaced), upper.clone());
            let frame = validate(&spaced).unwrap();
            prop_assert_eq!(frame.as_str(), upper.as_str());
        }
    }
}
