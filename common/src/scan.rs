//! Tolerant key/value extraction for loosely structured command payloads.
//!
//! Inbound payloads look like JSON but are not required to be: extra fields,
//! reordered fields, single quotes, and bare words must all pass through.
//! These scanners pull one value out by substring search rather than parsing
//! a grammar, mirroring the "ignore unknown fields, reject on missing
//! required fields" contract of the protocol.

/// Longest value token the control grammar accepts.
const MAX_TOKEN_LEN: usize = 15;

/// Extract the unsigned integer following `key:` anywhere in `src`.
///
/// Whitespace between the colon and the digits is skipped. Returns `None`
/// when the key, the colon, or the digit run is missing.
pub fn scan_uint(src: &str, key: &str) -> Option<u64> {
    let after_key = &src[src.find(key)? + key.len()..];
    let after_colon = &after_key[after_key.find(':')? + 1..];
    let value = after_colon.trim_start();

    let digits = value.len() - value.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }

    value[..digits].parse().ok()
}

/// Extract the value token following `key:` anywhere in `src`.
///
/// The value may open with a single or double quote; the token ends at a
/// quote, comma, or whitespace and is bounded to [`MAX_TOKEN_LEN`] bytes.
pub fn scan_token<'a>(src: &'a str, key: &str) -> Option<&'a str> {
    let after_key = &src[src.find(key)? + key.len()..];
    let after_colon = &after_key[after_key.find(':')? + 1..];
    let mut value = after_colon.trim_start();

    if let Some(rest) = value.strip_prefix(['"', '\'']) {
        value = rest;
    }

    Some(take_token(value))
}

/// Leading token of a bareword payload, with the same terminators and
/// length bound as [`scan_token`].
pub fn bare_token(src: &str) -> &str {
    take_token(src.trim_start())
}

// The cut point is compared against the char's end, not its start, so the
// token never exceeds MAX_TOKEN_LEN bytes and always ends on a boundary.
fn take_token(src: &str) -> &str {
    let mut end = src.len();
    for (i, c) in src.char_indices() {
        if i + c.len_utf8() > MAX_TOKEN_LEN || matches!(c, '"' | '\'' | ',') || c.is_whitespace() {
            end = i;
            break;
        }
    }
    &src[..end]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scans_uint_from_json_like_payload() {
        let payload = r#"{"interval":3600,"duration":30}"#;

        assert_eq!(scan_uint(payload, "interval"), Some(3_600));
        assert_eq!(scan_uint(payload, "duration"), Some(30));
    }

    #[test]
    fn tolerates_field_order_whitespace_and_extras() {
        let payload = r#"{"zone":"front", "duration" : 45 ,"interval":7200}"#;

        assert_eq!(scan_uint(payload, "interval"), Some(7_200));
        assert_eq!(scan_uint(payload, "duration"), Some(45));
    }

    #[test]
    fn missing_key_colon_or_digits_yields_none() {
        assert_eq!(scan_uint("{}", "interval"), None);
        assert_eq!(scan_uint("interval 3600", "interval"), None);
        assert_eq!(scan_uint(r#"{"interval":"soon"}"#, "interval"), None);
    }

    #[test]
    fn scans_quoted_and_unquoted_tokens() {
        assert_eq!(scan_token(r#"{"output":"ON"}"#, "output"), Some("ON"));
        assert_eq!(scan_token("{'output':'off'}", "output"), Some("off"));
        assert_eq!(scan_token("output: ON, mode: auto", "output"), Some("ON"));
    }

    #[test]
    fn token_length_is_bounded() {
        let payload = format!("output:{}", "X".repeat(64));
        assert_eq!(scan_token(&payload, "output"), Some("XXXXXXXXXXXXXXX"));
    }

    #[test]
    fn multibyte_token_stays_within_byte_bound() {
        // Each `é` is two bytes; eight of them would be 16 bytes, one past
        // the cap, so the cut lands after the seventh.
        let payload = format!("output:{}", "é".repeat(8));
        let token = scan_token(&payload, "output").unwrap();

        assert_eq!(token, "é".repeat(7));
        assert!(token.len() <= 15);

        assert_eq!(bare_token("ééééééé ON"), "ééééééé");
    }

    #[test]
    fn bare_token_stops_at_terminators() {
        assert_eq!(bare_token("ON"), "ON");
        assert_eq!(bare_token("  off\n"), "off");
        assert_eq!(bare_token("ON,extra"), "ON");
        assert_eq!(bare_token(""), "");
    }
}
