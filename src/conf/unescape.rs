//! Backslash escape decoding for committed arguments.

/// Decode backslash escapes: `\a \b \f \n \r \t \v \\`, `\xHH`, `\uHHHH`,
/// `\UHHHHHHHH` and three-digit octal `\ooo`.
///
/// A backslash not starting a valid escape is kept as-is.
pub fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(at) = rest.find('\\') {
        out.push_str(&rest[..at]);
        let tail = &rest[at + 1..];
        match decode_escape(tail) {
            Some((ch, used)) => {
                out.push(ch);
                rest = &tail[used..];
            }
            None => {
                out.push('\\');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode the escape at the start of `tail` (the text after a backslash).
/// Returns the character and the number of bytes consumed.
fn decode_escape(tail: &str) -> Option<(char, usize)> {
    let first = tail.chars().next()?;
    let simple = match first {
        'a' => Some('\x07'),
        'b' => Some('\x08'),
        'f' => Some('\x0c'),
        'n' => Some('\n'),
        'r' => Some('\r'),
        't' => Some('\t'),
        'v' => Some('\x0b'),
        '\\' => Some('\\'),
        _ => None,
    };
    if let Some(ch) = simple {
        return Some((ch, 1));
    }

    match first {
        'x' => hex(tail, 2),
        'u' => hex(tail, 4),
        'U' => hex(tail, 8),
        '0'..='7' => {
            let digits = tail.get(..3)?;
            let value = u32::from_str_radix(digits, 8).ok()?;
            if value > 0xff {
                return None;
            }
            char::from_u32(value).map(|ch| (ch, 3))
        }
        _ => None,
    }
}

fn hex(tail: &str, len: usize) -> Option<(char, usize)> {
    let digits = tail.get(1..=len)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let value = u32::from_str_radix(digits, 16).ok()?;
    char::from_u32(value).map(|ch| (ch, len + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prifma_test_support::test_report;

    #[test]
    fn test_simple_escapes() {
        let t = test_report!("Single-letter escapes decode to control characters");
        t.assert_eq("newline/tab", &unescape(r"a\nb\tc"), &"a\nb\tc".to_string());
        t.assert_eq("backslash", &unescape(r"a\\b"), &"a\\b".to_string());
        t.assert_eq("bell", &unescape(r"\a"), &"\x07".to_string());
    }

    #[test]
    fn test_numeric_escapes() {
        let t = test_report!("Hex, unicode and octal escapes decode");
        t.assert_eq("hex", &unescape(r"\x41"), &"A".to_string());
        t.assert_eq("u4", &unescape(r"\u00e9"), &"é".to_string());
        t.assert_eq("U8", &unescape(r"\U0001F600"), &"😀".to_string());
        t.assert_eq("octal", &unescape(r"\101"), &"A".to_string());
    }

    #[test]
    fn test_invalid_escape_kept() {
        let t = test_report!("Unknown or truncated escapes are kept verbatim");
        t.assert_eq("unknown", &unescape(r"\q"), &r"\q".to_string());
        t.assert_eq("short hex", &unescape(r"\x4"), &r"\x4".to_string());
        t.assert_eq("octal overflow", &unescape(r"\777"), &r"\777".to_string());
        t.assert_eq("trailing", &unescape("abc\\"), &"abc\\".to_string());
    }
}
