pub mod dn;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Splits status line arguments into space delimited fields, collapsing
/// consecutive separators.
pub fn split_fields(args: &str) -> Vec<&str> {
    args.split(' ').filter(|field| !field.is_empty()).collect()
}

fn hex_to_byte(high: u8, low: u8) -> Option<u8> {
    let digit = |byte: u8| (byte as char).to_digit(16).map(|value| value as u8);
    Some(digit(high)? * 16 + digit(low)?)
}

/// Decodes a C formatted string as used for user IDs in colon listings. The
/// engines escape special characters with the usual C backslash sequences
/// plus `\xNN`; a `\x00` is not representable and stays as a literal `\0`.
/// Invalid escapes are copied through verbatim.
pub fn decode_c_string(src: &str) -> String {
    let mut decoded = Vec::with_capacity(src.len());
    let mut bytes = src.bytes().peekable();

    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            decoded.push(byte);
            continue;
        }

        match bytes.peek() {
            Some(b'\'') => { bytes.next(); decoded.push(b'\''); },
            Some(b'"')  => { bytes.next(); decoded.push(b'"');  },
            Some(b'?')  => { bytes.next(); decoded.push(b'?');  },
            Some(b'\\') => { bytes.next(); decoded.push(b'\\'); },
            Some(b'a')  => { bytes.next(); decoded.push(0x07);  },
            Some(b'b')  => { bytes.next(); decoded.push(0x08);  },
            Some(b'f')  => { bytes.next(); decoded.push(0x0c);  },
            Some(b'n')  => { bytes.next(); decoded.push(b'\n'); },
            Some(b'r')  => { bytes.next(); decoded.push(b'\r'); },
            Some(b't')  => { bytes.next(); decoded.push(b'\t'); },
            Some(b'v')  => { bytes.next(); decoded.push(0x0b);  },
            Some(b'x') => {
                let tail: Vec<u8> = bytes.clone().take(3).collect();
                match tail[..] {
                    [b'x', high, low] if hex_to_byte(high, low).is_some() => {
                        let value = hex_to_byte(high, low).unwrap();
                        bytes.nth(2);
                        if value == 0 {
                            decoded.extend_from_slice(b"\\0");
                        } else {
                            decoded.push(value);
                        }
                    },
                    _ => decoded.push(b'\\'),
                }
            },
            _ => decoded.push(b'\\'),
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

/// Decodes a percent escaped string (notation data, policy URLs).
pub fn decode_percent_string(src: &str) -> String {
    let mut decoded = Vec::with_capacity(src.len());
    let mut bytes = src.bytes().peekable();

    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            decoded.push(byte);
            continue;
        }

        let tail: Vec<u8> = bytes.clone().take(2).collect();
        match tail[..] {
            [high, low] if hex_to_byte(high, low).is_some() => {
                decoded.push(hex_to_byte(high, low).unwrap());
                bytes.nth(1);
            },
            _ => decoded.push(b'%'),
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

/// Percent escapes a string for the engines. The `+` character is escaped
/// because the result might be fed through the "percent plus" decoder, and
/// escaping spaces keeps it valid either way.
pub fn encode_percent_string(src: &str) -> String {
    let mut encoded = String::with_capacity(src.len());

    for byte in src.bytes() {
        if byte == b'+' || byte == b'"' || byte == b'%' || byte <= 0x20 {
            encoded.push_str(&format!("%{:02X}", byte));
        } else {
            encoded.push(byte as char);
        }
    }

    encoded
}

/// Parses an engine timestamp which is either seconds since epoch or the
/// ISO 8601 basic format (`20390815T143012`, UTC). Empty and zero values
/// mean that no time is available.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim_start_matches(' ');
    if value.is_empty() {
        return None;
    }

    if value.len() >= 15 && value.as_bytes()[8] == b'T' {
        let time = NaiveDateTime::parse_from_str(&value[..15], "%Y%m%dT%H%M%S").ok()?;
        return Some(time.and_utc());
    }

    match value.parse::<i64>() {
        Ok(0) | Err(_) => None,
        Ok(seconds) => Utc.timestamp_opt(seconds, 0).single(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest(src, expected,
        case("plain", "plain"),
        case(r"Mallory \x3cmallory@example.net\x3e", "Mallory <mallory@example.net>"),
        case(r"colon\x3a\x3a", "colon::"),
        case(r"line\nbreak", "line\nbreak"),
        case(r"tab\there", "tab\there"),
        case("quoted \\\"name\\\"", "quoted \"name\""),
        case(r"back\\slash", r"back\slash"),
        case(r"nul\x00byte", r"nul\0byte"),
        case(r"trailing\", r"trailing\"),
        case(r"broken\xZZpair", r"broken\xZZpair"),
    )]
    fn c_string_decoding(src: &str, expected: &str) {
        assert_eq!(decode_c_string(src), expected);
    }

    #[test]
    fn c_string_round_trip() {
        // The inverse of what the engine's escaper does for uid fields
        let escape = |value: &str| -> String {
            let mut escaped = String::new();
            for byte in value.bytes() {
                match byte {
                    b'\\' => escaped.push_str(r"\\"),
                    b'\n' => escaped.push_str(r"\n"),
                    b'\r' => escaped.push_str(r"\r"),
                    b':' => escaped.push_str(r"\x3a"),
                    byte if byte < 0x20 || byte == 0x7f => {
                        escaped.push_str(&format!(r"\x{:02x}", byte));
                    },
                    byte => escaped.push(byte as char),
                }
            }
            escaped
        };

        for original in [
            "Alfa Test (demo key) <alfa@example.net>",
            "strange: uid\nwith\tcontrol\x01bytes",
            r"C:\Users\alfa",
        ] {
            assert_eq!(decode_c_string(&escape(original)), original);
        }
    }

    #[rstest(src, expected,
        case("simple", "simple"),
        case("with%20space", "with space"),
        case("plus%2Bsign", "plus+sign"),
        case("dangling%2", "dangling%2"),
    )]
    fn percent_decoding(src: &str, expected: &str) {
        assert_eq!(decode_percent_string(src), expected);
    }

    #[test]
    fn percent_round_trip() {
        for original in ["short value", "a+b%c\"d", "\x01\x02 \x7e"] {
            assert_eq!(decode_percent_string(&encode_percent_string(original)), original);
        }
    }

    #[rstest(value, expected,
        case("", None),
        case("0", None),
        case("garbage", None),
        case("1577836800", Some("2020-01-01 00:00:00")),
        case("20390815T143012", Some("2039-08-15 14:30:12")),
    )]
    fn timestamps(value: &str, expected: Option<&str>) {
        let parsed = parse_timestamp(value)
            .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string());
        assert_eq!(parsed.as_deref(), expected);
    }
}
