use std::fmt;

use crate::core::OpResult;

// RFC 2253 distinguished names as emitted by the CMS engine in certificate
// listings. The parser is not validating: the engine is expected to produce
// well-formed strings, everything else is an error.

const OID_ALIASES: &[(&str, &str)] = &[
    ("SP", "ST"),
    ("NameDistinguisher", "0.2.262.1.10.7.20"),
    ("EMAIL", "1.2.840.113549.1.9.1"),
    ("SN", "2.5.4.4"),
    ("SerialNumber", "2.5.4.5"),
    ("T", "2.5.4.12"),
    ("D", "2.5.4.13"),
    ("BC", "2.5.4.15"),
    ("ADDR", "2.5.4.16"),
    ("PC", "2.5.4.17"),
    ("GN", "2.5.4.42"),
    ("Pseudo", "2.5.4.65"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct DnAttribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dn {
    attributes: Vec<DnAttribute>,
}

impl Dn {
    pub fn parse(dn: &str) -> OpResult<Dn> {
        let bytes = dn.as_bytes();
        let mut attributes = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            while pos < bytes.len() && bytes[pos] == b' ' {
                pos += 1;
            }
            if pos == bytes.len() {
                break;
            }

            let attribute = parse_part(bytes, &mut pos)?;
            attributes.push(attribute);

            while pos < bytes.len() && bytes[pos] == b' ' {
                pos += 1;
            }
            if pos < bytes.len() {
                match bytes[pos] {
                    b',' | b';' | b'+' => pos += 1,
                    delimiter => return Err!(
                        "Invalid DN {:?}: unexpected delimiter {:?}", dn, delimiter as char),
                }
            }
        }

        Ok(Dn {attributes})
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
            .map(|attribute| attribute.value.as_str())
    }

    pub fn attributes(&self) -> &[DnAttribute] {
        &self.attributes
    }

    /// Returns a copy with the attributes rearranged according to the passed
    /// name order. The special `_X_` entry marks the position of all
    /// attributes the order doesn't mention, preserving their original order.
    pub fn reordered(&self, order: &[&str]) -> Dn {
        let mut unknown: Vec<DnAttribute> = self.attributes.iter()
            .filter(|attribute| !order.contains(&attribute.name.as_str()))
            .cloned().collect();

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for &name in order {
            if name == "_X_" {
                attributes.append(&mut unknown);
            } else {
                attributes.extend(self.attributes.iter()
                    .filter(|attribute| attribute.name == name).cloned());
            }
        }

        Dn {attributes}
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;

        for attribute in &self.attributes {
            if attribute.name.is_empty() || attribute.value.is_empty() {
                continue;
            }
            if !first {
                formatter.write_str(",")?;
            }
            first = false;
            write!(formatter, "{}={}", attribute.name.trim(), escape(attribute.value.trim()))?;
        }

        Ok(())
    }
}

fn parse_part(bytes: &[u8], pos: &mut usize) -> OpResult<DnAttribute> {
    let start = *pos;
    while *pos < bytes.len() && bytes[*pos] != b'=' {
        *pos += 1;
    }
    if *pos == bytes.len() || *pos == start {
        return Err!("Invalid DN: missing attribute type");
    }

    let mut name = String::from_utf8_lossy(&bytes[start..*pos]).trim_end().to_owned();
    for (alias, oid) in OID_ALIASES {
        if name.eq_ignore_ascii_case(oid) {
            name = (*alias).to_owned();
            break;
        }
    }
    *pos += 1;

    let value = if *pos < bytes.len() && bytes[*pos] == b'#' {
        *pos += 1;
        let start = *pos;
        while *pos < bytes.len() && (bytes[*pos] as char).is_ascii_hexdigit() {
            *pos += 1;
        }

        let digits = &bytes[start..*pos];
        if digits.is_empty() || digits.len() % 2 != 0 {
            return Err!("Invalid DN: malformed hex string value");
        }

        let decoded = hex::decode(digits).map_err(|e| format!("Invalid DN: {}", e))?;
        String::from_utf8_lossy(&decoded).into_owned()
    } else {
        let mut decoded = Vec::new();

        while *pos < bytes.len() {
            match bytes[*pos] {
                b'\\' => {
                    *pos += 1;
                    match bytes.get(*pos) {
                        Some(byte @ (b',' | b'=' | b'+' | b'<' | b'>' | b'#' | b';' | b'\\' | b'"' | b' ')) => {
                            decoded.push(*byte);
                            *pos += 1;
                        },
                        Some(&high) if (high as char).is_ascii_hexdigit()
                            && bytes.get(*pos + 1).is_some_and(|&low| (low as char).is_ascii_hexdigit()) =>
                        {
                            let pair = [high, bytes[*pos + 1]];
                            decoded.extend(hex::decode(pair).unwrap());
                            *pos += 2;
                        },
                        _ => return Err!("Invalid DN: invalid escape sequence"),
                    }
                },
                b'"' => return Err!("Invalid DN: unexpected quote character"),
                b',' | b'=' | b'+' | b'<' | b'>' | b'#' | b';' => break,
                byte => {
                    decoded.push(byte);
                    *pos += 1;
                },
            }
        }

        String::from_utf8_lossy(&decoded).into_owned()
    };

    Ok(DnAttribute {name, value})
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for character in value.chars() {
        if matches!(character, ',' | '+' | '"' | '\\' | '<' | '>' | ';') {
            escaped.push('\\');
        }
        escaped.push(character);
    }

    escaped
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn parsing() {
        let dn = Dn::parse("CN=Before\\0DAfter,OU=Test,DC=North America,DC=Fabrikam,DC=COM").unwrap();

        assert_eq!(dn.attribute("cn"), Some("Before\rAfter"));
        assert_eq!(dn.attribute("OU"), Some("Test"));
        assert_eq!(dn.attribute("DC"), Some("North America"));
        assert_eq!(dn.to_string(), "CN=Before\rAfter,OU=Test,DC=North America,DC=Fabrikam,DC=COM");
    }

    #[test]
    fn reordering() {
        let dn = Dn::parse("CN=Before\\0DAfter,OU=Test,DC=North America,DC=Fabrikam,DC=COM").unwrap();
        assert_eq!(dn.reordered(&["DC", "OU", "CN"]).to_string(),
                   "DC=North America,DC=Fabrikam,DC=COM,OU=Test,CN=Before\rAfter");
    }

    #[rstest(dn, name, value,
        case("CN=Doe\\, John,O=ACME", "CN", "Doe, John"),
        case("2.5.4.5=#303132", "SerialNumber", "012"),
        case("1.2.840.113549.1.9.1=john@example.net", "EMAIL", "john@example.net"),
        case("CN =spaced", "CN", "spaced"),
        case("O=back\\\\slash", "O", "back\\slash"),
    )]
    fn attributes(dn: &str, name: &str, value: &str) {
        let dn = Dn::parse(dn).unwrap();
        assert_eq!(dn.attribute(name), Some(value));
    }

    #[rstest(dn,
        case("CN"),
        case("=value"),
        case("CN=\"quoted\""),
        case("CN=odd,#303"),
        case("CN=a\\!b"),
    )]
    fn invalid(dn: &str) {
        assert!(Dn::parse(dn).is_err());
    }

    #[test]
    fn escape_round_trip() {
        let original = Dn::parse("CN=Doe\\, John\\+Jr,OU=R\\>D,O=A\\\\B").unwrap();
        let reparsed = Dn::parse(&original.to_string()).unwrap();
        assert_eq!(original, reparsed);
    }
}
