//! `application/x-www-form-urlencoded` helpers for the provisioning portal.

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Percent-encodes everything except RFC 3986 unreserved characters.
pub fn encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0x0F) as usize] as char);
            }
        }
    }
    out
}

/// Decodes `+` as space and `%XX` escapes. A `%` that is not followed by two
/// hex digits is kept literally.
pub fn decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Iterates the decoded `name=value` pairs of a form body or query string.
/// Pairs without `=` yield an empty value.
pub fn pairs(input: &str) -> impl Iterator<Item = (String, String)> + '_ {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (decode(name), decode(value)),
            None => (decode(pair), String::new()),
        })
}

/// First decoded value for `name`, if present.
pub fn field(input: &str, name: &str) -> Option<String> {
    pairs(input).find(|(n, _)| n == name).map(|(_, v)| v)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_inverts_encode() {
        for s in [
            "MyNetwork",
            "Café Wi-Fi",
            "a+b=c&d",
            "100% sure",
            "ssid with spaces",
            "",
            "~._-",
        ] {
            assert_eq!(decode(&encode(s)), s);
        }
    }

    #[test]
    fn encode_escapes_reserved() {
        assert_eq!(encode("Connected to Home Net"), "Connected%20to%20Home%20Net");
        assert_eq!(encode("a&b"), "a%26b");
    }

    #[test]
    fn decode_plus_and_bad_escapes() {
        assert_eq!(decode("hello+world"), "hello world");
        assert_eq!(decode("50%"), "50%");
        assert_eq!(decode("%zz1"), "%zz1");
        assert_eq!(decode("%41%42"), "AB");
    }

    #[test]
    fn form_fields() {
        let body = "ssid=Home+Net&password=p%40ss&extra";
        assert_eq!(field(body, "ssid").as_deref(), Some("Home Net"));
        assert_eq!(field(body, "password").as_deref(), Some("p@ss"));
        assert_eq!(field(body, "extra").as_deref(), Some(""));
        assert_eq!(field(body, "missing"), None);
    }
}
