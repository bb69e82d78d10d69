//! Ordered text-decoding chain shared by the scanner and the fixer.
//!
//! UTF-8 first, then `latin-1`, `cp1252`, `iso-8859-1`. The single-byte
//! decoders refuse NUL bytes: a file carrying them is binary and must surface
//! as an encoding diagnostic rather than be coerced into text.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8,
    Latin1,
    Cp1252,
    Iso8859_1,
}

impl TextEncoding {
    pub const FALLBACK_CHAIN: [TextEncoding; 4] = [
        TextEncoding::Utf8,
        TextEncoding::Latin1,
        TextEncoding::Cp1252,
        TextEncoding::Iso8859_1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "latin-1",
            TextEncoding::Cp1252 => "cp1252",
            TextEncoding::Iso8859_1 => "iso-8859-1",
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => {
                if bytes.contains(&0) {
                    return None;
                }
                std::str::from_utf8(bytes).ok().map(str::to_string)
            }
            TextEncoding::Latin1 | TextEncoding::Iso8859_1 => {
                if bytes.contains(&0) {
                    return None;
                }
                Some(bytes.iter().map(|&b| b as char).collect())
            }
            TextEncoding::Cp1252 => {
                let mut out = String::with_capacity(bytes.len());
                for &b in bytes {
                    out.push(cp1252_char(b)?);
                }
                Some(out)
            }
        }
    }
}

/// Decode `bytes` with the first encoding in the chain that accepts them.
pub fn decode_with_fallback(bytes: &[u8]) -> Option<(String, TextEncoding)> {
    TextEncoding::FALLBACK_CHAIN
        .iter()
        .find_map(|enc| enc.decode(bytes).map(|text| (text, *enc)))
}

// 0x80..=0x9F differ from latin-1; five code points are unassigned.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'), None, Some('\u{201A}'), Some('\u{0192}'),
    Some('\u{201E}'), Some('\u{2026}'), Some('\u{2020}'), Some('\u{2021}'),
    Some('\u{02C6}'), Some('\u{2030}'), Some('\u{0160}'), Some('\u{2039}'),
    Some('\u{0152}'), None, Some('\u{017D}'), None,
    None, Some('\u{2018}'), Some('\u{2019}'), Some('\u{201C}'),
    Some('\u{201D}'), Some('\u{2022}'), Some('\u{2013}'), Some('\u{2014}'),
    Some('\u{02DC}'), Some('\u{2122}'), Some('\u{0161}'), Some('\u{203A}'),
    Some('\u{0153}'), None, Some('\u{017E}'), Some('\u{0178}'),
];

fn cp1252_char(b: u8) -> Option<char> {
    match b {
        0 => None,
        0x80..=0x9F => CP1252_HIGH[(b - 0x80) as usize],
        _ => Some(b as char),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_wins_when_valid() {
        let (text, enc) = decode_with_fallback("café\n".as_bytes()).unwrap();
        assert_eq!(text, "café\n");
        assert_eq!(enc, TextEncoding::Utf8);
    }

    #[test]
    fn latin1_catches_invalid_utf8() {
        let (text, enc) = decode_with_fallback(b"# caf\xe9\nexcept:\n").unwrap();
        assert_eq!(enc, TextEncoding::Latin1);
        assert_eq!(text, "# café\nexcept:\n");
    }

    #[test]
    fn binary_content_exhausts_the_chain() {
        assert!(decode_with_fallback(b"\x00\x01\x02").is_none());
    }

    #[test]
    fn cp1252_maps_smart_quotes() {
        assert_eq!(
            TextEncoding::Cp1252.decode(b"\x93hi\x94").as_deref(),
            Some("\u{201C}hi\u{201D}")
        );
        assert!(TextEncoding::Cp1252.decode(b"\x81").is_none());
    }
}
