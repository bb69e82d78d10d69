//! services/language.rs
//! Source language, chosen from the file extension.
//!
//! The language decides two things: where a line comment starts (so the
//! detectors can honour comment placement) and which rewrite the fixer emits.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    /// JavaScript, TypeScript and the single-file component formats.
    Script,
    Ruby,
    Php,
    Go,
    Shell,
    Rust,
    /// C and C++ sources and headers.
    C,
    /// Java, Kotlin and Scala.
    Jvm,
    CSharp,
    Swift,
    Other,
}

/// Line-comment and string-literal rules for one language.
#[derive(Debug, Clone, Copy)]
pub struct CommentSyntax {
    /// `#` opens a comment.
    pub hash: bool,
    /// `//` opens a comment.
    pub slash: bool,
    /// Bytes that open a string literal closed by the same byte.
    pub quotes: &'static [u8],
    /// `'` opens a char literal when closed within one char, else it is a lifetime.
    pub char_literals: bool,
}

impl Language {
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Self::for_extension(&ext)
    }

    pub fn for_extension(ext: &str) -> Self {
        match ext {
            "py" | "pyw" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "vue" | "svelte" => Language::Script,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "go" => Language::Go,
            "sh" | "bash" => Language::Shell,
            "rs" => Language::Rust,
            "c" | "h" | "cpp" | "cc" | "cxx" | "hpp" => Language::C,
            "java" | "kt" | "scala" => Language::Jvm,
            "cs" => Language::CSharp,
            "swift" => Language::Swift,
            _ => Language::Other,
        }
    }

    pub fn comment_syntax(&self) -> CommentSyntax {
        const HASH: CommentSyntax = CommentSyntax {
            hash: true,
            slash: false,
            quotes: b"\"'`",
            char_literals: false,
        };
        const SLASH: CommentSyntax = CommentSyntax {
            hash: false,
            slash: true,
            quotes: b"\"'`",
            char_literals: false,
        };
        match self {
            Language::Python | Language::Ruby | Language::Shell => HASH,
            Language::Script | Language::Go | Language::C | Language::Jvm | Language::CSharp => SLASH,
            Language::Rust => CommentSyntax {
                quotes: b"\"",
                char_literals: true,
                ..SLASH
            },
            Language::Swift => CommentSyntax {
                quotes: b"\"",
                ..SLASH
            },
            Language::Php => CommentSyntax {
                hash: true,
                ..SLASH
            },
            Language::Other => CommentSyntax { hash: true, ..SLASH },
        }
    }

    /// Marker used to comment out a whole line.
    pub fn line_comment(&self) -> &'static str {
        if self.comment_syntax().slash { "//" } else { "#" }
    }
}

/// Byte offset where a line comment starts, ignoring quoted text.
pub fn comment_start(line: &str, lang: Language) -> Option<usize> {
    let syntax = lang.comment_syntax();
    let bytes = line.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 1;
            } else if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' if syntax.char_literals => {
                i += char_literal_len(&line[i..]).unwrap_or(1);
                continue;
            }
            _ if syntax.quotes.contains(&b) => quote = Some(b),
            // PHP 8 attributes start with `#[`.
            b'#' if syntax.hash && !(lang == Language::Php && bytes.get(i + 1) == Some(&b'[')) => {
                return Some(i);
            }
            b'/' if syntax.slash && bytes.get(i + 1) == Some(&b'/') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Byte length of a char literal starting at `rest` (which begins with `'`),
/// or `None` when the quote is a lifetime or label.
fn char_literal_len(rest: &str) -> Option<usize> {
    let mut chars = rest.char_indices().skip(1);
    let (_, first) = chars.next()?;
    if first == '\\' {
        return rest.get(3..)?.find('\'').map(|end| end + 4);
    }
    match chars.next() {
        Some((at, '\'')) => Some(at + 1),
        _ => None,
    }
}
