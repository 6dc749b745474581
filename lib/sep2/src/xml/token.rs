//! Streaming XML tokenizer.
//!
//! Produces one token per call over a possibly-truncated buffer. When the
//! buffer ends mid-token the tokenizer returns [`Tok::Incomplete`] without
//! consuming anything, so the caller can swap in a longer copy of the same
//! stream ([`Tokenizer::rebuffer`]) and re-read the same token.
//!
//! This is not a general XML processor: it handles exactly the shape of
//! IEEE 2030.5 payloads (a single optional declaration, elements with
//! quoted attributes, character content with the five predefined entities
//! and numeric character references, comments). Whitespace-only runs
//! between tags are skipped and character content is trimmed.

use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tok {
    Decl,
    StartTag,
    EmptyTag,
    EndTag,
    Text,
    /// More input is needed; nothing was consumed.
    Incomplete,
    Invalid,
}

pub struct Tokenizer {
    buf: Vec<u8>,
    pos: usize,
    name: String,
    attrs: SmallVec<[(String, String); 8]>,
    content: String,
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'.' | b'-')
}

/// Decode character content: expand the predefined entities and numeric
/// character references. `None` means malformed.
fn decode_text(raw: &[u8]) -> Option<String> {
    let raw = core::str::from_utf8(raw).ok()?;
    if !raw.contains('&') {
        return Some(raw.to_owned());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let entity = &rest[amp + 1..];
        let semi = entity.find(';')?;
        let (name, tail) = (&entity[..semi], &entity[semi + 1..]);
        match name {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = name.strip_prefix('#')?;
                let value = match code.strip_prefix('x') {
                    Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                    None => code.parse().ok()?,
                };
                out.push(char::from_u32(value)?);
            }
        }
        rest = tail;
    }
    out.push_str(rest);
    Some(out)
}

impl Tokenizer {
    pub fn new(data: &[u8]) -> Tokenizer {
        Tokenizer {
            buf: data.to_vec(),
            pos: 0,
            name: String::new(),
            attrs: SmallVec::new(),
            content: String::new(),
        }
    }

    /// Replace the buffer with a longer copy of the same stream. The
    /// consumed prefix must be unchanged; the read position carries over.
    pub fn rebuffer(&mut self, data: &[u8]) {
        self.buf = data.to_vec();
    }

    /// Name of the tag produced by the last `StartTag`/`EmptyTag`/`EndTag`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Case-sensitive attribute lookup in the last open tag.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    /// Character content of the last `Text` token.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn token(&mut self) -> Tok {
        let mut p = self.pos;
        loop {
            while p < self.buf.len() && is_ws(self.buf[p]) {
                p += 1;
            }
            if p == self.buf.len() {
                return Tok::Incomplete;
            }
            if self.buf[p] != b'<' {
                // character content runs to the next tag
                let Some(lt) = self.buf[p..].iter().position(|&b| b == b'<') else {
                    return Tok::Incomplete;
                };
                let mut run = &self.buf[p..p + lt];
                while let [rest @ .., last] = run {
                    if is_ws(*last) {
                        run = rest;
                    } else {
                        break;
                    }
                }
                match decode_text(run) {
                    Some(text) => self.content = text,
                    None => return Tok::Invalid,
                }
                self.pos = p + lt;
                return Tok::Text;
            }
            if self.buf[p..].starts_with(b"<!--") {
                let Some(end) = self.buf[p + 4..].windows(3).position(|w| w == b"-->") else {
                    return Tok::Incomplete;
                };
                p += 4 + end + 3;
                continue;
            }
            // find the closing '>', skipping quoted attribute values
            let mut q = p + 1;
            let mut quote = 0u8;
            let end = loop {
                if q == self.buf.len() {
                    return Tok::Incomplete;
                }
                let b = self.buf[q];
                if quote != 0 {
                    if b == quote {
                        quote = 0;
                    }
                } else if b == b'"' || b == b'\'' {
                    quote = b;
                } else if b == b'>' {
                    break q;
                }
                q += 1;
            };
            let tok = self.scan_tag(p, end);
            if tok != Tok::Invalid {
                self.pos = end + 1;
            }
            return tok;
        }
    }

    /// Parse one complete tag occupying `buf[start..=end]`.
    fn scan_tag(&mut self, start: usize, end: usize) -> Tok {
        let inner = &self.buf[start + 1..end];
        if let Some(decl) = inner.strip_prefix(b"?") {
            if decl.starts_with(b"xml") && inner.ends_with(b"?") {
                return Tok::Decl;
            }
            return Tok::Invalid;
        }
        let (inner, closing) = match inner.strip_prefix(b"/") {
            Some(name) => (name, true),
            None => (inner, false),
        };
        let (inner, empty) = match inner.strip_suffix(b"/") {
            Some(rest) if !closing => (rest, true),
            _ => (inner, false),
        };

        let mut p = 0;
        if p == inner.len() || !is_name_start(inner[p]) {
            return Tok::Invalid;
        }
        while p < inner.len() && is_name_char(inner[p]) {
            p += 1;
        }
        self.name = match core::str::from_utf8(&inner[..p]) {
            Ok(name) => name.to_owned(),
            Err(_) => return Tok::Invalid,
        };

        if closing {
            return if inner[p..].iter().all(|&b| is_ws(b)) { Tok::EndTag } else { Tok::Invalid };
        }

        self.attrs.clear();
        loop {
            while p < inner.len() && is_ws(inner[p]) {
                p += 1;
            }
            if p == inner.len() {
                break;
            }
            let name_start = p;
            if !is_name_start(inner[p]) {
                return Tok::Invalid;
            }
            while p < inner.len() && is_name_char(inner[p]) {
                p += 1;
            }
            let name = &inner[name_start..p];
            while p < inner.len() && is_ws(inner[p]) {
                p += 1;
            }
            if p == inner.len() || inner[p] != b'=' {
                return Tok::Invalid;
            }
            p += 1;
            while p < inner.len() && is_ws(inner[p]) {
                p += 1;
            }
            if p == inner.len() || (inner[p] != b'"' && inner[p] != b'\'') {
                return Tok::Invalid;
            }
            let quote = inner[p];
            p += 1;
            let value_start = p;
            while p < inner.len() && inner[p] != quote {
                p += 1;
            }
            if p == inner.len() {
                return Tok::Invalid;
            }
            let value = match decode_text(&inner[value_start..p]) {
                Some(value) => value,
                None => return Tok::Invalid,
            };
            p += 1;
            match core::str::from_utf8(name) {
                Ok(name) => self.attrs.push((name.to_owned(), value)),
                Err(_) => return Tok::Invalid,
            }
        }

        if empty {
            Tok::EmptyTag
        } else {
            Tok::StartTag
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(xml: &str, expected: &[(Tok, &str)]) {
        let mut t = Tokenizer::new(xml.as_bytes());
        for &(tok, text) in expected {
            assert_eq!(t.token(), tok, "in {:?}", xml);
            match tok {
                Tok::StartTag | Tok::EmptyTag | Tok::EndTag => assert_eq!(t.name(), text),
                Tok::Text => assert_eq!(t.content(), text),
                _ => (),
            }
        }
    }

    #[test]
    fn simple_document() {
        tokens(
            "<?xml version=\"1.0\"?>\n<EndDevice>\n  <sFDI>1234</sFDI>\n</EndDevice>",
            &[
                (Tok::Decl, ""),
                (Tok::StartTag, "EndDevice"),
                (Tok::StartTag, "sFDI"),
                (Tok::Text, "1234"),
                (Tok::EndTag, "sFDI"),
                (Tok::EndTag, "EndDevice"),
            ],
        );
    }

    #[test]
    fn empty_tags_and_attributes() {
        let mut t = Tokenizer::new(b"<DERControlList href=\"/derc\" all=\"10\"><DERControl/></DERControlList>");
        assert_eq!(t.token(), Tok::StartTag);
        assert_eq!(t.attr("href"), Some("/derc"));
        assert_eq!(t.attr("all"), Some("10"));
        assert_eq!(t.attr("results"), None);
        assert_eq!(t.token(), Tok::EmptyTag);
        assert_eq!(t.name(), "DERControl");
        assert_eq!(t.token(), Tok::EndTag);
    }

    #[test]
    fn entities_in_text_and_attributes() {
        let mut t = Tokenizer::new(b"<a n='&lt;x&gt;'>Tom &amp; Jerry &#33;</a>");
        assert_eq!(t.token(), Tok::StartTag);
        assert_eq!(t.attr("n"), Some("<x>"));
        assert_eq!(t.token(), Tok::Text);
        assert_eq!(t.content(), "Tom & Jerry !");
        assert_eq!(t.token(), Tok::EndTag);
    }

    #[test]
    fn comments_are_skipped() {
        tokens(
            "<a><!-- nothing to see --><b>1</b></a>",
            &[(Tok::StartTag, "a"), (Tok::StartTag, "b"), (Tok::Text, "1"), (Tok::EndTag, "b"), (Tok::EndTag, "a")],
        );
    }

    #[test]
    fn truncation_is_recoverable() {
        let doc = b"<mRID>0123abcd</mRID>";
        for cut in 1..doc.len() {
            let mut t = Tokenizer::new(&doc[..cut]);
            // drain what is complete, stopping at the first Incomplete
            loop {
                match t.token() {
                    Tok::Incomplete => break,
                    Tok::Invalid => panic!("prefix of length {} reported invalid", cut),
                    _ => (),
                }
            }
            // feeding the full buffer must finish the document
            t.rebuffer(doc);
            let mut seen_end = false;
            loop {
                match t.token() {
                    Tok::EndTag => {
                        seen_end = true;
                        break;
                    }
                    Tok::Incomplete | Tok::Invalid => panic!("resume failed at cut {}", cut),
                    _ => (),
                }
            }
            assert!(seen_end);
        }
    }

    #[test]
    fn malformed_tags() {
        for doc in ["<1a>", "<a b>", "<a b=>", "< a>"] {
            let mut t = Tokenizer::new(doc.as_bytes());
            let mut tok = t.token();
            while !matches!(tok, Tok::Invalid | Tok::Incomplete) {
                tok = t.token();
            }
            assert_eq!(tok, Tok::Invalid, "{:?} should be invalid", doc);
        }
    }
}
