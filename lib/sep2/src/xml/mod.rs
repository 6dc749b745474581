//! The XML driver: schema-directed consumption of the token stream.
//!
//! The driver keeps a one-token lookahead (`need_token`): tag tokens are
//! fetched once and stay cached while the walker tries successive fields
//! against them, and are only consumed by the field that matches. Attribute
//! fields never consume a token at all; they read the attribute map of the
//! most recently opened tag.

pub mod token;

use crate::{
    object::{self, Slot},
    parse::{Advance, Driver, ParseError, Parser, Seq, Step, Xsi},
    schema::{xs_kind, xs_len, Schema, XsKind},
};
use self::token::{Tok, Tokenizer};

pub struct XmlDriver {
    t: Tokenizer,
    token: Tok,
    need_token: bool,
    /// The currently open tag was self-closing; its fields are skipped.
    empty: bool,
    xml_decl: bool,
    /// Staged text for `value`: attribute content or element text.
    content: String,
}

impl<'s> Parser<'s, XmlDriver> {
    /// Initialize a parser for an XML document.
    pub fn xml(schema: &'s Schema, data: &[u8]) -> Parser<'s, XmlDriver> {
        Parser::with_driver(
            schema,
            XmlDriver {
                t: Tokenizer::new(data),
                token: Tok::Incomplete,
                need_token: true,
                empty: false,
                xml_decl: false,
                content: String::new(),
            },
        )
    }
}

enum Tag {
    Match,
    NoMatch,
}

impl XmlDriver {
    fn token(&mut self) -> Step<Tok> {
        if self.need_token {
            match self.t.token() {
                Tok::Incomplete => return Err(ParseError::Incomplete),
                Tok::Invalid => return Err(ParseError::Invalid),
                tok => {
                    self.token = tok;
                    self.need_token = false;
                }
            }
        }
        Ok(self.token)
    }

    fn consume(&mut self) {
        self.need_token = true;
    }

    /// Try the cached tag against a field. A name mismatch leaves the token
    /// cached for the walker to test subsequent fields.
    fn start_tag(&mut self, schema: &Schema, field: u16) -> Step<Tag> {
        match self.token()? {
            tok @ (Tok::StartTag | Tok::EmptyTag) => {
                if self.empty {
                    return Err(ParseError::Invalid);
                }
                if self.t.name() != schema.se_name(field) {
                    return Ok(Tag::NoMatch);
                }
                let empty = tok == Tok::EmptyTag;
                if empty && schema.entry(field).is_simple() {
                    return Err(ParseError::Invalid);
                }
                self.empty = empty;
                self.consume();
                Ok(Tag::Match)
            }
            Tok::EndTag => Ok(Tag::NoMatch),
            _ => Err(ParseError::Invalid),
        }
    }

    fn parse_value(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()> {
        let se = schema.entry(field);
        let code = se.index;
        let n = xs_len(code) as usize;
        let data = &self.content;
        match xs_kind(code) {
            XsKind::String => {
                if n != 0 && data.len() > n - 1 {
                    return Err(ParseError::Invalid);
                }
                object::push_text(slot, se, data.clone());
            }
            XsKind::AnyUri => object::push_text(slot, se, data.clone()),
            XsKind::Boolean => match data.as_str() {
                "true" | "1" => *flags |= 1 << se.bit,
                "false" | "0" => (),
                _ => return Err(ParseError::Invalid),
            },
            XsKind::HexBinary => *slot = Slot::Binary(parse_hex(data, n)?),
            XsKind::Long => *slot = Slot::Int(parse_signed(data, i64::MIN, i64::MAX)?),
            XsKind::Int => *slot = Slot::Int(parse_signed(data, i32::MIN as i64, i32::MAX as i64)?),
            XsKind::Short => *slot = Slot::Int(parse_signed(data, i16::MIN as i64, i16::MAX as i64)?),
            XsKind::Byte => *slot = Slot::Int(parse_signed(data, i8::MIN as i64, i8::MAX as i64)?),
            XsKind::ULong => *slot = Slot::Uint(parse_unsigned(data, u64::MAX)?),
            XsKind::UInt => *slot = Slot::Uint(parse_unsigned(data, u32::MAX as u64)?),
            XsKind::UShort => *slot = Slot::Uint(parse_unsigned(data, u16::MAX as u64)?),
            XsKind::UByte => *slot = Slot::Uint(parse_unsigned(data, u8::MAX as u64)?),
            XsKind::Null => return Err(ParseError::Invalid),
        }
        Ok(())
    }
}

fn parse_signed(data: &str, min: i64, max: i64) -> Step<i64> {
    match data.parse::<i64>() {
        Ok(x) if (min..=max).contains(&x) => Ok(x),
        _ => Err(ParseError::Invalid),
    }
}

fn parse_unsigned(data: &str, max: u64) -> Step<u64> {
    match data.parse::<u64>() {
        Ok(x) if x <= max => Ok(x),
        _ => Err(ParseError::Invalid),
    }
}

/// Decode a stream of hex digit pairs, right-aligned into `n` bytes and
/// zero-padded at the front. `n == 0` sizes the result to the input.
fn parse_hex(data: &str, n: usize) -> Step<Box<[u8]>> {
    let digits = data.as_bytes();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(ParseError::Invalid);
    }
    let m = digits.len() / 2;
    let n = if n == 0 { m } else { n };
    if m > n {
        return Err(ParseError::Invalid);
    }
    let mut out = vec![0u8; n].into_boxed_slice();
    for (i, pair) in digits.chunks(2).enumerate() {
        let hi = (pair[0] as char).to_digit(16).ok_or(ParseError::Invalid)?;
        let lo = (pair[1] as char).to_digit(16).ok_or(ParseError::Invalid)?;
        out[n - m + i] = (hi << 4 | lo) as u8;
    }
    Ok(out)
}

impl Driver for XmlDriver {
    fn start(&mut self, schema: &Schema) -> Step<u16> {
        loop {
            match self.token()? {
                Tok::Decl => {
                    if self.xml_decl {
                        return Err(ParseError::Invalid);
                    }
                    self.xml_decl = true;
                    self.consume();
                }
                tok @ (Tok::StartTag | Tok::EmptyTag) => {
                    let element = schema.element_index(self.t.name()).ok_or(ParseError::Invalid)?;
                    self.empty = tok == Tok::EmptyTag;
                    self.consume();
                    return Ok(element);
                }
                _ => return Err(ParseError::Invalid),
            }
        }
    }

    fn next(&mut self, schema: &Schema, field: u16) -> Step<Advance> {
        let mut field = field;
        loop {
            let se = schema.entry(field);
            if se.n == 0 {
                return Ok(Advance::End(field));
            }
            if se.is_attribute() {
                if let Some(value) = self.t.attr(schema.se_name(field)) {
                    self.content = value.to_owned();
                    return Ok(Advance::Field(field));
                }
            } else if !self.empty {
                if let Tag::Match = self.start_tag(schema, field)? {
                    return Ok(Advance::Field(field));
                }
            } else if se.min > 0 {
                return Err(ParseError::Invalid);
            }
            field += 1;
        }
    }

    fn xsi_type(&mut self, schema: &Schema, _field: u16) -> Step<Xsi> {
        match self.t.attr("xsi:type") {
            None => Ok(Xsi::Declared),
            Some(name) => {
                let ty = schema
                    .local_name_index(name)
                    .and_then(|index| schema.global_type(index))
                    .ok_or(ParseError::Invalid)?;
                Ok(Xsi::Type(ty))
            }
        }
    }

    fn end(&mut self, schema: &Schema, open: u16) -> Step<()> {
        if self.empty {
            self.empty = false;
            return Ok(());
        }
        match self.token()? {
            Tok::EndTag if self.t.name() == schema.se_name(open) => {
                self.consume();
                Ok(())
            }
            _ => Err(ParseError::Invalid),
        }
    }

    fn sequence(&mut self, schema: &Schema, field: u16, _count: u32) -> Step<Seq> {
        match self.start_tag(schema, field)? {
            Tag::Match => Ok(Seq::Continue),
            Tag::NoMatch => Ok(Seq::Scan),
        }
    }

    fn value(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()> {
        self.parse_value(schema, field, slot, flags)
    }

    fn simple(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()> {
        match self.token()? {
            Tok::Text => {
                self.content = self.t.content().to_owned();
                self.consume();
            }
            // an immediate close tag is empty content; leave it for `end`
            Tok::EndTag => self.content.clear(),
            _ => return Err(ParseError::Invalid),
        }
        self.parse_value(schema, field, slot, flags)
    }

    fn done(&mut self) {}

    fn rebuffer(&mut self, data: &[u8]) {
        self.t.rebuffer(data);
    }
}
