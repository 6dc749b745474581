//! The EXI driver: bit-exact decoding of the Efficient XML Interchange
//! form, constrained to the fixed options profile IEEE 2030.5 publishes.
//!
//! The schema supplies the event-code geometry: at a field whose minimum is
//! not yet met there is a single choice (one bit, plus the extended code),
//! otherwise the remaining entries of the section are the choices, with the
//! terminator playing the part of EE, and codes are `bit_count(n)` bits
//! wide. Values are the EXI primitives: base-128
//! little-endian unsigned integers of up to 70 bits, sign-prefixed
//! integers, n-bit fields, length-prefixed binary, and strings drawn from
//! per-document string tables or spelled as code-point literals.
//!
//! Every primitive either completes or leaves the cursor untouched, so an
//! underrun surfaces as `Incomplete` and the same primitive re-reads the
//! same bits after a rebuffer. The multi-step primitives (integer, binary,
//! string, xsi:type) carry an explicit sub-state for the same reason.

use crate::{
    object::{self, Slot},
    parse::{Advance, Driver, ParseError, Parser, Seq, Step, Xsi},
    schema::{bit_count, xs_kind, xs_len, Schema, XsKind},
};
use bit_field::BitField;

/// Bit cursor over the document buffer. Reads commit position only when
/// the requested bits are fully available.
struct Reader {
    buf: Vec<u8>,
    pos: usize,
    bit: u8,
}

impl Reader {
    fn new(data: &[u8]) -> Reader {
        Reader { buf: data.to_vec(), pos: 0, bit: 0 }
    }

    fn mark(&self) -> (usize, u8) {
        (self.pos, self.bit)
    }

    fn reset(&mut self, mark: (usize, u8)) {
        self.pos = mark.0;
        self.bit = mark.1;
    }

    /// Read `n <= 32` bits, most significant first.
    fn bits(&mut self, n: u32) -> Option<u32> {
        if n == 0 {
            return Some(0);
        }
        let total = self.bit as usize + n as usize;
        let bytes = (total + 7) / 8;
        if self.buf.len() - self.pos < bytes {
            return None;
        }
        let mut acc: u64 = 0;
        for i in 0..bytes {
            acc = acc << 8 | self.buf[self.pos + i] as u64;
        }
        let end = total % 8;
        let shift = if end == 0 { 0 } else { 8 - end };
        self.pos += total / 8;
        self.bit = end as u8;
        Some(acc.get_bits(shift..shift + n as usize) as u32)
    }

    fn bit(&mut self) -> Option<u32> {
        self.bits(1)
    }

    fn byte(&mut self) -> Option<u8> {
        self.bits(8).map(|b| b as u8)
    }
}

/// One value table: strings in first-seen order, identified by compact ids
/// of `bit_count(len - 1)` bits.
#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
}

impl StringTable {
    fn add(&mut self, s: &str) {
        self.strings.push(s.to_owned());
    }
}

pub struct ExiDriver {
    r: Reader,
    /// Unsigned-integer accumulator; survives rebuffers mid-value.
    ux: u64,
    ux_n: u32,
    sign: bool,
    /// Sub-state for the multi-step primitives; 0 is idle for all of them.
    exi_state: u8,
    /// Sub-state for simple content (CH bit / value / empty).
    ch: u8,
    /// Pending length for string and binary parses.
    len: u64,
    /// Per-local-name value tables, first-seen order.
    local: Vec<(String, StringTable)>,
    global: StringTable,
}

impl<'s> Parser<'s, ExiDriver> {
    /// Initialize a parser for an EXI document.
    pub fn exi(schema: &'s Schema, data: &[u8]) -> Parser<'s, ExiDriver> {
        Parser::with_driver(
            schema,
            ExiDriver {
                r: Reader::new(data),
                ux: 0,
                ux_n: 0,
                sign: false,
                exi_state: 0,
                ch: 0,
                len: 0,
                local: Vec::new(),
                global: StringTable::default(),
            },
        )
    }
}

fn incomplete<T>(v: Option<T>) -> Step<T> {
    v.ok_or(ParseError::Incomplete)
}

impl ExiDriver {
    /// Unsigned integer: base-128 little-endian, up to 70 bits. Resumable:
    /// completed groups stay accumulated across rebuffers.
    fn uint(&mut self) -> Step<u64> {
        if self.ux_n == 0 {
            self.ux = 0;
        }
        loop {
            if self.ux_n == 70 {
                return Err(ParseError::Invalid);
            }
            let b = incomplete(self.r.byte())?;
            self.ux |= ((b & 0x7f) as u64) << self.ux_n;
            self.ux_n += 7;
            if b & 0x80 == 0 {
                self.ux_n = 0;
                return Ok(self.ux);
            }
        }
    }

    /// Signed integer: one sign bit, then a uint.
    fn integer(&mut self) -> Step<i64> {
        if self.exi_state == 0 {
            self.sign = incomplete(self.r.bit())? != 0;
            self.exi_state = 1;
        }
        let ux = self.uint()?;
        self.exi_state = 0;
        let sx = if self.sign { -(ux as i128) } else { ux as i128 };
        i64::try_from(sx).map_err(|_| ParseError::Invalid)
    }

    /// Binary: a uint length no greater than the schema-declared `n`, then
    /// that many bytes, right-aligned. The length re-read after the
    /// availability check is the authoritative one.
    fn binary(&mut self, n: usize) -> Step<Box<[u8]>> {
        if self.exi_state == 0 {
            let length = self.uint()?;
            self.exi_state = 1;
            if length > n as u64 {
                return Err(ParseError::Invalid);
            }
            self.len = length;
        }
        let need = if self.r.bit != 0 { self.len + 1 } else { self.len };
        if ((self.r.buf.len() - self.r.pos) as u64) < need {
            return Err(ParseError::Incomplete);
        }
        let m = self.len as usize;
        let mut out = vec![0u8; n].into_boxed_slice();
        for slot in &mut out[n - m..] {
            *slot = self.r.byte().unwrap();
        }
        self.exi_state = 0;
        Ok(out)
    }

    /// A string literal: `chars` code points, each a uint, re-encoded as
    /// UTF-8. All-or-nothing: an underrun rewinds to the literal's start.
    fn literal(&mut self, chars: u64) -> Step<String> {
        let mark = self.r.mark();
        let mut s = String::new();
        for _ in 0..chars {
            match self.uint() {
                Ok(cp) => {
                    let cp = u32::try_from(cp).ok().and_then(char::from_u32).ok_or(ParseError::Invalid)?;
                    s.push(cp);
                }
                Err(e) => {
                    self.r.reset(mark);
                    self.ux_n = 0;
                    return Err(e);
                }
            }
        }
        Ok(s)
    }

    fn local_table(&mut self, name: &str) -> Option<&mut StringTable> {
        self.local.iter_mut().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Compact identifier lookup in a value table.
    fn compact_id(r: &mut Reader, table: Option<&StringTable>) -> Step<String> {
        let table = table.filter(|t| !t.strings.is_empty()).ok_or(ParseError::Invalid)?;
        let id = incomplete(r.bits(bit_count(table.strings.len() as u32 - 1)))? as usize;
        table.strings.get(id).cloned().ok_or(ParseError::Invalid)
    }

    /// An EXI string: a uint selects the local table (0), the global table
    /// (1), or spells a literal of `k - 2` characters, which is then
    /// interned into both tables under the current element's local name.
    fn string(&mut self, schema: &Schema, field: u16, n: usize) -> Step<String> {
        if self.exi_state == 0 {
            self.len = self.uint()?;
            self.exi_state = 1;
        }
        let name = schema.se_name(field);
        let s = match self.len {
            0 => {
                let table = self.local.iter().find(|(n, _)| n == name).map(|(_, t)| t);
                Self::compact_id(&mut self.r, table)?
            }
            1 => Self::compact_id(&mut self.r, Some(&self.global))?,
            k => {
                let s = self.literal(k - 2)?;
                match self.local_table(name) {
                    Some(t) => t.add(&s),
                    None => {
                        let mut t = StringTable::default();
                        t.add(&s);
                        self.local.push((name.to_owned(), t));
                    }
                }
                self.global.add(&s);
                s
            }
        };
        if n != 0 && s.len() > n - 1 {
            return Err(ParseError::Invalid);
        }
        self.exi_state = 0;
        Ok(s)
    }

    fn parse_value(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()> {
        let se = *schema.entry(field);
        let code = se.index;
        let n = xs_len(code) as usize;
        match xs_kind(code) {
            XsKind::String => {
                let s = self.string(schema, field, n)?;
                object::push_text(slot, &se, s);
            }
            XsKind::AnyUri => {
                let s = self.string(schema, field, 0)?;
                object::push_text(slot, &se, s);
            }
            XsKind::Boolean => {
                let bit = incomplete(self.r.bit())?;
                *flags |= bit << se.bit;
            }
            XsKind::HexBinary => *slot = Slot::Binary(self.binary(n)?),
            XsKind::Long => *slot = Slot::Int(self.integer()?),
            XsKind::Int => *slot = Slot::Int(ranged(self.integer()?, i32::MIN as i64, i32::MAX as i64)?),
            XsKind::Short => *slot = Slot::Int(ranged(self.integer()?, i16::MIN as i64, i16::MAX as i64)?),
            XsKind::Byte => *slot = Slot::Int(incomplete(self.r.bits(8))? as i64 - 128),
            XsKind::ULong => *slot = Slot::Uint(self.uint()?),
            XsKind::UInt => *slot = Slot::Uint(ranged_u(self.uint()?, u32::MAX as u64)?),
            XsKind::UShort => *slot = Slot::Uint(ranged_u(self.uint()?, u16::MAX as u64)?),
            XsKind::UByte => *slot = Slot::Uint(incomplete(self.r.bits(8))? as u64),
            XsKind::Null => return Err(ParseError::Invalid),
        }
        Ok(())
    }

    /// Read the event code at `field`: one choice while the field's minimum
    /// is unmet, otherwise the remaining entries of the section.
    fn event(&mut self, schema: &Schema, field: u16, count: u32) -> Step<(u32, u32)> {
        let se = schema.entry(field);
        let n = if se.n == 0 || count < se.min as u32 { 1 } else { se.n as u32 };
        let token = incomplete(self.r.bits(bit_count(n)))?;
        Ok((token, n))
    }

    /// Check the 5-byte fixed-options header: optional `$EXI` magic, the
    /// distinguishing byte, the options code, and the embedded schemaId,
    /// closed by an end-element bit.
    fn header(&mut self, schema: &Schema) -> Step<()> {
        let mark = self.r.mark();
        self.ux_n = 0;
        let r = self.try_header(schema);
        if r.is_err() {
            self.r.reset(mark);
            self.ux_n = 0;
        }
        r
    }

    fn try_header(&mut self, schema: &Schema) -> Step<()> {
        if self.r.buf.first() == Some(&b'$') {
            if self.r.buf.len() < 4 {
                return Err(ParseError::Incomplete);
            }
            if &self.r.buf[..4] != b"$EXI" {
                return Err(ParseError::Invalid);
            }
            self.r.pos = 4;
        }
        if self.r.buf.len() - self.r.pos < 5 {
            return Err(ParseError::Incomplete);
        }
        // 10 (distinguishing bits) | 1 (options present) | 00000 (version 1)
        if incomplete(self.r.byte())? != 0xa0 {
            return Err(ParseError::Invalid);
        }
        // fixed options document: code 0xC, padded to the byte boundary
        if incomplete(self.r.bits(5))? != 0xc || incomplete(self.r.bits(3))? != 0 {
            return Err(ParseError::Invalid);
        }
        let k = self.uint()?;
        if !(2..64).contains(&k) {
            return Err(ParseError::Invalid);
        }
        let schema_id = self.literal(k - 2)?;
        if schema_id != schema.schema_id {
            return Err(ParseError::Invalid);
        }
        if incomplete(self.r.bit())? != 1 {
            return Err(ParseError::Invalid);
        }
        Ok(())
    }
}

fn ranged(x: i64, min: i64, max: i64) -> Step<i64> {
    if (min..=max).contains(&x) {
        Ok(x)
    } else {
        Err(ParseError::Invalid)
    }
}

fn ranged_u(x: u64, max: u64) -> Step<u64> {
    if x <= max {
        Ok(x)
    } else {
        Err(ParseError::Invalid)
    }
}

impl Driver for ExiDriver {
    fn start(&mut self, schema: &Schema) -> Step<u16> {
        // re-checking the header after a rebuffer is idempotent, so the
        // whole prolog rewinds as one unit on underrun
        let mark = self.r.mark();
        self.header(schema)?;
        let element = match self.r.bits(bit_count(schema.length() as u32)) {
            Some(e) => e,
            None => {
                self.r.reset(mark);
                return Err(ParseError::Incomplete);
            }
        };
        if element as usize >= schema.length() {
            return Err(ParseError::Invalid);
        }
        Ok(element as u16)
    }

    fn next(&mut self, schema: &Schema, field: u16) -> Step<Advance> {
        let (token, n) = self.event(schema, field, 0)?;
        if token >= n {
            return Err(ParseError::Invalid);
        }
        let target = field + token as u16;
        if schema.entry(target).n == 0 {
            Ok(Advance::End(target))
        } else {
            Ok(Advance::Field(target))
        }
    }

    /// A substitution element opens into a one-choice state: the extended
    /// code (value 1) routes to the xsi:type event, 0 keeps the declared
    /// type.
    fn xsi_type(&mut self, schema: &Schema, _field: u16) -> Step<Xsi> {
        if self.exi_state == 0 {
            if incomplete(self.r.bit())? == 0 {
                return Ok(Xsi::Declared);
            }
            self.exi_state = 1;
        }
        if self.exi_state == 1 {
            // AT (xsi:type)
            if incomplete(self.r.bits(3))? != 0 {
                return Err(ParseError::Invalid);
            }
            self.exi_state = 2;
        }
        if self.exi_state == 2 {
            // URI: the target namespace
            if incomplete(self.r.bits(3))? != 5 {
                return Err(ParseError::Invalid);
            }
            self.exi_state = 3;
        }
        if self.exi_state == 3 {
            if self.uint()? != 0 {
                return Err(ParseError::Invalid);
            }
            self.exi_state = 4;
        }
        let index = incomplete(self.r.bits(bit_count(schema.count() as u32)))?;
        self.exi_state = 0;
        if index as usize >= schema.count() {
            return Err(ParseError::Invalid);
        }
        match schema.global_type(index as u16) {
            Some(ty) => Ok(Xsi::Type(ty)),
            None => Err(ParseError::Invalid),
        }
    }

    fn end(&mut self, _schema: &Schema, _open: u16) -> Step<()> {
        // the event code that selected the terminator was the EE
        Ok(())
    }

    fn sequence(&mut self, schema: &Schema, field: u16, count: u32) -> Step<Seq> {
        let (token, n) = self.event(schema, field, count)?;
        if token == 0 {
            return Ok(Seq::Continue);
        }
        if token >= n {
            return Err(ParseError::Invalid);
        }
        Ok(Seq::Jump(token as u16))
    }

    fn value(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()> {
        self.parse_value(schema, field, slot, flags)
    }

    fn simple(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()> {
        if self.ch == 0 {
            self.ch = if incomplete(self.r.bit())? == 0 { 1 } else { 2 };
        }
        if self.ch == 1 {
            self.parse_value(schema, field, slot, flags)?;
            self.ch = 0;
            return Ok(());
        }
        // empty content: EE is a second-level code here
        if incomplete(self.r.bits(3))? != 0 {
            return Err(ParseError::Invalid);
        }
        self.ch = 0;
        Ok(())
    }

    fn done(&mut self) {
        self.local.clear();
        self.global.strings.clear();
    }

    fn rebuffer(&mut self, data: &[u8]) {
        self.r.buf = data.to_vec();
    }
}
