//! The driver-independent parser.
//!
//! One state machine walks the schema and builds the object tree; all
//! primitive decoding is delegated through the [`Driver`] trait, which the
//! XML and EXI drivers implement. The walker owns the frame stack and the
//! cardinality bookkeeping; drivers own their buffers and whatever lookahead
//! or bit-cursor state their format needs.
//!
//! Parsing is resumable: every driver operation either completes or returns
//! [`ParseError::Incomplete`] *without consuming input*, and the walker's
//! states are cut so that each one performs at most one driver call. When
//! the caller has more of the stream it hands the longer buffer to
//! [`Parser::rebuffer`] and calls [`Parser::parse`] again; the interrupted
//! operation re-reads the same bytes.

use crate::{
    object::{self, SeObject, Slot},
    schema::Schema,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Recoverable: the buffer ran out mid-document. Rebuffer and re-enter.
    #[error("input exhausted before the document was complete")]
    Incomplete,
    /// The document does not conform to the schema. The parser is dead.
    #[error("document does not conform to the schema")]
    Invalid,
}

pub type Step<T> = Result<T, ParseError>;

/// Outcome of [`Driver::next`]: where the scan from the current field ended.
pub enum Advance {
    /// This field matched; parse one instance of it.
    Field(u16),
    /// The terminator was reached; the open element is closing.
    End(u16),
}

/// Outcome of [`Driver::sequence`] after an instance of a repeated field.
pub enum Seq {
    /// Another instance of the same field follows.
    Continue,
    /// No match here; resume scanning at the following field.
    Scan,
    /// The event code selected an entry `k` places ahead (EXI).
    Jump(u16),
}

/// Outcome of [`Driver::xsi_type`] for a substitution field.
pub enum Xsi {
    /// No type override; use the field's declared type.
    Declared,
    Type(u16),
}

/// The fixed capability set a format driver provides.
pub trait Driver {
    #[doc(hidden)]
    fn start(&mut self, schema: &Schema) -> Step<u16>;
    #[doc(hidden)]
    fn next(&mut self, schema: &Schema, field: u16) -> Step<Advance>;
    #[doc(hidden)]
    fn xsi_type(&mut self, schema: &Schema, field: u16) -> Step<Xsi>;
    #[doc(hidden)]
    fn end(&mut self, schema: &Schema, open: u16) -> Step<()>;
    #[doc(hidden)]
    fn sequence(&mut self, schema: &Schema, field: u16, count: u32) -> Step<Seq>;
    #[doc(hidden)]
    fn value(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()>;
    #[doc(hidden)]
    fn simple(&mut self, schema: &Schema, field: u16, slot: &mut Slot, flags: &mut u32) -> Step<()>;
    #[doc(hidden)]
    fn done(&mut self);
    #[doc(hidden)]
    fn rebuffer(&mut self, data: &[u8]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Start,
    Next,
    Element,
    CloseSimple,
    End,
    Sequence,
    Done,
    Invalid,
}

struct Frame {
    type_id: u16,
    obj: SeObject,
    /// Entry index of the field the walker is positioned at.
    field: u16,
    /// Parsed instances of that field.
    count: u32,
    /// The entry that opened this frame: the element entry for the document
    /// element, the parent's field entry otherwise. Close tags match it.
    open: u16,
}

/// A parsed document: the global element it carried and the object tree.
#[derive(Debug, PartialEq)]
pub struct Document {
    pub element: u16,
    pub object: SeObject,
}

pub struct Parser<'s, D> {
    schema: &'s Schema,
    driver: D,
    state: State,
    stack: Vec<Frame>,
    element: u16,
}

impl<'s, D: Driver> Parser<'s, D> {
    pub(crate) fn with_driver(schema: &'s Schema, driver: D) -> Parser<'s, D> {
        Parser { schema, driver, state: State::Start, stack: Vec::new(), element: 0 }
    }

    /// Provide a longer copy of the same stream after an `Incomplete`.
    pub fn rebuffer(&mut self, data: &[u8]) {
        self.driver.rebuffer(data);
    }

    /// Run the parse to completion, to the next suspension point, or to an
    /// error. `Incomplete` leaves the parser resumable; `Invalid` is final.
    pub fn parse(&mut self) -> Result<Document, ParseError> {
        match self.run() {
            Err(ParseError::Invalid) => {
                log::trace!("document rejected in state {:?}", self.state);
                self.state = State::Invalid;
                Err(ParseError::Invalid)
            }
            other => other,
        }
    }

    fn run(&mut self) -> Result<Document, ParseError> {
        let schema = self.schema;
        loop {
            match self.state {
                State::Start => {
                    let element = self.driver.start(schema)?;
                    let type_id = schema.type_of(element);
                    self.element = element;
                    self.stack.push(Frame {
                        type_id,
                        obj: SeObject::new(schema, type_id),
                        field: type_id + 1,
                        count: 0,
                        open: element,
                    });
                    self.state = State::Next;
                }
                State::Next => {
                    let frame = self.stack.last_mut().unwrap();
                    match self.driver.next(schema, frame.field)? {
                        Advance::Field(field) => {
                            frame.field = field;
                            frame.count = 0;
                            self.state = State::Element;
                        }
                        Advance::End(field) => {
                            frame.field = field;
                            self.state = State::End;
                        }
                    }
                }
                State::Element => {
                    let frame = self.stack.last_mut().unwrap();
                    let field = frame.field;
                    let se = *schema.entry(field);
                    if se.is_simple() {
                        let (slot, flags) = frame.obj.value_target(se.offset as usize);
                        if se.is_attribute() {
                            self.driver.value(schema, field, slot, flags)?;
                            if !se.is_boolean() {
                                frame.obj.set_flag(se.bit);
                            }
                            frame.field = field + 1;
                            frame.count = 0;
                            self.state = State::Next;
                        } else {
                            self.driver.simple(schema, field, slot, flags)?;
                            self.state = State::CloseSimple;
                        }
                    } else {
                        let type_id = if se.is_substitution() {
                            match self.driver.xsi_type(schema, field)? {
                                Xsi::Declared => se.index,
                                Xsi::Type(ty) => ty,
                            }
                        } else {
                            se.index
                        };
                        self.stack.push(Frame {
                            type_id,
                            obj: SeObject::new(schema, type_id),
                            field: type_id + 1,
                            count: 0,
                            open: field,
                        });
                        self.state = State::Next;
                    }
                }
                State::CloseSimple => {
                    let frame = self.stack.last_mut().unwrap();
                    self.driver.end(schema, frame.field)?;
                    let se = schema.entry(frame.field);
                    if !se.is_boolean() {
                        frame.obj.set_flag(se.bit);
                    }
                    frame.count += 1;
                    self.state = State::Sequence;
                }
                State::End => {
                    let frame = self.stack.last().unwrap();
                    self.driver.end(schema, frame.open)?;
                    let done = self.stack.pop().unwrap();
                    match self.stack.last_mut() {
                        None => {
                            self.driver.done();
                            self.state = State::Done;
                            return Ok(Document { element: self.element, object: done.obj });
                        }
                        Some(parent) => {
                            let se = schema.entry(parent.field);
                            object::push_child(parent.obj.slot_mut(se.offset as usize), se, done.obj);
                            parent.obj.set_flag(se.bit);
                            parent.count += 1;
                            self.state = State::Sequence;
                        }
                    }
                }
                State::Sequence => {
                    let frame = self.stack.last_mut().unwrap();
                    let field = frame.field;
                    let se = *schema.entry(field);
                    match self.driver.sequence(schema, field, frame.count)? {
                        Seq::Continue => {
                            if !se.is_unbounded() && frame.count >= se.max as u32 {
                                // overflow in a bounded container
                                return Err(ParseError::Invalid);
                            }
                            self.state = State::Element;
                        }
                        Seq::Scan => {
                            if frame.count < se.min as u32 {
                                return Err(ParseError::Invalid);
                            }
                            frame.field = field + 1;
                            frame.count = 0;
                            self.state = State::Next;
                        }
                        Seq::Jump(k) => {
                            if frame.count < se.min as u32 {
                                return Err(ParseError::Invalid);
                            }
                            frame.field = field + k;
                            frame.count = 0;
                            self.state = if schema.entry(frame.field).n == 0 { State::End } else { State::Element };
                        }
                    }
                }
                State::Done | State::Invalid => return Err(ParseError::Invalid),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, C_HREF, C_INTERVAL, C_LABEL, C_MRID, C_NOTE, C_SETPOINT};

    fn parse_xml(doc: &str) -> Result<Document, ParseError> {
        let schema = testing::schema();
        Parser::xml(&schema, doc.as_bytes()).parse()
    }

    #[test]
    fn full_document() {
        let schema = testing::schema();
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<ControlList href="/dl" all="2">
  <Control href="/dc/1">
    <mRID>ab12</mRID>
    <enabled>true</enabled>
    <label>prim</label>
    <setpoint>-300</setpoint>
    <interval><start>1000</start><duration>60</duration></interval>
    <note>a</note>
    <note>b</note>
  </Control>
  <Control/>
</ControlList>"#;
        let got = Parser::xml(&schema, doc.as_bytes()).parse().unwrap();
        assert_eq!(got.element, schema.element_index("ControlList").unwrap());

        let list = &got.object;
        assert_eq!(list.text(0), Some("/dl"));
        assert_eq!(list.uint(1), Some(2));
        let controls = list.list(2);
        assert_eq!(controls.len(), 2);

        let c = &controls[0];
        assert_eq!(c.text(C_HREF), Some("/dc/1"));
        // hexBinary is right-aligned and zero-padded into its fixed size
        assert_eq!(c.binary(C_MRID), Some(&[0x00, 0x00, 0xab, 0x12][..]));
        let ty = schema.type_of(schema.element_index("Control").unwrap());
        let enabled = schema.entry(ty + 3);
        assert!(c.flag(enabled.bit));
        assert_eq!(c.text(C_LABEL), Some("prim"));
        assert_eq!(c.int(C_SETPOINT), Some(-300));
        let interval = c.object(C_INTERVAL).unwrap();
        assert_eq!(interval.int(0), Some(1000));
        assert_eq!(interval.uint(1), Some(60));
        assert_eq!(c.texts(C_NOTE), ["a", "b"]);

        // the self-closed element has every optional field absent
        let empty = &controls[1];
        assert_eq!(empty.flags(), 0);
        assert_eq!(empty.binary(C_MRID), None);
    }

    #[test]
    fn boolean_text_forms() {
        for (text, ok, set) in [
            ("true", true, true),
            ("1", true, true),
            ("false", true, false),
            ("0", true, false),
            ("yes", false, false),
            ("TRUE", false, false),
        ] {
            let doc = format!("<Control><enabled>{}</enabled></Control>", text);
            match parse_xml(&doc) {
                Ok(got) => {
                    assert!(ok, "{:?} should have been rejected", text);
                    let schema = testing::schema();
                    let ty = schema.type_of(schema.element_index("Control").unwrap());
                    assert_eq!(got.object.flag(schema.entry(ty + 3).bit), set, "for {:?}", text);
                }
                Err(e) => {
                    assert!(!ok, "{:?} failed with {:?}", text, e);
                    assert_eq!(e, ParseError::Invalid);
                }
            }
        }
    }

    #[test]
    fn xsi_type_substitution() {
        let schema = testing::schema();
        let doc = br#"<Envelope><status>4</status><Resource xsi:type="Reading"><id>7</id><value>-2</value></Resource></Envelope>"#;
        let got = Parser::xml(&schema, doc).parse().unwrap();
        assert_eq!(got.object.uint(0), Some(4));
        let (ty, obj) = got.object.substitution(1).unwrap();
        assert_eq!(ty, schema.type_of(schema.element_index("Reading").unwrap()));
        assert_eq!(obj.uint(0), Some(7));
        assert_eq!(obj.int(1), Some(-2));
    }

    #[test]
    fn xsi_type_with_unknown_name_is_invalid() {
        let doc = r#"<Envelope><status>0</status><Resource xsi:type="Bogus"><id>1</id></Resource></Envelope>"#;
        assert_eq!(parse_xml(doc), Err(ParseError::Invalid));
    }

    #[test]
    fn substitution_without_xsi_uses_declared_type() {
        let schema = testing::schema();
        let doc = br#"<Envelope><status>0</status><Resource><id>9</id></Resource></Envelope>"#;
        let got = Parser::xml(&schema, doc).parse().unwrap();
        let (ty, obj) = got.object.substitution(1).unwrap();
        assert_eq!(ty, schema.entry(schema.type_of(schema.element_index("Envelope").unwrap()) + 2).index);
        assert_eq!(obj.uint(0), Some(9));
    }

    #[test]
    fn bounded_repeat_overflows() {
        let doc = "<Control><note>1</note><note>2</note><note>3</note><note>4</note></Control>";
        assert_eq!(parse_xml(doc), Err(ParseError::Invalid));
    }

    #[test]
    fn empty_simple_element_is_invalid() {
        assert_eq!(parse_xml("<Control><label/></Control>"), Err(ParseError::Invalid));
    }

    #[test]
    fn unknown_root_and_repeated_declaration() {
        assert_eq!(parse_xml("<Bogus/>"), Err(ParseError::Invalid));
        assert_eq!(
            parse_xml("<?xml version=\"1.0\"?><?xml version=\"1.0\"?><Control/>"),
            Err(ParseError::Invalid)
        );
    }

    #[test]
    fn single_instance_field_cannot_repeat() {
        let doc = "<Control><interval><start>1</start><start>2</start></interval></Control>";
        assert_eq!(parse_xml(doc), Err(ParseError::Invalid));
    }

    /// Parsing a split stream and rebuffering must agree with parsing the
    /// whole document at once, for every split point.
    #[test]
    fn prefix_stable() {
        let schema = testing::schema();
        let doc = br#"<ControlList href="/dl"><Control><mRID>0a0b</mRID><enabled>1</enabled><interval><start>-9</start><duration>3</duration></interval></Control></ControlList>"#;
        let whole = Parser::xml(&schema, doc).parse().unwrap();
        for cut in 1..doc.len() {
            let mut p = Parser::xml(&schema, &doc[..cut]);
            match p.parse() {
                Err(ParseError::Incomplete) => {
                    p.rebuffer(doc);
                    let got = p.parse().unwrap_or_else(|e| panic!("resume at {} failed: {:?}", cut, e));
                    assert_eq!(got, whole, "split at {}", cut);
                }
                Ok(_) => panic!("prefix of {} parsed to completion", cut),
                Err(e) => panic!("prefix of {} failed with {:?}", cut, e),
            }
        }
    }
}
