//! IEEE 2030.5 (Smart Energy Profile 2.0) schema engine.
//!
//! The protocol defines a large family of named element types whose wire
//! representation is either XML or EXI (Efficient XML Interchange, a
//! bit-packed binary form). This crate holds the machinery that is common to
//! both: a schema model that indexes textual element names *and* compact
//! bit-coded identifiers ([`schema`]), schema-typed object trees
//! ([`object`]), and a single resumable parser state machine ([`parse`])
//! fed by one of two primitive drivers, a streaming XML tokenizer
//! ([`xml`]) or a streaming EXI bit decoder ([`exi`]).
//!
//! [`types`] carries the subset of the IEEE 2030.5 schema needed by a DER
//! client, plus typed views over the parsed objects.

pub mod exi;
pub mod object;
pub mod parse;
pub mod schema;
pub mod types;
pub mod xml;

pub use object::{SeObject, Slot};
pub use parse::{Document, ParseError, Parser};
pub use schema::{Schema, SchemaEntry, XsKind};

/// A small schema exercising every field shape, shared by the driver tests.
#[cfg(test)]
pub(crate) mod testing {
    use crate::schema::{xs_type, Schema, XsKind};

    pub fn schema() -> Schema {
        let mut b = Schema::builder("urn:ieee:std:2030.5:ns", "S1");
        b.complex("Ident", None, |t| {
            t.simple("id", xs_type(XsKind::UInt, 0), 1);
        });
        b.complex("Reading", Some("Ident"), |t| {
            t.simple("id", xs_type(XsKind::UInt, 0), 1);
            t.simple("value", xs_type(XsKind::Int, 0), 1);
        });
        b.complex("Interval", None, |t| {
            t.simple("start", xs_type(XsKind::Long, 0), 1);
            t.simple("duration", xs_type(XsKind::UInt, 0), 1);
        });
        b.complex("Control", None, |t| {
            t.attribute("href", xs_type(XsKind::AnyUri, 0));
            t.simple("mRID", xs_type(XsKind::HexBinary, 4), 0);
            t.simple("enabled", xs_type(XsKind::Boolean, 0), 0);
            t.simple("label", xs_type(XsKind::String, 8), 0);
            t.simple("setpoint", xs_type(XsKind::Short, 0), 0);
            t.complex("interval", "Interval", 0);
            t.simple_list("note", xs_type(XsKind::String, 0), 0, 3);
        });
        b.complex("ControlList", None, |t| {
            t.attribute("href", xs_type(XsKind::AnyUri, 0));
            t.attribute("all", xs_type(XsKind::UInt, 0));
            t.unbounded("Control", "Control", 0);
        });
        b.complex("Envelope", None, |t| {
            t.simple("status", xs_type(XsKind::UByte, 0), 1);
            t.substitution("Resource", "Ident", 0);
        });
        b.element("Control", "Control");
        b.element("ControlList", "ControlList");
        b.element("Envelope", "Envelope");
        b.element("Reading", "Reading");
        b.build()
    }

    /// Slot indices of the `Control` test type.
    pub const C_HREF: usize = 0;
    pub const C_MRID: usize = 1;
    pub const C_LABEL: usize = 3;
    pub const C_SETPOINT: usize = 4;
    pub const C_INTERVAL: usize = 5;
    pub const C_NOTE: usize = 6;
}
