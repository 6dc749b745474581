//! The IEEE 2030.5 schema subset for the DER function set, with typed
//! views over the parsed objects.
//!
//! The full standard describes on the order of a thousand element types;
//! this table carries the ones a DER client actually walks: the EndDevice /
//! FunctionSetAssignments / DERProgram / DERControl tree, default controls,
//! and the subscription resources. The slot constants below sit beside the
//! declarations that build the table, so views and table cannot drift
//! apart: a field moves in both or in neither.

use crate::{
    object::{SeObject, Slot},
    schema::{xs_type, Schema, XsKind},
};
use bitflags::bitflags;
use std::sync::OnceLock;

pub const NAMESPACE: &str = "urn:ieee:std:2030.5:ns";
pub const SCHEMA_ID: &str = "S1";

/*
 * DERControl slots.
 */
pub const DERC_MRID: usize = 1;
pub const DERC_DESCRIPTION: usize = 2;
pub const DERC_CREATION_TIME: usize = 3;
pub const DERC_STATUS: usize = 4;
pub const DERC_INTERVAL: usize = 5;
pub const DERC_RANDOMIZE_START: usize = 6;
pub const DERC_BASE: usize = 7;

/*
 * EventStatus and DateTimeInterval slots.
 */
pub const ES_CURRENT_STATUS: usize = 0;
pub const ES_DATE_TIME: usize = 1;
pub const DTI_DURATION: usize = 0;
pub const DTI_START: usize = 1;

/*
 * DefaultDERControl slots.
 */
pub const DDERC_MRID: usize = 1;
pub const DDERC_BASE: usize = 3;
pub const DDERC_ES_DELAY: usize = 4;

/*
 * DERProgram slots.
 */
pub const DERP_MRID: usize = 1;
pub const DERP_DESCRIPTION: usize = 2;
pub const DERP_PRIMACY: usize = 3;
pub const DERP_DDERC_LINK: usize = 4;
pub const DERP_DERCL_LINK: usize = 5;

/*
 * Shared shape of the list resources: href / all / results / items.
 */
pub const LIST_ALL: usize = 1;
pub const LIST_RESULTS: usize = 2;
pub const LIST_ITEMS: usize = 3;

/*
 * FunctionSetAssignments slots.
 */
pub const FSA_MRID: usize = 1;
pub const FSA_DESCRIPTION: usize = 2;
pub const FSA_DERPL_LINK: usize = 3;

/*
 * EndDevice slots.
 */
pub const EDEV_SFDI: usize = 1;
pub const EDEV_LFDI: usize = 2;
pub const EDEV_CHANGED_TIME: usize = 3;
pub const EDEV_FSAL_LINK: usize = 4;

/*
 * Subscription and Notification slots.
 */
pub const SUB_RESOURCE: usize = 1;
pub const SUB_ENCODING: usize = 2;
pub const SUB_LEVEL: usize = 3;
pub const SUB_LIMIT: usize = 4;
pub const SUB_NOTIFICATION_URI: usize = 5;
pub const NOTIF_RESOURCE: usize = 1;
pub const NOTIF_NEW_URI: usize = 2;
pub const NOTIF_OBJECT: usize = 3;
pub const NOTIF_STATUS: usize = 4;

/// Everything the engine needs to know about one DERControlBase field:
/// the mode flag, the field name, the slot, and how to read/write it.
/// One macro invocation defines the flag set, the value struct, extraction
/// and the masked overlay together.
macro_rules! control_base_fields {
    (
        booleans { $(($bflag:ident, $bbit:expr, $bname:literal)),* $(,)? }
        values { $(($flag:ident, $bit:expr, $name:literal, $field:ident, $ty:ty, $kind:ident, $slotk:ident)),* $(,)? }
    ) => {
        bitflags! {
            /// DER control modes, one bit per DERControlBase field. Bit
            /// positions equal the schema's flag-bit positions, so a parsed
            /// object's flag word *is* its mode mask.
            #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
            pub struct DerModes: u32 {
                $(const $bflag = 1 << $bbit;)*
                $(const $flag = 1 << $bit;)*
            }
        }

        /// A DERControlBase as a plain value: the live-field mask plus the
        /// numeric fields. Boolean modes live in `modes` directly.
        #[derive(Clone, Copy, Debug, Default, PartialEq)]
        pub struct DerControlBase {
            pub modes: DerModes,
            $(pub $field: $ty,)*
        }

        impl DerControlBase {
            pub fn from_object(obj: &SeObject) -> DerControlBase {
                DerControlBase {
                    modes: DerModes::from_bits_truncate(obj.flags()),
                    $($field: obj.$kind($bit).unwrap_or_default() as $ty,)*
                }
            }

            /// Overlay the fields of `b` named by `mask`: boolean flags are
            /// OR-ed, numeric fields overwritten. The mask is recorded in
            /// the live-field set so later queries see them.
            pub fn overlay(&mut self, b: &DerControlBase, mask: DerModes) {
                self.modes |= mask;
                $(if mask.contains(DerModes::$flag) {
                    self.$field = b.$field;
                })*
            }
        }

        fn control_base_type(b: &mut crate::schema::SchemaBuilder) {
            b.complex("DERControlBase", None, |t| {
                $(t.simple($bname, xs_type(XsKind::Boolean, 0), 0);)*
                $(t.simple($name, xs_type(XsKind::$slotk, 0), 0);)*
            });
        }
    };
}

control_base_fields! {
    booleans {
        (OP_MOD_CONNECT, 0, "opModConnect"),
        (OP_MOD_ENERGIZE, 1, "opModEnergize"),
    }
    values {
        (OP_MOD_FIXED_PF_ABSORB_W, 2, "opModFixedPFAbsorbW", op_mod_fixed_pf_absorb_w, i16, int, Short),
        (OP_MOD_FIXED_PF_INJECT_W, 3, "opModFixedPFInjectW", op_mod_fixed_pf_inject_w, i16, int, Short),
        (OP_MOD_FIXED_VAR, 4, "opModFixedVar", op_mod_fixed_var, i16, int, Short),
        (OP_MOD_FIXED_W, 5, "opModFixedW", op_mod_fixed_w, i16, int, Short),
        (OP_MOD_FREQ_DROOP, 6, "opModFreqDroop", op_mod_freq_droop, u32, uint, UInt),
        (OP_MOD_FREQ_WATT, 7, "opModFreqWatt", op_mod_freq_watt, u32, uint, UInt),
        (OP_MOD_HFRT_MAY_TRIP, 8, "opModHFRTMayTrip", op_mod_hfrt_may_trip, u32, uint, UInt),
        (OP_MOD_HFRT_MUST_TRIP, 9, "opModHFRTMustTrip", op_mod_hfrt_must_trip, u32, uint, UInt),
        (OP_MOD_HVRT_MAY_TRIP, 10, "opModHVRTMayTrip", op_mod_hvrt_may_trip, u32, uint, UInt),
        (OP_MOD_HVRT_MOMENTARY_CESSATION, 11, "opModHVRTMomentaryCessation", op_mod_hvrt_momentary_cessation, u32, uint, UInt),
        (OP_MOD_HVRT_MUST_TRIP, 12, "opModHVRTMustTrip", op_mod_hvrt_must_trip, u32, uint, UInt),
        (OP_MOD_LFRT_MAY_TRIP, 13, "opModLFRTMayTrip", op_mod_lfrt_may_trip, u32, uint, UInt),
        (OP_MOD_LFRT_MUST_TRIP, 14, "opModLFRTMustTrip", op_mod_lfrt_must_trip, u32, uint, UInt),
        (OP_MOD_LVRT_MAY_TRIP, 15, "opModLVRTMayTrip", op_mod_lvrt_may_trip, u32, uint, UInt),
        (OP_MOD_LVRT_MOMENTARY_CESSATION, 16, "opModLVRTMomentaryCessation", op_mod_lvrt_momentary_cessation, u32, uint, UInt),
        (OP_MOD_LVRT_MUST_TRIP, 17, "opModLVRTMustTrip", op_mod_lvrt_must_trip, u32, uint, UInt),
        (OP_MOD_MAX_LIM_W, 18, "opModMaxLimW", op_mod_max_lim_w, u16, uint, UShort),
        (OP_MOD_TARGET_VAR, 19, "opModTargetVar", op_mod_target_var, i32, int, Int),
        (OP_MOD_TARGET_W, 20, "opModTargetW", op_mod_target_w, i32, int, Int),
        (OP_MOD_VOLT_VAR, 21, "opModVoltVar", op_mod_volt_var, u32, uint, UInt),
        (OP_MOD_VOLT_WATT, 22, "opModVoltWatt", op_mod_volt_watt, u32, uint, UInt),
        (OP_MOD_WATT_PF, 23, "opModWattPF", op_mod_watt_pf, u32, uint, UInt),
        (OP_MOD_WATT_VAR, 24, "opModWattVar", op_mod_watt_var, u32, uint, UInt),
        (RAMP_TMS, 25, "rampTms", ramp_tms, u16, uint, UShort),
    }
}

/// EventStatus currentStatus values (the server-side event state).
pub const EVENT_STATUS_SCHEDULED: u64 = 0;
pub const EVENT_STATUS_ACTIVE: u64 = 1;
pub const EVENT_STATUS_CANCELLED: u64 = 2;
pub const EVENT_STATUS_CANCELLED_RANDOM: u64 = 3;
pub const EVENT_STATUS_SUPERSEDED: u64 = 4;

fn build() -> Schema {
    let mut b = Schema::builder(NAMESPACE, SCHEMA_ID);
    b.complex("Resource", None, |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
    });
    control_base_type(&mut b);
    b.complex("EventStatus", None, |t| {
        t.simple("currentStatus", xs_type(XsKind::UByte, 0), 1);
        t.simple("dateTime", xs_type(XsKind::Long, 0), 1);
        t.simple("potentiallySuperseded", xs_type(XsKind::Boolean, 0), 1);
    });
    b.complex("DateTimeInterval", None, |t| {
        t.simple("duration", xs_type(XsKind::UInt, 0), 1);
        t.simple("start", xs_type(XsKind::Long, 0), 1);
    });
    b.complex("DERControl", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.simple("mRID", xs_type(XsKind::HexBinary, 16), 1);
        t.simple("description", xs_type(XsKind::String, 32), 0);
        t.simple("creationTime", xs_type(XsKind::Long, 0), 1);
        t.complex("EventStatus", "EventStatus", 1);
        t.complex("interval", "DateTimeInterval", 1);
        t.simple("randomizeStart", xs_type(XsKind::Short, 0), 0);
        t.complex("DERControlBase", "DERControlBase", 1);
    });
    b.complex("DERControlList", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.attribute("all", xs_type(XsKind::UInt, 0));
        t.attribute("results", xs_type(XsKind::UInt, 0));
        t.unbounded("DERControl", "DERControl", 0);
    });
    b.complex("DefaultDERControl", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.simple("mRID", xs_type(XsKind::HexBinary, 16), 1);
        t.simple("description", xs_type(XsKind::String, 32), 0);
        t.complex("DERControlBase", "DERControlBase", 1);
        t.simple("setESDelay", xs_type(XsKind::UInt, 0), 0);
    });
    b.complex("DERProgram", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.simple("mRID", xs_type(XsKind::HexBinary, 16), 1);
        t.simple("description", xs_type(XsKind::String, 32), 0);
        t.simple("primacy", xs_type(XsKind::UByte, 0), 1);
        t.simple("DefaultDERControlLink", xs_type(XsKind::AnyUri, 0), 0);
        t.simple("DERControlListLink", xs_type(XsKind::AnyUri, 0), 0);
    });
    b.complex("DERProgramList", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.attribute("all", xs_type(XsKind::UInt, 0));
        t.attribute("results", xs_type(XsKind::UInt, 0));
        t.unbounded("DERProgram", "DERProgram", 0);
    });
    b.complex("FunctionSetAssignments", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.simple("mRID", xs_type(XsKind::HexBinary, 16), 1);
        t.simple("description", xs_type(XsKind::String, 32), 0);
        t.simple("DERProgramListLink", xs_type(XsKind::AnyUri, 0), 0);
    });
    b.complex("FunctionSetAssignmentsList", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.attribute("all", xs_type(XsKind::UInt, 0));
        t.attribute("results", xs_type(XsKind::UInt, 0));
        t.unbounded("FunctionSetAssignments", "FunctionSetAssignments", 0);
    });
    b.complex("EndDevice", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.simple("sFDI", xs_type(XsKind::ULong, 0), 1);
        t.simple("lFDI", xs_type(XsKind::HexBinary, 20), 0);
        t.simple("changedTime", xs_type(XsKind::Long, 0), 1);
        t.simple("FunctionSetAssignmentsListLink", xs_type(XsKind::AnyUri, 0), 0);
    });
    b.complex("Subscription", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.simple("subscribedResource", xs_type(XsKind::AnyUri, 0), 1);
        t.simple("encoding", xs_type(XsKind::UByte, 0), 1);
        t.simple("level", xs_type(XsKind::String, 16), 1);
        t.simple("limit", xs_type(XsKind::UInt, 0), 1);
        t.simple("notificationURI", xs_type(XsKind::AnyUri, 0), 1);
    });
    b.complex("Notification", Some("Resource"), |t| {
        t.attribute("href", xs_type(XsKind::AnyUri, 0));
        t.simple("subscribedResource", xs_type(XsKind::AnyUri, 0), 1);
        t.simple("newResourceURI", xs_type(XsKind::AnyUri, 0), 0);
        t.substitution("Resource", "Resource", 0);
        t.simple("status", xs_type(XsKind::UByte, 0), 1);
    });
    for name in [
        "DERControl",
        "DERControlList",
        "DERProgram",
        "DERProgramList",
        "DefaultDERControl",
        "EndDevice",
        "FunctionSetAssignments",
        "FunctionSetAssignmentsList",
        "Notification",
        "Subscription",
    ] {
        b.element(name, name);
    }
    b.build()
}

/// The process-wide IEEE 2030.5 schema, built on first use.
pub fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(build)
}

/// Type header for a named resource.
pub fn type_id(name: &str) -> u16 {
    let s = schema();
    s.type_of(s.element_index(name).unwrap_or_else(|| panic!("{} is not a schema element", name)))
}

/*
 * Read-only views. Each wraps a parsed object whose type the caller has
 * already checked (or got from a typed list).
 */

#[derive(Clone, Copy)]
pub struct DerControl<'a>(pub &'a SeObject);

impl<'a> DerControl<'a> {
    pub fn mrid(&self) -> Option<&'a [u8]> {
        self.0.binary(DERC_MRID)
    }

    pub fn creation_time(&self) -> i64 {
        self.0.int(DERC_CREATION_TIME).unwrap_or(0)
    }

    pub fn current_status(&self) -> Option<u64> {
        self.0.object(DERC_STATUS).and_then(|s| s.uint(ES_CURRENT_STATUS))
    }

    /// `(start, duration)` of the control's interval.
    pub fn interval(&self) -> Option<(i64, u32)> {
        let i = self.0.object(DERC_INTERVAL)?;
        Some((i.int(DTI_START)?, i.uint(DTI_DURATION)? as u32))
    }

    pub fn base(&self) -> DerControlBase {
        self.0.object(DERC_BASE).map(DerControlBase::from_object).unwrap_or_default()
    }
}

#[derive(Clone, Copy)]
pub struct DefaultDerControl<'a>(pub &'a SeObject);

impl<'a> DefaultDerControl<'a> {
    pub fn mrid(&self) -> Option<&'a [u8]> {
        self.0.binary(DDERC_MRID)
    }

    pub fn base(&self) -> DerControlBase {
        self.0.object(DDERC_BASE).map(DerControlBase::from_object).unwrap_or_default()
    }
}

#[derive(Clone, Copy)]
pub struct DerProgram<'a>(pub &'a SeObject);

impl<'a> DerProgram<'a> {
    pub fn mrid(&self) -> Option<&'a [u8]> {
        self.0.binary(DERP_MRID)
    }

    pub fn primacy(&self) -> u8 {
        self.0.uint(DERP_PRIMACY).unwrap_or(0) as u8
    }

    pub fn default_der_control_link(&self) -> Option<&'a str> {
        self.0.text(DERP_DDERC_LINK)
    }

    pub fn der_control_list_link(&self) -> Option<&'a str> {
        self.0.text(DERP_DERCL_LINK)
    }
}

#[derive(Clone, Copy)]
pub struct EndDevice<'a>(pub &'a SeObject);

impl<'a> EndDevice<'a> {
    pub fn sfdi(&self) -> u64 {
        self.0.uint(EDEV_SFDI).unwrap_or(0)
    }

    pub fn lfdi(&self) -> Option<&'a [u8]> {
        self.0.binary(EDEV_LFDI)
    }

    pub fn fsa_list_link(&self) -> Option<&'a str> {
        self.0.text(EDEV_FSAL_LINK)
    }
}

/// Fill in the 20-byte LFDI on an EndDevice the server sent without one.
pub fn set_lfdi(edev: &mut SeObject, lfdi: &[u8; 20]) {
    let s = schema();
    let ty = type_id("EndDevice");
    edev.set(s.entry(ty + 1 + EDEV_LFDI as u16), Slot::Binary(Box::new(*lfdi)));
}

#[derive(Clone, Copy)]
pub struct Notification<'a>(pub &'a SeObject);

impl<'a> Notification<'a> {
    pub fn subscribed_resource(&self) -> Option<&'a str> {
        self.0.text(NOTIF_RESOURCE)
    }

    pub fn new_resource_uri(&self) -> Option<&'a str> {
        self.0.text(NOTIF_NEW_URI)
    }

    pub fn status(&self) -> u64 {
        self.0.uint(NOTIF_STATUS).unwrap_or(0)
    }

    /// The mirrored resource, with its substituted type.
    pub fn resource(&self) -> Option<(u16, &'a SeObject)> {
        self.0.substitution(NOTIF_OBJECT)
    }
}

/// Build an SE_Subscription resource for posting.
pub fn new_subscription(subscribed: &str, level: &str, limit: u32, notification_uri: &str) -> SeObject {
    let s = schema();
    let ty = type_id("Subscription");
    let mut sub = SeObject::new(s, ty);
    sub.set(s.entry(ty + 1 + SUB_RESOURCE as u16), Slot::Str(subscribed.to_owned()));
    sub.set(s.entry(ty + 1 + SUB_ENCODING as u16), Slot::Uint(0)); // XML
    sub.set(s.entry(ty + 1 + SUB_LEVEL as u16), Slot::Str(level.to_owned()));
    sub.set(s.entry(ty + 1 + SUB_LIMIT as u16), Slot::Uint(limit as u64));
    sub.set(s.entry(ty + 1 + SUB_NOTIFICATION_URI as u16), Slot::Str(notification_uri.to_owned()));
    sub
}
