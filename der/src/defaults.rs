//! The default-control overlay.
//!
//! When no active control covers a DER mode, the highest-primacy program
//! that carries a `DefaultDERControl` supplies that mode's fall-through
//! value. [`update_defaults`] recomputes the overlay after every schedule
//! mutation batch, the same pass that emits the block lifecycle events,
//! and announces overlay membership changes on the bus.

use crate::{
    device::DerDevice,
    event::{Event, EventQueue},
    resource::ResourceCache,
    StubId,
};
use sep2::types::{self, DefaultDerControl, DerControl, DerControlBase, DerModes};

/// One default control currently supplying modes to its device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultControl {
    /// The DefaultDERControl resource stub.
    pub dderc: StubId,
    /// The modes this default supplies because nothing active covers them.
    pub active: DerModes,
}

/// Recompute the device's overlay: `device.active` becomes the union of
/// active blocks' modes; uncovered modes are claimed by the programs'
/// defaults in primacy order. Newly claiming defaults get `DefaultStart`,
/// displaced ones `DefaultEnd`.
pub fn update_defaults(device: &mut DerDevice, cache: &ResourceCache, events: &mut EventQueue) {
    let mut mask = DerModes::empty();
    for &id in &device.schedule.active {
        mask |= device.schedule.block(id).der;
    }
    device.active = mask;
    let mut uncovered = !mask;

    let mut current: Vec<DefaultControl> = Vec::new();
    for &prog in &device.derpl {
        if uncovered.is_empty() {
            break;
        }
        let Some(dderc) = cache.get_subordinate(prog, types::type_id("DefaultDERControl")) else {
            continue;
        };
        let flags = DefaultDerControl(&cache.get(dderc).data).base().modes;
        let active = flags & uncovered;
        if active.is_empty() {
            continue;
        }
        uncovered &= !flags;
        if !device.defaults.iter().any(|d| d.dderc == dderc) {
            events.push(Event::DefaultStart { sfdi: device.sfdi, modes: active });
        }
        current.push(DefaultControl { dderc, active });
    }

    for old in &device.defaults {
        if !current.iter().any(|d| d.dderc == old.dderc) {
            events.push(Event::DefaultEnd { sfdi: device.sfdi, modes: old.active });
        }
    }
    device.defaults = current;
}

/// The effective control base for the device at this instant: active
/// blocks applied in primacy order (higher primacy overwrites per mode),
/// then per-mode gaps filled from the default overlay.
pub fn effective_base(device: &DerDevice, cache: &ResourceCache) -> DerControlBase {
    let mut order = device.schedule.active.clone();
    // worst precedence first, so better blocks overwrite
    order.sort_by(|&a, &b| {
        let (a, b) = (device.schedule.block(a), device.schedule.block(b));
        b.primacy.cmp(&a.primacy).then(a.start.cmp(&b.start))
    });

    let mut base = DerControlBase::default();
    for id in order {
        let block = device.schedule.block(id);
        let control = DerControl(&cache.get(block.event).data).base();
        base.overlay(&control, block.der);
    }
    for dc in &device.defaults {
        let control = DefaultDerControl(&cache.get(dc.dderc).data).base();
        base.overlay(&control, dc.active);
    }
    base
}
