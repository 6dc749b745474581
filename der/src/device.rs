//! DER devices and the process-wide registry.
//!
//! A [`DerDevice`] is the client's record of one EndDevice: identifiers,
//! the control schedule, the active default controls, metering state and
//! the settings bag. Devices are created lazily on first reference and
//! never destroyed. The registry is an explicit state object passed by
//! handle; there is no module-level mutable.

use crate::{
    event::{Event, EventQueue},
    resource::ResourceCache,
    schedule::{BlockStatus, Schedule},
    settings::Settings,
    StubId,
};
use sep2::types::{self, DerModes, DerProgram, EndDevice};
use sep2::SeObject;
use sparsemap::SparseTable;
use std::io;
use std::path::Path;

/// Response status codes posted back to the server on event transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    EventReceived = 1,
    EventStarted = 2,
    EventCompleted = 3,
    EventOptOut = 4,
    EventOptIn = 5,
    EventCancelled = 6,
    EventSuperseded = 7,
    EventAbortedServer = 11,
    EventAbortedProgram = 12,
}

/// Posts event responses to the server; implemented by the connection
/// layer.
pub trait Responder {
    fn device_response(&mut self, device: StubId, event: StubId, status: ResponseStatus);
}

/// Derives `(SFDI, LFDI)` from a device certificate file; implemented by
/// the TLS layer.
pub trait CertLoader {
    fn load(&mut self, path: &Path) -> io::Result<(u64, [u8; 20])>;
}

pub struct DerDevice {
    pub sfdi: u64,
    pub lfdi: [u8; 20],
    /// Post rate for meter readings, seconds.
    pub metering_rate: u32,
    /// The MirrorUsagePoint stub for this device, once created.
    pub mup: Option<StubId>,
    /// Pending mirror meter readings.
    pub readings: Vec<SeObject>,
    /// DER program stubs, primacy-sorted.
    pub derpl: Vec<StubId>,
    /// Default controls currently supplying modes.
    pub defaults: Vec<crate::defaults::DefaultControl>,
    /// Modes currently driven by real (non-default) controls.
    pub active: DerModes,
    pub schedule: Schedule,
    pub settings: Settings,
}

impl DerDevice {
    fn new(sfdi: u64) -> DerDevice {
        DerDevice {
            sfdi,
            lfdi: [0; 20],
            metering_rate: 0,
            mup: None,
            readings: Vec::new(),
            derpl: Vec::new(),
            defaults: Vec::new(),
            active: DerModes::empty(),
            schedule: Schedule::new(sfdi),
            settings: Settings::default(),
        }
    }
}

fn device_key(d: &DerDevice) -> &u64 {
    &d.sfdi
}

pub struct DeviceRegistry {
    devices: SparseTable<DerDevice, u64>,
}

impl Default for DeviceRegistry {
    fn default() -> DeviceRegistry {
        DeviceRegistry::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry { devices: SparseTable::new(64, device_key) }
    }

    /// Get the device with the matching SFDI, creating it on first call.
    pub fn get_device(&mut self, sfdi: u64) -> &mut DerDevice {
        if self.devices.get(&sfdi).is_none() {
            self.devices.put(DerDevice::new(sfdi));
        }
        self.devices.get_mut(&sfdi).unwrap()
    }

    pub fn find(&self, sfdi: u64) -> Option<&DerDevice> {
        self.devices.get(&sfdi)
    }

    pub fn find_mut(&mut self, sfdi: u64) -> Option<&mut DerDevice> {
        self.devices.get_mut(&sfdi)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerDevice> {
        self.devices.iter()
    }
}

/// Load one device certificate and record its identifiers.
pub fn device_cert(
    registry: &mut DeviceRegistry,
    loader: &mut dyn CertLoader,
    path: &Path,
) -> io::Result<()> {
    let (sfdi, lfdi) = loader.load(path)?;
    log::debug!("device_cert: sfdi {:x}", sfdi);
    registry.get_device(sfdi).lfdi = lfdi;
    Ok(())
}

/// Load every certificate in a directory.
pub fn device_certs(
    registry: &mut DeviceRegistry,
    loader: &mut dyn CertLoader,
    dir: &Path,
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            device_cert(registry, loader, &path)?;
        }
    }
    Ok(())
}

/// Abort the event blocks of withdrawn programs: an active block answers
/// the server with `EventAbortedProgram`; every affected block leaves the
/// schedule as `Aborted`.
fn remove_programs(
    schedule: &mut Schedule,
    cache: &ResourceCache,
    removed: &[StubId],
    responder: &mut dyn Responder,
) {
    if removed.is_empty() {
        return;
    }
    let affected: Vec<_> =
        schedule.blocks().filter(|(_, b)| removed.contains(&b.program)).map(|(id, _)| id).collect();
    for id in affected {
        let event = schedule.block(id).event;
        let status = schedule.remove_block(cache, id);
        if status == BlockStatus::Active {
            if let Some(device) = schedule.device {
                responder.device_response(device, event, ResponseStatus::EventAbortedProgram);
            }
        }
        log::debug!("block {} aborted: program withdrawn", id);
    }
}

/// Sorted insert into the primacy-ordered program list; equal primacies
/// keep arrival order.
fn insert_program(cache: &ResourceCache, derpl: &mut Vec<StubId>, prog: StubId) {
    if derpl.contains(&prog) {
        return;
    }
    let primacy = DerProgram(&cache.get(prog).data).primacy();
    let at = derpl
        .iter()
        .position(|&p| DerProgram(&cache.get(p).data).primacy() > primacy)
        .unwrap_or(derpl.len());
    derpl.insert(at, prog);
}

/// Rebuild the DER schedule for a hydrated EndDevice: collect its programs
/// in primacy order, abort blocks of withdrawn programs, re-place every
/// control event, and announce the update on the bus.
pub fn schedule_der(
    registry: &mut DeviceRegistry,
    cache: &mut ResourceCache,
    edev: StubId,
    responder: &mut dyn Responder,
    events: &mut EventQueue,
) {
    let sfdi = EndDevice(&cache.get(edev).data).sfdi();
    log::info!("schedule_der: device {:x}", sfdi);

    let Some(fsal) = cache.get_subordinate(edev, types::type_id("FunctionSetAssignmentsList"))
    else {
        return;
    };
    let device = registry.get_device(sfdi);

    // supply the LFDI from the certificate store when the server omitted it
    if EndDevice(&cache.get(edev).data).lfdi().is_none() {
        let lfdi = device.lfdi;
        types::set_lfdi(&mut cache.get_mut(edev).data, &lfdi);
    }

    // collect every program for the device, sorted by primacy
    let mut derpl: Vec<StubId> = Vec::new();
    for fsa in cache.get(fsal).reqs.clone() {
        if let Some(pl) = cache.get_subordinate(fsa, types::type_id("DERProgramList")) {
            for prog in cache.get(pl).reqs.clone() {
                insert_program(cache, &mut derpl, prog);
            }
        }
    }

    let removed: Vec<StubId> =
        device.derpl.iter().copied().filter(|p| !derpl.contains(p)).collect();
    remove_programs(&mut device.schedule, cache, &removed, responder);

    /* the block schedule may change as a result of program removal and
     * primacy change, so the placement lists are rebuilt from scratch */
    device.schedule.clear_lists();
    device.schedule.device = Some(edev);

    for &prog in &derpl {
        let primacy = DerProgram(&cache.get(prog).data).primacy();
        if let Some(cl) = cache.get_subordinate(prog, types::type_id("DERControlList")) {
            for event in cache.get(cl).reqs.clone() {
                let id = device.schedule.schedule_event(cache, event, primacy, events);
                device.schedule.block_mut(id).program = prog;
            }
        }
    }
    device.derpl = derpl;

    events.push(Event::ScheduleUpdate { sfdi });
    events.push(Event::DeviceSchedule { sfdi });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, TestResponder, SFDI};
    use crate::schedule::BlockStatus;

    #[test]
    fn registry_creates_lazily() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.find(7).is_none());
        reg.get_device(7).metering_rate = 300;
        assert_eq!(reg.find(7).unwrap().metering_rate, 300);
        assert_eq!(reg.iter().count(), 1);
        // same SFDI yields the same record
        assert_eq!(reg.get_device(7).metering_rate, 300);
    }

    #[test]
    fn schedule_der_builds_primacy_ordered_schedule() {
        let mut tree = fixture::tree();
        let mut reg = DeviceRegistry::new();
        let mut responder = TestResponder::new();
        let mut events = EventQueue::new();

        schedule_der(&mut reg, &mut tree.cache, tree.edev, &mut responder, &mut events);

        let device = reg.find(SFDI).unwrap();
        assert_eq!(device.derpl, vec![tree.prog_a, tree.prog_b]);
        assert_eq!(device.schedule.scheduled.len(), 2);
        assert!(device.schedule.active.is_empty());
        assert!(responder.calls.is_empty());

        let drained: Vec<Event> = events.drain().collect();
        assert!(drained.contains(&Event::ScheduleUpdate { sfdi: SFDI }));
        assert!(drained.contains(&Event::DeviceSchedule { sfdi: SFDI }));
    }

    #[test]
    fn lfdi_filled_from_certificate_store() {
        let mut tree = fixture::tree();
        let mut reg = DeviceRegistry::new();
        reg.get_device(SFDI).lfdi = [0x5a; 20];
        let mut responder = TestResponder::new();
        let mut events = EventQueue::new();

        schedule_der(&mut reg, &mut tree.cache, tree.edev, &mut responder, &mut events);
        let edev = sep2::types::EndDevice(&tree.cache.get(tree.edev).data);
        assert_eq!(edev.lfdi(), Some(&[0x5a; 20][..]));
    }

    #[test]
    fn lower_primacy_wins_activation() {
        let mut tree = fixture::tree();
        let mut reg = DeviceRegistry::new();
        let mut responder = TestResponder::new();
        let mut events = EventQueue::new();

        schedule_der(&mut reg, &mut tree.cache, tree.edev, &mut responder, &mut events);
        events.drain().count();

        let device = reg.find_mut(SFDI).unwrap();
        device.schedule.update_schedule(1500, &mut events);

        let a = device.schedule.find_block("/derp/0/derc/0").unwrap();
        let b = device.schedule.find_block("/derp/1/derc/0").unwrap();
        assert_eq!(device.schedule.block(a).status, BlockStatus::Active);
        assert_eq!(device.schedule.block(b).status, BlockStatus::Superseded);
        assert_eq!(device.schedule.active, vec![a]);
        assert_eq!(device.schedule.superseded, vec![b]);
        // the loser never started, so only one lifecycle event fired
        let drained: Vec<Event> = events.drain().collect();
        assert_eq!(drained, vec![Event::EventStart { sfdi: SFDI, block: a }]);
    }

    /// Withdrawing a program aborts its active block and answers the
    /// server with EventAbortedProgram.
    #[test]
    fn schedule_replacement_aborts_removed_programs() {
        let mut tree = fixture::tree();
        let mut reg = DeviceRegistry::new();
        let mut responder = TestResponder::new();
        let mut events = EventQueue::new();

        schedule_der(&mut reg, &mut tree.cache, tree.edev, &mut responder, &mut events);
        reg.find_mut(SFDI).unwrap().schedule.update_schedule(1500, &mut events);
        events.drain().count();

        // the server dropped program A from the program list
        tree.cache.get_mut(tree.derpl).reqs.retain(|&p| p != tree.prog_a);
        schedule_der(&mut reg, &mut tree.cache, tree.edev, &mut responder, &mut events);

        assert_eq!(responder.calls, vec![(tree.edev, tree.ctl_a, ResponseStatus::EventAbortedProgram)]);
        let device = reg.find(SFDI).unwrap();
        assert_eq!(device.derpl, vec![tree.prog_b]);
        assert_eq!(device.schedule.find_block("/derp/0/derc/0"), None);
        assert!(device.schedule.active.is_empty());
        let drained: Vec<Event> = events.drain().collect();
        assert!(drained.contains(&Event::DeviceSchedule { sfdi: SFDI }));
    }

    #[test]
    fn cancelled_control_never_fires() {
        let mut tree = fixture::tree();
        // replace control B with a server-cancelled instance
        fixture::hydrate(
            &mut tree.cache,
            "/derp/1/derc/0",
            &fixture::control_xml("/derp/1/derc/0", 0xB1, 1000, 3600, 20, 2, "<opModEnergize>true</opModEnergize>"),
        );
        let mut reg = DeviceRegistry::new();
        let mut responder = TestResponder::new();
        let mut events = EventQueue::new();

        schedule_der(&mut reg, &mut tree.cache, tree.edev, &mut responder, &mut events);
        events.drain().count();
        let device = reg.find_mut(SFDI).unwrap();
        device.schedule.update_schedule(1500, &mut events);

        let b = device.schedule.find_block("/derp/1/derc/0").unwrap();
        assert_eq!(device.schedule.block(b).status, BlockStatus::Cancelled);
        let drained: Vec<Event> = events.drain().collect();
        assert!(!drained.iter().any(|e| matches!(e, Event::EventStart { block, .. } if *block == b)));
    }

    #[test]
    fn no_block_sits_in_two_lists() {
        let mut tree = fixture::tree();
        let mut reg = DeviceRegistry::new();
        let mut responder = TestResponder::new();
        let mut events = EventQueue::new();

        schedule_der(&mut reg, &mut tree.cache, tree.edev, &mut responder, &mut events);
        let device = reg.find_mut(SFDI).unwrap();
        for now in [0, 500, 1500, 2500, 5000] {
            device.schedule.update_schedule(now, &mut events);
            let s = &device.schedule;
            for (id, _) in s.blocks() {
                let memberships = [&s.scheduled, &s.active, &s.superseded]
                    .iter()
                    .filter(|list| list.contains(&id))
                    .count();
                assert!(memberships <= 1, "block {} in {} lists at t={}", id, memberships, now);
            }
        }
    }
}
