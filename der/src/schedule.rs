//! The per-device event schedule.
//!
//! A [`Schedule`] owns one [`EventBlock`] per DER control instance the
//! server has handed the device, keyed by the control's resource URI so a
//! re-hydration finds its existing block. Blocks move between the
//! `scheduled`, `active` and `superseded` lists as time advances; a block
//! is in at most one of them at any instant.
//!
//! Precedence: lower primacy wins. Between overlapping blocks of equal
//! primacy the most recently started wins, then the most recently created.

use crate::{
    event::{Event, EventQueue},
    resource::ResourceCache,
    BlockId, StubId,
};
use sep2::types::{
    DerControl, DerModes, EVENT_STATUS_CANCELLED, EVENT_STATUS_CANCELLED_RANDOM,
};
use sparsemap::SparseTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    Scheduled,
    Active,
    Cancelled,
    Superseded,
    Aborted,
    Complete,
}

/// One scheduled instance of a DER control.
pub struct EventBlock {
    pub start: i64,
    pub end: i64,
    /// Program precedence; lower is higher.
    pub primacy: u8,
    /// The DERProgram stub this control belongs to.
    pub program: StubId,
    /// The DERControl resource stub.
    pub event: StubId,
    /// The control modes this block asserts.
    pub der: DerModes,
    pub status: BlockStatus,
    /// Server-side creation time, used for precedence ties.
    pub creation: i64,
    /// Insertion sequence, the final tie-break.
    seq: u64,
}

struct UriKey {
    uri: String,
    block: BlockId,
}

fn block_key(e: &UriKey) -> &str {
    &e.uri
}

pub struct Schedule {
    /// The device this schedule drives (registry key).
    pub sfdi: u64,
    /// The hydrated EndDevice stub.
    pub device: Option<StubId>,
    blocks: Vec<Option<EventBlock>>,
    by_uri: SparseTable<UriKey, str>,
    pub scheduled: Vec<BlockId>,
    pub active: Vec<BlockId>,
    pub superseded: Vec<BlockId>,
    seq: u64,
}

impl Schedule {
    pub fn new(sfdi: u64) -> Schedule {
        Schedule {
            sfdi,
            device: None,
            blocks: Vec::new(),
            by_uri: SparseTable::new(64, block_key),
            scheduled: Vec::new(),
            active: Vec::new(),
            superseded: Vec::new(),
            seq: 0,
        }
    }

    pub fn block(&self, id: BlockId) -> &EventBlock {
        self.blocks[id].as_ref().expect("stale block id")
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut EventBlock {
        self.blocks[id].as_mut().expect("stale block id")
    }

    pub fn find_block(&self, uri: &str) -> Option<BlockId> {
        self.by_uri.get(uri).map(|e| e.block)
    }

    /// Every live block, in slab order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &EventBlock)> {
        self.blocks.iter().enumerate().filter_map(|(id, b)| b.as_ref().map(|b| (id, b)))
    }

    /// Drop the placement lists ahead of a rebuild. Block statuses are
    /// preserved; `schedule_event` re-places each surviving block.
    pub fn clear_lists(&mut self) {
        self.scheduled.clear();
        self.active.clear();
        self.superseded.clear();
    }

    /// Insert (or re-place) the event block for a control resource. The
    /// caller tags the block with its program afterwards.
    pub fn schedule_event(
        &mut self,
        cache: &ResourceCache,
        event: StubId,
        primacy: u8,
        events: &mut EventQueue,
    ) -> BlockId {
        let stub = cache.get(event);
        let control = DerControl(&stub.data);
        let (start, duration) = control.interval().unwrap_or((0, 0));
        let cancelled = matches!(
            control.current_status(),
            Some(EVENT_STATUS_CANCELLED) | Some(EVENT_STATUS_CANCELLED_RANDOM)
        );

        let id = match self.find_block(&stub.uri) {
            Some(id) => {
                let block = self.blocks[id].as_mut().expect("stale block id");
                block.primacy = primacy;
                block.start = start;
                block.end = start + duration as i64;
                block.der = control.base().modes;
                id
            }
            None => {
                let id = self.blocks.len();
                self.blocks.push(Some(EventBlock {
                    start,
                    end: start + duration as i64,
                    primacy,
                    program: event,
                    event,
                    der: control.base().modes,
                    status: BlockStatus::Scheduled,
                    creation: control.creation_time(),
                    seq: self.seq,
                }));
                self.seq += 1;
                self.by_uri.put(UriKey { uri: stub.uri.clone(), block: id });
                id
            }
        };

        if cancelled {
            self.cancel(id, events);
        }
        match self.block(id).status {
            BlockStatus::Scheduled => self.scheduled.push(id),
            BlockStatus::Active => self.active.push(id),
            BlockStatus::Superseded => self.superseded.push(id),
            _ => (),
        }
        id
    }

    /// Cancel a block in O(1). Cancelling a block that already left the
    /// lists is a no-op; an active block emits its end event.
    pub fn cancel(&mut self, id: BlockId, events: &mut EventQueue) {
        let status = self.block(id).status;
        match status {
            BlockStatus::Active => {
                self.active.retain(|&b| b != id);
                events.push(Event::EventEnd { sfdi: self.sfdi, block: id });
            }
            BlockStatus::Scheduled => self.scheduled.retain(|&b| b != id),
            _ => return,
        }
        self.block_mut(id).status = BlockStatus::Cancelled;
    }

    /// Remove a block entirely (program withdrawal). Returns its last
    /// status.
    pub fn remove_block(&mut self, cache: &ResourceCache, id: BlockId) -> BlockStatus {
        let block = self.blocks[id].take().expect("stale block id");
        self.scheduled.retain(|&b| b != id);
        self.active.retain(|&b| b != id);
        self.superseded.retain(|&b| b != id);
        self.by_uri.delete(cache.get(block.event).uri.as_str());
        block.status
    }

    /// Advance the schedule to `now`: expire completed blocks, then
    /// activate due blocks in timestamp order (ties by insertion),
    /// resolving supersession as each one starts. Expiry runs first so a
    /// finished block's end event precedes a later block's start event.
    pub fn update_schedule(&mut self, now: i64, events: &mut EventQueue) {
        for id in std::mem::take(&mut self.active) {
            if self.block(id).end <= now {
                self.block_mut(id).status = BlockStatus::Complete;
                events.push(Event::EventEnd { sfdi: self.sfdi, block: id });
                log::debug!("block {} complete on device {:x}", id, self.sfdi);
            } else {
                self.active.push(id);
            }
        }

        let mut due: Vec<BlockId> = self
            .scheduled
            .iter()
            .copied()
            .filter(|&id| self.block(id).start <= now)
            .collect();
        due.sort_by_key(|&id| (self.block(id).start, self.block(id).seq));

        for id in due {
            self.scheduled.retain(|&b| b != id);
            if self.block(id).status != BlockStatus::Scheduled {
                // cancelled while queued: firing is a no-op
                continue;
            }
            self.activate(id, events);
        }
    }

    fn activate(&mut self, id: BlockId, events: &mut EventQueue) {
        for other in self.active.clone() {
            if !overlaps(self.block(id), self.block(other)) {
                continue;
            }
            if wins(self.block(id), self.block(other)) {
                self.active.retain(|&b| b != other);
                self.superseded.push(other);
                self.block_mut(other).status = BlockStatus::Superseded;
                events.push(Event::EventEnd { sfdi: self.sfdi, block: other });
                log::debug!("block {} superseded by {} on device {:x}", other, id, self.sfdi);
            } else {
                // the incoming block loses without ever starting
                self.block_mut(id).status = BlockStatus::Superseded;
                self.superseded.push(id);
                return;
            }
        }
        self.block_mut(id).status = BlockStatus::Active;
        self.active.push(id);
        events.push(Event::EventStart { sfdi: self.sfdi, block: id });
    }
}

fn overlaps(a: &EventBlock, b: &EventBlock) -> bool {
    a.start < b.end && b.start < a.end
}

/// Does `a` take precedence over `b`? Lower primacy first, then the later
/// start, then the most recent creation, then insertion order.
fn wins(a: &EventBlock, b: &EventBlock) -> bool {
    if a.primacy != b.primacy {
        return a.primacy < b.primacy;
    }
    if a.start != b.start {
        return a.start > b.start;
    }
    if a.creation != b.creation {
        return a.creation > b.creation;
    }
    a.seq > b.seq
}
