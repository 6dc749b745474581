//! DER client core.
//!
//! Consumes the resource trees the [`sep2`] engine parses and drives the
//! device state machine: a primacy-ordered schedule of control events per
//! EndDevice ([`schedule`]), a fall-through overlay of default controls
//! ([`defaults`]), and the process-wide device registry ([`device`]).
//! Transport, TLS, discovery and certificate decoding live behind the
//! collaborator traits in [`device`] and [`notify`].
//!
//! Everything runs on one cooperative loop: the loop owns the registry,
//! the resource cache and the event queue, and all mutation happens there.
//! Components communicate through [`event::EventQueue`]; nothing here
//! spawns or blocks.

pub mod defaults;
pub mod device;
pub mod event;
pub mod notify;
pub mod resource;
pub mod schedule;
pub mod settings;

/// Index of an event block within its schedule's slab.
pub type BlockId = usize;

/// Index of a stub within the resource cache.
pub type StubId = usize;

pub use defaults::{effective_base, update_defaults, DefaultControl};
pub use device::{schedule_der, DerDevice, DeviceRegistry, Responder, ResponseStatus};
pub use event::{Event, EventQueue};
pub use resource::{ResourceCache, Stub};
pub use schedule::{BlockStatus, EventBlock, Schedule};
