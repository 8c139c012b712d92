//! Channel table for one peer.
//!
//! A fixed array of slots indexed by channel id. Slot 0 is the control
//! channel and is never handed out.
//!
//! ```text
//!           begin_open            confirm
//!   Empty ─────────────▶ HalfOpen ───────▶ Open
//!     ▲  ◀─────────────────┘                │
//!     │      reset (rejected/collision)     │
//!     └─────────────────────────────────────┘
//!                 reset (close)
//! ```
//!
//! The receiving side of an open goes straight from `Empty` to `Open` via `bind`.
//!
//! A half-open slot carries a deadline; [`ChannelTable::expire_opens`] resets
//! the ones the peer never answered.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::DEFAULT_CHANNEL_TABLE_SIZE;
use crate::core::envelope::CONTROL_CHANNEL;
use crate::error::{ChannelError, Result};
use crate::protocol::handler::Handler;

/// Largest table a one-byte channel id can address
pub const MAX_CHANNELS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Empty,
    HalfOpen,
    Open,
}

/// Completion for a locally initiated open; receives the final channel id.
pub type OpenWaiter = oneshot::Sender<Result<u8>>;

pub struct Channel {
    id: u8,
    state: ChannelState,
    handler: Option<Arc<dyn Handler>>,
    waiter: Option<OpenWaiter>,
    /// Set while half-open
    deadline: Option<Instant>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("handler", &self.handler.as_ref().map(|h| h.name().to_string()))
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Channel {
    fn empty(id: u8) -> Self {
        Self {
            id,
            state: ChannelState::Empty,
            handler: None,
            waiter: None,
            deadline: None,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn handler(&self) -> Option<&Arc<dyn Handler>> {
        self.handler.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

/// What a slot held before it was reset
pub struct Released {
    pub id: u8,
    pub state: ChannelState,
    pub handler: Option<Arc<dyn Handler>>,
    pub waiter: Option<OpenWaiter>,
}

pub struct ChannelTable {
    slots: Vec<Channel>,
    open_deadlines: BTreeSet<(Instant, u8)>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_TABLE_SIZE)
    }
}

impl ChannelTable {
    /// Table with `size` slots (clamped to 2..=256), all `Empty`
    pub fn new(size: usize) -> Self {
        let size = size.clamp(2, MAX_CHANNELS);
        Self {
            slots: (0..size).map(|id| Channel::empty(id as u8)).collect(),
            open_deadlines: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether `id` names an assignable slot
    pub fn is_valid(&self, id: u8) -> bool {
        id != CONTROL_CHANNEL && (id as usize) < self.slots.len()
    }

    pub fn get(&self, id: u8) -> Option<&Channel> {
        if self.is_valid(id) {
            self.slots.get(id as usize)
        } else {
            None
        }
    }

    pub fn state(&self, id: u8) -> ChannelState {
        self.get(id).map_or(ChannelState::Empty, Channel::state)
    }

    /// Handler of an open channel
    pub fn open_handler(&self, id: u8) -> Option<Arc<dyn Handler>> {
        self.get(id)
            .filter(|c| c.is_open())
            .and_then(|c| c.handler.clone())
    }

    /// Lowest empty id ≥ 1
    pub fn allocate(&self) -> Option<u8> {
        self.slots
            .iter()
            .skip(1)
            .find(|c| c.state == ChannelState::Empty)
            .map(|c| c.id)
    }

    /// First empty id after `id`, wrapping around to 1
    pub fn next_free_after(&self, id: u8) -> Option<u8> {
        let len = self.slots.len();
        let start = id as usize;
        (1..len)
            .map(|step| {
                let idx = (start + step) % len;
                if idx == 0 {
                    len
                } else {
                    idx
                }
            })
            .filter(|&idx| idx < len)
            .find(|&idx| self.slots[idx].state == ChannelState::Empty)
            .map(|idx| idx as u8)
    }

    fn slot_mut(&mut self, id: u8) -> std::result::Result<&mut Channel, ChannelError> {
        if !self.is_valid(id) {
            return Err(ChannelError::InvalidId(id));
        }
        Ok(&mut self.slots[id as usize])
    }

    /// `Empty → HalfOpen` for a locally initiated open that must be answered by `deadline`
    pub fn begin_open(
        &mut self,
        id: u8,
        handler: Arc<dyn Handler>,
        waiter: Option<OpenWaiter>,
        deadline: Instant,
    ) -> std::result::Result<(), ChannelError> {
        let slot = self.slot_mut(id)?;
        if slot.state != ChannelState::Empty {
            return Err(ChannelError::Collision {
                requested: id,
                actual: id,
            });
        }
        slot.state = ChannelState::HalfOpen;
        slot.handler = Some(handler);
        slot.waiter = waiter;
        slot.deadline = Some(deadline);
        self.open_deadlines.insert((deadline, id));
        Ok(())
    }

    fn clear_deadline(&mut self, id: u8) -> Option<Instant> {
        let deadline = self.slots.get_mut(id as usize)?.deadline.take()?;
        self.open_deadlines.remove(&(deadline, id));
        Some(deadline)
    }

    /// `Empty → Open` for a remotely initiated open
    pub fn bind(&mut self, id: u8, handler: Arc<dyn Handler>) -> std::result::Result<(), ChannelError> {
        let slot = self.slot_mut(id)?;
        if slot.state != ChannelState::Empty {
            return Err(ChannelError::Collision {
                requested: id,
                actual: id,
            });
        }
        slot.state = ChannelState::Open;
        slot.handler = Some(handler);
        Ok(())
    }

    /// Move a half-open entry from `from` to `to` after the peer renumbered it.
    /// Fails with `Collision` if `to` is in use; `from` is left untouched then.
    pub fn relocate(&mut self, from: u8, to: u8) -> std::result::Result<(), ChannelError> {
        if !self.is_valid(from) {
            return Err(ChannelError::InvalidId(from));
        }
        if !self.is_valid(to) {
            return Err(ChannelError::InvalidId(to));
        }
        if self.slots[from as usize].state != ChannelState::HalfOpen {
            return Err(ChannelError::NotOpen(from));
        }
        if self.slots[to as usize].state != ChannelState::Empty {
            return Err(ChannelError::Collision {
                requested: from,
                actual: to,
            });
        }

        let deadline = self.clear_deadline(from);
        let moved = std::mem::replace(&mut self.slots[from as usize], Channel::empty(from));
        self.slots[to as usize] = Channel {
            id: to,
            deadline,
            ..moved
        };
        if let Some(deadline) = deadline {
            self.open_deadlines.insert((deadline, to));
        }
        Ok(())
    }

    /// `HalfOpen → Open`; hands back the open waiter
    pub fn confirm(&mut self, id: u8) -> std::result::Result<Option<OpenWaiter>, ChannelError> {
        let slot = self.slot_mut(id)?;
        if slot.state != ChannelState::HalfOpen {
            return Err(ChannelError::NotOpen(id));
        }
        slot.state = ChannelState::Open;
        let waiter = slot.waiter.take();
        self.clear_deadline(id);
        Ok(waiter)
    }

    /// Return a slot to `Empty`, handing back whatever it held.
    pub fn reset(&mut self, id: u8) -> Option<Released> {
        if !self.is_valid(id) {
            return None;
        }
        self.clear_deadline(id);
        let slot = &mut self.slots[id as usize];
        let released = std::mem::replace(slot, Channel::empty(id));
        Some(Released {
            id,
            state: released.state,
            handler: released.handler,
            waiter: released.waiter,
        })
    }

    /// Earliest deadline of a half-open slot
    pub fn next_open_deadline(&self) -> Option<Instant> {
        self.open_deadlines.first().map(|&(deadline, _)| deadline)
    }

    /// Reset every half-open slot whose deadline is at or before `now`.
    pub fn expire_opens(&mut self, now: Instant) -> Vec<Released> {
        let mut expired = Vec::new();
        while let Some((deadline, id)) = self.open_deadlines.first().copied() {
            if deadline > now {
                break;
            }
            if self.state(id) != ChannelState::HalfOpen {
                self.open_deadlines.remove(&(deadline, id));
                continue;
            }
            if let Some(released) = self.reset(id) {
                expired.push(released);
            }
        }
        expired
    }

    /// Ids of every slot that is not `Empty`
    pub fn active_ids(&self) -> Vec<u8> {
        self.slots
            .iter()
            .skip(1)
            .filter(|c| c.state != ChannelState::Empty)
            .map(|c| c.id)
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|c| c.is_open()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handler::Incoming;
    use crate::protocol::peer::ChannelLink;

    struct Noop;

    impl Handler for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn service_type(&self) -> &str {
            "Test"
        }
        fn on_message(&self, _link: &ChannelLink, _message: Incoming) {}
    }

    fn noop() -> Arc<dyn Handler> {
        Arc::new(Noop)
    }

    fn soon() -> Instant {
        Instant::now() + std::time::Duration::from_secs(5)
    }

    #[test]
    fn test_allocate_lowest_skips_control() {
        let mut table = ChannelTable::new(4);
        assert_eq!(table.allocate(), Some(1));
        table.begin_open(1, noop(), None, soon()).unwrap();
        assert_eq!(table.allocate(), Some(2));
        table.bind(2, noop()).unwrap();
        table.bind(3, noop()).unwrap();
        assert_eq!(table.allocate(), None);

        table.reset(2);
        assert_eq!(table.allocate(), Some(2));
    }

    #[test]
    fn test_control_and_out_of_range_ids_invalid() {
        let mut table = ChannelTable::new(4);
        assert!(!table.is_valid(0));
        assert!(!table.is_valid(4));
        assert_eq!(table.bind(0, noop()), Err(ChannelError::InvalidId(0)));
        assert_eq!(table.bind(9, noop()), Err(ChannelError::InvalidId(9)));
        assert!(table.reset(0).is_none());
    }

    #[test]
    fn test_next_free_after_wraps() {
        let mut table = ChannelTable::new(4);
        table.bind(1, noop()).unwrap();
        table.bind(3, noop()).unwrap();
        assert_eq!(table.next_free_after(1), Some(2));
        table.bind(2, noop()).unwrap();
        assert_eq!(table.next_free_after(1), None);
        table.reset(1);
        assert_eq!(table.next_free_after(3), Some(1));
    }

    #[test]
    fn test_half_open_confirm() {
        let mut table = ChannelTable::new(8);
        let (tx, _rx) = oneshot::channel();
        table.begin_open(1, noop(), Some(tx), soon()).unwrap();
        assert_eq!(table.state(1), ChannelState::HalfOpen);
        assert!(table.open_handler(1).is_none());

        let waiter = table.confirm(1).unwrap();
        assert!(waiter.is_some());
        assert_eq!(table.state(1), ChannelState::Open);
        assert!(table.open_handler(1).is_some());
        assert_eq!(table.confirm(1).unwrap_err(), ChannelError::NotOpen(1));
    }

    #[test]
    fn test_relocate_moves_entry() {
        let mut table = ChannelTable::new(8);
        table.begin_open(1, noop(), None, soon()).unwrap();
        table.relocate(1, 5).unwrap();
        assert_eq!(table.state(1), ChannelState::Empty);
        assert_eq!(table.state(5), ChannelState::HalfOpen);
        assert_eq!(table.get(5).map(Channel::id), Some(5));
    }

    #[test]
    fn test_relocate_collision_leaves_source() {
        let mut table = ChannelTable::new(8);
        table.begin_open(1, noop(), None, soon()).unwrap();
        table.bind(2, noop()).unwrap();
        assert_eq!(
            table.relocate(1, 2),
            Err(ChannelError::Collision {
                requested: 1,
                actual: 2
            })
        );
        assert_eq!(table.state(1), ChannelState::HalfOpen);
        assert_eq!(table.state(2), ChannelState::Open);
    }

    #[test]
    fn test_reset_returns_contents() {
        let mut table = ChannelTable::new(8);
        table.bind(4, noop()).unwrap();
        let released = table.reset(4).unwrap();
        assert_eq!(released.state, ChannelState::Open);
        assert!(released.handler.is_some());
        assert_eq!(table.state(4), ChannelState::Empty);

        let again = table.reset(4).unwrap();
        assert_eq!(again.state, ChannelState::Empty);
        assert!(table.active_ids().is_empty());
    }

    #[test]
    fn test_table_size_clamped() {
        assert_eq!(ChannelTable::new(0).capacity(), 2);
        assert_eq!(ChannelTable::new(1000).capacity(), MAX_CHANNELS);
        assert_eq!(ChannelTable::default().capacity(), 256);
    }

    #[test]
    fn test_open_deadlines_follow_the_slot() {
        let mut table = ChannelTable::new(8);
        let start = Instant::now();
        let first = start + std::time::Duration::from_secs(2);
        let second = start + std::time::Duration::from_secs(4);
        table.begin_open(1, noop(), None, first).unwrap();
        table.begin_open(2, noop(), None, second).unwrap();
        assert_eq!(table.next_open_deadline(), Some(first));

        // renumbered entry keeps its deadline under the new id
        table.relocate(1, 6).unwrap();
        assert_eq!(table.next_open_deadline(), Some(first));
        table.confirm(6).unwrap();
        assert_eq!(table.next_open_deadline(), Some(second));

        table.reset(2);
        assert!(table.next_open_deadline().is_none());
    }

    #[test]
    fn test_expire_opens_resets_overdue_slots() {
        let mut table = ChannelTable::new(8);
        let start = Instant::now();
        let (tx, _rx) = oneshot::channel();
        table
            .begin_open(1, noop(), Some(tx), start + std::time::Duration::from_secs(1))
            .unwrap();
        table
            .begin_open(2, noop(), None, start + std::time::Duration::from_secs(3))
            .unwrap();

        assert!(table.expire_opens(start).is_empty());
        let expired = table.expire_opens(start + std::time::Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 1);
        assert_eq!(expired[0].state, ChannelState::HalfOpen);
        assert!(expired[0].waiter.is_some());
        assert_eq!(table.state(1), ChannelState::Empty);
        assert_eq!(table.state(2), ChannelState::HalfOpen);
        assert_eq!(table.next_open_deadline(), Some(start + std::time::Duration::from_secs(3)));
    }
}
