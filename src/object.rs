//! Object table (C3)
//!
//! Each endpoint (client or server) owns one `ObjectTable` mapping ids to
//! entries. Ids are partitioned by originator (§3) so a client id and a
//! server id can never collide, and an entry's `parent` is recorded as an
//! id rather than a pointer so cascade retirement (§4.3) needs no cyclic
//! ownership.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;

use crate::error::{Error, Result};
use crate::interface::Interface;

/// First id in the server-allocated partition.
pub const SERVER_ID_START: u32 = 0xFF00_0000;
/// Last id in the client-allocated partition.
pub const CLIENT_ID_END: u32 = 0xFEFF_FFFF;

/// How many recently-retired ids each table remembers, for distinguishing a
/// legitimate race against a just-retired object from a reference to an id
/// that was never allocated at all.
const RETIRED_HISTORY_CAP: usize = 256;

/// A protocol object id. Wraps the wire `u32` in a `NonZeroU32` since id 0
/// ("null object") never names a live object; a nullable object reference
/// is `Option<ObjectId>`, never `ObjectId` holding 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(NonZeroU32);

impl ObjectId {
    pub const fn new(id: u32) -> Option<Self> {
        match NonZeroU32::new(id) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The display object's fixed id.
pub const DISPLAY_ID: ObjectId = match ObjectId::new(1) {
    Some(id) => id,
    None => panic!("1 is never zero"),
};

/// Which partition of the id space an endpoint allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn owns_raw(self, id: u32) -> bool {
        match self {
            Side::Client => id >= 1 && id <= CLIENT_ID_END,
            Side::Server => id >= SERVER_ID_START,
        }
    }

    fn owns(self, id: ObjectId) -> bool {
        self.owns_raw(id.get())
    }

    fn peer_owns(self, id: ObjectId) -> bool {
        match self {
            Side::Client => id.get() >= SERVER_ID_START,
            Side::Server => id.get() >= 1 && id.get() <= CLIENT_ID_END,
        }
    }

    fn first_id(self) -> u32 {
        match self {
            Side::Client => 2, // id 1 is always the display object
            Side::Server => SERVER_ID_START,
        }
    }
}

/// An object's position in its destroy lifecycle (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    PendingDestroy,
    Retired,
}

/// A single entry in the object table.
#[derive(Debug)]
pub struct ObjectEntry {
    pub id: ObjectId,
    pub interface: &'static Interface,
    pub version: u32,
    pub state: Liveness,
    /// The id of the object whose factory request/event created this one,
    /// if any. Used to cascade retirement (§4.3).
    pub parent: Option<ObjectId>,
}

/// Per-endpoint id → object entry map and id allocator.
pub struct ObjectTable {
    side: Side,
    entries: HashMap<ObjectId, ObjectEntry>,
    next_id: u32,
    retired_recently: VecDeque<ObjectId>,
    retired_recently_set: HashSet<ObjectId>,
}

impl ObjectTable {
    /// Create a table for `side`, seeded with the display object at id 1.
    pub fn new(side: Side) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            DISPLAY_ID,
            ObjectEntry {
                id: DISPLAY_ID,
                interface: &crate::interface::DISPLAY,
                version: 1,
                state: Liveness::Live,
                parent: None,
            },
        );
        Self {
            side,
            entries,
            next_id: side.first_id(),
            retired_recently: VecDeque::new(),
            retired_recently_set: HashSet::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Allocate the next unused id in this endpoint's partition, skipping
    /// any id still present in the table (§4.3).
    pub fn allocate_id(&mut self) -> ObjectId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.side.owns_raw(self.next_id) {
                // Wrapped past the partition; loop back to its start.
                self.next_id = self.side.first_id();
            }
            let id = ObjectId::new(id).expect("id allocator never assigns 0");
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert a new live entry. Fails with [`Error::InvalidObject`] if `id`
    /// already exists or lies outside the caller's own partition (I1, I2).
    pub fn insert(
        &mut self,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
        parent: Option<ObjectId>,
    ) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(Error::InvalidObject(id.get()));
        }
        if id != DISPLAY_ID && !self.side.owns(id) {
            return Err(Error::InvalidObject(id.get()));
        }
        self.entries.insert(
            id,
            ObjectEntry {
                id,
                interface,
                version,
                state: Liveness::Live,
                parent,
            },
        );
        Ok(())
    }

    /// Insert an entry for an id allocated by the *peer* (the inverse
    /// partition), used when decoding an inbound `new_id` argument.
    pub fn insert_peer(
        &mut self,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
        parent: Option<ObjectId>,
    ) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(Error::InvalidObject(id.get()));
        }
        if !self.side.peer_owns(id) {
            return Err(Error::InvalidObject(id.get()));
        }
        self.entries.insert(
            id,
            ObjectEntry {
                id,
                interface,
                version,
                state: Liveness::Live,
                parent,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, id: ObjectId) -> Result<&ObjectEntry> {
        self.entries.get(&id).ok_or(Error::InvalidObject(id.get()))
    }

    pub fn lookup_mut(&mut self, id: ObjectId) -> Result<&mut ObjectEntry> {
        self.entries
            .get_mut(&id)
            .ok_or(Error::InvalidObject(id.get()))
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Whether `id` lies in the peer's own id partition (as opposed to this
    /// endpoint's own, or neither — e.g. id 0, which cannot occur here).
    pub fn is_peer_owned(&self, id: ObjectId) -> bool {
        self.side.peer_owns(id)
    }

    /// Whether `id` was retired recently enough that this table still
    /// remembers it, distinguishing a message racing a legitimate retirement
    /// from a reference to an id that was never allocated.
    pub fn was_recently_retired(&self, id: ObjectId) -> bool {
        self.retired_recently_set.contains(&id)
    }

    fn remember_retired(&mut self, id: ObjectId) {
        if self.retired_recently_set.insert(id) {
            self.retired_recently.push_back(id);
            if self.retired_recently.len() > RETIRED_HISTORY_CAP {
                if let Some(oldest) = self.retired_recently.pop_front() {
                    self.retired_recently_set.remove(&oldest);
                }
            }
        }
    }

    /// Move `id` to `pending_destroy`.
    pub fn mark_pending_destroy(&mut self, id: ObjectId) -> Result<()> {
        let entry = self.lookup_mut(id)?;
        entry.state = Liveness::PendingDestroy;
        Ok(())
    }

    /// Remove `id` from the table. Only legal from `pending_destroy`.
    /// Transitively retires any child entries whose `parent` is `id`,
    /// returning every id retired (including `id` itself) in removal order.
    pub fn retire(&mut self, id: ObjectId) -> Result<Vec<ObjectId>> {
        {
            let entry = self.lookup(id)?;
            if entry.state != Liveness::PendingDestroy {
                return Err(Error::Protocol(format!(
                    "id {id} retired while not pending destroy"
                )));
            }
        }

        let children: Vec<ObjectId> = self
            .entries
            .values()
            .filter(|e| e.parent == Some(id))
            .map(|e| e.id)
            .collect();

        let mut retired = Vec::with_capacity(1 + children.len());
        for child in children {
            if self.entries.get(&child).map(|e| e.state) != Some(Liveness::Retired) {
                if self.entries.contains_key(&child) {
                    self.entries.get_mut(&child).unwrap().state = Liveness::PendingDestroy;
                }
                retired.extend(self.retire(child)?);
            }
        }

        self.entries.remove(&id);
        self.remember_retired(id);
        retired.push(id);
        Ok(retired)
    }

    pub fn live_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries
            .values()
            .filter(|e| e.state == Liveness::Live)
            .map(|e| e.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::CALLBACK;

    fn id(n: u32) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[test]
    fn allocator_starts_at_partition_base_and_skips_the_display() {
        let mut table = ObjectTable::new(Side::Client);
        assert_eq!(table.allocate_id(), id(2));
        assert_eq!(table.allocate_id(), id(3));

        let mut server = ObjectTable::new(Side::Server);
        assert_eq!(server.allocate_id(), id(SERVER_ID_START));
    }

    #[test]
    fn allocator_skips_ids_still_present() {
        let mut table = ObjectTable::new(Side::Client);
        table.insert(id(2), &CALLBACK, 1, None).unwrap();
        assert_eq!(table.allocate_id(), id(3));
    }

    #[test]
    fn insert_rejects_duplicate_and_out_of_partition_ids() {
        let mut table = ObjectTable::new(Side::Client);
        table.insert(id(2), &CALLBACK, 1, None).unwrap();
        assert!(matches!(
            table.insert(id(2), &CALLBACK, 1, None),
            Err(Error::InvalidObject(2))
        ));
        assert!(matches!(
            table.insert(id(SERVER_ID_START), &CALLBACK, 1, None),
            Err(Error::InvalidObject(_))
        ));
    }

    #[test]
    fn retire_requires_pending_destroy() {
        let mut table = ObjectTable::new(Side::Client);
        table.insert(id(2), &CALLBACK, 1, None).unwrap();
        assert!(table.retire(id(2)).is_err());
        table.mark_pending_destroy(id(2)).unwrap();
        let retired = table.retire(id(2)).unwrap();
        assert_eq!(retired, vec![id(2)]);
        assert!(!table.contains(id(2)));
        assert!(table.was_recently_retired(id(2)));
    }

    #[test]
    fn retiring_a_parent_cascades_to_children() {
        let mut table = ObjectTable::new(Side::Client);
        table.insert(id(2), &CALLBACK, 1, None).unwrap();
        table.insert(id(3), &CALLBACK, 1, Some(id(2))).unwrap();
        table.insert(id(4), &CALLBACK, 1, Some(id(2))).unwrap();

        table.mark_pending_destroy(id(2)).unwrap();
        let mut retired = table.retire(id(2)).unwrap();
        retired.sort_unstable_by_key(|i| i.get());
        assert_eq!(retired, vec![id(2), id(3), id(4)]);
        assert!(!table.contains(id(2)));
        assert!(!table.contains(id(3)));
        assert!(!table.contains(id(4)));
    }

    #[test]
    fn live_ids_excludes_pending_and_retired() {
        let mut table = ObjectTable::new(Side::Client);
        table.insert(id(2), &CALLBACK, 1, None).unwrap();
        table.insert(id(3), &CALLBACK, 1, None).unwrap();
        table.mark_pending_destroy(id(3)).unwrap();
        let mut live: Vec<u32> = table.live_ids().map(|i| i.get()).collect();
        live.sort_unstable();
        assert_eq!(live, vec![1, 2]);
    }

    #[test]
    fn retired_history_is_capped() {
        let mut table = ObjectTable::new(Side::Client);
        for n in 2..(2 + RETIRED_HISTORY_CAP as u32 + 10) {
            table.insert(id(n), &CALLBACK, 1, None).unwrap();
            table.mark_pending_destroy(id(n)).unwrap();
            table.retire(id(n)).unwrap();
        }
        // The earliest retirements have aged out of the bounded history.
        assert!(!table.was_recently_retired(id(2)));
        assert!(table.was_recently_retired(id(2 + RETIRED_HISTORY_CAP as u32 + 9)));
    }
}
