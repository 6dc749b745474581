//! Dynamically-sized hash tables based upon sparse groups.
//!
//! A sparse group is an array of up to 58 slots that materializes storage
//! only for the slots that are in use; one `u64` carries the occupancy
//! bitmap. This gives a compact table at the cost of a little extra work on
//! insertion (inspired by the Google sparsehash concept).
//!
//! Tables are open-addressed with triangular probing and resize themselves
//! to keep the load factor between 40% and 80% of the (always power-of-two)
//! slot count. Keys are not stored separately: each table carries a
//! key-extraction function and compares keys in place, so an entry is any
//! value that contains its own key.

/// Number of addressable slots per group. The occupancy bitmap has to share
/// its `u64` with the population count in the densest imaginable layout, so
/// 58 is the historical limit and the group geometry everything else assumes.
const GROUP_SLOTS: usize = 58;

/// Tables never shrink below this many slots.
const MIN_SIZE: usize = 8;

/// A key a [`SparseTable`] can hash and compare in place.
pub trait TableKey {
    fn table_hash(&self) -> u32;
}

/// Case-sensitive string keys, hashed with djb2.
impl TableKey for str {
    fn table_hash(&self) -> u32 {
        let mut hash: u32 = 5381;
        for c in self.bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(c as u32);
        }
        hash
    }
}

/// 64-bit integer keys, hashed with the Thomas Wang mix.
impl TableKey for u64 {
    fn table_hash(&self) -> u32 {
        let mut key = *self;
        key = (!key).wrapping_add(key << 21);
        key ^= key >> 24;
        key = key.wrapping_add(key << 3).wrapping_add(key << 8);
        key ^= key >> 14;
        key = key.wrapping_add(key << 2).wrapping_add(key << 4);
        key ^= key >> 28;
        key = key.wrapping_add(key << 31);
        key as u32
    }
}

/// 128-bit raw-memory keys (e.g. mRIDs), hashed with djb2 over the 16 bytes.
impl TableKey for [u8; 16] {
    fn table_hash(&self) -> u32 {
        let mut hash: u32 = 5381;
        for &c in self {
            hash = hash.wrapping_mul(33).wrapping_add(c as u32);
        }
        hash
    }
}

struct SparseGroup<T> {
    /// Occupancy bitmap over the low 58 bits. A set bit with a `None` slot
    /// is a tombstone: it keeps probe chains intact until the next resize.
    bits: u64,
    slot: Vec<Option<T>>,
}

impl<T> SparseGroup<T> {
    fn new() -> SparseGroup<T> {
        SparseGroup { bits: 0, slot: Vec::new() }
    }

    /// Count the occupied slots below position `i`: the storage index of `i`.
    fn rank(&self, i: usize) -> usize {
        if i == 0 {
            0
        } else {
            (self.bits << (64 - i)).count_ones() as usize
        }
    }

    fn is_empty(&self, i: usize) -> bool {
        self.bits & (1 << i) == 0
    }

    fn insert(&mut self, i: usize, data: T) {
        let s = self.rank(i);
        self.slot.insert(s, Some(data));
        self.bits |= 1 << i;
    }
}

enum Probe {
    /// Storage already materialized for this key (live entry or tombstone).
    At(usize, usize),
    /// First reusable position on the probe path (empty or tombstone).
    Vacant(usize, usize),
}

/// An open-addressed hash table of `T`, keyed by `K` through a
/// key-extraction function supplied at construction.
pub struct SparseTable<T, K: TableKey + ?Sized> {
    key_of: fn(&T) -> &K,
    table: Vec<SparseGroup<T>>,
    size: usize,
    items: usize,
    min: usize,
    max: usize,
}

impl<T, K> SparseTable<T, K>
where
    K: TableKey + PartialEq + ?Sized,
{
    /// Create a table with `size` slots. `size` must be a power of two.
    pub fn new(size: usize, key_of: fn(&T) -> &K) -> SparseTable<T, K> {
        assert!(size.is_power_of_two());
        let mut table = SparseTable { key_of, table: Vec::new(), size: 0, items: 0, min: 0, max: 0 };
        table.init(size);
        table
    }

    fn init(&mut self, size: usize) {
        let groups = (size + GROUP_SLOTS - 1) / GROUP_SLOTS;
        self.size = size;
        self.min = size * 40 / 100;
        self.max = size * 80 / 100;
        self.table = (0..groups).map(|_| SparseGroup::new()).collect();
    }

    pub fn items(&self) -> usize {
        self.items
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Probe for `key`. Tombstones do not terminate the search but the
    /// first one seen is remembered for reuse.
    fn find(&self, key: &K) -> Probe {
        let mask = self.size - 1;
        let mut index = key.table_hash() as usize & mask;
        let mut probes = 0;
        let mut vacant = None;
        loop {
            let (g, i) = (index / GROUP_SLOTS, index % GROUP_SLOTS);
            let group = &self.table[g];
            if group.is_empty(i) {
                let (g, i) = vacant.unwrap_or((g, i));
                return Probe::Vacant(g, i);
            }
            match &group.slot[group.rank(i)] {
                Some(data) if (self.key_of)(data) == key => return Probe::At(g, i),
                Some(_) => (),
                None => {
                    if vacant.is_none() {
                        vacant = Some((g, i));
                    }
                }
            }
            probes += 1;
            index = (index + probes) & mask;
        }
    }

    pub fn get(&self, key: &K) -> Option<&T> {
        match self.find(key) {
            Probe::At(g, i) => {
                let group = &self.table[g];
                group.slot[group.rank(i)].as_ref()
            }
            Probe::Vacant(..) => None,
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut T> {
        match self.find(key) {
            Probe::At(g, i) => {
                let rank = self.table[g].rank(i);
                self.table[g].slot[rank].as_mut()
            }
            Probe::Vacant(..) => None,
        }
    }

    /// Insert `data`, replacing any entry with the same key.
    pub fn put(&mut self, data: T) {
        match self.find((self.key_of)(&data)) {
            Probe::At(g, i) => {
                let rank = self.table[g].rank(i);
                self.table[g].slot[rank] = Some(data);
            }
            Probe::Vacant(mut g, mut i) => {
                if self.items == self.max {
                    self.resize(self.size << 1);
                    // the remembered position is for the old geometry
                    match self.find((self.key_of)(&data)) {
                        Probe::Vacant(ng, ni) => (g, i) = (ng, ni),
                        Probe::At(..) => unreachable!(),
                    }
                }
                let group = &mut self.table[g];
                if group.is_empty(i) {
                    group.insert(i, data);
                } else {
                    // reuse a tombstone
                    let rank = group.rank(i);
                    group.slot[rank] = Some(data);
                }
                self.items += 1;
            }
        }
    }

    /// Remove and return the entry with the given key, leaving a tombstone.
    pub fn delete(&mut self, key: &K) -> Option<T> {
        match self.find(key) {
            Probe::At(g, i) => {
                let rank = self.table[g].rank(i);
                let data = self.table[g].slot[rank].take();
                self.items -= 1;
                if self.items < self.min && self.size > MIN_SIZE {
                    self.resize(self.size >> 1);
                }
                data
            }
            Probe::Vacant(..) => None,
        }
    }

    /// Rehash every live entry into a table of the new size. Tombstones are
    /// dropped along the way.
    fn resize(&mut self, size: usize) {
        let old = std::mem::replace(&mut self.table, Vec::new());
        self.init(size);
        self.items = 0;
        for group in old {
            for slot in group.slot {
                if let Some(data) = slot {
                    self.put(data);
                }
            }
        }
    }

    /// Visit every live entry, in group order, skipping tombstones.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.table.iter().flat_map(|g| g.slot.iter().filter_map(Option::as_ref))
    }

    /// Keep only the entries for which `f` returns `true`. Removal during
    /// iteration leaves tombstones exactly like [`SparseTable::delete`], but
    /// defers any shrink until the walk is complete.
    pub fn retain(&mut self, mut f: impl FnMut(&T) -> bool) {
        for group in &mut self.table {
            for slot in &mut group.slot {
                if let Some(data) = slot {
                    if !f(data) {
                        *slot = None;
                        self.items -= 1;
                    }
                }
            }
        }
        while self.items < self.min && self.size > MIN_SIZE {
            self.resize(self.size >> 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Rec {
        key: u64,
        value: u32,
    }

    fn rec_key(r: &Rec) -> &u64 {
        &r.key
    }

    fn int_table(size: usize) -> SparseTable<Rec, u64> {
        SparseTable::new(size, rec_key)
    }

    /// A fixed-seed xorshift so the test keys are deterministic but not
    /// sequential.
    fn keys(n: usize) -> Vec<u64> {
        let mut state = 0x9e3779b97f4a7c15u64;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state
            })
            .collect()
    }

    #[test]
    fn put_get_delete() {
        let mut t = int_table(64);
        t.put(Rec { key: 12, value: 1 });
        t.put(Rec { key: 700, value: 2 });
        assert_eq!(t.get(&12), Some(&Rec { key: 12, value: 1 }));
        assert_eq!(t.get(&700), Some(&Rec { key: 700, value: 2 }));
        assert_eq!(t.get(&13), None);

        // replacing by key does not grow the table
        t.put(Rec { key: 12, value: 3 });
        assert_eq!(t.items(), 2);
        assert_eq!(t.get(&12).unwrap().value, 3);

        assert_eq!(t.delete(&12), Some(Rec { key: 12, value: 3 }));
        assert_eq!(t.get(&12), None);
        assert_eq!(t.items(), 1);
    }

    #[test]
    fn tombstone_does_not_break_probe_chains() {
        // Two keys that collide modulo the table size probe past each other;
        // deleting the first must leave the second reachable.
        let mut t = int_table(8);
        let ks = [3u64, 11, 19];
        for &k in &ks {
            t.put(Rec { key: k, value: k as u32 });
        }
        t.delete(&3);
        assert_eq!(t.get(&11).unwrap().value, 11);
        assert_eq!(t.get(&19).unwrap().value, 19);

        // the tombstone is reused rather than extending the chain
        t.put(Rec { key: 27, value: 27 });
        assert_eq!(t.get(&27).unwrap().value, 27);
    }

    #[test]
    fn insert_at_capacity_doubles_once() {
        let mut t = int_table(16);
        // max = 12 for size 16
        for k in 0..12u64 {
            t.put(Rec { key: k, value: 0 });
        }
        assert_eq!(t.size(), 16);
        t.put(Rec { key: 100, value: 0 });
        assert_eq!(t.size(), 32);
        t.put(Rec { key: 101, value: 0 });
        assert_eq!(t.size(), 32);
        for k in (0..12u64).chain([100, 101]) {
            assert!(t.get(&k).is_some(), "lost key {} across resize", k);
        }
    }

    #[test]
    fn round_trip_10k() {
        let ks = keys(10_000);
        let mut t = int_table(64);
        for &k in &ks {
            t.put(Rec { key: k, value: (k >> 32) as u32 });
        }
        assert_eq!(t.items(), 10_000);
        for &k in &ks {
            assert_eq!(t.get(&k).unwrap().key, k);
        }

        for &k in ks.iter().step_by(2) {
            assert!(t.delete(&k).is_some());
        }
        assert_eq!(t.items(), 5_000);

        let mut seen: Vec<u64> = t.iter().map(|r| r.key).collect();
        seen.sort_unstable();
        let mut expected: Vec<u64> = ks.iter().skip(1).step_by(2).copied().collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
        assert!(t.size().is_power_of_two());
    }

    #[test]
    fn retain_sweeps_and_shrinks() {
        let ks = keys(1_000);
        let mut t = int_table(64);
        for &k in &ks {
            t.put(Rec { key: k, value: 0 });
        }
        let grown = t.size();
        t.retain(|r| r.key % 8 == 0);
        assert_eq!(t.items(), t.iter().count());
        assert!(t.size() < grown);
        assert!(t.items() >= t.size() * 40 / 100 || t.size() == 8);
    }

    #[test]
    fn string_keys() {
        struct Named {
            name: String,
            id: u32,
        }
        let mut t: SparseTable<Named, str> = SparseTable::new(16, |n| &n.name);
        t.put(Named { name: "DERControlList".into(), id: 1 });
        t.put(Named { name: "dercontrollist".into(), id: 2 });
        assert_eq!(t.get("DERControlList").unwrap().id, 1);
        assert_eq!(t.get("dercontrollist").unwrap().id, 2);
        assert!(t.get("DERControl").is_none());
    }

    #[test]
    fn mrid_keys() {
        struct Block {
            mrid: [u8; 16],
        }
        let mut t: SparseTable<Block, [u8; 16]> = SparseTable::new(8, |b| &b.mrid);
        let a = [0x11; 16];
        let mut b = [0x11; 16];
        b[15] = 0x12;
        t.put(Block { mrid: a });
        t.put(Block { mrid: b });
        assert!(t.get(&a).is_some());
        assert!(t.get(&b).is_some());
        assert_eq!(t.items(), 2);
    }
}
