//! The resource cache: the client-side stub graph.
//!
//! Every server resource the client has hydrated gets a [`Stub`] holding
//! the parsed object and its dependency edges (list members, linked
//! subordinates). The cache owns every stub; the rest of the crate refers
//! to them by [`StubId`], so back-references never dangle and no cycle
//! needs shared ownership.

use crate::StubId;
use sep2::types;
use sep2::SeObject;
use sparsemap::SparseTable;

pub struct Stub {
    pub uri: String,
    pub type_id: u16,
    pub data: SeObject,
    /// Dependent resources: list members and linked subordinates.
    pub reqs: Vec<StubId>,
    /// Last hydration time.
    pub time: i64,
    pub subscribed: bool,
}

struct UriIndex {
    uri: String,
    id: StubId,
}

fn uri_key(e: &UriIndex) -> &str {
    &e.uri
}

pub struct ResourceCache {
    stubs: Vec<Stub>,
    index: SparseTable<UriIndex, str>,
}

impl Default for ResourceCache {
    fn default() -> ResourceCache {
        ResourceCache::new()
    }
}

impl ResourceCache {
    pub fn new() -> ResourceCache {
        ResourceCache { stubs: Vec::new(), index: SparseTable::new(64, uri_key) }
    }

    /// Insert or update the resource at `uri`. An existing stub has its
    /// object replaced in place and keeps its id and dependents.
    pub fn insert(&mut self, uri: &str, type_id: u16, data: SeObject, now: i64) -> StubId {
        match self.find(uri) {
            Some(id) => {
                let stub = &mut self.stubs[id];
                debug_assert_eq!(stub.type_id, type_id);
                stub.data.replace(data);
                stub.time = now;
                id
            }
            None => {
                let id = self.stubs.len();
                self.stubs.push(Stub {
                    uri: uri.to_owned(),
                    type_id,
                    data,
                    reqs: Vec::new(),
                    time: now,
                    subscribed: false,
                });
                self.index.put(UriIndex { uri: uri.to_owned(), id });
                id
            }
        }
    }

    pub fn find(&self, uri: &str) -> Option<StubId> {
        self.index.get(uri).map(|e| e.id)
    }

    pub fn get(&self, id: StubId) -> &Stub {
        &self.stubs[id]
    }

    pub fn get_mut(&mut self, id: StubId) -> &mut Stub {
        &mut self.stubs[id]
    }

    /// Record that `parent` depends on `child`.
    pub fn add_req(&mut self, parent: StubId, child: StubId) {
        if !self.stubs[parent].reqs.contains(&child) {
            self.stubs[parent].reqs.push(child);
        }
    }

    /// First dependent of `stub` whose type is (or derives from) `ty`.
    pub fn get_subordinate(&self, stub: StubId, ty: u16) -> Option<StubId> {
        let schema = types::schema();
        self.stubs[stub]
            .reqs
            .iter()
            .copied()
            .find(|&id| self.stubs[id].type_id == ty || schema.type_is_a(self.stubs[id].type_id, ty))
    }
}
