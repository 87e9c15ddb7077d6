//! Process-wide registry of globals
//!
//! A global is a domain object addressable by numeric id; many clients may
//! hold resources bound to one global. All mutation happens on the main
//! loop.

use std::collections::HashMap;

use itertools::Itertools;

use crate::objects::ObjectState;
use crate::resource::{InterfaceType, Permissions};
use crate::server::ClientId;

pub type GlobalId = u32;

#[derive(Debug)]
pub struct FactoryInfo {
    pub name: String,
    /// Interface of the owner-side resources this factory hands out
    pub object_type: InterfaceType,
    pub version: u32,
}

#[derive(Debug)]
pub enum GlobalKind {
    Core,
    Client(ClientId),
    Factory(FactoryInfo),
    Endpoint(ObjectState),
    Session(ObjectState),
}

impl GlobalKind {
    /// The interface reader-side resources bound on this global speak
    pub fn interface(&self) -> InterfaceType {
        match self {
            GlobalKind::Core => InterfaceType::Core,
            GlobalKind::Client(_) => InterfaceType::Client,
            GlobalKind::Factory(_) => InterfaceType::Factory,
            GlobalKind::Endpoint(_) => InterfaceType::Endpoint,
            GlobalKind::Session(_) => InterfaceType::Session,
        }
    }
}

#[derive(Debug)]
pub struct Global {
    pub id: GlobalId,
    pub version: u32,
    /// Default permissions granted at bind time
    pub permissions: Permissions,
    pub kind: GlobalKind,
    /// Resources bound to this global, as (client, resource id)
    pub bound: Vec<(ClientId, u32)>,
}

impl Global {
    pub fn object_state(&self) -> Option<&ObjectState> {
        match &self.kind {
            GlobalKind::Endpoint(s) | GlobalKind::Session(s) => Some(s),
            _ => None,
        }
    }

    pub fn object_state_mut(&mut self) -> Option<&mut ObjectState> {
        match &mut self.kind {
            GlobalKind::Endpoint(s) | GlobalKind::Session(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    globals: HashMap<GlobalId, Global>,
    next_id: GlobalId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: GlobalKind, version: u32, permissions: Permissions) -> GlobalId {
        let id = self.next_id;
        self.next_id += 1;
        self.globals.insert(
            id,
            Global {
                id,
                version,
                permissions,
                kind,
                bound: Vec::new(),
            },
        );
        id
    }

    pub fn remove(&mut self, id: GlobalId) -> Option<Global> {
        self.globals.remove(&id)
    }

    pub fn get(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(&id)
    }

    pub fn get_mut(&mut self, id: GlobalId) -> Option<&mut Global> {
        self.globals.get_mut(&id)
    }

    /// All globals in ascending id order
    pub fn iter_sorted(&self) -> impl Iterator<Item = &Global> {
        self.globals.values().sorted_by_key(|g| g.id)
    }

    pub fn find_factory(&self, name: &str) -> Option<&Global> {
        self.globals.values().find(
            |g| matches!(&g.kind, GlobalKind::Factory(f) if f.name == name),
        )
    }

    /// Drops every global owned by `client`, returning them for the caller
    /// to broadcast removal
    pub fn remove_for_client(&mut self, client: ClientId) -> Vec<Global> {
        let ids: Vec<GlobalId> = self
            .globals
            .values()
            .filter(|g| match &g.kind {
                GlobalKind::Client(owner) => *owner == client,
                GlobalKind::Endpoint(s) | GlobalKind::Session(s) => {
                    s.owner.map_or(false, |(owner, _)| owner == client)
                }
                _ => false,
            })
            .map(|g| g.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.globals.remove(&id))
            .collect()
    }

    /// Forgets a bound resource, e.g. when its client goes away
    pub fn unbind(&mut self, client: ClientId, resource_id: u32) {
        for global in self.globals.values_mut() {
            global
                .bound
                .retain(|(c, r)| !(*c == client && *r == resource_id));
        }
    }

    pub fn unbind_client(&mut self, client: ClientId) {
        for global in self.globals.values_mut() {
            global.bound.retain(|(c, _)| *c != client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectKind;

    #[test]
    fn test_ids_are_stable_and_ascending() {
        let mut reg = Registry::new();
        let core = reg.add(GlobalKind::Core, 1, Permissions::RWX);
        let client = reg.add(GlobalKind::Client(0), 1, Permissions::RWX);
        assert!(core < client);
        reg.remove(core);
        let next = reg.add(GlobalKind::Client(1), 1, Permissions::RWX);
        assert!(next > client, "ids are never reused");
    }

    #[test]
    fn test_iter_sorted() {
        let mut reg = Registry::new();
        for i in 0..5 {
            reg.add(GlobalKind::Client(i), 1, Permissions::RWX);
        }
        let ids: Vec<GlobalId> = reg.iter_sorted().map(|g| g.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_remove_for_client_cascades() {
        let mut reg = Registry::new();
        reg.add(GlobalKind::Core, 1, Permissions::RWX);
        let client_global = reg.add(GlobalKind::Client(3), 1, Permissions::RWX);
        let endpoint = reg.add(
            GlobalKind::Endpoint(ObjectState::new(ObjectKind::Endpoint, Some((3, 2)))),
            1,
            Permissions::RWX,
        );
        let other = reg.add(GlobalKind::Client(4), 1, Permissions::RWX);

        let removed = reg.remove_for_client(3);
        let mut removed_ids: Vec<GlobalId> = removed.iter().map(|g| g.id).collect();
        removed_ids.sort();
        assert_eq!(removed_ids, vec![client_global, endpoint]);
        assert!(reg.get(other).is_some());
    }

    #[test]
    fn test_find_factory() {
        let mut reg = Registry::new();
        reg.add(
            GlobalKind::Factory(FactoryInfo {
                name: "client-endpoint".into(),
                object_type: InterfaceType::ClientEndpoint,
                version: 1,
            }),
            1,
            Permissions::RX,
        );
        assert!(reg.find_factory("client-endpoint").is_some());
        assert!(reg.find_factory("nope").is_none());
    }
}
