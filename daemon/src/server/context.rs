//! The single owner of all protocol state
//!
//! Clients, globals and resources are mutated only on the main loop; every
//! method handler gets the context threaded through.

use std::collections::{HashMap, VecDeque};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;

use wavepipe_core::connection::Connection;
use wavepipe_core::error::{DaemonResult, WireError};
use wavepipe_core::pod::Value;

use crate::config::Config;
use crate::objects::{ObjectInfo, ObjectKind, ObjectState, CHANGE_ALL};
use crate::registry::{FactoryInfo, GlobalId, GlobalKind, Registry};
use crate::resource::{ev, InterfaceType, Permissions, Resource};
use crate::server::client::{peer_props, Client};
use crate::server::ClientId;

/// Resource id the core global is bound under in every client
pub const CORE_RESOURCE_ID: u32 = 0;
/// Resource id a client's own client global is bound under
pub const CLIENT_RESOURCE_ID: u32 = 1;

pub type Deferred = Box<dyn FnOnce(&mut Context) + Send>;

pub struct Context {
    pub config: Config,
    pub registry: Registry,
    pub clients: Vec<Option<Client>>,
    /// Main-loop actions queued by handlers, run before the next poll
    pub deferred: VecDeque<Deferred>,
    /// Clients condemned during dispatch, reaped by the server loop
    pub dead: Vec<ClientId>,
    pub core_global: GlobalId,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let mut registry = Registry::new();
        let core_global = registry.add(GlobalKind::Core, 1, Permissions::RWX);
        registry.add(
            GlobalKind::Factory(FactoryInfo {
                name: "client-endpoint".into(),
                object_type: InterfaceType::ClientEndpoint,
                version: 1,
            }),
            1,
            Permissions::RX,
        );
        registry.add(
            GlobalKind::Factory(FactoryInfo {
                name: "client-session".into(),
                object_type: InterfaceType::ClientSession,
                version: 1,
            }),
            1,
            Permissions::RX,
        );
        Self {
            config,
            registry,
            clients: Vec::new(),
            deferred: VecDeque::new(),
            dead: Vec::new(),
            core_global,
        }
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id).and_then(|c| c.as_ref())
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(id).and_then(|c| c.as_mut())
    }

    pub fn live_clients(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .enumerate()
            .filter_map(|(id, c)| c.as_ref().map(|_| id))
            .collect()
    }

    /// Registers a server-owned endpoint or session global, e.g. for the
    /// daemon's own audio device
    pub fn add_object_global(
        &mut self,
        kind: ObjectKind,
        info: ObjectInfo,
        permissions: Permissions,
    ) -> GlobalId {
        let mut state = ObjectState::new(kind, None);
        state.info = info;
        let global_kind = match kind {
            ObjectKind::Endpoint => GlobalKind::Endpoint(state),
            ObjectKind::Session => GlobalKind::Session(state),
        };
        let id = self.registry.add(global_kind, 1, permissions);
        if let Some(state) = self.registry.get_mut(id).and_then(|g| g.object_state_mut()) {
            state.info.id = id;
        }
        self.broadcast_global(id);
        id
    }

    /// Accepts a new connection: reads credentials, installs the client and
    /// binds the core and client globals into it
    pub fn add_client(&mut self, stream: UnixStream) -> DaemonResult<ClientId> {
        let props = peer_props(stream.as_fd());
        let conn = Connection::new(stream)?;

        let id = match self.clients.iter().position(|c| c.is_none()) {
            Some(slot) => slot,
            None => {
                self.clients.push(None);
                self.clients.len() - 1
            }
        };

        let global = self.registry.add(GlobalKind::Client(id), 1, Permissions::RWX);
        self.clients[id] = Some(Client {
            id,
            conn,
            props,
            resources: HashMap::new(),
            recv_seq: 0,
            busy: false,
            global,
        });

        info!("client {id}: connected");

        // every client talks to the core through resource 0 and sees itself
        // through resource 1
        let core = self.core_global;
        self.bind_global(id, core, 1, CORE_RESOURCE_ID).ok();
        self.bind_global(id, global, 1, CLIENT_RESOURCE_ID).ok();
        self.broadcast_global(global);

        Ok(id)
    }

    /// Marks a client for destruction; the server loop reaps it
    pub fn mark_dead(&mut self, id: ClientId) {
        if !self.dead.contains(&id) {
            self.dead.push(id);
        }
    }

    /// Tears a client down: resources unbind, owned globals disappear with
    /// a broadcast, the connection closes with its held fds
    pub fn teardown_client(&mut self, id: ClientId) -> Option<Client> {
        let mut client = self.clients.get_mut(id)?.take()?;
        // best effort: pending frames, error replies included, may still
        // reach the peer
        let _ = client.conn.flush();
        self.registry.unbind_client(id);
        let removed = self.registry.remove_for_client(id);
        for global in &removed {
            self.broadcast_global_remove(global.id);
        }
        info!("client {id}: destroyed ({} globals removed)", removed.len());
        Some(client)
    }

    /// Creates a resource in `client` bound to `global_id` and sends the
    /// interface's initial info event
    pub fn bind_global(
        &mut self,
        client: ClientId,
        global_id: GlobalId,
        version: u32,
        new_id: u32,
    ) -> Result<(), WireError> {
        let (ty, permissions, version) = match self.registry.get(global_id) {
            Some(global) => (
                global.kind.interface(),
                global.permissions,
                version.min(global.version),
            ),
            None => return Err(WireError::invalid(format!("no global {global_id}"))),
        };

        let Some(c) = self.client_mut(client) else {
            return Err(WireError::invalid("client gone"));
        };
        if c.resources.contains_key(&new_id) {
            return Err(WireError::invalid(format!("resource id {new_id} in use")));
        }
        c.resources.insert(
            new_id,
            Resource::new(new_id, ty, version, permissions, Some(global_id)),
        );
        self.registry
            .get_mut(global_id)
            .unwrap()
            .bound
            .push((client, new_id));

        debug!("client {client}: bound global {global_id} as {new_id} ({ty:?})");
        self.emit_initial_info(client, global_id, new_id);
        Ok(())
    }

    pub(crate) fn emit_initial_info(
        &mut self,
        client: ClientId,
        global_id: GlobalId,
        resource_id: u32,
    ) {
        let event = {
            let Some(global) = self.registry.get_mut(global_id) else {
                return;
            };
            match &mut global.kind {
                GlobalKind::Core => {
                    let name = self.config.effective_core_name();
                    (
                        ev::core::INFO,
                        Value::Struct(vec![
                            Value::Id(global_id),
                            Value::String(name),
                            Value::Int(1),
                        ]),
                    )
                }
                GlobalKind::Client(owner) => {
                    let props = self
                        .clients
                        .get(*owner)
                        .and_then(|c| c.as_ref())
                        .map(|c| c.props.clone())
                        .unwrap_or_default();
                    let mut fields = Vec::new();
                    for (k, v) in props {
                        fields.push(Value::String(k));
                        fields.push(Value::String(v));
                    }
                    (
                        ev::client::INFO,
                        Value::Struct(vec![Value::Id(global_id), Value::Struct(fields)]),
                    )
                }
                GlobalKind::Factory(f) => (
                    ev::factory::INFO,
                    Value::Struct(vec![
                        Value::Id(global_id),
                        Value::String(f.name.clone()),
                        Value::Id(f.object_type as u32),
                        Value::Int(f.version as i32),
                    ]),
                ),
                GlobalKind::Endpoint(state) | GlobalKind::Session(state) => {
                    // a fresh bind always sees the full info once
                    state.info.change_mask = CHANGE_ALL;
                    let payload = state.info.marshal();
                    state.info.change_mask = 0;
                    (ev::object::INFO, payload)
                }
            }
        };
        self.send_event(client, resource_id, event.0, &event.1);
    }

    /// Announces a global to every registry resource of every client
    pub fn broadcast_global(&mut self, global_id: GlobalId) {
        let payload = match self.registry.get(global_id) {
            Some(global) => Value::Struct(vec![
                Value::Id(global_id),
                Value::Int(global.permissions.bits() as i32),
                Value::Id(global.kind.interface() as u32),
                Value::Int(global.version as i32),
            ]),
            None => return,
        };
        for (client, resource_id) in self.registry_resources() {
            self.send_event(client, resource_id, ev::registry::GLOBAL, &payload);
        }
    }

    pub fn broadcast_global_remove(&mut self, global_id: GlobalId) {
        let payload = Value::Struct(vec![Value::Id(global_id)]);
        for (client, resource_id) in self.registry_resources() {
            self.send_event(client, resource_id, ev::registry::GLOBAL_REMOVE, &payload);
        }
    }

    /// All registry-interface resources across live clients
    pub fn registry_resources(&self) -> Vec<(ClientId, u32)> {
        let mut out = Vec::new();
        for id in self.live_clients() {
            let client = self.client(id).unwrap();
            for resource in client.resources.values() {
                if resource.ty == InterfaceType::Registry {
                    out.push((id, resource.id));
                }
            }
        }
        out
    }

    /// Queues one event frame towards a client resource
    pub fn send_event(
        &mut self,
        client: ClientId,
        resource_id: u32,
        opcode: u32,
        payload: &Value,
    ) {
        if let Some(c) = self.client_mut(client) {
            c.conn.begin(resource_id, opcode).value(payload).end();
        }
    }

    /// Emits the typed error event for `resource_id` on the client's core
    /// resource, correlated with the last received sequence number
    pub fn send_error(&mut self, client: ClientId, resource_id: u32, error: &WireError) {
        warn!("client {client}: error on resource {resource_id}: {error}");
        let Some(c) = self.client(client) else { return };
        let payload = Value::Struct(vec![
            Value::Id(resource_id),
            Value::Int(c.recv_seq as i32),
            Value::Int(-error.errno),
            Value::String(error.message.clone()),
        ]);
        self.send_event(client, CORE_RESOURCE_ID, ev::core::ERROR, &payload);
    }

    /// Flips the busy flag. Clearing it lets the server loop drain frames
    /// that queued while the client was busy.
    pub fn set_busy(&mut self, client: ClientId, busy: bool) {
        if let Some(c) = self.client_mut(client) {
            if c.busy != busy {
                debug!("client {client}: busy {busy}");
                c.busy = busy;
            }
        }
    }

    /// Notifies every resource subscribed to this param's object id
    pub fn notify_subscribed(&mut self, global_id: GlobalId, index: u32, next: u32) {
        let (object_id, param, targets) = {
            let Some(global) = self.registry.get(global_id) else {
                return;
            };
            let Some(state) = global.object_state() else {
                return;
            };
            let Some(Some(param)) = state.params.get(index as usize) else {
                return;
            };
            let Some(object_id) = param.object_id() else {
                return;
            };
            let targets: Vec<(ClientId, u32)> = global
                .bound
                .iter()
                .filter(|(client, resource_id)| {
                    self.client(*client)
                        .and_then(|c| c.resources.get(resource_id))
                        .map(|r| r.subscribed.contains(&object_id))
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            (object_id, param.clone(), targets)
        };
        for (client, resource_id) in targets {
            let payload = Value::Struct(vec![
                Value::Int(1),
                Value::Id(object_id),
                Value::Int(index as i32),
                Value::Int(next as i32),
                param.clone(),
            ]);
            self.send_event(client, resource_id, ev::object::PARAM, &payload);
        }
    }

    /// Emits the current info of an object global to every bound resource,
    /// clearing the change mask afterwards
    pub fn emit_object_info(&mut self, global_id: GlobalId) {
        let (payload, bound) = {
            let Some(global) = self.registry.get_mut(global_id) else {
                return;
            };
            let bound = global.bound.clone();
            let Some(state) = global.object_state_mut() else {
                return;
            };
            let payload = state.info.marshal();
            state.info.change_mask = 0;
            (payload, bound)
        };
        for (client, resource_id) in bound {
            self.send_event(client, resource_id, ev::object::INFO, &payload);
        }
    }
}
