//! Frame dispatch: interface vtables and method handlers
//!
//! Interface tables are static; a resource's table is resolved once from
//! its type. Method handlers run on the main loop with the whole context
//! threaded through.

use wavepipe_core::connection::Message;
use wavepipe_core::error::WireError;
use wavepipe_core::pod::Value;

use crate::objects::{ObjectInfo, ObjectKind, ObjectState, UPDATE_INFO, UPDATE_PARAMS};
use crate::registry::GlobalKind;
use crate::resource::{
    ev, InterfaceDef, InterfaceType, MethodDef, MethodError, MethodOutcome, Permissions,
    Resource, MAX_SUBSCRIBED,
};
use crate::server::context::Context;
use crate::server::ClientId;

static CORE_METHODS: &[MethodDef] = &[
    MethodDef {
        name: "hello",
        required: Permissions::empty(),
        dispatch: core_hello,
    },
    MethodDef {
        name: "sync",
        required: Permissions::empty(),
        dispatch: core_sync,
    },
    MethodDef {
        name: "get_registry",
        required: Permissions::empty(),
        dispatch: core_get_registry,
    },
    MethodDef {
        name: "create_object",
        required: Permissions::empty(),
        dispatch: core_create_object,
    },
];

static REGISTRY_METHODS: &[MethodDef] = &[MethodDef {
    name: "bind",
    required: Permissions::empty(),
    dispatch: registry_bind,
}];

static OBJECT_METHODS: &[MethodDef] = &[
    MethodDef {
        name: "subscribe_params",
        required: Permissions::R,
        dispatch: object_subscribe_params,
    },
    MethodDef {
        name: "enum_params",
        required: Permissions::R,
        dispatch: object_enum_params,
    },
    MethodDef {
        name: "set_param",
        required: Permissions::W,
        dispatch: object_set_param,
    },
];

static CLIENT_OBJECT_METHODS: &[MethodDef] = &[MethodDef {
    name: "update",
    required: Permissions::W,
    dispatch: client_object_update,
}];

static CORE_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::Core,
    version: 1,
    methods: CORE_METHODS,
    n_events: 3,
};
static REGISTRY_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::Registry,
    version: 1,
    methods: REGISTRY_METHODS,
    n_events: 2,
};
static CLIENT_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::Client,
    version: 1,
    methods: &[],
    n_events: 1,
};
static FACTORY_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::Factory,
    version: 1,
    methods: &[],
    n_events: 1,
};
static ENDPOINT_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::Endpoint,
    version: 1,
    methods: OBJECT_METHODS,
    n_events: 2,
};
static SESSION_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::Session,
    version: 1,
    methods: OBJECT_METHODS,
    n_events: 2,
};
static CLIENT_ENDPOINT_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::ClientEndpoint,
    version: 1,
    methods: CLIENT_OBJECT_METHODS,
    n_events: 2,
};
static CLIENT_SESSION_DEF: InterfaceDef = InterfaceDef {
    ty: InterfaceType::ClientSession,
    version: 1,
    methods: CLIENT_OBJECT_METHODS,
    n_events: 2,
};

pub fn interface_def(ty: InterfaceType) -> &'static InterfaceDef {
    match ty {
        InterfaceType::Core => &CORE_DEF,
        InterfaceType::Registry => &REGISTRY_DEF,
        InterfaceType::Client => &CLIENT_DEF,
        InterfaceType::Factory => &FACTORY_DEF,
        InterfaceType::Endpoint => &ENDPOINT_DEF,
        InterfaceType::Session => &SESSION_DEF,
        InterfaceType::ClientEndpoint => &CLIENT_ENDPOINT_DEF,
        InterfaceType::ClientSession => &CLIENT_SESSION_DEF,
    }
}

/// Drains and dispatches buffered frames for one client, stopping when the
/// client turns busy, runs dry, or dies
pub fn process_messages(ctx: &mut Context, client: ClientId) {
    loop {
        if ctx.dead.contains(&client) {
            return;
        }
        match ctx.client(client) {
            Some(c) if !c.busy => {}
            _ => return,
        }

        let msg = {
            let c = ctx.client_mut(client).unwrap();
            match c.conn.get_next() {
                Ok(Some(msg)) => {
                    c.recv_seq = msg.seq;
                    msg
                }
                Ok(None) => return,
                Err(e) => {
                    info!("client {client}: connection lost: {e}");
                    ctx.mark_dead(client);
                    return;
                }
            }
        };

        trace!(
            "client {client}: got message {} on {} seq {}",
            msg.opcode,
            msg.id,
            msg.seq
        );

        if dispatch_one(ctx, client, &msg).is_err() {
            ctx.mark_dead(client);
            return;
        }
    }
}

/// Dispatches a single frame. `Err` means protocol-fatal.
fn dispatch_one(ctx: &mut Context, client: ClientId, msg: &Message) -> Result<(), ()> {
    let resource = ctx
        .client(client)
        .and_then(|c| c.resources.get(&msg.id))
        .map(|r| (r.ty, r.permissions));

    let Some((ty, permissions)) = resource else {
        // stale handles resolve to an error reply, not a teardown
        ctx.send_error(
            client,
            msg.id,
            &WireError::invalid(format!("unknown resource {}", msg.id)),
        );
        return Ok(());
    };

    let def = interface_def(ty);
    let Some(method) = def.methods.get(msg.opcode as usize) else {
        ctx.send_error(
            client,
            msg.id,
            &WireError::invalid(format!(
                "invalid method {} on resource {}",
                msg.opcode, msg.id
            )),
        );
        return Err(());
    };

    let required = method.required | Permissions::X;
    if !permissions.contains(required) {
        ctx.send_error(
            client,
            msg.id,
            &WireError::denied(format!(
                "no permission to call method {} on {}",
                msg.opcode, msg.id
            )),
        );
        return Ok(());
    }

    let value = match msg.value() {
        Ok(v) => v,
        Err(e) => {
            ctx.send_error(
                client,
                msg.id,
                &WireError::invalid(format!("invalid message: {e}")),
            );
            return Err(());
        }
    };

    match (method.dispatch)(ctx, client, msg, &value) {
        Ok(_) => Ok(()),
        Err(MethodError::BadMessage(what)) => {
            ctx.send_error(
                client,
                msg.id,
                &WireError::invalid(format!("invalid {} message: {what}", method.name)),
            );
            Err(())
        }
        Err(MethodError::Error(e)) => {
            ctx.send_error(client, msg.id, &e);
            Ok(())
        }
    }
}

fn args<'a>(value: &'a Value, n: usize, what: &'static str) -> Result<&'a [Value], MethodError> {
    let fields = value.as_struct().ok_or(MethodError::BadMessage(what))?;
    if fields.len() != n {
        return Err(MethodError::BadMessage(what));
    }
    Ok(fields)
}

// core

fn core_hello(
    ctx: &mut Context,
    client: ClientId,
    msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 1, "hello")?;
    let _version = fields[0].as_int().ok_or(MethodError::BadMessage("hello"))?;
    let core = ctx.core_global;
    ctx.emit_initial_info(client, core, msg.id);
    Ok(MethodOutcome::Continue)
}

fn core_sync(
    ctx: &mut Context,
    client: ClientId,
    msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 1, "sync")?;
    let seq = fields[0].as_int().ok_or(MethodError::BadMessage("sync"))?;
    let payload = Value::Struct(vec![Value::Int(seq)]);
    ctx.send_event(client, msg.id, ev::core::DONE, &payload);
    Ok(MethodOutcome::Continue)
}

fn core_get_registry(
    ctx: &mut Context,
    client: ClientId,
    _msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 2, "get_registry")?;
    let version = fields[0]
        .as_int()
        .ok_or(MethodError::BadMessage("get_registry"))? as u32;
    let new_id = fields[1]
        .as_int()
        .ok_or(MethodError::BadMessage("get_registry"))? as u32;

    {
        let c = ctx
            .client_mut(client)
            .ok_or(MethodError::BadMessage("client gone"))?;
        if c.resources.contains_key(&new_id) {
            return Err(WireError::invalid(format!("resource id {new_id} in use")).into());
        }
        c.resources.insert(
            new_id,
            Resource::new(
                new_id,
                InterfaceType::Registry,
                version.min(1),
                Permissions::RWX,
                None,
            ),
        );
    }

    // replay all current globals to the fresh registry resource
    let announce: Vec<Value> = ctx
        .registry
        .iter_sorted()
        .map(|g| {
            Value::Struct(vec![
                Value::Id(g.id),
                Value::Int(g.permissions.bits() as i32),
                Value::Id(g.kind.interface() as u32),
                Value::Int(g.version as i32),
            ])
        })
        .collect();
    for payload in announce {
        ctx.send_event(client, new_id, ev::registry::GLOBAL, &payload);
    }
    Ok(MethodOutcome::Continue)
}

fn core_create_object(
    ctx: &mut Context,
    client: ClientId,
    _msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 4, "create_object")?;
    let factory_name = fields[0]
        .as_str()
        .ok_or(MethodError::BadMessage("create_object"))?
        .to_string();
    let requested_type = fields[1]
        .as_id()
        .and_then(InterfaceType::from_raw)
        .ok_or(MethodError::BadMessage("create_object"))?;
    let _version = fields[2]
        .as_int()
        .ok_or(MethodError::BadMessage("create_object"))?;
    let new_id = fields[3]
        .as_int()
        .ok_or(MethodError::BadMessage("create_object"))? as u32;

    let object_type = match ctx.registry.find_factory(&factory_name) {
        Some(global) => match &global.kind {
            GlobalKind::Factory(f) => f.object_type,
            _ => unreachable!(),
        },
        None => {
            return Err(WireError::invalid(format!("unknown factory '{factory_name}'")).into())
        }
    };
    if object_type != requested_type {
        return Err(WireError::invalid(format!(
            "factory '{factory_name}' makes {object_type:?}"
        ))
        .into());
    }

    // the factory completes from the main loop; queue the completion and
    // park the client until it ran
    ctx.set_busy(client, true);
    ctx.deferred.push_back(Box::new(move |ctx| {
        complete_create_object(ctx, client, object_type, new_id);
    }));
    Ok(MethodOutcome::Busy)
}

fn complete_create_object(
    ctx: &mut Context,
    client: ClientId,
    object_type: InterfaceType,
    new_id: u32,
) {
    // the client may have disconnected while parked; that cancels the action
    let Some(c) = ctx.client_mut(client) else {
        return;
    };
    if c.resources.contains_key(&new_id) {
        ctx.send_error(
            client,
            new_id,
            &WireError::invalid(format!("resource id {new_id} in use")),
        );
        ctx.set_busy(client, false);
        return;
    }

    let kind = match object_type {
        InterfaceType::ClientEndpoint => ObjectKind::Endpoint,
        InterfaceType::ClientSession => ObjectKind::Session,
        _ => unreachable!("factories only make owner-side objects"),
    };

    let state = ObjectState::new(kind, Some((client, new_id)));
    let global_kind = match kind {
        ObjectKind::Endpoint => GlobalKind::Endpoint(state),
        ObjectKind::Session => GlobalKind::Session(state),
    };
    let global_id = ctx.registry.add(global_kind, 1, Permissions::RWX);
    if let Some(s) = ctx
        .registry
        .get_mut(global_id)
        .and_then(|g| g.object_state_mut())
    {
        s.info.id = global_id;
    }

    ctx.client_mut(client).unwrap().resources.insert(
        new_id,
        Resource::new(new_id, object_type, 1, Permissions::RWX, Some(global_id)),
    );

    let payload = Value::Struct(vec![Value::Id(global_id)]);
    ctx.send_event(client, new_id, ev::client_object::SET_ID, &payload);
    ctx.broadcast_global(global_id);
    ctx.set_busy(client, false);
}

// registry

fn registry_bind(
    ctx: &mut Context,
    client: ClientId,
    _msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 4, "bind")?;
    let global_id = fields[0].as_id().ok_or(MethodError::BadMessage("bind"))?;
    let ty = fields[1]
        .as_id()
        .and_then(InterfaceType::from_raw)
        .ok_or(MethodError::BadMessage("bind"))?;
    let version = fields[2].as_int().ok_or(MethodError::BadMessage("bind"))? as u32;
    let new_id = fields[3].as_int().ok_or(MethodError::BadMessage("bind"))? as u32;

    match ctx.registry.get(global_id) {
        Some(global) if global.kind.interface() == ty => {}
        Some(global) => {
            return Err(WireError::invalid(format!(
                "global {global_id} is {:?}",
                global.kind.interface()
            ))
            .into())
        }
        None => return Err(WireError::invalid(format!("no global {global_id}")).into()),
    }
    ctx.bind_global(client, global_id, version, new_id)?;
    Ok(MethodOutcome::Continue)
}

// endpoint and session

fn resource_global(
    ctx: &Context,
    client: ClientId,
    resource_id: u32,
) -> Result<u32, MethodError> {
    ctx.client(client)
        .and_then(|c| c.resources.get(&resource_id))
        .and_then(|r| r.global)
        .ok_or(MethodError::BadMessage("resource has no global"))
}

fn object_subscribe_params(
    ctx: &mut Context,
    client: ClientId,
    msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 1, "subscribe_params")?;
    let mut ids: Vec<u32> = fields[0]
        .as_array()
        .ok_or(MethodError::BadMessage("subscribe_params"))?
        .iter()
        .map(|v| v.as_id().ok_or(MethodError::BadMessage("subscribe_params")))
        .collect::<Result<_, _>>()?;
    ids.truncate(MAX_SUBSCRIBED);

    let global_id = resource_global(ctx, client, msg.id)?;
    {
        let c = ctx.client_mut(client).unwrap();
        let resource = c.resources.get_mut(&msg.id).unwrap();
        resource.subscribed = ids.clone();
    }

    // replay the current params for every subscribed id
    for id in ids {
        emit_params(ctx, client, msg.id, global_id, 1, id, 0, u32::MAX, None)?;
    }
    Ok(MethodOutcome::Continue)
}

fn object_enum_params(
    ctx: &mut Context,
    client: ClientId,
    msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 5, "enum_params")?;
    let seq = fields[0]
        .as_int()
        .ok_or(MethodError::BadMessage("enum_params"))?;
    let id = fields[1]
        .as_id()
        .ok_or(MethodError::BadMessage("enum_params"))?;
    let start = fields[2]
        .as_int()
        .ok_or(MethodError::BadMessage("enum_params"))? as u32;
    let num = fields[3]
        .as_int()
        .ok_or(MethodError::BadMessage("enum_params"))? as u32;
    let filter = match &fields[4] {
        Value::None => None,
        other => Some(other.clone()),
    };

    let global_id = resource_global(ctx, client, msg.id)?;
    emit_params(
        ctx,
        client,
        msg.id,
        global_id,
        seq,
        id,
        start,
        num,
        filter.as_ref(),
    )?;
    Ok(MethodOutcome::Continue)
}

#[allow(clippy::too_many_arguments)]
fn emit_params(
    ctx: &mut Context,
    client: ClientId,
    resource_id: u32,
    global_id: u32,
    seq: i32,
    id: u32,
    start: u32,
    num: u32,
    filter: Option<&Value>,
) -> Result<(), MethodError> {
    let hits: Vec<(u32, u32, Value)> = {
        let state = ctx
            .registry
            .get(global_id)
            .and_then(|g| g.object_state())
            .ok_or(MethodError::BadMessage("not a param object"))?;
        state
            .enum_params(id, start, num, filter)
            .into_iter()
            .map(|(index, next, param)| (index, next, param.clone()))
            .collect()
    };
    for (index, next, param) in hits {
        let payload = Value::Struct(vec![
            Value::Int(seq),
            Value::Id(id),
            Value::Int(index as i32),
            Value::Int(next as i32),
            param,
        ]);
        ctx.send_event(client, resource_id, ev::object::PARAM, &payload);
    }
    Ok(())
}

fn object_set_param(
    ctx: &mut Context,
    client: ClientId,
    msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 3, "set_param")?;
    let id = fields[0].as_id().ok_or(MethodError::BadMessage("set_param"))?;
    let flags = fields[1]
        .as_int()
        .ok_or(MethodError::BadMessage("set_param"))?;
    let param = fields[2].clone();
    if param.object_id().is_none() {
        return Err(MethodError::BadMessage("set_param: param is not an object"));
    }

    let global_id = resource_global(ctx, client, msg.id)?;
    let owner = ctx
        .registry
        .get(global_id)
        .and_then(|g| g.object_state())
        .ok_or(MethodError::BadMessage("not a param object"))?
        .owner;

    let Some((owner_client, owner_resource)) = owner else {
        return Err(WireError::new(
            libc::ENOTSUP,
            "object is not managed by a client",
        )
        .into());
    };

    // forward to the managing client; it answers with an update
    let payload = Value::Struct(vec![Value::Id(id), Value::Int(flags), param]);
    ctx.send_event(
        owner_client,
        owner_resource,
        ev::client_object::SET_PARAM,
        &payload,
    );
    Ok(MethodOutcome::Continue)
}

// client_endpoint and client_session

fn client_object_update(
    ctx: &mut Context,
    client: ClientId,
    msg: &Message,
    value: &Value,
) -> Result<MethodOutcome, MethodError> {
    let fields = args(value, 3, "update")?;
    let change_mask = fields[0]
        .as_int()
        .ok_or(MethodError::BadMessage("update"))? as u32;

    let global_id = resource_global(ctx, client, msg.id)?;

    if change_mask & UPDATE_PARAMS != 0 {
        let params: Vec<Value> = fields[1]
            .as_array()
            .ok_or(MethodError::BadMessage("update params"))?
            .to_vec();
        let replaced = {
            let state = ctx
                .registry
                .get_mut(global_id)
                .and_then(|g| g.object_state_mut())
                .ok_or(MethodError::BadMessage("not a param object"))?;
            state.replace_params(params)
        };
        match replaced {
            Ok(indices) => {
                for index in indices {
                    ctx.notify_subscribed(global_id, index, index + 1);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    if change_mask & UPDATE_INFO != 0 {
        let update = ObjectInfo::parse(&fields[2])?;
        {
            let state = ctx
                .registry
                .get_mut(global_id)
                .and_then(|g| g.object_state_mut())
                .ok_or(MethodError::BadMessage("not a param object"))?;
            state.apply_info(&update);
        }
        ctx.emit_object_info(global_id);
    }

    Ok(MethodOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use wavepipe_core::protocol::me;

    use super::*;

    /// The vtables are indexed by wire opcode; their order must match the
    /// protocol constants
    #[test]
    fn test_tables_match_wire_opcodes() {
        assert_eq!(CORE_METHODS[me::core::HELLO as usize].name, "hello");
        assert_eq!(CORE_METHODS[me::core::SYNC as usize].name, "sync");
        assert_eq!(
            CORE_METHODS[me::core::GET_REGISTRY as usize].name,
            "get_registry"
        );
        assert_eq!(
            CORE_METHODS[me::core::CREATE_OBJECT as usize].name,
            "create_object"
        );
        assert_eq!(REGISTRY_METHODS[me::registry::BIND as usize].name, "bind");
        assert_eq!(
            OBJECT_METHODS[me::object::SUBSCRIBE_PARAMS as usize].name,
            "subscribe_params"
        );
        assert_eq!(
            OBJECT_METHODS[me::object::ENUM_PARAMS as usize].name,
            "enum_params"
        );
        assert_eq!(
            OBJECT_METHODS[me::object::SET_PARAM as usize].name,
            "set_param"
        );
        assert_eq!(
            CLIENT_OBJECT_METHODS[me::client_object::UPDATE as usize].name,
            "update"
        );
    }

    #[test]
    fn test_required_permissions() {
        assert_eq!(
            OBJECT_METHODS[me::object::SET_PARAM as usize].required,
            Permissions::W
        );
        assert_eq!(
            OBJECT_METHODS[me::object::ENUM_PARAMS as usize].required,
            Permissions::R
        );
        assert_eq!(
            CLIENT_OBJECT_METHODS[me::client_object::UPDATE as usize].required,
            Permissions::W
        );
    }

    #[test]
    fn test_every_interface_resolves() {
        for raw in 1..=8 {
            let ty = InterfaceType::from_raw(raw).unwrap();
            assert_eq!(interface_def(ty).ty, ty);
        }
    }
}
