//! Client-addressable resources and their interface tables

use wavepipe_core::connection::Message;
use wavepipe_core::error::WireError;
use wavepipe_core::pod::Value;

pub use wavepipe_core::protocol::{ev, me, InterfaceType, Permissions};

use crate::server::{ClientId, Context};

/// Why a method invocation did not complete normally
#[derive(Debug)]
pub enum MethodError {
    /// Demarshalling failed; protocol-fatal, the client is destroyed
    BadMessage(&'static str),
    /// Typed error replied to the client; processing continues
    Error(WireError),
}

impl From<WireError> for MethodError {
    fn from(e: WireError) -> Self {
        MethodError::Error(e)
    }
}

/// What dispatch should do after a method ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodOutcome {
    Continue,
    /// The client was marked busy; stop processing its frames until the
    /// pending action clears the flag
    Busy,
}

pub type MethodFn =
    fn(&mut Context, ClientId, &Message, &Value) -> Result<MethodOutcome, MethodError>;

/// One entry of an interface's method vtable
pub struct MethodDef {
    pub name: &'static str,
    /// Permissions the resource must hold, on top of the implied X
    pub required: Permissions,
    pub dispatch: MethodFn,
}

/// Static description of an interface: methods it accepts and how many
/// events it can emit
pub struct InterfaceDef {
    pub ty: InterfaceType,
    pub version: u32,
    pub methods: &'static [MethodDef],
    pub n_events: u32,
}

/// Most param ids one resource can subscribe to
pub const MAX_SUBSCRIBED: usize = 32;

/// A client-side handle on a global, identified by a client-chosen id
#[derive(Debug)]
pub struct Resource {
    pub id: u32,
    pub ty: InterfaceType,
    pub version: u32,
    pub permissions: Permissions,
    /// The global this resource is bound to, when any
    pub global: Option<u32>,
    /// Param object-ids this resource subscribed to
    pub subscribed: Vec<u32>,
}

impl Resource {
    pub fn new(
        id: u32,
        ty: InterfaceType,
        version: u32,
        permissions: Permissions,
        global: Option<u32>,
    ) -> Self {
        Self {
            id,
            ty,
            version,
            permissions,
            global,
            subscribed: Vec::new(),
        }
    }
}
