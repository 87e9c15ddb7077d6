//! Wire-level protocol identifiers shared by the server and client sides:
//! interface types, permission bits, and the method and event opcodes of
//! every interface.

use bitflags::bitflags;

/// Name of the listening socket when nothing else is configured
pub const DEFAULT_CORE_NAME: &str = "pipewire-0";
/// Environment override for the socket name
pub const CORE_NAME_ENV: &str = "PIPEWIRE_CORE";

bitflags! {
    /// Permission bits attached to a resource at bind time
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const R = 1;
        const W = 2;
        const X = 4;
    }
}

impl Permissions {
    pub const RWX: Permissions = Permissions::all();
    pub const RX: Permissions = Permissions::R.union(Permissions::X);
}

/// Every interface a resource can speak, doubling as the wire id used in
/// bind and create requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InterfaceType {
    Core = 1,
    Registry = 2,
    Client = 3,
    Factory = 4,
    Endpoint = 5,
    Session = 6,
    ClientEndpoint = 7,
    ClientSession = 8,
}

impl InterfaceType {
    pub fn from_raw(raw: u32) -> Option<InterfaceType> {
        use InterfaceType::*;
        Some(match raw {
            1 => Core,
            2 => Registry,
            3 => Client,
            4 => Factory,
            5 => Endpoint,
            6 => Session,
            7 => ClientEndpoint,
            8 => ClientSession,
            _ => return None,
        })
    }
}

/// Method opcodes, per interface
pub mod me {
    pub mod core {
        pub const HELLO: u32 = 0;
        pub const SYNC: u32 = 1;
        pub const GET_REGISTRY: u32 = 2;
        pub const CREATE_OBJECT: u32 = 3;
    }
    pub mod registry {
        pub const BIND: u32 = 0;
    }
    pub mod object {
        // endpoint and session share their method layout
        pub const SUBSCRIBE_PARAMS: u32 = 0;
        pub const ENUM_PARAMS: u32 = 1;
        pub const SET_PARAM: u32 = 2;
    }
    pub mod client_object {
        // client_endpoint and client_session likewise
        pub const UPDATE: u32 = 0;
    }
}

/// Event opcodes, per interface
pub mod ev {
    pub mod core {
        pub const INFO: u32 = 0;
        pub const DONE: u32 = 1;
        pub const ERROR: u32 = 2;
    }
    pub mod registry {
        pub const GLOBAL: u32 = 0;
        pub const GLOBAL_REMOVE: u32 = 1;
    }
    pub mod client {
        pub const INFO: u32 = 0;
    }
    pub mod factory {
        pub const INFO: u32 = 0;
    }
    pub mod object {
        pub const INFO: u32 = 0;
        pub const PARAM: u32 = 1;
    }
    pub mod client_object {
        pub const SET_ID: u32 = 0;
        pub const SET_PARAM: u32 = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_roundtrip() {
        for raw in 1..=8 {
            let ty = InterfaceType::from_raw(raw).unwrap();
            assert_eq!(ty as u32, raw);
        }
        assert!(InterfaceType::from_raw(0).is_none());
        assert!(InterfaceType::from_raw(99).is_none());
    }

    #[test]
    fn test_permission_shorthands() {
        assert!(Permissions::RWX.contains(Permissions::W));
        assert!(!Permissions::RX.contains(Permissions::W));
        assert!(Permissions::RX.contains(Permissions::X));
    }
}
