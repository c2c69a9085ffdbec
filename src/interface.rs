//! Static interface descriptors (§3, §6)
//!
//! An interface descriptor is known to both peers out of band (generated
//! from a protocol XML file in a full Wayland stack; hand-written here for
//! the three well-known core interfaces). The dispatch engine only ever
//! borrows `&'static Interface` values, so a descriptor never needs to be
//! allocated or cloned at runtime.

use crate::wire::ArgKind;

/// A single request or event: its name (for diagnostics) and argument
/// signature. `is_destructor` marks requests that move their target object
/// to `pending_destroy` (see [`crate::object`]).
#[derive(Debug, Clone, Copy)]
pub struct MethodSignature {
    pub name: &'static str,
    pub is_destructor: bool,
    pub args: &'static [ArgKind],
}

/// A static protocol interface descriptor.
#[derive(Debug)]
pub struct Interface {
    pub name: &'static str,
    pub max_version: u32,
    pub requests: &'static [MethodSignature],
    pub events: &'static [MethodSignature],
}

impl Interface {
    /// Look up a request by opcode (its index in `requests`).
    pub fn request(&self, opcode: u16) -> Option<&'static MethodSignature> {
        self.requests.get(opcode as usize)
    }

    /// Look up an event by opcode (its index in `events`).
    pub fn event(&self, opcode: u16) -> Option<&'static MethodSignature> {
        self.events.get(opcode as usize)
    }
}

impl PartialEq for &'static Interface {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for &'static Interface {}

/// The `wl_display` interface (object id 1, always present).
pub static DISPLAY: Interface = Interface {
    name: "wl_display",
    max_version: 1,
    requests: &[
        MethodSignature {
            name: "sync",
            is_destructor: false,
            args: &[ArgKind::NewId],
        },
        MethodSignature {
            name: "get_registry",
            is_destructor: false,
            args: &[ArgKind::NewId],
        },
    ],
    events: &[
        MethodSignature {
            name: "error",
            is_destructor: false,
            args: &[ArgKind::Object, ArgKind::Uint32, ArgKind::String],
        },
        MethodSignature {
            name: "delete_id",
            is_destructor: false,
            args: &[ArgKind::Uint32],
        },
    ],
};

/// The `wl_registry` interface, created by `wl_display.get_registry`.
pub static REGISTRY: Interface = Interface {
    name: "wl_registry",
    max_version: 1,
    requests: &[MethodSignature {
        name: "bind",
        is_destructor: false,
        args: &[
            ArgKind::Uint32,
            ArgKind::String,
            ArgKind::Uint32,
            ArgKind::NewId,
        ],
    }],
    events: &[
        MethodSignature {
            name: "global",
            is_destructor: false,
            args: &[ArgKind::Uint32, ArgKind::String, ArgKind::Uint32],
        },
        MethodSignature {
            name: "global_remove",
            is_destructor: false,
            args: &[ArgKind::Uint32],
        },
    ],
};

/// The `wl_callback` interface used by `sync` and other one-shot requests.
pub static CALLBACK: Interface = Interface {
    name: "wl_callback",
    max_version: 1,
    requests: &[],
    events: &[MethodSignature {
        name: "done",
        is_destructor: false,
        args: &[ArgKind::Uint32],
    }],
};

/// Display object error codes (`wl_display.error`'s `code` field).
pub mod display_error {
    pub const INVALID_OBJECT: u32 = 0;
    pub const INVALID_METHOD: u32 = 1;
    pub const NO_MEMORY: u32 = 2;
    pub const IMPLEMENTATION: u32 = 3;
}

/// Well-known opcodes, named for readability at call sites.
pub mod opcode {
    pub mod display {
        pub const SYNC: u16 = 0;
        pub const GET_REGISTRY: u16 = 1;
        pub const ERROR: u16 = 0;
        pub const DELETE_ID: u16 = 1;
    }
    pub mod registry {
        pub const BIND: u16 = 0;
        pub const GLOBAL: u16 = 0;
        pub const GLOBAL_REMOVE: u16 = 1;
    }
    pub mod callback {
        pub const DONE: u16 = 0;
    }
}
