//! Registry protocol (C5)
//!
//! A server keeps one ordered list of globals per listening endpoint and
//! fans out `global`/`global_remove` events to every live `wl_registry`
//! object; a client decodes those events and drives `bind` with version
//! clamping (§4.5). Everything here is plugged in by the application: this
//! crate has no fixed table of external interface names, so callers supply
//! the `&'static Interface` descriptor for whatever they're binding.

use std::ffi::CString;

use crate::dispatch::Connection;
use crate::error::{Error, Result};
use crate::interface::{opcode, Interface, REGISTRY};
use crate::object::{ObjectId, DISPLAY_ID};
use crate::wire::Argument;

/// A single server-advertised global: a stable name, the interface it
/// implements, and the highest version the server supports.
#[derive(Debug, Clone, Copy)]
pub struct Global {
    pub name: u32,
    pub interface: &'static str,
    pub version: u32,
}

/// Server-side registry state: the live global list and the set of
/// `wl_registry` object ids that have been handed out and still want
/// advertisements.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    globals: Vec<Global>,
    next_name: u32,
    registry_ids: Vec<ObjectId>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            globals: Vec::new(),
            next_name: 1,
            registry_ids: Vec::new(),
        }
    }

    /// Advertise a new global, returning its assigned name. Names are never
    /// reused for the lifetime of this registry.
    pub fn add_global(&mut self, interface: &'static str, version: u32) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        self.globals.push(Global {
            name,
            interface,
            version,
        });
        name
    }

    /// Stop advertising `name`. Already-bound instances are unaffected;
    /// only future `bind` calls for that name become invalid.
    pub fn remove_global(&mut self, name: u32) {
        self.globals.retain(|g| g.name != name);
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// Handle an inbound `wl_display.get_registry`: create the registry
    /// object at `registry_id` (a peer-allocated id) and enqueue one
    /// `global` event per currently advertised global, in advertisement
    /// order. Caller must `flush` the connection afterwards.
    pub fn handle_get_registry(&mut self, conn: &mut Connection, registry_id: ObjectId) -> Result<()> {
        conn.objects_mut()
            .insert_peer(registry_id, &REGISTRY, 1, Some(DISPLAY_ID))?;
        self.registry_ids.push(registry_id);
        for global in &self.globals {
            send_global(conn, registry_id, global)?;
        }
        Ok(())
    }

    /// Handle an inbound `wl_registry.bind`: verify the requested interface
    /// matches the advertisement, clamp the version to `min(advertised,
    /// descriptor's own max, requested)`, and insert the bound object (a
    /// peer-allocated id) at that version (I5: version must never exceed
    /// either the advertised version or the interface's own declared
    /// ceiling). `descriptor` is the interface the caller expects to bind —
    /// its `name` must match both the wire argument and the advertised
    /// global.
    pub fn handle_bind(
        &mut self,
        conn: &mut Connection,
        name: u32,
        requested_interface: &str,
        requested_version: u32,
        new_id: ObjectId,
        descriptor: &'static Interface,
    ) -> Result<u32> {
        let global = self
            .globals
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| Error::Protocol(format!("bind: no global named {name}")))?;
        if global.interface != requested_interface || global.interface != descriptor.name {
            return Err(Error::Protocol(format!(
                "bind: global {name} is {}, client requested {requested_interface}",
                global.interface
            )));
        }
        if requested_version > global.version {
            return Err(Error::Protocol(format!(
                "bind: requested version {requested_version} exceeds advertised {}",
                global.version
            )));
        }
        if requested_version > descriptor.max_version {
            return Err(Error::Protocol(format!(
                "bind: requested version {requested_version} exceeds {}'s max version {}",
                descriptor.name, descriptor.max_version
            )));
        }
        let effective_version = requested_version
            .min(global.version)
            .min(descriptor.max_version);
        conn.objects_mut()
            .insert_peer(new_id, descriptor, effective_version, None)?;
        Ok(effective_version)
    }

    /// Advertise a brand new global to every live registry, per §4.5's
    /// dynamic-advertisement rule.
    pub fn broadcast_global(
        &mut self,
        conn: &mut Connection,
        interface: &'static str,
        version: u32,
    ) -> Result<u32> {
        let name = self.add_global(interface, version);
        let global = *self.globals.last().unwrap();
        for &registry_id in &self.registry_ids {
            send_global(conn, registry_id, &global)?;
        }
        Ok(name)
    }

    /// Withdraw `name`, notifying every live registry with `global_remove`.
    /// Bound instances of that global are left running; only the
    /// advertisement is withdrawn (§4.5).
    pub fn broadcast_global_remove(&mut self, conn: &mut Connection, name: u32) -> Result<()> {
        self.remove_global(name);
        for &registry_id in &self.registry_ids {
            conn.send(
                registry_id,
                &REGISTRY,
                opcode::registry::GLOBAL_REMOVE,
                vec![Argument::Uint(name)],
                None,
            )?;
        }
        Ok(())
    }
}

fn send_global(conn: &mut Connection, registry_id: ObjectId, global: &Global) -> Result<()> {
    let iface_cstring = CString::new(global.interface)
        .map_err(|e| Error::InvalidArgument(format!("interface name has embedded NUL: {e}")))?;
    conn.send(
        registry_id,
        &REGISTRY,
        opcode::registry::GLOBAL,
        vec![
            Argument::Uint(global.name),
            Argument::String(Some(iface_cstring)),
            Argument::Uint(global.version),
        ],
        None,
    )?;
    Ok(())
}

/// One decoded `wl_registry` event, for pull-style consumption.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Global {
        name: u32,
        interface: String,
        version: u32,
    },
    GlobalRemove {
        name: u32,
    },
}

/// Optional push-style shim over [`RegistryEvent`] (§4.5.1). The core only
/// ever invokes this with the registry's own bookkeeping already updated
/// and no locks held, so callbacks may freely call back into the
/// connection (e.g. to `bind`).
pub trait GlobalListener: Send {
    fn on_global(&self, name: u32, interface: &str, version: u32);
    fn on_global_remove(&self, name: u32);
}

/// Client-side registry state: a mirror of the server's global list, kept
/// current by decoding `global`/`global_remove` events as they arrive.
#[derive(Debug)]
pub struct ClientRegistry {
    registry_id: ObjectId,
    known: Vec<(u32, String, u32)>,
}

impl ClientRegistry {
    pub fn new(registry_id: ObjectId) -> Self {
        Self {
            registry_id,
            known: Vec::new(),
        }
    }

    pub fn registry_id(&self) -> ObjectId {
        self.registry_id
    }

    pub fn known_globals(&self) -> &[(u32, String, u32)] {
        &self.known
    }

    /// Decode one `wl_registry` event and fold it into the known-globals
    /// mirror, notifying `listener` if one is supplied.
    pub fn apply_event(
        &mut self,
        opcode: u16,
        args: Vec<Argument>,
        listener: Option<&dyn GlobalListener>,
    ) -> Result<RegistryEvent> {
        match opcode {
            op if op == opcode::registry::GLOBAL => {
                let mut it = args.into_iter();
                let (Some(Argument::Uint(name)), Some(Argument::String(Some(iface))), Some(Argument::Uint(version))) =
                    (it.next(), it.next(), it.next())
                else {
                    return Err(Error::Protocol("malformed global event".into()));
                };
                let interface = iface
                    .to_str()
                    .map_err(|e| Error::InvalidArgument(format!("non-UTF8 interface name: {e}")))?
                    .to_string();
                self.known.push((name, interface.clone(), version));
                if let Some(l) = listener {
                    l.on_global(name, &interface, version);
                }
                Ok(RegistryEvent::Global {
                    name,
                    interface,
                    version,
                })
            }
            op if op == opcode::registry::GLOBAL_REMOVE => {
                let mut it = args.into_iter();
                let Some(Argument::Uint(name)) = it.next() else {
                    return Err(Error::Protocol("malformed global_remove event".into()));
                };
                self.known.retain(|(n, _, _)| *n != name);
                if let Some(l) = listener {
                    l.on_global_remove(name);
                }
                Ok(RegistryEvent::GlobalRemove { name })
            }
            _ => Err(Error::Protocol(format!("unknown registry event {opcode}"))),
        }
    }

    /// Send `bind(name, interface, version, new_id)`, allocating the new
    /// object in the connection's table at `descriptor`'s type and the
    /// requested version. The server independently enforces the version
    /// clamp and interface match, closing the connection on mismatch.
    pub fn bind(
        &self,
        conn: &mut Connection,
        name: u32,
        descriptor: &'static Interface,
        version: u32,
    ) -> Result<ObjectId> {
        let new_id = conn
            .send(
                self.registry_id,
                &REGISTRY,
                opcode::registry::BIND,
                vec![
                    Argument::Uint(name),
                    Argument::String(Some(CString::new(descriptor.name).unwrap())),
                    Argument::Uint(version),
                ],
                Some((descriptor, version)),
            )?
            .expect("bind always allocates a new_id");
        Ok(new_id)
    }
}
