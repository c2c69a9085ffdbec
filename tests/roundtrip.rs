//! End-to-end client/server session over a real `UnixStream::pair()`,
//! covering registry enumeration, bind with version clamping, and sync.

use std::sync::{Arc, Mutex};

use tokio::net::UnixStream;

use wl_core::dispatch::{Connection, EventHandler, RequestHandler};
use wl_core::interface::{opcode, Interface, DISPLAY, REGISTRY};
use wl_core::object::DISPLAY_ID;
use wl_core::registry::{ClientRegistry, GlobalListener, RegistryEvent, ServerRegistry};
use wl_core::transport::Socket;
use wl_core::wire::Argument;
use wl_core::{Error, ObjectId};

static COMPOSITOR: Interface = Interface {
    name: "wl_compositor",
    max_version: 6,
    requests: &[],
    events: &[],
};
static SHM: Interface = Interface {
    name: "wl_shm",
    max_version: 1,
    requests: &[],
    events: &[],
};

fn descriptor_for(name: &str) -> Option<&'static Interface> {
    match name {
        "wl_compositor" => Some(&COMPOSITOR),
        "wl_shm" => Some(&SHM),
        _ => None,
    }
}

/// Server-side glue: routes `wl_display.get_registry` into the shared
/// [`ServerRegistry`]. A real compositor would own this instead of a test.
struct DisplayGlue {
    registry: Arc<Mutex<ServerRegistry>>,
}

impl RequestHandler for DisplayGlue {
    fn handle(&self, conn: &mut Connection, _sender: ObjectId, opcode: u16, args: Vec<Argument>) -> wl_core::Result<()> {
        if opcode != self::opcode::display::GET_REGISTRY {
            return Ok(());
        }
        let Some(Argument::NewId(registry_id)) = args.into_iter().next() else {
            return Err(Error::Protocol("malformed get_registry".into()));
        };
        self.registry.lock().unwrap().handle_get_registry(conn, registry_id)
    }
}

struct RegistryGlue {
    registry: Arc<Mutex<ServerRegistry>>,
}

impl RequestHandler for RegistryGlue {
    fn handle(&self, conn: &mut Connection, _sender: ObjectId, opcode: u16, args: Vec<Argument>) -> wl_core::Result<()> {
        if opcode != self::opcode::registry::BIND {
            return Ok(());
        }
        let mut it = args.into_iter();
        let (
            Some(Argument::Uint(name)),
            Some(Argument::String(Some(iface))),
            Some(Argument::Uint(version)),
            Some(Argument::NewId(new_id)),
        ) = (it.next(), it.next(), it.next(), it.next())
        else {
            return Err(Error::Protocol("malformed bind".into()));
        };
        let iface_str = iface
            .to_str()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let descriptor = descriptor_for(iface_str)
            .ok_or_else(|| Error::Protocol(format!("unknown interface {iface_str}")))?;
        self.registry
            .lock()
            .unwrap()
            .handle_bind(conn, name, iface_str, version, new_id, descriptor)?;
        Ok(())
    }
}

struct CollectingListener {
    events: Mutex<Vec<(u32, String, u32)>>,
}

impl GlobalListener for CollectingListener {
    fn on_global(&self, name: u32, interface: &str, version: u32) {
        self.events
            .lock()
            .unwrap()
            .push((name, interface.to_string(), version));
    }
    fn on_global_remove(&self, _name: u32) {}
}

/// Client-side glue: decodes `wl_registry` events into a [`ClientRegistry`]
/// and records each one, so the test can assert on enumeration order
/// without reaching into the connection's internals.
struct ClientRegistryHandler {
    listener: CollectingListener,
    seen: Mutex<Vec<RegistryEvent>>,
    registry: Mutex<ClientRegistry>,
}

impl EventHandler for ClientRegistryHandler {
    fn handle(&self, _conn: &mut Connection, _sender: ObjectId, opcode: u16, args: Vec<Argument>) -> wl_core::Result<()> {
        let event = self
            .registry
            .lock()
            .unwrap()
            .apply_event(opcode, args, Some(&self.listener))?;
        self.seen.lock().unwrap().push(event);
        Ok(())
    }
}

/// Initializes `env_logger` once per test binary, so `RUST_LOG=debug cargo
/// test -- --nocapture` shows the crate's own log output alongside the
/// test's.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn enumerate_bind_and_sync_over_a_real_connection() -> anyhow::Result<()> {
    init_logging();
    let (client_sock, server_sock) = UnixStream::pair()?;
    let mut client = Connection::new_client(Socket::from_stream(client_sock));
    let mut server = Connection::new_server(Socket::from_stream(server_sock));

    let server_registry = Arc::new(Mutex::new(ServerRegistry::new()));
    server_registry.lock().unwrap().add_global("wl_compositor", 6);
    server_registry.lock().unwrap().add_global("wl_shm", 1);
    server.set_request_handler(
        DISPLAY.name,
        Arc::new(DisplayGlue {
            registry: server_registry.clone(),
        }),
    );
    server.set_request_handler(
        REGISTRY.name,
        Arc::new(RegistryGlue {
            registry: server_registry.clone(),
        }),
    );

    // S1: get_registry, enumerate the two advertised globals in order.
    let registry_id = client.objects_mut().allocate_id();
    let client_handler = Arc::new(ClientRegistryHandler {
        listener: CollectingListener {
            events: Mutex::new(Vec::new()),
        },
        seen: Mutex::new(Vec::new()),
        registry: Mutex::new(ClientRegistry::new(registry_id)),
    });
    client.set_event_handler(REGISTRY.name, client_handler.clone());

    client.send(
        DISPLAY_ID,
        &DISPLAY,
        opcode::display::GET_REGISTRY,
        vec![Argument::NewId(registry_id)],
        None,
    )?;
    client.flush().await?;

    server.dispatch_one().await?; // get_registry: inserts object, replies with 2 globals
    client.dispatch_one().await?;
    client.dispatch_one().await?;

    {
        let seen = client_handler.seen.lock().unwrap();
        match &seen[0] {
            RegistryEvent::Global { name: 1, interface, version: 6 } => {
                assert_eq!(interface, "wl_compositor")
            }
            other => panic!("unexpected {other:?}"),
        }
        match &seen[1] {
            RegistryEvent::Global { name: 2, interface, version: 1 } => assert_eq!(interface, "wl_shm"),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(client_handler.listener.events.lock().unwrap().len(), 2);

    // S2: bind wl_compositor below its advertised max; version clamps to 4.
    let compositor_id = client_handler
        .registry
        .lock()
        .unwrap()
        .bind(&mut client, 1, &COMPOSITOR, 4)?;
    client.flush().await?;
    server.dispatch_one().await?;
    assert_eq!(server.objects().lookup(compositor_id)?.version, 4);

    // S3: sync still roundtrips after other traffic has flowed.
    let server_task = tokio::spawn(async move {
        server.dispatch_one().await.unwrap(); // the sync request
        server
    });
    client.sync().await?;
    server_task.await.unwrap();
    Ok(())
}
