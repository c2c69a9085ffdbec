//! Dispatch engine (C4)
//!
//! A [`Connection`] owns one [`BufferedSocket`] and one [`ObjectTable`] and
//! drives the inbound/outbound message paths described in §4.4. Interfaces
//! outside this crate's scope (surface, xdg-shell, ...) plug in by
//! registering a [`RequestHandler`] or [`EventHandler`] per interface name;
//! the engine itself never interprets argument payloads beyond decoding
//! them against a signature.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::interface::{self, opcode, ArgKind, Interface, CALLBACK, DISPLAY};
use crate::object::{ObjectId, ObjectTable, Side};
use crate::transport::{BufferedSocket, Socket};
use crate::wire::{Argument, Header};

/// Handles requests (server role) addressed to objects of one interface.
pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        conn: &mut Connection,
        sender: ObjectId,
        opcode: u16,
        args: Vec<Argument>,
    ) -> Result<()>;
}

/// Handles events (client role) addressed to objects of one interface.
pub trait EventHandler: Send + Sync {
    fn handle(
        &self,
        conn: &mut Connection,
        sender: ObjectId,
        opcode: u16,
        args: Vec<Argument>,
    ) -> Result<()>;
}

enum HandlerMap {
    Client(HashMap<&'static str, Arc<dyn EventHandler>>),
    Server(HashMap<&'static str, Arc<dyn RequestHandler>>),
}

/// A live protocol connection: transport, object table, and registered
/// interface handlers for one peer.
pub struct Connection {
    socket: BufferedSocket,
    objects: ObjectTable,
    handlers: HandlerMap,
    /// Callback ids awaiting their `delete_id` acknowledgement from a
    /// `sync()` call in progress.
    sync_waiters: HashSet<ObjectId>,
    next_sync_serial: u32,
    closed: Option<Error>,
}

impl Connection {
    pub fn new_client(socket: Socket) -> Self {
        debug!("client connection established");
        Self {
            socket: BufferedSocket::new(socket),
            objects: ObjectTable::new(Side::Client),
            handlers: HandlerMap::Client(HashMap::new()),
            sync_waiters: HashSet::new(),
            next_sync_serial: 1,
            closed: None,
        }
    }

    pub fn new_server(socket: Socket) -> Self {
        debug!("server connection accepted");
        Self {
            socket: BufferedSocket::new(socket),
            objects: ObjectTable::new(Side::Server),
            handlers: HandlerMap::Server(HashMap::new()),
            sync_waiters: HashSet::new(),
            next_sync_serial: 1,
            closed: None,
        }
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectTable {
        &mut self.objects
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Register the handler for requests on all objects of `interface`
    /// (server role only).
    pub fn set_request_handler(&mut self, interface: &'static str, handler: Arc<dyn RequestHandler>) {
        if let HandlerMap::Server(map) = &mut self.handlers {
            map.insert(interface, handler);
        }
    }

    /// Register the handler for events on all objects of `interface`
    /// (client role only).
    pub fn set_event_handler(&mut self, interface: &'static str, handler: Arc<dyn EventHandler>) {
        if let HandlerMap::Client(map) = &mut self.handlers {
            map.insert(interface, handler);
        }
    }

    fn check_open(&self) -> Result<()> {
        match &self.closed {
            Some(e) => Err(clone_terminal_error(e)),
            None => Ok(()),
        }
    }

    /// Send one outbound message, validating it against `interface`'s
    /// signature. When `new_id_factory` is `Some`, `args` must omit the
    /// `new_id` argument entirely: the new object's id is allocated and
    /// inserted into the object table here, then spliced into `args` at the
    /// signature's `new_id` slot (§4.4 outbound path).
    pub fn send(
        &mut self,
        target_id: ObjectId,
        interface: &'static Interface,
        opcode: u16,
        mut args: Vec<Argument>,
        new_id_factory: Option<(&'static Interface, u32)>,
    ) -> Result<Option<ObjectId>> {
        self.check_open()?;
        let method = match self.objects.side() {
            Side::Client => interface.request(opcode),
            Side::Server => interface.event(opcode),
        }
        .ok_or_else(|| Error::Protocol(format!("unknown opcode {opcode} on {}", interface.name)))?;

        let new_id = if let Some((child_iface, version)) = new_id_factory {
            let slot = method
                .args
                .iter()
                .position(|k| *k == ArgKind::NewId)
                .ok_or_else(|| {
                    Error::Protocol(format!(
                        "{} opcode {opcode} has no new_id argument",
                        interface.name
                    ))
                })?;
            let id = self.objects.allocate_id();
            self.objects.insert(id, child_iface, version, Some(target_id))?;
            args.insert(slot, Argument::NewId(id));
            Some(id)
        } else {
            None
        };

        self.socket.write_message(target_id, opcode, method.args, args)?;
        Ok(new_id)
    }

    /// Flush the outbound queue.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if let Err(e) = self.socket.flush().await {
            self.fail(clone_terminal_error(&e));
            return Err(e);
        }
        Ok(())
    }

    /// Decode and dispatch exactly one inbound message (§4.4 inbound path).
    pub async fn dispatch_one(&mut self) -> Result<()> {
        self.check_open()?;
        let header = match self.socket.peek_header().await {
            Ok(h) => h,
            Err(e) => {
                self.fail(clone_terminal_error(&e));
                return Err(e);
            }
        };

        match self.dispatch_header(header).await {
            Ok(()) => self.flush().await,
            Err(e @ Error::Protocol(_)) => {
                warn!("protocol violation on object {}: {e}", header.object_id);
                let _ = self.send_display_error(header.object_id, interface::display_error::INVALID_METHOD, &e.to_string());
                let _ = self.flush().await;
                self.fail(clone_terminal_error(&e));
                Err(e)
            }
            Err(e) => {
                self.fail(clone_terminal_error(&e));
                Err(e)
            }
        }
    }

    async fn dispatch_header(&mut self, header: Header) -> Result<()> {
        let entry = match self.objects.lookup(header.object_id) {
            Ok(entry) => entry,
            Err(_) => {
                // A message can race a legitimate retirement of an id in the
                // peer's own partition; tolerate that by dropping the
                // message body, but only if the id really was retired
                // recently. Anything else (an id never allocated at all) is
                // a protocol violation.
                if self.objects.is_peer_owned(header.object_id)
                    && self.objects.was_recently_retired(header.object_id)
                {
                    let _ = self.socket.recv_message(header, &[]).await;
                    return Ok(());
                }
                return Err(Error::Protocol(format!(
                    "message for unknown object {}",
                    header.object_id
                )));
            }
        };
        let interface = entry.interface;
        let method = match self.objects.side() {
            Side::Client => interface.event(header.opcode),
            Side::Server => interface.request(header.opcode),
        }
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid opcode {} on {}",
                header.opcode, interface.name
            ))
        })?;

        let args = self.socket.recv_message(header, method.args).await?;

        if interface == &DISPLAY {
            return self.handle_display_builtin(header.object_id, header.opcode, args);
        }

        self.invoke_handler(interface.name, header.object_id, header.opcode, args)
    }

    fn invoke_handler(
        &mut self,
        interface_name: &'static str,
        sender: ObjectId,
        opcode: u16,
        args: Vec<Argument>,
    ) -> Result<()> {
        let handler = match &self.handlers {
            HandlerMap::Client(map) => map.get(interface_name).cloned().map(Handler::Event),
            HandlerMap::Server(map) => map.get(interface_name).cloned().map(Handler::Request),
        };
        match handler {
            Some(Handler::Event(h)) => h.handle(self, sender, opcode, args),
            Some(Handler::Request(h)) => h.handle(self, sender, opcode, args),
            None => Ok(()), // no handler registered: silently ignored, like an unused event
        }
    }

    /// `wl_display`'s request and event opcode spaces happen to share
    /// numbers (0/1) with unrelated meanings, so which one applies depends
    /// entirely on which side of the connection this is.
    fn handle_display_builtin(&mut self, sender: ObjectId, opcode: u16, args: Vec<Argument>) -> Result<()> {
        match self.objects.side() {
            Side::Client => self.handle_display_event(opcode, args),
            Side::Server => self.handle_display_request(sender, opcode, args),
        }
    }

    fn handle_display_event(&mut self, opcode: u16, args: Vec<Argument>) -> Result<()> {
        match opcode {
            op if op == opcode::display::DELETE_ID => {
                let Some(Argument::Uint(raw_id)) = args.into_iter().next() else {
                    return Err(Error::Protocol("malformed delete_id event".into()));
                };
                let Some(id) = ObjectId::new(raw_id) else {
                    return Err(Error::Protocol("delete_id: id 0".into()));
                };
                if self.objects.contains(id) {
                    let _ = self.objects.mark_pending_destroy(id);
                    let _ = self.objects.retire(id);
                }
                self.sync_waiters.remove(&id);
                Ok(())
            }
            op if op == opcode::display::ERROR => Ok(()),
            _ => Err(Error::Protocol(format!("unknown display event {opcode}"))),
        }
    }

    /// `sync` is handled unconditionally here since its done+delete_id
    /// reply never depends on anything outside the object table. Anything
    /// else addressed to `wl_display` (chiefly `get_registry`) is hoisted
    /// to the application's own handler for interface `"wl_display"`, which
    /// owns the registry state this crate does not.
    fn handle_display_request(&mut self, sender: ObjectId, opcode: u16, args: Vec<Argument>) -> Result<()> {
        if opcode != opcode::display::SYNC {
            return self.invoke_handler(DISPLAY.name, sender, opcode, args);
        }
        let Some(Argument::NewId(callback_id)) = args.into_iter().next() else {
            return Err(Error::Protocol("malformed sync request".into()));
        };
        self.objects
            .insert_peer(callback_id, &CALLBACK, 1, Some(sender))?;
        self.socket.write_message(
            callback_id,
            opcode::callback::DONE,
            CALLBACK.event(opcode::callback::DONE).unwrap().args,
            vec![Argument::Uint(0)],
        )?;
        self.objects.mark_pending_destroy(callback_id)?;
        self.objects.retire(callback_id)?;
        self.socket.write_message(
            crate::object::DISPLAY_ID,
            opcode::display::DELETE_ID,
            DISPLAY.event(opcode::display::DELETE_ID).unwrap().args,
            vec![Argument::Uint(callback_id.get())],
        )
    }

    fn send_display_error(&mut self, object_id: ObjectId, code: u32, message: &str) -> Result<()> {
        use std::ffi::CString;
        let msg = CString::new(message.replace('\0', "")).unwrap_or_default();
        self.socket.write_message(
            crate::object::DISPLAY_ID,
            opcode::display::ERROR,
            DISPLAY.event(opcode::display::ERROR).unwrap().args,
            vec![
                Argument::Object(Some(object_id)),
                Argument::Uint(code),
                Argument::String(Some(msg)),
            ],
        )
    }

    fn fail(&mut self, err: Error) {
        if self.closed.is_none() {
            warn!("connection closing: {err}");
            self.closed = Some(err);
            self.sync_waiters.clear();
        }
    }

    /// Client-side `wl_display.sync`: allocate a callback object, send
    /// `sync`, and drive dispatch until its `done` + `delete_id` pair has
    /// been processed.
    pub async fn sync(&mut self) -> Result<u32> {
        self.check_open()?;
        let callback_id = self.objects.allocate_id();
        self.objects.insert(callback_id, &CALLBACK, 1, Some(crate::object::DISPLAY_ID))?;

        let serial = self.next_sync_serial;
        self.next_sync_serial = self.next_sync_serial.wrapping_add(1);
        self.sync_waiters.insert(callback_id);

        self.socket.write_message(
            crate::object::DISPLAY_ID,
            opcode::display::SYNC,
            DISPLAY.request(opcode::display::SYNC).unwrap().args,
            vec![Argument::NewId(callback_id)],
        )?;
        self.flush().await?;

        while self.sync_waiters.contains(&callback_id) {
            self.dispatch_one().await?;
        }
        Ok(serial)
    }
}

fn clone_terminal_error(e: &Error) -> Error {
    // Errors are not Clone (thiserror's #[from] io::Error isn't); terminal
    // state only needs a stable textual error to hand back to every caller.
    Error::Protocol(e.to_string())
}

enum Handler {
    Event(Arc<dyn EventHandler>),
    Request(Arc<dyn RequestHandler>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Socket;
    use tokio::net::UnixStream;

    fn id(n: u32) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[tokio::test]
    async fn sync_roundtrip_receives_done_then_delete_id() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let mut client = Connection::new_client(Socket::from_stream(client_sock));
        let mut server = Connection::new_server(Socket::from_stream(server_sock));

        let sync_task = tokio::spawn(async move {
            let serial = client.sync().await.unwrap();
            (client, serial)
        });

        // Server side: act out the sync protocol manually, as a higher
        // layer's display-request handler would.
        let header = server.socket.peek_header().await.unwrap();
        let args = server
            .socket
            .recv_message(header, DISPLAY.request(opcode::display::SYNC).unwrap().args)
            .await
            .unwrap();
        let Argument::NewId(callback_id) = args[0] else {
            panic!("expected new_id")
        };
        server
            .objects
            .insert_peer(callback_id, &CALLBACK, 1, Some(crate::object::DISPLAY_ID))
            .unwrap();

        server
            .socket
            .write_message(
                callback_id,
                opcode::callback::DONE,
                CALLBACK.event(opcode::callback::DONE).unwrap().args,
                vec![Argument::Uint(42)],
            )
            .unwrap();
        server
            .socket
            .write_message(
                crate::object::DISPLAY_ID,
                opcode::display::DELETE_ID,
                DISPLAY.event(opcode::display::DELETE_ID).unwrap().args,
                vec![Argument::Uint(callback_id.get())],
            )
            .unwrap();
        server.socket.flush().await.unwrap();

        let (client, _serial) = sync_task.await.unwrap();
        // sync() drives dispatch internally until delete_id retires the
        // callback, so nothing is left to process here.
        assert!(!client.objects().contains(callback_id));
    }

    #[tokio::test]
    async fn unknown_opcode_closes_the_connection() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut client = Connection::new_client(Socket::from_stream(a));
        let mut server = Connection::new_server(Socket::from_stream(b));

        server
            .socket
            .write_message(
                crate::object::DISPLAY_ID,
                99, // not a valid wl_display event opcode
                &[],
                vec![],
            )
            .unwrap();
        server.socket.flush().await.unwrap();

        let err = client.dispatch_one().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn message_for_a_never_allocated_peer_id_is_a_protocol_violation() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut client = Connection::new_client(Socket::from_stream(a));
        let server_socket = Socket::from_stream(b);
        let mut raw = crate::transport::BufferedSocket::new(server_socket);

        // id(SERVER_ID_START) lies in the server's own partition, i.e. the
        // client's peer partition, but was never allocated: the client must
        // treat this as a violation, not a tolerated drop.
        raw.write_message(id(crate::object::SERVER_ID_START), 0, &[], vec![])
            .unwrap();
        raw.flush().await.unwrap();

        let err = client.dispatch_one().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
