//! Connection transport (C2)
//!
//! Owns a Unix domain stream socket, frames reads/writes around the wire
//! codec in [`crate::wire`], and carries ancillary file descriptors
//! alongside the byte stream via `SCM_RIGHTS`. Reads and writes are
//! non-blocking: callers drive them from a Tokio task and the socket is
//! polled for readiness before each syscall attempt.

use std::collections::VecDeque;
use std::env;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rustix::net::{
    recvmsg, send, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::wire::{self, Argument, Header, Signature};

/// Max fds carried in a single socket message.
pub const MAX_FDS_PER_SEND: usize = 28;
/// Max bytes carried in a single socket message.
pub const MAX_BYTES_PER_SEND: usize = 4096;
/// Soft cap on the outbound byte queue before `send` starts failing with
/// [`Error::WouldBlock`] (§4.2 backpressure).
pub const OUTBOUND_HIGH_WATER_MARK: usize = 1 << 20;

/// Default display name when `WAYLAND_DISPLAY` is unset.
pub const DEFAULT_DISPLAY: &str = "wayland-0";

/// Resolve the socket path a client should connect to, from
/// `XDG_RUNTIME_DIR` and `WAYLAND_DISPLAY` (§6). Returns `None` if
/// `XDG_RUNTIME_DIR` is not set.
pub fn client_socket_path() -> Option<PathBuf> {
    let runtime_dir = env::var_os("XDG_RUNTIME_DIR")?;
    let display = env::var("WAYLAND_DISPLAY").unwrap_or_else(|_| DEFAULT_DISPLAY.to_string());
    Some(PathBuf::from(runtime_dir).join(display))
}

/// A raw, unbuffered Unix socket carrying Wayland-style messages.
#[derive(Debug)]
pub struct Socket {
    stream: UnixStream,
}

impl Socket {
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Connect to the socket a client should use, per §6 discovery rules.
    pub async fn connect_default() -> Result<Self> {
        let path = client_socket_path()
            .ok_or_else(|| Error::Protocol("XDG_RUNTIME_DIR is not set".into()))?;
        Self::connect(&path).await
    }

    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(Error::Io)?;
        debug!("connected to {}", path.display());
        Ok(Self { stream })
    }

    /// Send `bytes` and `fds` as a single ancillary-bearing socket message,
    /// retrying while the socket reports not-yet-writable.
    pub async fn send_msg(&self, bytes: &[u8], fds: &[OwnedFd]) -> Result<usize> {
        loop {
            self.stream.writable().await.map_err(Error::Io)?;
            match self
                .stream
                .try_io(Interest::WRITABLE, || send_once(&self.stream, bytes, fds))
            {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Receive into `buffer`, appending any fds delivered alongside to
    /// `fds`. Returns the number of bytes received; 0 means the peer closed
    /// the connection.
    pub async fn recv_msg(&self, buffer: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> Result<usize> {
        loop {
            self.stream.readable().await.map_err(Error::Io)?;
            match self
                .stream
                .try_io(Interest::READABLE, || recv_once(&self.stream, buffer, fds))
            {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

fn send_once(sock: &UnixStream, bytes: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
    #[cfg(not(target_os = "macos"))]
    let flags = SendFlags::DONTWAIT | SendFlags::NOSIGNAL;
    #[cfg(target_os = "macos")]
    let flags = SendFlags::DONTWAIT;

    if fds.is_empty() {
        send(sock, bytes, flags)
    } else {
        let iov = [IoSlice::new(bytes)];
        let mut space = vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(fds.len()))];
        let mut cmsg_buffer = SendAncillaryBuffer::new(&mut space);
        let borrowed: Vec<BorrowedFd> = fds.iter().map(AsFd::as_fd).collect();
        cmsg_buffer.push(SendAncillaryMessage::ScmRights(&borrowed));
        sendmsg(sock, &iov, &mut cmsg_buffer, flags)
    }
}

fn recv_once(sock: &UnixStream, buffer: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
    #[cfg(not(target_os = "macos"))]
    let flags = RecvFlags::DONTWAIT | RecvFlags::CMSG_CLOEXEC;
    #[cfg(target_os = "macos")]
    let flags = RecvFlags::DONTWAIT;

    let mut cmsg_space =
        vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_PER_SEND))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);
    let mut iov = [IoSliceMut::new(buffer)];
    let msg = recvmsg(sock, &mut iov, &mut cmsg_buffer, flags)?;

    let received = cmsg_buffer.drain().filter_map(|cmsg| match cmsg {
        RecvAncillaryMessage::ScmRights(fds) => Some(fds),
        _ => None,
    });
    fds.extend(received.flatten());
    Ok(msg.bytes)
}

/// Bind a server socket at `path`, creating it with owner-only permissions.
/// If a stale socket file exists with nothing listening behind it, it is
/// removed and binding is retried once.
pub fn bind(path: &Path) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => {
            set_owner_only(path)?;
            debug!("listening on {}", path.display());
            Ok(listener)
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                warn!("a server is already listening at {}", path.display());
                return Err(Error::Protocol(format!(
                    "a server is already listening at {}",
                    path.display()
                )));
            }
            warn!("removing stale socket at {}", path.display());
            std::fs::remove_file(path).map_err(Error::Io)?;
            let listener = UnixListener::bind(path).map_err(Error::Io)?;
            set_owner_only(path)?;
            debug!("listening on {}", path.display());
            Ok(listener)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms).map_err(Error::Io)
}

/// A [`Socket`] wrapped with in/out byte and fd queues, framing the raw
/// stream into whole Wayland-style messages.
pub struct BufferedSocket {
    socket: Socket,
    in_bytes: VecDeque<u8>,
    in_fds: VecDeque<OwnedFd>,
    out_bytes: Vec<u8>,
    out_fds: Vec<OwnedFd>,
}

impl BufferedSocket {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            in_bytes: VecDeque::new(),
            in_fds: VecDeque::new(),
            out_bytes: Vec::new(),
            out_fds: Vec::new(),
        }
    }

    /// Encode a message into the outbound queue. Fails with
    /// [`Error::WouldBlock`] if the queue is already past its high-water
    /// mark; the caller must `flush` (or otherwise drain) before retrying.
    pub fn write_message(
        &mut self,
        target_id: ObjectId,
        opcode: u16,
        signature: Signature,
        args: Vec<Argument>,
    ) -> Result<()> {
        if self.out_bytes.len() >= OUTBOUND_HIGH_WATER_MARK {
            return Err(Error::WouldBlock);
        }
        wire::encode(
            target_id,
            opcode,
            signature,
            args,
            &mut self.out_bytes,
            &mut self.out_fds,
        )?;
        Ok(())
    }

    /// Push as much of the outbound queue to the socket as it will take
    /// without blocking, chunked so no single send exceeds the fd or byte
    /// limits of one ancillary message (§4.2: fd queue drained in strict
    /// send order).
    pub async fn flush(&mut self) -> Result<()> {
        while !self.out_bytes.is_empty() {
            let mut byte_chunk = self.out_bytes.len().min(MAX_BYTES_PER_SEND);
            let mut fd_chunk = self.out_fds.len().min(MAX_FDS_PER_SEND);
            if self.out_fds.len() > MAX_FDS_PER_SEND {
                // Send a minimal byte chunk so the fd-bearing datagram goes
                // out before we run out of ordinary bytes to carry it on.
                byte_chunk = byte_chunk.min(1);
                fd_chunk = MAX_FDS_PER_SEND;
            }
            let sent = self
                .socket
                .send_msg(&self.out_bytes[..byte_chunk], &self.out_fds[..fd_chunk])
                .await?;
            self.out_bytes.drain(..sent);
            self.out_fds.drain(..fd_chunk);
        }
        Ok(())
    }

    /// Pull one socket message's worth of bytes and fds into the internal
    /// queues. Returns `false` on a graceful peer close.
    pub async fn fill_incoming(&mut self) -> Result<bool> {
        let mut scratch = [0u8; MAX_BYTES_PER_SEND];
        let n = self.socket.recv_msg(&mut scratch, &mut self.in_fds).await?;
        if n == 0 {
            return Ok(false);
        }
        self.in_bytes.extend(&scratch[..n]);
        Ok(true)
    }

    /// Peek the next message's header without consuming it, filling the
    /// incoming buffer as needed.
    pub async fn peek_header(&mut self) -> Result<Header> {
        while self.in_bytes.len() < wire::HEADER_SIZE {
            if !self.fill_incoming().await? {
                return Err(Error::ConnectionLost);
            }
        }
        let contiguous = self.in_bytes.make_contiguous();
        let raw = &contiguous[..wire::HEADER_SIZE];
        let raw_object_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let opcode = u16::from_le_bytes([raw[4], raw[5]]);
        let size = u16::from_le_bytes([raw[6], raw[7]]);
        if (size as usize) < wire::HEADER_SIZE || size as usize % 4 != 0 {
            return Err(Error::MalformedMessage(format!("invalid header size {size}")));
        }
        let object_id = ObjectId::new(raw_object_id)
            .ok_or_else(|| Error::MalformedMessage("message targets object id 0".into()))?;
        Ok(Header {
            object_id,
            opcode,
            size,
        })
    }

    /// Decode the full message whose header was just returned by
    /// [`Self::peek_header`], filling the incoming buffer as needed until
    /// the whole message (and every fd its signature names) has arrived.
    pub async fn recv_message(
        &mut self,
        header: Header,
        signature: Signature,
    ) -> Result<Vec<Argument>> {
        let needed_fds = signature.iter().filter(|k| **k == wire::ArgKind::Fd).count();
        loop {
            if self.in_bytes.len() >= header.size as usize && self.in_fds.len() >= needed_fds {
                break;
            }
            if !self.fill_incoming().await? {
                return Err(Error::ConnectionLost);
            }
        }

        let contiguous = self.in_bytes.make_contiguous();
        let (_, args, consumed, _) = wire::decode(
            &contiguous[..header.size as usize],
            signature,
            &mut self.in_fds,
        )?;
        self.in_bytes.drain(..consumed);
        Ok(args)
    }

    /// Close the transport, discarding and closing every fd still queued in
    /// either direction.
    pub fn close(self) {
        // Dropping `self` drops `in_fds`/`out_fds`, closing every `OwnedFd`.
    }
}
