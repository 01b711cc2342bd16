//! The fabric manager event loop: a single-threaded, `mio`-driven
//! readiness loop over a client-facing Unix socket and an admin Unix
//! socket, dispatching framed requests to the service registry, channel
//! table, and backing devices.
//!
//! Grounded in the workspace's existing use of `mio` as a raw readiness
//! primitive (`waitid_timeout`'s `TimerFd`, `peserver::mytimerfd`) and of
//! `rustix`'s `net` feature for socket-level peeks (`peimage-service`).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::Path;

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use zerocopy::byteorder::little_endian::U64;
use zerocopy::{FromBytes, IntoBytes};

use fm_channel::{AllocatedRegion, ChannelTable, NewChannel};
use fm_device::MemDevice;
use fm_proto::{
    decode_name, encode_name, ErrorResp, FailReplicaReq, GetMemSizeResp, ReadReq, ReadResp,
    RpcCloseChannelNotify, RpcDeregisterServiceReq, RpcNewClientNotify, RpcRegisterServiceReq,
    RpcReleaseChannelReq, RpcRequestChannelReq, RpcRequestChannelResp, Status, Tag, WriteReq,
    WriteResp, NAME_LEN, NUM_REPLICAS,
};
use fm_registry::ServiceRegistry;

const CLIENT_LISTENER: Token = Token(usize::MAX);
const ADMIN_LISTENER: Token = Token(usize::MAX - 1);

fn token_for_fd(fd: RawFd) -> Token {
    Token(fd as usize)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

struct Connection {
    stream: UnixStream,
    is_admin: bool,
}

enum Peek {
    Data(u8),
    Closed,
}

/// Peeks at the next byte on `fd` without consuming it.
///
/// `Ok(None)` means no data is ready yet (`EAGAIN`); `Ok(Some(Closed))`
/// means the peer closed cleanly (a zero-byte read); `Ok(Some(Data(b)))`
/// is the tag byte of a request that is now known to be fully arriving.
fn peek_tag(fd: BorrowedFd<'_>) -> io::Result<Option<Peek>> {
    let mut buf = [0u8; 1];
    match rustix::net::recv(fd, &mut buf, rustix::net::RecvFlags::PEEK) {
        Ok(0) => Ok(Some(Peek::Closed)),
        Ok(_) => Ok(Some(Peek::Data(buf[0]))),
        Err(rustix::io::Errno::AGAIN) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The fabric manager: service registry, channel table, backing devices,
/// and the connections currently attached to the two listen sockets.
pub struct FabricManager {
    devices: Vec<MemDevice>,
    registry: ServiceRegistry,
    channels: ChannelTable,
    connections: HashMap<RawFd, Connection>,
    poll: Poll,
    client_listener: UnixListener,
    admin_listener: UnixListener,
    /// Per-channel logical window size. A fabric-wide constant in
    /// production (`fm_proto::REPLICA_REGION_SIZE`, 256 MiB); carried as
    /// a field rather than a hardcoded constant so tests can run a
    /// fabric manager over small backing files.
    region_size: u64,
}

impl FabricManager {
    pub fn new(
        client_socket_path: impl AsRef<Path>,
        admin_socket_path: impl AsRef<Path>,
        devices: Vec<MemDevice>,
        region_size: u64,
    ) -> Result<Self, Error> {
        let _ = std::fs::remove_file(client_socket_path.as_ref());
        let _ = std::fs::remove_file(admin_socket_path.as_ref());

        let mut client_listener = UnixListener::bind(client_socket_path.as_ref())?;
        let mut admin_listener = UnixListener::bind(admin_socket_path.as_ref())?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut client_listener, CLIENT_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut admin_listener, ADMIN_LISTENER, Interest::READABLE)?;

        Ok(Self {
            devices,
            registry: ServiceRegistry::new(),
            channels: ChannelTable::new(),
            connections: HashMap::new(),
            poll,
            client_listener,
            admin_listener,
            region_size,
        })
    }

    pub fn devices(&self) -> &[MemDevice] {
        &self.devices
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Runs the event loop forever. Only returns on a fatal error from
    /// the readiness primitive itself.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(128);
        loop {
            self.poll.poll(&mut events, None)?;
            let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in tokens {
                match token {
                    CLIENT_LISTENER => self.accept_loop(false)?,
                    ADMIN_LISTENER => self.accept_loop(true)?,
                    Token(raw) => self.handle_readable(raw as RawFd),
                }
            }
        }
    }

    fn accept_loop(&mut self, is_admin: bool) -> io::Result<()> {
        loop {
            let accepted = if is_admin {
                self.admin_listener.accept()
            } else {
                self.client_listener.accept()
            };
            match accepted {
                Ok((mut stream, _addr)) => {
                    let fd = stream.as_raw_fd();
                    self.poll
                        .registry()
                        .register(&mut stream, token_for_fd(fd), Interest::READABLE)?;
                    self.connections.insert(fd, Connection { stream, is_admin });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    log::error!("accept: {e}");
                    return Ok(());
                }
            }
        }
    }

    fn handle_readable(&mut self, fd: RawFd) {
        loop {
            let Some(conn) = self.connections.get(&fd) else {
                return;
            };
            let borrowed = unsafe { BorrowedFd::borrow_raw(conn.stream.as_raw_fd()) };
            match peek_tag(borrowed) {
                Ok(None) => return,
                Ok(Some(Peek::Closed)) => {
                    self.disconnect(fd);
                    return;
                }
                Ok(Some(Peek::Data(byte))) => {
                    if !self.handle_one_message(fd, byte) {
                        return;
                    }
                    // keep looping: another full message may already be buffered
                }
                Err(e) => {
                    log::error!("peek fd={fd}: {e}");
                    self.disconnect(fd);
                    return;
                }
            }
        }
    }

    /// Reads and dispatches exactly one framed message whose tag byte was
    /// already peeked. Returns `false` if `fd` was torn down while
    /// handling it.
    fn handle_one_message(&mut self, fd: RawFd, tag_byte: u8) -> bool {
        let is_admin = match self.connections.get(&fd) {
            Some(c) => c.is_admin,
            None => return false,
        };

        let Some(tag) = Tag::from_u8(tag_byte) else {
            self.drain_unknown(fd);
            let _ = self.send_error(fd, Status::InvalidReq);
            self.disconnect(fd);
            return false;
        };
        let Some(body_len) = tag.request_body_len() else {
            self.drain_unknown(fd);
            let _ = self.send_error(fd, Status::InvalidReq);
            self.disconnect(fd);
            return false;
        };
        if is_admin && tag != Tag::FailReplicaReq {
            self.drain_unknown(fd);
            let _ = self.send_error(fd, Status::InvalidReq);
            self.disconnect(fd);
            return false;
        }

        let mut buf = vec![0u8; body_len];
        let read_ok = match self.connections.get_mut(&fd) {
            Some(conn) => conn.stream.read_exact(&mut buf).is_ok(),
            None => return false,
        };
        if !read_ok {
            log::warn!("short read fd={fd} tag={tag:?}");
            self.disconnect(fd);
            return false;
        }

        match tag {
            Tag::GetMemSizeReq => self.on_get_mem_size(fd),
            Tag::WriteReq => self.on_write(fd, &buf),
            Tag::ReadReq => self.on_read(fd, &buf),
            Tag::RpcRegisterServiceReq => self.on_register(fd, &buf),
            Tag::RpcDeregisterServiceReq => self.on_deregister(fd, &buf),
            Tag::RpcRequestChannelReq => self.on_request_channel(fd, &buf),
            Tag::RpcReleaseChannelReq => self.on_release_channel(fd, &buf),
            Tag::FailReplicaReq => self.on_fail_replica(fd, &buf),
            _ => unreachable!("request_body_len() only returns Some for request tags"),
        }

        if is_admin {
            self.close_connection(fd);
            return false;
        }
        true
    }

    fn drain_unknown(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.get_mut(&fd) {
            let mut scratch = [0u8; 1024];
            let _ = conn.stream.read(&mut scratch);
        }
    }

    fn send_bytes(&mut self, fd: RawFd, bytes: &[u8]) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such connection"))?;
        conn.stream.write_all(bytes)
    }

    fn send_error(&mut self, fd: RawFd, status: Status) -> io::Result<()> {
        let resp = ErrorResp {
            tag: Tag::ErrorResp as u8,
            status: status as u8,
        };
        self.send_bytes(fd, resp.as_bytes())
    }

    /// `{tag, status}` is the shape of every response in the catalogue
    /// that carries nothing beyond a status code.
    fn reply_status(&mut self, fd: RawFd, tag: Tag, status: Status) {
        let bytes = [tag as u8, status as u8];
        if let Err(e) = self.send_bytes(fd, &bytes) {
            log::warn!("write {tag:?} fd={fd}: {e}");
        }
    }

    fn on_get_mem_size(&mut self, fd: RawFd) {
        let resp = GetMemSizeResp {
            tag: Tag::GetMemSizeResp as u8,
            status: Status::Ok as u8,
            total_size: U64::new(self.region_size),
        };
        if let Err(e) = self.send_bytes(fd, resp.as_bytes()) {
            log::warn!("write GET_MEM_SIZE_RESP fd={fd}: {e}");
        }
    }

    fn on_write(&mut self, fd: RawFd, buf: &[u8]) {
        let Ok(req) = WriteReq::read_from_bytes(buf) else {
            self.reply_write(fd, Status::InvalidReq);
            return;
        };
        let channel_id = req.channel_id.get();
        let addr = req.addr.get();
        let size = req.size;

        if !matches!(size, 1 | 2 | 4 | 8) {
            self.reply_write(fd, Status::InvalidReq);
            return;
        }
        let size_u = size as u64;
        if addr
            .checked_add(size_u)
            .map_or(true, |end| end > self.region_size)
        {
            self.reply_write(fd, Status::OutOfBounds);
            return;
        }

        let Some(channel) = self.channels.lookup(channel_id).cloned() else {
            self.reply_write(fd, Status::InvalidReq);
            return;
        };
        if channel.regions.is_empty() {
            self.reply_write(fd, Status::NoHealthyBackend);
            return;
        }

        let value_bytes = req.value.get().to_le_bytes();
        let mut healthy = 0usize;
        let mut successes = 0usize;
        for region in &channel.regions {
            let device = &mut self.devices[region.device_index];
            if !device.is_healthy() {
                continue;
            }
            healthy += 1;
            match device.write(region.offset + addr, &value_bytes[..size as usize]) {
                Ok(()) => successes += 1,
                Err(e) => log::error!(
                    "write device={} offset={}: {e}",
                    region.device_index,
                    region.offset + addr
                ),
            }
        }

        let status = if healthy == 0 {
            Status::NoHealthyBackend
        } else if successes == healthy {
            Status::Ok
        } else {
            Status::Io
        };
        self.reply_write(fd, status);
    }

    fn reply_write(&mut self, fd: RawFd, status: Status) {
        self.reply_status(fd, Tag::WriteResp, status);
    }

    fn on_read(&mut self, fd: RawFd, buf: &[u8]) {
        let Ok(req) = ReadReq::read_from_bytes(buf) else {
            self.reply_read(fd, Status::InvalidReq, 0);
            return;
        };
        let channel_id = req.channel_id.get();
        let addr = req.addr.get();
        let size = req.size;

        if !matches!(size, 1 | 2 | 4 | 8) {
            self.reply_read(fd, Status::InvalidReq, 0);
            return;
        }
        let size_u = size as u64;
        if addr
            .checked_add(size_u)
            .map_or(true, |end| end > self.region_size)
        {
            self.reply_read(fd, Status::OutOfBounds, 0);
            return;
        }

        let Some(channel) = self.channels.lookup(channel_id).cloned() else {
            self.reply_read(fd, Status::InvalidReq, 0);
            return;
        };

        for region in &channel.regions {
            let device = &self.devices[region.device_index];
            if !device.is_healthy() {
                continue;
            }
            let mut raw = [0u8; 8];
            match device.read(region.offset + addr, &mut raw[..size as usize]) {
                Ok(()) => {
                    let value = u64::from_le_bytes(raw);
                    self.reply_read(fd, Status::Ok, value);
                    return;
                }
                Err(e) => log::error!(
                    "read device={} offset={}: {e}",
                    region.device_index,
                    region.offset + addr
                ),
            }
        }
        self.reply_read(fd, Status::NoHealthyBackend, 0);
    }

    fn reply_read(&mut self, fd: RawFd, status: Status, value: u64) {
        let resp = ReadResp {
            tag: Tag::ReadResp as u8,
            status: status as u8,
            value: U64::new(value),
        };
        if let Err(e) = self.send_bytes(fd, resp.as_bytes()) {
            log::warn!("write READ_RESP fd={fd}: {e}");
        }
    }

    fn on_register(&mut self, fd: RawFd, buf: &[u8]) {
        let Ok(req) = RpcRegisterServiceReq::read_from_bytes(buf) else {
            self.reply_status(fd, Tag::RpcRegisterServiceResp, Status::InvalidReq);
            return;
        };
        let service_name = decode_name(&req.service_name);
        let instance_id = decode_name(&req.instance_id);
        self.registry.register(&service_name, &instance_id, fd);
        self.reply_status(fd, Tag::RpcRegisterServiceResp, Status::Ok);
    }

    fn on_deregister(&mut self, fd: RawFd, buf: &[u8]) {
        let Ok(req) = RpcDeregisterServiceReq::read_from_bytes(buf) else {
            self.reply_status(fd, Tag::RpcDeregisterServiceResp, Status::InvalidReq);
            return;
        };
        let service_name = decode_name(&req.service_name);
        let instance_id = decode_name(&req.instance_id);
        let status = if self.registry.deregister(&service_name, &instance_id, fd) {
            Status::Ok
        } else {
            Status::RegistrationFailed
        };
        self.reply_status(fd, Tag::RpcDeregisterServiceResp, status);
    }

    fn on_request_channel(&mut self, client_fd: RawFd, buf: &[u8]) {
        let Ok(req) = RpcRequestChannelReq::read_from_bytes(buf) else {
            self.reply_request_channel(client_fd, Status::InvalidReq, 0, 0);
            return;
        };
        let service_name = decode_name(&req.service_name);
        let client_instance_id = decode_name(&req.instance_id);

        // 1 & 2: resolve the service and pick a server.
        let Some(server) = self.registry.pick(&service_name) else {
            self.reply_request_channel(client_fd, Status::ServiceNotFound, 0, 0);
            return;
        };

        // 3: allocate NUM_REPLICAS regions, one per distinct healthy
        // device, iterating devices in order; roll back on shortfall.
        let mut regions: Vec<AllocatedRegion> = Vec::with_capacity(NUM_REPLICAS);
        for (i, device) in self.devices.iter_mut().enumerate() {
            if regions.len() == NUM_REPLICAS {
                break;
            }
            if !device.is_healthy() {
                continue;
            }
            if let Some(offset) = device.allocate(self.region_size) {
                regions.push(AllocatedRegion {
                    device_index: i,
                    offset,
                    size: self.region_size,
                });
            }
        }
        if regions.len() < NUM_REPLICAS {
            for region in &regions {
                self.devices[region.device_index].free(region.offset, region.size);
            }
            self.reply_request_channel(client_fd, Status::ChannelAllocFailed, 0, 0);
            return;
        }

        // 4 & 5: assign the channel id and record it.
        let channel_id = self.channels.insert(NewChannel {
            client_instance_id: client_instance_id.clone(),
            client_fd,
            server_instance_id: server.instance_id.clone(),
            server_fd: server.server_fd,
            service_name: service_name.clone(),
            regions: regions.clone(),
        });

        // 6: notify the server, first checking it hasn't disconnected
        // between `pick` and here.
        if !self.connections.contains_key(&server.server_fd) {
            self.unwind_channel(channel_id, &regions);
            self.reply_request_channel(client_fd, Status::ChannelAllocFailed, 0, 0);
            return;
        }

        let mut sn = [0u8; NAME_LEN];
        encode_name(&service_name, &mut sn);
        let mut cid = [0u8; NAME_LEN];
        encode_name(&client_instance_id, &mut cid);
        let notify = RpcNewClientNotify {
            tag: Tag::RpcNewClientNotify as u8,
            channel_id: U64::new(channel_id),
            offset: U64::new(0),
            size: U64::new(self.region_size),
            service_name: sn,
            client_instance_id: cid,
        };

        if let Err(e) = self.send_bytes(server.server_fd, notify.as_bytes()) {
            log::warn!(
                "notify server fd={} for channel {channel_id}: {e}",
                server.server_fd
            );
            self.unwind_channel(channel_id, &regions);
            self.reply_request_channel(client_fd, Status::ChannelAllocFailed, 0, 0);
            return;
        }

        // 7: respond to the client. If this fails, the server has
        // already been told about a channel the client will never use;
        // unwind and tell the server to close it.
        let resp = RpcRequestChannelResp {
            tag: Tag::RpcRequestChannelResp as u8,
            status: Status::Ok as u8,
            channel_id: U64::new(channel_id),
            offset: U64::new(0),
            size: U64::new(self.region_size),
        };
        if let Err(e) = self.send_bytes(client_fd, resp.as_bytes()) {
            log::warn!("respond to client fd={client_fd} for channel {channel_id}: {e}");
            self.unwind_channel(channel_id, &regions);
            let close = RpcCloseChannelNotify {
                tag: Tag::RpcCloseChannelNotify as u8,
                channel_id: U64::new(channel_id),
            };
            if let Err(e) = self.send_bytes(server.server_fd, close.as_bytes()) {
                log::warn!("unwind notify to server fd={}: {e}", server.server_fd);
            }
        }
    }

    fn unwind_channel(&mut self, channel_id: u64, regions: &[AllocatedRegion]) {
        for region in regions {
            self.devices[region.device_index].free(region.offset, region.size);
        }
        self.channels.remove(channel_id);
    }

    fn reply_request_channel(&mut self, fd: RawFd, status: Status, channel_id: u64, size: u64) {
        let resp = RpcRequestChannelResp {
            tag: Tag::RpcRequestChannelResp as u8,
            status: status as u8,
            channel_id: U64::new(channel_id),
            offset: U64::new(0),
            size: U64::new(size),
        };
        if let Err(e) = self.send_bytes(fd, resp.as_bytes()) {
            log::warn!("write RPC_REQUEST_CHANNEL_RESP fd={fd}: {e}");
        }
    }

    fn on_release_channel(&mut self, fd: RawFd, buf: &[u8]) {
        let Ok(req) = RpcReleaseChannelReq::read_from_bytes(buf) else {
            self.reply_status(fd, Tag::RpcReleaseChannelResp, Status::InvalidReq);
            return;
        };
        let channel_id = req.channel_id.get();
        let Some(channel) = self.channels.remove(channel_id) else {
            self.reply_status(fd, Tag::RpcReleaseChannelResp, Status::InvalidReq);
            return;
        };
        for region in &channel.regions {
            self.devices[region.device_index].free(region.offset, region.size);
        }
        let peer_fd = if fd == channel.client_fd {
            channel.server_fd
        } else {
            channel.client_fd
        };
        let close = RpcCloseChannelNotify {
            tag: Tag::RpcCloseChannelNotify as u8,
            channel_id: U64::new(channel_id),
        };
        if let Err(e) = self.send_bytes(peer_fd, close.as_bytes()) {
            log::warn!("close notify to peer fd={peer_fd} for channel {channel_id}: {e}");
        }
        self.reply_status(fd, Tag::RpcReleaseChannelResp, Status::Ok);
    }

    fn on_fail_replica(&mut self, fd: RawFd, buf: &[u8]) {
        let Ok(req) = FailReplicaReq::read_from_bytes(buf) else {
            self.reply_status(fd, Tag::FailReplicaResp, Status::InvalidReq);
            return;
        };
        let index = req.device_index.get() as usize;
        let status = match self.devices.get_mut(index) {
            Some(device) => {
                device.mark_unhealthy();
                Status::Ok
            }
            None => Status::InvalidReq,
        };
        self.reply_status(fd, Tag::FailReplicaResp, status);
    }

    fn disconnect(&mut self, fd: RawFd) {
        let channel_ids = self.channels.channels_for_fd(fd);
        for channel_id in channel_ids {
            let Some(channel) = self.channels.remove(channel_id) else {
                continue;
            };
            for region in &channel.regions {
                self.devices[region.device_index].free(region.offset, region.size);
            }
            let peer_fd = if fd == channel.client_fd {
                channel.server_fd
            } else {
                channel.client_fd
            };
            if peer_fd != fd {
                let close = RpcCloseChannelNotify {
                    tag: Tag::RpcCloseChannelNotify as u8,
                    channel_id: U64::new(channel_id),
                };
                if let Err(e) = self.send_bytes(peer_fd, close.as_bytes()) {
                    log::debug!(
                        "close notify to peer fd={peer_fd} on disconnect of fd={fd}: {e}"
                    );
                }
            }
        }
        self.registry.drop_by_fd(fd);
        self.close_connection(fd);
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.connections.remove(&fd) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }
}
