//! Point-to-point control channel over a Unix socket pair.
//!
//! The pair is `SOCK_SEQPACKET`: datagram-framed like `SOCK_DGRAM`, but a
//! closed peer shows up as end-of-channel on the survivor. Each
//! [`ControlChannel::send`] is exactly one datagram and is matched by
//! exactly one [`ControlChannel::receive`]. Descriptors travel as
//! `SCM_RIGHTS` ancillary data attached to a single `\0` byte; the receiver
//! gets its own duplicate, and both copies can be closed independently.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{
    recv, recvmsg, send, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType,
};
use tracing::{debug, warn};

use crate::protocol::MAX_MESSAGE_BYTES;
use crate::{AgentError, Result};

/// Payload accompanying a descriptor transfer.
const HANDLE_PAYLOAD: [u8; 1] = [0];

/// One endpoint of a connected socket pair.
#[derive(Debug)]
pub struct ControlChannel {
    socket: OwnedFd,
}

impl ControlChannel {
    /// Create two connected endpoints.
    ///
    /// Both endpoints are close-on-exec.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Channel` if the socket pair cannot be created.
    pub fn pair() -> Result<(Self, Self)> {
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .map_err(|errno| AgentError::Channel(format!("failed to create socket pair: {errno}")))?;
        set_cloexec(&local)?;
        set_cloexec(&remote)?;
        Ok((Self { socket: local }, Self { socket: remote }))
    }

    /// Take ownership of a descriptor inherited from the parent process.
    ///
    /// The descriptor is marked close-on-exec so that commands exec'd by
    /// plan actions never inherit it; forked children still do.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Channel` if the descriptor is negative or not open.
    #[allow(unsafe_code)]
    pub fn from_inherited_fd(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(AgentError::Channel(format!(
                "inherited descriptor {fd} is negative"
            )));
        }

        let bits = fcntl(fd, FcntlArg::F_GETFD).map_err(|errno| {
            AgentError::Channel(format!("inherited descriptor {fd} is not open: {errno}"))
        })?;
        let mut flags = FdFlag::from_bits_truncate(bits);
        flags.insert(FdFlag::FD_CLOEXEC);
        fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(|errno| {
            AgentError::Channel(format!("failed to mark descriptor {fd} close-on-exec: {errno}"))
        })?;

        // SAFETY: F_GETFD succeeded so `fd` is open, and the entry contract
        // hands it to this process exclusively; nothing else wraps it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(fd, "attached inherited control descriptor");
        Ok(Self::from(owned))
    }

    /// Send one datagram.
    ///
    /// # Errors
    ///
    /// - `AgentError::Protocol` if the payload is empty or larger than
    ///   [`MAX_MESSAGE_BYTES`].
    /// - `AgentError::ChannelClosed` if the peer has gone away.
    /// - `AgentError::Channel` for any other socket failure.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(AgentError::Protocol("refusing to send an empty datagram".into()));
        }
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(AgentError::Protocol(format!(
                "payload of {} bytes exceeds the {MAX_MESSAGE_BYTES}-byte datagram limit",
                payload.len()
            )));
        }

        loop {
            match send(self.socket.as_raw_fd(), payload, send_flags()) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(Errno::ECONNREFUSED | Errno::EPIPE | Errno::ENOTCONN | Errno::ECONNRESET) => {
                    return Err(AgentError::ChannelClosed);
                }
                Err(errno) => return Err(AgentError::Channel(format!("send failed: {errno}"))),
            }
        }
    }

    /// Send a duplicate of `handle` to the peer.
    ///
    /// The caller keeps its own copy and remains responsible for closing it.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::ChannelClosed` if the peer has gone away, or
    /// `AgentError::Channel` for any other failure.
    pub fn send_handle(&self, handle: impl AsFd) -> Result<()> {
        let fds = [handle.as_fd().as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(&HANDLE_PAYLOAD)];

        loop {
            match sendmsg::<()>(
                self.socket.as_raw_fd(),
                &iov,
                &cmsgs,
                send_flags(),
                None,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(Errno::ECONNREFUSED | Errno::EPIPE | Errno::ENOTCONN | Errno::ECONNRESET) => {
                    return Err(AgentError::ChannelClosed);
                }
                Err(errno) => {
                    return Err(AgentError::Channel(format!("send handle failed: {errno}")));
                }
            }
        }
    }

    /// Block until one datagram arrives and return its payload.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::ChannelClosed` once the peer has closed its end,
    /// or `AgentError::Channel` for any other failure.
    pub fn receive(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; MAX_MESSAGE_BYTES];
        loop {
            match recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) | Err(Errno::ECONNRESET) => return Err(AgentError::ChannelClosed),
                Ok(len) => {
                    buf.truncate(len);
                    return Ok(buf);
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(AgentError::Channel(format!("receive failed: {errno}"))),
            }
        }
    }

    /// Block until a descriptor arrives and take ownership of it.
    ///
    /// Extra descriptors in the same message are closed.
    ///
    /// # Errors
    ///
    /// - `AgentError::ChannelClosed` once the peer has closed its end.
    /// - `AgentError::Protocol` if a plain datagram arrives instead.
    /// - `AgentError::Channel` for any other failure.
    #[allow(unsafe_code)]
    pub fn receive_handle(&self) -> Result<OwnedFd> {
        let mut byte = [0_u8; 1];
        loop {
            let mut cmsg_buffer = cmsg_space!(RawFd);
            let mut iov = [IoSliceMut::new(&mut byte)];
            let msg = match recvmsg::<()>(
                self.socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                receive_flags(),
            ) {
                Ok(msg) => msg,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(AgentError::ChannelClosed),
                Err(errno) => {
                    return Err(AgentError::Channel(format!("receive handle failed: {errno}")));
                }
            };

            let mut received: Option<OwnedFd> = None;
            let cmsgs = msg
                .cmsgs()
                .map_err(|errno| AgentError::Channel(format!("truncated control message: {errno}")))?;
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for fd in fds {
                        // SAFETY: the kernel installed `fd` in this process
                        // while delivering the message; nothing else owns it.
                        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                        if received.is_none() {
                            received = Some(owned);
                        } else {
                            warn!(fd, "closing surplus descriptor in handle message");
                        }
                    }
                }
            }

            return match received {
                Some(fd) => Ok(fd),
                None if msg.bytes == 0 => Err(AgentError::ChannelClosed),
                None => Err(AgentError::Protocol(
                    "expected a descriptor but received a plain datagram".into(),
                )),
            };
        }
    }

    /// Duplicate this endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Channel` if the descriptor cannot be duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        let socket = self
            .socket
            .try_clone()
            .map_err(|err| AgentError::Channel(format!("failed to duplicate endpoint: {err}")))?;
        set_cloexec(&socket)?;
        Ok(Self { socket })
    }

    /// Close this endpoint.
    pub fn close(self) {
        drop(self);
    }
}

impl From<OwnedFd> for ControlChannel {
    fn from(fd: OwnedFd) -> Self {
        Self { socket: fd }
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let bits = fcntl(raw, FcntlArg::F_GETFD)
        .map_err(|errno| AgentError::Channel(format!("failed to read descriptor flags: {errno}")))?;
    let mut flags = FdFlag::from_bits_truncate(bits);
    flags.insert(FdFlag::FD_CLOEXEC);
    fcntl(raw, FcntlArg::F_SETFD(flags))
        .map_err(|errno| AgentError::Channel(format!("failed to set close-on-exec: {errno}")))?;
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn receive_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn receive_flags() -> MsgFlags {
    MsgFlags::empty()
}
