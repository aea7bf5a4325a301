// Field widths of msghdr/cmsghdr differ across libc targets, so these casts are
// only trivial on some platforms.
#![allow(trivial_numeric_casts)]

use crate::error::IpcError;
use crate::{MAX_MESSAGE_SIZE, MAX_NUM_FDS};
use socket2::Socket;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use sysvmoc_types::SysVmOcMessage;

const FD_PAYLOAD_SIZE: usize = MAX_NUM_FDS * mem::size_of::<RawFd>();

/// Ancillary data storage, aligned for `cmsghdr`.
#[repr(C, align(8))]
struct ControlBuffer([u8; 64]);

impl ControlBuffer {
    fn new() -> Self {
        Self([0; 64])
    }
}

/// Space `n` passed descriptors take in the ancillary buffer.
fn control_space(n: usize) -> usize {
    #[allow(unused_unsafe)]
    let space = unsafe { libc::CMSG_SPACE((n * mem::size_of::<RawFd>()) as u32) } as usize;
    space
}

/// Receives one message and the descriptors passed along with it.
///
/// Descriptors are owned by the caller as soon as they arrive, so they
/// are closed even when the message itself is rejected.
pub fn read_message_with_fds(
    fd: BorrowedFd<'_>,
) -> Result<(SysVmOcMessage, Vec<OwnedFd>), IpcError> {
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
    let mut control = ControlBuffer::new();
    let control_len = control_space(MAX_NUM_FDS);
    debug_assert!(control_len <= control.0.len());

    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };
    // SAFETY: msghdr is plain old data.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr().cast();
    msg.msg_controllen = control_len as _;

    let red = loop {
        let red = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if red >= 0 {
            break red as usize;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => return Err(IpcError::Timeout),
            _ => return Err(IpcError::Io(err)),
        }
    };

    let fds = unsafe { take_passed_fds(&msg) };
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(IpcError::ControlTruncated);
    }
    if red == 0 {
        return Err(IpcError::Closed);
    }
    if red >= buffer.len() || msg.msg_flags & libc::MSG_TRUNC != 0 {
        return Err(IpcError::TruncatedMessage);
    }
    if fds.len() > MAX_NUM_FDS {
        return Err(IpcError::TooManyFds { count: fds.len() });
    }
    let message = bincode::deserialize(&buffer[..red]).map_err(IpcError::Deserialize)?;
    Ok((message, fds))
}

/// Like [`read_message_with_fds`], after putting `socket` back into
/// blocking mode.
///
/// Sockets shared with readiness-driven code may have been left
/// non-blocking, which would turn this synchronous read into a spurious
/// timeout.
pub fn read_message_with_fds_from_socket(
    socket: &Socket,
) -> Result<(SysVmOcMessage, Vec<OwnedFd>), IpcError> {
    if let Err(err) = socket.set_nonblocking(false) {
        tracing::warn!(error = %err, "could not restore blocking mode on monitor socket");
    }
    read_message_with_fds(socket.as_fd())
}

/// Takes ownership of every descriptor in the `SCM_RIGHTS` records of `msg`.
///
/// # Safety
///
/// `msg` must describe a control buffer just filled in by `recvmsg`.
unsafe fn take_passed_fds(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let header = data as usize - cmsg as usize;
                let payload = ((*cmsg).cmsg_len as usize).saturating_sub(header);
                for i in 0..payload / mem::size_of::<RawFd>() {
                    let raw = ptr::read_unaligned(data.cast::<RawFd>().add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    fds
}

/// Sends `message` with `fds` attached as one datagram.
///
/// Fails without sending anything if the encoded message does not fit
/// below [`MAX_MESSAGE_SIZE`] or more than [`MAX_NUM_FDS`] descriptors are
/// given.
pub fn write_message_with_fds(
    fd: BorrowedFd<'_>,
    message: &SysVmOcMessage,
    fds: &[BorrowedFd<'_>],
) -> Result<(), IpcError> {
    if fds.len() > MAX_NUM_FDS {
        return Err(IpcError::TooManyFds { count: fds.len() });
    }
    let size = bincode::serialized_size(message).map_err(IpcError::Serialize)? as usize;
    if size >= MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge { size });
    }
    let buffer = bincode::serialize(message).map_err(IpcError::Serialize)?;

    let mut iov = libc::iovec {
        iov_base: buffer.as_ptr() as *mut libc::c_void,
        iov_len: buffer.len(),
    };
    let mut control = ControlBuffer::new();
    // SAFETY: msghdr is plain old data.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if !fds.is_empty() {
        let payload = fds.len() * mem::size_of::<RawFd>();
        debug_assert!(payload <= FD_PAYLOAD_SIZE);
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = control_space(fds.len()) as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as _;
            let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            for (i, passed) in fds.iter().enumerate() {
                ptr::write_unaligned(data.add(i), passed.as_raw_fd());
            }
        }
    }

    loop {
        let wrote = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if wrote >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::ENOTCONN) => {
                return Err(IpcError::Closed);
            }
            _ => return Err(IpcError::Io(err)),
        }
    }
}
