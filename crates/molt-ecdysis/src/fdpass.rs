//! Descriptor passing over a local stream socket.
//!
//! A message is a short payload plus, optionally, one open descriptor carried
//! in an `SCM_RIGHTS` control message. Received descriptors come back as
//! [`OwnedFd`]s marked close-on-exec, so nothing leaks into later spawns.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use tokio::io::Interest;
use tokio::net::UnixStream;

/// Descriptors the receive buffer has room for in one message.
///
/// Protocols here only ever send one; the extra room lets a receiver see
/// (and close) surplus descriptors instead of having the kernel truncate them.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

const ANCILLARY_CAPACITY: usize = 128;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Control-message buffer with the alignment `cmsghdr` requires.
#[repr(C, align(8))]
struct AncillaryBuffer([u8; ANCILLARY_CAPACITY]);

impl AncillaryBuffer {
    fn new() -> Self {
        Self([0; ANCILLARY_CAPACITY])
    }
}

/// One message read by [`recv_descriptor`].
#[derive(Debug)]
pub struct ReceivedMessage {
    /// Payload bytes read. Zero means the peer closed the stream.
    pub len: usize,
    /// Descriptors that arrived with the payload, in order.
    pub fds: Vec<OwnedFd>,
    /// The kernel dropped control data that did not fit the buffer.
    pub truncated: bool,
}

/// Send `payload`, attaching `fd` as `SCM_RIGHTS` ancillary data when given.
///
/// The descriptor is duplicated into the receiving process by the kernel; the
/// caller keeps its own copy. Returns the number of payload bytes written.
pub async fn send_descriptor(
    stream: &UnixStream,
    payload: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<usize> {
    if payload.is_empty() {
        // Ancillary data must ride on at least one byte of a stream socket.
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor messages need a non-empty payload",
        ));
    }
    let socket = stream.as_raw_fd();
    let passed = fd.map(|fd| fd.as_raw_fd());
    stream
        .async_io(Interest::WRITABLE, || sendmsg_with_fd(socket, payload, passed))
        .await
}

/// Receive one message into `buf`, collecting any descriptors sent with it.
pub async fn recv_descriptor(stream: &UnixStream, buf: &mut [u8]) -> io::Result<ReceivedMessage> {
    let socket = stream.as_raw_fd();
    stream
        .async_io(Interest::READABLE, || recvmsg_with_fds(socket, &mut *buf))
        .await
}

/// Whether `fd` refers to a socket (as opposed to a file, pipe, ...).
pub fn is_socket(fd: BorrowedFd<'_>) -> bool {
    // SAFETY: `stat` is plain old data and fstat only writes into it.
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    let result = unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn cmsg_space(fds: usize) -> usize {
    // SAFETY: pure size arithmetic.
    unsafe { libc::CMSG_SPACE((fds * mem::size_of::<RawFd>()) as u32) as usize }
}

fn sendmsg_with_fd(socket: RawFd, payload: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut control = AncillaryBuffer::new();

    // SAFETY: an all-zero msghdr is a valid, empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space(1) as _;
        // SAFETY: msg_control points at an aligned, zeroed buffer with room
        // for one header plus one descriptor, so the first header is non-null.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        }
    }

    // SAFETY: every pointer in msg outlives the call.
    let sent = unsafe { libc::sendmsg(socket, &msg, SEND_FLAGS) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

fn recvmsg_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<ReceivedMessage> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = AncillaryBuffer::new();

    // SAFETY: an all-zero msghdr is a valid, empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space(MAX_FDS_PER_MESSAGE).min(ANCILLARY_CAPACITY) as _;

    // SAFETY: every pointer in msg outlives the call.
    let received = unsafe { libc::recvmsg(socket, &mut msg, RECV_FLAGS) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control with msg_controllen bytes of
    // well-formed headers; each SCM_RIGHTS payload is an array of descriptors
    // that now belong to this process.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let header_len = data as usize - cmsg as usize;
                let data_len = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
                for i in 0..data_len / mem::size_of::<RawFd>() {
                    let raw = ptr::read_unaligned(data.cast::<RawFd>().add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in &fds {
        set_cloexec(fd.as_raw_fd())?;
    }

    Ok(ReceivedMessage {
        len: received as usize,
        fds,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn test_passes_socket_between_endpoints() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (passed, mut peer) = std::os::unix::net::UnixStream::pair().unwrap();

        let sent = send_descriptor(&tx, &[0], Some(passed.as_fd())).await.unwrap();
        assert_eq!(sent, 1);
        drop(passed);

        let mut tag = [0xffu8; 1];
        let msg = recv_descriptor(&rx, &mut tag).await.unwrap();
        assert_eq!(msg.len, 1);
        assert_eq!(tag[0], 0);
        assert!(!msg.truncated);
        assert_eq!(msg.fds.len(), 1);

        // The received descriptor still talks to the original peer.
        let mut adopted = std::os::unix::net::UnixStream::from(msg.fds.into_iter().next().unwrap());
        adopted.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_message_without_descriptor() {
        let (tx, rx) = UnixStream::pair().unwrap();
        send_descriptor(&tx, &[1], None).await.unwrap();

        let mut tag = [0u8; 1];
        let msg = recv_descriptor(&rx, &mut tag).await.unwrap();
        assert_eq!(msg.len, 1);
        assert_eq!(tag[0], 1);
        assert!(msg.fds.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_reads_as_zero_length() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);

        let mut tag = [0u8; 1];
        let msg = recv_descriptor(&rx, &mut tag).await.unwrap();
        assert_eq!(msg.len, 0);
        assert!(msg.fds.is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let err = send_descriptor(&tx, &[], None).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_received_descriptor_is_cloexec() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (passed, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        send_descriptor(&tx, &[0], Some(passed.as_fd())).await.unwrap();

        let mut tag = [0u8; 1];
        let msg = recv_descriptor(&rx, &mut tag).await.unwrap();
        let fd = msg.fds[0].as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_socket_detection() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        assert!(is_socket(a.as_fd()));

        let file = std::fs::File::open("/dev/null").unwrap();
        assert!(!is_socket(file.as_fd()));
    }
}
