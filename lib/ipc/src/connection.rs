use crate::error::IpcError;
use crate::message::{read_message_with_fds_from_socket, write_message_with_fds};
use socket2::{Domain, Socket, Type};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;
use sysvmoc_types::protocol::{InitializeMessage, InitializeResponseMessage};
use sysvmoc_types::SysVmOcMessage;

/// A connected pair of close-on-exec `SOCK_SEQPACKET` unix sockets.
///
/// Sequenced packets keep datagram boundaries and, unlike unix datagram
/// pairs, report the peer closing as end of file.
pub fn seqpacket_pair() -> io::Result<(Socket, Socket)> {
    Socket::pair(Domain::UNIX, Type::SEQPACKET, None)
}

/// Opens a session with the compile monitor listening on `service`.
///
/// Sends an `initialize_message` carrying a fresh session socket and the
/// cache file, then waits up to `timeout` for the monitor's answer. The
/// returned socket is where compile and evict requests go.
pub fn get_connection_to_compile_monitor(
    service: BorrowedFd<'_>,
    cache_fd: BorrowedFd<'_>,
    timeout: Duration,
) -> Result<Socket, IpcError> {
    let (ours, theirs) = seqpacket_pair()?;
    write_message_with_fds(
        service,
        &SysVmOcMessage::Initialize(InitializeMessage),
        &[theirs.as_fd(), cache_fd],
    )?;
    drop(theirs);

    ours.set_read_timeout(Some(timeout))?;
    let (message, _fds) = read_message_with_fds_from_socket(&ours)?;
    ours.set_read_timeout(None)?;
    match message {
        SysVmOcMessage::InitializeResponse(InitializeResponseMessage {
            error_message: None,
        }) => Ok(ours),
        SysVmOcMessage::InitializeResponse(InitializeResponseMessage {
            error_message: Some(error),
        }) => Err(IpcError::Rejected(error)),
        other => Err(IpcError::UnexpectedMessage(other.kind())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfd_for_bytearray;
    use crate::message::read_message_with_fds;

    fn answer_one(service: Socket, error_message: Option<String>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let (message, fds) = read_message_with_fds(service.as_fd()).unwrap();
            assert_eq!(message, SysVmOcMessage::Initialize(InitializeMessage));
            assert_eq!(fds.len(), 2);
            let reply = SysVmOcMessage::InitializeResponse(InitializeResponseMessage {
                error_message,
            });
            write_message_with_fds(fds[0].as_fd(), &reply, &[]).unwrap();
        })
    }

    #[test]
    fn handshake_succeeds() {
        let (client, service) = seqpacket_pair().unwrap();
        let monitor = answer_one(service, None);
        let cache = memfd_for_bytearray(b"cache").unwrap();
        get_connection_to_compile_monitor(client.as_fd(), cache.as_fd(), Duration::from_secs(5))
            .unwrap();
        monitor.join().unwrap();
    }

    #[test]
    fn handshake_reports_monitor_error() {
        let (client, service) = seqpacket_pair().unwrap();
        let monitor = answer_one(service, Some("bad cache file".into()));
        let cache = memfd_for_bytearray(b"cache").unwrap();
        let err = get_connection_to_compile_monitor(
            client.as_fd(),
            cache.as_fd(),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, IpcError::Rejected(msg) if msg == "bad cache file"));
        monitor.join().unwrap();
    }

    #[test]
    fn silent_monitor_times_out() {
        let (client, _service) = seqpacket_pair().unwrap();
        let cache = memfd_for_bytearray(b"cache").unwrap();
        let err = get_connection_to_compile_monitor(
            client.as_fd(),
            cache.as_fd(),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, IpcError::Timeout));
    }
}
