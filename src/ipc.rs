//! Sway IPC transport: socket discovery, i3-ipc framing and a
//! non-blocking receive state machine.
//!
//! Any transport error closes the socket for good; the daemon keeps
//! rendering from the last known workspace visibility.

use std::env;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::process::Command;

use nix::libc;

use crate::error::WsbgError;

pub const IPC_GET_WORKSPACES: u32 = 1;
pub const IPC_SUBSCRIBE: u32 = 2;
/// Events carry the high bit; workspace events are channel 0.
pub const IPC_EVENT_WORKSPACE: u32 = 0x8000_0000;

const MAGIC: [u8; 6] = *b"i3-ipc";
const HEADER_SIZE: usize = 6 + 4 + 4;

pub struct IpcMessage {
    pub kind: u32,
    pub payload: Vec<u8>,
}

pub struct SwayIpc {
    stream: Option<UnixStream>,
    buffer: Vec<u8>,
    received: usize,
    payload_size: u32,
}

impl SwayIpc {
    /// Connect to the compositor IPC socket. A missing socket is not
    /// fatal: the daemon runs with static workspace visibility.
    pub fn connect() -> SwayIpc {
        let path = match socket_path() {
            Some(path) => path,
            None => {
                log::error!("Unable to retrieve the sway socket path");
                return SwayIpc::closed();
            }
        };
        let stream = match UnixStream::connect(&path) {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("Unable to connect to {path}: {err}");
                return SwayIpc::closed();
            }
        };
        if let Err(err) = stream.set_nonblocking(true) {
            log::error!("Unable to set the sway socket to be non-blocking: {err}");
            return SwayIpc::closed();
        }
        SwayIpc::from_stream(stream)
    }

    pub fn closed() -> SwayIpc {
        SwayIpc {
            stream: None,
            buffer: Vec::new(),
            received: 0,
            payload_size: 0,
        }
    }

    fn from_stream(stream: UnixStream) -> SwayIpc {
        SwayIpc {
            stream: Some(stream),
            buffer: Vec::new(),
            received: 0,
            payload_size: 0,
        }
    }

    pub fn raw_fd(&self) -> Option<i32> {
        self.stream.as_ref().map(|stream| stream.as_raw_fd())
    }

    fn close(&mut self) {
        self.stream = None;
        self.buffer = Vec::new();
        self.received = 0;
        self.payload_size = 0;
    }

    /// Receive one framed message without blocking. Returns `None` when
    /// no complete message is available yet.
    pub fn recv(&mut self) -> Option<IpcMessage> {
        let stream = self.stream.as_mut()?;

        let size = HEADER_SIZE + self.payload_size as usize;
        if self.buffer.len() < size {
            self.buffer.resize(size, 0);
        }

        match stream.read(&mut self.buffer[self.received..size]) {
            Ok(0) => {
                log::error!("Sway IPC socket closed by peer");
                self.close();
                return None;
            }
            Ok(count) => self.received += count,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
            Err(err) => {
                log::error!("{}", WsbgError::IpcTransport(err));
                self.close();
                return None;
            }
        }

        if self.received < HEADER_SIZE {
            return None;
        }

        if self.payload_size == 0 {
            let mut length = [0u8; 4];
            length.copy_from_slice(&self.buffer[MAGIC.len()..MAGIC.len() + 4]);
            self.payload_size = u32::from_le_bytes(length);
            if self.payload_size != 0 {
                // The payload may already be waiting; try to finish it.
                return self.recv();
            }
        }

        if self.received != HEADER_SIZE + self.payload_size as usize {
            return None;
        }

        let mut kind = [0u8; 4];
        kind.copy_from_slice(&self.buffer[MAGIC.len() + 4..HEADER_SIZE]);
        let message = IpcMessage {
            kind: u32::from_le_bytes(kind),
            payload: self.buffer[HEADER_SIZE..size].to_vec(),
        };
        self.received = 0;
        self.payload_size = 0;
        Some(message)
    }

    /// Issue one command. Errors close the socket.
    pub fn send(&mut self, kind: u32, payload: Option<&str>) {
        if self.stream.is_none() {
            return;
        }

        let payload = payload.unwrap_or("").as_bytes();
        let mut header = [0u8; HEADER_SIZE];
        header[..MAGIC.len()].copy_from_slice(&MAGIC);
        header[MAGIC.len()..MAGIC.len() + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[MAGIC.len() + 4..].copy_from_slice(&kind.to_le_bytes());

        if self.send_all(&header, -1) && !payload.is_empty() {
            self.send_all(payload, -1);
        }
    }

    /// Write everything, polling for writability on a full socket.
    fn send_all(&mut self, mut data: &[u8], timeout: i32) -> bool {
        loop {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return false,
            };
            let fd = stream.as_raw_fd();
            match stream.write(data) {
                Ok(count) => {
                    data = &data[count..];
                    if data.is_empty() {
                        return true;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let mut pfd = libc::pollfd {
                        fd,
                        events: libc::POLLOUT,
                        revents: 0,
                    };
                    let ready = loop {
                        let n = unsafe { libc::poll(&mut pfd, 1, timeout) };
                        if n >= 0 {
                            break n;
                        }
                        let err = io::Error::last_os_error();
                        if err.raw_os_error() != Some(libc::EINTR) {
                            log::error!("{}", WsbgError::IpcTransport(err));
                            self.close();
                            return false;
                        }
                    };
                    if ready == 0 {
                        log::error!("Unable to send sway IPC command: timed out");
                        self.close();
                        return false;
                    }
                }
                Err(err) => {
                    log::error!("{}", WsbgError::IpcTransport(err));
                    self.close();
                    return false;
                }
            }
        }
    }
}

/// `$SWAYSOCK`, `sway --get-socketpath`, `$I3SOCK`, `i3 --get-socketpath`,
/// in that order.
fn socket_path() -> Option<String> {
    if let Ok(path) = env::var("SWAYSOCK") {
        return Some(path);
    }
    if let Some(path) = socket_path_from("sway") {
        return Some(path);
    }
    if let Ok(path) = env::var("I3SOCK") {
        return Some(path);
    }
    socket_path_from("i3")
}

fn socket_path_from(command: &str) -> Option<String> {
    let output = Command::new(command).arg("--get-socketpath").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let line = String::from_utf8(output.stdout).ok()?;
    let line = line.trim_end_matches('\n');
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SwayIpc, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (SwayIpc::from_stream(ours), theirs)
    }

    fn frame(kind: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&kind.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_recv_whole_message() {
        let (mut ipc, mut peer) = pair();
        peer.write_all(&frame(IPC_GET_WORKSPACES, b"[]")).unwrap();

        let message = ipc.recv().unwrap();
        assert_eq!(message.kind, IPC_GET_WORKSPACES);
        assert_eq!(message.payload, b"[]");
        // Nothing else buffered.
        assert!(ipc.recv().is_none());
    }

    #[test]
    fn test_recv_reassembles_split_frames() {
        let (mut ipc, mut peer) = pair();
        let data = frame(IPC_EVENT_WORKSPACE, br#"{"change":"focus"}"#);

        // Header split mid-magic, then mid-payload.
        peer.write_all(&data[..3]).unwrap();
        assert!(ipc.recv().is_none());
        peer.write_all(&data[3..20]).unwrap();
        assert!(ipc.recv().is_none());
        peer.write_all(&data[20..]).unwrap();

        let message = ipc.recv().unwrap();
        assert_eq!(message.kind, IPC_EVENT_WORKSPACE);
        assert_eq!(message.payload, br#"{"change":"focus"}"#);
    }

    #[test]
    fn test_recv_back_to_back_messages() {
        let (mut ipc, mut peer) = pair();
        let mut data = frame(IPC_SUBSCRIBE, br#"{"success": true}"#);
        data.extend_from_slice(&frame(IPC_EVENT_WORKSPACE, b"{}"));
        peer.write_all(&data).unwrap();

        assert_eq!(ipc.recv().unwrap().kind, IPC_SUBSCRIBE);
        assert_eq!(ipc.recv().unwrap().kind, IPC_EVENT_WORKSPACE);
        assert!(ipc.recv().is_none());
    }

    #[test]
    fn test_recv_empty_payload() {
        let (mut ipc, mut peer) = pair();
        peer.write_all(&frame(IPC_GET_WORKSPACES, b"")).unwrap();
        let message = ipc.recv().unwrap();
        assert_eq!(message.kind, IPC_GET_WORKSPACES);
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_peer_close_shuts_the_channel_down() {
        let (mut ipc, peer) = pair();
        drop(peer);
        assert!(ipc.recv().is_none());
        assert!(ipc.raw_fd().is_none());
    }

    #[test]
    fn test_send_writes_header_and_payload() {
        let (mut ipc, mut peer) = pair();
        peer.set_nonblocking(false).unwrap();
        ipc.send(IPC_SUBSCRIBE, Some(r#"["workspace"]"#));

        let mut received = vec![0u8; HEADER_SIZE + 13];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received[..6], b"i3-ipc");
        assert_eq!(&received[6..10], &13u32.to_le_bytes());
        assert_eq!(&received[10..14], &IPC_SUBSCRIBE.to_le_bytes());
        assert_eq!(&received[14..], br#"["workspace"]"#);
    }

    #[test]
    fn test_send_on_closed_socket_is_a_no_op() {
        let mut ipc = SwayIpc::closed();
        ipc.send(IPC_GET_WORKSPACES, None);
        assert!(ipc.recv().is_none());
    }
}
