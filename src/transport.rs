//! Byte-stream transports carrying framed messages.
//!
//! A [`Transport`] is a pair of one [`MessageReader`] and one
//! [`MessageWriter`]; the connection engine gives the reader to its reader
//! thread and the writer to the serialized sender. Socket-backed transports
//! share one cloned socket between the two halves, and closing either half
//! shuts the socket down so a read blocked in the other half returns.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;

use crate::address::{self, ServerAddress, UnixAddress};
use crate::error::{Error, Result};
use crate::message::{read_message, Message};

/// Blocking source of inbound frames.
pub trait MessageReader: Send {
    fn read_message(&mut self) -> Result<Message>;
    fn close(&mut self) -> Result<()>;
}

/// Blocking sink for outbound frames.
pub trait MessageWriter: Send {
    fn write_message(&mut self, msg: &Message) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub struct Transport {
    pub reader: Box<dyn MessageReader>,
    pub writer: Box<dyn MessageWriter>,
}

impl Transport {
    pub fn new(reader: Box<dyn MessageReader>, writer: Box<dyn MessageWriter>) -> Self {
        Transport { reader, writer }
    }

    /// Splits an authenticated socket into its reader and writer halves.
    pub fn from_socket(sock: Socket) -> Result<Self> {
        let read_half = sock.try_clone()?;
        Ok(Transport {
            reader: Box::new(SocketReader { sock: BufReader::new(read_half) }),
            writer: Box::new(SocketWriter { sock: BufWriter::new(sock) }),
        })
    }
}

#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Uds(UnixStream),
}

impl Socket {
    pub fn try_clone(&self) -> io::Result<Socket> {
        match self {
            Socket::Tcp(s) => s.try_clone().map(Socket::Tcp),
            Socket::Uds(s) => s.try_clone().map(Socket::Uds),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let r = match self {
            Socket::Tcp(s) => s.shutdown(Shutdown::Both),
            Socket::Uds(s) => s.shutdown(Shutdown::Both),
        };
        match r {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Kernel-verified uid of the peer, where the platform reports one.
    pub fn peer_uid(&self) -> Option<u32> {
        match self {
            Socket::Uds(s) => peer_uid(s),
            Socket::Tcp(_) => None,
        }
    }

    fn get_sock(&mut self) -> &mut dyn ReadWrite {
        match self {
            Socket::Tcp(x) => x,
            Socket::Uds(x) => x,
        }
    }
}

trait ReadWrite: Read + Write {}
impl<T: Read + Write> ReadWrite for T {}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.get_sock().read(buf)
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.get_sock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.get_sock().flush()
    }
}

struct SocketReader {
    sock: BufReader<Socket>,
}

impl MessageReader for SocketReader {
    fn read_message(&mut self) -> Result<Message> {
        read_message(&mut self.sock)
    }

    fn close(&mut self) -> Result<()> {
        Ok(self.sock.get_ref().shutdown()?)
    }
}

struct SocketWriter {
    sock: BufWriter<Socket>,
}

impl MessageWriter for SocketWriter {
    fn write_message(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.encode()?;
        self.sock.write_all(&bytes)?;
        self.sock.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Best effort flush; the peer may already be gone
        let _ = self.sock.flush();
        Ok(self.sock.get_ref().shutdown()?)
    }
}

pub fn getuid() -> u32 {
    unsafe { libc::getuid() as u32 }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_uid(sock: &UnixStream) -> Option<u32> {
    use std::mem;
    use std::os::unix::io::AsRawFd;

    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 { Some(cred.uid) } else { None }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_uid(_sock: &UnixStream) -> Option<u32> {
    None
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &[u8]) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
    UnixStream::connect_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &[u8]) -> io::Result<UnixStream> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "abstract unix sockets need Linux"))
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &[u8]) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
    UnixListener::bind_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &[u8]) -> io::Result<UnixListener> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "abstract unix sockets need Linux"))
}

fn unix_name(unix: &UnixAddress) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    unix.path().as_os_str().as_bytes().to_vec()
}

/// Opens a socket to one parsed address.
pub fn connect_addr(addr: &ServerAddress) -> Result<Socket> {
    match addr {
        ServerAddress::Unix(unix) if unix.is_abstract() => Ok(Socket::Uds(connect_abstract(&unix_name(unix))?)),
        ServerAddress::Unix(unix) => Ok(Socket::Uds(UnixStream::connect(unix.path())?)),
        ServerAddress::Tcp(tcp) => Ok(Socket::Tcp(TcpStream::connect(tcp)?)),
    }
}

/// Connects to the first reachable entry of a `;` separated address list.
/// Returns the socket with the address it was opened from.
pub fn connect(addresses: &str) -> Result<(Socket, ServerAddress)> {
    let mut last_err = None;
    for addr in address::parse_address_list(addresses)? {
        match connect_addr(&addr) {
            Ok(sock) => return Ok((sock, addr)),
            Err(e) => {
                debug!("could not connect to {:?}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(Error::NotConnected))
}

enum ListenerSocket {
    Tcp(TcpListener),
    Uds(UnixListener, Option<PathBuf>),
}

/// A bound listening address accepting peer connections.
pub struct Listener {
    sock: ListenerSocket,
    address: ServerAddress,
}

impl Listener {
    /// Binds a `unix:` or `tcp:` address. A stale socket file at a `unix:path`
    /// address is replaced.
    pub fn bind(address: &str) -> Result<Listener> {
        let addr = ServerAddress::from_str(address)?;
        let sock = match &addr {
            ServerAddress::Unix(unix) if unix.is_abstract() => {
                ListenerSocket::Uds(bind_abstract(&unix_name(unix))?, None)
            }
            ServerAddress::Unix(unix) => {
                let path = unix.path().to_path_buf();
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                ListenerSocket::Uds(UnixListener::bind(&path)?, Some(path))
            }
            ServerAddress::Tcp(tcp) => ListenerSocket::Tcp(TcpListener::bind(tcp)?),
        };
        Ok(Listener { sock, address: addr })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Local port of a TCP listener; useful when binding port 0.
    pub fn local_port(&self) -> Option<u16> {
        match &self.sock {
            ListenerSocket::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
            ListenerSocket::Uds(..) => None,
        }
    }

    /// Blocks for the next raw, unauthenticated peer socket.
    pub fn accept_socket(&self) -> Result<Socket> {
        match &self.sock {
            ListenerSocket::Tcp(l) => Ok(Socket::Tcp(l.accept()?.0)),
            ListenerSocket::Uds(l, _) => Ok(Socket::Uds(l.accept()?.0)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenerSocket::Uds(_, Some(path)) = &self.sock {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::create_signal;

    #[test]
    fn test_socket_transport_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut ta = Transport::from_socket(Socket::Uds(a)).unwrap();
        let mut tb = Transport::from_socket(Socket::Uds(b)).unwrap();
        let mut sig = create_signal("/a", "org.foo", "Bar").add_arg(5u32);
        sig.serial = 3;
        ta.writer.write_message(&sig).unwrap();
        let got = tb.reader.read_message().unwrap();
        assert_eq!(got.member(), Some("Bar"));
        assert_eq!(got.body, sig.body);

        // closing the writer unblocks the peer's reader with an error
        ta.writer.close().unwrap();
        assert!(tb.reader.read_message().is_err());
    }

    #[test]
    fn test_peer_uid() {
        let (a, _b) = UnixStream::pair().unwrap();
        let sock = Socket::Uds(a);
        if cfg!(target_os = "linux") {
            assert_eq!(sock.peer_uid(), Some(getuid()));
        }
    }

    #[test]
    fn test_listener_unix_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus");
        let listener = Listener::bind(&format!("unix:path={}", path.display())).unwrap();
        let client = std::thread::spawn({
            let path = path.clone();
            move || connect(&format!("unix:path=/nonexistent/x;unix:path={}", path.display())).map(|_| ())
        });
        listener.accept_socket().unwrap();
        client.join().unwrap().unwrap();
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_listener_tcp_port_zero() {
        let listener = Listener::bind("tcp:host=127.0.0.1,port=0").unwrap();
        let port = listener.local_port().unwrap();
        assert_ne!(port, 0);
        let client = std::thread::spawn(move || connect(&format!("tcp:host=127.0.0.1,port={}", port)).map(|_| ()));
        listener.accept_socket().unwrap();
        client.join().unwrap().unwrap();
    }
}
