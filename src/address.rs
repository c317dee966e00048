use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::str::Split;
use std::string;
use std::vec;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum UnescapeError {
    ShortEscapeSequence,
    EscapeNotUtf8,
    HexConversionError,
}

impl From<hex::FromHexError> for UnescapeError {
    fn from(_: hex::FromHexError) -> Self {
        UnescapeError::HexConversionError
    }
}

impl From<string::FromUtf8Error> for UnescapeError {
    fn from(_: string::FromUtf8Error) -> Self {
        UnescapeError::EscapeNotUtf8
    }
}

fn dbus_unescape(buf: &[u8]) -> Result<Vec<u8>, UnescapeError> {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = buf.iter();
    while let Some(c) = i.next() {
        if *c == b'%' {
            let c1 = *i.next().ok_or(UnescapeError::ShortEscapeSequence)?;
            let c2 = *i.next().ok_or(UnescapeError::ShortEscapeSequence)?;
            let mut byte = [0u8; 1];
            hex::decode_to_slice([c1, c2], &mut byte)?;
            out.push(byte[0]);
        } else {
            out.push(*c);
        }
    }
    Ok(out)
}

fn dbus_unescape_str(s: &str) -> Result<String, UnescapeError> {
    let vec = dbus_unescape(s.as_bytes())?;
    String::from_utf8(vec).map_err(From::from)
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    UnescapeError(UnescapeError),
    BadTransportSeparator,
    MalformedKeyValue,
    UnknownTransport,
    UnknownOption,
    MissingOption,
    ConflictingOptions,
    BadOptionValue,
}

pub type ServerAddressError = (Error, String);

impl From<UnescapeError> for ServerAddressError {
    fn from(e: UnescapeError) -> Self {
        (Error::UnescapeError(e), "".to_owned())
    }
}

/// Iterator over key value pairs of the form "key=val,key=val"
struct AddrKeyVals<'a> {
    str: Split<'a, char>,
}

impl<'a> AddrKeyVals<'a> {
    fn new(s: &'a str) -> Self {
        AddrKeyVals { str: s.split(',') }
    }
}

impl<'a> Iterator for AddrKeyVals<'a> {
    type Item = Result<(String, String), ServerAddressError>;

    fn next(&mut self) -> Option<Self::Item> {
        let kvs = self.str.by_ref().find(|kv| !kv.is_empty())?;
        let (key, val) = match kvs.split_once('=') {
            Some((k, v)) if !k.is_empty() && !v.contains('=') => (k, v),
            _ => return Some(Err((Error::MalformedKeyValue, kvs.to_owned()))),
        };
        let key = match dbus_unescape_str(key) {
            Ok(k) => k,
            Err(e) => return Some(Err(From::from(e))),
        };
        let val = match dbus_unescape_str(val) {
            Ok(v) => v,
            Err(e) => return Some(Err(From::from(e))),
        };
        Some(Ok((key, val)))
    }
}

fn set_once(slot: &mut Option<String>, key: &str, val: String) -> Result<(), ServerAddressError> {
    if slot.is_some() {
        return Err((Error::ConflictingOptions, format!("Duplicate {} specified", key)));
    }
    *slot = Some(val);
    Ok(())
}

fn parse_bool(key: &str, val: &str) -> Result<bool, ServerAddressError> {
    match val {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err((Error::BadOptionValue, format!("{}={}", key, val))),
    }
}

/// A DBus Unix address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixAddress {
    path: PathBuf,
    abstract_name: bool,
    listen: bool,
    guid: Option<String>,
}

impl UnixAddress {
    /// Returns the Unix path, or the abstract name when `is_abstract()`
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn is_abstract(&self) -> bool {
        self.abstract_name
    }

    /// Whether the address names a socket to listen on rather than connect to
    pub fn listen(&self) -> bool {
        self.listen
    }
}

impl FromStr for UnixAddress {
    type Err = ServerAddressError;

    /// Constructs a UnixAddress from a key=value option string
    fn from_str(opts: &str) -> Result<Self, ServerAddressError> {
        let mut path = None;
        let mut abs = false;
        let mut listen = false;
        let mut guid = None;
        for kv in AddrKeyVals::new(opts) {
            let (key, val) = kv?;

            match key.as_ref() {
                "path" | "abstract" => {
                    if path.is_some() {
                        return Err((Error::ConflictingOptions,
                                    "Duplicate path/abstract specified".to_owned()));
                    }
                    abs = key == "abstract";
                    path = Some(val);
                }
                "listen" => listen = parse_bool(&key, &val)?,
                "guid" => set_once(&mut guid, &key, val)?,
                _ => return Err((Error::UnknownOption, key)),
            }
        }
        match path {
            None => Err((Error::MissingOption, "No path for unix socket".to_owned())),
            Some(path) => Ok(UnixAddress { path: PathBuf::from(path), abstract_name: abs, listen, guid }),
        }
    }
}

/// A DBus Tcp address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    host: String,
    port: String,
    family: Option<String>,
    guid: Option<String>,
}

impl TcpAddress {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl ToSocketAddrs for TcpAddress {
    type Iter = vec::IntoIter<SocketAddr>;
    /// Resolves the host, keeping only addresses of the requested family
    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        let addrs: Vec<SocketAddr> = (self.host.clone() + ":" + &self.port)
            .to_socket_addrs()?
            .filter(|a| match self.family.as_deref() {
                Some("ipv4") => a.is_ipv4(),
                Some("ipv6") => a.is_ipv6(),
                _ => true,
            })
            .collect();
        Ok(addrs.into_iter())
    }
}

impl FromStr for TcpAddress {
    type Err = ServerAddressError;

    /// Constructs a TcpAddress from a key=value option string
    fn from_str(opts: &str) -> Result<Self, ServerAddressError> {
        let mut host = None;
        let mut port = None;
        let mut family = None;
        let mut guid = None;
        for kv in AddrKeyVals::new(opts) {
            let (key, val) = kv?;

            match key.as_ref() {
                "host" => set_once(&mut host, &key, val)?,
                "port" => {
                    if val.parse::<u16>().is_err() {
                        return Err((Error::BadOptionValue, format!("port={}", val)));
                    }
                    set_once(&mut port, &key, val)?
                }
                "family" => {
                    if val != "ipv4" && val != "ipv6" {
                        return Err((Error::BadOptionValue, format!("family={}", val)));
                    }
                    set_once(&mut family, &key, val)?
                }
                "guid" => set_once(&mut guid, &key, val)?,
                _ => return Err((Error::UnknownOption, key)),
            }
        }
        match (host, port) {
            (None, _) => Err((Error::MissingOption, "No host for tcp socket".to_owned())),
            (_, None) => Err((Error::MissingOption, "No port for tcp socket".to_owned())),
            (Some(host), Some(port)) => Ok(TcpAddress { host, port, family, guid }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Unix(UnixAddress),
    Tcp(TcpAddress),
}

impl ServerAddress {
    /// The server guid the address pins, if any
    pub fn guid(&self) -> Option<&str> {
        match self {
            ServerAddress::Unix(u) => u.guid.as_deref(),
            ServerAddress::Tcp(t) => t.guid.as_deref(),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ServerAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, opts) = match s.split_once(':') {
            Some(parts) => parts,
            None => return Err((Error::BadTransportSeparator, s.to_owned())),
        };

        match transport {
            "unix" => Ok(ServerAddress::Unix(UnixAddress::from_str(opts)?)),
            "tcp" => Ok(ServerAddress::Tcp(TcpAddress::from_str(opts)?)),
            _ => Err((Error::UnknownTransport, transport.to_owned())),
        }
    }
}

/// Parses a `;` separated address list. Connecting tries the entries in order.
pub fn parse_address_list(s: &str) -> Result<Vec<ServerAddress>, ServerAddressError> {
    let addrs = s
        .split(';')
        .filter(|a| !a.is_empty())
        .map(ServerAddress::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    if addrs.is_empty() {
        return Err((Error::MissingOption, "Empty address list".to_owned()));
    }
    Ok(addrs)
}

#[test]
fn test_unescape() {
    assert_eq!(dbus_unescape(b"hello").unwrap(), b"hello");
    assert_eq!(dbus_unescape(b"\\").unwrap(), b"\\");
    assert_eq!(dbus_unescape(b"%61").unwrap(), b"a");
    assert_eq!(dbus_unescape(b"%5c").unwrap(), b"\\");
    assert_eq!(dbus_unescape(b"%").unwrap_err(), UnescapeError::ShortEscapeSequence);
    assert_eq!(dbus_unescape(b"%1").unwrap_err(), UnescapeError::ShortEscapeSequence);
    assert_eq!(dbus_unescape(b"%zz").unwrap_err(), UnescapeError::HexConversionError);
}

#[test]
fn test_key_vals() {
    let mut a = AddrKeyVals::new("one=two").map(Result::unwrap);
    assert_eq!(a.next().unwrap(), ("one".to_string(), "two".to_string()));
    assert_eq!(a.next(), None);

    let mut a = AddrKeyVals::new("foo=bar,").map(Result::unwrap);
    assert_eq!(a.next().unwrap(), ("foo".to_string(), "bar".to_string()));
    assert_eq!(a.next(), None);

    let mut a = AddrKeyVals::new("foo=bar,a=b").map(Result::unwrap);
    assert_eq!(a.next().unwrap(), ("foo".to_string(), "bar".to_string()));
    assert_eq!(a.next().unwrap(), ("a".to_string(), "b".to_string()));
    assert_eq!(a.next(), None);

    let mut a = AddrKeyVals::new("foobar,a=b");
    assert_eq!(a.next().unwrap().unwrap_err().0, Error::MalformedKeyValue);
}

#[test]
fn test_server_address() {
    assert_eq!(ServerAddress::from_str("unix").unwrap_err().0, Error::BadTransportSeparator);
    ServerAddress::from_str("unix:path=/var/run/dbus/system_bus_socket").unwrap();
    assert_eq!(ServerAddress::from_str("unix:path=/var/run/dbus/system_bus_socket,foo=bar").unwrap_err().0, Error::UnknownOption);
    assert_eq!(ServerAddress::from_str("unix:").unwrap_err().0, Error::MissingOption);
    assert_eq!(ServerAddress::from_str("unix:path=/a,abstract=b").unwrap_err().0, Error::ConflictingOptions);
    assert_eq!(ServerAddress::from_str("tcp:host=localhost").unwrap_err().0, Error::MissingOption);
    assert_eq!(ServerAddress::from_str("tcp:host=localhost,port=x").unwrap_err().0, Error::BadOptionValue);
    assert_eq!(ServerAddress::from_str("foo:bar=baz").unwrap_err().0, Error::UnknownTransport);
}

#[test]
fn test_unix_options() {
    let addr = ServerAddress::from_str("unix:abstract=/tmp/dbus-x,guid=0123abcd,listen=true").unwrap();
    assert_eq!(addr.guid(), Some("0123abcd"));
    match addr {
        ServerAddress::Unix(u) => {
            assert!(u.is_abstract());
            assert!(u.listen());
            assert_eq!(u.path(), Path::new("/tmp/dbus-x"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_address_list() {
    let addrs = parse_address_list("unix:path=/tmp/a;tcp:host=127.0.0.1,port=4000,family=ipv4;").unwrap();
    assert_eq!(addrs.len(), 2);
    match &addrs[1] {
        ServerAddress::Tcp(t) => {
            assert_eq!(t.host(), "127.0.0.1");
            assert_eq!(t.to_socket_addrs().unwrap().count(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(parse_address_list(";").is_err());
}
