//! SASL handshake run once per connection before any message is exchanged.
//!
//! Both sides are driven by the same [`Sasl`] state machine. The client walks
//! the mechanisms the server offers in the order EXTERNAL, DBUS_COOKIE_SHA1,
//! ANONYMOUS, skipping any that already failed; the server answers with the
//! mechanisms it is configured for.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, trace};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::transport::getuid;

pub const COOKIE_CONTEXT: &str = "org_freedesktop_general";
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Cookies older than this are dropped whenever the keyring is rewritten.
pub const COOKIE_TIMEOUT: i64 = 240;
pub const NEW_KEY_TIMEOUT: i64 = 60 * 5;
pub const EXPIRE_KEYS_TIMEOUT: i64 = NEW_KEY_TIMEOUT + 60 * 2;
pub const MAX_TIME_TRAVEL: i64 = 60 * 5;
const MAX_LINE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    External,
    CookieSha1,
    Anonymous,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::External => "EXTERNAL",
            Mechanism::CookieSha1 => "DBUS_COOKIE_SHA1",
            Mechanism::Anonymous => "ANONYMOUS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "EXTERNAL" => Some(Mechanism::External),
            "DBUS_COOKIE_SHA1" => Some(Mechanism::CookieSha1),
            "ANONYMOUS" => Some(Mechanism::Anonymous),
            _ => None,
        }
    }
}

/// Client preference order.
const PREFERENCE: [Mechanism; 3] = [Mechanism::External, Mechanism::CookieSha1, Mechanism::Anonymous];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMode {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    Initial,
    WaitData,
    WaitOk,
    WaitReject,
    WaitAuth,
    WaitBegin,
    Authenticated,
    NegotiateUnixFd,
    Finished,
    Failed,
}

/// One line of the SASL sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Mechanism name and decoded initial response.
    Auth(Option<String>, Option<Vec<u8>>),
    Data(Vec<u8>),
    Rejected(Vec<String>),
    Ok(String),
    Begin,
    Cancel,
    Error(String),
    NegotiateUnixFd,
    AgreeUnixFd,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        let (word, rest) = match line.split_once(' ') {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let decode = |s: &str| hex::decode(s).ok();
        match word {
            "AUTH" => {
                let mut parts = rest.split_whitespace();
                let mech = parts.next().map(str::to_owned);
                let data = parts.next().and_then(decode);
                Command::Auth(mech, data)
            }
            "DATA" => match decode(rest) {
                Some(d) => Command::Data(d),
                None => Command::Unknown(line.to_owned()),
            },
            "REJECTED" => Command::Rejected(rest.split_whitespace().map(str::to_owned).collect()),
            "OK" => Command::Ok(rest.to_owned()),
            "BEGIN" => Command::Begin,
            "CANCEL" => Command::Cancel,
            "ERROR" => Command::Error(rest.to_owned()),
            "NEGOTIATE_UNIX_FD" => Command::NegotiateUnixFd,
            "AGREE_UNIX_FD" => Command::AgreeUnixFd,
            _ => Command::Unknown(line.to_owned()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Auth(None, _) => f.write_str("AUTH"),
            Command::Auth(Some(m), None) => write!(f, "AUTH {}", m),
            Command::Auth(Some(m), Some(d)) => write!(f, "AUTH {} {}", m, hex::encode(d)),
            Command::Data(d) => write!(f, "DATA {}", hex::encode(d)),
            Command::Rejected(m) => write!(f, "REJECTED {}", m.join(" ")),
            Command::Ok(guid) => write!(f, "OK {}", guid),
            Command::Begin => f.write_str("BEGIN"),
            Command::Cancel => f.write_str("CANCEL"),
            Command::Error(m) if m.is_empty() => f.write_str("ERROR"),
            Command::Error(m) => write!(f, "ERROR {}", m),
            Command::NegotiateUnixFd => f.write_str("NEGOTIATE_UNIX_FD"),
            Command::AgreeUnixFd => f.write_str("AGREE_UNIX_FD"),
            Command::Unknown(s) => f.write_str(s),
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn sha1_hex(s: &str) -> String {
    hex::encode(Sha1::digest(s.as_bytes()))
}

/// Per-user cookie store: one file per context, lines of `id timestamp cookie`.
#[derive(Debug, Clone)]
pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Keyring { dir: dir.into() }
    }

    /// `$HOME/.dbus-keyrings`, or the configured override.
    pub fn for_config(config: &AuthConfig) -> Result<Self> {
        if let Some(dir) = &config.keyring_dir {
            return Ok(Keyring::new(dir.clone()));
        }
        match std::env::var_os("HOME") {
            Some(home) => Ok(Keyring::new(PathBuf::from(home).join(".dbus-keyrings"))),
            None => Err(Error::AuthenticationFailure("no home directory for the cookie keyring".into())),
        }
    }

    fn parse_line(line: &str) -> Option<(&str, i64, &str)> {
        let mut words = line.split(' ');
        let id = words.next()?;
        let timestamp = words.next()?.parse().ok()?;
        let cookie = words.next()?;
        Some((id, timestamp, cookie))
    }

    /// Looks up a cookie, ignoring entries with implausible timestamps.
    pub fn find_cookie(&self, context: &str, id: &str) -> Result<Option<String>> {
        let f = match File::open(self.dir.join(context)) {
            Ok(f) => f,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let now = now_secs();
        for line in BufReader::new(f).lines() {
            let line = line?;
            if let Some((line_id, timestamp, cookie)) = Keyring::parse_line(&line) {
                let implausible = timestamp < 0
                    || now + MAX_TIME_TRAVEL < timestamp
                    || now - EXPIRE_KEYS_TIMEOUT > timestamp;
                if line_id == id && !implausible {
                    return Ok(Some(cookie.to_owned()));
                }
            }
        }
        Ok(None)
    }

    fn lock(&self, context: &str) -> Result<PathBuf> {
        let lock = self.dir.join(format!("{}.lock", context));
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock) {
                Ok(_) => return Ok(lock),
                Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        // Stale lock left by a dead process
                        debug!("breaking stale keyring lock {}", lock.display());
                        fs::remove_file(&lock)?;
                        OpenOptions::new().write(true).create_new(true).open(&lock)?;
                        return Ok(lock);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Appends a cookie, dropping entries older than the cookie timeout.
    pub fn add_cookie(&self, context: &str, id: &str, timestamp: i64, cookie: &str) -> Result<()> {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&self.dir)?;
        let lock = self.lock(context)?;
        let result = self.rewrite(context, id, timestamp, cookie);
        fs::remove_file(&lock)?;
        result
    }

    fn rewrite(&self, context: &str, id: &str, timestamp: i64, cookie: &str) -> Result<()> {
        let path = self.dir.join(context);
        let mut lines = Vec::new();
        if let Ok(f) = File::open(&path) {
            for line in BufReader::new(f).lines() {
                let line = line?;
                if let Some((_, time, _)) = Keyring::parse_line(&line) {
                    if timestamp - time < COOKIE_TIMEOUT {
                        lines.push(line);
                    }
                }
            }
        }
        lines.push(format!("{} {} {}", id, timestamp, cookie));

        let temp = self.dir.join(format!("{}.temp", context));
        {
            let mut w = File::create(&temp)?;
            for l in &lines {
                writeln!(w, "{}", l)?;
            }
            w.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }
}

/// What the handshake settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub mechanism: Option<Mechanism>,
    /// Server guid (client side) or the guid we sent (server side).
    pub guid: String,
    pub unix_fd: bool,
}

enum Step {
    Continue(Vec<u8>),
    Ok,
    Reject,
    Error,
}

pub struct Sasl<'a> {
    mode: SaslMode,
    config: &'a AuthConfig,
    state: SaslState,
    failed: Vec<Mechanism>,
    current: Option<Mechanism>,
    uid: String,
    kernel_uid: Option<String>,
    guid: String,
    challenge: String,
    cookie: String,
    unix_fd: bool,
}

impl<'a> Sasl<'a> {
    pub fn client(config: &'a AuthConfig) -> Self {
        Sasl::new(SaslMode::Client, config, None)
    }

    /// `kernel_uid` is the peer credential reported by the transport, if any.
    pub fn server(config: &'a AuthConfig, kernel_uid: Option<u32>) -> Self {
        Sasl::new(SaslMode::Server, config, kernel_uid)
    }

    fn new(mode: SaslMode, config: &'a AuthConfig, kernel_uid: Option<u32>) -> Self {
        let uid = config.uid.unwrap_or_else(getuid);
        Sasl {
            mode,
            config,
            state: SaslState::Initial,
            failed: Vec::new(),
            current: None,
            uid: uid.to_string(),
            kernel_uid: kernel_uid.map(|k| k.to_string()),
            guid: config.guid.clone().unwrap_or_else(|| random_hex(16)),
            challenge: String::new(),
            cookie: String::new(),
            unix_fd: false,
        }
    }

    pub fn state(&self) -> SaslState {
        self.state
    }

    fn send<W: Write + ?Sized>(&self, out: &mut W, cmd: Command) -> Result<()> {
        trace!("{:?} sending: {}", self.mode, cmd);
        out.write_all(format!("{}\r\n", cmd).as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn receive<R: Read + ?Sized>(&self, input: &mut R) -> Result<Command> {
        let line = read_line(input)?;
        trace!("{:?} received: {}", self.mode, line.trim_end());
        Ok(Command::parse(&line))
    }

    /// Runs the handshake to completion. The stream is left positioned right
    /// after `BEGIN`, ready for the first message.
    pub fn authenticate<S: Read + Write + ?Sized>(&mut self, sock: &mut S) -> Result<AuthOutcome> {
        while self.state != SaslState::Finished && self.state != SaslState::Failed {
            trace!("Mode: {:?} AUTH state: {:?}", self.mode, self.state);
            let step = match self.mode {
                SaslMode::Client => self.client_step(sock),
                SaslMode::Server => self.server_step(sock),
            };
            if let Err(e) = step {
                debug!("SASL {:?} aborted in {:?}: {}", self.mode, self.state, e);
                self.state = SaslState::Failed;
            }
        }
        if self.state == SaslState::Failed {
            return Err(Error::AuthenticationFailure(match self.mode {
                SaslMode::Client => "no offered mechanism succeeded".to_owned(),
                SaslMode::Server => "client did not authenticate".to_owned(),
            }));
        }
        Ok(AuthOutcome { mechanism: self.current, guid: self.guid.clone(), unix_fd: self.unix_fd })
    }

    fn try_next_mechanism<W: Write + ?Sized>(&mut self, out: &mut W, offered: &[String]) -> Result<()> {
        if let Some(m) = self.current.take() {
            self.failed.push(m);
        }
        let next = PREFERENCE.iter().cloned().find(|m| {
            self.config.mechanisms.contains(m)
                && !self.failed.contains(m)
                && offered.iter().any(|o| o == m.name())
        });
        match next {
            Some(m) => {
                let data = match m {
                    Mechanism::Anonymous => None,
                    _ => Some(self.uid.clone().into_bytes()),
                };
                self.send(out, Command::Auth(Some(m.name().to_owned()), data))?;
                self.current = Some(m);
                self.state = SaslState::WaitData;
            }
            None => self.state = SaslState::Failed,
        }
        Ok(())
    }

    fn authenticated<W: Write + ?Sized>(&mut self, out: &mut W, guid: String) -> Result<()> {
        debug!("Authenticated with {:?}", self.current);
        self.guid = guid;
        self.state = SaslState::Authenticated;
        if self.config.unix_fd {
            trace!("Asking for file descriptor support");
            self.send(out, Command::NegotiateUnixFd)?;
            self.state = SaslState::NegotiateUnixFd;
        } else {
            self.send(out, Command::Begin)?;
            self.state = SaslState::Finished;
        }
        Ok(())
    }

    fn client_step<S: Read + Write + ?Sized>(&mut self, sock: &mut S) -> Result<()> {
        match self.state {
            SaslState::Initial => {
                sock.write_all(&[0])?;
                self.send(sock, Command::Auth(None, None))?;
                self.state = SaslState::WaitData;
            }
            SaslState::WaitData => match self.receive(sock)? {
                Command::Data(data) => match self.do_challenge(&data) {
                    Ok(response) => {
                        self.send(sock, Command::Data(response))?;
                        self.state = SaslState::WaitOk;
                    }
                    Err(e) => {
                        debug!("challenge failed: {}", e);
                        self.send(sock, Command::Error(String::new()))?;
                    }
                },
                Command::Rejected(offered) => self.try_next_mechanism(sock, &offered)?,
                Command::Error(_) => {
                    self.send(sock, Command::Cancel)?;
                    self.state = SaslState::WaitReject;
                }
                Command::Ok(guid) => self.authenticated(sock, guid)?,
                _ => self.send(sock, Command::Error("Got invalid command".into()))?,
            },
            SaslState::WaitOk => match self.receive(sock)? {
                Command::Ok(guid) => self.authenticated(sock, guid)?,
                Command::Error(_) | Command::Data(_) => {
                    self.send(sock, Command::Cancel)?;
                    self.state = SaslState::WaitReject;
                }
                Command::Rejected(offered) => self.try_next_mechanism(sock, &offered)?,
                _ => self.send(sock, Command::Error("Got invalid command".into()))?,
            },
            SaslState::WaitReject => match self.receive(sock)? {
                Command::Rejected(offered) => self.try_next_mechanism(sock, &offered)?,
                _ => self.state = SaslState::Failed,
            },
            SaslState::NegotiateUnixFd => match self.receive(sock)? {
                Command::AgreeUnixFd => {
                    trace!("File descriptors supported by server");
                    self.unix_fd = true;
                    self.send(sock, Command::Begin)?;
                    self.state = SaslState::Finished;
                }
                Command::Error(_) => {
                    trace!("File descriptors NOT supported by server");
                    self.unix_fd = false;
                    self.send(sock, Command::Begin)?;
                    self.state = SaslState::Finished;
                }
                _ => self.state = SaslState::Failed,
            },
            _ => self.state = SaslState::Failed,
        }
        Ok(())
    }

    /// Client side of DBUS_COOKIE_SHA1: answers `context id challenge`.
    fn do_challenge(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.current != Some(Mechanism::CookieSha1) {
            return Err(Error::AuthenticationFailure("unexpected DATA".into()));
        }
        let text = String::from_utf8_lossy(data);
        let reply: Vec<&str> = text.split(' ').collect();
        if reply.len() != 3 {
            return Err(Error::AuthenticationFailure("Reply is not length 3".into()));
        }
        let (context, id, server_challenge) = (reply[0], reply[1], reply[2]);
        if context.contains('/') || context.contains('.') {
            return Err(Error::AuthenticationFailure(format!("bad cookie context {:?}", context)));
        }
        let keyring = Keyring::for_config(self.config)?;
        let start = Instant::now();
        let cookie = loop {
            if let Some(c) = keyring.find_cookie(context, id)? {
                break c;
            }
            if start.elapsed() > LOCK_TIMEOUT {
                return Err(Error::AuthenticationFailure(format!(
                    "Did not find a cookie in context {} with ID {}", context, id)));
            }
            thread::sleep(Duration::from_millis(10));
        };
        let client_challenge = random_hex(16);
        let hash = sha1_hex(&format!("{}:{}:{}", server_challenge, client_challenge, cookie));
        Ok(format!("{} {}", client_challenge, hash).into_bytes())
    }

    fn server_step<S: Read + Write + ?Sized>(&mut self, sock: &mut S) -> Result<()> {
        match self.state {
            SaslState::Initial => {
                let mut nul = [0u8; 1];
                sock.read_exact(&mut nul)?;
                if nul[0] != 0 {
                    self.state = SaslState::Failed;
                } else {
                    self.state = SaslState::WaitAuth;
                }
            }
            SaslState::WaitAuth => match self.receive(sock)? {
                Command::Auth(mech, data) => {
                    let mech = mech.as_deref().and_then(Mechanism::from_name)
                        .filter(|m| self.config.mechanisms.contains(m));
                    self.current = mech;
                    let step = match mech {
                        Some(m) => self.do_response(m, data.as_deref()),
                        None => Step::Reject,
                    };
                    self.respond(sock, step)?;
                }
                Command::Error(_) => self.reject(sock)?,
                Command::Begin => self.state = SaslState::Failed,
                _ => self.send(sock, Command::Error("Got invalid command".into()))?,
            },
            SaslState::WaitData => match self.receive(sock)? {
                Command::Data(data) => {
                    let step = match self.current {
                        Some(Mechanism::CookieSha1) => self.check_cookie_response(&data),
                        _ => Step::Error,
                    };
                    self.respond(sock, step)?;
                }
                Command::Error(_) | Command::Cancel => self.reject(sock)?,
                Command::Begin => self.state = SaslState::Failed,
                _ => self.send(sock, Command::Error("Got invalid command".into()))?,
            },
            SaslState::WaitBegin => match self.receive(sock)? {
                Command::Begin => self.state = SaslState::Finished,
                Command::Error(_) | Command::Cancel => self.reject(sock)?,
                Command::NegotiateUnixFd => {
                    debug!("File descriptor negotiation requested");
                    if self.config.unix_fd {
                        self.unix_fd = true;
                        self.send(sock, Command::AgreeUnixFd)?;
                    } else {
                        self.send(sock, Command::Error(String::new()))?;
                    }
                }
                _ => self.send(sock, Command::Error("Got invalid command".into()))?,
            },
            _ => self.state = SaslState::Failed,
        }
        Ok(())
    }

    fn reject<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<()> {
        let offered = self.config.mechanisms.iter().map(|m| m.name().to_owned()).collect();
        self.send(out, Command::Rejected(offered))?;
        self.state = SaslState::WaitAuth;
        Ok(())
    }

    fn respond<W: Write + ?Sized>(&mut self, out: &mut W, step: Step) -> Result<()> {
        match step {
            Step::Continue(data) => {
                self.send(out, Command::Data(data))?;
                self.state = SaslState::WaitData;
            }
            Step::Ok => {
                self.send(out, Command::Ok(self.guid.clone()))?;
                self.state = SaslState::WaitBegin;
            }
            Step::Reject | Step::Error => self.reject(out)?,
        }
        Ok(())
    }

    /// Server side handling of the initial response for `mech`.
    fn do_response(&mut self, mech: Mechanism, data: Option<&[u8]>) -> Step {
        match mech {
            Mechanism::Anonymous => Step::Ok,
            Mechanism::External => {
                let asserted = data.map(String::from_utf8_lossy);
                let matches = asserted.as_deref() == Some(self.uid.as_str())
                    && self.kernel_uid.as_ref().map_or(true, |k| *k == self.uid);
                if matches { Step::Ok } else { Step::Reject }
            }
            Mechanism::CookieSha1 => {
                let keyring = match Keyring::for_config(self.config) {
                    Ok(k) => k,
                    Err(_) => return Step::Error,
                };
                let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
                let id = now.as_millis().to_string();
                self.challenge = random_hex(16);
                self.cookie = random_hex(24);
                if let Err(e) = keyring.add_cookie(COOKIE_CONTEXT, &id, now.as_secs() as i64, &self.cookie) {
                    debug!("could not write cookie: {}", e);
                    return Step::Error;
                }
                debug!("Sending challenge: {} {} {}", COOKIE_CONTEXT, id, self.challenge);
                Step::Continue(format!("{} {} {}", COOKIE_CONTEXT, id, self.challenge).into_bytes())
            }
        }
    }

    fn check_cookie_response(&self, data: &[u8]) -> Step {
        let text = String::from_utf8_lossy(data);
        let response: Vec<&str> = text.split(' ').collect();
        if response.len() < 2 {
            return Step::Error;
        }
        let expected = sha1_hex(&format!("{}:{}:{}", self.challenge, response[0], self.cookie));
        debug!("Authenticating Hash; remote-hash={} local-hash={}", response[1], expected);
        if expected.eq_ignore_ascii_case(response[1]) { Step::Ok } else { Step::Error }
    }
}

/// Reads one CR-LF terminated line a byte at a time, so nothing past the
/// handshake is consumed from the stream.
fn read_line<R: Read + ?Sized>(sock: &mut R) -> Result<String> {
    let mut line = Vec::new();
    let mut buf = [0u8; 1];
    loop {
        if sock.read(&mut buf)? == 0 {
            return Err(Error::NotConnected);
        }
        line.push(buf[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(Error::AuthenticationFailure("SASL line too long".into()));
        }
    }
    String::from_utf8(line).map_err(|_| Error::AuthenticationFailure("SASL line is not UTF-8".into()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn run_pair(client: AuthConfig, server: AuthConfig, kernel_uid: Option<u32>)
            -> (Result<AuthOutcome>, SaslState, Result<AuthOutcome>, SaslState) {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            let mut sasl = Sasl::server(&server, kernel_uid);
            let r = sasl.authenticate(&mut b);
            (r, sasl.state())
        });
        let mut sasl = Sasl::client(&client);
        let r = sasl.authenticate(&mut a);
        let state = sasl.state();
        drop(a);
        let (sr, sstate) = server_thread.join().unwrap();
        (r, state, sr, sstate)
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(Command::parse("AUTH EXTERNAL 31303030\r\n"),
                   Command::Auth(Some("EXTERNAL".into()), Some(b"1000".to_vec())));
        assert_eq!(Command::parse("AUTH\r\n"), Command::Auth(None, None));
        assert_eq!(Command::parse("REJECTED EXTERNAL ANONYMOUS\r\n"),
                   Command::Rejected(vec!["EXTERNAL".into(), "ANONYMOUS".into()]));
        assert_eq!(Command::parse("OK 1234abcd\r\n"), Command::Ok("1234abcd".into()));
        assert_eq!(Command::Data(b"hi".to_vec()).to_string(), "DATA 6869");
        assert_eq!(Command::Auth(Some("EXTERNAL".into()), Some(b"0".to_vec())).to_string(), "AUTH EXTERNAL 30");
        assert!(matches!(Command::parse("FROB\r\n"), Command::Unknown(_)));
    }

    #[test]
    fn test_external_matching_uid() {
        let client = AuthConfig::default().uid(1000);
        let server = AuthConfig::default().uid(1000).guid("0123456789abcdef");
        let (r, state, sr, sstate) = run_pair(client, server, Some(1000));
        let outcome = r.unwrap();
        assert_eq!(state, SaslState::Finished);
        assert_eq!(outcome.mechanism, Some(Mechanism::External));
        assert_eq!(outcome.guid, "0123456789abcdef");
        assert!(sr.is_ok());
        assert_eq!(sstate, SaslState::Finished);
    }

    #[test]
    fn test_external_mismatch_fails() {
        let client = AuthConfig::default().uid(1000);
        let server = AuthConfig::default().uid(1001).mechanisms(&[Mechanism::External]);
        let (r, state, sr, sstate) = run_pair(client, server, None);
        assert!(matches!(r, Err(Error::AuthenticationFailure(_))));
        assert_eq!(state, SaslState::Failed);
        assert!(sr.is_err());
        assert_eq!(sstate, SaslState::Failed);
    }

    #[test]
    fn test_kernel_uid_must_match() {
        let client = AuthConfig::default().uid(1000).mechanisms(&[Mechanism::External]);
        let server = AuthConfig::default().uid(1000);
        let (r, state, _, _) = run_pair(client, server, Some(0));
        assert!(r.is_err());
        assert_eq!(state, SaslState::Failed);
    }

    #[test]
    fn test_falls_back_to_anonymous() {
        let client = AuthConfig::default().uid(5);
        let server = AuthConfig::default().uid(6).mechanisms(&[Mechanism::External, Mechanism::Anonymous]);
        let (r, state, sr, _) = run_pair(client, server, None);
        assert_eq!(r.unwrap().mechanism, Some(Mechanism::Anonymous));
        assert_eq!(state, SaslState::Finished);
        assert!(sr.is_ok());
    }

    #[test]
    fn test_cookie_sha1() {
        let dir = tempfile::tempdir().unwrap();
        let client = AuthConfig::default().keyring_dir(dir.path()).mechanisms(&[Mechanism::CookieSha1]);
        let server = AuthConfig::default().keyring_dir(dir.path()).mechanisms(&[Mechanism::CookieSha1]);
        let (r, state, sr, sstate) = run_pair(client, server, None);
        assert_eq!(r.unwrap().mechanism, Some(Mechanism::CookieSha1));
        assert_eq!(state, SaslState::Finished);
        assert!(sr.is_ok());
        assert_eq!(sstate, SaslState::Finished);
        assert!(dir.path().join(COOKIE_CONTEXT).exists());
        assert!(!dir.path().join(format!("{}.lock", COOKIE_CONTEXT)).exists());
    }

    #[test]
    fn test_unix_fd_negotiation() {
        let client = AuthConfig::default().uid(7).unix_fd(true);
        let server = AuthConfig::default().uid(7).unix_fd(false);
        let (r, state, sr, _) = run_pair(client, server, None);
        assert!(!r.unwrap().unix_fd);
        assert_eq!(state, SaslState::Finished);
        assert!(sr.is_ok());

        let client = AuthConfig::default().uid(7).unix_fd(true);
        let server = AuthConfig::default().uid(7).unix_fd(true);
        let (r, _, sr, _) = run_pair(client, server, None);
        assert!(r.unwrap().unix_fd);
        assert!(sr.unwrap().unix_fd);
    }

    #[test]
    fn test_keyring_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = Keyring::new(dir.path());
        let now = now_secs();
        keyring.add_cookie("ctx", "1", now - 1000, "old").unwrap();
        keyring.add_cookie("ctx", "3", now + 3600, "future").unwrap();
        keyring.add_cookie("ctx", "2", now, "fresh").unwrap();
        // the stale entry was dropped on rewrite
        let contents = fs::read_to_string(dir.path().join("ctx")).unwrap();
        assert!(!contents.contains("old"));
        assert_eq!(keyring.find_cookie("ctx", "1").unwrap(), None);
        assert_eq!(keyring.find_cookie("ctx", "2").unwrap(), Some("fresh".to_owned()));
        assert_eq!(keyring.find_cookie("ctx", "3").unwrap(), None);
        assert_eq!(keyring.find_cookie("missing", "2").unwrap(), None);
    }
}
