//! AP control-socket backend.
//!
//! Speaks the hostapd control-interface protocol over unix datagram
//! sockets: requests are single text lines, replies are one or more
//! `key=value` lines, and unsolicited events are single lines pushed to an
//! `ATTACH`ed socket, optionally prefixed with a `<level>` tag.
//!
//! Two sockets are involved. Commands open a fresh short-lived socket per
//! request; the notification stream uses a separate socket opened lazily on
//! the first [`Backend::pump_async`] call and reused afterwards. Opens are
//! serialised process-wide; the control endpoint's accept path is not
//! re-entrant.

use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use halow_dcs_core::{Backend, BackendError, DataItem, ItemList, LogSink};

/// How long a command socket waits for the AP's reply.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest reply or event frame we accept.
const REPLY_BUF_LEN: usize = 4096;

/// Serialises every control-socket open in the process.
static OPEN_LOCK: Mutex<()> = Mutex::new(());

/// Distinguishes concurrently bound local socket paths.
static SOCKET_SEQ: AtomicU32 = AtomicU32::new(0);

/// Builds the request tree for a single-line control-socket command.
pub fn text_request(line: &str) -> ItemList {
    vec![DataItem::with_str(line, line)]
}

/// One bound-and-connected control socket with its local endpoint path.
struct CtrlSocket {
    socket: UnixDatagram,
    local_path: PathBuf,
}

impl CtrlSocket {
    /// Opens a datagram socket bound to a fresh local path and connected to
    /// the control endpoint.
    fn open(target: &Path, read_timeout: Duration) -> io::Result<Self> {
        let _serialised = OPEN_LOCK.lock();

        let local_path = std::env::temp_dir().join(format!(
            "halow_dcs_{}-{}",
            process::id(),
            SOCKET_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_file(&local_path);

        let socket = UnixDatagram::bind(&local_path)?;
        socket.connect(target)?;
        socket.set_read_timeout(Some(read_timeout))?;

        Ok(Self { socket, local_path })
    }

    fn send_line(&self, line: &str) -> io::Result<()> {
        self.socket.send(line.as_bytes()).map(|_| ())
    }

    fn recv_text(&self) -> io::Result<String> {
        let mut buf = [0u8; REPLY_BUF_LEN];
        let len = self.socket.recv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }
}

impl Drop for CtrlSocket {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.local_path);
    }
}

/// The AP control-socket backend.
pub struct HostapdBackend {
    ctrl_path: PathBuf,
    monitor: Mutex<Option<CtrlSocket>>,
    sink: Arc<dyn LogSink>,
}

impl HostapdBackend {
    /// Creates a backend for the control socket at `ctrl_path`. Nothing is
    /// opened until the first request or pump.
    pub fn new(ctrl_path: impl Into<PathBuf>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            ctrl_path: ctrl_path.into(),
            monitor: Mutex::new(None),
            sink,
        }
    }

    /// Opens and `ATTACH`es the notification socket.
    fn open_monitor(&self, timeout: Duration) -> Result<CtrlSocket, BackendError> {
        let socket = CtrlSocket::open(&self.ctrl_path, timeout)
            .map_err(|e| BackendError::io("hostapd", e))?;

        socket
            .send_line("ATTACH")
            .map_err(|e| BackendError::io("hostapd", e))?;
        let reply = socket
            .recv_text()
            .map_err(|e| BackendError::io("hostapd", e))?;
        if !reply.starts_with("OK") {
            return Err(BackendError::protocol(
                "hostapd",
                format!("ATTACH refused: {}", reply.trim()),
            ));
        }

        debug!(path = %self.ctrl_path.display(), "attached to control socket notifications");
        Ok(socket)
    }
}

impl Backend for HostapdBackend {
    fn name(&self) -> &'static str {
        "hostapd"
    }

    fn submit_blocking(&self, request: &ItemList) -> Result<ItemList, BackendError> {
        let line = request
            .first()
            .and_then(DataItem::value_str)
            .ok_or_else(|| BackendError::protocol("hostapd", "request carries no command line"))?;

        if self.sink.is_enabled() {
            self.sink.write_line(&format!("Tx {line}"));
        }

        let socket = CtrlSocket::open(&self.ctrl_path, REQUEST_TIMEOUT)
            .map_err(|e| BackendError::io("hostapd", e))?;
        socket
            .send_line(line)
            .map_err(|e| BackendError::io("hostapd", e))?;
        let reply = socket
            .recv_text()
            .map_err(|e| BackendError::io("hostapd", e))?;

        if self.sink.is_enabled() {
            self.sink.write_line(&format!("Rx\n{reply}"));
        }

        Ok(parse_response(&reply))
    }

    fn pump_async(&self, timeout: Duration) -> Result<Option<ItemList>, BackendError> {
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(self.open_monitor(timeout)?);
        }
        let socket = monitor.as_ref().expect("just initialised");

        socket
            .socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| BackendError::io("hostapd", e))?;

        match socket.recv_text() {
            Ok(text) => {
                if self.sink.is_enabled() {
                    self.sink.write_line(&format!("Rx {text}"));
                }
                match parse_line(text.trim_end()) {
                    Some(item) => Ok(Some(vec![item])),
                    None => Ok(None),
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => {
                // A dead socket would fail every subsequent pump; reopen on
                // the next call.
                warn!(%e, "notification socket receive failed, reopening");
                *monitor = None;
                Err(BackendError::io("hostapd", e))
            }
        }
    }
}

impl Drop for HostapdBackend {
    fn drop(&mut self) {
        // Best-effort DETACH so the endpoint stops queueing events for a
        // socket that is about to disappear.
        if let Some(monitor) = self.monitor.get_mut().take() {
            let _ = monitor.send_line("DETACH");
        }
    }
}

/// Parses a multi-line control-socket reply into a sibling sequence.
fn parse_response(text: &str) -> ItemList {
    text.lines().filter_map(parse_line).collect()
}

/// Parses one reply or event line.
///
/// A leading `<level>` tag is stripped; the first token (delimited by `=`
/// or space) becomes the key, the remainder the value. A bare token (`OK`,
/// `FAIL`) becomes a key-only item.
fn parse_line(line: &str) -> Option<DataItem> {
    let line = if let Some(rest) = line.strip_prefix('<') {
        &rest[rest.find('>')? + 1..]
    } else {
        line
    };
    if line.is_empty() {
        return None;
    }

    match line.find(['=', ' ']) {
        Some(split) => {
            let key = &line[..split];
            let value = &line[split + 1..];
            if value.is_empty() {
                Some(DataItem::new(key))
            } else {
                Some(DataItem::with_str(key, value))
            }
        }
        None => Some(DataItem::new(line)),
    }
}
