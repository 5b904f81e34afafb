//! Generic-netlink backend for the kernel 802.11 configuration layer.
//!
//! Implements just enough of the generic-netlink protocol to drive
//! `nl80211`: control-family resolution, command submission with typed
//! attributes, and multicast event reception. Framing is built and parsed
//! by hand over a raw `AF_NETLINK` socket: the headers are tiny and the
//! alternative is dragging a full netlink stack in for four commands.
//!
//! # Message framing
//!
//! ```text
//! +-----------+------------+----------------------+
//! | nlmsghdr  | genlmsghdr | nlattr nlattr nlattr |
//! | 16 bytes  | 4 bytes    | 4-byte aligned TLVs  |
//! +-----------+------------+----------------------+
//! ```
//!
//! Response attributes become a [`DataItem`] tree: an attribute whose
//! payload scans as a well-formed attribute stream ending exactly on the
//! buffer boundary is treated as nested, anything else is an opaque leaf.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use halow_dcs_core::{Backend, BackendError, DataItem, ItemList, ItemLookup, Key, LogSink};

// nl80211 commands the controller consumes.
pub const NL80211_CMD_GET_INTERFACE: u32 = 5;
pub const NL80211_CMD_GET_STATION: u32 = 17;
pub const NL80211_CMD_CH_SWITCH_NOTIFY: u32 = 88;
pub const NL80211_CMD_VENDOR: u32 = 103;

// nl80211 attributes the controller consumes.
pub const NL80211_ATTR_IFINDEX: u32 = 3;
pub const NL80211_ATTR_WIPHY_FREQ: u32 = 38;
pub const NL80211_ATTR_VENDOR_ID: u32 = 195;
pub const NL80211_ATTR_VENDOR_SUBCMD: u32 = 196;
pub const NL80211_ATTR_VENDOR_DATA: u32 = 197;

/// `NLM_F_DUMP`, for table-style requests such as `GET_STATION`.
pub const NLM_F_DUMP: u16 = 0x0300;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

// Control family: fixed id, used to resolve everything else.
const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u32 = 1;
const CTRL_ATTR_FAMILY_NAME: u32 = 2;
const CTRL_ATTR_MCAST_GROUPS: u32 = 7;
const CTRL_ATTR_MCAST_GRP_NAME: u32 = 1;
const CTRL_ATTR_MCAST_GRP_ID: u32 = 2;

const SOL_NETLINK: libc::c_int = 270;
const NETLINK_ADD_MEMBERSHIP: libc::c_int = 1;

const FAMILY_NAME: &str = "nl80211";
const EVENT_GROUPS: [&str; 2] = ["mlme", "vendor"];

const SOCKET_BUF_LEN: libc::c_int = 8192;
const RECV_BUF_LEN: usize = 8192;

const fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

// ---------------------------------------------------------------------------
// Raw socket
// ---------------------------------------------------------------------------

/// RAII wrapper over an `AF_NETLINK` generic-netlink socket.
struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    fn connect() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self { fd };

        for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
            sock.setsockopt(libc::SOL_SOCKET, opt, &SOCKET_BUF_LEN)?;
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                sock.fd,
                std::ptr::addr_of!(addr).cast(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sock)
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                (value as *const T).cast(),
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn add_membership(&self, group: u32) -> io::Result<()> {
        self.setsockopt(SOL_NETLINK, NETLINK_ADD_MEMBERSHIP, &(group as libc::c_int))
    }

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
        };
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
    }

    fn send(&self, msg: &[u8]) -> io::Result<()> {
        let rc = unsafe { libc::send(self.fd, msg.as_ptr().cast(), msg.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---------------------------------------------------------------------------
// Message building and parsing
// ---------------------------------------------------------------------------

/// Builds one generic-netlink message; the total length is backfilled at
/// [`MsgBuilder::finish`].
struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    fn new(family: u16, flags: u16, seq: u32, cmd: u8, version: u8) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, backfilled
        buf.extend_from_slice(&family.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid, kernel fills
        buf.push(cmd);
        buf.push(version);
        buf.extend_from_slice(&0u16.to_ne_bytes()); // genl reserved
        Self { buf }
    }

    fn put_attr(&mut self, attr_type: u16, payload: &[u8]) {
        let len = (NLA_HDRLEN + payload.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(nla_align(self.buf.len()), 0);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// One netlink message split out of a receive buffer.
struct NlMsg<'a> {
    msg_type: u16,
    payload: &'a [u8],
}

/// Walks the `nlmsghdr` chain in a receive buffer.
fn split_messages(buf: &[u8]) -> Vec<NlMsg<'_>> {
    let mut messages = Vec::new();
    let mut off = 0;
    while buf.len().saturating_sub(off) >= NLMSG_HDRLEN {
        let len = u32::from_ne_bytes(buf[off..off + 4].try_into().expect("sized")) as usize;
        if len < NLMSG_HDRLEN || off + len > buf.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[off + 4..off + 6].try_into().expect("sized"));
        messages.push(NlMsg {
            msg_type,
            payload: &buf[off + NLMSG_HDRLEN..off + len],
        });
        off += nla_align(len);
    }
    messages
}

/// Whether a payload scans as a complete attribute stream.
///
/// The walk must land exactly on the buffer boundary; a short or
/// overrunning record means the payload is an opaque leaf.
fn looks_nested(data: &[u8]) -> bool {
    let mut rem = data.len() as isize;
    let mut off = 0usize;
    while rem >= NLA_HDRLEN as isize {
        let len = u16::from_ne_bytes([data[off], data[off + 1]]) as isize;
        if len < NLA_HDRLEN as isize || len > rem {
            return false;
        }
        let step = nla_align(len as usize) as isize;
        rem -= step;
        off += step as usize;
    }
    rem == 0
}

/// Parses an attribute stream into a sibling sequence, recursing into
/// payloads that themselves look like attribute streams.
fn parse_attrs(data: &[u8]) -> ItemList {
    let mut items = Vec::new();
    let mut off = 0;
    while data.len().saturating_sub(off) >= NLA_HDRLEN {
        let len = u16::from_ne_bytes([data[off], data[off + 1]]) as usize;
        if len < NLA_HDRLEN || off + len > data.len() {
            break;
        }
        let attr_type = u16::from_ne_bytes([data[off + 2], data[off + 3]]) & NLA_TYPE_MASK;
        let payload = &data[off + NLA_HDRLEN..off + len];

        let mut item = DataItem::with_bytes(u32::from(attr_type), payload);
        if !payload.is_empty() && looks_nested(payload) {
            item.children = parse_attrs(payload);
        }
        items.push(item);

        off += nla_align(len);
    }
    items
}

/// Wraps a genl payload (genlmsghdr + attrs) as one result item keyed by
/// the genl command id.
fn genl_to_item(payload: &[u8]) -> Option<DataItem> {
    if payload.len() < GENL_HDRLEN {
        return None;
    }
    let mut item = DataItem::new(u32::from(payload[0]));
    item.children = parse_attrs(&payload[GENL_HDRLEN..]);
    Some(item)
}

// ---------------------------------------------------------------------------
// Request builder
// ---------------------------------------------------------------------------

/// Typed builder for nl80211 requests.
///
/// ```rust
/// use halow_dcs_backend::nl80211::{NlRequest, NL80211_CMD_GET_INTERFACE, NL80211_ATTR_IFINDEX};
///
/// let request = NlRequest::new(NL80211_CMD_GET_INTERFACE, 0)
///     .attr_u32(NL80211_ATTR_IFINDEX, 4)
///     .build();
/// assert_eq!(request.len(), 2);
/// ```
pub struct NlRequest {
    items: ItemList,
}

impl NlRequest {
    /// Starts a request for `cmd` with extra header `flags` (for example
    /// [`NLM_F_DUMP`]).
    pub fn new(cmd: u32, flags: u16) -> Self {
        Self {
            items: vec![DataItem::with_u16(cmd, flags)],
        }
    }

    /// Appends a `u32` attribute.
    #[must_use]
    pub fn attr_u32(mut self, attr: u32, value: u32) -> Self {
        self.items.push(DataItem::with_u32(attr, value));
        self
    }

    /// Appends a NUL-terminated string attribute.
    #[must_use]
    pub fn attr_str(mut self, attr: u32, value: &str) -> Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.items.push(DataItem::with_bytes(attr, bytes));
        self
    }

    /// Appends an opaque byte attribute.
    #[must_use]
    pub fn attr_bytes(mut self, attr: u32, value: &[u8]) -> Self {
        self.items.push(DataItem::with_bytes(attr, value));
        self
    }

    /// Finishes the request tree.
    pub fn build(self) -> ItemList {
        self.items
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Resolved family metadata, cached on the event socket.
struct FamilyInfo {
    id: u16,
    mcast_groups: Vec<(String, u32)>,
}

/// The persistent event socket plus the family id its frames carry.
struct EventSocket {
    socket: NetlinkSocket,
    family_id: u16,
}

/// The nl80211 generic-netlink backend.
pub struct Nl80211Backend {
    event: Mutex<Option<EventSocket>>,
    sink: Arc<dyn LogSink>,
}

impl Nl80211Backend {
    /// Creates the backend. Sockets are opened per command and lazily for
    /// events.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            event: Mutex::new(None),
            sink,
        }
    }

    /// Resolves the `nl80211` family id and multicast groups through the
    /// control family.
    fn resolve_family(sock: &NetlinkSocket) -> Result<FamilyInfo, BackendError> {
        let mut msg = MsgBuilder::new(GENL_ID_CTRL, NLM_F_REQUEST, 1, CTRL_CMD_GETFAMILY, 1);
        let mut name = FAMILY_NAME.as_bytes().to_vec();
        name.push(0);
        msg.put_attr(CTRL_ATTR_FAMILY_NAME as u16, &name);
        sock.send(&msg.finish())
            .map_err(|e| BackendError::io("nl80211", e))?;

        let mut buf = [0u8; RECV_BUF_LEN];
        let len = sock
            .recv(&mut buf)
            .map_err(|e| BackendError::io("nl80211", e))?;

        for msg in split_messages(&buf[..len]) {
            if msg.msg_type != GENL_ID_CTRL {
                continue;
            }
            let Some(item) = genl_to_item(msg.payload) else {
                continue;
            };
            let id = item
                .children
                .find_u32(CTRL_ATTR_FAMILY_ID)
                .and_then(DataItem::value_u16)
                .ok_or_else(|| BackendError::FamilyNotFound {
                    family: FAMILY_NAME.into(),
                })?;

            let mut mcast_groups = Vec::new();
            if let Some(groups) = item.children.find_u32(CTRL_ATTR_MCAST_GROUPS) {
                for group in &groups.children {
                    let name = group
                        .children
                        .find_u32(CTRL_ATTR_MCAST_GRP_NAME)
                        .and_then(DataItem::value_str);
                    let gid = group
                        .children
                        .find_u32(CTRL_ATTR_MCAST_GRP_ID)
                        .and_then(DataItem::value_u32);
                    if let (Some(name), Some(gid)) = (name, gid) {
                        mcast_groups.push((name.to_owned(), gid));
                    }
                }
            }

            return Ok(FamilyInfo { id, mcast_groups });
        }

        Err(BackendError::FamilyNotFound {
            family: FAMILY_NAME.into(),
        })
    }

    /// Opens the event socket and joins the `mlme` and `vendor` groups.
    fn open_event_socket(&self) -> Result<EventSocket, BackendError> {
        let socket = NetlinkSocket::connect().map_err(|e| BackendError::io("nl80211", e))?;
        let family = Self::resolve_family(&socket)?;

        for group in EVENT_GROUPS {
            let gid = family
                .mcast_groups
                .iter()
                .find(|(name, _)| name == group)
                .map(|(_, gid)| *gid)
                .ok_or_else(|| BackendError::FamilyNotFound {
                    family: format!("{FAMILY_NAME} multicast group '{group}'"),
                })?;
            socket
                .add_membership(gid)
                .map_err(|e| BackendError::io("nl80211", e))?;
        }

        debug!("nl80211 event socket subscribed to {EVENT_GROUPS:?}");
        Ok(EventSocket {
            socket,
            family_id: family.id,
        })
    }

    fn trace(&self, direction: &str, frame: &[u8]) {
        if self.sink.is_enabled() {
            let hex: String = frame.iter().map(|b| format!("{b:02x} ")).collect();
            self.sink.write_line(&format!("{direction} {hex}"));
        }
    }
}

impl Backend for Nl80211Backend {
    fn name(&self) -> &'static str {
        "nl80211"
    }

    fn submit_blocking(&self, request: &ItemList) -> Result<ItemList, BackendError> {
        let head = request
            .first()
            .ok_or_else(|| BackendError::protocol("nl80211", "request carries no command"))?;
        let cmd = match &head.key {
            Key::U32(cmd) => *cmd,
            Key::Str(_) => {
                return Err(BackendError::protocol(
                    "nl80211",
                    "request head must be keyed by command id",
                ))
            }
        };
        let flags = head.value_u16().unwrap_or(0);

        // One short-lived socket per command keeps replies and subscribed
        // events on separate file descriptors.
        let sock = NetlinkSocket::connect().map_err(|e| BackendError::io("nl80211", e))?;
        let family = Self::resolve_family(&sock)?;

        let mut msg = MsgBuilder::new(family.id, NLM_F_REQUEST | NLM_F_ACK | flags, 2, cmd as u8, 0);
        for attr in &request[1..] {
            let attr_id = match &attr.key {
                Key::U32(attr_id) => *attr_id,
                Key::Str(_) => {
                    return Err(BackendError::protocol(
                        "nl80211",
                        "attributes must be keyed by attribute id",
                    ))
                }
            };
            msg.put_attr(attr_id as u16, attr.value_bytes().unwrap_or(&[]));
        }
        let frame = msg.finish();
        self.trace("Tx", &frame);
        sock.send(&frame).map_err(|e| BackendError::io("nl80211", e))?;

        let mut result = ItemList::new();
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            let len = sock
                .recv(&mut buf)
                .map_err(|e| BackendError::io("nl80211", e))?;
            self.trace("Rx", &buf[..len]);

            for msg in split_messages(&buf[..len]) {
                match msg.msg_type {
                    NLMSG_DONE => return Ok(result),
                    NLMSG_ERROR => {
                        let code = msg
                            .payload
                            .get(..4)
                            .map(|b| i32::from_ne_bytes(b.try_into().expect("sized")))
                            .unwrap_or(0);
                        if code == 0 {
                            return Ok(result); // plain ACK
                        }
                        return Err(BackendError::io(
                            "nl80211",
                            io::Error::from_raw_os_error(-code),
                        ));
                    }
                    ty if ty == family.id => {
                        if let Some(item) = genl_to_item(msg.payload) {
                            result.push(item);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn pump_async(&self, timeout: Duration) -> Result<Option<ItemList>, BackendError> {
        let mut event = self.event.lock();
        if event.is_none() {
            *event = Some(self.open_event_socket()?);
        }
        let es = event.as_ref().expect("just initialised");
        let family_id = es.family_id;

        es.socket
            .set_read_timeout(timeout)
            .map_err(|e| BackendError::io("nl80211", e))?;

        let mut buf = [0u8; RECV_BUF_LEN];
        let len = match es.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => {
                warn!(%e, "nl80211 event socket receive failed, reopening");
                *event = None;
                return Err(BackendError::io("nl80211", e));
            }
        };
        self.trace("Rx", &buf[..len]);

        // Multicast delivery is unsequenced; frames are accepted as they
        // come without sequence checking.
        let items: ItemList = split_messages(&buf[..len])
            .into_iter()
            .filter(|msg| msg.msg_type == family_id)
            .filter_map(|msg| genl_to_item(msg.payload))
            .collect();

        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(items))
        }
    }
}
