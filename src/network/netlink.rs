//! Minimal rtnetlink client.
//!
//! Speaks the netlink route protocol directly over an `AF_NETLINK`
//! socket: link creation (bridge, veth pairs), link state and master
//! changes, renames, moving links between network namespaces, address
//! assignment, and default routes. Only what the container wiring needs.
//!
//! Every request carries `NLM_F_ACK`; the kernel's error message is
//! turned into an `io::Error` with the original errno so callers can
//! distinguish "already exists" from real failures.

use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use ipnetwork::Ipv4Network;

// Netlink message types.
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

// Netlink flags.
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLMSG_ERROR: u16 = 0x2;
const NLA_F_NESTED: u16 = 1 << 15;

// Link attributes.
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

// Address attributes.
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

// Route attributes and rtmsg constants.
const RTA_GATEWAY: u16 = 5;
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

const IFF_UP: u32 = 0x1;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;

/// Handle on an open rtnetlink socket.
///
/// The socket is bound in the network namespace that was current at
/// [`NetlinkSocket::open`] time; all operations act on that namespace.
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    /// Opens and binds an rtnetlink socket in the current namespace.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd, seq: 0 })
    }

    /// Creates a bridge device.
    pub fn create_bridge(&mut self, name: &str) -> io::Result<()> {
        let mut body = ifinfomsg(0, 0, 0);
        put_attr_str(&mut body, IFLA_IFNAME, name);
        let linkinfo = begin_nested(&mut body, IFLA_LINKINFO);
        put_attr_str(&mut body, IFLA_INFO_KIND, "bridge");
        end_nested(&mut body, linkinfo);
        self.request(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &body,
        )
    }

    /// Creates a veth pair. The peer gets `peer_mac` as its hardware
    /// address; both ends start down in the current namespace.
    pub fn create_veth_pair(&mut self, name: &str, peer: &str, peer_mac: [u8; 6]) -> io::Result<()> {
        let mut body = ifinfomsg(0, 0, 0);
        put_attr_str(&mut body, IFLA_IFNAME, name);

        let linkinfo = begin_nested(&mut body, IFLA_LINKINFO);
        put_attr_str(&mut body, IFLA_INFO_KIND, "veth");
        let infodata = begin_nested(&mut body, IFLA_INFO_DATA);
        let peer_attr = begin_nested(&mut body, VETH_INFO_PEER);
        // VETH_INFO_PEER payload is a full ifinfomsg + attributes.
        body.extend_from_slice(&ifinfomsg(0, 0, 0));
        put_attr_str(&mut body, IFLA_IFNAME, peer);
        put_attr(&mut body, IFLA_ADDRESS, &peer_mac);
        end_nested(&mut body, peer_attr);
        end_nested(&mut body, infodata);
        end_nested(&mut body, linkinfo);

        self.request(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &body,
        )
    }

    /// Deletes a link by name.
    pub fn delete_link(&mut self, name: &str) -> io::Result<()> {
        let index = ifindex(name)?;
        let body = ifinfomsg(index as i32, 0, 0);
        self.request(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, &body)
    }

    /// Brings a link up.
    pub fn set_link_up(&mut self, name: &str) -> io::Result<()> {
        let index = ifindex(name)?;
        let body = ifinfomsg(index as i32, IFF_UP, IFF_UP);
        self.request(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, &body)
    }

    /// Enslaves `name` to the bridge `master`.
    pub fn set_link_master(&mut self, name: &str, master: &str) -> io::Result<()> {
        let index = ifindex(name)?;
        let master_index = ifindex(master)?;
        let mut body = ifinfomsg(index as i32, 0, 0);
        put_attr_u32(&mut body, IFLA_MASTER, master_index);
        self.request(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, &body)
    }

    /// Moves a link into the network namespace pinned behind `ns_fd`.
    pub fn set_link_netns(&mut self, name: &str, ns_fd: RawFd) -> io::Result<()> {
        let index = ifindex(name)?;
        let mut body = ifinfomsg(index as i32, 0, 0);
        put_attr_u32(&mut body, IFLA_NET_NS_FD, ns_fd as u32);
        self.request(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, &body)
    }

    /// Renames a link. The link must be down.
    pub fn rename_link(&mut self, name: &str, new_name: &str) -> io::Result<()> {
        let index = ifindex(name)?;
        let mut body = ifinfomsg(index as i32, 0, 0);
        put_attr_str(&mut body, IFLA_IFNAME, new_name);
        self.request(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, &body)
    }

    /// Assigns an IPv4 address (with prefix) to a link.
    ///
    /// Fails with `AlreadyExists` when the address is present; callers
    /// that want idempotence treat that as success.
    pub fn add_address(&mut self, name: &str, addr: Ipv4Network) -> io::Result<()> {
        let index = ifindex(name)?;
        let mut body = Vec::with_capacity(32);
        // ifaddrmsg: family, prefixlen, flags, scope, index.
        body.push(libc::AF_INET as u8);
        body.push(addr.prefix());
        body.push(0);
        body.push(0);
        body.extend_from_slice(&index.to_ne_bytes());

        let octets = addr.ip().octets();
        put_attr(&mut body, IFA_LOCAL, &octets);
        put_attr(&mut body, IFA_ADDRESS, &octets);

        self.request(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &body,
        )
    }

    /// Installs the default IPv4 route via `gateway`.
    pub fn add_default_route(&mut self, gateway: Ipv4Addr) -> io::Result<()> {
        let mut body = Vec::with_capacity(32);
        // rtmsg: family, dst_len, src_len, tos, table, protocol, scope, type, flags.
        body.push(libc::AF_INET as u8);
        body.push(0);
        body.push(0);
        body.push(0);
        body.push(RT_TABLE_MAIN);
        body.push(RTPROT_BOOT);
        body.push(RT_SCOPE_UNIVERSE);
        body.push(RTN_UNICAST);
        body.extend_from_slice(&0u32.to_ne_bytes());

        put_attr(&mut body, RTA_GATEWAY, &gateway.octets());

        self.request(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &body,
        )
    }

    /// Sends one request and waits for the kernel's acknowledgement.
    fn request(&mut self, msg_type: u16, flags: u16, body: &[u8]) -> io::Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;

        let mut msg = Vec::with_capacity(NLMSG_HDRLEN + body.len());
        msg.extend_from_slice(&((NLMSG_HDRLEN + body.len()) as u32).to_ne_bytes());
        msg.extend_from_slice(&msg_type.to_ne_bytes());
        msg.extend_from_slice(&flags.to_ne_bytes());
        msg.extend_from_slice(&seq.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(body);

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        let len = len as usize;

        if len < NLMSG_HDRLEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated netlink response",
            ));
        }
        let resp_type = u16::from_ne_bytes([buf[4], buf[5]]);
        if resp_type == NLMSG_ERROR {
            if len < NLMSG_HDRLEN + 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated netlink error",
                ));
            }
            let code = i32::from_ne_bytes([
                buf[NLMSG_HDRLEN],
                buf[NLMSG_HDRLEN + 1],
                buf[NLMSG_HDRLEN + 2],
                buf[NLMSG_HDRLEN + 3],
            ]);
            if code != 0 {
                return Err(io::Error::from_raw_os_error(-code));
            }
        }
        Ok(())
    }
}

/// Resolves an interface name to its index in the current namespace.
pub fn ifindex(name: &str) -> io::Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("interface not found: {}", name),
        ));
    }
    Ok(index)
}

/// Whether an interface with this name exists in the current namespace.
pub fn link_exists(name: &str) -> bool {
    ifindex(name).is_ok()
}

// =============================================================================
// Message Building
// =============================================================================

/// Encodes an `ifinfomsg` (family AF_UNSPEC).
fn ifinfomsg(index: i32, flags: u32, change: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(IFINFOMSG_LEN);
    buf.push(libc::AF_UNSPEC as u8);
    buf.push(0); // padding
    buf.extend_from_slice(&0u16.to_ne_bytes()); // ifi_type
    buf.extend_from_slice(&index.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&change.to_ne_bytes());
    buf
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Appends one attribute, padded to 4-byte alignment.
fn put_attr(msg: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = 4 + value.len();
    msg.extend_from_slice(&(attr_len as u16).to_ne_bytes());
    msg.extend_from_slice(&attr_type.to_ne_bytes());
    msg.extend_from_slice(value);
    msg.resize(msg.len() + (align4(attr_len) - attr_len), 0);
}

/// Appends a NUL-terminated string attribute.
fn put_attr_str(msg: &mut Vec<u8>, attr_type: u16, value: &str) {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    put_attr(msg, attr_type, &bytes);
}

fn put_attr_u32(msg: &mut Vec<u8>, attr_type: u16, value: u32) {
    put_attr(msg, attr_type, &value.to_ne_bytes());
}

/// Opens a nested attribute; returns the offset [`end_nested`] patches.
fn begin_nested(msg: &mut Vec<u8>, attr_type: u16) -> usize {
    let start = msg.len();
    msg.extend_from_slice(&0u16.to_ne_bytes());
    msg.extend_from_slice(&(attr_type | NLA_F_NESTED).to_ne_bytes());
    start
}

/// Closes a nested attribute by writing its final length.
fn end_nested(msg: &mut Vec<u8>, start: usize) {
    let len = (msg.len() - start) as u16;
    msg[start..start + 2].copy_from_slice(&len.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_aligned() {
        let mut msg = Vec::new();
        put_attr_str(&mut msg, IFLA_IFNAME, "eth0");
        // 4 header + 5 payload, padded to 12.
        assert_eq!(msg.len(), 12);
        assert_eq!(u16::from_ne_bytes([msg[0], msg[1]]), 9);
    }

    #[test]
    fn nested_length_is_patched() {
        let mut msg = Vec::new();
        let nest = begin_nested(&mut msg, IFLA_LINKINFO);
        put_attr_str(&mut msg, IFLA_INFO_KIND, "veth");
        end_nested(&mut msg, nest);

        let nla_len = u16::from_ne_bytes([msg[0], msg[1]]);
        assert_eq!(nla_len as usize, msg.len());
        let nla_type = u16::from_ne_bytes([msg[2], msg[3]]);
        assert_eq!(nla_type, IFLA_LINKINFO | NLA_F_NESTED);
    }

    #[test]
    fn ifinfomsg_is_sixteen_bytes() {
        assert_eq!(ifinfomsg(0, 0, 0).len(), IFINFOMSG_LEN);
    }

    #[test]
    fn socket_opens_on_linux() {
        // Opening an rtnetlink socket needs no privileges.
        assert!(NetlinkSocket::open().is_ok());
    }

    #[test]
    fn loopback_has_an_index() {
        assert!(ifindex("lo").unwrap() > 0);
        assert!(link_exists("lo"));
        assert!(!link_exists("definitely-not-a-link"));
    }
}
