// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};

use crate::Init;
use crate::plugin::{HookPoint, Plugin, PluginData, PluginIo};
use crate::utils::cvt;

const IFLA_IFNAME: u16 = 3;
const NLMSG_HDRLEN: usize = std::mem::size_of::<libc::nlmsghdr>();
const IFINFO_LEN: usize = std::mem::size_of::<libc::ifinfomsg>();

#[inline(always)]
const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// A link changing state, decoded down to what the condition store
/// cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub name: String,
    pub up: bool,
}

/// The condition a network interface drives
pub fn cond_for_iface(name: &str) -> String {
    format!("net/iface/{}", name)
}

/// Open a route-netlink socket subscribed to link notifications
fn open_route_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        cvt(libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            libc::NETLINK_ROUTE,
        ))?
    };
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = libc::RTMGRP_LINK as u32;
    unsafe {
        cvt(libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        ))?
    };
    Ok(fd)
}

/// Ask the kernel to dump the current link table, so boot starts
/// from observed reality instead of waiting for the next flap. The
/// replies come back through the normal event path
fn request_link_dump(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut buf = [0u8; NLMSG_HDRLEN + IFINFO_LEN];
    let hdr = libc::nlmsghdr {
        nlmsg_len: buf.len() as u32,
        nlmsg_type: libc::RTM_GETLINK,
        nlmsg_flags: (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16,
        nlmsg_seq: 1,
        nlmsg_pid: 0,
    };
    unsafe {
        std::ptr::write_unaligned(
            buf.as_mut_ptr() as *mut libc::nlmsghdr,
            hdr,
        );
    }
    // the ifinfomsg payload stays zeroed: AF_UNSPEC, all links
    crate::utils::write_all(fd, &buf)
}

/// Decode all link messages in one datagram into link events
fn decode_datagram(buf: &[u8], out: &mut Vec<LinkEvent>) {
    let mut offset = 0usize;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let hdr = unsafe {
            std::ptr::read_unaligned(
                buf[offset..].as_ptr() as *const libc::nlmsghdr
            )
        };
        let msg_len = hdr.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        if hdr.nlmsg_type == libc::NLMSG_DONE as u16 {
            break;
        }
        if matches!(hdr.nlmsg_type, libc::RTM_NEWLINK | libc::RTM_DELLINK) {
            decode_link(&buf[offset..offset + msg_len], hdr.nlmsg_type, out);
        }
        offset += nlmsg_align(msg_len);
    }
}

fn decode_link(msg: &[u8], msg_type: u16, out: &mut Vec<LinkEvent>) {
    if msg.len() < NLMSG_HDRLEN + IFINFO_LEN {
        return;
    }
    let info = unsafe {
        std::ptr::read_unaligned(
            msg[NLMSG_HDRLEN..].as_ptr() as *const libc::ifinfomsg
        )
    };
    let flags = info.ifi_flags;
    let mut offset = NLMSG_HDRLEN + nlmsg_align(IFINFO_LEN);

    // walk the attribute list for the interface name
    while offset + 4 <= msg.len() {
        let rta_len =
            u16::from_ne_bytes([msg[offset], msg[offset + 1]]) as usize;
        let rta_type = u16::from_ne_bytes([msg[offset + 2], msg[offset + 3]]);
        if rta_len < 4 || offset + rta_len > msg.len() {
            break;
        }
        if rta_type == IFLA_IFNAME {
            let raw = &msg[offset + 4..offset + rta_len];
            let name = raw
                .split(|&b| b == 0)
                .next()
                .and_then(|s| std::str::from_utf8(s).ok())
                .unwrap_or("");
            if !name.is_empty() {
                let up = msg_type == libc::RTM_NEWLINK
                    && flags & libc::IFF_UP as u32 != 0
                    && flags & libc::IFF_RUNNING as u32 != 0;
                out.push(LinkEvent {
                    name: name.to_string(),
                    up,
                });
            }
            return;
        }
        offset += nlmsg_align(rta_len);
    }
}

pub fn plugin() -> Plugin {
    let mut plugin = Plugin::new("netlink");
    plugin.init = Some(netlink_init);
    plugin.io_cb = Some(netlink_io);
    plugin.hooks[HookPoint::SvcReconf.index()] = Some(netlink_reconf);
    plugin
}

fn netlink_init(init: &mut Init, idx: usize) -> io::Result<()> {
    let fd = open_route_socket()?;
    request_link_dump(fd.as_fd())?;
    init.plugins[idx].io = Some(PluginIo {
        fd: Some(fd),
        events: rustix::event::epoll::EventFlags::IN,
    });
    Ok(())
}

fn netlink_io(init: &mut Init, io: &mut PluginIo, _data: &mut PluginData) {
    let Some(fd) = &io.fd else {
        return;
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = match rustix::io::read(fd.as_fd(), &mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("netlink read: {}", e);
                return;
            }
        };
        let mut events = Vec::new();
        decode_datagram(&buf[..n], &mut events);
        for event in events {
            let cond = cond_for_iface(&event.name);
            if event.up {
                log::debug!("link {} up", event.name);
                init.conds.set(&cond);
            } else {
                log::debug!("link {} down", event.name);
                init.conds.clear(&cond);
            }
        }
    }
}

/// Reload reassertion: the interface conditions reflect kernel state
/// this plugin has been tracking all along, so they are simply
/// revalidated into the new generation
fn netlink_reconf(init: &mut Init, _arg: Option<usize>) {
    for name in init.conds.names_with_prefix("net/") {
        init.conds.validate(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_msg(msg_type: u16, flags: u32, name: &str) -> Vec<u8> {
        let name_bytes: Vec<u8> = name.bytes().chain(Some(0)).collect();
        let rta_len = 4 + name_bytes.len();
        let msg_len =
            NLMSG_HDRLEN + nlmsg_align(IFINFO_LEN) + nlmsg_align(rta_len);
        let mut buf = vec![0u8; msg_len];
        let hdr = libc::nlmsghdr {
            nlmsg_len: msg_len as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: 0,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        };
        unsafe {
            std::ptr::write_unaligned(
                buf.as_mut_ptr() as *mut libc::nlmsghdr,
                hdr,
            );
            let mut info: libc::ifinfomsg = std::mem::zeroed();
            info.ifi_flags = flags;
            std::ptr::write_unaligned(
                buf[NLMSG_HDRLEN..].as_mut_ptr() as *mut libc::ifinfomsg,
                info,
            );
        }
        let rta_off = NLMSG_HDRLEN + nlmsg_align(IFINFO_LEN);
        buf[rta_off..rta_off + 2]
            .copy_from_slice(&(rta_len as u16).to_ne_bytes());
        buf[rta_off + 2..rta_off + 4]
            .copy_from_slice(&IFLA_IFNAME.to_ne_bytes());
        buf[rta_off + 4..rta_off + 4 + name_bytes.len()]
            .copy_from_slice(&name_bytes);
        buf
    }

    #[test]
    fn decodes_link_up_and_down() {
        let up_flags = (libc::IFF_UP | libc::IFF_RUNNING) as u32;
        let mut events = Vec::new();
        decode_datagram(
            &link_msg(libc::RTM_NEWLINK, up_flags, "eth0"),
            &mut events,
        );
        assert_eq!(
            events,
            [LinkEvent {
                name: "eth0".into(),
                up: true
            }]
        );

        events.clear();
        // administratively up but no carrier is not "up"
        decode_datagram(
            &link_msg(libc::RTM_NEWLINK, libc::IFF_UP as u32, "eth0"),
            &mut events,
        );
        assert_eq!(
            events,
            [LinkEvent {
                name: "eth0".into(),
                up: false
            }]
        );

        events.clear();
        decode_datagram(
            &link_msg(libc::RTM_DELLINK, up_flags, "eth0"),
            &mut events,
        );
        assert_eq!(
            events,
            [LinkEvent {
                name: "eth0".into(),
                up: false
            }]
        );
    }

    #[test]
    fn multiple_messages_in_one_datagram() {
        let up_flags = (libc::IFF_UP | libc::IFF_RUNNING) as u32;
        let mut buf = link_msg(libc::RTM_NEWLINK, up_flags, "lo");
        buf.extend(link_msg(libc::RTM_NEWLINK, 0, "eth1"));
        let mut events = Vec::new();
        decode_datagram(&buf, &mut events);
        assert_eq!(events.len(), 2);
        assert!(events[0].up);
        assert_eq!(events[1].name, "eth1");
        assert!(!events[1].up);
    }

    #[test]
    fn truncated_datagram_is_dropped() {
        let up_flags = (libc::IFF_UP | libc::IFF_RUNNING) as u32;
        let buf = link_msg(libc::RTM_NEWLINK, up_flags, "eth0");
        let mut events = Vec::new();
        decode_datagram(&buf[..buf.len() - 6], &mut events);
        assert!(events.is_empty());
    }
}
