//! Conversions between `std::net::SocketAddr` and raw `sockaddr` structures,
//! needed because the queue deals in raw file descriptors rather than
//! `std::net` socket types.
//!
//! The teacher's `sys/unix/net.rs` does this by transmuting a
//! `libc::sockaddr_in`/`sockaddr_in6` directly into `std::net`'s
//! `SocketAddrV4`/`SocketAddrV6`; that relies on the two types sharing
//! layout, which isn't something the standard library guarantees. This
//! version builds the `std::net` types from the individual `sockaddr_in`
//! fields instead, which is the sound way to do the same conversion.

use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Borrow `addr` as a raw `sockaddr` pointer plus length, suitable for
/// `connect(2)`/`sendto(2)`/`bind(2)`.
pub(crate) fn as_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
                sin_len: size_of::<libc::sockaddr_in>() as u8,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
                sin6_len: size_of::<libc::sockaddr_in6>() as u8,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Parse a `sockaddr_storage` filled by the kernel (`accept`, `recvfrom`,
/// `getsockname`, `getpeername`) back into a `SocketAddr`.
///
/// # Safety
/// `storage` must have been initialized by a syscall that writes a valid
/// `sockaddr_in` or `sockaddr_in6` and set `ss_family` accordingly.
pub(crate) unsafe fn from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const _ as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
