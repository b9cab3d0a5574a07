//! Recovers the pre-redirection destination of an accepted connection via
//! the `SO_ORIGINAL_DST` socket option, as populated by the firewall's
//! REDIRECT target. IPv4 only, matching the firewall rule this proxy is
//! meant to sit behind.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::AsRawFd;

use tokio::net::TcpStream;

const SOL_IP: libc::c_int = libc::SOL_IP;
const SO_ORIGINAL_DST: libc::c_int = 80;

pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddrV4> {
    let fd = stream.as_raw_fd();

    // SAFETY: `addr` and `addr_len` are valid, correctly-sized local
    // buffers for the duration of the syscall, and `fd` is the stream's
    // own live file descriptor.
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut addr_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let rc = libc::getsockopt(
            fd,
            SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut addr_len,
        );

        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(SocketAddrV4::new(ip, port))
    }
}
