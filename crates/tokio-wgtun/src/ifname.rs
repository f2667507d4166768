//! Best-effort discovery of the utun device name.
//!
//! The provider process inherits the utun file descriptor without being told
//! which one it is. Scanning the low descriptor range for system control
//! sockets bound to the utun control is a last resort and may find nothing.

/// Looks for a utun control socket among file descriptors 0..1024 and
/// returns its interface name.
#[cfg(target_os = "macos")]
pub fn interface_name() -> Option<String> {
    let utun_id = sys::utun_control_id()?;
    (0..1024).find_map(|fd| sys::utun_name(fd, utun_id))
}

#[cfg(not(target_os = "macos"))]
pub fn interface_name() -> Option<String> {
    None
}

#[cfg(target_os = "macos")]
mod sys {
    use std::mem;

    const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
    const UTUN_OPT_IFNAME: libc::c_int = 2;

    // getsockname() shape of a system control socket; libc has no binding.
    #[repr(C)]
    struct SockaddrCtl {
        sc_len: u8,
        sc_family: u8,
        ss_sysaddr: u16,
        sc_id: u32,
        sc_unit: u32,
        sc_reserved: [u32; 5],
    }

    /// Resolves the kernel control id of the utun subsystem.
    pub fn utun_control_id() -> Option<u32> {
        let fd = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
        if fd < 0 {
            return None;
        }

        let mut info: libc::ctl_info = unsafe { mem::zeroed() };
        info.ctl_name[..UTUN_CONTROL_NAME.len()]
            .copy_from_slice(unsafe { &*(UTUN_CONTROL_NAME as *const [u8] as *const [i8]) });

        let ret = unsafe { libc::ioctl(fd, libc::CTLIOCGINFO, &mut info) };
        unsafe { libc::close(fd) };
        (ret == 0).then_some(info.ctl_id)
    }

    /// Returns the interface name if `fd` is a utun control socket.
    pub fn utun_name(fd: libc::c_int, utun_id: u32) -> Option<String> {
        let mut addr: SockaddrCtl = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<SockaddrCtl>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(fd, (&mut addr as *mut SockaddrCtl).cast(), &mut addr_len)
        };
        if ret != 0 || addr.sc_family as i32 != libc::AF_SYSTEM || addr.sc_id != utun_id {
            return None;
        }

        let mut name = [0u8; libc::IFNAMSIZ];
        let mut name_len = name.len() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SYSPROTO_CONTROL,
                UTUN_OPT_IFNAME,
                name.as_mut_ptr().cast(),
                &mut name_len,
            )
        };
        if ret != 0 || name_len < 2 {
            return None;
        }

        // name_len includes the trailing NUL
        std::str::from_utf8(&name[..name_len as usize - 1])
            .ok()
            .map(str::to_owned)
    }
}
