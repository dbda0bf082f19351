use std::ffi::CString;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use errno::errno;
use libc::{
    c_int, c_void, sockaddr_ll, socklen_t, tpacket_req3, AF_PACKET, ARPHRD_ETHER, ETH_P_ALL,
    MAP_FAILED, MAP_LOCKED, MAP_SHARED, PACKET_RX_RING, PACKET_VERSION, PROT_READ, PROT_WRITE,
    SOCK_RAW, SOL_PACKET,
};
use tracing::debug;

use crate::capture::CaptureError;
use crate::decode::Protocol;
use crate::ring::{MapRegion, RingConfig};

// TPACKET_V3 from enum tpacket_versions in linux/if_packet.h
const TPACKET_V3: c_int = 2;

// Block retire timeout in milliseconds. Makes partially filled blocks
// visible to userspace without waiting for the block to fill.
const RETIRE_TIMEOUT_MS: u32 = 100;

/// Kernel resources acquired for one capture session. The mapping unmaps
/// itself on drop; the descriptor is owned and closed by the session.
pub(crate) struct RingSocket {
    pub(crate) fd: RawFd,
    pub(crate) map: MapRegion,
    pub(crate) link: Protocol,
}

fn setup_error(fd: RawFd, operation: &'static str) -> CaptureError {
    let err = CaptureError::Setup {
        operation,
        reason: errno().to_string(),
    };
    if fd >= 0 {
        unsafe { libc::close(fd) };
    }
    err
}

/// Create a raw AF_PACKET socket bound to `interface`, negotiate a
/// TPACKET_V3 rx ring with the passed geometry, map it and detect the
/// interface's link-layer type.
pub(crate) fn open_ring(interface: &str, config: &RingConfig) -> Result<RingSocket, CaptureError> {
    let protocol = (ETH_P_ALL as u16).to_be() as c_int;
    let fd = unsafe { libc::socket(AF_PACKET, SOCK_RAW, protocol) };
    if fd == -1 {
        return Err(setup_error(-1, "create capture socket"));
    }

    let version = TPACKET_V3;
    let e = unsafe {
        libc::setsockopt(
            fd,
            SOL_PACKET,
            PACKET_VERSION,
            &version as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    if e == -1 {
        return Err(setup_error(fd, "select ring version"));
    }

    let req = tpacket_req3 {
        tp_block_size: config.block_size as u32,
        tp_block_nr: config.block_count as u32,
        tp_frame_size: config.frame_size as u32,
        tp_frame_nr: config.frame_count() as u32,
        tp_retire_blk_tov: RETIRE_TIMEOUT_MS,
        tp_sizeof_priv: 0,
        tp_feature_req_word: 0,
    };
    let e = unsafe {
        libc::setsockopt(
            fd,
            SOL_PACKET,
            PACKET_RX_RING,
            &req as *const tpacket_req3 as *const c_void,
            mem::size_of::<tpacket_req3>() as socklen_t,
        )
    };
    if e == -1 {
        return Err(setup_error(fd, "configure rx ring"));
    }

    let len = config.map_len();
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_SHARED | MAP_LOCKED,
            fd,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return Err(setup_error(fd, "map rx ring"));
    }
    // Dropped on any later error path, which unmaps the ring
    let map = unsafe { MapRegion::from_raw(ptr, len) };

    let name = match CString::new(interface) {
        Ok(name) => name,
        Err(_) => {
            unsafe { libc::close(fd) };
            return Err(CaptureError::Setup {
                operation: "resolve interface",
                reason: "interface name contains a nul byte".to_string(),
            });
        }
    };
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(setup_error(fd, "resolve interface"));
    }

    let mut addr: sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = AF_PACKET as u16;
    addr.sll_protocol = (ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = index as c_int;
    let e = unsafe {
        libc::bind(
            fd,
            &addr as *const sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<sockaddr_ll>() as socklen_t,
        )
    };
    if e == -1 {
        return Err(setup_error(fd, "bind to interface"));
    }

    let mut bound: sockaddr_ll = unsafe { mem::zeroed() };
    let mut bound_len = mem::size_of::<sockaddr_ll>() as socklen_t;
    let e = unsafe {
        libc::getsockname(
            fd,
            &mut bound as *mut sockaddr_ll as *mut libc::sockaddr,
            &mut bound_len,
        )
    };
    if e == -1 {
        return Err(setup_error(fd, "detect link type"));
    }
    let link = if bound.sll_hatype == ARPHRD_ETHER {
        Protocol::Ether
    } else {
        Protocol::Data
    };

    debug!(
        interface,
        ifindex = index,
        hatype = bound.sll_hatype,
        blocks = config.block_count,
        block_size = config.block_size,
        "rx ring mapped"
    );

    Ok(RingSocket { fd, map, link })
}
