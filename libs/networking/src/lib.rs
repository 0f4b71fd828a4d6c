//! Networking helpers shared by the redirector services.
//!
//! This library provides helpers for:
//! - The 16-byte address form used by kernel lookup tables (IPv4 stored as
//!   IPv4-mapped IPv6, packed as four network-order 32-bit words)
//! - Network byte order port conversion
//! - Display refinement of IPv4-mapped addresses for logs

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Networking errors.
///
/// Raised by [`endpoint_from_words`]. Any 16 bytes decode to some address,
/// so these errors are a deliberate stricter check: they reject the two
/// shapes that can never be dialed instead of passing them to connect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Address bytes do not form a usable endpoint address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Port is not usable as a destination.
    #[error("invalid port: {0}")]
    InvalidPort(u16),
}

// ============================================================================
// 16-byte address form
// ============================================================================

/// Convert an address to its 16-byte form.
///
/// IPv4 addresses are mapped into `::ffff:0:0/96`.
pub fn to_16_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Pack a 16-byte address into four words, preserving the in-memory byte
/// layout (each word holds four bytes in network order).
pub fn bytes_to_words(bytes: [u8; 16]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Inverse of [`bytes_to_words`].
pub fn words_to_bytes(words: [u32; 4]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    bytes
}

/// Convert an address straight into the word form used as a map key.
pub fn ip_to_words(addr: IpAddr) -> [u32; 4] {
    bytes_to_words(to_16_bytes(addr))
}

/// Parse the word form back into an address.
///
/// IPv4-mapped addresses are returned as [`IpAddr::V4`].
pub fn words_to_ip(words: [u32; 4]) -> IpAddr {
    IpAddr::V6(Ipv6Addr::from(words_to_bytes(words))).to_canonical()
}

// ============================================================================
// Byte order
// ============================================================================

/// Host to network byte order for a port.
pub const fn htons(port: u16) -> u16 {
    port.to_be()
}

/// Network to host byte order for a port.
pub const fn ntohs(port: u16) -> u16 {
    u16::from_be(port)
}

// ============================================================================
// Destination validation
// ============================================================================

/// Build a dialable endpoint from raw kernel-supplied parts.
///
/// The unspecified address and port 0 are rejected: neither can be dialed.
pub fn endpoint_from_words(words: [u32; 4], port_be: u16) -> Result<SocketAddr, NetworkError> {
    let ip = words_to_ip(words);
    if ip.is_unspecified() {
        return Err(NetworkError::InvalidAddress(format!("{:?}", words)));
    }

    let port = ntohs(port_be);
    if port == 0 {
        return Err(NetworkError::InvalidPort(port));
    }

    Ok(SocketAddr::new(ip, port))
}

// ============================================================================
// Display refinement
// ============================================================================

/// Unmap an IPv4-mapped endpoint for display.
pub fn display_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Render a connection source relative to its destination.
///
/// When the destination is IPv4 the source is unmapped as well, so both
/// sides of a log line use the same family.
pub fn display_source(src: SocketAddr, dst: IpAddr) -> SocketAddr {
    match dst.to_canonical() {
        IpAddr::V4(_) => display_addr(src),
        IpAddr::V6(_) => src,
    }
}
