//! Parser for the kernel's TCP socket tables (`/proc/net/tcp{,6}`).
//!
//! Addresses in these files are printed as native-endian 32-bit words, so
//! decoding is only known to be right on little-endian machines.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tether_proto::Endpoint;

/// IPv4 socket table.
const TCP4: &str = "/proc/net/tcp";
/// IPv6 socket table.
const TCP6: &str = "/proc/net/tcp6";

/// Kernel state code for `TCP_LISTEN`.
const STATE_LISTEN: u8 = 0x0A;

/// Address family of a socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// `/proc/net/tcp`.
    V4,
    /// `/proc/net/tcp6`.
    V6,
}

/// One row of a socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Local address.
    pub ip: IpAddr,
    /// Local port.
    pub port: u16,
    /// Kernel TCP state code.
    pub state: u8,
}

impl Entry {
    /// Returns `true` for sockets in the `LISTEN` state.
    pub const fn is_listening(&self) -> bool {
        self.state == STATE_LISTEN
    }
}

/// Returns every listening TCP endpoint in the guest.
pub fn listeners() -> io::Result<Vec<Endpoint>> {
    if cfg!(target_endian = "big") {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "big endian architecture is unsupported: /proc/net/tcp layout is unverified there",
        ));
    }
    let mut out = Vec::new();
    for (path, family) in [(TCP4, Family::V4), (TCP6, Family::V6)] {
        let file = match File::open(path) {
            Ok(f) => f,
            // tcp6 is absent when IPv6 is disabled.
            Err(e) if e.kind() == io::ErrorKind::NotFound && family == Family::V6 => continue,
            Err(e) => return Err(e),
        };
        let entries = parse(BufReader::new(file), family)?;
        out.extend(
            entries
                .into_iter()
                .filter(Entry::is_listening)
                .map(|e| Endpoint::new(e.ip, e.port)),
        );
    }
    Ok(out)
}

/// Parses a socket table.
pub fn parse(r: impl BufRead, family: Family) -> io::Result<Vec<Entry>> {
    let mut out = Vec::new();
    for (n, line) in r.lines().enumerate() {
        let line = line?;
        // Header row.
        if n == 0 || line.trim().is_empty() {
            continue;
        }
        out.push(parse_line(&line, family).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unparsable socket table line {}: {line:?}", n + 1),
            )
        })?);
    }
    Ok(out)
}

/// Parses `sl local_address rem_address st ...`.
fn parse_line(line: &str, family: Family) -> Option<Entry> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = fields.next()?;
    let _remote = fields.next()?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;

    let (addr, port) = local.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match family {
        Family::V4 => IpAddr::V4(decode_v4(addr)?),
        Family::V6 => IpAddr::V6(decode_v6(addr)?),
    };
    Some(Entry { ip, port, state })
}

/// Decodes one native-endian word (`0100007F` → `127.0.0.1`).
fn decode_word(hex: &str) -> Option<[u8; 4]> {
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().map(u32::to_le_bytes)
}

/// Decodes an IPv4 address column.
fn decode_v4(hex: &str) -> Option<Ipv4Addr> {
    decode_word(hex).map(Ipv4Addr::from)
}

/// Decodes an IPv6 address column (four native-endian words).
fn decode_v6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
        chunk.copy_from_slice(&decode_word(hex.get(i * 8..i * 8 + 8)?)?);
    }
    Some(Ipv6Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP4_SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 31337 1 0000000000000000 100 0 0 10 0
   1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1234 1 0000000000000000 100 0 0 10 0
   2: 0F02000A:0016 0202000A:C350 01 00000000:00000000 02:0009A1E2 00000000     0        0 4321 2 0000000000000000 20 4 29 10 -1
";

    const TCP6_SAMPLE: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000001000000:0035 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 111 1 0000000000000000 100 0 0 10 0
   1: 00000000000000000000000000000000:1F91 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 112 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn parses_ipv4_listeners() {
        let entries = parse(TCP4_SAMPLE.as_bytes(), Family::V4).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(entries[0].port, 8080);
        assert!(entries[0].is_listening());
        assert_eq!(entries[1].ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(entries[1].port, 22);
        assert_eq!(entries[2].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)));
        assert!(!entries[2].is_listening());
    }

    #[test]
    fn parses_ipv6_listeners() {
        let entries = parse(TCP6_SAMPLE.as_bytes(), Family::V6).unwrap();
        assert_eq!(entries[0].ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(entries[0].port, 53);
        assert_eq!(entries[1].ip, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(entries[1].port, 8081);
        assert!(entries.iter().all(Entry::is_listening));
    }

    #[test]
    fn rejects_garbage_rows() {
        let table = "header\n   0: nothex:0016 00000000:0000 0A\n";
        let err = parse(table.as_bytes(), Family::V4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
