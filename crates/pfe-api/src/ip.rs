// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Address, protocol, and flow-key types.
//!
//! These are self-contained so that the API crate builds without std;
//! conversions to and from the `core::net` types are provided for
//! convenience.

use alloc::string::String;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// The address family of a rule selector, pool entry, or connection.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Inet => write!(f, "inet"),
            Self::Inet6 => write!(f, "inet6"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s {
            "inet" => Ok(Self::Inet),
            "inet6" => Ok(Self::Inet6),
            _ => Err(format!("invalid address family: {}", s)),
        }
    }
}

pub const PROTO_ICMP: u8 = 0x1;
pub const PROTO_IGMP: u8 = 0x2;
pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;
pub const PROTO_ICMPV6: u8 = 0x3A;

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Protocol {
    ICMP,
    IGMP,
    TCP,
    UDP,
    ICMPv6,
    Unknown(u8),
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Unknown(255)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ICMP => write!(f, "ICMP"),
            Self::IGMP => write!(f, "IGMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMPv6 => write!(f, "ICMPv6"),
            Self::Unknown(_) => write!(f, "Unknown"),
        }
    }
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            PROTO_ICMP => Self::ICMP,
            PROTO_IGMP => Self::IGMP,
            PROTO_TCP => Self::TCP,
            PROTO_UDP => Self::UDP,
            PROTO_ICMPV6 => Self::ICMPv6,
            _ => Self::Unknown(proto),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        match proto {
            Protocol::ICMP => PROTO_ICMP,
            Protocol::IGMP => PROTO_IGMP,
            Protocol::TCP => PROTO_TCP,
            Protocol::UDP => PROTO_UDP,
            Protocol::ICMPv6 => PROTO_ICMPV6,
            Protocol::Unknown(v) => v,
        }
    }
}

/// An IPv4 or IPv6 address.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum IpAddr {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
}

impl IpAddr {
    pub const fn family(&self) -> AddressFamily {
        match self {
            Self::Ip4(_) => AddressFamily::Inet,
            Self::Ip6(_) => AddressFamily::Inet6,
        }
    }

    /// Return the address after applying the network mask.
    pub fn mask(self, prefix: u8) -> result::Result<Self, String> {
        match self {
            Self::Ip4(ip4) => ip4.mask(prefix).map(Self::Ip4),
            Self::Ip6(ip6) => ip6.mask(prefix).map(Self::Ip6),
        }
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(ipv4: Ipv4Addr) -> Self {
        IpAddr::Ip4(ipv4)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(ipv6: Ipv6Addr) -> Self {
        IpAddr::Ip6(ipv6)
    }
}

impl Default for IpAddr {
    fn default() -> Self {
        IpAddr::Ip4(Default::default())
    }
}

impl Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpAddr::Ip4(ip4) => write!(f, "{ip4}"),
            IpAddr::Ip6(ip6) => write!(f, "{ip6}"),
        }
    }
}

impl FromStr for IpAddr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        if let Ok(ipv4) = val.parse::<Ipv4Addr>() {
            Ok(ipv4.into())
        } else {
            val.parse::<Ipv6Addr>()
                .map(IpAddr::Ip6)
                .map_err(|_| String::from("invalid IP address"))
        }
    }
}

/// An IPv4 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }

    /// Return the address after applying the network mask.
    pub fn mask(mut self, mask: u8) -> result::Result<Self, String> {
        if mask > 32 {
            return Err(format!("bad mask: {mask}"));
        }

        if mask == 0 {
            return Ok(Ipv4Addr::ANY_ADDR);
        }

        let mut n = u32::from_be_bytes(self.inner);

        let mut bits = i32::MIN;
        bits >>= mask - 1;
        n &= bits as u32;
        self.inner = n.to_be_bytes();
        Ok(self)
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip4: core::net::Ipv4Addr) -> Self {
        Self { inner: ip4.octets() }
    }
}

impl From<Ipv4Addr> for core::net::Ipv4Addr {
    fn from(ip4: Ipv4Addr) -> Self {
        Self::from(ip4.inner)
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.inner;
        write!(f, "{}.{}.{}.{}", b[0], b[1], b[2], b[3])
    }
}

impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr {{ inner: {self} }}")
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 4];
        let mut iter = val.split('.');
        for b in &mut bytes {
            let octet = iter.next().ok_or_else(|| {
                format!("malformed IPv4 address: {}", val)
            })?;
            *b = octet
                .parse()
                .map_err(|_| format!("malformed IPv4 address: {}", val))?;
        }

        if iter.next().is_some() {
            return Err(format!("malformed IPv4 address: {}", val));
        }

        Ok(Self { inner: bytes })
    }
}

/// An IPv6 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv6Addr {
    inner: [u8; 16],
}

impl Ipv6Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 16] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 16] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 16]) -> Self {
        Self { inner: bytes }
    }

    /// Return the 16-bit segments of the address.
    pub fn segments(&self) -> [u16; 8] {
        let mut segs = [0u16; 8];
        for (i, seg) in segs.iter_mut().enumerate() {
            *seg =
                u16::from_be_bytes([self.inner[i * 2], self.inner[i * 2 + 1]]);
        }
        segs
    }

    /// Return the address after applying the network mask.
    pub fn mask(mut self, mask: u8) -> result::Result<Self, String> {
        if mask > 128 {
            return Err(format!("bad mask: {mask}"));
        }

        let whole = usize::from(mask / 8);
        let partial = mask % 8;
        for (i, b) in self.inner.iter_mut().enumerate() {
            if i < whole {
                continue;
            }

            if i == whole && partial != 0 {
                *b &= 0xFFu8 << (8 - partial);
            } else {
                *b = 0;
            }
        }

        Ok(self)
    }
}

impl From<core::net::Ipv6Addr> for Ipv6Addr {
    fn from(ip6: core::net::Ipv6Addr) -> Self {
        Self { inner: ip6.octets() }
    }
}

impl From<Ipv6Addr> for core::net::Ipv6Addr {
    fn from(ip6: Ipv6Addr) -> Self {
        Self::from(ip6.inner)
    }
}

impl From<[u8; 16]> for Ipv6Addr {
    fn from(bytes: [u8; 16]) -> Self {
        Self { inner: bytes }
    }
}

impl Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let segs = self.segments();

        // Find the longest run of zero segments for `::` compression.
        let mut best = (0, 0);
        let mut cur = (0, 0);
        for (i, seg) in segs.iter().enumerate() {
            if *seg == 0 {
                if cur.1 == 0 {
                    cur.0 = i;
                }
                cur.1 += 1;
                if cur.1 > best.1 {
                    best = cur;
                }
            } else {
                cur = (0, 0);
            }
        }

        if best.1 < 2 {
            for (i, seg) in segs.iter().enumerate() {
                if i > 0 {
                    write!(f, ":")?;
                }
                write!(f, "{seg:x}")?;
            }
            return Ok(());
        }

        for (i, seg) in segs.iter().enumerate().take(best.0) {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{seg:x}")?;
        }
        write!(f, "::")?;
        for (i, seg) in segs.iter().enumerate().skip(best.0 + best.1) {
            if i > best.0 + best.1 {
                write!(f, ":")?;
            }
            write!(f, "{seg:x}")?;
        }
        Ok(())
    }
}

impl Debug for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv6Addr {{ inner: {self} }}")
    }
}

impl FromStr for Ipv6Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let err = || format!("malformed IPv6 address: {}", val);
        let parse_groups = |s: &str| -> result::Result<
            alloc::vec::Vec<u16>,
            String,
        > {
            if s.is_empty() {
                return Ok(vec![]);
            }
            s.split(':')
                .map(|g| u16::from_str_radix(g, 16).map_err(|_| err()))
                .collect()
        };

        let mut segs = [0u16; 8];
        match val.split_once("::") {
            Some((left, right)) => {
                let left = parse_groups(left)?;
                let right = parse_groups(right)?;
                if left.len() + right.len() > 7 {
                    return Err(err());
                }
                segs[..left.len()].copy_from_slice(&left);
                segs[8 - right.len()..].copy_from_slice(&right);
            }

            None => {
                let groups = parse_groups(val)?;
                if groups.len() != 8 {
                    return Err(err());
                }
                segs.copy_from_slice(&groups);
            }
        }

        let mut bytes = [0u8; 16];
        for (i, seg) in segs.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&seg.to_be_bytes());
        }
        Ok(Self { inner: bytes })
    }
}

/// An IP network expressed as an address and prefix length.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    pub fn new(addr: IpAddr, prefix: u8) -> result::Result<Self, String> {
        // Normalizing up front means equality and ordering work on
        // the network, not on whatever host bits the caller passed.
        let addr = addr.mask(prefix)?;
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn family(&self) -> AddressFamily {
        self.addr.family()
    }

    /// Is `ip` a member of this network?
    ///
    /// An address of the wrong family is never a member.
    pub fn is_member(&self, ip: IpAddr) -> bool {
        if ip.family() != self.family() {
            return false;
        }

        match ip.mask(self.prefix) {
            Ok(masked) => masked == self.addr,
            Err(_) => false,
        }
    }
}

impl Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpCidr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let (addr_s, prefix_s) = val
            .split_once('/')
            .ok_or_else(|| format!("no prefix found in: {}", val))?;
        let addr = addr_s.parse::<IpAddr>()?;
        let prefix = prefix_s
            .parse::<u8>()
            .map_err(|_| format!("bad prefix: {}", prefix_s))?;
        Self::new(addr, prefix)
    }
}

/// One half of a connection: an address and a transport port.
///
/// For protocols without ports the port is zero.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A connection as observed from one perspective of a packet.
///
/// The ordering derived here is what makes the state-table indices
/// O(log n): keys are compared field by field, protocol first.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct FlowKey {
    pub proto: Protocol,
    pub af: AddressFamily,
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl FlowKey {
    /// Return the key for the same connection seen from the opposite
    /// direction.
    pub fn mirror(self) -> Self {
        Self { proto: self.proto, af: self.af, src: self.dst, dst: self.src }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.proto, self.src, self.dst)
    }
}
