// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection-tracking wire types.

use super::ip::AddressFamily;
use super::ip::Endpoint;
use super::ip::IpAddr;
use super::ip::Protocol;
use super::Direction;
use super::RuleId;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The timeout class a tracked connection ages under.
///
/// The classes mirror the lifecycle of the transport: a TCP
/// connection moves through the handshake classes into established
/// and out through the closing classes; datagram protocols only
/// distinguish how much traffic has been seen.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum TimeoutClass {
    TcpFirstPacket,
    TcpOpening,
    TcpEstablished,
    TcpClosing,
    TcpFinWait,
    TcpClosed,
    UdpFirstPacket,
    UdpSingle,
    UdpMultiple,
    IcmpFirstPacket,
    IcmpError,
    OtherFirstPacket,
    OtherSingle,
    OtherMultiple,
}

// The Display forms double as the dump representation, so keep them
// short and stable.
impl Display for TimeoutClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::TcpFirstPacket => "tcp.first",
            Self::TcpOpening => "tcp.opening",
            Self::TcpEstablished => "tcp.established",
            Self::TcpClosing => "tcp.closing",
            Self::TcpFinWait => "tcp.finwait",
            Self::TcpClosed => "tcp.closed",
            Self::UdpFirstPacket => "udp.first",
            Self::UdpSingle => "udp.single",
            Self::UdpMultiple => "udp.multiple",
            Self::IcmpFirstPacket => "icmp.first",
            Self::IcmpError => "icmp.error",
            Self::OtherFirstPacket => "other.first",
            Self::OtherSingle => "other.single",
            Self::OtherMultiple => "other.multiple",
        };
        write!(f, "{}", s)
    }
}

/// A tracked connection as submitted for insertion.
///
/// The three endpoints describe the connection from every
/// perspective: `lan` is the host behind the filter, `gwy` the
/// translated endpoint presented to the outside, and `ext` the remote
/// peer. For untranslated connections `lan == gwy`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct StateSpec {
    pub proto: Protocol,
    pub af: AddressFamily,
    pub lan: Endpoint,
    pub gwy: Endpoint,
    pub ext: Endpoint,
    /// The direction of the packet that created the connection.
    pub direction: Direction,
    /// The rule that admitted the connection.
    pub rule: RuleId,
    /// The translation rule, if the connection is NATed.
    pub nat_rule: Option<RuleId>,
    pub timeout: TimeoutClass,
}

/// A tracked connection as reported back by the engine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StateDump {
    pub proto: Protocol,
    pub af: AddressFamily,
    pub lan: Endpoint,
    pub gwy: Endpoint,
    pub ext: Endpoint,
    pub direction: Direction,
    pub rule: RuleId,
    pub nat_rule: Option<RuleId>,
    pub timeout: String,
    /// Seconds since the connection was created.
    pub age_secs: u64,
    /// Packets seen, `[in, out]`.
    pub packets: [u64; 2],
    /// Bytes seen, `[in, out]`.
    pub bytes: [u64; 2],
}

/// Selects tracked connections for a purge.
///
/// Every populated field must match; an empty predicate selects all
/// connections.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StatePredicate {
    pub proto: Option<Protocol>,
    pub af: Option<AddressFamily>,
    /// Matches a connection if any of its three endpoints carries
    /// this address.
    pub addr: Option<IpAddr>,
    /// Matches connections admitted by this rule.
    pub rule: Option<RuleId>,
}

impl StatePredicate {
    pub fn is_empty(&self) -> bool {
        self.proto.is_none()
            && self.af.is_none()
            && self.addr.is_none()
            && self.rule.is_none()
    }
}
