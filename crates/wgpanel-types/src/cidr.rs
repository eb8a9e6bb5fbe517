// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Address algebra for tunnel subnets.
//!
//! [`HostNet`] carries an IP address together with the network it lives in
//! (`10.8.0.1/24` is the host `10.8.0.1` inside `10.8.0.0/24`). Client
//! addresses are stored as offsets from their server network, so renumbering
//! a server moves every client in one pass; the offset operations here are
//! the bit-exact core that makes that work for both families.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid address or CIDR: {0:?}")]
    Parse(String),

    #[error("{0:?} is not an IPv{1} address/network")]
    WrongFamily(String, u8),

    #[error("offset {offset} and base {base} are in different address families")]
    FamilyMismatch { offset: String, base: String },

    #[error("offset {offset} exceeds the host bits of {base}")]
    OffsetOutOfRange { offset: String, base: String },

    #[error("offset block /{offset} must be at least as specific as base block /{base}")]
    OffsetBlockTooLarge { offset: u8, base: u8 },

    #[error("offset address must be zero when offset and base masks are equal")]
    NonZeroEqualMaskOffset,

    #[error("offset {0} is not aligned to its own mask")]
    UnalignedOffset(String),
}

/// IP address family. The rule engine and the responder treat the two
/// families as fully independent planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Total address width in bits.
    pub fn bits(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.number())
    }
}

/// An IP address together with the network it belongs to.
///
/// Unlike a plain network type, the host bits are significant: the address
/// is the server's (or client's) own address, and the prefix defines the
/// subnet it owns. `Display`/`FromStr` round-trip the canonical
/// `addr/prefix` form (IPv6 in RFC 5952 notation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostNet(IpNetwork);

impl HostNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CidrError> {
        IpNetwork::new(addr, prefix)
            .map(Self)
            .map_err(|_| CidrError::Parse(format!("{addr}/{prefix}")))
    }

    /// A bare address as a full-length (`/32` or `/128`) network.
    pub fn from_addr(addr: IpAddr) -> Self {
        let prefix = IpFamily::of(&addr).bits();
        make(addr, prefix)
    }

    /// Strict CIDR parse; the `/prefix` part is required.
    pub fn parse(s: &str) -> Result<Self, CidrError> {
        if !s.contains('/') {
            return Err(CidrError::Parse(s.to_owned()));
        }
        s.parse::<IpNetwork>()
            .map(Self)
            .map_err(|_| CidrError::Parse(s.to_owned()))
    }

    /// Like [`parse`](Self::parse), but a bare address is accepted and
    /// implies `/32` or `/128`.
    pub fn parse_addr_or_net(s: &str) -> Result<Self, CidrError> {
        if s.contains('/') {
            return Self::parse(s);
        }
        let addr: IpAddr = s.parse().map_err(|_| CidrError::Parse(s.to_owned()))?;
        Ok(Self::from_addr(addr))
    }

    pub fn parse_family(family: IpFamily, s: &str) -> Result<Self, CidrError> {
        let net = Self::parse(s)?;
        if net.family() != family {
            return Err(CidrError::WrongFamily(s.to_owned(), family.number()));
        }
        Ok(net)
    }

    pub fn parse_addr_or_net_family(family: IpFamily, s: &str) -> Result<Self, CidrError> {
        let net = Self::parse_addr_or_net(s)?;
        if net.family() != family {
            return Err(CidrError::WrongFamily(s.to_owned(), family.number()));
        }
        Ok(net)
    }

    pub fn family(&self) -> IpFamily {
        match self.0 {
            IpNetwork::V4(_) => IpFamily::V4,
            IpNetwork::V6(_) => IpFamily::V6,
        }
    }

    /// The host address (with host bits).
    pub fn addr(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn prefix(&self) -> u8 {
        self.0.prefix()
    }

    /// The masked network address.
    pub fn network_addr(&self) -> IpAddr {
        match self.0 {
            IpNetwork::V4(n) => IpAddr::V4(n.network()),
            IpNetwork::V6(n) => IpAddr::V6(n.network()),
        }
    }

    /// This network with the host bits cleared (`10.8.0.1/24` →
    /// `10.8.0.0/24`).
    pub fn network(&self) -> HostNet {
        make(self.network_addr(), self.prefix())
    }

    /// Canonical `network/prefix` string of the masked network.
    pub fn network_str(&self) -> String {
        format!("{}/{}", self.network_addr(), self.prefix())
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.0.contains(addr)
    }

    /// True for exactly `0.0.0.0/32` or `::/128`, the placeholder networks
    /// that mean "fill in at runtime" in roaming SNAT configs.
    pub fn is_zero_host(&self) -> bool {
        self.prefix() == self.family().bits()
            && match self.addr() {
                IpAddr::V4(a) => a.is_unspecified(),
                IpAddr::V6(a) => a.is_unspecified(),
            }
    }

    /// The host portion of the address, as raw address bits.
    pub fn offset(&self) -> IpAddr {
        match self.0 {
            IpNetwork::V4(n) => {
                IpAddr::V4(Ipv4Addr::from(u32::from(n.ip()) & !u32::from(n.mask())))
            }
            IpNetwork::V6(n) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(n.ip()) & !u128::from(n.mask())))
            }
        }
    }

    /// Verify that `offset` fits entirely inside this network's host bits.
    pub fn check_offset(&self, offset: IpAddr) -> Result<(), CidrError> {
        let offset = self.normalize_offset(offset)?;
        let out_of_range = || CidrError::OffsetOutOfRange {
            offset: offset.to_string(),
            base: self.network_str(),
        };
        match (self.0, offset) {
            (IpNetwork::V4(n), IpAddr::V4(o)) => {
                if u32::from(o) & u32::from(n.mask()) != 0 {
                    return Err(out_of_range());
                }
            }
            (IpNetwork::V6(n), IpAddr::V6(o)) => {
                if u128::from(o) & u128::from(n.mask()) != 0 {
                    return Err(out_of_range());
                }
            }
            _ => unreachable!("offset normalized to base family"),
        }
        Ok(())
    }

    /// `(network | offset) / prefix` — the address at `offset` inside this
    /// network, keeping the original mask.
    pub fn by_offset(&self, offset: IpAddr) -> Result<HostNet, CidrError> {
        let offset = self.normalize_offset(offset)?;
        self.check_offset(offset)?;
        let addr = match (self.network_addr(), offset) {
            (IpAddr::V4(base), IpAddr::V4(o)) => {
                IpAddr::V4(Ipv4Addr::from(u32::from(base) | u32::from(o)))
            }
            (IpAddr::V6(base), IpAddr::V6(o)) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(base) | u128::from(o)))
            }
            _ => unreachable!("offset normalized to base family"),
        };
        Ok(make(addr, self.prefix()))
    }

    /// Carve a sub-block out of this network, treating `offset`'s address as
    /// a sub-prefix index and its mask as the sub-prefix length.
    ///
    /// `2001:db8::/32` with offset `0:0:1::/64` yields `2001:db8:1::/64`.
    /// Fails when the families differ, the offset block is larger than the
    /// base block, the offset address reaches into the base's prefix bits,
    /// or the offset address is not aligned to its own mask. Equal masks
    /// require a zero offset address and return the base itself.
    pub fn subnet_by_offset(&self, offset: &HostNet) -> Result<HostNet, CidrError> {
        if self.family() != offset.family() {
            return Err(CidrError::FamilyMismatch {
                offset: offset.to_string(),
                base: self.to_string(),
            });
        }
        if offset.prefix() < self.prefix() {
            return Err(CidrError::OffsetBlockTooLarge {
                offset: offset.prefix(),
                base: self.prefix(),
            });
        }
        if offset.prefix() == self.prefix() {
            let zero = match offset.addr() {
                IpAddr::V4(a) => a.is_unspecified(),
                IpAddr::V6(a) => a.is_unspecified(),
            };
            if !zero {
                return Err(CidrError::NonZeroEqualMaskOffset);
            }
            return Ok(*self);
        }

        // The offset address may only use bits below the base prefix and
        // above its own prefix.
        self.check_offset(offset.addr())?;
        let aligned = match offset.0 {
            IpNetwork::V4(n) => u32::from(n.ip()) & !u32::from(n.mask()) == 0,
            IpNetwork::V6(n) => u128::from(n.ip()) & !u128::from(n.mask()) == 0,
        };
        if !aligned {
            return Err(CidrError::UnalignedOffset(offset.to_string()));
        }

        let carved = self.by_offset(offset.addr())?;
        Ok(make(carved.addr(), offset.prefix()))
    }

    /// Two networks overlap when either base network contains the other's
    /// base address. Always false across families.
    pub fn overlaps(&self, other: &HostNet) -> bool {
        if self.family() != other.family() {
            return false;
        }
        self.0.contains(other.network_addr()) || other.0.contains(self.network_addr())
    }

    fn normalize_offset(&self, offset: IpAddr) -> Result<IpAddr, CidrError> {
        match (self.family(), offset) {
            (IpFamily::V4, IpAddr::V6(o)) => match o.to_ipv4_mapped() {
                Some(v4) => Ok(IpAddr::V4(v4)),
                None => Err(CidrError::FamilyMismatch {
                    offset: o.to_string(),
                    base: self.to_string(),
                }),
            },
            (IpFamily::V6, IpAddr::V4(o)) => Ok(IpAddr::V6(o.to_ipv6_mapped())),
            (_, o) => Ok(o),
        }
    }

    fn addr_key(&self) -> (u8, [u8; 16], u8) {
        // v4 sorts before v6; within a family, byte order, then
        // more-specific-last.
        match self.0 {
            IpNetwork::V4(n) => {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&n.ip().octets());
                (4, key, n.prefix())
            }
            IpNetwork::V6(n) => (6, n.ip().octets(), n.prefix()),
        }
    }
}

fn make(addr: IpAddr, prefix: u8) -> HostNet {
    match IpNetwork::new(addr, prefix) {
        Ok(net) => HostNet(net),
        Err(_) => unreachable!("prefix comes from an existing network of the same family"),
    }
}

impl From<Ipv4Network> for HostNet {
    fn from(net: Ipv4Network) -> Self {
        Self(IpNetwork::V4(net))
    }
}

impl From<Ipv6Network> for HostNet {
    fn from(net: Ipv6Network) -> Self {
        Self(IpNetwork::V6(net))
    }
}

impl fmt::Display for HostNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.prefix())
    }
}

impl FromStr for HostNet {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Ord for HostNet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr_key().cmp(&other.addr_key())
    }
}

impl PartialOrd for HostNet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for HostNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

/// Order-insensitive set equality over network slices. The inputs are not
/// mutated; comparison happens on sorted copies.
pub fn networks_equal(a: &[HostNet], b: &[HostNet]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Order-insensitive set equality over plain addresses.
pub fn ips_equal<T: Ord + Copy>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}
