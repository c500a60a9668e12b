//! Renders egress firewall rules into ACL match expressions.
//!
//! Match strings are persisted verbatim in the northbound database, so identical inputs must
//! always render byte-identical output.

use ipnet::IpNet;
use std::{fmt, str::FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MatchKind {
    V4Cidr,
    V6Cidr,
    V4AddressSet,
    V6AddressSet,
}

/// One destination fragment of a rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatchTarget {
    pub kind: MatchKind,
    pub value: String,
}

/// L4 protocols, declared in the order in which their clauses are rendered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Udp,
    Tcp,
    Sctp,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid protocol {0:?}: must be one of TCP, UDP or SCTP")]
pub struct InvalidProtocol(pub String);

/// A protocol with an optional destination port. `None` matches every port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortMatch {
    pub protocol: Protocol,
    pub port: Option<u16>,
}

/// Compiles match expressions for a cluster with a fixed set of internal subnets.
#[derive(Clone, Debug, Default)]
pub struct MatchCompiler {
    /// Sorted so that exclusions render in a canonical order.
    cluster_subnets: Vec<IpNet>,
}

#[derive(Debug)]
enum Ports {
    Any,
    Some(Vec<u16>),
}

// === impl MatchTarget ===

impl MatchTarget {
    pub fn new(kind: MatchKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// Renders the fragment, or `None` when the value is empty (e.g. an address set reference for
    /// a disabled address family).
    fn to_expr(&self) -> Option<String> {
        if self.value.is_empty() {
            return None;
        }
        Some(match self.kind {
            MatchKind::V4Cidr => format!("ip4.dst == {}", self.value),
            MatchKind::V6Cidr => format!("ip6.dst == {}", self.value),
            MatchKind::V4AddressSet => format!("ip4.dst == ${}", self.value),
            MatchKind::V6AddressSet => format!("ip6.dst == ${}", self.value),
        })
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Sctp => "sctp",
        }
    }
}

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("sctp") {
            Ok(Self::Sctp)
        } else {
            Err(InvalidProtocol(s.to_string()))
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl MatchCompiler ===

impl MatchCompiler {
    pub fn new(cluster_subnets: impl IntoIterator<Item = IpNet>) -> Self {
        let mut cluster_subnets = cluster_subnets.into_iter().collect::<Vec<_>>();
        cluster_subnets.sort();
        cluster_subnets.dedup();
        Self { cluster_subnets }
    }

    /// Renders `(destination) && source [&& l4] [&& exclusions]`.
    ///
    /// The source clause covers whichever of the IPv4 and IPv6 source address sets are named;
    /// destinations are OR'ed in declaration order.
    pub fn generate_match(
        &self,
        v4_source: &str,
        v6_source: &str,
        destinations: &[MatchTarget],
        ports: &[PortMatch],
    ) -> String {
        let src = match (v4_source.is_empty(), v6_source.is_empty()) {
            (false, false) => format!("(ip4.src == ${v4_source} || ip6.src == ${v6_source})"),
            (false, true) => format!("ip4.src == ${v4_source}"),
            (true, false) => format!("ip6.src == ${v6_source}"),
            (true, true) => String::new(),
        };

        let dst = destinations
            .iter()
            .filter_map(MatchTarget::to_expr)
            .collect::<Vec<_>>()
            .join(" || ");

        let mut clauses = vec![format!("({dst})")];
        if !src.is_empty() {
            clauses.push(src);
        }
        if let Some(l4) = l4_match(ports) {
            clauses.push(l4);
        }
        clauses.extend(self.subnet_exclusions());
        clauses.join(" && ")
    }

    fn subnet_exclusions(&self) -> impl Iterator<Item = String> + '_ {
        self.cluster_subnets.iter().map(|net| match net {
            IpNet::V4(_) => format!("ip4.dst != {net}"),
            IpNet::V6(_) => format!("ip6.dst != {net}"),
        })
    }
}

/// Renders the L4 clause for a rule's ports, or `None` if the rule matches every protocol.
///
/// Protocols are rendered in the fixed order UDP, TCP, SCTP. A port-less entry for a protocol
/// matches the whole protocol, regardless of any ports listed alongside it.
pub fn l4_match(ports: &[PortMatch]) -> Option<String> {
    let mut by_proto: [Option<Ports>; 3] = [None, None, None];
    for PortMatch { protocol, port } in ports {
        let slot = &mut by_proto[*protocol as usize];
        match (slot.as_mut(), port) {
            (Some(Ports::Any), _) => {}
            (_, None) => *slot = Some(Ports::Any),
            (Some(Ports::Some(list)), Some(port)) => list.push(*port),
            (None, Some(port)) => *slot = Some(Ports::Some(vec![*port])),
        }
    }

    let groups = [Protocol::Udp, Protocol::Tcp, Protocol::Sctp]
        .into_iter()
        .zip(by_proto)
        .filter_map(|(proto, ports)| {
            let p = proto.as_str();
            match ports? {
                Ports::Any => Some(format!("({p})")),
                Ports::Some(list) => {
                    let dsts = list
                        .iter()
                        .map(|port| format!("{p}.dst == {port}"))
                        .collect::<Vec<_>>()
                        .join(" || ");
                    Some(format!("({p} && ( {dsts} ))"))
                }
            }
        })
        .collect::<Vec<_>>();

    if groups.is_empty() {
        return None;
    }
    Some(format!("({})", groups.join(" || ")))
}
