//! EDNS0 Client Subnet manipulation on in-memory DNS messages.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use ipnet::IpNet;

/// Source prefix advertised for IPv4 subnets.
pub const ECS_V4_SOURCE_PREFIX: u8 = 24;
/// Source prefix advertised for IPv6 subnets.
pub const ECS_V6_SOURCE_PREFIX: u8 = 56;

/// Returns the client-subnet option carried by the message, if any.
pub fn obtain_ecs(msg: &Message) -> Option<ClientSubnet> {
    let edns = msg.extensions().as_ref()?;
    match edns.options().get(EdnsCode::Subnet) {
        Some(EdnsOption::Subnet(subnet)) => Some(subnet.clone()),
        _ => None,
    }
}

/// Drops any client-subnet option. The OPT record itself stays in place so
/// other EDNS options survive.
pub fn remove_ecs(msg: &mut Message) {
    if let Some(edns) = msg.extensions_mut().as_mut() {
        edns.options_mut().remove(EdnsCode::Subnet);
    }
}

/// Replaces (or inserts) the client-subnet option with one derived from `ip`,
/// using the fixed source prefixes and a zero scope. An OPT record is created
/// when the message has none.
pub fn change_ecs(msg: &mut Message, ip: IpAddr) {
    let source_prefix = match ip {
        IpAddr::V4(_) => ECS_V4_SOURCE_PREFIX,
        IpAddr::V6(_) => ECS_V6_SOURCE_PREFIX,
    };
    let edns = msg.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        edns
    });
    edns.options_mut().remove(EdnsCode::Subnet);
    edns.options_mut()
        .insert(EdnsOption::Subnet(ClientSubnet::new(ip, source_prefix, 0)));
}

/// True for addresses that must never be advertised as an ECS subnet:
/// RFC 1918 and RFC 4193 ranges, loopback, link-local, unspecified.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Parses a comma-separated list of IPs or CIDRs into ECS candidate IPs.
/// Blank and unparsable entries are skipped, private addresses are rejected,
/// duplicates keep their first occurrence.
pub fn candidate_ips(csv: &str) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for entry in csv.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let ip = if let Ok(net) = entry.parse::<IpNet>() {
            net.addr()
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            ip
        } else {
            continue;
        };
        if is_private_ip(&ip) || ips.contains(&ip) {
            continue;
        }
        ips.push(ip);
    }
    ips
}
