use std::net::IpAddr;

use serde::Serialize;

/// A LAN address players can reach the server on.
#[derive(Debug, Clone, Serialize)]
pub struct JoinAddress {
    pub name: String,
    pub address: String,
}

/// Enumerate non-loopback IPv4 interfaces for the join URL display.
pub fn join_addresses() -> Vec<JoinAddress> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => ifas
            .into_iter()
            .filter(|(_, ip)| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback()))
            .map(|(name, ip)| JoinAddress {
                name,
                address: ip.to_string(),
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// The URL advertised to players on room creation, if any interface is up.
pub fn advertised_join_url(port: u16) -> Option<String> {
    join_addresses()
        .first()
        .map(|ifa| format!("http://{}:{}/play", ifa.address, port))
}
