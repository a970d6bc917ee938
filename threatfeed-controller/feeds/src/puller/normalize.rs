use ipnet::IpNet;
use std::net::IpAddr;

/// Normalizes entries to CIDR notation, appending `/32` or `/128` to bare
/// addresses. Invalid entries are dropped with a single warning.
pub fn normalize_ips(feed: &str, entries: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut nets = Vec::new();
    let mut dropped = 0usize;
    let mut first_invalid = None;
    for entry in entries {
        if let Ok(net) = entry.parse::<IpNet>() {
            nets.push(net.to_string());
        } else if let Ok(addr) = entry.parse::<IpAddr>() {
            nets.push(IpNet::from(addr).to_string());
        } else {
            dropped += 1;
            first_invalid.get_or_insert(entry);
        }
    }
    if let Some(first) = first_invalid {
        tracing::warn!(%feed, dropped, %first, "Dropped invalid IP set entries");
    }
    nets
}

pub fn canonicalize_domains(entries: impl IntoIterator<Item = String>) -> Vec<String> {
    entries
        .into_iter()
        .map(|e| canonicalize(&e))
        .filter(|d| !d.is_empty())
        .collect()
}

/// Returns the canonical form of a domain name: IDNA labels decoded to
/// Unicode, lower-cased, with empty labels removed.
pub fn canonicalize(domain: &str) -> String {
    let collapsed = domain
        .trim()
        .split('.')
        .filter(|label| !label.is_empty())
        .collect::<Vec<_>>()
        .join(".");

    let (unicode, result) = idna::domain_to_unicode(&collapsed);
    match result {
        Ok(()) => unicode.to_lowercase(),
        Err(_) => collapsed.to_lowercase(),
    }
}
