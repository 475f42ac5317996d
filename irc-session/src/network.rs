//! Best-effort network names derived from server host names.
//!
//! `irc.libera.chat` becomes `libera.chat`, `irc.foo.co.uk` becomes
//! `foo.co.uk`. This is a display label only; it is wrong for some hosts.

use std::net::IpAddr;

const SECOND_LEVEL: &[&str] = &["co", "com", "org", "net", "ac", "gov", "edu"];

pub fn network_from_host(host: &str) -> String {
    let host = host.trim_end_matches('.');
    if host.parse::<IpAddr>().is_ok() || host.starts_with('[') {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }

    let tld = labels[labels.len() - 1];
    let second = labels[labels.len() - 2];
    let keep = if tld.len() == 2 && SECOND_LEVEL.contains(&second.to_ascii_lowercase().as_str()) {
        3
    } else {
        2
    };
    labels[labels.len().saturating_sub(keep)..].join(".")
}
