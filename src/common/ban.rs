//! Process-wide registry of banned peer IPs
//!
//! Server-mode relays add a peer here after its decrypted bytes fail to
//! parse as an address header, which is the signature of a probe or a
//! wrong password. Entries live for the lifetime of the process.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;

static BANNED: Lazy<Mutex<HashSet<IpAddr>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Ban a peer IP
pub fn ban(ip: IpAddr) {
    BANNED.lock().insert(ip);
}

/// Whether a peer IP has been banned
pub fn is_banned(ip: &IpAddr) -> bool {
    BANNED.lock().contains(ip)
}
