//! Recipient normalization and to/cc resolution for certificate replies.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static ANGLE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>]+)>").expect("static regex"));

/// Bare address from `"Name <addr>"` or `addr`, trimmed.
fn bare_address(raw: &str) -> &str {
    match ANGLE_ADDR.captures(raw).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim(),
        None => raw.trim(),
    }
}

/// Strip display names, trim, and drop blanks and case-insensitive
/// duplicates. The first occurrence keeps its casing and position.
pub fn normalize_addresses<S: AsRef<str>>(addresses: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in addresses {
        let addr = bare_address(raw.as_ref());
        if addr.is_empty() {
            continue;
        }
        if seen.insert(addr.to_lowercase()) {
            out.push(addr.to_string());
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

impl Recipients {
    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.cc.is_empty()
    }
}

/// With an explicit recipient, it becomes the sole `to` and every other
/// original address moves to `cc`. Without one, the original split is kept
/// minus any `cc` entry already in `to`.
pub fn resolve_recipients(explicit: &str, to: &[String], cc: &[String]) -> Recipients {
    let to = normalize_addresses(to);
    let cc = normalize_addresses(cc);
    let explicit = bare_address(explicit);

    if explicit.is_empty() {
        let in_to: HashSet<String> = to.iter().map(|a| a.to_lowercase()).collect();
        let cc = cc
            .into_iter()
            .filter(|a| !in_to.contains(&a.to_lowercase()))
            .collect();
        return Recipients { to, cc };
    }

    let explicit_key = explicit.to_lowercase();
    let everyone: Vec<String> = to.into_iter().chain(cc).collect();
    let cc = normalize_addresses(&everyone)
        .into_iter()
        .filter(|a| a.to_lowercase() != explicit_key)
        .collect();

    Recipients {
        to: vec![explicit.to_string()],
        cc,
    }
}

/// Drop `own` from both lists so replies never go back to the mailbox itself.
pub fn without_address(recipients: Recipients, own: &str) -> Recipients {
    let own = bare_address(own).to_lowercase();
    let keep = |list: Vec<String>| -> Vec<String> {
        list.into_iter().filter(|a| a.to_lowercase() != own).collect()
    };
    Recipients {
        to: keep(recipients.to),
        cc: keep(recipients.cc),
    }
}
