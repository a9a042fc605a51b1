/// Canonical form of a recipient or session address.
///
/// EVM addresses collapse to `eip155:0x...` regardless of chain id or case. Other
/// namespaced identifiers (`nft:`, `scw:`, ...) are lowercased and kept as is.
/// Returns `None` for anything that is not an address.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();

    if let Some(rest) = lower.strip_prefix("eip155:") {
        // eip155:<chain>:<addr> or eip155:<addr>
        let addr = rest.rsplit(':').next().unwrap_or(rest);
        return is_evm_address(addr).then(|| format!("eip155:{addr}"));
    }
    if lower.starts_with("0x") {
        return is_evm_address(&lower).then(|| format!("eip155:{lower}"));
    }
    match lower.split_once(':') {
        Some((namespace, rest)) if !namespace.is_empty() && !rest.is_empty() => Some(lower),
        _ => None,
    }
}

fn is_evm_address(addr: &str) -> bool {
    addr.strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
