use crate::config::KubernetesConfig;

/// Shorten a Waiter service-id into a cluster-legal workload name.
///
/// Service ids end in a 32-hex-digit hash preceded by a human-readable
/// token (`…-myapp-e8b625cc…474b213d`). The budget left after reserving the
/// pod-name suffix goes first to the hash (full hash when the budget allows
/// 48 characters or more, first-8 + last-8 otherwise), the remainder to the
/// token, truncated from the right.
#[must_use]
pub fn app_name(config: &KubernetesConfig, service_id: &str) -> String {
    shorten(service_id, config.max_name_length, config.pod_suffix_length)
}

#[must_use]
pub fn shorten(service_id: &str, max_name_length: usize, pod_suffix_length: usize) -> String {
    let budget = max_name_length.saturating_sub(pod_suffix_length + 1);
    let Some((token, x, y, z)) = split_hashed_id(service_id) else {
        return sanitized(service_id, budget);
    };
    let hash = if budget >= 48 {
        format!("{x}{y}{z}")
    } else {
        format!("{x}{z}")
    };
    let token_budget = budget.saturating_sub(hash.len() + 1);
    let token = &token[..token.len().min(token_budget)];
    if token.is_empty() {
        hash
    } else {
        format!("{token}-{hash}")
    }
}

/// Split `…-<token>-<hash:32>` into the token and the hash thirds
/// (first 8, middle, last 8).
fn split_hashed_id(service_id: &str) -> Option<(&str, &str, &str, &str)> {
    let (head, hash) = service_id.rsplit_once('-')?;
    if hash.len() != 32 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let token_start = head
        .rfind(|c: char| !c.is_ascii_alphanumeric())
        .map_or(0, |i| i + 1);
    let token = &head[token_start..];
    if token.is_empty() {
        return None;
    }
    Some((token, &hash[..8], &hash[8..24], &hash[24..]))
}

/// Fallback for ids that do not carry the expected hash shape.
fn sanitized(service_id: &str, budget: usize) -> String {
    let mut name: String = service_id
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(budget);
    name.trim_matches('-').to_string()
}
