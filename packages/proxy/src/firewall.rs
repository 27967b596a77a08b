// ABOUTME: Destination firewall evaluation for proxied connections
// ABOUTME: Domain, wildcard, IP and CIDR rules; first match wins, otherwise the policy default

use std::net::IpAddr;
use stratus_core::{FirewallAction, FirewallPolicy};

/// Result of checking one destination against a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallDecision {
    pub action: FirewallAction,
    /// Destination of the rule that matched, `None` when the default applied
    pub matched_rule: Option<String>,
}

impl FirewallDecision {
    pub fn is_allowed(&self) -> bool {
        self.action == FirewallAction::Allow
    }
}

/// Decide whether `host` may be reached. Without a policy everything is allowed.
pub fn evaluate(policy: Option<&FirewallPolicy>, host: &str) -> FirewallDecision {
    let Some(policy) = policy else {
        return FirewallDecision {
            action: FirewallAction::Allow,
            matched_rule: None,
        };
    };

    let host = normalize_host(host);
    for rule in &policy.rules {
        if rule_matches(&rule.destination, &host) {
            return FirewallDecision {
                action: rule.action,
                matched_rule: Some(rule.destination.clone()),
            };
        }
    }

    FirewallDecision {
        action: policy.default_action,
        matched_rule: None,
    }
}

/// Decide whether `host`, resolved to `ip`, may be reached. A rule matches on either the
/// name or the address, so IP and CIDR rules also cover hostnames.
pub fn evaluate_resolved(
    policy: Option<&FirewallPolicy>,
    host: &str,
    ip: IpAddr,
) -> FirewallDecision {
    let Some(policy) = policy else {
        return FirewallDecision {
            action: FirewallAction::Allow,
            matched_rule: None,
        };
    };

    let host = normalize_host(host);
    let address = ip.to_string();
    for rule in &policy.rules {
        if rule_matches(&rule.destination, &host) || rule_matches(&rule.destination, &address) {
            return FirewallDecision {
                action: rule.action,
                matched_rule: Some(rule.destination.clone()),
            };
        }
    }

    FirewallDecision {
        action: policy.default_action,
        matched_rule: None,
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn rule_matches(destination: &str, host: &str) -> bool {
    let destination = normalize_host(destination);

    if let Ok(ip) = host.parse::<IpAddr>() {
        if let Some((network, prefix)) = destination.split_once('/') {
            return match (network.parse::<IpAddr>(), prefix.parse::<u8>()) {
                (Ok(network), Ok(prefix)) => cidr_contains(network, prefix, ip),
                _ => false,
            };
        }
        return destination.parse::<IpAddr>().map(|d| d == ip).unwrap_or(false);
    }

    if let Some(suffix) = destination.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{}", suffix));
    }
    host == destination
}

fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) if prefix <= 32 => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) if prefix <= 128 => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}
