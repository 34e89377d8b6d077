// ── Token validation ──
//
// Pure checks over a token row: revocation, expiry, and optional
// CIDR-based IP pinning. The transport layer runs these before any
// subscribe or command reaches the gateway core; `Gateway::check_token`
// wires them to the directory lookup.

use std::net::IpAddr;

use chrono::Utc;
use thiserror::Error;

use crate::model::TokenRecord;

/// Why a presented token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenRejection {
    #[error("token not found")]
    NotFound,

    #[error("token expired or revoked")]
    ExpiredOrRevoked,

    #[error("client IP could not be determined")]
    InvalidClientIp,

    #[error("client IP not in allowlist")]
    IpNotAllowed,
}

/// Validate a token row against the caller's IP.
///
/// An absent allowlist disables IP pinning; an allowlist with no
/// matching block rejects. Tokens with [`NotFound`](TokenRejection::NotFound)
/// never reach this function -- that case belongs to the lookup.
pub fn validate_token(token: &TokenRecord, client_ip: Option<&str>) -> Result<(), TokenRejection> {
    if token.revoked || token.expires_at <= Utc::now().timestamp() {
        return Err(TokenRejection::ExpiredOrRevoked);
    }

    let Some(allowlist) = &token.ip_allowlist else {
        return Ok(());
    };

    let Some(ip) = client_ip else {
        return Err(TokenRejection::InvalidClientIp);
    };
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return Err(TokenRejection::InvalidClientIp);
    };

    if allowlist.iter().any(|cidr| cidr_contains(cidr, addr)) {
        Ok(())
    } else {
        Err(TokenRejection::IpNotAllowed)
    }
}

/// Whether `addr` falls inside `cidr` (`a.b.c.d/len`, `x::/len`, or a
/// bare address meaning a single-host block). Malformed blocks never
/// match -- an unparseable allowlist entry fails closed.
fn cidr_contains(cidr: &str, addr: IpAddr) -> bool {
    let (net_str, len_str) = match cidr.split_once('/') {
        Some((net, len)) => (net, Some(len)),
        None => (cidr, None),
    };

    let Ok(net) = net_str.trim().parse::<IpAddr>() else {
        return false;
    };

    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let len = match len_str {
                Some(l) => match l.trim().parse::<u32>() {
                    Ok(v) if v <= 32 => v,
                    _ => return false,
                },
                None => 32,
            };
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let len = match len_str {
                Some(l) => match l.trim().parse::<u32>() {
                    Ok(v) if v <= 128 => v,
                    _ => return false,
                },
                None => 128,
            };
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::NEVER_EXPIRES_SECONDS;
    use std::collections::HashSet;

    fn token(revoked: bool, expires_at: i64, allowlist: Option<Vec<&str>>) -> TokenRecord {
        TokenRecord {
            id: "tok-1".into(),
            entity_ids: HashSet::new(),
            revoked,
            expires_at,
            ip_allowlist: allowlist.map(|v| v.into_iter().map(str::to_owned).collect()),
        }
    }

    #[test]
    fn valid_token_without_allowlist_passes() {
        let t = token(false, NEVER_EXPIRES_SECONDS, None);
        assert_eq!(validate_token(&t, None), Ok(()));
    }

    #[test]
    fn revoked_token_is_rejected() {
        let t = token(true, NEVER_EXPIRES_SECONDS, None);
        assert_eq!(
            validate_token(&t, None),
            Err(TokenRejection::ExpiredOrRevoked)
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let t = token(false, Utc::now().timestamp() - 10, None);
        assert_eq!(
            validate_token(&t, None),
            Err(TokenRejection::ExpiredOrRevoked)
        );
    }

    #[test]
    fn allowlisted_ip_passes() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["192.168.1.0/24"]));
        assert_eq!(validate_token(&t, Some("192.168.1.42")), Ok(()));
    }

    #[test]
    fn ip_outside_block_is_rejected() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["192.168.1.0/24"]));
        assert_eq!(
            validate_token(&t, Some("10.0.0.5")),
            Err(TokenRejection::IpNotAllowed)
        );
    }

    #[test]
    fn bare_address_matches_exactly() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["203.0.113.7"]));
        assert_eq!(validate_token(&t, Some("203.0.113.7")), Ok(()));
        assert_eq!(
            validate_token(&t, Some("203.0.113.8")),
            Err(TokenRejection::IpNotAllowed)
        );
    }

    #[test]
    fn missing_client_ip_with_allowlist_is_rejected() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["192.168.1.0/24"]));
        assert_eq!(
            validate_token(&t, None),
            Err(TokenRejection::InvalidClientIp)
        );
    }

    #[test]
    fn unparseable_client_ip_is_rejected() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["192.168.1.0/24"]));
        assert_eq!(
            validate_token(&t, Some("not-an-ip")),
            Err(TokenRejection::InvalidClientIp)
        );
    }

    #[test]
    fn malformed_cidr_never_matches() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["garbage/99"]));
        assert_eq!(
            validate_token(&t, Some("192.168.1.1")),
            Err(TokenRejection::IpNotAllowed)
        );
    }

    #[test]
    fn ipv6_block_matches() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["2001:db8::/32"]));
        assert_eq!(validate_token(&t, Some("2001:db8::1")), Ok(()));
        assert_eq!(
            validate_token(&t, Some("2001:db9::1")),
            Err(TokenRejection::IpNotAllowed)
        );
    }

    #[test]
    fn v4_block_never_matches_v6_caller() {
        let t = token(false, NEVER_EXPIRES_SECONDS, Some(vec!["192.168.1.0/24"]));
        assert_eq!(
            validate_token(&t, Some("::1")),
            Err(TokenRejection::IpNotAllowed)
        );
    }
}
