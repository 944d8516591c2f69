//! Turns a pingora request into the engine's [`RateLimitContext`].
//!
//! Identity is resolved upstream of the gateway (an auth layer or the
//! load balancer) and arrives as plain request headers. `X-Forwarded-For`
//! is only believed when the socket peer is a trusted proxy.

use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;
use ipnet::IpNet;
use ratewarden_common::RateLimitContext;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";
pub const API_KEY_HEADER: &str = "x-api-key";
/// `x-ratelimit-attr-tenant: acme` becomes attribute `tenant = acme`.
pub const ATTRIBUTE_PREFIX: &str = "x-ratelimit-attr-";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Drop a trailing port, keeping bare IPv6 addresses intact.
fn strip_port(addr: &str) -> String {
    if addr.parse::<IpAddr>().is_ok() {
        return addr.to_string();
    }
    match addr.parse::<SocketAddr>() {
        Ok(sock) => sock.ip().to_string(),
        Err(_) => addr.to_string(),
    }
}

fn is_trusted(peer: &str, trusted: &[IpNet]) -> bool {
    match peer.parse::<IpAddr>() {
        Ok(addr) => trusted.iter().any(|net| net.contains(&addr)),
        Err(_) => false,
    }
}

/// The socket peer, or the first `X-Forwarded-For` hop when the peer is a
/// trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: Option<&str>, trusted: &[IpNet]) -> String {
    let peer = peer.map(strip_port);
    let forwarded = match &peer {
        Some(addr) if is_trusted(addr, trusted) => header(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(strip_port),
        _ => None,
    };
    forwarded.or(peer).unwrap_or_default()
}

pub fn build_context(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    peer: Option<&str>,
    trusted: &[IpNet],
) -> RateLimitContext {
    let mut ctx =
        RateLimitContext::new(client_ip(headers, peer, trusted), path).with_method(method);

    if let Some(user) = header(headers, USER_ID_HEADER) {
        ctx = ctx.with_user(user);
    }
    if let Some(role) = header(headers, ROLE_HEADER) {
        ctx = ctx.with_role(role);
    }
    if let Some(key) = header(headers, API_KEY_HEADER) {
        ctx = ctx.with_api_key(key);
    }
    if let Some(agent) = header(headers, http::header::USER_AGENT.as_str()) {
        ctx = ctx.with_user_agent(agent);
    }

    for (name, value) in headers {
        let Some(attr) = name.as_str().strip_prefix(ATTRIBUTE_PREFIX) else {
            continue;
        };
        if let Ok(value) = value.to_str() {
            ctx = ctx.with_attribute(attr, value.trim());
        }
    }

    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn load_balancers() -> Vec<IpNet> {
        vec!["10.0.0.0/8".parse().unwrap()]
    }

    #[test]
    fn forwarded_for_is_honoured_from_trusted_proxy() {
        let h = headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        assert_eq!(
            client_ip(&h, Some("10.0.0.1:5555"), &load_balancers()),
            "203.0.113.9"
        );
    }

    #[test]
    fn forwarded_for_is_ignored_from_untrusted_peer() {
        let h = headers(&[("x-forwarded-for", "127.0.0.1")]);
        assert_eq!(
            client_ip(&h, Some("198.51.100.4:41000"), &load_balancers()),
            "198.51.100.4"
        );
        // No trusted proxies configured: the header never counts.
        assert_eq!(client_ip(&h, Some("10.0.0.1:5555"), &[]), "10.0.0.1");
    }

    #[test]
    fn peer_port_is_stripped() {
        let h = HeaderMap::new();
        assert_eq!(client_ip(&h, Some("198.51.100.4:41000"), &[]), "198.51.100.4");
        assert_eq!(client_ip(&h, Some("[2001:db8::1]:443"), &[]), "2001:db8::1");
        assert_eq!(client_ip(&h, Some("2001:db8::1"), &[]), "2001:db8::1");
        assert_eq!(client_ip(&h, None, &[]), "");
    }

    #[test]
    fn identity_headers_populate_context() {
        let h = headers(&[
            ("x-user-id", "u-42"),
            ("x-user-role", "admin"),
            ("x-api-key", "k-1"),
            ("user-agent", "Mozilla/5.0"),
            ("x-ratelimit-attr-tenant", "acme"),
        ]);
        let ctx = build_context("POST", "/api/orders/create", &h, Some("192.0.2.1:80"), &[]);

        assert_eq!(ctx.ip, "192.0.2.1");
        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.endpoint, "/api/orders/create");
        assert_eq!(ctx.user_id.as_deref(), Some("u-42"));
        assert_eq!(ctx.role.as_deref(), Some("admin"));
        assert_eq!(ctx.api_key.as_deref(), Some("k-1"));
        assert_eq!(ctx.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(ctx.attributes.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn blank_headers_are_ignored() {
        let h = headers(&[("x-user-id", "  "), ("user-agent", "")]);
        let ctx = build_context("GET", "/", &h, Some("192.0.2.1"), &[]);
        assert!(ctx.user_id.is_none());
        assert!(ctx.user_agent.is_none());
    }
}
