use axum::{
    extract::ConnectInfo,
    http::{header, Extensions, HeaderMap},
};
use std::net::SocketAddr;

/// Who sent a request, as far as proxies and the socket tell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestOrigin {
    pub fn from_parts(headers: &HeaderMap, extensions: &Extensions) -> Self {
        Self {
            ip_address: client_ip(headers, extensions),
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(str::to_string),
        }
    }

    /// Key under which a caller's requests are counted.
    pub fn caller_key(&self) -> &str {
        self.ip_address.as_deref().unwrap_or("unknown")
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// First hop of X-Forwarded-For, then `for=` of Forwarded, then X-Real-IP, then the socket peer.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    let forwarded_for = header_str(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(str::trim);

    let forwarded = header_str(headers, "forwarded").and_then(|value| {
        value
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("for="))
            .map(|ip| ip.trim().trim_matches('"'))
    });

    forwarded_for
        .or(forwarded)
        .or_else(|| header_str(headers, "x-real-ip"))
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn proxy_headers_take_precedence() {
        let exts = Extensions::new();
        let cases = [
            (headers(&[("x-forwarded-for", "1.2.3.4, 10.0.0.1")]), "1.2.3.4"),
            (headers(&[("forwarded", "for=5.6.7.8;proto=http")]), "5.6.7.8"),
            (headers(&[("x-real-ip", " 9.9.9.9 ")]), "9.9.9.9"),
        ];
        for (map, expected) in cases {
            assert_eq!(client_ip(&map, &exts).as_deref(), Some(expected));
        }
    }

    #[test]
    fn socket_peer_is_the_fallback() {
        let mut exts = Extensions::new();
        exts.insert(ConnectInfo::<SocketAddr>("7.7.7.7:1234".parse().unwrap()));
        assert_eq!(client_ip(&HeaderMap::new(), &exts).as_deref(), Some("7.7.7.7"));
    }

    #[test]
    fn origin_without_any_source() {
        let origin = RequestOrigin::from_parts(
            &headers(&[("user-agent", "exam-browser/2.1")]),
            &Extensions::new(),
        );
        assert_eq!(origin.ip_address, None);
        assert_eq!(origin.caller_key(), "unknown");
        assert_eq!(origin.user_agent.as_deref(), Some("exam-browser/2.1"));
    }
}
