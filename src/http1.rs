//! HTTP/1.x header hygiene
//!
//! Framing is left to hyper on both sides of the proxy; what remains here is
//! deciding which headers belong to a single hop and must not be forwarded.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// `Connection: Upgrade` together with `Upgrade: websocket`
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    upgrade && connection_tokens(headers).iter().any(|t| t == "upgrade")
}

/// Strip proxy and hop-by-hop headers from a request about to go upstream.
///
/// `Accept-Encoding` is dropped too unless `keep_accept_encoding` is set, so
/// handlers inspecting bodies see them uncompressed. Upgrade handshakes keep
/// their `Connection` and `Upgrade` headers.
pub fn remove_proxy_headers(headers: &mut HeaderMap, keep_accept_encoding: bool) {
    let upgrade = is_websocket_upgrade(headers);

    for name in connection_tokens(headers) {
        if name == "upgrade" && upgrade {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }

    headers.remove("proxy-connection");
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove("keep-alive");
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    if upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    } else {
        headers.remove(header::CONNECTION);
        headers.remove(header::UPGRADE);
    }
    if !keep_accept_encoding {
        headers.remove(header::ACCEPT_ENCODING);
    }
}

/// Strip hop-by-hop headers from an upstream response.
///
/// `Transfer-Encoding` goes too: the client connection picks its own framing
/// from the body.
pub fn remove_response_hop_headers(headers: &mut HeaderMap) {
    for name in connection_tokens(headers) {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }
    headers.remove(header::CONNECTION);
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
}
