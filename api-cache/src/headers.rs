use http::{header, HeaderMap, HeaderName};

static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Headers that describe a single connection rather than the message.
pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// Whether a client request header is forwarded upstream.
pub(crate) fn forward_upstream(name: &HeaderName) -> bool {
    !is_hop_by_hop(name)
        && *name != header::HOST
        && *name != header::CONTENT_LENGTH
}

/// Whether an upstream or stored response header is copied to the client.
pub(crate) fn forward_downstream(name: &HeaderName) -> bool {
    !is_hop_by_hop(name) && *name != header::CONTENT_LENGTH
}

/// Copies every header accepted by `keep` from `from` into `to`, preserving
/// repeated values.
pub(crate) fn copy_headers(
    from: &HeaderMap,
    to: &mut HeaderMap,
    keep: fn(&HeaderName) -> bool,
) {
    for (name, value) in from {
        if keep(name) {
            to.append(name.clone(), value.clone());
        }
    }
}
