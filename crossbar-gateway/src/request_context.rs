//! Per-request context, injected as an axum extension.

use std::net::IpAddr;

/// Identity of one inbound request. The id is generated at admission and
/// stays stable across every retry attempt and in the response envelope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub remote_ip: Option<IpAddr>,
}

impl RequestContext {
    pub fn new(remote_ip: Option<IpAddr>) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            remote_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = RequestContext::new(None);
        let b = RequestContext::new(None);
        assert_ne!(a.request_id, b.request_id);
        assert!(a.request_id.starts_with("req_"));
    }
}
