//! URL scheme to protocol routing
//!
//! A total function over arbitrary input: recognized schemes map to their
//! handler's protocol, everything else is HTTP. MQTT has no scheme entry;
//! it is reached through the engine's MQTT helper API.

use crate::envelope::Protocol;

/// Fixed scheme table consulted by the dispatcher
pub fn detect_protocol(url: &str) -> Protocol {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Protocol::WebSocket
    } else if url.starts_with("mysql://")
        || url.starts_with("postgresql://")
        || url.starts_with("mongodb://")
    {
        Protocol::Database
    } else if url.starts_with("grpc://") || url.starts_with("grpcs://") {
        Protocol::Grpc
    } else if url.starts_with("tcp://") {
        Protocol::Tcp
    } else if url.starts_with("udp://") {
        Protocol::Udp
    } else {
        Protocol::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_schemes_route_to_their_handlers() {
        assert_eq!(detect_protocol("http://x"), Protocol::Http);
        assert_eq!(detect_protocol("https://x"), Protocol::Http);
        assert_eq!(detect_protocol("ws://x"), Protocol::WebSocket);
        assert_eq!(detect_protocol("wss://x"), Protocol::WebSocket);
        assert_eq!(detect_protocol("mysql://x"), Protocol::Database);
        assert_eq!(detect_protocol("postgresql://x"), Protocol::Database);
        assert_eq!(detect_protocol("mongodb://x"), Protocol::Database);
        assert_eq!(detect_protocol("grpc://x"), Protocol::Grpc);
        assert_eq!(detect_protocol("grpcs://x"), Protocol::Grpc);
        assert_eq!(detect_protocol("tcp://x:80"), Protocol::Tcp);
        assert_eq!(detect_protocol("udp://x:53"), Protocol::Udp);
    }

    #[test]
    fn everything_else_is_http() {
        assert_eq!(detect_protocol(""), Protocol::Http);
        assert_eq!(detect_protocol("ftp://x"), Protocol::Http);
        assert_eq!(detect_protocol("mqtt://broker"), Protocol::Http);
        assert_eq!(detect_protocol("not a url at all"), Protocol::Http);
        assert_eq!(detect_protocol("wsx://close-but-no"), Protocol::Http);
        assert_eq!(detect_protocol("TCP://uppercase-scheme"), Protocol::Http);
    }
}
