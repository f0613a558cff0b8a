use proptest::prelude::*;
use rustgt::core::limits::DEFAULT_PORT;
use rustgt::core::portal::parse_portal;

proptest! {
    // Canonical host:port round-trips exactly.
    #[test]
    fn parse_host_port_roundtrip(host in "[a-z][a-z0-9.-]{0,30}", port in 1u16..=65535) {
        let (h, p) = parse_portal(&format!("{host}:{port}")).unwrap();
        prop_assert_eq!(h, host);
        prop_assert_eq!(p, port.to_string());
    }

    // Bracketed IPv6 keeps its brackets and splits the port cleanly.
    #[test]
    fn parse_bracketed_roundtrip(addr in "[0-9a-f]{1,4}(:[0-9a-f]{1,4}){1,6}", port in 1u16..=65535) {
        let text = format!("[{addr}]:{port}");
        let (h, p) = parse_portal(&text).unwrap();
        prop_assert_eq!(h, format!("[{addr}]"));
        prop_assert_eq!(p, port.to_string());
    }

    // A bare host always gets the default port.
    #[test]
    fn parse_bare_host_defaults(host in "[a-z][a-z0-9.-]{0,30}") {
        let (h, p) = parse_portal(&host).unwrap();
        prop_assert_eq!(h, host);
        prop_assert_eq!(p, DEFAULT_PORT.to_string());
    }

    // A bracketed host without a port also defaults.
    #[test]
    fn parse_bracketed_defaults(addr in "[0-9a-f]{1,4}(:[0-9a-f]{1,4}){1,6}") {
        let (h, p) = parse_portal(&format!("[{addr}]")).unwrap();
        prop_assert_eq!(h, format!("[{addr}]"));
        prop_assert_eq!(p, DEFAULT_PORT.to_string());
    }

    // Unterminated brackets never parse.
    #[test]
    fn parse_unterminated_bracket_fails(addr in "[0-9a-f:]{1,20}") {
        let text = format!("[{}", addr);
        prop_assert!(parse_portal(&text).is_err());
    }
}
