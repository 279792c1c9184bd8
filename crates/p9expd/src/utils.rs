/// Split a `proto!address!port` argument into the protocol and the
/// address to bind. Unix sockets ignore the port field.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    match proto {
        "unix" => Some((proto, addr.to_owned())),
        _ => Some((proto, format!("{}:{}", addr, port))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_addresses_join_host_and_port() {
        assert_eq!(
            parse_proto("tcp!0.0.0.0!564"),
            Some(("tcp", "0.0.0.0:564".to_owned()))
        );
    }

    #[test]
    fn unix_addresses_keep_the_path() {
        assert_eq!(
            parse_proto("unix!/tmp/p9.sock!0"),
            Some(("unix", "/tmp/p9.sock".to_owned()))
        );
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert_eq!(parse_proto("tcp!0.0.0.0"), None);
        assert_eq!(parse_proto(""), None);
    }
}
