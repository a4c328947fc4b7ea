//! Server discovery for the opening handshake.
//!
//! The handshake itself is driven by the connection engine; this module
//! holds the pieces that do not touch the socket: the `INFO` reply
//! parser and the server identity it yields.

/// What the server claims to be, derived from `redis_mode` and `role`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerType {
    Master,
    Replica,
    Sentinel,
    Unknown,
}

/// Identity discovered during the handshake, or supplied up front via
/// the configuration to skip discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: Option<String>,
    pub server_type: ServerType,
}

impl ServerInfo {
    pub fn new(version: impl Into<String>, server_type: ServerType) -> ServerInfo {
        ServerInfo {
            version: Some(version.into()),
            server_type,
        }
    }
}

/// Parse an `INFO` reply: `key:value` lines, skipping blanks and `#`
/// section comments.
pub(crate) fn parse_info(text: &str) -> ServerInfo {
    let mut version = None;
    let mut server_type = ServerType::Unknown;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key {
            "redis_version" => version = version_prefix(value),
            // Sentinel wins over role: a sentinel also reports a role.
            "redis_mode" if value == "sentinel" => server_type = ServerType::Sentinel,
            "role" if server_type == ServerType::Unknown => {
                server_type = match value {
                    "master" => ServerType::Master,
                    "slave" => ServerType::Replica,
                    _ => ServerType::Unknown,
                };
            }
            _ => {}
        }
    }

    ServerInfo {
        version,
        server_type,
    }
}

/// `CLIENT SETNAME` shipped in 2.6.9; with no version known the command
/// is not attempted.
pub(crate) fn supports_client_name(info: &ServerInfo) -> bool {
    let Some(version) = info.version.as_deref() else {
        return false;
    };
    let mut parts = version.split('.').map(|part| part.parse::<u32>().unwrap_or(0));
    let version = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    version >= (2, 6, 9)
}

/// The leading `[0-9.]+` prefix of the version field, if any.
fn version_prefix(value: &str) -> Option<String> {
    let end = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    if end == 0 {
        None
    } else {
        Some(value[..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_and_role() {
        let info = parse_info(
            "# Server\r\n\
             redis_version:7.2.4\r\n\
             redis_mode:standalone\r\n\
             \r\n\
             # Replication\r\n\
             role:master\r\n",
        );
        assert_eq!(info.version.as_deref(), Some("7.2.4"));
        assert_eq!(info.server_type, ServerType::Master);
    }

    #[test]
    fn replica_role() {
        let info = parse_info("role:slave\r\nredis_version:6.0.16\r\n");
        assert_eq!(info.server_type, ServerType::Replica);
        assert_eq!(info.version.as_deref(), Some("6.0.16"));
    }

    #[test]
    fn sentinel_mode_wins_over_role() {
        let info = parse_info("role:master\r\nredis_mode:sentinel\r\n");
        assert_eq!(info.server_type, ServerType::Sentinel);
    }

    #[test]
    fn version_takes_numeric_prefix_only() {
        let info = parse_info("redis_version:7.4.0-rc1\r\n");
        assert_eq!(info.version.as_deref(), Some("7.4.0"));
    }

    #[test]
    fn client_name_support_is_gated_on_version() {
        let supported = |version: &str| {
            supports_client_name(&ServerInfo::new(version, ServerType::Master))
        };
        assert!(supported("2.6.9"));
        assert!(supported("2.7.0"));
        assert!(supported("7.2.4"));
        assert!(!supported("2.6.8"));
        assert!(!supported("1.3"));
        assert!(!supports_client_name(&ServerInfo {
            version: None,
            server_type: ServerType::Unknown,
        }));
    }

    #[test]
    fn tolerates_garbage_lines() {
        let info = parse_info("not a pair\r\nredis_version:abc\r\n");
        assert_eq!(info.version, None);
        assert_eq!(info.server_type, ServerType::Unknown);
    }
}
