use std::{env, fmt, path::PathBuf};

/// The well-known name the agent and controllers communicate over
pub const SOCKET_NAME: &str = "dtf_socket";

/// Overrides the default socket address, `@name` selects the abstract namespace
pub const SOCKET_ENV: &str = "DTF_SOCKET";

const FALLBACK_SOCKET_DIR: &str = "/tmp";

/// Address of the agent's listening socket.
///
/// On Linux and Android the agent listens in the abstract namespace, which has no
/// filesystem node and is released as soon as the listener closes. Other Unix
/// systems fall back to a socket file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    /// Linux abstract namespace name, written as `@name`
    Abstract(String),
    /// Filesystem socket node
    Path(PathBuf),
}

impl SocketAddress {
    /// Parses `@name` as an abstract address and anything else as a path.
    pub fn parse(value: &str) -> Self {
        match value.strip_prefix('@') {
            Some(name) => Self::Abstract(name.to_string()),
            None => Self::Path(PathBuf::from(value)),
        }
    }

    /// Reads the address from `DTF_SOCKET`, falling back to the default.
    pub fn from_env() -> Self {
        env::var(SOCKET_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| Self::parse(value.trim()))
            .unwrap_or_default()
    }

    /// The socket file used where the abstract namespace is unavailable
    pub fn filesystem_fallback() -> Self {
        Self::Path(PathBuf::from(FALLBACK_SOCKET_DIR).join(SOCKET_NAME))
    }

    /// Returns true when the address lives in the abstract namespace.
    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Abstract(_))
    }
}

impl Default for SocketAddress {
    fn default() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            Self::Abstract(SOCKET_NAME.to_string())
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            Self::filesystem_fallback()
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abstract(name) => write!(f, "@{name}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_distinguishes_abstract_and_path() {
        assert_eq!(
            SocketAddress::parse("@dtf_socket"),
            SocketAddress::Abstract("dtf_socket".to_string())
        );
        assert_eq!(
            SocketAddress::parse("/data/local/tmp/dtf.sock"),
            SocketAddress::Path(PathBuf::from("/data/local/tmp/dtf.sock"))
        );
    }

    #[test]
    fn display_round_trips_through_parse() {
        for raw in ["@agent", "/tmp/agent.sock"] {
            let address = SocketAddress::parse(raw);
            assert_eq!(address.to_string(), raw);
            assert_eq!(SocketAddress::parse(&address.to_string()), address);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn default_is_the_abstract_well_known_name() {
        assert_eq!(
            SocketAddress::default(),
            SocketAddress::Abstract(SOCKET_NAME.to_string())
        );
        assert!(SocketAddress::default().is_abstract());
    }
}
