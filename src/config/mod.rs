pub mod parser;

use std::path::PathBuf;

/// Largest POST body accepted unless configured otherwise
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 250_000_000;

/// A holder for app configuration
///
/// Built once at startup from defaults, an optional TOML file and the
/// command line, then handed by reference to every request.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the `*.website` trees
    pub root: Option<PathBuf>,
    /// Account to switch to when started as root
    pub user: Option<String>,
    /// CSV access log; may contain strftime placeholders
    pub log_file: Option<String>,
    /// Input arrives decrypted from a TLS-terminating front end
    pub https: bool,
    pub family: Family,
    /// Enter a chroot jail at `root` when started as root
    pub jail: bool,
    /// Disables all deadlines
    pub debug: bool,
    /// Listen on this port instead of serving stdin/stdout
    pub port: Option<u16>,
    pub max_content_length: u64
}

impl Default for Config {
    fn default() -> Config {
        Config {
            root: None,
            user: None,
            log_file: None,
            https: false,
            family: Family::Any,
            jail: true,
            debug: false,
            port: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH
        }
    }
}

impl Config {
    /// Standalone servers accept connections themselves; otherwise a
    /// super-server hands us one on stdin/stdout.
    #[inline]
    pub fn standalone(&self) -> bool {
        self.port.is_some()
    }

    /// URL scheme clients used to reach us
    #[inline]
    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }
}

/// Which address family a standalone server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    Ipv4,
    Ipv6
}

impl Family {
    pub fn from_name(name: &str) -> Option<Family> {
        match name {
            "any" => Some(Family::Any),
            "ipv4" => Some(Family::Ipv4),
            "ipv6" => Some(Family::Ipv6),
            _ => None
        }
    }
}
