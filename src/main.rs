//! A small virtual-hosting Web server for static files and CGI programs.
//!
//! Run it from a super-server like inetd, with the connection on stdin and
//! stdout:
//!
//!     vhost-httpd --root /var/www
//!
//! or standalone, accepting connections itself:
//!
//!     vhost-httpd --root /var/www --port 8080
//!
//! Each site lives in `<root>/<host>.website`, where `<host>` is the Host
//! header lowercased with every non-alphanumeric character turned into `_`.
//! Requests for unknown hosts go to `<root>/default.website`. Executable
//! files are run as CGI programs; everything else is sent as-is.
//!
//! Settings may also come from a [TOML][toml] file given with `-f`; flags on
//! the command line win over the file:
//!
//! ```toml
//! [server]
//! root = "/var/www"
//! user = "www-data"
//! port = 8080
//! family = "any"
//! jail = true
//! https = false
//! debug = false
//!
//! [log]
//! file = "/var/log/httpd/%Y%m%d.csv"
//!
//! [limits]
//! max_content_length = 250000000
//! ```
//!
//! [toml]: https://github.com/toml-lang/toml

#[macro_use] extern crate log;

mod access_log;
mod cgi;
mod config;
mod deadline;
mod errors;
mod filesystem;
mod log_util;
mod sanitize;
mod server;
mod startup;

use access_log::AccessLog;
use config::parser::{self, parse_file};
use config::{Config, Family};

use clap::builder::BoolishValueParser;
use clap::{value_parser, Arg, ArgMatches, Command};

use std::env;
use std::ffi::OsString;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::process::exit;

fn cli() -> Command {
    Command::new("vhost-httpd")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Alex Hill <alexander.d.hill.89@gmail.com>")
        .about("Serves static files and CGI programs for many virtual hosts")
        .arg(Arg::new("config_file")
             .short('f')
             .value_name("FILE")
             .value_parser(value_parser!(OsString))
             .help("A TOML file with server configuration"))
        .arg(Arg::new("root")
             .long("root")
             .value_name("DIR")
             .value_parser(value_parser!(PathBuf))
             .help("Directory holding the *.website trees"))
        .arg(Arg::new("user")
             .long("user")
             .value_name("USER")
             .help("Account to run as when started by root"))
        .arg(Arg::new("logfile")
             .long("logfile")
             .value_name("FILE")
             .help("CSV access log; strftime placeholders are expanded"))
        .arg(Arg::new("https")
             .long("https")
             .value_name("BOOL")
             .value_parser(BoolishValueParser::new())
             .help("Input is decrypted by a TLS front end"))
        .arg(Arg::new("port")
             .long("port")
             .value_name("N")
             .value_parser(value_parser!(u16))
             .help("Listen on this port instead of serving stdin"))
        .arg(Arg::new("family")
             .long("family")
             .value_name("FAMILY")
             .value_parser(["ipv4", "ipv6", "any"])
             .help("Address family to listen on"))
        .arg(Arg::new("jail")
             .long("jail")
             .value_name("BOOL")
             .value_parser(BoolishValueParser::new())
             .help("Enter a chroot jail at the root when started by root"))
        .arg(Arg::new("debug")
             .long("debug")
             .value_name("BOOL")
             .value_parser(BoolishValueParser::new())
             .help("Disable all time limits"))
}

/// Command-line values take precedence over the file.
fn apply_overrides(config: &mut Config, matches: &ArgMatches) {
    if let Some(root) = matches.get_one::<PathBuf>("root") {
        config.root = Some(root.clone());
    }
    if let Some(user) = matches.get_one::<String>("user") {
        config.user = Some(user.clone());
    }
    if let Some(file) = matches.get_one::<String>("logfile") {
        config.log_file = Some(file.clone());
    }
    if let Some(&https) = matches.get_one::<bool>("https") {
        config.https = https;
    }
    if let Some(&port) = matches.get_one::<u16>("port") {
        config.port = Some(port);
    }
    if let Some(family) = matches.get_one::<String>("family").and_then(|f| Family::from_name(f)) {
        config.family = family;
    }
    if let Some(&jail) = matches.get_one::<bool>("jail") {
        config.jail = jail;
    }
    if let Some(&debug) = matches.get_one::<bool>("debug") {
        config.debug = debug;
    }
}

fn load_config(matches: &ArgMatches) -> Config {
    let config_file = match matches.get_one::<OsString>("config_file") {
        Some(f) => f,
        None => return Config::default()
    };

    match parse_file(config_file) {
        Ok(c) => c,
        Err(parser::Error::Io(e)) => {
            error!("Error opening config file {:?}: {}", config_file, e);
            exit(1);
        },
        Err(parser::Error::Parse(e)) => {
            error!("Errors parsing config file {:?}", config_file);
            for error in e {
                error!("Config file error at line {} column {}: {}",
                       error.line, error.column, error.desc);
            }
            exit(1);
        },
        Err(parser::Error::Validation(message)) => {
            error!("Error in config file: {}", message);
            exit(1);
        }
    }
}

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(log::LevelFilter::Info);

    if let Ok(var) = env::var("HTTPD_LOG") {
        log_builder.parse_filters(&var);
    }

    if let Err(e) = log_builder.try_init() {
        let _ = writeln!(stderr(), "vhost-httpd: Error when initializing logging: {}", e);
        exit(1);
    }

    let matches = cli().get_matches();
    let mut config = load_config(&matches);
    apply_overrides(&mut config, &matches);

    if !config.standalone() && config.root.is_none() {
        error!("No --root given; one is required when serving stdin");
        exit(1);
    }

    let listener = match startup::prepare(&mut config) {
        Ok(l) => l,
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };

    let log = AccessLog::new(config.log_file.clone());
    let result = match listener {
        Some(listener) => server::run_standalone(listener, &config, &log),
        None => server::run_inetd(&config, &log)
    };

    if let Err(e) = result {
        error!("{}", e);
        exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let matches = cli().try_get_matches_from(args).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &matches);
        config
    }

    #[test]
    fn cli_overrides() {
        let config = parse(&["vhost-httpd", "--root", "/srv/www", "--port", "8080",
                             "--https", "yes", "--jail", "off", "--family", "ipv4",
                             "--logfile", "/tmp/%Y.csv", "--user", "www"]);
        assert_eq!(config.root, Some(PathBuf::from("/srv/www")));
        assert_eq!(config.port, Some(8080));
        assert!(config.https);
        assert!(!config.jail);
        assert!(!config.debug);
        assert_eq!(config.family, Family::Ipv4);
        assert_eq!(config.log_file.as_ref().map(|s| &s[..]), Some("/tmp/%Y.csv"));
        assert_eq!(config.user.as_ref().map(|s| &s[..]), Some("www"));
    }

    #[test]
    fn defaults_survive_without_flags() {
        let config = parse(&["vhost-httpd"]);
        assert!(config.jail);
        assert!(!config.standalone());
        assert_eq!(config.max_content_length, config::DEFAULT_MAX_CONTENT_LENGTH);
    }

    #[test]
    fn bad_family_is_rejected() {
        assert!(cli().try_get_matches_from(&["vhost-httpd", "--family", "ipx"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }
}
