use super::*;
use toml::{Table, Value};

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub fn parse_file<P: AsRef<Path>>(conf: P) -> Result<Config, Error> {
    let mut toml = String::new();
    {
        let mut f = File::open(conf)?;
        f.read_to_string(&mut toml)?;
    }

    parse_str(&toml)
}

pub fn parse_str(toml: &str) -> Result<Config, Error> {
    match toml.parse::<Table>() {
        Ok(table) => config_from_table(table),
        Err(e) => Err(Error::Parse(vec![message_from_error(toml, &e)]))
    }
}

/// Looks up a dotted key like `"server.port"`
fn lookup<'a>(table: &'a Table, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn expect_string<'a>(table: &'a Table, key: &str) -> Result<Option<&'a str>, Error> {
    match lookup(table, key) {
        Some(&Value::String(ref s)) => Ok(Some(&s[..])),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be a string, got a {}",
                    key, val.type_str())
        )),
        None => Ok(None)
    }
}

fn expect_bool(table: &Table, key: &str) -> Result<Option<bool>, Error> {
    match lookup(table, key) {
        Some(&Value::Boolean(b)) => Ok(Some(b)),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be a boolean, got a {}",
                    key, val.type_str())
        )),
        None => Ok(None)
    }
}

fn config_from_table(table: Table) -> Result<Config, Error> {
    let mut config: Config = Default::default();

    if let Some(root) = expect_string(&table, "server.root")? {
        config.root = Some(PathBuf::from(root));
    }

    if let Some(user) = expect_string(&table, "server.user")? {
        config.user = Some(String::from(user));
    }

    match lookup(&table, "server.port") {
        Some(&Value::Integer(p))
            if p <= u16::MAX as i64 &&
            p > 0 => config.port = Some(p as u16),
        Some(&Value::Integer(p)) => return Err(Error::Validation(
            format!("The given port {} is out of range", p)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected the port to be an integer, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    if let Some(family) = expect_string(&table, "server.family")? {
        config.family = match Family::from_name(family) {
            Some(f) => f,
            None => return Err(Error::Validation(
                format!("Unknown address family {:?}", family)
            ))
        };
    }

    if let Some(jail) = expect_bool(&table, "server.jail")? {
        config.jail = jail;
    }

    if let Some(https) = expect_bool(&table, "server.https")? {
        config.https = https;
    }

    if let Some(debug) = expect_bool(&table, "server.debug")? {
        config.debug = debug;
    }

    if let Some(file) = expect_string(&table, "log.file")? {
        config.log_file = Some(String::from(file));
    }

    match lookup(&table, "limits.max_content_length") {
        Some(&Value::Integer(n)) if n >= 0 =>
            config.max_content_length = n as u64,
        Some(&Value::Integer(n)) => return Err(Error::Validation(
            format!("The content length limit {} is negative", n)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected the content length limit to be an integer, \
                     got a {}", val.type_str())
        )),
        None => ()
    }

    Ok(config)
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(Vec<ErrorMessage>),
    Validation(String)
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

/// An owned, rendered version of a TOML syntax error
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub desc: String,
    pub line: usize,
    pub column: usize
}

/// Convert a `toml::de::Error` into an `ErrorMessage`
fn message_from_error(source: &str, error: &toml::de::Error) -> ErrorMessage {
    let offset = error.span().map_or(0, |span| span.start);
    let before = &source[.. offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.len() - before.rfind('\n').map_or(0, |i| i + 1) + 1;

    ErrorMessage {
        desc: String::from(error.message()),
        line: line,
        column: column
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = parse_str("").unwrap();
        assert_eq!(config.root, None);
        assert_eq!(config.port, None);
        assert!(config.jail);
        assert_eq!(config.max_content_length, DEFAULT_MAX_CONTENT_LENGTH);
    }

    #[test]
    fn full_file() {
        let config = parse_str(r#"
            [server]
            root = "/home/www"
            user = "nobody"
            port = 8080
            family = "ipv6"
            jail = false
            https = true

            [log]
            file = "/logs/http-%Y%m%d.csv"

            [limits]
            max_content_length = 1000
        "#).unwrap();

        assert_eq!(config.root, Some(PathBuf::from("/home/www")));
        assert_eq!(config.user.as_ref().map(|s| &s[..]), Some("nobody"));
        assert_eq!(config.port, Some(8080));
        assert_eq!(config.family, Family::Ipv6);
        assert!(!config.jail);
        assert!(config.https);
        assert!(config.standalone());
        assert_eq!(config.scheme(), "https");
        assert_eq!(config.log_file.as_ref().map(|s| &s[..]),
                   Some("/logs/http-%Y%m%d.csv"));
        assert_eq!(config.max_content_length, 1000);
    }

    #[test]
    fn port_out_of_range() {
        match parse_str("[server]\nport = 70000\n") {
            Err(Error::Validation(msg)) => assert!(msg.contains("70000")),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn wrong_type() {
        match parse_str("[server]\njail = \"no\"\n") {
            Err(Error::Validation(msg)) => assert!(msg.contains("server.jail")),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn syntax_errors_carry_a_position() {
        match parse_str("[server]\nport = = 3\n") {
            Err(Error::Parse(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].line, 2);
            },
            other => panic!("{:?}", other)
        }
    }
}
