//! Per-directory Basic authorization
//!
//! A readable file named `-auth` in the directory holding the target gates
//! every request for that directory. Each line is one directive:
//!
//! ```text
//! # comment
//! realm Members Area
//! https-only
//! http-redirect
//! user alice alice:secret
//! ```

use super::request::RequestContext;
use crate::errors::{Error, ErrorKind, Result};
use crate::sanitize::sanitize_path_chars;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Name of the rules file looked for beside every target
pub const AUTH_FILE: &'static str = "-auth";

const DEFAULT_REALM: &'static str = "unknown realm";

/// One `user` line: a name for `REMOTE_USER` and the `login:password` pair
/// that grants it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub credentials: String
}

/// The parsed contents of an `-auth` file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRules {
    pub realm: Option<String>,
    /// Plaintext requests get a 404
    pub https_only: bool,
    /// Plaintext requests get redirected to https
    pub http_redirect: bool,
    pub users: Vec<User>
}

/// What evaluating the rules decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Credentials matched this user
    Granted(String),
    RedirectToHttps,
    /// Pretend there is nothing here
    Hidden,
    /// Challenge with this realm
    Challenge(String)
}

/// What the caller should do after a successful check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted,
    Redirect(String)
}

/// Parses an `-auth` file. An unknown directive is returned as the error.
pub fn parse_rules(text: &str) -> ::std::result::Result<AuthRules, String> {
    let mut rules = AuthRules::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let directive = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match directive {
            "realm" => rules.realm = Some(String::from(rest)),
            "https-only" => rules.https_only = true,
            "http-redirect" => rules.http_redirect = true,
            "user" => {
                let mut fields = rest.split_whitespace();
                if let (Some(name), Some(credentials)) = (fields.next(), fields.next()) {
                    rules.users.push(User {
                        name: String::from(name),
                        credentials: String::from(credentials)
                    });
                }
            },
            other => return Err(String::from(other))
        }
    }

    Ok(rules)
}

/// Decodes the argument of an `Authorization: Basic` header into
/// `login:password`. Whitespace inside the encoding is ignored.
pub fn decode_basic(arg: &str) -> Option<String> {
    let compact: String = arg.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Applies `rules` to a request. `credentials` is the decoded
/// `login:password`, if the client sent any.
pub fn evaluate(rules: &AuthRules, https: bool, credentials: Option<&str>) -> Verdict {
    if rules.https_only && !https {
        return Verdict::Hidden;
    }
    if rules.http_redirect && !https {
        return Verdict::RedirectToHttps;
    }

    if let Some(credentials) = credentials {
        for user in &rules.users {
            if user.credentials == credentials {
                return Verdict::Granted(user.name.clone());
            }
        }
    }

    let realm = rules.realm.as_ref().map_or(DEFAULT_REALM, |r| &r[..]);
    Verdict::Challenge(String::from(realm))
}

/// Checks the request in `ctx` against the rules in `auth_file`, filling in
/// `remote_user` when access is granted.
pub fn check_access(auth_file: &Path, ctx: &mut RequestContext, https: bool)
                    -> Result<Access>
{
    let mut text = String::new();
    if let Err(e) = File::open(auth_file).and_then(|mut f| f.read_to_string(&mut text)) {
        warn!("Cannot read {}: {}", auth_file.display(), e);
        return Err(Error::new(ErrorKind::NotFound));
    }

    let rules = match parse_rules(&text) {
        Ok(r) => r,
        Err(directive) => {
            warn!("Unknown directive {:?} in {}", directive, auth_file.display());
            return Err(Error::new(ErrorKind::NotFound));
        }
    };

    let credentials = match (ctx.auth_type.as_ref(), ctx.auth_arg.as_ref()) {
        (Some(kind), Some(arg)) if kind.eq_ignore_ascii_case("basic") =>
            decode_basic(arg),
        _ => None
    };

    match evaluate(&rules, https, credentials.as_ref().map(|s| &s[..])) {
        Verdict::Granted(name) => {
            ctx.remote_user = Some(name);
            Ok(Access::Granted)
        },
        Verdict::RedirectToHttps => {
            let path = match ctx.target {
                Some(ref t) => format!("{}{}", t.real_script, t.path_info),
                None => ctx.script.clone()
            };
            let (path, _) = sanitize_path_chars(&path);
            let url = format!("https://{}{}{}", ctx.server_name, path, ctx.query_suffix());
            Ok(Access::Redirect(url))
        },
        Verdict::Hidden => Err(Error::new(ErrorKind::NotFound)),
        Verdict::Challenge(realm) => Err(Error::new(ErrorKind::Unauthorized(realm)))
    }
}
