//! Reading a request off the wire
//!
//! The request line is split on whitespace by hand, because the protocol
//! token only has to look like `HTTP/d.d`. Each header line goes through
//! `httparse` on its own, and a line it rejects is skipped. Only the handful
//! of fields a CGI program can see are kept; everything else is dropped on
//! the floor.

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::Target;
use crate::log_util::ascii_escape;
use crate::sanitize::{sanitize_path_chars, validate_host_header};

use tempfile::{Builder, NamedTempFile};

use std::io::{self, BufRead, Read};
use std::path::PathBuf;

/// Longest request or header line we are willing to buffer
pub const MAX_LINE: u64 = 8000;

/// The methods this server understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head
}

impl Method {
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "HEAD" => Some(Method::Head),
            _ => None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD"
        }
    }
}

/// Everything known about the request in flight
///
/// Created fresh for every request and thrown away once the access log
/// record has been written.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Option<Method>,
    pub protocol: String,
    /// Path portion of the request target, exactly as received
    pub raw_path: String,
    /// Text after the first `?`, if there was one
    pub query_string: Option<String>,

    pub host: Option<String>,
    pub server_name: String,
    pub server_port: String,
    pub cookie: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub accept_encoding: Option<String>,
    pub content_length: Option<String>,
    pub content_type: Option<String>,
    pub auth_type: Option<String>,
    pub auth_arg: Option<String>,

    /// Sanitized `raw_path`
    pub script: String,
    /// Content root of the virtual host
    pub home: Option<PathBuf>,
    pub target: Option<Target>,
    pub remote_addr: String,
    pub remote_user: Option<String>,

    pub bytes_in: u64,
    /// The connection closes after this response
    pub close: bool,
    /// The caller demanded closure; `keep-alive` cannot undo it
    pub force_close: bool,
    /// Set once a request line has been read
    pub started: bool,
    /// POST body, unlinked when the request is logged
    pub spool: Option<NamedTempFile>
}

impl RequestContext {
    pub fn new(remote_addr: String, force_close: bool) -> RequestContext {
        RequestContext {
            method: None,
            protocol: String::from("HTTP/1.0"),
            raw_path: String::new(),
            query_string: None,
            host: None,
            server_name: String::new(),
            server_port: String::new(),
            cookie: None,
            referer: None,
            user_agent: None,
            accept: None,
            accept_encoding: None,
            content_length: None,
            content_type: None,
            auth_type: None,
            auth_arg: None,
            script: String::new(),
            home: None,
            target: None,
            remote_addr: remote_addr,
            remote_user: None,
            bytes_in: 0,
            close: force_close,
            force_close: force_close,
            started: false,
            spool: None
        }
    }

    /// `"?query"`, or empty; re-appended to redirects we generate
    pub fn query_suffix(&self) -> String {
        match self.query_string {
            Some(ref q) => format!("?{}", q),
            None => String::new()
        }
    }

    /// Script name after resolution, falling back to the request path
    pub fn real_script(&self) -> &str {
        match self.target {
            Some(ref t) => &t.real_script,
            None => &self.script
        }
    }

    /// `scheme://name[:port]` for the host the client asked for
    pub fn authority(&self, scheme: &str) -> String {
        let port = &self.server_port[..];
        let default_port = port.is_empty() || port == "80" ||
            (scheme == "https" && port == "443");

        if default_port {
            format!("{}://{}", scheme, self.server_name)
        }
        else {
            format!("{}://{}:{}", scheme, self.server_name, port)
        }
    }

    /// Fully qualified URL for a path on this virtual host, carrying over the
    /// query string
    pub fn absolute_url(&self, scheme: &str, path: &str) -> String {
        format!("{}{}{}", self.authority(scheme), path, self.query_suffix())
    }

    /// Length of a POST body we are expected to read
    pub fn body_length(&self) -> Option<u64> {
        match (self.method, self.content_length.as_ref()) {
            (Some(Method::Post), Some(len)) => Some(leading_number(len)),
            _ => None
        }
    }
}

/// Parses the leading decimal digits of `s`, yielding 0 when there are none
fn leading_number(s: &str) -> u64 {
    s.trim_start()
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u64, |n, b| n.saturating_mul(10).saturating_add((b - b'0') as u64))
}

/// Reads one line, newline included. `Ok(None)` means end of stream.
fn read_line<R: BufRead>(reader: &mut R, ctx: &mut RequestContext)
                         -> Result<Option<Vec<u8>>>
{
    let mut line = Vec::new();
    let read = reader.by_ref().take(MAX_LINE).read_until(b'\n', &mut line)?;
    ctx.bytes_in += read as u64;

    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && read as u64 == MAX_LINE {
        return Err(Error::new(ErrorKind::BadProtocol));
    }

    Ok(Some(line))
}

/// Checks the protocol token is exactly `HTTP/` digit `.` digit
fn valid_protocol(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() == 8 && b.starts_with(b"HTTP/") &&
        b[5].is_ascii_digit() && b[6] == b'.' && b[7].is_ascii_digit()
}

/// Reads and splits the request line.
///
/// Returns `Ok(false)` if the client went away before sending anything.
pub fn read_request_line<R: BufRead>(reader: &mut R, ctx: &mut RequestContext)
                                     -> Result<bool>
{
    let line = match read_line(reader, ctx)? {
        Some(l) => l,
        None => return Ok(false)
    };
    ctx.started = true;

    let mut parts = line.split(|b: &u8| b.is_ascii_whitespace()).filter(|p| !p.is_empty());
    let method = String::from_utf8_lossy(parts.next().unwrap_or(&b""[..]));
    let target = parts.next().unwrap_or(&b""[..]);
    let protocol = String::from_utf8_lossy(parts.next().unwrap_or(&b""[..]));

    ctx.raw_path = String::from_utf8_lossy(target).into_owned();

    if !valid_protocol(&protocol) {
        return Err(Error::new(ErrorKind::BadProtocol));
    }
    ctx.protocol = protocol.into_owned();

    if target.is_empty() {
        return Err(Error::new(ErrorKind::NotFound));
    }

    // HTTP/1.0 and older close unless asked otherwise
    let p = ctx.protocol.as_bytes();
    if p[5] < b'1' || p[7] < b'1' {
        ctx.close = true;
    }

    let path = match target.iter().position(|&b| b == b'?') {
        Some(i) => {
            ctx.query_string = Some(String::from_utf8_lossy(&target[i + 1 ..]).into_owned());
            &target[.. i]
        },
        None => target
    };
    ctx.raw_path = String::from_utf8_lossy(path).into_owned();

    // Scrub the bytes as received, before any lossy conversion can widen them
    let (script, changes) = sanitize_path_chars(path);
    if changes > 0 {
        debug!("Sanitized {:?} to {:?}", ctx.raw_path, script);
    }
    ctx.script = script;

    ctx.method = Method::from_token(&method);
    if ctx.method.is_none() {
        return Err(Error::new(ErrorKind::MethodNotImplemented(method.into_owned())));
    }

    Ok(true)
}

/// Reads header lines up to the blank line (or end of stream) and stores
/// the interesting ones in `ctx`.
pub fn read_headers<R: BufRead>(reader: &mut R, ctx: &mut RequestContext)
                                -> Result<()>
{
    while let Some(line) = read_line(reader, ctx)? {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            break;
        }

        // A line that does not parse is dropped on its own
        let mut field = line.clone();
        while field.last().map_or(false, |&b| b == b'\n' || b == b'\r') {
            field.pop();
        }
        field.extend_from_slice(b"\r\n\r\n");

        let mut header = [httparse::EMPTY_HEADER; 1];
        match httparse::parse_headers(&field, &mut header) {
            Ok(httparse::Status::Complete((_, [parsed]))) => {
                let value = String::from_utf8_lossy(parsed.value);
                store_header(ctx, parsed.name, value.trim())?;
            },
            _ => debug!("Ignoring header line {}", ascii_escape(&line))
        }
    }

    if ctx.server_name.is_empty() {
        ctx.server_name = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
    }
    if ctx.server_port.is_empty() {
        ctx.server_port = String::from("80");
    }

    Ok(())
}

fn store_header(ctx: &mut RequestContext, name: &str, value: &str) -> Result<()> {
    let value = String::from(value);

    match &name.to_ascii_lowercase()[..] {
        "user-agent" => ctx.user_agent = Some(value),
        "accept" => ctx.accept = Some(value),
        "accept-encoding" => ctx.accept_encoding = Some(value),
        "content-length" => ctx.content_length = Some(value),
        "content-type" => ctx.content_type = Some(value),
        "referer" => ctx.referer = Some(value),
        "cookie" => {
            ctx.cookie = Some(match ctx.cookie.take() {
                Some(prior) => format!("{}; {}", prior, value),
                None => value
            });
        },
        "connection" => {
            if value.eq_ignore_ascii_case("close") {
                ctx.close = true;
            }
            else if value.eq_ignore_ascii_case("keep-alive") && !ctx.force_close {
                ctx.close = false;
            }
        },
        "host" => {
            if !validate_host_header(&value) {
                return Err(Error::new(ErrorKind::ForbiddenHost));
            }
            match value.find(':') {
                Some(i) => {
                    ctx.server_name = String::from(&value[.. i]);
                    ctx.server_port = String::from(&value[i + 1 ..]);
                },
                None => {
                    ctx.server_name = value.clone();
                    ctx.server_port = String::new();
                }
            }
            ctx.host = Some(value);
        },
        "authorization" => {
            let mut parts = value.splitn(2, char::is_whitespace);
            ctx.auth_type = parts.next().map(String::from);
            ctx.auth_arg = parts.next().map(|s| String::from(s.trim()));
        },
        _ => ()
    }

    Ok(())
}

/// Copies exactly `len` bytes of POST body into a fresh spool file.
pub fn read_body<R: BufRead>(reader: &mut R, ctx: &mut RequestContext, len: u64)
                             -> Result<()>
{
    let mut spool = match Builder::new().prefix("-post-data-").tempfile() {
        Ok(f) => f,
        Err(e) => return Err(Error::new(ErrorKind::Malfunction(
            format!("Cannot create a temp file in which to store POST data: {}", e)
        )))
    };

    let copied = io::copy(&mut reader.by_ref().take(len), spool.as_file_mut())?;
    ctx.bytes_in += copied;
    ctx.spool = Some(spool);

    Ok(())
}
