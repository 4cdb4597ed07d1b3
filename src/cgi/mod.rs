//! Running CGI/1.1 programs
//!
//! The program is started with a scrubbed environment describing the
//! request, its working directory set to the directory holding it, and the
//! spooled POST body (if any) on standard input. Its standard output is
//! read back through a pipe: header lines first, some of them rewritten,
//! then the body. Programs named `nph-*` replace this process outright and
//! talk to the client themselves.

pub mod parser;

use crate::config::Config;
use crate::deadline::{self, Clock, DeadlineReader, Output, Phase, Pollable};
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::Target;
use crate::log_util::ascii_escape;
use crate::server::request::{Method, RequestContext, MAX_LINE};
use crate::server::response::Response;

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

/// A status line
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason_phrase: Vec<u8>
}

impl Status {
    /// `"404 Not Found"`, or just the code when there's no phrase
    pub fn line(&self) -> String {
        let phrase = String::from_utf8_lossy(&self.reason_phrase);
        let phrase = phrase.trim();
        if phrase.is_empty() {
            self.code.to_string()
        }
        else {
            format!("{} {}", self.code, phrase)
        }
    }
}

/// A location redirect
#[derive(Debug, PartialEq, Eq)]
pub struct Location {
    pub url: Vec<u8>
}

/// A header line from a CGI program, as far as the server cares
#[derive(Debug, PartialEq, Eq)]
pub enum CgiHeader {
    Status(Status),
    /// A `Status:` line without a three-digit code
    BadStatus,
    Location(Location),
    ContentLength,
    Other
}

/// The four shapes a `Location:` value can take
#[derive(Debug, PartialEq, Eq)]
pub enum LocationKind {
    /// `//host/path`: needs our scheme in front, then passes through
    NetworkPath,
    /// `/path`: redirect on this host
    AbsolutePath,
    /// `scheme:...`: passes through untouched
    Absolute,
    /// Anything else, resolved against the script's directory
    Relative(String)
}

/// Sorts a `Location:` value, resolving relative ones against the
/// directory of `script_name`.
pub fn classify_location(value: &str, script_name: &str) -> LocationKind {
    if value.starts_with("//") {
        return LocationKind::NetworkPath;
    }
    if value.starts_with('/') {
        return LocationKind::AbsolutePath;
    }
    if let Some(i) = value.find(|c: char| c == ':' || c == '/') {
        if value.as_bytes()[i] == b':' {
            return LocationKind::Absolute;
        }
    }

    let mut base = match script_name.rfind('/') {
        Some(i) => script_name[.. i].trim_end_matches('/'),
        None => ""
    };
    let mut rest = value;
    loop {
        if rest.starts_with("./") {
            rest = &rest[2 ..];
        }
        else if rest.starts_with("../") {
            base = match base.rfind('/') {
                Some(i) => base[.. i].trim_end_matches('/'),
                None => ""
            };
            rest = &rest[3 ..];
        }
        else {
            break;
        }
    }

    LocationKind::Relative(format!("{}/{}", base, rest))
}

/// Values starting like a shell function definition are blanked, so a
/// vulnerable `/bin/sh` cannot be talked into running them.
fn scrub(value: &str) -> String {
    if value.starts_with("() {") {
        String::new()
    }
    else {
        String::from(value)
    }
}

/// The environment a CGI program sees for this request
pub fn environment(ctx: &RequestContext, target: &Target, https: bool)
                   -> Vec<(&'static str, String)>
{
    let home = ctx.home.as_ref().map(|h| h.to_string_lossy().into_owned());
    let dir = target.dir.to_string_lossy().into_owned();
    let file = target.file.to_string_lossy().into_owned();
    let method = ctx.method.map(|m| String::from(m.as_str()));

    let fields: Vec<(&'static str, Option<&str>)> = vec![
        ("AUTH_TYPE", ctx.auth_type.as_ref().map(|s| &s[..])),
        ("CONTENT_LENGTH", ctx.content_length.as_ref().map(|s| &s[..])),
        ("CONTENT_TYPE", ctx.content_type.as_ref().map(|s| &s[..])),
        ("DOCUMENT_ROOT", home.as_ref().map(|s| &s[..])),
        ("GATEWAY_INTERFACE", Some("CGI/1.0")),
        ("HTTP_ACCEPT", ctx.accept.as_ref().map(|s| &s[..])),
        ("HTTP_ACCEPT_ENCODING", ctx.accept_encoding.as_ref().map(|s| &s[..])),
        ("HTTP_COOKIE", ctx.cookie.as_ref().map(|s| &s[..])),
        ("HTTP_HOST", ctx.host.as_ref().map(|s| &s[..])),
        ("HTTP_REFERER", ctx.referer.as_ref().map(|s| &s[..])),
        ("HTTP_USER_AGENT", ctx.user_agent.as_ref().map(|s| &s[..])),
        ("PATH", Some("/bin:/usr/bin")),
        ("PATH_INFO", Some(&target.path_info[..])),
        ("QUERY_STRING", Some(ctx.query_string.as_ref().map_or("", |s| &s[..]))),
        ("REMOTE_ADDR", Some(&ctx.remote_addr[..])),
        ("REQUEST_METHOD", method.as_ref().map(|s| &s[..])),
        ("REQUEST_URI", Some(&ctx.script[..])),
        ("REMOTE_USER", ctx.remote_user.as_ref().map(|s| &s[..])),
        ("SCRIPT_DIRECTORY", Some(&dir[..])),
        ("SCRIPT_FILENAME", Some(&file[..])),
        ("SCRIPT_NAME", Some(&target.real_script[..])),
        ("SERVER_NAME", Some(&ctx.server_name[..])),
        ("SERVER_PORT", Some(&ctx.server_port[..])),
        ("SERVER_PROTOCOL", Some(&ctx.protocol[..]))
    ];

    let mut env: Vec<(&'static str, String)> = fields.into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, scrub(v))))
        .collect();

    if https {
        env.push(("HTTPS", String::from("on")));
    }

    env
}

/// Kills the program unless it was seen through to the end of its output
struct RunningChild {
    child: Child,
    armed: bool
}

impl Drop for RunningChild {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Starts the program, retrying briefly while its file is still held open
/// for writing somewhere (`ETXTBSY`).
fn spawn(command: &mut Command) -> io::Result<Child> {
    let mut tries = 0;
    loop {
        match command.spawn() {
            Err(ref e) if e.raw_os_error() == Some(libc::ETXTBSY) && tries < 5 => {
                tries += 1;
                thread::sleep(Duration::from_millis(20));
            },
            result => return result
        }
    }
}

/// Runs the CGI program `target` and relays its output. Returns the source
/// line to log.
pub fn run<W: Output>(target: &Target, ctx: &mut RequestContext,
                      res: &mut Response<W>, config: &Config, clock: &Clock)
                      -> Result<u32>
{
    if target.metadata.permissions().mode() & 0o022 != 0 {
        return Err(Error::new(ErrorKind::ScriptWritable));
    }

    let base_name = target.file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stdin = match ctx.spool {
        Some(ref spool) => Stdio::from(spool.reopen()?),
        None => Stdio::null()
    };

    let mut command = Command::new(&target.file);
    command.arg0(&base_name)
        .env_clear()
        .envs(environment(ctx, target, config.https))
        .current_dir(&target.dir)
        .stdin(stdin)
        .stderr(Stdio::inherit());

    if base_name.starts_with("nph-") {
        res.flush()?;
        // Nothing runs after a successful exec, so unlink the spool now; the
        // program keeps its open descriptor.
        if let Some(spool) = ctx.spool.take() {
            let _ = spool.close();
        }
        // The program writes to the socket with no deadline of its own
        deadline::set_nonblocking(libc::STDOUT_FILENO, false)?;
        let err = command.stdout(Stdio::inherit()).exec();
        return Err(Error::new(ErrorKind::Malfunction(
            format!("cannot exec {}: {}", base_name, err)
        )));
    }

    let mut child = match spawn(command.stdout(Stdio::piped())) {
        Ok(c) => RunningChild { child: c, armed: true },
        Err(e) => {
            warn!("Cannot start {}: {}", target.file.display(), e);
            return Err(Error::new(ErrorKind::CgiFailed));
        }
    };
    let stdout = match child.child.stdout.take() {
        Some(s) => s,
        None => return Err(Error::new(ErrorKind::CgiFailed))
    };

    let mut output = DeadlineReader::new(stdout);
    output.set_deadline(clock.deadline(Phase::CgiHeaders));
    let mut output = BufReader::new(output);

    let line = relay(&mut output, ctx, res, config, clock)?;
    child.armed = false;
    Ok(line)
}

/// Copies the program's headers (rewriting the special ones) and body to
/// the client.
fn relay<R: Read + Pollable, W: Output>(output: &mut BufReader<DeadlineReader<R>>,
                                        ctx: &mut RequestContext,
                                        res: &mut Response<W>,
                                        config: &Config, clock: &Clock)
                                        -> Result<u32>
{
    let scheme = config.scheme();
    let mut seen_length = false;
    let mut line = Vec::new();

    loop {
        line.clear();
        output.by_ref().take(MAX_LINE).read_until(b'\n', &mut line)?;
        if parser::is_end_of_headers(&line) {
            break;
        }

        match parser::cgi_header(&line) {
            CgiHeader::Location(location) => {
                let value = String::from_utf8_lossy(&location.url).trim().to_owned();
                let suffix = if value.contains('?') { String::new() }
                             else { ctx.query_suffix() };

                match classify_location(&value, ctx.real_script()) {
                    LocationKind::NetworkPath => {
                        res.start("302 Redirect")?;
                        res.header("Location", &format!("{}:{}{}", scheme, value, suffix))?;
                    },
                    LocationKind::Absolute => {
                        res.start("302 Redirect")?;
                        res.header("Location", &format!("{}{}", value, suffix))?;
                    },
                    LocationKind::AbsolutePath => {
                        let url = format!("{}{}{}", ctx.authority(scheme), value, suffix);
                        res.redirect(&url)?;
                        return Ok(line!());
                    },
                    LocationKind::Relative(path) => {
                        let url = format!("{}{}{}", ctx.authority(scheme), path, suffix);
                        res.redirect(&url)?;
                        return Ok(line!());
                    }
                }
            },
            CgiHeader::Status(status) => {
                if res.started() {
                    warn!("Late Status: header from {}", ctx.real_script());
                }
                res.start(&status.line())?;
            },
            CgiHeader::BadStatus => {
                warn!("Malformed status from {}: {}", ctx.real_script(),
                      ascii_escape(&line));
                return Err(Error::new(ErrorKind::CgiFailed));
            },
            CgiHeader::ContentLength => {
                seen_length = true;
                res.start("200 OK")?;
                res.raw_header(&line)?;
            },
            CgiHeader::Other => {
                res.start("200 OK")?;
                res.raw_header(&line)?;
            }
        }
    }

    res.start("200 OK")?;
    output.get_mut().set_deadline(clock.deadline(Phase::CgiBody));
    res.set_deadline(clock.deadline(Phase::CgiBody));
    let head = ctx.method == Some(Method::Head);

    if seen_length {
        res.end_headers()?;
        if !head {
            io::copy(output, res)?;
        }
    }
    else {
        let mut body = Vec::new();
        output.read_to_end(&mut body)?;
        res.header("Content-Length", &body.len().to_string())?;
        res.end_headers()?;
        if !head {
            res.write_all(&body)?;
        }
    }
    res.flush()?;

    Ok(line!())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::deadline::DeadlineWriter;
    use crate::filesystem::{resolve, Resolution};

    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn location_shapes() {
        let script = "/cgi/app/run.cgi";
        assert_eq!(classify_location("//cdn.example.com/x", script),
                   LocationKind::NetworkPath);
        assert_eq!(classify_location("/login", script), LocationKind::AbsolutePath);
        assert_eq!(classify_location("https://example.com/", script),
                   LocationKind::Absolute);
        assert_eq!(classify_location("mailto:a@b.c", script), LocationKind::Absolute);
        assert_eq!(classify_location("next?x=1", script),
                   LocationKind::Relative(String::from("/cgi/app/next?x=1")));
        assert_eq!(classify_location("a/b:c", script),
                   LocationKind::Relative(String::from("/cgi/app/a/b:c")));
    }

    #[test]
    fn relative_locations_walk_dots() {
        let script = "/cgi/app/run.cgi";
        assert_eq!(classify_location("./done", script),
                   LocationKind::Relative(String::from("/cgi/app/done")));
        assert_eq!(classify_location("../other", script),
                   LocationKind::Relative(String::from("/cgi/other")));
        assert_eq!(classify_location("../../../../top", script),
                   LocationKind::Relative(String::from("/top")));
        assert_eq!(classify_location(".hidden", script),
                   LocationKind::Relative(String::from("/cgi/app/.hidden")));
    }

    #[test]
    fn status_lines() {
        let s = Status { code: 404, reason_phrase: Vec::from(&b"Not Found "[..]) };
        assert_eq!(s.line(), "404 Not Found");
        let s = Status { code: 204, reason_phrase: Vec::new() };
        assert_eq!(s.line(), "204");
    }

    fn script(home: &Path, name: &str, body: &str, mode: u32) -> Target {
        let path = home.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        match resolve(home, &format!("/{}", name)).unwrap() {
            Resolution::Found(t) => t,
            other => panic!("{:?}", other)
        }
    }

    fn context(home: &Path, target: &Target) -> RequestContext {
        let mut ctx = RequestContext::new(String::from("192.0.2.7"), false);
        ctx.method = Some(Method::Get);
        ctx.protocol = String::from("HTTP/1.1");
        ctx.script = target.real_script.clone();
        ctx.server_name = String::from("example.com");
        ctx.server_port = String::from("80");
        ctx.home = Some(home.to_path_buf());
        ctx.target = Some(target.clone());
        ctx
    }

    fn execute(target: &Target, ctx: &mut RequestContext)
               -> (Result<u32>, String, Option<String>)
    {
        let mut res = Response::new(DeadlineWriter::new(Vec::new()));
        res.set_protocol("HTTP/1.1");
        let result = run(target, ctx, &mut res, &Config::default(), &Clock::new(true));
        let status = res.status().map(String::from);
        let out = String::from_utf8(res.into_inner().into_inner()).unwrap();
        (result, out, status)
    }

    fn lookup<'a>(env: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        env.iter().find(|&&(n, _)| n == name).map(|&(_, ref v)| &v[..])
    }

    #[test]
    fn environment_omits_absent_fields() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "env.cgi", "", 0o755);
        let mut ctx = context(home.path(), &t);
        ctx.user_agent = Some(String::from("() { :; }; echo pwned"));

        let env = environment(&ctx, &t, true);
        let get = |name: &str| lookup(&env, name);

        assert_eq!(get("GATEWAY_INTERFACE"), Some("CGI/1.0"));
        assert_eq!(get("REQUEST_METHOD"), Some("GET"));
        assert_eq!(get("SCRIPT_NAME"), Some("/env.cgi"));
        assert_eq!(get("QUERY_STRING"), Some(""));
        assert_eq!(get("HTTP_USER_AGENT"), Some(""));
        assert_eq!(get("HTTPS"), Some("on"));
        assert_eq!(get("HTTP_COOKIE"), None);
        assert_eq!(get("CONTENT_LENGTH"), None);
        assert_eq!(get("REMOTE_USER"), None);
    }

    #[test]
    fn output_without_length_is_measured() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "hello.cgi",
                       "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
                        printf 'hi %s' \"$REQUEST_METHOD\"\n", 0o755);
        let mut ctx = context(home.path(), &t);

        let (result, out, status) = execute(&t, &mut ctx);
        result.unwrap();
        assert_eq!(status.as_ref().map(|s| &s[..]), Some("200"));
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(out.ends_with("Content-Length: 6\r\n\r\nhi GET"));
    }

    #[test]
    fn declared_length_streams() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "stream.cgi",
                       "printf 'Content-Length: 5\\n\\n'\nprintf 'abcde'\n", 0o755);
        let mut ctx = context(home.path(), &t);

        let (result, out, _) = execute(&t, &mut ctx);
        result.unwrap();
        assert!(out.ends_with("Content-Length: 5\r\n\r\nabcde"));
        assert_eq!(out.matches("Content-Length").count(), 1);
    }

    #[test]
    fn status_header_replaces_status_line() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "gone.cgi",
                       "printf 'Status: 410 Gone\\r\\n\\r\\nbye'\n", 0o755);
        let mut ctx = context(home.path(), &t);

        let (result, out, status) = execute(&t, &mut ctx);
        result.unwrap();
        assert_eq!(status.as_ref().map(|s| &s[..]), Some("410"));
        assert!(out.starts_with("HTTP/1.1 410 Gone\r\nConnection: close\r\n"));
        assert!(!out.contains("200 OK"));
    }

    #[test]
    fn absolute_path_location_redirects() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "go.cgi",
                       "printf 'Location: /elsewhere\\r\\n\\r\\n'\n", 0o755);
        let mut ctx = context(home.path(), &t);
        ctx.query_string = Some(String::from("a=1"));

        let (result, out, status) = execute(&t, &mut ctx);
        result.unwrap();
        assert_eq!(status.as_ref().map(|s| &s[..]), Some("302"));
        assert!(out.contains("Location: http://example.com/elsewhere?a=1\r\n"));
        assert!(out.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn network_path_location_gets_scheme() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "cdn.cgi",
                       "printf 'Location: //cdn.example.com/x?y=2\\r\\n\\r\\n'\n", 0o755);
        let mut ctx = context(home.path(), &t);
        ctx.query_string = Some(String::from("a=1"));

        let (result, out, status) = execute(&t, &mut ctx);
        result.unwrap();
        assert_eq!(status.as_ref().map(|s| &s[..]), Some("302"));
        assert!(out.contains("Location: http://cdn.example.com/x?y=2\r\n"));
        assert!(out.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn absolute_location_passes_through() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "away.cgi",
                       "printf 'Location: https://example.org/x\\r\\n\\r\\nbody'\n", 0o755);
        let mut ctx = context(home.path(), &t);

        let (result, out, status) = execute(&t, &mut ctx);
        result.unwrap();
        assert_eq!(status.as_ref().map(|s| &s[..]), Some("302"));
        assert!(out.starts_with("HTTP/1.1 302 Redirect\r\n"));
        assert!(out.contains("Location: https://example.org/x\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.ends_with("\r\n\r\nbody"));
    }

    #[test]
    fn relative_location_is_resolved() {
        let home = TempDir::new().unwrap();
        fs::create_dir(home.path().join("app")).unwrap();
        let t = script(home.path(), "app/form.cgi",
                       "printf 'Location: ../thanks.html\\n\\n'\n", 0o755);
        let mut ctx = context(home.path(), &t);
        ctx.server_port = String::from("8080");

        let (result, out, _) = execute(&t, &mut ctx);
        result.unwrap();
        assert!(out.contains("Location: http://example.com:8080/thanks.html\r\n"));
    }

    #[test]
    fn writable_script_is_refused() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "open.cgi", "echo hacked > pwned\n", 0o777);
        let mut ctx = context(home.path(), &t);

        match execute(&t, &mut ctx).0 {
            Err(ref e) => match *e.kind() {
                ErrorKind::ScriptWritable => (),
                ref other => panic!("{:?}", other)
            },
            Ok(_) => panic!("ran a writable script")
        }
        assert!(!home.path().join("pwned").exists());
    }

    #[test]
    fn post_body_arrives_on_stdin() {
        use std::io::{Seek, SeekFrom};

        let home = TempDir::new().unwrap();
        let t = script(home.path(), "echo.cgi",
                       "printf 'Content-Type: text/plain\\n\\n'\ncat\n", 0o755);
        let mut ctx = context(home.path(), &t);
        ctx.method = Some(Method::Post);
        let mut spool = tempfile::NamedTempFile::new().unwrap();
        spool.write_all(b"name=value").unwrap();
        spool.as_file_mut().seek(SeekFrom::Start(0)).unwrap();
        ctx.spool = Some(spool);

        let (result, out, _) = execute(&t, &mut ctx);
        result.unwrap();
        assert!(out.ends_with("Content-Length: 10\r\n\r\nname=value"));
    }

    #[test]
    fn runs_in_its_own_directory() {
        let home = TempDir::new().unwrap();
        fs::create_dir(home.path().join("sub")).unwrap();
        fs::write(home.path().join("sub/data.txt"), "local").unwrap();
        let t = script(home.path(), "sub/cat.cgi",
                       "printf '\\n'\ncat data.txt\n", 0o755);
        let mut ctx = context(home.path(), &t);

        let (result, out, _) = execute(&t, &mut ctx);
        result.unwrap();
        assert!(out.ends_with("\r\n\r\nlocal"));
    }

    #[test]
    fn head_gets_no_body() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "head.cgi", "printf 'X: 1\\n\\nbody'\n", 0o755);
        let mut ctx = context(home.path(), &t);
        ctx.method = Some(Method::Head);

        let (result, out, _) = execute(&t, &mut ctx);
        result.unwrap();
        assert!(out.ends_with("Content-Length: 4\r\n\r\n"));
    }

    #[test]
    fn silent_program_times_out() {
        let home = TempDir::new().unwrap();
        let t = script(home.path(), "slow.cgi", "sleep 30\n", 0o755);
        let mut ctx = context(home.path(), &t);

        let mut res = Response::new(DeadlineWriter::new(Vec::new()));
        let clock = Clock::new(true);
        let started = std::time::Instant::now();

        let mut child = spawn(Command::new(&t.file).stdout(Stdio::piped())).unwrap();
        let mut output = DeadlineReader::new(child.stdout.take().unwrap());
        output.set_deadline(crate::deadline::Deadline::after(Duration::from_millis(50)));
        let mut output = BufReader::new(output);
        let err = relay(&mut output, &mut ctx, &mut res, &Config::default(), &clock)
            .unwrap_err();
        let _ = child.kill();
        let _ = child.wait();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
