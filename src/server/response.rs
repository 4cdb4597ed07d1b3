//! Framing the reply
//!
//! A `Response` writes straight through to the connection. The status line
//! goes out at most once per request, together with the `Connection` and
//! `Date` headers; later attempts to start the response are no-ops, which
//! lets a CGI program's own `Status:` header win over the default `200 OK`.

use crate::deadline::{Deadline, Output};

use chrono::{DateTime, Utc};
use mime::Mime;

use std::fs::File;
use std::io::{self, Write};
use std::time::SystemTime;

/// The response to the request in flight
pub struct Response<W: Output> {
    out: W,
    protocol: String,
    status: Option<String>,
    close: bool,
    bytes_out: u64
}

/// Formats a timestamp the way HTTP wants it
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Translates a strongly-typed Mime type into a string
pub fn mime_as_string(mime: Mime) -> String {
    String::from(mime.essence_str())
}

impl<W: Output> Response<W> {
    pub fn new(out: W) -> Response<W> {
        Response {
            out: out,
            protocol: String::from("HTTP/1.0"),
            status: None,
            close: false,
            bytes_out: 0
        }
    }

    /// Echo the client's protocol token on the status line
    pub fn set_protocol(&mut self, protocol: &str) {
        self.protocol = String::from(protocol);
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// Whether the connection must close once this response is out
    #[inline]
    pub fn will_close(&self) -> bool {
        self.close
    }

    #[inline]
    pub fn started(&self) -> bool {
        self.status.is_some()
    }

    /// The three-digit status, once latched
    pub fn status(&self) -> Option<&str> {
        self.status.as_ref().map(|s| &s[..])
    }

    /// Records a status for the access log without sending anything
    pub fn latch_status(&mut self, code: &str) {
        self.status = Some(String::from(code));
    }

    #[inline]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn set_deadline(&mut self, deadline: Deadline) {
        self.out.set_deadline(deadline);
    }

    /// Sends the status line, e.g. `"404 Not Found"`, unless one has already
    /// been sent for this request.
    pub fn start(&mut self, status: &str) -> io::Result<()> {
        if self.started() {
            return Ok(());
        }

        let code = status.get(.. 3).unwrap_or(status);
        if code.parse::<u16>().map_or(true, |c| c >= 400) {
            self.close = true;
        }
        self.status = Some(String::from(code));

        let line = format!("{} {}\r\n", self.protocol, status);
        self.write_all(line.as_bytes())?;
        if self.close {
            self.header("Connection", "close")?;
        }
        else {
            self.header("Connection", "keep-alive")?;
        }
        self.header("Date", &http_date(SystemTime::now()))
    }

    pub fn header(&mut self, name: &str, value: &str) -> io::Result<()> {
        let line = format!("{}: {}\r\n", name, value);
        self.write_all(line.as_bytes())
    }

    /// Passes a header line through, normalizing its line ending
    pub fn raw_header(&mut self, line: &[u8]) -> io::Result<()> {
        let mut end = line.len();
        while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
            end -= 1;
        }
        self.write_all(&line[.. end])?;
        self.write_all(b"\r\n")
    }

    pub fn end_headers(&mut self) -> io::Result<()> {
        self.write_all(b"\r\n")
    }

    /// A complete, empty `302` pointing at `url`
    pub fn redirect(&mut self, url: &str) -> io::Result<()> {
        self.start("302 Temporary Redirect")?;
        self.header("Location", url)?;
        self.header("Content-Length", "0")?;
        self.end_headers()
    }

    pub fn send_file(&mut self, file: &mut File, len: u64) -> io::Result<u64> {
        self.out.flush()?;
        let sent = self.out.send_file(file, len)?;
        self.bytes_out += sent;
        Ok(sent)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Output> Write for Response<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.out.write(buf)?;
        self.bytes_out += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

pub mod error_messages {
    use super::Response;
    use crate::deadline::Output;
    use crate::errors::{Error, ErrorKind};
    use crate::log_util::html_escape;
    use crate::server::request::RequestContext;

    use std::io::{self, Write};

    fn page<W: Output>(res: &mut Response<W>, status: &str, content_type: &str,
                       extra: Option<(&str, &str)>, body: &str)
                       -> io::Result<()>
    {
        res.start(status)?;
        if let Some((name, value)) = extra {
            res.header(name, value)?;
        }
        res.header("Content-Type", content_type)?;
        res.header("Content-Length", &body.len().to_string())?;
        res.end_headers()?;
        res.write_all(body.as_bytes())?;
        res.flush()
    }

    pub fn error_400<W: Output>(res: &mut Response<W>) -> io::Result<()> {
        page(res, "400 Bad Request", "text/plain", None,
             "This server does not understand the requested protocol\n")
    }

    pub fn error_401<W: Output>(res: &mut Response<W>, realm: &str) -> io::Result<()> {
        let challenge = format!("Basic realm=\"{}\"", realm);
        page(res, "401 Authorization Required", "text/html",
             Some(("WWW-Authenticate", challenge.as_str())),
             "<head><title>Not Authorized</title></head>\n\
              <body><h1>401 Not Authorized</h1>\n\
              A login and password are required for this document\n\
              </body>\n")
    }

    pub fn error_403<W: Output>(res: &mut Response<W>) -> io::Result<()> {
        page(res, "403 Forbidden", "text/plain", None, "Access denied\n")
    }

    pub fn error_404<W: Output>(res: &mut Response<W>, script: &str) -> io::Result<()> {
        let body = format!(
            "<head><title>Not Found</title></head>\n\
             <body><h1>Document Not Found</h1>\n\
             The document {} is not available on this server\n\
             </body>\n", html_escape(script));
        page(res, "404 Not Found", "text/html", None, &body)
    }

    pub fn error_500_too_large<W: Output>(res: &mut Response<W>) -> io::Result<()> {
        page(res, "500 Request too large", "text/plain", None,
             "Too much POST data\n")
    }

    pub fn error_500_writable<W: Output>(res: &mut Response<W>, script: &str)
                                         -> io::Result<()>
    {
        let body = format!(
            "The CGI program {} is writable by users other than its owner.\n",
            script);
        page(res, "500 CGI Configuration Error", "text/plain", None, &body)
    }

    pub fn error_500_cgi<W: Output>(res: &mut Response<W>, script: &str) -> io::Result<()> {
        let body = format!(
            "<head><title>CGI Program Error</title></head>\n\
             <body><h1>CGI Program Error</h1>\n\
             The CGI program {} generated an error\n\
             </body>\n", html_escape(script));
        page(res, "500 Error", "text/html", None, &body)
    }

    pub fn error_500<W: Output>(res: &mut Response<W>, line: u32, detail: &str)
                                -> io::Result<()>
    {
        let body = format!(
            "Web server malfunctioned; error number {}\n\n{}\n", line, detail);
        page(res, "500 Server Malfunction", "text/plain", None, &body)
    }

    pub fn error_501<W: Output>(res: &mut Response<W>, method: &str) -> io::Result<()> {
        let body = format!(
            "<head><title>Method not implemented</title></head>\n\
             <body><h1>Method not implemented</h1>\n\
             The {} method is not implemented on this server.\n\
             </body>\n", html_escape(method));
        page(res, "501 Not Implemented", "text/html", None, &body)
    }

    /// Sends the canned reply for `err`.
    ///
    /// Nothing is sent once a status line is out (the client already has a
    /// partial response) or for timeouts.
    pub fn reply<W: Output>(res: &mut Response<W>, ctx: &RequestContext, err: &Error)
                            -> io::Result<()>
    {
        if res.started() {
            return Ok(());
        }

        match *err.kind() {
            ErrorKind::BadProtocol => error_400(res),
            ErrorKind::MethodNotImplemented(ref m) => error_501(res, m),
            ErrorKind::ForbiddenHost => error_403(res),
            ErrorKind::NotFound => error_404(res, &ctx.script),
            ErrorKind::Unauthorized(ref realm) => error_401(res, realm),
            ErrorKind::RequestTooLarge => error_500_too_large(res),
            ErrorKind::ScriptWritable => error_500_writable(res, ctx.real_script()),
            ErrorKind::CgiFailed => error_500_cgi(res, &ctx.script),
            ErrorKind::Malfunction(ref detail) => error_500(res, err.line(), detail),
            ErrorKind::Io(ref e) => error_500(res, err.line(), &e.to_string()),
            ErrorKind::Timeout => Ok(())
        }
    }
}
