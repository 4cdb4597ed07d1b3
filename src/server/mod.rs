//! Server functionality
//!
//! Each connection is owned by exactly one process. In inetd mode that is
//! the process we were started as; in standalone mode the supervisor loop
//! below forks one per accepted socket, with the socket on descriptors 0
//! and 1 so that `nph-` programs can inherit it.

pub mod auth;
pub mod request;
pub mod response;
pub mod static_files;

use self::auth::{Access, AUTH_FILE};
use self::request::RequestContext;
use self::response::{error_messages, Response};
use crate::access_log::{self, Accounting, AccessLog, Record};
use crate::cgi;
use crate::config::Config;
use crate::deadline::{self, Clock, DeadlineReader, DeadlineWriter, Output, Phase, Pollable,
                      TIMEOUT_STATUS};
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::{self, Resolution};

use nix::unistd::{dup2, fork, ForkResult};

use std::env;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

/// Requests served on one connection before it is closed regardless
pub const MAX_REQUESTS: u32 = 100;

/// Live handler processes above which the supervisor slows down
const MAX_PARALLEL: usize = 50;

/// Whether the connection can carry another request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Close
}

/// One client connection and its bookkeeping
pub struct Connection<R: Read + Pollable, W: Write + Pollable> {
    input: BufReader<DeadlineReader<R>>,
    output: DeadlineWriter<W>,
    remote_addr: String,
    requests: u32,
    accounting: Accounting
}

impl<R: Read + Pollable, W: Write + Pollable> Connection<R, W> {
    pub fn new(input: R, output: W, remote_addr: String) -> Connection<R, W> {
        Connection {
            input: BufReader::new(DeadlineReader::new(input)),
            output: DeadlineWriter::new(output),
            remote_addr: remote_addr,
            requests: 0,
            accounting: Accounting::new()
        }
    }

    /// Handles requests until the client or a response closes the
    /// connection.
    pub fn serve(&mut self, config: &Config, log: &AccessLog) {
        while self.requests < MAX_REQUESTS {
            let last = self.requests + 1 == MAX_REQUESTS;
            if self.handle_request(config, log, last) == Next::Close {
                break;
            }
        }
    }

    /// Reads, answers and logs a single request.
    pub fn handle_request(&mut self, config: &Config, log: &AccessLog, force_close: bool)
                          -> Next
    {
        let clock = Clock::new(!config.debug);
        let first = if self.requests == 0 { Phase::Header } else { Phase::Idle };
        self.input.get_mut().set_deadline(clock.deadline(first));
        self.output.set_deadline(clock.deadline(Phase::Header));

        let mut ctx = RequestContext::new(self.remote_addr.clone(), force_close);
        let mut res = Response::new(&mut self.output);

        let line = match process(&mut self.input, &mut ctx, &mut res, config, &clock) {
            Ok(Some(line)) => line,
            Ok(None) => return Next::Close,
            Err(e) => {
                if e.is_timeout() && !ctx.started {
                    return Next::Close;
                }

                res.set_protocol(&ctx.protocol);
                res.set_close(true);
                if e.is_timeout() {
                    res.latch_status(TIMEOUT_STATUS);
                }
                else {
                    debug!("{} {}: {}", ctx.remote_addr, ctx.raw_path, e);
                    if let Err(io) = error_messages::reply(&mut res, &ctx, &e) {
                        debug!("Cannot send error response: {}", io);
                    }
                }
                e.line()
            }
        };

        if let Err(e) = res.flush() {
            debug!("Flush failed: {}", e);
            res.set_close(true);
        }

        self.requests += 1;
        let usage = self.accounting.sample();
        log.write(&Record {
            remote_addr: &ctx.remote_addr,
            scheme: config.scheme(),
            host: ctx.host.as_ref().map_or("", |h| &h[..]),
            script: &ctx.script,
            real_script: ctx.real_script(),
            referer: ctx.referer.as_ref().map_or("", |r| &r[..]),
            status: res.status().unwrap_or(""),
            bytes_in: ctx.bytes_in,
            bytes_out: res.bytes_out(),
            usage: usage,
            request_number: self.requests,
            user_agent: ctx.user_agent.as_ref().map_or("", |u| &u[..]),
            remote_user: ctx.remote_user.as_ref().map_or("", |u| &u[..]),
            line: line
        });

        drop(ctx.spool.take());

        if res.will_close() { Next::Close } else { Next::Continue }
    }

    #[inline]
    pub fn output(&self) -> &W {
        self.output.get_ref()
    }
}

/// Runs one request through parsing, resolution, authorization and
/// dispatch. `Ok(None)` means the client went away before sending anything.
fn process<R, W>(input: &mut BufReader<DeadlineReader<R>>, ctx: &mut RequestContext,
                 res: &mut Response<W>, config: &Config, clock: &Clock)
                 -> Result<Option<u32>>
    where R: Read + Pollable, W: Output
{
    if !request::read_request_line(input, ctx)? {
        return Ok(None);
    }
    res.set_protocol(&ctx.protocol);

    input.get_mut().set_deadline(clock.deadline(Phase::Header));
    request::read_headers(input, ctx)?;
    res.set_close(ctx.close);

    if let Some(len) = ctx.body_length() {
        if len > config.max_content_length {
            return Err(Error::new(ErrorKind::RequestTooLarge));
        }
        input.get_mut().set_deadline(clock.deadline(Phase::Body(len)));
        request::read_body(input, ctx, len)?;
    }

    input.get_mut().set_deadline(clock.deadline(Phase::Process));
    res.set_deadline(clock.deadline(Phase::Process));

    filesystem::check_path(&ctx.script)?;
    let root = config.root.clone().unwrap_or_else(|| PathBuf::from("."));
    let home = filesystem::find_home(&root, ctx.host.as_ref().map(|h| &h[..]),
                                     config.standalone())?;
    debug!("{} resolves under {}", ctx.script, home.display());
    ctx.home = Some(home.clone());

    let target = match filesystem::resolve(&home, &ctx.script)? {
        Resolution::Found(target) => target,
        Resolution::Redirect(path) => {
            res.redirect(&ctx.absolute_url(config.scheme(), &path))?;
            return Ok(Some(line!()));
        }
    };
    ctx.target = Some(target.clone());

    let auth_file = target.dir.join(AUTH_FILE);
    if filesystem::is_readable(&auth_file) {
        if let Access::Redirect(url) = auth::check_access(&auth_file, ctx, config.https)? {
            res.redirect(&url)?;
            return Ok(Some(line!()));
        }
    }

    let line = if target.executable {
        cgi::run(&target, ctx, res, config, clock)?
    }
    else {
        static_files::serve_file(&target, ctx, res, clock)?
    };

    Ok(Some(line))
}

/// Address as it should appear to CGI programs and in the log
fn display_addr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string()
        },
        IpAddr::V4(v4) => v4.to_string()
    }
}

/// Serves the connection sitting on descriptors 0 and 1.
fn serve_stdio(remote_addr: String, config: &Config, log: &AccessLog) -> Result<()> {
    let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let output = File::from(io::stdout().as_fd().try_clone_to_owned()?);
    // Both descriptors share one file description, so this covers input too
    deadline::set_nonblocking(output.as_raw_fd(), true)?;

    let mut conn = Connection::new(input, output, remote_addr);
    conn.serve(config, log);
    Ok(())
}

/// Handles the single connection a super-server passed us.
pub fn run_inetd(config: &Config, log: &AccessLog) -> Result<()> {
    let remote_addr = if config.https {
        env::var("REMOTE_HOST").unwrap_or_default()
    }
    else {
        let stream = TcpStream::from(io::stdin().as_fd().try_clone_to_owned()?);
        match stream.peer_addr() {
            Ok(addr) => display_addr(addr.ip()),
            Err(e) => {
                debug!("No peer address on stdin: {}", e);
                String::new()
            }
        }
    };

    serve_stdio(remote_addr, config, log)
}

/// Accepts connections forever, forking a handler for each one.
pub fn run_standalone(listener: TcpListener, config: &Config, log: &AccessLog) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    let mut children: usize = 0;

    loop {
        let accepted = listener.accept();
        children = children.saturating_sub(access_log::reap_children());

        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Failed connection: {}", e);
                continue;
            }
        };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(listener);
                process::exit(match handle_child(stream, addr, config, log) {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!("Connection from {} failed: {}", addr, e);
                        1
                    }
                });
            },
            Ok(ForkResult::Parent { .. }) => {
                children += 1;
                drop(stream);
                if children > MAX_PARALLEL {
                    let pause = (children - MAX_PARALLEL) as u64;
                    debug!("{} handlers running; pausing {}s", children, pause);
                    thread::sleep(Duration::from_secs(pause));
                }
            },
            Err(e) => {
                warn!("Cannot fork: {}", e);
                drop(stream);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

fn handle_child(stream: TcpStream, addr: SocketAddr, config: &Config, log: &AccessLog)
                -> Result<()>
{
    let fd = stream.as_raw_fd();
    dup2(fd, 0).map_err(io::Error::from)?;
    dup2(fd, 1).map_err(io::Error::from)?;
    drop(stream);

    serve_stdio(display_addr(addr.ip()), config, log)
}
