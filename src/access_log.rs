//! CSV audit records, one per finished request

use crate::log_util::csv_escape;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::time::Instant;

/// Safe wrapper for `libc::getrusage`.
fn getrusage(who: libc::c_int) -> io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(who, rusage.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

fn micros(tv: libc::timeval) -> i64 {
    tv.tv_sec as i64 * 1_000_000 + tv.tv_usec as i64
}

/// User and system CPU time, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    pub user: i64,
    pub system: i64
}

impl CpuTime {
    fn sample(who: libc::c_int) -> CpuTime {
        match getrusage(who) {
            Ok(r) => CpuTime { user: micros(r.ru_utime), system: micros(r.ru_stime) },
            Err(_) => CpuTime::default()
        }
    }

    fn since(self, prior: CpuTime) -> CpuTime {
        CpuTime { user: self.user - prior.user, system: self.system - prior.system }
    }
}

/// Resource use between consecutive records on one connection
#[derive(Debug)]
pub struct Accounting {
    prior_self: CpuTime,
    prior_children: CpuTime,
    prior_wall: Instant
}

/// What changed since the last record
#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub own: CpuTime,
    pub children: CpuTime,
    pub wall_micros: i64
}

impl Accounting {
    pub fn new() -> Accounting {
        Accounting {
            prior_self: CpuTime::default(),
            prior_children: CpuTime::default(),
            prior_wall: Instant::now()
        }
    }

    /// Usage since the previous call, or since this connection started
    pub fn sample(&mut self) -> Usage {
        reap_children();

        let own = CpuTime::sample(libc::RUSAGE_SELF);
        let children = CpuTime::sample(libc::RUSAGE_CHILDREN);
        let now = Instant::now();

        let usage = Usage {
            own: own.since(self.prior_self),
            children: children.since(self.prior_children),
            wall_micros: now.duration_since(self.prior_wall).as_micros() as i64
        };

        self.prior_self = own;
        self.prior_children = children;
        self.prior_wall = now;
        usage
    }
}

/// Collects every child that has already exited, without blocking.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => return reaped,
            Ok(_) => reaped += 1
        }
    }
}

/// Everything that goes into one record
#[derive(Debug)]
pub struct Record<'a> {
    pub remote_addr: &'a str,
    pub scheme: &'a str,
    pub host: &'a str,
    pub script: &'a str,
    pub real_script: &'a str,
    pub referer: &'a str,
    pub status: &'a str,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub usage: Usage,
    pub request_number: u32,
    pub user_agent: &'a str,
    pub remote_user: &'a str,
    pub line: u32
}

impl<'a> Record<'a> {
    /// The CSV line, newline included
    pub fn format(&self, now: &DateTime<Local>) -> String {
        let url_len = self.scheme.len() + 3 + self.host.len() + self.real_script.len();

        format!("{},{},\"{}://{}{}\",\"{}\",{},{},{},{},{},{},{},{},{},\"{}\",\"{}\",{},{}\n",
                now.format("%Y-%m-%d %H:%M:%S"),
                self.remote_addr,
                self.scheme, csv_escape(self.host), csv_escape(self.script),
                csv_escape(self.referer),
                self.status,
                self.bytes_in,
                self.bytes_out,
                self.usage.own.user,
                self.usage.own.system,
                self.usage.children.user,
                self.usage.children.system,
                self.usage.wall_micros,
                self.request_number,
                csv_escape(self.user_agent),
                csv_escape(self.remote_user),
                url_len,
                self.line)
    }
}

/// Expands strftime placeholders in a log path. An invalid pattern is used
/// literally.
pub fn expand_path(template: &str, now: &DateTime<Local>) -> String {
    if !template.contains('%') {
        return String::from(template);
    }

    let items: Vec<Item> = StrftimeItems::new(template).collect();
    if items.iter().any(|i| *i == Item::Error) {
        return String::from(template);
    }

    now.format_with_items(items.iter()).to_string()
}

/// Where records go, if anywhere
#[derive(Debug, Clone)]
pub struct AccessLog {
    template: Option<String>
}

impl AccessLog {
    pub fn new(template: Option<String>) -> AccessLog {
        AccessLog { template: template }
    }

    /// Appends `record` to the current log file. Failures are reported on
    /// stderr and otherwise ignored.
    pub fn write(&self, record: &Record) {
        let template = match self.template {
            Some(ref t) => t,
            None => return
        };

        let now = Local::now();
        let path = expand_path(template, &now);
        let line = record.format(&now);

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));

        if let Err(e) = result {
            warn!("Cannot append to log file {}: {}", path, e);
        }
    }
}
