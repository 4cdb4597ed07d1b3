//! Getting from "started as whoever" to "ready to serve"
//!
//! Order matters: the jail has to be entered while we are still root, the
//! listening socket is bound before giving up root so low ports work, and
//! the process refuses to go on if it is still root at the end.

use crate::config::{Config, Family};

use chrono::Local;
use nix::unistd::{chdir, chroot, getuid, setgid, setgroups, setuid, User};

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::path::PathBuf;

/// Reasons the server cannot start
#[derive(Debug)]
pub enum Error {
    Chdir(PathBuf, nix::Error),
    Chroot(nix::Error),
    Bind(u16, io::Error),
    UnknownUser(String),
    DropPrivileges(String, nix::Error),
    RunningAsRoot
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Chdir(ref dir, ref e) =>
                write!(f, "cannot change directory to {}: {}", dir.display(), e),
            Error::Chroot(ref e) => write!(f, "unable to create chroot jail: {}", e),
            Error::Bind(port, ref e) => write!(f, "cannot listen on port {}: {}", port, e),
            Error::UnknownUser(ref name) => write!(f, "no such user: {}", name),
            Error::DropPrivileges(ref name, ref e) =>
                write!(f, "cannot become user {}: {}", name, e),
            Error::RunningAsRoot => write!(f, "cannot run as root"),
        }
    }
}

/// Moves into the content root, entering a jail there when running as
/// root with a user to switch to. Afterwards `config.root` names the root
/// as seen from inside.
pub fn enter_root(config: &mut Config) -> Result<(), Error> {
    let root = match config.root {
        Some(ref r) => r.clone(),
        None => return Ok(())
    };

    chdir(&root).map_err(|e| Error::Chdir(root.clone(), e))?;

    if config.user.is_some() && config.jail && getuid().is_root() {
        // Local time zone data is unreachable once jailed
        Local::now();

        chroot(".").map_err(Error::Chroot)?;
        info!("Entered chroot jail at {}", root.display());
        config.root = Some(PathBuf::from("/"));
    }
    else {
        config.root = Some(PathBuf::from("."));
    }

    Ok(())
}

/// The wildcard address for a family
pub fn listen_addr(family: Family, port: u16) -> SocketAddr {
    match family {
        Family::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        Family::Ipv6 | Family::Any => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
    }
}

pub fn bind(family: Family, port: u16) -> Result<TcpListener, Error> {
    TcpListener::bind(listen_addr(family, port)).map_err(|e| Error::Bind(port, e))
}

/// Switches group then user to `name`.
pub fn become_user(name: &str) -> Result<(), Error> {
    let user = match User::from_name(name) {
        Ok(Some(u)) => u,
        Ok(None) => return Err(Error::UnknownUser(String::from(name))),
        Err(e) => return Err(Error::DropPrivileges(String::from(name), e))
    };

    setgroups(&[user.gid]).map_err(|e| Error::DropPrivileges(String::from(name), e))?;
    setgid(user.gid).map_err(|e| Error::DropPrivileges(String::from(name), e))?;
    setuid(user.uid).map_err(|e| Error::DropPrivileges(String::from(name), e))?;

    info!("Running as {} ({}:{})", name, user.uid, user.gid);
    Ok(())
}

pub fn refuse_root() -> Result<(), Error> {
    if getuid().is_root() {
        Err(Error::RunningAsRoot)
    }
    else {
        Ok(())
    }
}

/// Runs the whole sequence. Returns the listener in standalone mode.
pub fn prepare(config: &mut Config) -> Result<Option<TcpListener>, Error> {
    enter_root(config)?;

    let listener = match config.port {
        Some(port) => Some(bind(config.family, port)?),
        None => None
    };

    if let Some(ref name) = config.user {
        become_user(name)?;
    }

    refuse_root()?;
    Ok(listener)
}
