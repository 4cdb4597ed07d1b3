//! Mapping sanitized request paths onto the filesystem
//!
//! A request is first pinned to a content root picked from its Host header
//! (`<root>/<host>.website`), then walked one path segment at a time until
//! a regular file turns up. Whatever is left of the path after that file is
//! handed to CGI programs as `PATH_INFO`.

use crate::errors::{Error, ErrorKind, Result};

use nix::unistd::{access, AccessFlags};

use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Only this hidden directory may be served
const WELL_KNOWN: &'static str = "/.well-known/";

/// Index documents tried, in order, for a path naming a directory
const INDEX_NAMES: [&'static str; 2] = ["index.html", "index.cgi"];

/// Sibling document served (by redirect) instead of a bare 404
const NOT_FOUND_PAGE: &'static str = "/not-found.html";

/// A file the request resolved to
#[derive(Debug, Clone)]
pub struct Target {
    /// Absolute filesystem path
    pub file: PathBuf,
    /// Directory holding `file`
    pub dir: PathBuf,
    /// Path of `file` relative to the content root, with a leading `/`
    pub real_script: String,
    /// Request path left over past `file`
    pub path_info: String,
    /// The owner may execute it, so it runs as a CGI program
    pub executable: bool,
    pub metadata: Metadata
}

/// Outcome of a successful walk
#[derive(Debug)]
pub enum Resolution {
    Found(Target),
    /// The client should ask again for this path
    Redirect(String)
}

#[track_caller]
fn not_found() -> Error {
    Error::new(ErrorKind::NotFound)
}

/// Rejects paths that don't start at the root or that reach hidden (`/.`)
/// or dash-prefixed (`/-`) names. A leading `/.well-known/` is allowed.
pub fn check_path(script: &str) -> Result<()> {
    if !script.starts_with('/') {
        return Err(not_found());
    }

    let bytes = script.as_bytes();
    for (i, pair) in bytes.windows(2).enumerate() {
        if pair[0] == b'/' && (pair[1] == b'.' || pair[1] == b'-') {
            if i == 0 && script.starts_with(WELL_KNOWN) {
                continue;
            }
            return Err(not_found());
        }
    }

    Ok(())
}

/// Turns a Host header into a directory name stem: everything before the
/// port, lowercased, with non-alphanumerics replaced by `'_'`.
pub fn fold_host(host: &str) -> String {
    host.bytes()
        .take_while(|&b| b != b':')
        .map(|b| if b.is_ascii_alphanumeric() { b.to_ascii_lowercase() as char }
                 else { '_' })
        .collect()
}

fn is_dir(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Picks the content root for `host` under `root`.
///
/// Falls back to `default.website`, and then (standalone servers only) to
/// `root` itself.
pub fn find_home(root: &Path, host: Option<&str>, standalone: bool) -> Result<PathBuf> {
    let host = match host {
        Some(h) if !h.is_empty() => h,
        _ => return Err(not_found())
    };

    let vhost = root.join(format!("{}.website", fold_host(host)));
    if is_dir(&vhost) {
        return Ok(vhost);
    }

    let default = root.join("default.website");
    if is_dir(&default) {
        return Ok(default);
    }

    if standalone {
        Ok(root.to_path_buf())
    }
    else {
        Err(not_found())
    }
}

/// `home` with `rel` (empty, or starting with `'/'`) glued on the end
fn under(home: &Path, rel: &str) -> PathBuf {
    let mut path = OsString::from(home.as_os_str());
    path.push(rel);
    PathBuf::from(path)
}

pub fn is_readable(path: &Path) -> bool {
    access(path, AccessFlags::R_OK).is_ok()
}

/// Owner execute bit set, and we may actually execute it
fn is_executable(path: &Path, metadata: &Metadata) -> bool {
    metadata.permissions().mode() & 0o100 != 0 &&
        access(path, AccessFlags::X_OK).is_ok()
}

fn readable_file(path: &Path) -> Option<Metadata> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() && is_readable(path) => Some(m),
        _ => None
    }
}

fn target(file: PathBuf, real_script: &str, path_info: &str, metadata: Metadata)
          -> Target
{
    let dir = match file.parent() {
        Some(d) => d.to_path_buf(),
        None => PathBuf::from("/")
    };
    let executable = is_executable(&file, &metadata);

    Target {
        file: file,
        dir: dir,
        real_script: String::from(real_script),
        path_info: String::from(path_info),
        executable: executable,
        metadata: metadata
    }
}

/// Looks for `not-found.html` in each directory above the prefix
/// `script[.. end]` that failed to resolve, nearest first.
fn not_found_page(home: &Path, script: &str, end: usize) -> Result<Resolution> {
    let mut end = end;
    while let Some(slash) = script[.. end].rfind('/') {
        let candidate = format!("{}{}", &script[.. slash], NOT_FOUND_PAGE);
        if readable_file(&under(home, &candidate)).is_some() {
            return Ok(Resolution::Redirect(candidate));
        }
        end = slash;
    }

    Err(not_found())
}

/// Walks `script` from `home` down to the file it names.
pub fn resolve(home: &Path, script: &str) -> Result<Resolution> {
    let bytes = script.as_bytes();
    let mut i = 0;

    loop {
        while i < bytes.len() && bytes[i] != b'/' {
            i += 1;
        }

        let prefix = &script[.. i];
        let path = under(home, prefix);
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => return not_found_page(home, script, i)
        };

        if metadata.is_file() {
            if !is_readable(&path) {
                return Err(not_found());
            }
            let found = target(path, prefix, &script[i ..], metadata);
            return check_trailing_segments(found, script);
        }

        if i + 1 >= bytes.len() {
            for index in INDEX_NAMES.iter() {
                let real_script = format!("{}/{}", prefix, index);
                let file = under(home, &real_script);
                if let Some(metadata) = readable_file(&file) {
                    if i == bytes.len() {
                        // Relative links in the page need the trailing slash
                        return Ok(Resolution::Redirect(real_script));
                    }
                    let found = target(file, &real_script, &script[i ..], metadata);
                    return check_trailing_segments(found, script);
                }
            }
            return Err(not_found());
        }

        i += 1;
    }
}

/// Static files may not have path segments trailing after them.
fn check_trailing_segments(target: Target, script: &str) -> Result<Resolution> {
    let slashes = |s: &str| s.bytes().filter(|&b| b == b'/').count();

    if !target.executable && slashes(&target.real_script) != slashes(script) {
        return Err(not_found());
    }

    Ok(Resolution::Found(target))
}
