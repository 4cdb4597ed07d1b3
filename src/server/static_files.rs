//! Static file service

use super::request::{Method, RequestContext};
use super::response::{http_date, mime_as_string, Response};
use crate::deadline::{Clock, Output, Phase};
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::Target;

use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Content type for a file, judged by its suffix
pub fn content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first()
        .map(mime_as_string)
        .unwrap_or_else(|| String::from("application/octet-stream"))
}

/// Sends `target` to the client. Returns the source line to log.
pub fn serve_file<W: Output>(target: &Target, ctx: &RequestContext,
                             res: &mut Response<W>, clock: &Clock)
                             -> Result<u32>
{
    let mut file = match File::open(&target.file) {
        Ok(f) => f,
        Err(e) => {
            debug!("Cannot open {}: {}", target.file.display(), e);
            return Err(Error::new(ErrorKind::NotFound));
        }
    };
    let len = target.metadata.len();

    res.start("200 OK")?;
    if let Ok(modified) = target.metadata.modified() {
        res.header("Last-Modified", &http_date(modified))?;
    }
    res.header("Content-Type", &content_type(&target.file))?;
    res.header("Content-Length", &len.to_string())?;
    res.end_headers()?;
    res.flush()?;

    if ctx.method == Some(Method::Head) {
        return Ok(line!());
    }

    res.set_deadline(clock.deadline(Phase::StaticBody(len)));
    res.send_file(&mut file, len)?;

    Ok(line!())
}
