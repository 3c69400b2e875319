//! Sitemap post-processing.
//!
//! The site renderer indexes everything it publishes, including documents
//! that must stay reachable-but-unlisted (secret documents live under a
//! non-browsable prefix). This stage removes their `<url>` entries from the
//! generated `sitemap.xml` before deployment.

use std::fs;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use tracing::info;

use crate::error::{Error, Result};

/// URL path fragment marking entries that must not appear in the sitemap.
pub const DEFAULT_MARKER: &str = "/non-browsable/";

/// Removes `<url>` entries whose `<loc>` contains `marker` from the sitemap
/// at `path`. The file is only rewritten when something was removed.
pub fn strip_non_browsable(path: &Path, marker: &str) -> Result<usize> {
    let content = fs::read_to_string(path)?;
    let (output, removed) = filter_sitemap(&content, marker)?;
    if removed > 0 {
        fs::write(path, output)?;
        info!(removed, path = %path.display(), "Removed non-browsable URLs from sitemap");
    } else {
        info!(path = %path.display(), "No non-browsable URLs found in sitemap");
    }
    Ok(removed)
}

/// Pure filtering over sitemap XML; returns the rewritten document and how
/// many entries were dropped.
pub fn filter_sitemap(content: &str, marker: &str) -> Result<(String, usize)> {
    let mut reader = Reader::from_str(content);
    let mut writer = Writer::new(Vec::new());

    let mut removed = 0usize;
    let mut in_url = false;
    let mut in_loc = false;
    let mut drop_entry = false;
    let mut saw_decl = false;
    // Events inside the current <url> are buffered until we know whether
    // its <loc> matches the marker.
    let mut url_buffer: Vec<Event<'static>> = Vec::new();

    loop {
        let ev = reader.read_event()?;
        match ev {
            Event::Eof => break,
            Event::Decl(_) => {
                saw_decl = true;
                writer.write_event(ev)?;
            }
            Event::Start(ref e) if !in_url && e.local_name().as_ref() == b"url" => {
                in_url = true;
                drop_entry = false;
                url_buffer.clear();
                url_buffer.push(ev.into_owned());
            }
            Event::End(ref e) if in_url && e.local_name().as_ref() == b"url" => {
                url_buffer.push(ev.into_owned());
                in_url = false;
                if drop_entry {
                    removed += 1;
                    url_buffer.clear();
                } else {
                    for buffered in url_buffer.drain(..) {
                        writer.write_event(buffered)?;
                    }
                }
            }
            Event::Start(ref e) if in_url && e.local_name().as_ref() == b"loc" => {
                in_loc = true;
                url_buffer.push(ev.into_owned());
            }
            Event::End(ref e) if in_url && e.local_name().as_ref() == b"loc" => {
                in_loc = false;
                url_buffer.push(ev.into_owned());
            }
            Event::Text(ref t) if in_url && in_loc => {
                if t.unescape()?.contains(marker) {
                    drop_entry = true;
                }
                url_buffer.push(ev.into_owned());
            }
            other if in_url => url_buffer.push(other.into_owned()),
            other => writer.write_event(other)?,
        }
    }

    let mut output = String::from_utf8(writer.into_inner())
        .map_err(|e| Error::Other(format!("sitemap output is not UTF-8: {e}")))?;
    if !saw_decl {
        output = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{output}");
    }
    Ok((output, removed))
}
