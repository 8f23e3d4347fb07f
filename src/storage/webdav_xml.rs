use anyhow::{anyhow, Result};
use chrono::DateTime;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::reader::Reader;

/// One `<d:response>` from a PROPFIND multistatus body, reduced to the
/// properties the backend cares about.
#[derive(Debug, Default, Clone)]
pub struct DavResource {
    pub href: String,
    pub display_name: String,
    pub is_collection: bool,
    pub content_length: Option<u64>,
    /// Seconds since epoch parsed from `getlastmodified`; 0 when absent.
    pub mtime: i64,
}

pub fn parse_multistatus(xml_text: &str) -> Result<Vec<DavResource>> {
    let mut reader = Reader::from_str(xml_text);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut current_element = String::new();
    let mut in_resourcetype = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(&e)?;
                match name.as_str() {
                    "response" => current = Some(DavResource::default()),
                    "resourcetype" => in_resourcetype = true,
                    "collection" if in_resourcetype => {
                        if let Some(ref mut res) = current {
                            res.is_collection = true;
                        }
                    }
                    _ => current_element = name,
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape()?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if let Some(ref mut res) = current {
                    match current_element.as_str() {
                        "href" => res.href = text,
                        "displayname" => res.display_name = text,
                        "getcontentlength" => res.content_length = text.parse().ok(),
                        "getlastmodified" => {
                            res.mtime = DateTime::parse_from_rfc2822(&text)
                                .map(|dt| dt.timestamp())
                                .unwrap_or(0);
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name_end(&e)?;
                match name.as_str() {
                    "response" => {
                        if let Some(res) = current.take() {
                            if !res.href.is_empty() {
                                resources.push(res);
                            }
                        }
                    }
                    "resourcetype" => in_resourcetype = false,
                    _ => current_element.clear(),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("malformed multistatus XML: {}", e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(resources)
}

/// The PROPFIND request body asking for the properties we map into entries.
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:displayname />
    <d:getcontentlength />
    <d:getlastmodified />
    <d:resourcetype />
  </d:prop>
</d:propfind>"#;

fn local_name(e: &BytesStart) -> Result<String> {
    let name = e.name();
    let full = std::str::from_utf8(name.as_ref())?;
    Ok(full.split(':').next_back().unwrap_or(full).to_lowercase())
}

fn local_name_end(e: &BytesEnd) -> Result<String> {
    let name = e.name();
    let full = std::str::from_utf8(name.as_ref())?;
    Ok(full.split(':').next_back().unwrap_or(full).to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/photos/</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>photos</d:displayname>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getlastmodified>Sat, 01 Feb 2025 10:00:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/photos/cat%20pic.jpg</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>cat pic.jpg</d:displayname>
        <d:resourcetype/>
        <d:getcontentlength>4242</d:getcontentlength>
        <d:getlastmodified>Sun, 02 Feb 2025 11:30:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn parses_collections_and_files() {
        let resources = parse_multistatus(SAMPLE).unwrap();
        assert_eq!(resources.len(), 2);

        assert!(resources[0].is_collection);
        assert_eq!(resources[0].href, "/dav/photos/");
        assert!(resources[0].mtime > 0);

        assert!(!resources[1].is_collection);
        assert_eq!(resources[1].content_length, Some(4242));
        assert_eq!(resources[1].display_name, "cat pic.jpg");
    }

    #[test]
    fn tolerates_missing_properties() {
        let xml = r#"<d:multistatus xmlns:d="DAV:">
            <d:response><d:href>/x</d:href></d:response>
        </d:multistatus>"#;
        let resources = parse_multistatus(xml).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].content_length, None);
        assert_eq!(resources[0].mtime, 0);
    }
}
