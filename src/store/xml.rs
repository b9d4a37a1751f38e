//! Blob service XML payloads.
//!
//! Put Block List bodies are written with the `quick-xml` event writer;
//! List Containers responses are read through `quick-xml`'s serde support.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Deserialize;
use std::io::Cursor;

// ── Put Block List ──────────────────────────────────────────────────

/// Render the `<BlockList>` body for Put Block List.
///
/// ```xml
/// <?xml version="1.0" encoding="utf-8"?>
/// <BlockList>
///   <Latest>AAAA</Latest>
///   <Latest>AAAB</Latest>
/// </BlockList>
/// ```
pub fn render_block_list(block_ids: &[String]) -> Result<String, quick_xml::Error> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("BlockList")))?;
    for id in block_ids {
        writer.write_event(Event::Start(BytesStart::new("Latest")))?;
        writer.write_event(Event::Text(BytesText::new(id)))?;
        writer.write_event(Event::End(BytesEnd::new("Latest")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("BlockList")))?;

    // Only `&str` content was written, so the buffer is valid UTF-8.
    Ok(String::from_utf8_lossy(&writer.into_inner().into_inner()).into_owned())
}

// ── List Containers ─────────────────────────────────────────────────

/// One page of a List Containers response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerListing {
    #[serde(default)]
    pub containers: ContainerEntries,
    #[serde(default)]
    pub next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerEntries {
    #[serde(rename = "Container", default)]
    pub items: Vec<ContainerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ContainerEntry {
    #[serde(rename = "Name")]
    pub name: String,
}

impl ContainerListing {
    /// Container names on this page.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.containers.items.iter().map(|c| c.name.as_str())
    }

    /// Marker for the next page, `None` on the last page.
    pub fn continuation(&self) -> Option<&str> {
        self.next_marker.as_deref().filter(|m| !m.is_empty())
    }
}

/// Parse an `<EnumerationResults>` document.
pub fn parse_container_listing(xml: &str) -> Result<ContainerListing, quick_xml::DeError> {
    quick_xml::de::from_str(xml)
}
