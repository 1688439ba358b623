//! Small helpers over `roxmltree` shared by the resource list and master data readers.
//!
//! Elements are matched by local name so that documents using different namespace
//! prefixes for the same vocabulary are read the same way.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use roxmltree::Node;

use crate::errors::{Result, SyncError};

pub fn is_element(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

pub fn children<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |child| is_element(child, name))
}

pub fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| is_element(child, name))
}

/// The single child called `name`; more than one is a structural error.
pub fn unique_child<'a, 'input>(
    node: Node<'a, 'input>,
    name: &str,
) -> Result<Option<Node<'a, 'input>>> {
    let mut found = node.children().filter(|child| is_element(child, name));
    let first = found.next();
    if found.next().is_some() {
        return Err(SyncError::parse(format!(
            "element <{}> contains more than one <{name}>",
            node.tag_name().name()
        )));
    }
    Ok(first)
}

pub fn text(node: Node) -> String {
    node.text().map(str::trim).unwrap_or_default().to_string()
}

/// Attribute value, with blank values treated as absent.
pub fn attr(node: Node, name: &str) -> Option<String> {
    node.attribute(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn required_attr(node: Node, name: &str) -> Result<String> {
    attr(node, name).ok_or_else(|| {
        SyncError::parse(format!(
            "element <{}> is missing required attribute '{name}'",
            node.tag_name().name()
        ))
    })
}

pub fn bool_attr(node: Node, name: &str) -> bool {
    attr(node, name)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Timestamp attribute; malformed values are logged and treated as absent.
pub fn timestamp_attr(node: Node, name: &str) -> Option<DateTime<Utc>> {
    let raw = attr(node, name)?;
    match parse_timestamp(&raw) {
        Ok(ts) => Some(ts),
        Err(err) => {
            log::warn!("Ignoring attribute '{name}': {err}");
            None
        }
    }
}

/// Accepts RFC 3339 and the zone-less `yyyy-MM-ddTHH:mm:ss` form, which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(SyncError::parse(format!("unparseable timestamp '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_less_timestamps_are_utc() {
        let ts = parse_timestamp("2024-03-01T10:15:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:15:00+00:00");
        let offset = parse_timestamp("2024-03-01T12:15:00+02:00").unwrap();
        assert_eq!(ts, offset);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn unique_child_rejects_duplicates() {
        let doc = roxmltree::Document::parse("<a><b/><b/><c x=' '/></a>").unwrap();
        let root = doc.root_element();
        assert!(unique_child(root, "b").is_err());
        let c = unique_child(root, "c").unwrap().unwrap();
        assert_eq!(attr(c, "x"), None);
        assert!(required_attr(c, "x").is_err());
    }
}
