//! Minimal mutable XML tree.
//!
//! Element and attribute names keep their namespace prefixes verbatim, so a
//! part read and written back keeps the same qualified names. Comments and
//! processing instructions inside parts are dropped.

use std::borrow::Cow;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::OoxmlError;

const DEFAULT_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    pub root: Element,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(k, _)| k != name);
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element with this local name.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local)
    }

    pub fn child_mut(&mut self, local: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.local_name() == local)
    }

    pub fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |e| e.local_name() == local)
    }

    /// Keep only child elements for which `keep` is true. Text is kept.
    pub fn retain_elements(&mut self, mut keep: impl FnMut(&Element) -> bool) {
        self.children.retain(|n| match n {
            Node::Element(e) => keep(e),
            Node::Text(_) => true,
        });
    }

    pub fn remove_children_named(&mut self, local: &str) {
        self.retain_elements(|e| e.local_name() != local);
    }

    pub fn push(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    /// Concatenated text of this element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: &str) {
        self.children = vec![Node::Text(text.to_string())];
    }

    fn write(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(&escape(t.as_str())),
                Node::Element(e) => e.write(out),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl XmlDocument {
    pub fn new(root: Element) -> Self {
        Self { root }
    }

    /// Parse a part. `part` only labels errors.
    pub fn parse(bytes: &[u8], part: &str) -> Result<Self, OoxmlError> {
        let err = |reason: String| OoxmlError::Xml {
            part: part.to_string(),
            reason,
        };
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| err(e.to_string()))?;
            match event {
                Event::Start(start) => stack.push(element_from(&start).map_err(err)?),
                Event::Empty(start) => {
                    let element = element_from(&start).map_err(err)?;
                    attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| err("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let value = text.unescape().map_err(|e| err(e.to_string()))?;
                        parent.children.push(Node::Text(value.into_owned()));
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let value = String::from_utf8_lossy(&data).into_owned();
                        parent.children.push(Node::Text(value));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(err("unclosed element".into()));
        }
        root.map(Self::new)
            .ok_or_else(|| err("document has no root element".into()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(4096);
        out.push_str(DEFAULT_DECL);
        self.root.write(&mut out);
        out.into_bytes()
    }
}

fn element_from(start: &BytesStart) -> Result<Element, String> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::new(&name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value: Cow<str> = attr.unescape_value().map_err(|e| e.to_string())?;
        element.attrs.push((key, value.into_owned()));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => *root = Some(element),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="r-ns">
<sheetData><row r="1"><c r="A1" t="inlineStr"><is><t xml:space="preserve">a &amp; b </t></is></c></row></sheetData>
<hyperlinks><hyperlink ref="A1" r:id="rId1"/></hyperlinks>
</worksheet>"#;

    #[test]
    fn parse_keeps_prefixes_and_text() {
        let doc = XmlDocument::parse(SAMPLE.as_bytes(), "sheet1.xml").unwrap();
        assert_eq!(doc.root.name, "worksheet");
        let link = doc.root.child("hyperlinks").unwrap().child("hyperlink").unwrap();
        assert_eq!(link.attr("r:id"), Some("rId1"));
        let cell = doc.root.child("sheetData").unwrap().child("row").unwrap().child("c").unwrap();
        assert_eq!(cell.text(), "a & b ");
    }

    #[test]
    fn write_then_parse_is_stable() {
        let doc = XmlDocument::parse(SAMPLE.as_bytes(), "sheet1.xml").unwrap();
        let again = XmlDocument::parse(&doc.to_bytes(), "sheet1.xml").unwrap();
        assert_eq!(doc, again);
    }

    #[test]
    fn attribute_values_escaped_on_write() {
        let root = Element::new("x").with_attr("v", "a<\"b\"&c");
        let bytes = XmlDocument::new(root).to_bytes();
        let back = XmlDocument::parse(&bytes, "x").unwrap();
        assert_eq!(back.root.attr("v"), Some("a<\"b\"&c"));
    }

    #[test]
    fn retain_and_set_attr() {
        let mut e = Element::new("sheets");
        e.push(Element::new("sheet").with_attr("name", "A"));
        e.push(Element::new("sheet").with_attr("name", "B"));
        e.retain_elements(|s| s.attr("name") == Some("B"));
        assert_eq!(e.elements().count(), 1);
        let b = e.child_mut("sheet").unwrap();
        b.set_attr("name", "C");
        b.remove_attr("missing");
        assert_eq!(e.child("sheet").unwrap().attr("name"), Some("C"));
    }

    #[test]
    fn malformed_part_reports_name() {
        let err = XmlDocument::parse(b"<a><b></a>", "xl/broken.xml").unwrap_err();
        assert!(err.to_string().contains("xl/broken.xml"));
    }

    #[test]
    fn local_name_strips_prefix() {
        assert_eq!(Element::new("x:Row").local_name(), "Row");
        assert_eq!(Element::new("row").local_name(), "row");
    }
}
