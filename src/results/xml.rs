//! Minimal XML tree for runner result documents
//!
//! The merger and discovery only need element names, attributes, text and
//! child order, so the model is a plain tree. Serialization is
//! deterministic: the same tree always produces the same bytes.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// One node in a document: an element or a text run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlNode {
    Element(Element),
    Text(String),
}

/// An XML element with ordered attributes and children.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn push_element(&mut self, child: Element) {
        self.children.push(XmlNode::Element(child));
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn elements_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.name == name)
    }

    pub fn first_named<'a>(&'a self, name: &'a str) -> Option<&'a Element> {
        self.elements_named(name).next()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                XmlNode::Text(t) => Some(t.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children.retain(|n| matches!(n, XmlNode::Element(_)));
        self.children.insert(0, XmlNode::Text(text.into()));
    }
}

/// Parse a document from a string; returns the root element.
pub fn parse_document(input: &str) -> Result<Element> {
    let mut reader = Reader::from_str(input);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack.pop().context("unbalanced end tag")?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    let text = text.unescape()?.into_owned();
                    parent.children.push(XmlNode::Text(text));
                }
            }
            Event::CData(data) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    parent.children.push(XmlNode::Text(text));
                }
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions carry
            // nothing the merger needs.
            _ => {}
        }
    }
    match root {
        Some(root) if stack.is_empty() => Ok(root),
        _ => bail!("document has no well-formed root element"),
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut Vec<Element>, root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlNode::Element(element)),
        None => {
            if root.replace(element).is_some() {
                bail!("document has more than one root element");
            }
        }
    }
    Ok(())
}

/// Read and parse a document from disk.
pub fn read_document(path: &Path) -> Result<Element> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read result file: {}", path.display()))?;
    parse_document(&content)
        .with_context(|| format!("failed to parse result file: {}", path.display()))
}

/// Serialize a document with an XML declaration.
pub fn render_document(root: &Element) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_element(&mut writer, root)?;
    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes)?)
}

fn write_element(writer: &mut Writer<Cursor<Vec<u8>>>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(&element.name);
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        match child {
            XmlNode::Element(e) => write_element(writer, e)?,
            XmlNode::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
        }
    }
    writer.write_event(Event::End(BytesEnd::new(&element.name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_query() {
        let root = parse_document(
            r#"<robot generator="x"><suite name="Root"><test name="T1"><status status="PASS"/></test></suite></robot>"#,
        )
        .unwrap();
        assert_eq!(root.name, "robot");
        assert_eq!(root.attr("generator"), Some("x"));
        let suite = root.first_named("suite").unwrap();
        assert_eq!(suite.attr("name"), Some("Root"));
        let test = suite.first_named("test").unwrap();
        let status = test.first_named("status").unwrap();
        assert_eq!(status.attr("status"), Some("PASS"));
    }

    #[test]
    fn text_and_escaping_round_trip() {
        let input = r#"<msg html="true">a &lt;b&gt; &amp; c</msg>"#;
        let root = parse_document(input).unwrap();
        assert_eq!(root.text(), "a <b> & c");
        let rendered = render_document(&root).unwrap();
        let reparsed = parse_document(&rendered).unwrap();
        assert_eq!(root, reparsed);
    }

    #[test]
    fn render_is_deterministic() {
        let root = parse_document(r#"<a x="1"><b/><b y="2">text</b></a>"#).unwrap();
        let once = render_document(&root).unwrap();
        let twice = render_document(&parse_document(&once).unwrap()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_document("<a><b></a>").is_err());
        assert!(parse_document("no xml here").is_err());
    }
}
