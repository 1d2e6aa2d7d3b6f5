//! Turns a JMA XML report into a generic JSON tree so the field resolvers
//! can treat XML and JSON-format telegrams alike.
//!
//! Mapping rules:
//! - an element becomes a key under its parent (namespace prefix dropped);
//! - a repeated element becomes an array, in document order;
//! - attributes become `@name` keys;
//! - an element with only text becomes a string; text next to attributes or
//!   children is kept under `#text`.

use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

struct Frame {
    name: String,
    map: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut map = Map::new();
        for attr in start.attributes() {
            let attr = attr.context("malformed XML attribute")?;
            if attr.key.as_ref().starts_with(b"xmlns") {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            map.insert(format!("@{key}"), Value::String(value));
        }
        Ok(Self {
            name,
            map,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim().to_string();
        let value = if self.map.is_empty() {
            Value::String(text)
        } else {
            let mut map = self.map;
            if !text.is_empty() {
                map.insert("#text".into(), Value::String(text));
            }
            Value::Object(map)
        };
        (self.name, value)
    }
}

fn attach(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        None => {
            parent.insert(name, value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

/// Parse `xml` into a tree rooted at an object holding the document element.
pub fn parse(xml: &str) -> Result<Value> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root = Map::new();
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        match reader.read_event().context("malformed XML")? {
            Event::Start(e) => stack.push(Frame::open(&e)?),
            Event::Empty(e) => {
                let (name, value) = Frame::open(&e)?.close();
                match stack.last_mut() {
                    Some(parent) => attach(&mut parent.map, name, value),
                    None => attach(&mut root, name, value),
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                let Some(frame) = stack.pop() else {
                    continue;
                };
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => attach(&mut parent.map, name, value),
                    None => attach(&mut root, name, value),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        bail!("truncated XML: <{}> is never closed", open.name);
    }
    Ok(Value::Object(root))
}
