//! Application node model.
//!
//! Every decrypted frame decodes to a [`Node`]: a tag, a string attribute
//! map and optional content (raw bytes, text, or ordered children). The
//! production binary tree codec is an external collaborator consumed through
//! [`NodeCodec`]; this crate only fixes the node shape.

use crate::error::{ClientError, Result};
use std::collections::BTreeMap;

/// Content of a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeContent {
    /// No content.
    #[default]
    None,
    /// Raw binary content.
    Bytes(Vec<u8>),
    /// Text content.
    Text(String),
    /// Ordered child nodes.
    Children(Vec<Node>),
}

/// One node of the application payload tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    /// Node tag.
    pub tag: String,
    /// Attribute map; order is irrelevant on the wire.
    pub attrs: BTreeMap<String, String>,
    /// Node content.
    pub content: NodeContent,
}

impl Node {
    /// Node with a tag and nothing else.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Add an attribute (builder style).
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Set child nodes (builder style).
    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Set raw byte content (builder style).
    pub fn bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    /// Attribute value, if present.
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Correlation id attribute, if present.
    pub fn id(&self) -> Option<&str> {
        self.get_attr("id")
    }

    /// Child nodes, or an empty slice for non-tree content.
    pub fn child_nodes(&self) -> &[Node] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    /// First child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.child_nodes().iter().find(|c| c.tag == tag)
    }

    /// Tag of the first child, if any.
    pub fn first_child_tag(&self) -> Option<&str> {
        self.child_nodes().first().map(|c| c.tag.as_str())
    }

    /// Byte content, if this node carries raw bytes.
    pub fn bytes_content(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text content, whether stored as text or UTF-8 bytes.
    pub fn text_content(&self) -> Option<String> {
        match &self.content {
            NodeContent::Text(t) => Some(t.clone()),
            NodeContent::Bytes(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }

    /// Fail with `RequestFailed` if this node encodes a protocol-level error.
    ///
    /// A response carrying an `<error code=.. text=..>` child, or itself
    /// tagged `error`, is a server rejection of the specific request. These
    /// never close the connection.
    pub fn ensure_error_free(&self) -> Result<()> {
        let err_node = if self.tag == "error" {
            Some(self)
        } else {
            self.child("error")
        };

        if let Some(err) = err_node {
            let code = err
                .get_attr("code")
                .and_then(|c| c.parse::<u16>().ok())
                .unwrap_or(500);
            let text = err.get_attr("text").unwrap_or_default().to_string();
            return Err(ClientError::RequestFailed { code, text });
        }
        Ok(())
    }
}

/// Seam for the external self-describing binary tree codec.
///
/// The production codec lives outside this crate; anything implementing this
/// trait can be plugged into a connection.
pub trait NodeCodec: Send + Sync + 'static {
    /// Encode a node to payload bytes.
    fn encode(&self, node: &Node) -> Vec<u8>;
    /// Decode payload bytes to a node.
    fn decode(&self, bytes: &[u8]) -> Result<Node>;
}

/// Minimal length-prefixed reference codec.
///
/// Not the production wire codec; used by the test suite and useful for
/// loopback tooling. The format is self-describing: tag and attribute
/// strings are u16-length-prefixed, content is tagged by a one-byte marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleCodec;

impl SimpleCodec {
    fn write_str(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    fn read_str(bytes: &[u8], pos: &mut usize) -> Result<String> {
        let len = Self::read_u16(bytes, pos)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| ClientError::Codec("truncated string".into()))?;
        let s = std::str::from_utf8(&bytes[*pos..end])
            .map_err(|_| ClientError::Codec("invalid UTF-8".into()))?
            .to_string();
        *pos = end;
        Ok(s)
    }

    fn read_u16(bytes: &[u8], pos: &mut usize) -> Result<u16> {
        if *pos + 2 > bytes.len() {
            return Err(ClientError::Codec("truncated length".into()));
        }
        let v = u16::from_be_bytes([bytes[*pos], bytes[*pos + 1]]);
        *pos += 2;
        Ok(v)
    }

    fn write_node(out: &mut Vec<u8>, node: &Node) {
        Self::write_str(out, &node.tag);
        out.extend_from_slice(&(node.attrs.len() as u16).to_be_bytes());
        for (k, v) in &node.attrs {
            Self::write_str(out, k);
            Self::write_str(out, v);
        }
        match &node.content {
            NodeContent::None => out.push(0),
            NodeContent::Bytes(b) => {
                out.push(1);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            NodeContent::Text(t) => {
                out.push(2);
                Self::write_str(out, t);
            }
            NodeContent::Children(children) => {
                out.push(3);
                out.extend_from_slice(&(children.len() as u16).to_be_bytes());
                for child in children {
                    Self::write_node(out, child);
                }
            }
        }
    }

    fn read_node(bytes: &[u8], pos: &mut usize) -> Result<Node> {
        let tag = Self::read_str(bytes, pos)?;
        let attr_count = Self::read_u16(bytes, pos)?;
        let mut attrs = BTreeMap::new();
        for _ in 0..attr_count {
            let k = Self::read_str(bytes, pos)?;
            let v = Self::read_str(bytes, pos)?;
            attrs.insert(k, v);
        }

        let marker = *bytes
            .get(*pos)
            .ok_or_else(|| ClientError::Codec("truncated content marker".into()))?;
        *pos += 1;

        let content = match marker {
            0 => NodeContent::None,
            1 => {
                if *pos + 4 > bytes.len() {
                    return Err(ClientError::Codec("truncated byte length".into()));
                }
                let len = u32::from_be_bytes([
                    bytes[*pos],
                    bytes[*pos + 1],
                    bytes[*pos + 2],
                    bytes[*pos + 3],
                ]) as usize;
                *pos += 4;
                let end = pos
                    .checked_add(len)
                    .filter(|&e| e <= bytes.len())
                    .ok_or_else(|| ClientError::Codec("truncated bytes".into()))?;
                let b = bytes[*pos..end].to_vec();
                *pos = end;
                NodeContent::Bytes(b)
            }
            2 => NodeContent::Text(Self::read_str(bytes, pos)?),
            3 => {
                let count = Self::read_u16(bytes, pos)?;
                let mut children = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    children.push(Self::read_node(bytes, pos)?);
                }
                NodeContent::Children(children)
            }
            other => {
                return Err(ClientError::Codec(format!(
                    "unknown content marker {other}"
                )))
            }
        };

        Ok(Node { tag, attrs, content })
    }
}

impl NodeCodec for SimpleCodec {
    fn encode(&self, node: &Node) -> Vec<u8> {
        let mut out = Vec::new();
        Self::write_node(&mut out, node);
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<Node> {
        let mut pos = 0;
        let node = Self::read_node(bytes, &mut pos)?;
        if pos != bytes.len() {
            return Err(ClientError::Codec("trailing bytes after node".into()));
        }
        Ok(node)
    }
}
