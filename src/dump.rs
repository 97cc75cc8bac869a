//! Human- and machine-readable views of a parsed box tree.

use crate::error::{Error, Result};
use crate::registry::{ContainerKind, Registry};
use crate::tree::Mp4Box;
use serde::Serialize;
use std::fmt::Write as _;
use std::io::{Read, Seek, SeekFrom};

/// A JSON-serializable view of one box and its subtree.
#[derive(Debug, Serialize)]
pub struct BoxNode {
    /// Absolute offset of the header, when the box came from a stream.
    pub offset: Option<u64>,
    pub size: u64,
    pub typ: String,
    pub uuid: Option<String>,
    /// Registered name, e.g. "Movie Header Box".
    pub name: Option<&'static str>,
    /// "leaf", "container", "payload+children" or "unknown".
    pub kind: &'static str,
    /// Decoded payload, if requested.
    pub decoded: Option<String>,
    pub children: Vec<BoxNode>,
}

fn kind_name(registry: &Registry, b: &Mp4Box) -> &'static str {
    match registry.kind(b.typ) {
        Some(ContainerKind::Leaf) => "leaf",
        Some(ContainerKind::Container) => "container",
        Some(ContainerKind::PayloadThenChildren) => "payload+children",
        None => "unknown",
    }
}

/// Builds the serializable tree. With `decode`, each node carries the debug
/// rendering of its typed payload.
pub fn box_nodes(boxes: &[Mp4Box], registry: &Registry, decode: bool) -> Vec<BoxNode> {
    boxes
        .iter()
        .map(|b| BoxNode {
            offset: b.offset,
            size: b.size(),
            typ: b.typ.to_string(),
            uuid: b.uuid.map(hex::encode),
            name: registry.lookup(b.typ).map(|d| d.name),
            kind: kind_name(registry, b),
            decoded: decode.then(|| describe(b)).flatten(),
            children: box_nodes(&b.children, registry, decode),
        })
        .collect()
}

fn describe(b: &Mp4Box) -> Option<String> {
    match &b.body {
        crate::boxes::BoxBody::Container => None,
        crate::boxes::BoxBody::Raw(bytes) => Some(format!("{} raw bytes", bytes.len())),
        body => Some(format!("{body:?}")),
    }
}

/// Indented one-line-per-box listing, down to `max_depth`.
pub fn render_text(boxes: &[Mp4Box], registry: &Registry, max_depth: usize, decode: bool) -> String {
    let mut out = String::new();
    for b in boxes {
        b.walk(&mut |node, depth| {
            if depth > max_depth {
                return;
            }
            let indent = "  ".repeat(depth);
            let offset = node.offset.map_or_else(|| "-".to_string(), |o| format!("{o:#x}"));
            let name = registry.lookup(node.typ).map_or("", |d| d.name);
            let _ = write!(out, "{indent}{offset:>8} {:>10} {} {name}", node.size(), node.typ);
            if decode {
                if let Some(d) = describe(node) {
                    let _ = write!(out, "  {d}");
                }
            }
            out.push('\n');
        });
    }
    out
}

/// Boxes matching a dotted path such as `moov.trak[1].mdia`. An index picks
/// the n-th child of that type; without one every match is followed.
pub fn select_by_path<'a>(boxes: &'a [Mp4Box], path: &str) -> Result<Vec<&'a Mp4Box>> {
    let mut current: Vec<&'a Mp4Box> = Vec::new();
    for (depth, part) in path.split('.').filter(|p| !p.is_empty()).enumerate() {
        let (name, index) = match part.split_once('[') {
            Some((n, rest)) => {
                let idx = rest
                    .strip_suffix(']')
                    .and_then(|i| i.parse::<usize>().ok())
                    .ok_or_else(|| Error::precondition(format!("bad path component '{part}'")))?;
                (n, Some(idx))
            }
            None => (part, None),
        };
        let typ = crate::boxes::FourCC::from_str(name)
            .ok_or_else(|| Error::precondition(format!("'{name}' is not a fourcc")))?;
        let mut next = Vec::new();
        let mut pick = |candidates: Vec<&'a Mp4Box>| match index {
            Some(i) => next.extend(candidates.get(i).copied()),
            None => next.extend(candidates),
        };
        if depth == 0 {
            pick(boxes.iter().filter(|b| b.typ == typ).collect());
        } else {
            for parent in current.iter().copied() {
                pick(parent.children_of(typ).collect());
            }
        }
        current = next;
    }
    Ok(current)
}

/// Result of a hex dump of part of an input.
#[derive(Debug, Serialize)]
pub struct HexDump {
    pub offset: u64,
    /// Bytes actually dumped; short when the range runs past the end.
    pub length: u64,
    pub hex: String,
}

/// Classic 16-bytes-per-line dump with offsets and an ASCII column.
pub fn hex_dump(bytes: &[u8], start_offset: u64) -> String {
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let offs = start_offset + (i as u64) * 16;
        let hex = hex::encode(chunk);
        let spaced: Vec<&str> = (0..chunk.len()).map(|j| &hex[j * 2..j * 2 + 2]).collect();
        let ascii: String = chunk
            .iter()
            .map(|&c| if (32..=126).contains(&c) { c as char } else { '.' })
            .collect();
        let _ = writeln!(out, "{offs:08x}  {:<48} |{ascii}|", spaced.join(" "));
    }
    out
}

/// Hex-dumps up to `max_len` bytes at `offset`, never reading past `size`.
pub fn hex_range<R: Read + Seek>(r: &mut R, size: u64, offset: u64, max_len: u64) -> Result<HexDump> {
    let to_read = size.saturating_sub(offset).min(max_len);
    if to_read == 0 {
        return Ok(HexDump {
            offset,
            length: 0,
            hex: String::new(),
        });
    }
    r.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; to_read as usize];
    r.read_exact(&mut data)?;
    Ok(HexDump {
        offset,
        length: to_read,
        hex: hex_dump(&data, offset),
    })
}
