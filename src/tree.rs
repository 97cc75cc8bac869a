//! Generic box tree: parsing a byte range into nodes, navigating and mutating
//! them, and writing them back out.

use crate::boxes::{
    BodyRef, BoxBody, BoxHeader, FourCC, MdatBox, parse_box_header, read_box_header,
    required_header_size, write_box_header,
};
use crate::cursor::ByteReader;
use crate::error::{Diagnostics, Error, Result};
use crate::registry::{ContainerKind, Registry, UnknownBoxPolicy};
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};

pub const MDAT: FourCC = FourCC(*b"mdat");
pub const MOOV: FourCC = FourCC(*b"moov");
pub const MOOF: FourCC = FourCC(*b"moof");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub unknown: UnknownBoxPolicy,
    /// Copy `mdat` payloads into the tree. When false only their range is kept.
    pub load_mdat: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            unknown: UnknownBoxPolicy::Keep,
            load_mdat: false,
        }
    }
}

/// One node of the box tree. Children are owned and kept in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct Mp4Box {
    pub typ: FourCC,
    pub uuid: Option<[u8; 16]>,
    pub body: BoxBody,
    pub children: Vec<Mp4Box>,
    /// Stream offset of the header, for parsed boxes.
    pub offset: Option<u64>,
    /// Emit the 64-bit size form even when the size fits 32 bits.
    pub force_large: bool,
    size: u64,
}

impl Mp4Box {
    pub fn new(typ: FourCC, body: impl Into<BoxBody>) -> Self {
        Self {
            typ,
            uuid: None,
            body: body.into(),
            children: Vec::new(),
            offset: None,
            force_large: false,
            size: 0,
        }
    }

    pub fn container(typ: FourCC) -> Self {
        Self::new(typ, BoxBody::Container)
    }

    pub fn with_children(mut self, children: Vec<Mp4Box>) -> Self {
        self.children = children;
        self
    }

    pub fn with_child(mut self, child: Mp4Box) -> Self {
        self.children.push(child);
        self
    }

    /// Total encoded size as of the last [`Mp4Box::update_size`] (or as read).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Typed payload of this node.
    pub fn get<T: BodyRef>(&self) -> Option<&T> {
        T::from_body(&self.body)
    }

    pub fn get_mut<T: BodyRef>(&mut self) -> Option<&mut T> {
        T::from_body_mut(&mut self.body)
    }

    /// First direct child of type `typ`.
    pub fn child(&self, typ: FourCC) -> Option<&Mp4Box> {
        self.children.iter().find(|c| c.typ == typ)
    }

    pub fn child_mut(&mut self, typ: FourCC) -> Option<&mut Mp4Box> {
        self.children.iter_mut().find(|c| c.typ == typ)
    }

    /// Typed payload of the first direct child of type `typ`.
    pub fn child_body<T: BodyRef>(&self, typ: FourCC) -> Option<&T> {
        self.child(typ).and_then(|c| c.get::<T>())
    }

    pub fn children_of(&self, typ: FourCC) -> impl Iterator<Item = &Mp4Box> + '_ {
        self.children.iter().filter(move |c| c.typ == typ)
    }

    /// Depth-first search below this node (the node itself is not tested).
    pub fn find(&self, typ: FourCC) -> Option<&Mp4Box> {
        for c in &self.children {
            if c.typ == typ {
                return Some(c);
            }
            if let Some(hit) = c.find(typ) {
                return Some(hit);
            }
        }
        None
    }

    /// Every node of type `typ` below this one, in depth-first order.
    pub fn find_all(&self, typ: FourCC) -> Vec<&Mp4Box> {
        let mut out = Vec::new();
        self.walk(&mut |b, _| {
            if b.typ == typ {
                out.push(b);
            }
        });
        out.retain(|b| !std::ptr::eq(*b, self));
        out
    }

    /// Follows direct children along `path`.
    pub fn find_path(&self, path: &[FourCC]) -> Option<&Mp4Box> {
        let mut cur = self;
        for typ in path {
            cur = cur.child(*typ)?;
        }
        Some(cur)
    }

    pub fn find_path_mut(&mut self, path: &[FourCC]) -> Option<&mut Mp4Box> {
        let mut cur = self;
        for typ in path {
            cur = cur.child_mut(*typ)?;
        }
        Some(cur)
    }

    /// Visits this node and its descendants depth first, with their depth.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Mp4Box, usize)) {
        self.walk_at(0, f);
    }

    fn walk_at<'a>(&'a self, depth: usize, f: &mut dyn FnMut(&'a Mp4Box, usize)) {
        f(self, depth);
        for c in &self.children {
            c.walk_at(depth + 1, f);
        }
    }

    pub fn push_child(&mut self, child: Mp4Box) {
        self.children.push(child);
    }

    /// Inserts at `index`, clamped to the child count.
    pub fn insert_child(&mut self, index: usize, child: Mp4Box) {
        let index = index.min(self.children.len());
        self.children.insert(index, child);
    }

    /// Removes every direct child of type `typ`, returning how many went.
    pub fn remove_children(&mut self, typ: FourCC) -> usize {
        let before = self.children.len();
        self.children.retain(|c| c.typ != typ);
        before - self.children.len()
    }

    fn payload_len(&self) -> Result<u64> {
        if let BoxBody::Mdat(MdatBox { data: None, payload_len, .. }) = &self.body {
            return Ok(*payload_len);
        }
        let mut scratch = Vec::new();
        self.body.write_payload(&mut scratch)?;
        Ok(scratch.len() as u64)
    }

    /// Recomputes sizes bottom-up. Must run after any mutation and before
    /// [`Mp4Box::write`]. Derived fields (versions, entry counts) are settled
    /// here as well.
    pub fn update_size(&mut self) -> Result<u64> {
        let mut children_len = 0u64;
        for c in &mut self.children {
            children_len += c.update_size()?;
        }
        self.body.prepare(self.children.len());
        let content = self.payload_len()? + children_len;
        let header = required_header_size(content, self.uuid.is_some(), self.force_large);
        self.size = header + content;
        Ok(self.size)
    }

    /// Appends this box and its subtree to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        let large = self.force_large || self.size > u32::MAX as u64;
        write_box_header(buf, self.typ, self.uuid.as_ref(), self.size, large);
        self.body.write_payload(buf)?;
        for c in &self.children {
            c.write(buf)?;
        }
        let written = (buf.len() - start) as u64;
        if written != self.size {
            return Err(Error::precondition(format!(
                "box '{}' wrote {written} bytes but declares {}; update_size was not called after a change",
                self.typ, self.size
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let size = self.update_size()?;
        let mut buf = Vec::with_capacity(size as usize);
        self.write(&mut buf)?;
        Ok(buf)
    }
}

/// Parses every box in `data`. `base` is the stream offset of `data[0]`.
pub fn parse_boxes(
    data: &[u8],
    base: u64,
    registry: &Registry,
    opts: ParseOptions,
    diag: &mut Diagnostics,
) -> Result<Vec<Mp4Box>> {
    let mut r = ByteReader::with_base(data, base);
    parse_sequence(&mut r, registry, opts, diag)
}

fn parse_sequence(
    r: &mut ByteReader<'_>,
    registry: &Registry,
    opts: ParseOptions,
    diag: &mut Diagnostics,
) -> Result<Vec<Mp4Box>> {
    let mut out = Vec::new();
    while !r.is_empty() {
        if r.remaining() < 8 {
            diag.warn(format!(
                "ignoring {} trailing bytes at offset {}",
                r.remaining(),
                r.offset()
            ));
            r.read_to_end();
            break;
        }
        let h = parse_box_header(r)?;
        let header_bytes = h.header_size as usize;
        let content_len = if h.size == 0 {
            r.remaining()
        } else {
            let declared = (h.size - h.header_size) as usize;
            if declared > r.remaining() {
                return Err(Error::malformed(format!(
                    "box '{}' at {} declares {} bytes but only {} remain in its parent",
                    h.typ,
                    h.start,
                    h.size,
                    r.remaining() + header_bytes
                )));
            }
            declared
        };
        let content = r.sub_reader(content_len, "box content")?;
        if let Some(b) = parse_node(&h, content, registry, opts, diag)? {
            out.push(b);
        }
    }
    Ok(out)
}

fn parse_node(
    h: &BoxHeader,
    mut content: ByteReader<'_>,
    registry: &Registry,
    opts: ParseOptions,
    diag: &mut Diagnostics,
) -> Result<Option<Mp4Box>> {
    let size = h.header_size + content.remaining() as u64;
    let mut node = Mp4Box {
        typ: h.typ,
        uuid: h.uuid,
        body: BoxBody::Container,
        children: Vec::new(),
        offset: Some(h.start),
        force_large: h.is_large(),
        size,
    };

    let Some(def) = registry.lookup(h.typ) else {
        return match opts.unknown {
            UnknownBoxPolicy::Keep => {
                tracing::debug!("keeping unknown box '{}' at {} as raw bytes", h.typ, h.start);
                node.body = BoxBody::Raw(content.read_to_end().to_vec());
                Ok(Some(node))
            }
            UnknownBoxPolicy::Skip => {
                tracing::debug!("skipping unknown box '{}' at {}", h.typ, h.start);
                Ok(None)
            }
        };
    };

    if h.typ == MDAT && !opts.load_mdat {
        let payload_offset = content.offset();
        let payload_len = content.remaining() as u64;
        node.body = BoxBody::Mdat(MdatBox {
            payload_offset,
            payload_len,
            data: None,
        });
        return Ok(Some(node));
    }

    match def.kind {
        ContainerKind::Container => {
            node.children = parse_sequence(&mut content, registry, opts, diag)?;
        }
        ContainerKind::Leaf => {
            node.body = (def.parse)(&mut content, h.typ, diag)?;
            if !content.is_empty() {
                return Err(Error::malformed(format!(
                    "box '{}' at {} has {} bytes left over after its payload",
                    h.typ,
                    h.start,
                    content.remaining()
                )));
            }
        }
        ContainerKind::PayloadThenChildren => {
            node.body = (def.parse)(&mut content, h.typ, diag)?;
            node.children = parse_sequence(&mut content, registry, opts, diag)?;
        }
    }
    Ok(Some(node))
}

/// Reads every top-level box of a seekable stream. `mdat` payloads are not
/// loaded; their node records offset and length only.
pub fn read_top_level<R: Read + Seek>(
    r: &mut R,
    registry: &Registry,
    opts: ParseOptions,
    diag: &mut Diagnostics,
) -> Result<Vec<Mp4Box>> {
    let len = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(0))?;
    let mut out = Vec::new();
    let mut pos = 0u64;
    while pos < len {
        if len - pos < 8 {
            diag.warn(format!("ignoring {} trailing bytes at offset {pos}", len - pos));
            break;
        }
        let h = read_box_header(r)?;
        let end = h.end(len);
        if end > len {
            return Err(Error::malformed(format!(
                "box '{}' at {} ends at {end}, past the end of input ({len})",
                h.typ, h.start
            )));
        }
        let content_start = h.start + h.header_size;
        if h.typ == MDAT && !opts.load_mdat {
            let mut node = Mp4Box::new(
                MDAT,
                MdatBox {
                    payload_offset: content_start,
                    payload_len: end - content_start,
                    data: None,
                },
            );
            node.offset = Some(h.start);
            node.force_large = h.is_large();
            node.size = end - h.start;
            out.push(node);
            r.seek(SeekFrom::Start(end))?;
        } else {
            let mut content = vec![0u8; (end - content_start) as usize];
            r.read_exact(&mut content)?;
            let reader = ByteReader::with_base(&content, content_start);
            if let Some(b) = parse_node(&h, reader, registry, opts, diag)? {
                out.push(b);
            }
        }
        pos = end;
    }
    Ok(out)
}

/// Coarse classification of a file or buffer by its top-level boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mp4Type {
    /// moov without media.
    InitSegment,
    /// moov and mdat, no fragments.
    FlatMp4,
    /// moov followed by moof/mdat pairs.
    FragmentedMp4,
    /// moof/mdat without moov.
    MediaSegment,
    Unknown,
}

/// Classifies a sequence of top-level box types.
pub fn classify(types: impl IntoIterator<Item = FourCC>) -> Mp4Type {
    let (mut moov, mut moof, mut mdat) = (false, false, false);
    for t in types {
        match t {
            MOOV => moov = true,
            MOOF => moof = true,
            MDAT => mdat = true,
            _ => {}
        }
    }
    match (moov, moof, mdat) {
        (true, false, false) => Mp4Type::InitSegment,
        (true, false, true) => Mp4Type::FlatMp4,
        (true, true, true) => Mp4Type::FragmentedMp4,
        (false, true, true) => Mp4Type::MediaSegment,
        _ => Mp4Type::Unknown,
    }
}

/// Scans top-level headers only. A size of 0 ends the scan, as does a header
/// that does not fit the buffer.
pub fn get_mp4_type_from_buffer(data: &[u8]) -> Mp4Type {
    let mut types = Vec::new();
    let mut r = ByteReader::new(data);
    while r.remaining() >= 8 {
        let Ok(h) = parse_box_header(&mut r) else {
            break;
        };
        types.push(h.typ);
        if h.size == 0 {
            break;
        }
        let body = h.size - h.header_size;
        if body > r.remaining() as u64 {
            break;
        }
        if r.skip(body as usize, "box content").is_err() {
            break;
        }
    }
    classify(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{FtypBox, MdhdBox, SttsBox};
    use crate::registry::default_registry;

    fn ftyp() -> Mp4Box {
        Mp4Box::new(
            FourCC(*b"ftyp"),
            FtypBox::new(FourCC(*b"isom"), 0, vec![FourCC(*b"mp42")]),
        )
    }

    #[test]
    fn size_matches_written_bytes() {
        let mut moov = Mp4Box::container(MOOV).with_child(
            Mp4Box::container(FourCC(*b"trak")).with_child(
                Mp4Box::container(FourCC(*b"mdia"))
                    .with_child(Mp4Box::new(FourCC(*b"mdhd"), MdhdBox::default())),
            ),
        );
        let bytes = moov.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, moov.size());
        assert_eq!(moov.size(), 8 + 8 + 8 + 8 + 24);
    }

    #[test]
    fn stale_size_is_detected() {
        let mut b = Mp4Box::container(MOOV);
        b.update_size().unwrap();
        b.push_child(ftyp());
        let mut buf = Vec::new();
        assert!(matches!(b.write(&mut buf), Err(Error::Precondition(_))));
    }

    #[test]
    fn parse_write_is_identity() {
        let mut tree = vec![ftyp(), Mp4Box::container(MOOV)];
        let mut bytes = Vec::new();
        for b in &mut tree {
            bytes.extend(b.to_bytes().unwrap());
        }
        let mut diag = Diagnostics::new();
        let parsed =
            parse_boxes(&bytes, 0, default_registry(), ParseOptions::default(), &mut diag).unwrap();
        let mut again = Vec::new();
        for b in &parsed {
            b.write(&mut again).unwrap();
        }
        assert_eq!(again, bytes);
        assert_eq!(parsed[1].offset, Some(bytes.len() as u64 - 8));
    }

    #[test]
    fn unknown_boxes_follow_policy() {
        let bytes = [0, 0, 0, 10, b'z', b'z', b'z', b'z', 0xAB, 0xCD];
        let mut diag = Diagnostics::new();
        let kept =
            parse_boxes(&bytes, 0, default_registry(), ParseOptions::default(), &mut diag).unwrap();
        assert_eq!(kept[0].body, BoxBody::Raw(vec![0xAB, 0xCD]));
        let opts = ParseOptions {
            unknown: UnknownBoxPolicy::Skip,
            ..Default::default()
        };
        let skipped = parse_boxes(&bytes, 0, default_registry(), opts, &mut diag).unwrap();
        assert!(skipped.is_empty());
    }

    #[test]
    fn leftover_payload_is_malformed() {
        let mut stts = Mp4Box::new(FourCC(*b"stts"), SttsBox::default());
        let mut bytes = stts.to_bytes().unwrap();
        bytes[3] += 2;
        bytes.extend([0, 0]);
        let err = parse_boxes(&bytes, 0, default_registry(), ParseOptions::default(), &mut Diagnostics::new())
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn child_overrunning_parent_is_malformed() {
        let mut moov = Mp4Box::container(MOOV).with_child(ftyp());
        let mut bytes = moov.to_bytes().unwrap();
        bytes[11] += 4; // child size now exceeds the parent
        let err = parse_boxes(&bytes, 0, default_registry(), ParseOptions::default(), &mut Diagnostics::new())
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn large_size_is_preserved() {
        let mut b = ftyp();
        b.force_large = true;
        let bytes = b.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        let parsed = parse_boxes(&bytes, 0, default_registry(), ParseOptions::default(), &mut Diagnostics::new())
            .unwrap();
        assert!(parsed[0].force_large);
        let mut again = Vec::new();
        parsed[0].write(&mut again).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn navigation_and_mutation() {
        let mut moov = Mp4Box::container(MOOV)
            .with_child(Mp4Box::container(FourCC(*b"trak")))
            .with_child(Mp4Box::container(FourCC(*b"trak")).with_child(
                Mp4Box::container(FourCC(*b"mdia"))
                    .with_child(Mp4Box::new(FourCC(*b"mdhd"), MdhdBox::default())),
            ));
        assert_eq!(moov.children_of(FourCC(*b"trak")).count(), 2);
        assert_eq!(moov.find_all(FourCC(*b"mdhd")).len(), 1);
        assert!(moov.find(FourCC(*b"mdhd")).unwrap().get::<MdhdBox>().is_some());
        assert!(moov.find_path(&[FourCC(*b"trak"), FourCC(*b"mdia")]).is_none());
        moov.insert_child(0, Mp4Box::container(FourCC(*b"mvex")));
        assert_eq!(moov.children[0].typ, FourCC(*b"mvex"));
        assert_eq!(moov.remove_children(FourCC(*b"trak")), 2);
        let mut depths = Vec::new();
        moov.walk(&mut |b, d| depths.push((b.typ, d)));
        assert_eq!(depths, vec![(MOOV, 0), (FourCC(*b"mvex"), 1)]);
    }

    #[test]
    fn classification() {
        let hdr = |t: &[u8; 4], size: u32| {
            let mut v = size.to_be_bytes().to_vec();
            v.extend_from_slice(t);
            v.resize(size.max(8) as usize, 0);
            v
        };
        let cat = |parts: &[Vec<u8>]| parts.concat();
        assert_eq!(get_mp4_type_from_buffer(&cat(&[hdr(b"ftyp", 8), hdr(b"moov", 8)])), Mp4Type::InitSegment);
        assert_eq!(get_mp4_type_from_buffer(&cat(&[hdr(b"moov", 8), hdr(b"mdat", 16)])), Mp4Type::FlatMp4);
        assert_eq!(
            get_mp4_type_from_buffer(&cat(&[hdr(b"moov", 8), hdr(b"moof", 8), hdr(b"mdat", 8)])),
            Mp4Type::FragmentedMp4
        );
        assert_eq!(get_mp4_type_from_buffer(&cat(&[hdr(b"styp", 8), hdr(b"moof", 8), hdr(b"mdat", 8)])), Mp4Type::MediaSegment);
        // size 0 ends the scan before moof is seen
        let mut zero = hdr(b"moov", 8);
        zero.extend(hdr(b"mdat", 8));
        zero[8..12].copy_from_slice(&[0, 0, 0, 0]);
        zero.extend(hdr(b"moof", 8));
        assert_eq!(get_mp4_type_from_buffer(&zero), Mp4Type::FlatMp4);
        assert_eq!(get_mp4_type_from_buffer(b"junk"), Mp4Type::Unknown);
    }
}
