use crate::boxes::{
    AudioSampleEntry, BoxBody, BoxCodec, BtrtBox, Co64Box, ColrBox, CttsBox, DrefBox, ElstBox,
    FourCC, FtypBox, FullBoxHeader, HdlrBox, IodsBox, JpviBox, JxplBox, MdatBox, MdhdBox, MehdBox,
    MfhdBox, MhapBox, MvhdBox, PaspBox, SbgpBox, SgpdBox, SidxBox, SmhdBox, StcoBox, StscBox,
    StsdBox, StssBox, StszBox, Stz2Box, SttsBox, TfdtBox, TfhdBox, TkhdBox, TrexBox, TrunBox,
    UrlBox, VisualSampleEntry, VmhdBox,
};
use crate::boxes::sample_entry::{AUDIO_ENTRIES, VISUAL_ENTRIES};
use crate::cursor::ByteReader;
use crate::error::{Diagnostics, Error, Result};
use std::collections::HashMap;
use std::sync::OnceLock;

/// How a box's content is laid out after its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Payload only.
    Leaf,
    /// Child boxes only.
    Container,
    /// Fixed fields, then child boxes (stsd, dref, sample entries, meta).
    PayloadThenChildren,
}

/// Decodes a payload into its typed variant.
pub type ParseFn = fn(&mut ByteReader<'_>, FourCC, &mut Diagnostics) -> Result<BoxBody>;

/// What the tree does with a fourcc that has no registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownBoxPolicy {
    /// Keep the payload as opaque bytes; it is written back verbatim.
    #[default]
    Keep,
    /// Drop the box from the tree.
    Skip,
}

#[derive(Clone)]
pub struct BoxDef {
    pub name: &'static str,
    pub kind: ContainerKind,
    pub parse: ParseFn,
}

impl std::fmt::Debug for BoxDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Box type table keyed by fourcc.
///
/// Read-only once built. Registering the same fourcc twice is an error, so a
/// table that builds at all has exactly one definition per type.
#[derive(Debug, Default)]
pub struct Registry {
    map: HashMap<FourCC, BoxDef>,
}

fn parse_as<T>(r: &mut ByteReader<'_>, typ: FourCC, diag: &mut Diagnostics) -> Result<BoxBody>
where
    T: BoxCodec + Into<BoxBody>,
{
    T::parse(r, typ, diag).map(Into::into)
}

fn parse_full_only(r: &mut ByteReader<'_>, typ: FourCC, diag: &mut Diagnostics) -> Result<BoxBody> {
    <FullBoxHeader as BoxCodec>::parse(r, typ, diag).map(BoxBody::FullOnly)
}

fn parse_container(_r: &mut ByteReader<'_>, _typ: FourCC, _d: &mut Diagnostics) -> Result<BoxBody> {
    Ok(BoxBody::Container)
}

fn parse_raw(r: &mut ByteReader<'_>, _typ: FourCC, _d: &mut Diagnostics) -> Result<BoxBody> {
    Ok(BoxBody::Raw(r.read_to_end().to_vec()))
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Adds one box type. Fails if the fourcc is already taken.
    pub fn register(
        &mut self,
        typ: FourCC,
        name: &'static str,
        kind: ContainerKind,
        parse: ParseFn,
    ) -> Result<()> {
        if self.map.contains_key(&typ) {
            return Err(Error::DuplicateRegistration(typ));
        }
        self.map.insert(typ, BoxDef { name, kind, parse });
        Ok(())
    }

    pub fn lookup(&self, typ: FourCC) -> Option<&BoxDef> {
        self.map.get(&typ)
    }

    pub fn kind(&self, typ: FourCC) -> Option<ContainerKind> {
        self.lookup(typ).map(|d| d.kind)
    }

    pub fn is_container(&self, typ: FourCC) -> bool {
        matches!(
            self.kind(typ),
            Some(ContainerKind::Container | ContainerKind::PayloadThenChildren)
        )
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Builds the registry with every box type this crate understands, in one
/// ordered pass.
pub fn register_all_box_types() -> Result<Registry> {
    use ContainerKind::*;

    let mut reg = Registry::new();
    let mut add = |typ: &[u8; 4], name: &'static str, kind: ContainerKind, parse: ParseFn| {
        reg.register(FourCC(*typ), name, kind, parse)
    };

    for (typ, name) in [
        (b"moov", "Movie"),
        (b"trak", "Track"),
        (b"mdia", "Media"),
        (b"minf", "Media Information"),
        (b"stbl", "Sample Table"),
        (b"dinf", "Data Information"),
        (b"edts", "Edit"),
        (b"mvex", "Movie Extends"),
        (b"moof", "Movie Fragment"),
        (b"traf", "Track Fragment"),
        (b"udta", "User Data"),
        (b"mfra", "Movie Fragment Random Access"),
        (b"tref", "Track Reference"),
        (b"sinf", "Protection Scheme Information"),
        (b"schi", "Scheme Information"),
    ] {
        add(typ, name, Container, parse_container)?;
    }

    add(b"ftyp", "File Type", Leaf, parse_as::<FtypBox>)?;
    add(b"styp", "Segment Type", Leaf, parse_as::<FtypBox>)?;
    add(b"mdat", "Media Data", Leaf, parse_as::<MdatBox>)?;
    add(b"free", "Free Space", Leaf, parse_raw)?;
    add(b"skip", "Free Space", Leaf, parse_raw)?;

    add(b"mvhd", "Movie Header", Leaf, parse_as::<MvhdBox>)?;
    add(b"iods", "Object Descriptor", Leaf, parse_as::<IodsBox>)?;
    add(b"tkhd", "Track Header", Leaf, parse_as::<TkhdBox>)?;
    add(b"elst", "Edit List", Leaf, parse_as::<ElstBox>)?;
    add(b"mdhd", "Media Header", Leaf, parse_as::<MdhdBox>)?;
    add(b"hdlr", "Handler Reference", Leaf, parse_as::<HdlrBox>)?;
    add(b"vmhd", "Video Media Header", Leaf, parse_as::<VmhdBox>)?;
    add(b"smhd", "Sound Media Header", Leaf, parse_as::<SmhdBox>)?;
    add(b"nmhd", "Null Media Header", Leaf, parse_full_only)?;
    add(b"sthd", "Subtitle Media Header", Leaf, parse_full_only)?;
    add(b"meta", "Meta", PayloadThenChildren, parse_full_only)?;
    add(b"dref", "Data Reference", PayloadThenChildren, parse_as::<DrefBox>)?;
    add(b"url ", "Data Entry URL", Leaf, parse_as::<UrlBox>)?;

    add(b"stsd", "Sample Description", PayloadThenChildren, parse_as::<StsdBox>)?;
    add(b"stts", "Decoding Time to Sample", Leaf, parse_as::<SttsBox>)?;
    add(b"ctts", "Composition Time to Sample", Leaf, parse_as::<CttsBox>)?;
    add(b"stsc", "Sample to Chunk", Leaf, parse_as::<StscBox>)?;
    add(b"stsz", "Sample Size", Leaf, parse_as::<StszBox>)?;
    add(b"stz2", "Compact Sample Size", Leaf, parse_as::<Stz2Box>)?;
    add(b"stco", "Chunk Offset", Leaf, parse_as::<StcoBox>)?;
    add(b"co64", "Chunk Offset 64", Leaf, parse_as::<Co64Box>)?;
    add(b"stss", "Sync Sample", Leaf, parse_as::<StssBox>)?;
    add(b"sgpd", "Sample Group Description", Leaf, parse_as::<SgpdBox>)?;
    add(b"sbgp", "Sample to Group", Leaf, parse_as::<SbgpBox>)?;

    add(b"mehd", "Movie Extends Header", Leaf, parse_as::<MehdBox>)?;
    add(b"trex", "Track Extends", Leaf, parse_as::<TrexBox>)?;
    add(b"mfhd", "Movie Fragment Header", Leaf, parse_as::<MfhdBox>)?;
    add(b"tfhd", "Track Fragment Header", Leaf, parse_as::<TfhdBox>)?;
    add(b"tfdt", "Track Fragment Decode Time", Leaf, parse_as::<TfdtBox>)?;
    add(b"trun", "Track Fragment Run", Leaf, parse_as::<TrunBox>)?;
    add(b"sidx", "Segment Index", Leaf, parse_as::<SidxBox>)?;

    for typ in VISUAL_ENTRIES {
        reg.register(typ, "Visual Sample Entry", PayloadThenChildren, parse_as::<VisualSampleEntry>)?;
    }
    for typ in AUDIO_ENTRIES {
        reg.register(typ, "Audio Sample Entry", PayloadThenChildren, parse_as::<AudioSampleEntry>)?;
    }

    let mut add = |typ: &[u8; 4], name: &'static str, kind: ContainerKind, parse: ParseFn| {
        reg.register(FourCC(*typ), name, kind, parse)
    };
    add(b"colr", "Colour Information", Leaf, parse_as::<ColrBox>)?;
    add(b"pasp", "Pixel Aspect Ratio", Leaf, parse_as::<PaspBox>)?;
    add(b"btrt", "Bit Rate", Leaf, parse_as::<BtrtBox>)?;
    add(b"jpvi", "JPEG XS Video Information", Leaf, parse_as::<JpviBox>)?;
    add(b"jxpl", "JPEG XS Profile and Level", Leaf, parse_as::<JxplBox>)?;
    add(b"mhaP", "MPEG-H Profile and Level Compatibility", Leaf, parse_as::<MhapBox>)?;
    for (typ, name) in [
        (b"avcC", "AVC Configuration"),
        (b"hvcC", "HEVC Configuration"),
        (b"vvcC", "VVC Configuration"),
        (b"mhaC", "MPEG-H Configuration"),
        (b"esds", "Elementary Stream Descriptor"),
        (b"jxsH", "JPEG XS Header"),
    ] {
        add(typ, name, Leaf, parse_raw)?;
    }

    Ok(reg)
}

static DEFAULT_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Process-wide registry, built on first use.
pub fn default_registry() -> &'static Registry {
    DEFAULT_REGISTRY.get_or_init(|| {
        register_all_box_types().expect("built-in box table lists a fourcc twice")
    })
}
