mod common;

use common::*;
use isobmff::boxes::{StcoBox, StscBox, StscEntry, StszBox};
use isobmff::cursor::ByteReader;
use isobmff::registry::{ContainerKind, UnknownBoxPolicy};
use isobmff::tree::{ParseOptions, parse_boxes};
use isobmff::{
    BoxBody, Diagnostics, Error, FourCC, Mp4Box, Mp4Reader, Mp4Type, Registry, default_registry,
    get_mp4_type_from_buffer,
};

fn raw(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> isobmff::Result<BoxBody> {
    Ok(BoxBody::Raw(r.read_to_end().to_vec()))
}

fn container(_r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> isobmff::Result<BoxBody> {
    Ok(BoxBody::Container)
}

fn boxed(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    v.extend_from_slice(typ);
    v.extend_from_slice(payload);
    v
}

#[test]
fn custom_registry_drives_the_tree() {
    let mut reg = Registry::new();
    reg.register(FourCC(*b"wrap"), "Wrapper", ContainerKind::Container, container).unwrap();
    reg.register(FourCC(*b"blob"), "Blob", ContainerKind::Leaf, raw).unwrap();
    let err = reg
        .register(FourCC(*b"blob"), "Blob again", ContainerKind::Leaf, raw)
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRegistration(t) if t == FourCC(*b"blob")));

    let inner = [boxed(b"blob", &[1, 2, 3]), boxed(b"zzzz", &[9])].concat();
    let data = boxed(b"wrap", &inner);

    let keep = parse_boxes(&data, 0, &reg, ParseOptions::default(), &mut Diagnostics::new()).unwrap();
    assert_eq!(keep[0].children.len(), 2);
    assert_eq!(keep[0].child_body::<Vec<u8>>(FourCC(*b"blob")), Some(&vec![1, 2, 3]));
    assert_eq!(keep[0].children[1].offset, Some(19));

    let opts = ParseOptions {
        unknown: UnknownBoxPolicy::Skip,
        ..ParseOptions::default()
    };
    let skip = parse_boxes(&data, 0, &reg, opts, &mut Diagnostics::new()).unwrap();
    assert_eq!(skip[0].children.len(), 1);
}

#[test]
fn trailing_bytes_are_a_warning() {
    let mut data = flat_audio_file(4);
    data.extend_from_slice(&[0, 0, 0]);
    let reader = Mp4Reader::from_bytes(data).unwrap();
    assert_eq!(reader.diagnostics().len(), 1);
    assert!(reader.diagnostics().contains("trailing"));
    assert_eq!(reader.table(1).unwrap().samples.len(), 4);
}

#[test]
fn truncated_file_is_malformed() {
    let mut data = flat_audio_file(4);
    data.truncate(data.len() - 10);
    assert!(Mp4Reader::from_bytes(data).unwrap_err().is_malformed());
}

/// Re-serializes a writer file after editing one stbl child in place.
fn edit_stbl<T: isobmff::boxes::BodyRef>(bytes: &[u8], typ: &[u8; 4], edit: impl Fn(&mut T)) -> Vec<u8> {
    let opts = ParseOptions {
        load_mdat: true,
        ..ParseOptions::default()
    };
    let mut tree = parse_boxes(bytes, 0, default_registry(), opts, &mut Diagnostics::new()).unwrap();
    let path = [b"trak", b"mdia", b"minf", b"stbl", typ].map(|t| FourCC(*t));
    let mut out = Vec::new();
    for top in &mut tree {
        if let Some(body) = top.find_path_mut(&path).and_then(|b| b.get_mut::<T>()) {
            edit(body);
        }
        out.extend(top.to_bytes().unwrap());
    }
    out
}

#[test]
fn uniform_sample_size_with_absurd_count_is_malformed() {
    let data = edit_stbl(&flat_audio_file(4), b"stsz", |stsz: &mut StszBox| {
        stsz.sample_size = 1;
        stsz.sample_count = u32::MAX;
        stsz.entry_sizes.clear();
    });
    assert!(Mp4Reader::from_bytes(data).unwrap_err().is_malformed());
}

#[test]
fn stsc_first_chunk_at_the_top_of_the_range_is_malformed() {
    let data = edit_stbl(&flat_audio_file(4), b"stsc", |stsc: &mut StscBox| {
        stsc.entries = vec![
            StscEntry {
                first_chunk: u32::MAX,
                samples_per_chunk: 1,
                sample_description_index: 1,
            },
            StscEntry {
                first_chunk: 5,
                samples_per_chunk: 1,
                sample_description_index: 1,
            },
        ];
    });
    assert!(Mp4Reader::from_bytes(data).unwrap_err().is_malformed());
}

#[test]
fn large_mdat_header_is_followed() {
    let bytes = flat_audio_file(6);
    let opts = ParseOptions {
        load_mdat: true,
        ..ParseOptions::default()
    };
    let mut tree = parse_boxes(&bytes, 0, default_registry(), opts, &mut Diagnostics::new()).unwrap();
    // mdat grows by 8 header bytes, so every chunk moves by 8
    for top in &mut tree {
        if top.typ == FourCC(*b"mdat") {
            top.force_large = true;
        }
        if let Some(stco) = top
            .find_path_mut(&[b"trak", b"mdia", b"minf", b"stbl", b"stco"].map(|t| FourCC(*t)))
            .and_then(|b| b.get_mut::<StcoBox>())
        {
            stco.chunk_offsets.iter_mut().for_each(|o| *o += 8);
        }
    }
    let mut out = Vec::new();
    for b in &mut tree {
        out.extend(b.to_bytes().unwrap());
    }
    assert_eq!(out.len(), bytes.len() + 8);

    let reader = Mp4Reader::from_bytes(out).unwrap();
    let mdat = reader.tree().iter().find(|b| b.typ == FourCC(*b"mdat")).unwrap();
    assert!(mdat.force_large);
    let expected: Vec<Vec<u8>> = audio_samples(6).into_iter().map(|s| s.data).collect();
    assert_eq!(track_payloads(&reader, 1), expected);
}

#[test]
fn classification_of_writer_output() {
    assert_eq!(get_mp4_type_from_buffer(&flat_av_file()), Mp4Type::FlatMp4);
    assert_eq!(get_mp4_type_from_buffer(&[]), Mp4Type::Unknown);
    assert_eq!(get_mp4_type_from_buffer(b"not an mp4 at all"), Mp4Type::Unknown);

    let moov_only: Vec<u8> = Mp4Reader::from_bytes(flat_av_file())
        .unwrap()
        .tree()
        .iter()
        .filter(|b| b.typ != FourCC(*b"mdat"))
        .flat_map(|b| {
            let mut b: Mp4Box = b.clone();
            b.to_bytes().unwrap()
        })
        .collect();
    assert_eq!(get_mp4_type_from_buffer(&moov_only), Mp4Type::InitSegment);
}
