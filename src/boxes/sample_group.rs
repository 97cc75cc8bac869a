//! Sample grouping: `sgpd` descriptions and `sbgp` run-length assignments.

use super::{BoxCodec, FourCC, FullBoxHeader};
use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Diagnostics, Error, Result};
use serde::{Deserialize, Serialize};

pub const ROLL: FourCC = FourCC(*b"roll");
pub const PROL: FourCC = FourCC(*b"prol");
pub const SAP: FourCC = FourCC(*b"sap ");

/// One decoded group description entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleGroupDescription {
    /// `roll` / `prol`: number of samples to decode before output is correct.
    Roll(i16),
    /// `sap `: stream access point type.
    Sap { dependent_flag: bool, sap_type: u8 },
    Raw(Vec<u8>),
}

impl SampleGroupDescription {
    fn decode(grouping_type: FourCC, bytes: &[u8]) -> Self {
        match (grouping_type, bytes) {
            (ROLL | PROL, [hi, lo]) => Self::Roll(i16::from_be_bytes([*hi, *lo])),
            (SAP, [b]) => Self::Sap {
                dependent_flag: b & 0x80 != 0,
                sap_type: b & 0x0F,
            },
            _ => Self::Raw(bytes.to_vec()),
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Self::Roll(d) => d.to_be_bytes().to_vec(),
            Self::Sap {
                dependent_flag,
                sap_type,
            } => vec![((*dependent_flag as u8) << 7) | (sap_type & 0x0F)],
            Self::Raw(b) => b.clone(),
        }
    }

    /// Fixed entry length for the grouping types this crate decodes.
    fn known_length(grouping_type: FourCC) -> Option<usize> {
        match grouping_type {
            ROLL | PROL => Some(2),
            SAP => Some(1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgpdBox {
    pub version: u8,
    pub grouping_type: FourCC,
    /// Version 1 only. Zero means every entry carries its own length.
    pub default_length: u32,
    /// Version 2 and above.
    pub default_sample_description_index: u32,
    pub entries: Vec<SampleGroupDescription>,
}

impl SgpdBox {
    pub fn new(grouping_type: FourCC, entries: Vec<SampleGroupDescription>) -> Self {
        let default_length = SampleGroupDescription::known_length(grouping_type).unwrap_or(0);
        Self {
            version: 1,
            grouping_type,
            default_length: default_length as u32,
            default_sample_description_index: 0,
            entries,
        }
    }

    /// 1-based index lookup; 0 means "not in any group".
    pub fn entry(&self, index: u32) -> Option<&SampleGroupDescription> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Index applied to samples without an explicit sbgp mapping.
    pub fn default_index(&self) -> u32 {
        if self.version >= 2 {
            self.default_sample_description_index
        } else {
            0
        }
    }
}

impl BoxCodec for SgpdBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("sgpd", 2)?;
        let grouping_type = r.read_fourcc("sgpd grouping_type")?;
        let default_length = if full.version == 1 {
            r.read_u32("sgpd default_length")?
        } else {
            0
        };
        let default_sample_description_index = if full.version >= 2 {
            r.read_u32("sgpd default_sample_description_index")?
        } else {
            0
        };
        let count = r.read_u32("sgpd entry_count")? as usize;
        let mut entries = Vec::with_capacity(count.min(r.remaining()));
        for i in 0..count {
            let len = if full.version == 1 {
                if default_length == 0 {
                    r.read_u32("sgpd description_length")? as usize
                } else {
                    default_length as usize
                }
            } else if let Some(len) = SampleGroupDescription::known_length(grouping_type) {
                len
            } else {
                // Entry size is implicit; share what is left evenly.
                let left = count - i;
                if r.remaining() == 0 || r.remaining() % left != 0 {
                    return Err(Error::malformed(format!(
                        "sgpd '{grouping_type}': {} bytes cannot hold {left} entries of equal size",
                        r.remaining()
                    )));
                }
                r.remaining() / left
            };
            let bytes = r.read_bytes(len, "sgpd entry")?;
            entries.push(SampleGroupDescription::decode(grouping_type, bytes));
        }
        Ok(Self {
            version: full.version,
            grouping_type,
            default_length,
            default_sample_description_index,
            entries,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, 0).write_header(buf);
        buf.put_fourcc(self.grouping_type);
        if self.version == 1 {
            buf.put_u32(self.default_length);
        }
        if self.version >= 2 {
            buf.put_u32(self.default_sample_description_index);
        }
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            let bytes = e.encode();
            if self.version == 1 {
                if self.default_length == 0 {
                    buf.put_u32(bytes.len() as u32);
                } else if bytes.len() != self.default_length as usize {
                    return Err(Error::precondition(format!(
                        "sgpd '{}' entry is {} bytes, default_length is {}",
                        self.grouping_type,
                        bytes.len(),
                        self.default_length
                    )));
                }
            }
            buf.put_bytes(&bytes);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbgpEntry {
    pub sample_count: u32,
    pub group_description_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbgpBox {
    pub grouping_type: FourCC,
    /// Present iff the box is version 1.
    pub grouping_type_parameter: Option<u32>,
    pub entries: Vec<SbgpEntry>,
}

impl SbgpBox {
    pub fn new(grouping_type: FourCC) -> Self {
        Self {
            grouping_type,
            grouping_type_parameter: None,
            entries: Vec::new(),
        }
    }

    /// Appends one sample, extending the last run when the index repeats.
    pub fn push_sample(&mut self, group_description_index: u32) {
        match self.entries.last_mut() {
            Some(last) if last.group_description_index == group_description_index => {
                last.sample_count += 1
            }
            _ => self.entries.push(SbgpEntry {
                sample_count: 1,
                group_description_index,
            }),
        }
    }

    /// Expands the runs into one index per sample, `None` past the mapped range.
    pub fn index_for(&self, sample: u64) -> Option<u32> {
        let mut first = 0u64;
        for e in &self.entries {
            let end = first + e.sample_count as u64;
            if sample < end {
                return Some(e.group_description_index);
            }
            first = end;
        }
        None
    }
}

impl BoxCodec for SbgpBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("sbgp", 1)?;
        let grouping_type = r.read_fourcc("sbgp grouping_type")?;
        let grouping_type_parameter = if full.version == 1 {
            Some(r.read_u32("sbgp grouping_type_parameter")?)
        } else {
            None
        };
        let count = r.read_u32("sbgp entry_count")?;
        let count = r.check_entries(count as u64, 8, "sbgp")?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(SbgpEntry {
                sample_count: r.read_u32("sbgp sample_count")?,
                group_description_index: r.read_u32("sbgp group_description_index")?,
            });
        }
        Ok(Self {
            grouping_type,
            grouping_type_parameter,
            entries,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        let version = self.grouping_type_parameter.is_some() as u8;
        FullBoxHeader::new(version, 0).write_header(buf);
        buf.put_fourcc(self.grouping_type);
        if let Some(p) = self.grouping_type_parameter {
            buf.put_u32(p);
        }
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            buf.put_u32(e.sample_count);
            buf.put_u32(e.group_description_index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse<T: BoxCodec>(b: &T) -> T {
        let mut buf = Vec::new();
        b.write(&mut buf).unwrap();
        T::parse(&mut ByteReader::new(&buf), FourCC(*b"test"), &mut Diagnostics::new()).unwrap()
    }

    #[test]
    fn roll_and_sap_entries_decode() {
        let roll = SgpdBox::new(ROLL, vec![SampleGroupDescription::Roll(-1)]);
        assert_eq!(roll.default_length, 2);
        assert_eq!(reparse(&roll), roll);

        let sap = SgpdBox::new(
            SAP,
            vec![SampleGroupDescription::Sap {
                dependent_flag: true,
                sap_type: 3,
            }],
        );
        let back = reparse(&sap);
        assert_eq!(back.entry(1), sap.entry(1));
        assert_eq!(back.entry(0), None);
    }

    #[test]
    fn variable_length_entries() {
        let mut sgpd = SgpdBox::new(
            FourCC(*b"xyz "),
            vec![
                SampleGroupDescription::Raw(vec![1, 2, 3]),
                SampleGroupDescription::Raw(vec![4]),
            ],
        );
        sgpd.default_length = 0;
        assert_eq!(reparse(&sgpd), sgpd);
    }

    #[test]
    fn version_2_default_index() {
        let mut sgpd = SgpdBox::new(ROLL, vec![SampleGroupDescription::Roll(2)]);
        assert_eq!(sgpd.default_index(), 0);
        sgpd.version = 2;
        sgpd.default_sample_description_index = 1;
        let back = reparse(&sgpd);
        assert_eq!(back.default_index(), 1);
        assert_eq!(back.entries, vec![SampleGroupDescription::Roll(2)]);
    }

    #[test]
    fn implicit_entries_need_payload() {
        // v0, unknown grouping type, a billion entries and nothing to hold them
        let mut buf = Vec::new();
        FullBoxHeader::default().write_header(&mut buf);
        buf.extend_from_slice(b"xyz ");
        buf.extend_from_slice(&1_000_000_000u32.to_be_bytes());
        let err = SgpdBox::parse(&mut ByteReader::new(&buf), FourCC(*b"sgpd"), &mut Diagnostics::new())
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn sbgp_runs() {
        let mut sbgp = SbgpBox::new(ROLL);
        for idx in [1, 1, 0, 2] {
            sbgp.push_sample(idx);
        }
        assert_eq!(sbgp.entries.len(), 3);
        assert_eq!(sbgp.index_for(1), Some(1));
        assert_eq!(sbgp.index_for(2), Some(0));
        assert_eq!(sbgp.index_for(3), Some(2));
        assert_eq!(sbgp.index_for(4), None);
        sbgp.grouping_type_parameter = Some(7);
        assert_eq!(reparse(&sbgp), sbgp);
    }
}
