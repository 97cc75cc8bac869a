use super::{BoxCodec, FourCC};
use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Diagnostics, Error, Result};

/// `ftyp` / `styp`: brand declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtypBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCC>,
}

impl FtypBox {
    pub fn new(major_brand: FourCC, minor_version: u32, compatible_brands: Vec<FourCC>) -> Self {
        Self {
            major_brand,
            minor_version,
            compatible_brands,
        }
    }

    pub fn has_brand(&self, brand: FourCC) -> bool {
        self.major_brand == brand || self.compatible_brands.contains(&brand)
    }
}

impl BoxCodec for FtypBox {
    fn parse(r: &mut ByteReader<'_>, typ: FourCC, diag: &mut Diagnostics) -> Result<Self> {
        let major_brand = r.read_fourcc("major_brand")?;
        let minor_version = r.read_u32("minor_version")?;
        let mut compatible_brands = Vec::with_capacity(r.remaining() / 4);
        while r.remaining() >= 4 {
            compatible_brands.push(r.read_fourcc("compatible_brand")?);
        }
        if !r.is_empty() {
            diag.warn(format!(
                "{typ}: ignoring {} trailing bytes after brand list",
                r.remaining()
            ));
            r.read_to_end();
        }
        Ok(Self {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_fourcc(self.major_brand);
        buf.put_u32(self.minor_version);
        for b in &self.compatible_brands {
            buf.put_fourcc(*b);
        }
        Ok(())
    }
}

/// `mdat`: the payload is addressed by range; bytes are only held when the box
/// was parsed from memory with payload loading enabled or built for writing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MdatBox {
    pub payload_offset: u64,
    pub payload_len: u64,
    pub data: Option<Vec<u8>>,
}

impl MdatBox {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            payload_offset: 0,
            payload_len: data.len() as u64,
            data: Some(data),
        }
    }
}

impl BoxCodec for MdatBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let payload_offset = r.offset();
        let bytes = r.read_to_end();
        Ok(Self {
            payload_offset,
            payload_len: bytes.len() as u64,
            data: Some(bytes.to_vec()),
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        match &self.data {
            Some(d) => {
                buf.put_bytes(d);
                Ok(())
            }
            None => Err(Error::precondition(
                "mdat payload was not loaded and cannot be re-serialized",
            )),
        }
    }
}
