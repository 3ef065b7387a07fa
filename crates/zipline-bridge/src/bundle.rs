//! Binary container for one compiled guest module.
//!
//! Layout (all integers big-endian):
//! ```text
//! "ZIPLINE\0"             8-byte magic
//! version                 u32, must equal CURRENT_ZIPLINE_VERSION
//! { section_type u32, length u32, payload[length] }*
//! ```
//! Section type 1 carries the compiled code; exactly one is required.
//! Unknown section types are skipped so newer writers can add sections.

use thiserror::Error;

pub const CURRENT_ZIPLINE_VERSION: u32 = 20211020;

const MAGIC_PREFIX: &[u8; 8] = b"ZIPLINE\0";
const SECTION_BYTECODE: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("not a zipline file")]
    NotABundle,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("bytecode section missing")]
    MissingBytecode,

    #[error("multiple bytecode sections")]
    DuplicateBytecode,

    #[error("truncated section: type {section_type} declares {declared} bytes, {available} available")]
    Truncated {
        section_type: u32,
        declared: usize,
        available: usize,
    },

    #[error("section of {0} bytes exceeds the 4 GiB section limit")]
    SectionTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZiplineFile {
    pub version: u32,
    pub bytecode: Vec<u8>,
}

impl ZiplineFile {
    pub fn new(bytecode: Vec<u8>) -> Self {
        Self {
            version: CURRENT_ZIPLINE_VERSION,
            bytecode,
        }
    }

    pub fn write(&self) -> Result<Vec<u8>, BundleError> {
        let length = section_length(self.bytecode.len())?;
        let mut out = Vec::with_capacity(MAGIC_PREFIX.len() + 12 + self.bytecode.len());
        out.extend_from_slice(MAGIC_PREFIX);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&SECTION_BYTECODE.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&self.bytecode);
        Ok(out)
    }

    pub fn read(bytes: &[u8]) -> Result<Self, BundleError> {
        let mut cursor = Cursor { bytes, pos: 0 };

        if cursor.take(MAGIC_PREFIX.len()) != Some(MAGIC_PREFIX.as_slice()) {
            return Err(BundleError::NotABundle);
        }
        let version = cursor.read_u32().ok_or(BundleError::NotABundle)?;
        if version != CURRENT_ZIPLINE_VERSION {
            return Err(BundleError::UnsupportedVersion(version));
        }

        let mut bytecode = None;
        while !cursor.is_exhausted() {
            let header = cursor.read_u32().zip(cursor.read_u32());
            let Some((section_type, length)) = header else {
                return Err(BundleError::Truncated {
                    section_type: 0,
                    declared: 8,
                    available: cursor.remaining(),
                });
            };
            let length = length as usize;
            let available = cursor.remaining();
            let payload = cursor.take(length).ok_or(BundleError::Truncated {
                section_type,
                declared: length,
                available,
            })?;

            if section_type == SECTION_BYTECODE {
                if bytecode.is_some() {
                    return Err(BundleError::DuplicateBytecode);
                }
                bytecode = Some(payload.to_vec());
            } else {
                tracing::debug!(section_type, length, "Skipping unknown bundle section");
            }
        }

        Ok(Self {
            version,
            bytecode: bytecode.ok_or(BundleError::MissingBytecode)?,
        })
    }
}

fn section_length(len: usize) -> Result<u32, BundleError> {
    u32::try_from(len).map_err(|_| BundleError::SectionTooLarge(len))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn read_u32(&mut self) -> Option<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
