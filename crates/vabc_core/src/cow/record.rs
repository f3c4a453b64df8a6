//! COW record types and serialization.

use crate::error::{CowError, CowResult};

/// Magic bytes identifying a COW record.
pub const COW_MAGIC: [u8; 4] = *b"VCOW";

/// Current COW format version.
pub const COW_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + type (1) + length (4).
pub const HEADER_SIZE: usize = 11;

/// CRC size.
pub const CRC_SIZE: usize = 4;

/// Type of COW record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CowRecordType {
    /// Verbatim block content.
    Raw = 1,
    /// Block content XOR'd against source bytes.
    Xor = 2,
    /// Blocks copied from the source.
    Copy = 3,
    /// Resume marker.
    Label = 4,
    /// Blocks whose new content is all zeroes.
    Zero = 5,
}

impl CowRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Raw),
            2 => Some(Self::Xor),
            3 => Some(Self::Copy),
            4 => Some(Self::Label),
            5 => Some(Self::Zero),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Upper-case name used in dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Xor => "XOR",
            Self::Copy => "COPY",
            Self::Label => "LABEL",
            Self::Zero => "ZERO",
        }
    }
}

/// One operation in a COW log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CowRecord {
    /// Verbatim content for blocks starting at `dst_block`.
    Raw {
        /// First destination block.
        dst_block: u64,
        /// New block content.
        data: Vec<u8>,
    },

    /// XOR delta for blocks starting at `dst_block`.
    Xor {
        /// First destination block.
        dst_block: u64,
        /// Source block the delta was computed against.
        src_block: u64,
        /// Byte offset within `src_block` where the source read started.
        src_offset: u32,
        /// New content XOR source content.
        data: Vec<u8>,
    },

    /// Destination blocks copied from source blocks.
    Copy {
        /// First destination block.
        dst_block: u64,
        /// First source block.
        src_block: u64,
        /// Number of blocks.
        num_blocks: u64,
    },

    /// Resume marker written after each install operation.
    Label {
        /// Index of the next operation.
        label: u64,
    },

    /// Destination blocks that read back as zeroes.
    Zero {
        /// First destination block.
        dst_block: u64,
        /// Number of blocks.
        num_blocks: u64,
    },
}

impl CowRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> CowRecordType {
        match self {
            Self::Raw { .. } => CowRecordType::Raw,
            Self::Xor { .. } => CowRecordType::Xor,
            Self::Copy { .. } => CowRecordType::Copy,
            Self::Label { .. } => CowRecordType::Label,
            Self::Zero { .. } => CowRecordType::Zero,
        }
    }

    /// Block payload carried by RAW and XOR records.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Raw { data, .. } | Self::Xor { data, .. } => Some(data.as_slice()),
            Self::Copy { .. } | Self::Label { .. } | Self::Zero { .. } => None,
        }
    }

    /// Serializes the record payload (without envelope).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Raw { dst_block, data } => {
                buf.reserve(8 + data.len());
                buf.extend_from_slice(&dst_block.to_le_bytes());
                buf.extend_from_slice(data);
            }
            Self::Xor {
                dst_block,
                src_block,
                src_offset,
                data,
            } => {
                buf.reserve(20 + data.len());
                buf.extend_from_slice(&dst_block.to_le_bytes());
                buf.extend_from_slice(&src_block.to_le_bytes());
                buf.extend_from_slice(&src_offset.to_le_bytes());
                buf.extend_from_slice(data);
            }
            Self::Copy {
                dst_block,
                src_block,
                num_blocks,
            } => {
                buf.extend_from_slice(&dst_block.to_le_bytes());
                buf.extend_from_slice(&src_block.to_le_bytes());
                buf.extend_from_slice(&num_blocks.to_le_bytes());
            }
            Self::Label { label } => {
                buf.extend_from_slice(&label.to_le_bytes());
            }
            Self::Zero {
                dst_block,
                num_blocks,
            } => {
                buf.extend_from_slice(&dst_block.to_le_bytes());
                buf.extend_from_slice(&num_blocks.to_le_bytes());
            }
        }
        buf
    }

    /// Serializes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not fit the 4-byte length field.
    pub fn encode(&self) -> CowResult<Vec<u8>> {
        let payload = self.encode_payload();
        let len = u32::try_from(payload.len())
            .map_err(|_| CowError::invalid_argument("COW record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&COW_MAGIC);
        data.extend_from_slice(&COW_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Deserializes a record payload.
    ///
    /// # Errors
    ///
    /// Returns [`CowError::CorruptLog`] if the payload is too short for its type
    /// or has trailing bytes.
    pub fn decode_payload(record_type: CowRecordType, payload: &[u8]) -> CowResult<Self> {
        let mut cursor = 0;

        let read_u64 = |cursor: &mut usize| -> CowResult<u64> {
            let bytes: [u8; 8] = payload
                .get(*cursor..*cursor + 8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| CowError::corrupt_log("unexpected end of payload"))?;
            *cursor += 8;
            Ok(u64::from_le_bytes(bytes))
        };

        let record = match record_type {
            CowRecordType::Raw => {
                let dst_block = read_u64(&mut cursor)?;
                cursor = payload.len();
                Self::Raw {
                    dst_block,
                    data: payload[8..].to_vec(),
                }
            }
            CowRecordType::Xor => {
                let dst_block = read_u64(&mut cursor)?;
                let src_block = read_u64(&mut cursor)?;
                let offset_bytes: [u8; 4] = payload
                    .get(16..20)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| CowError::corrupt_log("unexpected end of payload"))?;
                cursor = payload.len();
                Self::Xor {
                    dst_block,
                    src_block,
                    src_offset: u32::from_le_bytes(offset_bytes),
                    data: payload[20..].to_vec(),
                }
            }
            CowRecordType::Copy => Self::Copy {
                dst_block: read_u64(&mut cursor)?,
                src_block: read_u64(&mut cursor)?,
                num_blocks: read_u64(&mut cursor)?,
            },
            CowRecordType::Label => Self::Label {
                label: read_u64(&mut cursor)?,
            },
            CowRecordType::Zero => Self::Zero {
                dst_block: read_u64(&mut cursor)?,
                num_blocks: read_u64(&mut cursor)?,
            },
        };

        if cursor != payload.len() {
            return Err(CowError::corrupt_log(format!(
                "{} bytes of trailing payload in {} record",
                payload.len() - cursor,
                record_type.name()
            )));
        }
        Ok(record)
    }
}

/// Reflected CRC-32 polynomial.
const CRC32_POLY: u32 = 0xEDB8_8320;

static CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < table.len() {
        let mut c = n as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 == 1 { CRC32_POLY ^ (c >> 1) } else { c >> 1 };
            bit += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// CRC-32/ISO-HDLC of `data`, the checksum closing every record envelope.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    !data
        .iter()
        .fold(!0u32, |crc, &b| CRC32_TABLE[usize::from(crc as u8 ^ b)] ^ (crc >> 8))
}
