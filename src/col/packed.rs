use derivative::Derivative;
use num_enum::TryFromPrimitive;
use strum::Display;

use crate::error::{EngineError, Result};

/// Packed bit widths for categorical index storage. The discriminant is the
/// number of bits per entry.
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Display, TryFromPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U2 = 2,
    U4 = 4,
    U8 = 8,
    U16 = 16,
    I32 = 32,
}

impl IndexFormat {
    /// Largest category index the format can hold.
    pub fn max_index(&self) -> i32 {
        match self {
            IndexFormat::U2 => 3,
            IndexFormat::U4 => 15,
            IndexFormat::U8 => u8::MAX as i32,
            IndexFormat::U16 => u16::MAX as i32,
            IndexFormat::I32 => i32::MAX,
        }
    }

    /// Smallest format holding indices up to `max_index`.
    pub fn fitting(max_index: i32) -> IndexFormat {
        [
            IndexFormat::U2,
            IndexFormat::U4,
            IndexFormat::U8,
            IndexFormat::U16,
        ]
        .into_iter()
        .find(|f| max_index <= f.max_index())
        .unwrap_or(IndexFormat::I32)
    }

    /// The 2-bit and 4-bit widths are dense-only.
    pub fn supports_sparse(&self) -> bool {
        !matches!(self, IndexFormat::U2 | IndexFormat::U4)
    }
}

/// Immutable category indices packed at a fixed bit width.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct IndexData {
    format: IndexFormat,
    len: usize,
    #[derivative(Debug = "ignore")]
    store: IndexStore,
}

#[derive(Debug, Clone)]
enum IndexStore {
    /// U2/U4 entries packed little-endian within each byte
    Packed(Vec<u8>),
    Bytes(Vec<u8>),
    Shorts(Vec<u16>),
    Ints(Vec<i32>),
}

impl IndexData {
    /// Packs `indices` at the given width; every index must be in
    /// `[0, format.max_index()]`.
    pub fn from_indices(indices: &[i32], format: IndexFormat) -> Result<Self> {
        for (row, &idx) in indices.iter().enumerate() {
            if idx < 0 || idx > format.max_index() {
                return Err(EngineError::Range(format!(
                    "category index {} at row {} exceeds format {}",
                    idx, row, format
                )));
            }
        }
        let store = match format {
            IndexFormat::U2 => {
                let mut bytes = vec![0u8; (indices.len() + 3) / 4];
                for (i, &idx) in indices.iter().enumerate() {
                    bytes[i >> 2] |= (idx as u8) << ((i & 3) << 1);
                }
                IndexStore::Packed(bytes)
            }
            IndexFormat::U4 => {
                let mut bytes = vec![0u8; (indices.len() + 1) / 2];
                for (i, &idx) in indices.iter().enumerate() {
                    bytes[i >> 1] |= (idx as u8) << ((i & 1) << 2);
                }
                IndexStore::Packed(bytes)
            }
            IndexFormat::U8 => IndexStore::Bytes(indices.iter().map(|&i| i as u8).collect()),
            IndexFormat::U16 => IndexStore::Shorts(indices.iter().map(|&i| i as u16).collect()),
            IndexFormat::I32 => IndexStore::Ints(indices.to_vec()),
        };
        Ok(Self {
            format,
            len: indices.len(),
            store,
        })
    }

    /// The empty index sequence at the given width.
    pub fn empty(format: IndexFormat) -> Self {
        let store = match format {
            IndexFormat::U2 | IndexFormat::U4 => IndexStore::Packed(Vec::new()),
            IndexFormat::U8 => IndexStore::Bytes(Vec::new()),
            IndexFormat::U16 => IndexStore::Shorts(Vec::new()),
            IndexFormat::I32 => IndexStore::Ints(Vec::new()),
        };
        Self {
            format,
            len: 0,
            store,
        }
    }

    pub fn get(&self, i: usize) -> i32 {
        debug_assert!(i < self.len);
        match &self.store {
            IndexStore::Packed(bytes) => match self.format {
                IndexFormat::U2 => ((bytes[i >> 2] >> ((i & 3) << 1)) & 0x03) as i32,
                IndexFormat::U4 => ((bytes[i >> 1] >> ((i & 1) << 2)) & 0x0f) as i32,
                _ => unreachable!("packed store is two or four bits wide"),
            },
            IndexStore::Bytes(bytes) => bytes[i] as i32,
            IndexStore::Shorts(shorts) => shorts[i] as i32,
            IndexStore::Ints(ints) => ints[i],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn format(&self) -> IndexFormat {
        self.format
    }
}
