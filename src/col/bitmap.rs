use derivative::Derivative;
use log::trace;

use crate::util;

/// Lookup result for a row holding the default value.
pub const DEFAULT_INDEX: i32 = -1;

/// Lookup result for a row outside the column when the default is not
/// missing. With a missing default, out-of-bounds rows read as defaults.
pub const OUT_OF_BOUNDS_INDEX: i32 = -2;

/// Presence index over the non-default rows of a sparse column.
///
/// One bit per row plus a prefix count of set bits per 64-bit word, so a
/// lookup costs a single mask-and-popcount. Frozen after construction.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct SparseBitmap {
    default_is_missing: bool,
    size: usize,
    #[derivative(Debug = "ignore")]
    words: Vec<u64>,
    /// set bits before each word
    #[derivative(Debug = "ignore")]
    offsets: Vec<u32>,
}

impl SparseBitmap {
    /// `non_default_rows` must be sorted ascending and lie in `[0, size)`.
    pub fn new(default_is_missing: bool, non_default_rows: &[u32], size: usize) -> Self {
        debug_assert!(non_default_rows.windows(2).all(|w| w[0] < w[1]));

        let mut words = vec![0u64; util::word_count(size)];
        for &row in non_default_rows {
            let row = row as usize;
            debug_assert!(row < size);
            words[util::word_index(row)] |= 1u64 << util::bit_offset(row);
        }

        let mut offsets = vec![0u32; words.len()];
        let mut acc = 0u32;
        for (w, word) in words.iter().enumerate() {
            offsets[w] = acc;
            acc += word.count_ones();
        }
        trace!(
            "bitmap over {} rows, {} non-defaults, {} words",
            size,
            non_default_rows.len(),
            words.len()
        );

        Self {
            default_is_missing,
            size,
            words,
            offsets,
        }
    }

    /// Position of `row` in the non-defaults array, or [`DEFAULT_INDEX`] for
    /// a default row, or [`OUT_OF_BOUNDS_INDEX`] outside `[0, size)` unless
    /// the default itself is the missing value.
    pub fn get(&self, row: i64) -> i32 {
        if row < 0 || row >= self.size as i64 {
            return if self.default_is_missing {
                DEFAULT_INDEX
            } else {
                OUT_OF_BOUNDS_INDEX
            };
        }
        let row = row as usize;
        let w = util::word_index(row);
        let word = self.words[w];
        let bit = 1u64 << util::bit_offset(row);
        if word & bit == 0 {
            DEFAULT_INDEX
        } else {
            (self.offsets[w] + (word & (bit - 1)).count_ones()) as i32
        }
    }

    /// Number of mapping entries that do not read as the default value. With
    /// a non-missing default this includes out-of-bounds entries, which turn
    /// into explicitly stored missing rows.
    pub fn count_non_defaults(&self, rows: &[i32]) -> usize {
        rows.iter()
            .filter(|&&row| self.get(row as i64) != DEFAULT_INDEX)
            .count()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn default_is_missing(&self) -> bool {
        self.default_is_missing
    }
}
