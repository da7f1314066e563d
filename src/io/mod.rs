use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::debug;

use crate::col::categorical::CategoricalColumn;
use crate::col::datetime::{self, DateTimeColumn};
use crate::col::dict::Dictionary;
use crate::col::numeric::NumericColumn;
use crate::col::time::{self, TimeColumn};
use crate::col::types::TypeId;
use crate::error::{EngineError, Result};

/// Rows converted per fill while streaming a column into a buffer.
const IO_BATCH: usize = 2048;

/// Writes the rows from `row_offset` on as little-endian IEEE-754 doubles,
/// eight bytes per row, `NaN` for missing.
pub fn put_numeric_doubles(col: &NumericColumn, row_offset: usize, buf: &mut BytesMut) {
    let mut chunk = vec![0.0f64; IO_BATCH];
    let mut offset = row_offset;
    while offset < col.size() {
        let n = (col.size() - offset).min(IO_BATCH);
        col.fill(&mut chunk[..n], offset);
        for &v in &chunk[..n] {
            buf.put_f64_le(v);
        }
        offset += n;
    }
}

/// Writes nanoseconds of day as signed longs, eight bytes per row, the
/// maximal long for missing.
pub fn put_time_longs(col: &TimeColumn, row_offset: usize, buf: &mut BytesMut) {
    let mut chunk = vec![0i64; IO_BATCH];
    let mut offset = row_offset;
    while offset < col.size() {
        let n = (col.size() - offset).min(IO_BATCH);
        col.fill(&mut chunk[..n], offset);
        for &v in &chunk[..n] {
            buf.put_i64_le(v);
        }
        offset += n;
    }
}

/// Writes seconds since epoch as signed longs, eight bytes per row.
pub fn put_date_time_longs(col: &DateTimeColumn, row_offset: usize, buf: &mut BytesMut) {
    let mut chunk = vec![0i64; IO_BATCH];
    let mut offset = row_offset;
    while offset < col.size() {
        let n = (col.size() - offset).min(IO_BATCH);
        col.fill_seconds(&mut chunk[..n], offset);
        for &v in &chunk[..n] {
            buf.put_i64_le(v);
        }
        offset += n;
    }
}

/// Writes nanoseconds of second as ints, four bytes per row, zero when the
/// column has no sub-second precision.
pub fn put_date_time_nano_ints(col: &DateTimeColumn, row_offset: usize, buf: &mut BytesMut) {
    let mut chunk = vec![0i32; IO_BATCH];
    let mut offset = row_offset;
    while offset < col.size() {
        let n = (col.size() - offset).min(IO_BATCH);
        col.fill_nanos(&mut chunk[..n], offset);
        for &v in &chunk[..n] {
            buf.put_i32_le(v);
        }
        offset += n;
    }
}

/// Writes category indices as signed ints, four bytes per row.
pub fn put_categorical_integers(col: &CategoricalColumn, row_offset: usize, buf: &mut BytesMut) {
    let mut chunk = vec![0i32; IO_BATCH];
    let mut offset = row_offset;
    while offset < col.size() {
        let n = (col.size() - offset).min(IO_BATCH);
        col.fill_indices(&mut chunk[..n], offset);
        for &v in &chunk[..n] {
            buf.put_i32_le(v);
        }
        offset += n;
    }
}

/// Writes category indices as signed shorts; the dictionary must fit them.
pub fn put_categorical_shorts(
    col: &CategoricalColumn,
    row_offset: usize,
    buf: &mut BytesMut,
) -> Result<()> {
    if col.dictionary().maximal_index() > i16::MAX as i32 {
        return Err(EngineError::Range(format!(
            "maximal index {} beyond short range",
            col.dictionary().maximal_index()
        )));
    }
    let mut chunk = vec![0i32; IO_BATCH];
    let mut offset = row_offset;
    while offset < col.size() {
        let n = (col.size() - offset).min(IO_BATCH);
        col.fill_indices(&mut chunk[..n], offset);
        for &v in &chunk[..n] {
            buf.put_i16_le(v as i16);
        }
        offset += n;
    }
    Ok(())
}

/// Writes category indices as signed bytes; the dictionary must fit them.
pub fn put_categorical_bytes(
    col: &CategoricalColumn,
    row_offset: usize,
    buf: &mut BytesMut,
) -> Result<()> {
    if col.dictionary().maximal_index() > i8::MAX as i32 {
        return Err(EngineError::Range(format!(
            "maximal index {} beyond byte range",
            col.dictionary().maximal_index()
        )));
    }
    let mut chunk = vec![0i32; IO_BATCH];
    let mut offset = row_offset;
    while offset < col.size() {
        let n = (col.size() - offset).min(IO_BATCH);
        col.fill_indices(&mut chunk[..n], offset);
        for &v in &chunk[..n] {
            buf.put_i8(v as i8);
        }
        offset += n;
    }
    Ok(())
}

/// Splits buffered bytes into complete fixed-width groups, keeping a partial
/// tail for the next put.
fn drain_full_groups(stash: &mut Vec<u8>, buf: &[u8], width: usize) -> Vec<u8> {
    stash.extend_from_slice(buf);
    let full = stash.len() / width * width;
    stash.drain(..full).collect()
}

/// Builder for a double column of a declared length; unfilled tail rows
/// read as missing. Values arriving beyond the length are dropped.
#[derive(Debug)]
pub struct NumericReader {
    tid: TypeId,
    len: usize,
    values: Vec<f64>,
    stash: Vec<u8>,
}

pub fn read_real(len: usize) -> NumericReader {
    NumericReader {
        tid: TypeId::REAL,
        len,
        values: Vec::with_capacity(len),
        stash: Vec::new(),
    }
}

pub fn read_integer_53_bit(len: usize) -> NumericReader {
    NumericReader {
        tid: TypeId::INTEGER_53_BIT,
        len,
        values: Vec::with_capacity(len),
        stash: Vec::new(),
    }
}

impl NumericReader {
    pub fn put(&mut self, buf: &[u8]) {
        for chunk in drain_full_groups(&mut self.stash, buf, 8).chunks_exact(8) {
            if self.values.len() >= self.len {
                break;
            }
            self.values
                .push(f64::from_le_bytes(chunk.try_into().unwrap()));
        }
    }

    pub fn position(&self) -> usize {
        self.values.len()
    }

    pub fn finish(mut self) -> Result<NumericColumn> {
        debug!("numeric reader finished at {}/{}", self.values.len(), self.len);
        self.values.resize(self.len, f64::NAN);
        NumericColumn::dense(self.tid, self.values)
    }
}

/// Builder for a time column; nanoseconds of day are validated as they
/// arrive.
#[derive(Debug)]
pub struct TimeReader {
    len: usize,
    values: Vec<i64>,
    stash: Vec<u8>,
}

pub fn read_time(len: usize) -> TimeReader {
    TimeReader {
        len,
        values: Vec::with_capacity(len),
        stash: Vec::new(),
    }
}

impl TimeReader {
    pub fn put(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in drain_full_groups(&mut self.stash, buf, 8).chunks_exact(8) {
            if self.values.len() >= self.len {
                break;
            }
            let v = i64::from_le_bytes(chunk.try_into().unwrap());
            if v != time::MISSING_VALUE && !(0..=time::MAX_NANOS_OF_DAY).contains(&v) {
                return Err(EngineError::Range(format!(
                    "nanoseconds of day {} at row {}",
                    v,
                    self.values.len()
                )));
            }
            self.values.push(v);
        }
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.values.len()
    }

    pub fn finish(mut self) -> Result<TimeColumn> {
        self.values.resize(self.len, time::MISSING_VALUE);
        TimeColumn::dense(self.values)
    }
}

/// Builder for a date-time column; seconds and optional nanos arrive through
/// separate buffers.
#[derive(Debug)]
pub struct DateTimeReader {
    len: usize,
    seconds: Vec<i64>,
    nanos: Option<Vec<i32>>,
    seconds_stash: Vec<u8>,
    nanos_stash: Vec<u8>,
}

pub fn read_date_time(len: usize, sub_second: bool) -> DateTimeReader {
    DateTimeReader {
        len,
        seconds: Vec::with_capacity(len),
        nanos: sub_second.then(|| Vec::with_capacity(len)),
        seconds_stash: Vec::new(),
        nanos_stash: Vec::new(),
    }
}

impl DateTimeReader {
    pub fn put_seconds(&mut self, buf: &[u8]) {
        for chunk in drain_full_groups(&mut self.seconds_stash, buf, 8).chunks_exact(8) {
            if self.seconds.len() >= self.len {
                break;
            }
            self.seconds
                .push(i64::from_le_bytes(chunk.try_into().unwrap()));
        }
    }

    pub fn put_nanos(&mut self, buf: &[u8]) -> Result<()> {
        let nanos = self.nanos.as_mut().ok_or_else(|| {
            EngineError::Unsupported("nano buffers without sub-second precision".into())
        })?;
        for chunk in drain_full_groups(&mut self.nanos_stash, buf, 4).chunks_exact(4) {
            if nanos.len() >= self.len {
                break;
            }
            let v = i32::from_le_bytes(chunk.try_into().unwrap());
            if !(0..=datetime::MAX_NANOS).contains(&v) {
                return Err(EngineError::Range(format!(
                    "nanoseconds {} at row {}",
                    v,
                    nanos.len()
                )));
            }
            nanos.push(v);
        }
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.seconds.len()
    }

    pub fn finish(mut self) -> Result<DateTimeColumn> {
        self.seconds.resize(self.len, datetime::MISSING_VALUE);
        let nanos = self.nanos.map(|mut nanos| {
            nanos.resize(self.len, 0);
            nanos
        });
        DateTimeColumn::dense(self.seconds, nanos)
    }
}

/// Builder for a nominal column over a dictionary with the missing value at
/// index zero; indices are validated against the dictionary as they arrive.
#[derive(Debug)]
pub struct NominalReader {
    dict: Arc<Dictionary>,
    len: usize,
    indices: Vec<i32>,
    stash: Vec<u8>,
}

pub fn read_nominal(dict: Arc<Dictionary>, len: usize) -> NominalReader {
    NominalReader {
        dict,
        len,
        indices: Vec::with_capacity(len),
        stash: Vec::new(),
    }
}

impl NominalReader {
    pub fn put(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in drain_full_groups(&mut self.stash, buf, 4).chunks_exact(4) {
            if self.indices.len() >= self.len {
                break;
            }
            let idx = i32::from_le_bytes(chunk.try_into().unwrap());
            if idx < 0 || idx > self.dict.maximal_index() {
                return Err(EngineError::Range(format!(
                    "category index {} at row {} beyond maximal index {}",
                    idx,
                    self.indices.len(),
                    self.dict.maximal_index()
                )));
            }
            self.indices.push(idx);
        }
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.indices.len()
    }

    pub fn finish(mut self) -> Result<CategoricalColumn> {
        self.indices.resize(self.len, 0);
        CategoricalColumn::dense_auto(self.dict, &self.indices)
    }
}

#[cfg(test)]
mod io_tests {

    use std::env::set_var;

    use super::*;
    use crate::util;

    fn setup() {
        set_var("RUST_LOG", "info");
        util::init();
    }

    #[test]
    fn doubles_round_trip_including_missing() {
        setup();
        let col =
            NumericColumn::dense(TypeId::REAL, vec![1.5, f64::NAN, -2.25, 0.0]).unwrap();
        let mut buf = BytesMut::new();
        put_numeric_doubles(&col, 0, &mut buf);
        assert_eq!(buf.len(), 4 * 8);

        let mut reader = read_real(4);
        reader.put(&buf);
        let back = reader.finish().unwrap();
        let mut values = vec![0.0; 4];
        back.fill(&mut values, 0);
        assert_eq!(values[0], 1.5);
        assert!(values[1].is_nan());
        assert_eq!(values[2], -2.25);
        assert_eq!(values[3], 0.0);
    }

    #[test]
    fn puts_may_split_values() {
        setup();
        let col = NumericColumn::dense(TypeId::REAL, vec![7.0, 8.0]).unwrap();
        let mut buf = BytesMut::new();
        put_numeric_doubles(&col, 0, &mut buf);

        let mut reader = read_real(2);
        reader.put(&buf[..5]);
        assert_eq!(reader.position(), 0);
        reader.put(&buf[5..11]);
        assert_eq!(reader.position(), 1);
        reader.put(&buf[11..]);
        assert_eq!(reader.position(), 2);
        let back = reader.finish().unwrap();
        let mut values = vec![0.0; 2];
        back.fill(&mut values, 0);
        assert_eq!(values, vec![7.0, 8.0]);
    }

    #[test]
    fn short_input_pads_with_missing() {
        setup();
        let mut reader = read_time(3);
        reader.put(&1_234i64.to_le_bytes()).unwrap();
        assert_eq!(reader.position(), 1);
        let col = reader.finish().unwrap();
        let mut values = vec![0i64; 3];
        col.fill(&mut values, 0);
        assert_eq!(values, vec![1_234, time::MISSING_VALUE, time::MISSING_VALUE]);
    }

    #[test]
    fn time_range_fails_at_put() {
        setup();
        let mut reader = read_time(1);
        let bad = 86_400_000_000_000i64;
        assert!(matches!(
            reader.put(&bad.to_le_bytes()),
            Err(EngineError::Range(_))
        ));

        let mut reader = read_time(1);
        assert!(reader.put(&time::MISSING_VALUE.to_le_bytes()).is_ok());
    }

    #[test]
    fn date_time_round_trip_with_nanos() {
        setup();
        let col = DateTimeColumn::dense(
            vec![100, datetime::MISSING_VALUE, 300],
            Some(vec![7, 0, 9]),
        )
        .unwrap();
        let mut seconds = BytesMut::new();
        let mut nanos = BytesMut::new();
        put_date_time_longs(&col, 0, &mut seconds);
        put_date_time_nano_ints(&col, 0, &mut nanos);
        assert_eq!(seconds.len(), 3 * 8);
        assert_eq!(nanos.len(), 3 * 4);

        let mut reader = read_date_time(3, true);
        reader.put_seconds(&seconds);
        reader.put_nanos(&nanos).unwrap();
        let back = reader.finish().unwrap();
        assert_eq!(back.seconds_at(0), 100);
        assert_eq!(back.nanos_at(0), 7);
        assert_eq!(back.seconds_at(1), datetime::MISSING_VALUE);
        assert_eq!(back.nanos_at(1), 0);
        assert_eq!(back.nanos_at(2), 9);
    }

    #[test]
    fn low_precision_writer_emits_zero_nanos() {
        setup();
        let col = DateTimeColumn::dense(vec![5, 6], None).unwrap();
        let mut nanos = BytesMut::new();
        put_date_time_nano_ints(&col, 0, &mut nanos);
        assert_eq!(&nanos[..], &[0u8; 8]);

        let mut reader = read_date_time(1, false);
        assert!(matches!(
            reader.put_nanos(&[0, 0, 0, 0]),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn nominal_round_trip_and_validation() {
        setup();
        let dict = Arc::new(
            Dictionary::new(vec![None, Some("a".into()), Some("b".into())]).unwrap(),
        );
        let col = CategoricalColumn::dense_auto(dict.clone(), &[1, 0, 2, 2]).unwrap();
        let mut buf = BytesMut::new();
        put_categorical_integers(&col, 0, &mut buf);

        let mut reader = read_nominal(dict.clone(), 4);
        reader.put(&buf).unwrap();
        let back = reader.finish().unwrap();
        let mut indices = vec![0i32; 4];
        back.fill_indices(&mut indices, 0);
        assert_eq!(indices, vec![1, 0, 2, 2]);

        let mut reader = read_nominal(dict, 1);
        assert!(matches!(
            reader.put(&7i32.to_le_bytes()),
            Err(EngineError::Range(_))
        ));
    }

    #[test]
    fn narrow_categorical_writers_check_the_dictionary() {
        setup();
        let mut values: Vec<Option<String>> = vec![None];
        values.extend((0..200).map(|i| Some(format!("v{}", i))));
        let dict = Arc::new(Dictionary::new(values).unwrap());
        let col = CategoricalColumn::dense_auto(dict, &[1, 199]).unwrap();

        let mut buf = BytesMut::new();
        assert!(matches!(
            put_categorical_bytes(&col, 0, &mut buf),
            Err(EngineError::Range(_))
        ));
        assert!(put_categorical_shorts(&col, 0, &mut buf).is_ok());
        assert_eq!(buf.len(), 2 * 2);
        assert_eq!(&buf[..2], &1i16.to_le_bytes());
        assert_eq!(&buf[2..], &199i16.to_le_bytes());
    }

    #[test]
    fn writer_offset_skips_rows() {
        setup();
        let col = NumericColumn::dense(TypeId::REAL, vec![1.0, 2.0, 3.0]).unwrap();
        let mut buf = BytesMut::new();
        put_numeric_doubles(&col, 1, &mut buf);
        assert_eq!(buf.len(), 2 * 8);
        assert_eq!(&buf[..8], &2.0f64.to_le_bytes());
    }
}
