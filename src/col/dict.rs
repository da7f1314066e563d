use std::collections::HashMap;

use log::trace;

use crate::error::{EngineError, Result};

/// Category index reserved for the missing value.
pub const MISSING_INDEX: i32 = 0;

/// Positive index of a boolean dictionary without a positive entry.
pub const NO_ENTRY: i32 = -1;

/// Ordered list from category indices to distinct values, `None` at index 0.
///
/// `maximal_index` may exceed `size()` after a removal, so interior `None`
/// gaps are legal. A boolean dictionary is the same list (length at most 3)
/// with a positive index attribute; the shape constraints live in the
/// constructors rather than in a separate type.
#[derive(Debug, Clone, PartialEq)]
pub struct Dictionary {
    values: Vec<Option<String>>,
    /// `Some(..)` iff the dictionary is boolean, `NO_ENTRY` for no positive
    positive_index: Option<i32>,
}

impl Default for Dictionary {
    /// The dictionary holding only the missing value.
    fn default() -> Self {
        Self {
            values: vec![None],
            positive_index: None,
        }
    }
}

impl Dictionary {
    /// Builds a plain dictionary. `values[0]` must be `None` and the non-null
    /// entries must be distinct.
    pub fn new(values: Vec<Option<String>>) -> Result<Self> {
        Self::check_values(&values)?;
        Ok(Self {
            values,
            positive_index: None,
        })
    }

    /// Builds a boolean dictionary of at most two values.
    ///
    /// `positive_index` is `NO_ENTRY` or the index of a non-null entry; with
    /// two non-null values a positive must be chosen.
    pub fn boolean(values: Vec<Option<String>>, positive_index: i32) -> Result<Self> {
        Self::check_values(&values)?;
        if values.len() > 3 {
            return Err(EngineError::InvalidDictionaryShape(format!(
                "boolean dictionary of length {}",
                values.len()
            )));
        }
        let two_values = values.len() == 3 && values[1].is_some() && values[2].is_some();
        let valid = match positive_index {
            NO_ENTRY => !two_values,
            i if i >= 1 && (i as usize) < values.len() => values[i as usize].is_some(),
            _ => false,
        };
        if !valid {
            return Err(EngineError::InvalidDictionaryShape(format!(
                "positive index {} for boolean dictionary of length {}",
                positive_index,
                values.len()
            )));
        }
        Ok(Self {
            values,
            positive_index: Some(positive_index),
        })
    }

    fn check_values(values: &[Option<String>]) -> Result<()> {
        if values.first().map(Option::is_some).unwrap_or(true) {
            return Err(EngineError::InvalidDictionaryShape(
                "index zero must hold the missing value".into(),
            ));
        }
        let mut seen = HashMap::new();
        for (i, v) in values.iter().enumerate() {
            if let Some(v) = v {
                if let Some(first) = seen.insert(v.as_str(), i) {
                    return Err(EngineError::InvalidDictionaryShape(format!(
                        "value {:?} at indices {} and {}",
                        v, first, i
                    )));
                }
            }
        }
        Ok(())
    }

    /// Value at `index`; out of range reads as `None`, never fails.
    pub fn get(&self, index: i32) -> Option<&str> {
        if index < 0 {
            return None;
        }
        self.values
            .get(index as usize)
            .and_then(|v| v.as_deref())
    }

    /// Count of non-null entries.
    pub fn size(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn maximal_index(&self) -> i32 {
        self.values.len() as i32 - 1
    }

    pub fn is_boolean(&self) -> bool {
        self.positive_index.is_some()
    }

    /// Value-to-index map with the missing value at index 0.
    pub fn create_inverse(&self) -> HashMap<Option<String>, i32> {
        let mut inverse = HashMap::with_capacity(self.values.len());
        inverse.insert(None, MISSING_INDEX);
        for (i, v) in self.iter() {
            inverse.insert(Some(v.to_string()), i);
        }
        trace!("inverse of {} entries", inverse.len());
        inverse
    }

    /// `(index, value)` pairs of non-null entries in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_deref().map(|v| (i as i32, v)))
    }

    pub(crate) fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Boolean view of this dictionary with `positive_value` as the positive
    /// entry, preserving the list. More than two values cannot be boolean;
    /// an absent positive value yields `NO_ENTRY`.
    pub fn to_boolean(&self, positive_value: Option<&str>) -> Result<Dictionary> {
        if self.size() > 2 {
            return Err(EngineError::InvalidDictionaryShape(format!(
                "{} values cannot form a boolean dictionary",
                self.size()
            )));
        }
        let positive = positive_value
            .and_then(|p| self.iter().find(|(_, v)| *v == p))
            .map(|(i, _)| i)
            .unwrap_or(NO_ENTRY);
        Dictionary::boolean(self.values.clone(), positive)
    }

    /// Replaces `old` by `new`, keeping indices and the boolean attribute.
    pub fn replace(&self, old: &str, new: &str) -> Result<Dictionary> {
        let index = match self.iter().find(|(_, v)| *v == old) {
            Some((i, _)) => i as usize,
            None => {
                return Err(EngineError::IllegalReplacement(format!(
                    "value {:?} not in dictionary",
                    old
                )))
            }
        };
        if self.iter().any(|(i, v)| v == new && i as usize != index) {
            return Err(EngineError::IllegalReplacement(format!(
                "value {:?} already present",
                new
            )));
        }
        let mut values = self.values.clone();
        values[index] = Some(new.to_string());
        Ok(Self {
            values,
            positive_index: self.positive_index,
        })
    }

    pub fn has_positive(&self) -> Result<bool> {
        Ok(self.positive_index()? != NO_ENTRY)
    }

    pub fn has_negative(&self) -> Result<bool> {
        Ok(self.negative_index()? != NO_ENTRY)
    }

    /// Index of the positive value, `NO_ENTRY` if there is none. Fails on a
    /// non-boolean dictionary.
    pub fn positive_index(&self) -> Result<i32> {
        self.positive_index.ok_or_else(|| {
            EngineError::Unsupported("positive index of a non-boolean dictionary".into())
        })
    }

    /// Index of the non-positive value, `NO_ENTRY` if there is none. Fails
    /// on a non-boolean dictionary.
    pub fn negative_index(&self) -> Result<i32> {
        let positive = self.positive_index()?;
        Ok(self
            .iter()
            .map(|(i, _)| i)
            .find(|&i| i != positive)
            .unwrap_or(NO_ENTRY))
    }
}

#[cfg(test)]
mod dict_tests {

    use std::env::set_var;

    use super::*;
    use crate::util;

    fn setup() {
        set_var("RUST_LOG", "info");
        util::init();
    }

    fn yes_no() -> Vec<Option<String>> {
        vec![None, Some("yes".into()), Some("no".into())]
    }

    #[test]
    fn null_at_zero_is_required() {
        setup();
        assert!(Dictionary::new(vec![Some("a".into())]).is_err());
        assert!(Dictionary::new(vec![]).is_err());
        assert!(Dictionary::new(vec![None]).is_ok());
    }

    #[test]
    fn duplicate_values_are_rejected() {
        setup();
        let dup = vec![None, Some("a".into()), Some("a".into())];
        assert!(matches!(
            Dictionary::new(dup),
            Err(EngineError::InvalidDictionaryShape(_))
        ));
    }

    #[test]
    fn gaps_count_into_maximal_index_only() {
        setup();
        let d = Dictionary::new(vec![None, None, Some("a".into())]).unwrap();
        assert_eq!(d.size(), 1);
        assert_eq!(d.maximal_index(), 2);
        assert_eq!(d.get(1), None);
        assert_eq!(d.get(2), Some("a"));
        assert_eq!(d.get(17), None);
    }

    #[test]
    fn inverse_round_trips() {
        setup();
        let d = Dictionary::new(yes_no()).unwrap();
        let inverse = d.create_inverse();
        assert_eq!(inverse[&None], 0);
        for (i, v) in d.iter() {
            assert_eq!(inverse[&Some(v.to_string())], i);
        }
    }

    #[test]
    fn boolean_shape_validity() {
        setup();
        let d = Dictionary::boolean(yes_no(), 1).unwrap();
        assert!(d.is_boolean());
        assert!(d.has_positive().unwrap());
        assert!(d.has_negative().unwrap());
        assert_eq!(d.positive_index().unwrap(), 1);
        assert_eq!(d.negative_index().unwrap(), 2);

        // two values need a positive
        assert!(Dictionary::boolean(yes_no(), NO_ENTRY).is_err());
        // positive must point at a non-null entry
        assert!(Dictionary::boolean(vec![None, None, Some("a".into())], 1).is_err());
        assert!(Dictionary::boolean(vec![None, None, Some("a".into())], 2).is_ok());
        // single value may stay without positive
        assert!(Dictionary::boolean(vec![None, Some("a".into())], NO_ENTRY).is_ok());
    }

    #[test]
    fn boolean_getters_fail_on_plain_dictionary() {
        setup();
        let d = Dictionary::new(yes_no()).unwrap();
        assert!(matches!(
            d.positive_index(),
            Err(EngineError::Unsupported(_))
        ));
        assert!(matches!(d.has_negative(), Err(EngineError::Unsupported(_))));
    }

    #[test]
    fn to_boolean_locates_positive() {
        setup();
        let d = Dictionary::new(yes_no()).unwrap();
        let b = d.to_boolean(Some("no")).unwrap();
        assert_eq!(b.positive_index().unwrap(), 2);
        assert_eq!(b.negative_index().unwrap(), 1);

        let three = Dictionary::new(vec![
            None,
            Some("a".into()),
            Some("b".into()),
            Some("c".into()),
        ])
        .unwrap();
        assert!(three.to_boolean(Some("a")).is_err());
    }

    #[test]
    fn replace_refuses_aliasing() {
        setup();
        let d = Dictionary::new(vec![None, Some("a".into()), Some("b".into())]).unwrap();
        assert!(matches!(
            d.replace("a", "b"),
            Err(EngineError::IllegalReplacement(_))
        ));
        assert!(matches!(
            d.replace("x", "y"),
            Err(EngineError::IllegalReplacement(_))
        ));
        let r = d.replace("a", "c").unwrap();
        assert_eq!(r.get(1), Some("c"));
        assert_eq!(r.get(2), Some("b"));
    }
}
