use std::cmp::Ordering;
use std::collections::HashMap;

use derivative::Derivative;
use lazy_static::lazy_static;
use strum::{Display, EnumString};

use crate::col::object::ObjectValue;

/// Identifiers of the built-in column types.
#[repr(u8)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Display, EnumString, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    REAL,
    INTEGER_53_BIT,
    TIME,
    DATE_TIME,
    NOMINAL,
    TEXT,
    TEXT_SET,
    TEXT_LIST,
    /// user-defined object types, identified by their custom id
    CUSTOM,
}

#[repr(u8)]
#[allow(non_camel_case_types)]
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    NUMERIC,
    CATEGORICAL,
    OBJECT,
}

/// Capability bits of a column type.
pub const NUMERIC_READABLE: u8 = 1 << 0;
pub const OBJECT_READABLE: u8 = 1 << 1;
pub const SORTABLE: u8 = 1 << 2;

pub type ObjectComparator = fn(&ObjectValue, &ObjectValue) -> Ordering;

/// Typed identity of a column: `(id, custom id, category, comparator)`.
/// Equality is structural; the capability set is derived at construction
/// from the category and the comparator presence.
#[derive(Clone, Derivative, PartialEq)]
#[derivative(Debug)]
pub struct ColumnType {
    id: TypeId,
    custom_id: Option<String>,
    category: Category,
    #[derivative(Debug = "ignore")]
    comparator: Option<ObjectComparator>,
    capabilities: u8,
}

impl ColumnType {
    fn new(id: TypeId, category: Category, comparator: Option<ObjectComparator>) -> Self {
        Self {
            id,
            custom_id: None,
            category,
            comparator,
            capabilities: capabilities_of(category, comparator.is_some()),
        }
    }

    /// A custom object type. Sortable exactly when a comparator is given.
    pub fn custom(custom_id: &str, comparator: Option<ObjectComparator>) -> Self {
        Self {
            id: TypeId::CUSTOM,
            custom_id: Some(custom_id.to_string()),
            category: Category::OBJECT,
            comparator,
            capabilities: capabilities_of(Category::OBJECT, comparator.is_some()),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn custom_id(&self) -> Option<&str> {
        self.custom_id.as_deref()
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn comparator(&self) -> Option<ObjectComparator> {
        self.comparator
    }

    pub fn capabilities(&self) -> u8 {
        self.capabilities
    }

    pub fn has_capability(&self, capability: u8) -> bool {
        self.capabilities & capability > 0
    }
}

fn capabilities_of(category: Category, has_comparator: bool) -> u8 {
    match category {
        Category::NUMERIC => NUMERIC_READABLE | SORTABLE,
        Category::CATEGORICAL => NUMERIC_READABLE | OBJECT_READABLE | SORTABLE,
        Category::OBJECT if has_comparator => OBJECT_READABLE | SORTABLE,
        Category::OBJECT => OBJECT_READABLE,
    }
}

/// Lexicographic order on text values.
pub(crate) fn text_compare(a: &ObjectValue, b: &ObjectValue) -> Ordering {
    match (a, b) {
        (ObjectValue::Text(a), ObjectValue::Text(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

/// Chronological order on instants.
pub(crate) fn instant_compare(a: &ObjectValue, b: &ObjectValue) -> Ordering {
    match (a, b) {
        (
            ObjectValue::Instant {
                seconds: sa,
                nanos: na,
            },
            ObjectValue::Instant {
                seconds: sb,
                nanos: nb,
            },
        ) => (sa, na).cmp(&(sb, nb)),
        _ => Ordering::Equal,
    }
}

lazy_static! {

    /// Process-wide table of the built-in column types.
    static ref COLUMN_TYPES: HashMap<TypeId, ColumnType> = {
        let mut map = HashMap::new();
        map.insert(
            TypeId::REAL,
            ColumnType::new(TypeId::REAL, Category::NUMERIC, None),
        );
        map.insert(
            TypeId::INTEGER_53_BIT,
            ColumnType::new(TypeId::INTEGER_53_BIT, Category::NUMERIC, None),
        );
        map.insert(
            TypeId::TIME,
            ColumnType::new(TypeId::TIME, Category::NUMERIC, None),
        );
        map.insert(
            TypeId::DATE_TIME,
            ColumnType::new(TypeId::DATE_TIME, Category::OBJECT, Some(instant_compare)),
        );
        map.insert(
            TypeId::NOMINAL,
            ColumnType::new(TypeId::NOMINAL, Category::CATEGORICAL, Some(text_compare)),
        );
        map.insert(
            TypeId::TEXT,
            ColumnType::new(TypeId::TEXT, Category::OBJECT, Some(text_compare)),
        );
        map.insert(
            TypeId::TEXT_SET,
            ColumnType::new(TypeId::TEXT_SET, Category::OBJECT, None),
        );
        map.insert(
            TypeId::TEXT_LIST,
            ColumnType::new(TypeId::TEXT_LIST, Category::OBJECT, None),
        );
        map
    };
}

/// Registry lookup for built-in types; custom types carry their own value.
pub fn type_of(id: TypeId) -> &'static ColumnType {
    COLUMN_TYPES
        .get(&id)
        .expect("ERR_CUSTOM_TYPE_NOT_IN_REGISTRY")
}
