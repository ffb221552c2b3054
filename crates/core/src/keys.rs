//! Composite ERP keys as value types.
//!
//! Every component is trimmed at construction and empty components are
//! rejected, so call sites never concatenate key strings by hand.
//!
//! Rendered forms:
//! - header: `{warehouse}-{doc_type}-{doc_number}` (e.g. `AL-NI-000123`)
//! - detail: `{warehouse}-{doc_type}-{doc_number}-{item}` (e.g. `AL-NI-000123-1`)
//!
//! Warehouse codes and document types never contain `-`; document numbers may,
//! which is why parsing splits the leading components first and the item last.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

fn clean(component: &str, raw: &str) -> DomainResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{component} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn clean_segment(component: &str, raw: &str) -> DomainResult<String> {
    let value = clean(component, raw)?;
    if value.contains('-') {
        return Err(DomainError::validation(format!(
            "{component} must not contain '-': {value}"
        )));
    }
    Ok(value)
}

macro_rules! impl_code {
    ($t:ident, $component:literal, $cleaner:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $t(String);

        impl $t {
            pub fn new(raw: &str) -> DomainResult<Self> {
                Ok(Self($cleaner($component, raw)?))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(&value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl ValueObject for $t {}
    };
}

impl_code!(WarehouseCode, "warehouse code", clean_segment);
impl_code!(DocType, "document type", clean_segment);
impl_code!(ProductCode, "product code", clean);

/// Identity of one ERP document header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HeaderKey {
    warehouse: WarehouseCode,
    doc_type: DocType,
    doc_number: String,
}

impl HeaderKey {
    pub fn new(warehouse: &str, doc_type: &str, doc_number: &str) -> DomainResult<Self> {
        Ok(Self {
            warehouse: WarehouseCode::new(warehouse)?,
            doc_type: DocType::new(doc_type)?,
            doc_number: clean("document number", doc_number)?,
        })
    }

    pub fn warehouse(&self) -> &WarehouseCode {
        &self.warehouse
    }

    pub fn doc_type(&self) -> &DocType {
        &self.doc_type
    }

    pub fn doc_number(&self) -> &str {
        &self.doc_number
    }

    /// Key of line `item` of this header.
    pub fn item(&self, item: u32) -> DetailKey {
        DetailKey {
            header: self.clone(),
            item,
        }
    }

    /// Parse the rendered `{warehouse}-{doc_type}-{doc_number}` form.
    pub fn parse(s: &str) -> DomainResult<Self> {
        let mut parts = s.trim().splitn(3, '-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(wh), Some(dt), Some(num)) => Self::new(wh, dt, num),
            _ => Err(DomainError::validation(format!("malformed header key: {s}"))),
        }
    }
}

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.warehouse, self.doc_type, self.doc_number)
    }
}

impl TryFrom<String> for HeaderKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HeaderKey> for String {
    fn from(value: HeaderKey) -> Self {
        value.to_string()
    }
}

impl ValueObject for HeaderKey {}

/// Identity of one ERP document line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DetailKey {
    header: HeaderKey,
    item: u32,
}

impl DetailKey {
    pub fn new(warehouse: &str, doc_type: &str, doc_number: &str, item: u32) -> DomainResult<Self> {
        Ok(HeaderKey::new(warehouse, doc_type, doc_number)?.item(item))
    }

    pub fn header(&self) -> &HeaderKey {
        &self.header
    }

    pub fn item_number(&self) -> u32 {
        self.item
    }

    /// Parse the rendered `{warehouse}-{doc_type}-{doc_number}-{item}` form.
    pub fn parse(s: &str) -> DomainResult<Self> {
        let (head, item) = s
            .trim()
            .rsplit_once('-')
            .ok_or_else(|| DomainError::validation(format!("malformed detail key: {s}")))?;
        let item = item
            .trim()
            .parse::<u32>()
            .map_err(|e| DomainError::validation(format!("malformed item in {s}: {e}")))?;
        Ok(HeaderKey::parse(head)?.item(item))
    }
}

impl fmt::Display for DetailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.header, self.item)
    }
}

impl TryFrom<String> for DetailKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DetailKey> for String {
    fn from(value: DetailKey) -> Self {
        value.to_string()
    }
}

impl ValueObject for DetailKey {}
