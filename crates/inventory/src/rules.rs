//! Document-class rules.
//!
//! Everything that decides *whether* and *how* an ERP document becomes stock
//! movement lives here, as data: the relevant document types, the exclusion
//! triples, the conventional direction of each document type, the active
//! status set and the series-to-warehouse table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::legacy::LegacyHeader;

/// Status code of an annulled header.
pub const VOID_STATUS: &str = "A";

/// Product code marking a free-text line.
pub const TEXT_SENTINEL: &str = "TEXTO";

/// Movement subtype of inter-warehouse transfers.
pub const TRANSFER_SUBTYPE: &str = "TD";

/// Document type of freight invoices.
pub const FREIGHT_DOC_TYPE: &str = "FT";

static SERIES_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]+([0-9]{3})").expect("series pattern is valid"));

/// A `(doc_type, movement_subtype, status?)` triple whose documents are ignored
/// entirely: neither emitted nor treated as void.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub doc_type: String,
    pub movement_subtype: String,
    /// `None` matches any status.
    #[serde(default)]
    pub status: Option<String>,
}

impl ExclusionRule {
    pub fn new(doc_type: &str, movement_subtype: &str, status: Option<&str>) -> Self {
        Self {
            doc_type: doc_type.to_string(),
            movement_subtype: movement_subtype.to_string(),
            status: status.map(str::to_string),
        }
    }

    pub fn matches(&self, header: &LegacyHeader) -> bool {
        header.key.doc_type().as_str() == self.doc_type
            && header.movement_subtype.as_deref().map(str::trim) == Some(self.movement_subtype.as_str())
            && self
                .status
                .as_deref()
                .is_none_or(|s| header.status.trim() == s)
    }
}

/// Direction of a movement. Quantities are always stored positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_inbound(self) -> bool {
        matches!(self, Direction::Inbound)
    }
}

/// The configurable rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentRules {
    /// Document types copied from the ERP.
    pub relevant_doc_types: BTreeSet<String>,
    /// Document types that are inbound when the header carries no flag.
    pub inbound_doc_types: BTreeSet<String>,
    pub exclusions: Vec<ExclusionRule>,
    /// Statuses counted by stock. `A` is never active.
    pub active_statuses: BTreeSet<String>,
    /// Numeric series of a reference document -> warehouse code.
    pub series_warehouses: BTreeMap<String, String>,
}

impl Default for DocumentRules {
    fn default() -> Self {
        Self {
            relevant_doc_types: ["NI", "GS", "TR", "TK", "NS", "BV", "NC", "FT"]
                .into_iter()
                .map(String::from)
                .collect(),
            inbound_doc_types: ["NI", "NC"].into_iter().map(String::from).collect(),
            exclusions: vec![
                ExclusionRule::new("GS", "GF", Some("F")),
                ExclusionRule::new("NS", "AJ", None),
            ],
            active_statuses: ["F", "V", "P"].into_iter().map(String::from).collect(),
            series_warehouses: [("001", "AL"), ("002", "AA"), ("003", "AD")]
                .into_iter()
                .map(|(s, w)| (s.to_string(), w.to_string()))
                .collect(),
        }
    }
}

impl DocumentRules {
    pub fn doc_types(&self) -> Vec<String> {
        self.relevant_doc_types.iter().cloned().collect()
    }

    pub fn is_relevant(&self, header: &LegacyHeader) -> bool {
        self.relevant_doc_types.contains(header.key.doc_type().as_str())
    }

    pub fn is_void(&self, header: &LegacyHeader) -> bool {
        is_void_status(&header.status)
    }

    pub fn is_excluded(&self, header: &LegacyHeader) -> bool {
        self.exclusions.iter().any(|rule| rule.matches(header))
    }

    pub fn is_active(&self, status: &str) -> bool {
        let status = status.trim();
        !is_void_status(status) && self.active_statuses.contains(status)
    }

    pub fn is_transfer(&self, header: &LegacyHeader) -> bool {
        header.movement_subtype.as_deref().map(str::trim) == Some(TRANSFER_SUBTYPE)
    }

    /// Interpreted direction of every line of `header`.
    ///
    /// Transfers follow the flag strictly (`I` inbound, anything else outbound).
    /// Other classes use the flag when present and fall back to the
    /// conventional direction of the document type.
    pub fn direction(&self, header: &LegacyHeader) -> Direction {
        let flag = header
            .direction_flag
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());

        if self.is_transfer(header) {
            return match flag {
                Some(f) if f.eq_ignore_ascii_case("I") => Direction::Inbound,
                _ => Direction::Outbound,
            };
        }

        match flag {
            Some(f) if f.eq_ignore_ascii_case("I") => Direction::Inbound,
            Some(f) if f.eq_ignore_ascii_case("S") => Direction::Outbound,
            _ if self.inbound_doc_types.contains(header.key.doc_type().as_str()) => {
                Direction::Inbound
            }
            _ => Direction::Outbound,
        }
    }

    /// Warehouse code mapped from the numeric series of a reference number
    /// such as `F001-000123`.
    pub fn series_warehouse(&self, reference_number: &str) -> Option<&str> {
        let normalized = reference_number.trim().to_ascii_uppercase();
        let series = SERIES_PATTERN.captures(&normalized)?.get(1)?.as_str().to_string();
        self.series_warehouses.get(&series).map(String::as_str)
    }

    /// Warehouse credited for reporting purposes (billing site) of a posted
    /// sales dispatch (`GS` / `GV` / `F`).
    pub fn reporting_warehouse(&self, header: &LegacyHeader) -> Option<&str> {
        let is_sales_dispatch = header.key.doc_type().as_str() == "GS"
            && header.movement_subtype.as_deref().map(str::trim) == Some("GV")
            && header.status.trim() == "F";
        if !is_sales_dispatch {
            return None;
        }
        self.series_warehouse(header.reference_number.as_deref()?)
    }
}

pub fn is_void_status(status: &str) -> bool {
    status.trim() == VOID_STATUS
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kardex_core::HeaderKey;

    fn header(doc_type: &str, subtype: Option<&str>, flag: Option<&str>, status: &str) -> LegacyHeader {
        let date = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        let mut h = LegacyHeader::new(HeaderKey::new("AL", doc_type, "000001").unwrap(), date, status);
        h.movement_subtype = subtype.map(String::from);
        h.direction_flag = flag.map(String::from);
        h
    }

    #[test]
    fn known_exclusions() {
        let rules = DocumentRules::default();
        assert!(rules.is_excluded(&header("GS", Some("GF"), Some("S"), "F")));
        assert!(!rules.is_excluded(&header("GS", Some("GF"), Some("S"), "V")));
        assert!(rules.is_excluded(&header("NS", Some("AJ"), Some("S"), "F")));
        assert!(rules.is_excluded(&header("NS", Some("AJ"), Some("S"), "V")));
        assert!(!rules.is_excluded(&header("NS", Some("VT"), Some("S"), "F")));
    }

    #[test]
    fn transfer_direction_follows_flag_only() {
        let rules = DocumentRules::default();
        assert_eq!(rules.direction(&header("NI", Some("TD"), Some("I"), "F")), Direction::Inbound);
        assert_eq!(rules.direction(&header("NI", Some("TD"), None, "F")), Direction::Outbound);
        assert_eq!(rules.direction(&header("GS", Some("TD"), Some("S"), "F")), Direction::Outbound);
    }

    #[test]
    fn other_classes_prefer_flag_then_doc_type() {
        let rules = DocumentRules::default();
        assert_eq!(rules.direction(&header("GS", None, Some("I"), "F")), Direction::Inbound);
        assert_eq!(rules.direction(&header("NI", None, None, "F")), Direction::Inbound);
        assert_eq!(rules.direction(&header("NC", None, Some(" "), "F")), Direction::Inbound);
        assert_eq!(rules.direction(&header("BV", None, None, "F")), Direction::Outbound);
    }

    #[test]
    fn void_is_never_active() {
        let mut rules = DocumentRules::default();
        rules.active_statuses.insert("A".into());
        assert!(!rules.is_active("A"));
        assert!(rules.is_active(" F "));
        assert!(!rules.is_active("X"));
    }

    #[test]
    fn series_maps_to_warehouse() {
        let rules = DocumentRules::default();
        assert_eq!(rules.series_warehouse("F002-0001234"), Some("AA"));
        assert_eq!(rules.series_warehouse("b003-1"), Some("AD"));
        assert_eq!(rules.series_warehouse("F009-1"), None);
        assert_eq!(rules.series_warehouse("0010001"), None);
    }

    #[test]
    fn reporting_warehouse_only_for_posted_sales_dispatch() {
        let rules = DocumentRules::default();
        let mut h = header("GS", Some("GV"), Some("S"), "F");
        h.reference_number = Some("F001-00001".into());
        assert_eq!(rules.reporting_warehouse(&h), Some("AL"));

        h.status = "P".into();
        assert_eq!(rules.reporting_warehouse(&h), None);
    }

    #[test]
    fn rules_deserialize_with_partial_overrides() {
        let rules: DocumentRules =
            serde_json::from_value(serde_json::json!({"active_statuses": ["F"]})).unwrap();
        assert!(rules.is_active("F"));
        assert!(!rules.is_active("V"));
        assert_eq!(rules.exclusions.len(), 2);
    }
}
