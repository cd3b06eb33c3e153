//! C1: the exchange table — a static map from `(CA, IOA)` to the datapoint
//! that owns it, with a type-compatibility matcher.
//!
//! Grounded on the teacher's `balancer::Endpoints` (an `OrderMap` keyed by
//! address, built once and handed out as shared immutable state): this
//! table is built once by [`config`](crate::config) and never mutated after
//! `start()`, so `lookup` takes `&self` and needs no lock (spec.md §5:
//! "Exchange table ... read-only after start(); no lock needed").

use std::collections::HashMap;

use crate::types::{are_compatible, TypeId};

/// A bit in `gi_group_mask`; bit 0 is the station group (spec.md GLOSSARY).
pub const STATION_GROUP_BIT: u16 = 0b1;

/// A single configured exchange point.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub common_address: u16,
    pub info_object_address: u32,
    pub label: String,
    pub expected_type_id: TypeId,
    pub gi_group_mask: u16,
    pub triggers_gi_on_value_zero: bool,
}

impl DataPoint {
    pub fn is_station_group_member(&self) -> bool {
        self.gi_group_mask & STATION_GROUP_BIT != 0
    }

    pub fn is_gi_group_member(&self, group: u16) -> bool {
        self.gi_group_mask & (1 << group) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    ca: u16,
    ioa: u32,
}

/// The static, immutable `(CA, IOA) -> DataPoint` map.
#[derive(Debug, Default)]
pub struct ExchangeTable {
    by_address: HashMap<Key, DataPoint>,
    by_label: HashMap<String, Key>,
}

impl ExchangeTable {
    /// Builds a table from already-validated datapoints.
    ///
    /// # Panics
    /// Never: uniqueness is validated by the config loader before this is
    /// called (spec.md §3 invariant: `(CA, IOA)` and `label` are each
    /// unique). `build` trusts that invariant rather than re-validating it.
    pub fn build(points: Vec<DataPoint>) -> ExchangeTable {
        let mut by_address = HashMap::with_capacity(points.len());
        let mut by_label = HashMap::with_capacity(points.len());
        for p in points {
            let key = Key {
                ca: p.common_address,
                ioa: p.info_object_address,
            };
            by_label.insert(p.label.clone(), key);
            by_address.insert(key, p);
        }
        ExchangeTable {
            by_address,
            by_label,
        }
    }

    /// Returns the point at `(ca, ioa)` only if `received_type_id` is
    /// type-compatible with the point's `expected_type_id` (spec.md §4.1).
    /// A type mismatch is a structured miss, not a panic: the caller is
    /// expected to log a warning and continue.
    pub fn lookup(&self, ca: u16, ioa: u32, received_type_id: TypeId) -> Option<&DataPoint> {
        let point = self.by_address.get(&Key { ca, ioa })?;
        if are_compatible(point.expected_type_id, received_type_id) {
            Some(point)
        } else {
            None
        }
    }

    pub fn lookup_by_label(&self, label: &str) -> Option<&DataPoint> {
        let key = self.by_label.get(label)?;
        self.by_address.get(key)
    }

    /// All points belonging to `group` (0 = station group), in declaration
    /// order relative to each other (iteration order of the backing map is
    /// not declaration order, but callers only use this to build pending
    /// sets, which are order-independent).
    pub fn list_by_gi_group(&self, group: u16) -> Vec<&DataPoint> {
        self.by_address
            .values()
            .filter(|p| p.is_gi_group_member(group))
            .collect()
    }

    pub fn is_gi_trigger_point(&self, ca: u16, ioa: u32) -> bool {
        self.by_address
            .get(&Key { ca, ioa })
            .map(|p| p.triggers_gi_on_value_zero)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExchangeTable {
        ExchangeTable::build(vec![
            DataPoint {
                common_address: 41025,
                info_object_address: 100,
                label: "TM-1".into(),
                expected_type_id: TypeId::M_ME_NB_1,
                gi_group_mask: STATION_GROUP_BIT,
                triggers_gi_on_value_zero: false,
            },
            DataPoint {
                common_address: 41025,
                info_object_address: 2000,
                label: "TS-1".into(),
                expected_type_id: TypeId::M_SP_NA_1,
                gi_group_mask: STATION_GROUP_BIT,
                triggers_gi_on_value_zero: true,
            },
        ])
    }

    #[test]
    fn lookup_matches_compatible_type() {
        let t = sample();
        let p = t.lookup(41025, 100, TypeId::M_ME_TE_1).expect("compatible match");
        assert_eq!(p.label, "TM-1");
    }

    #[test]
    fn lookup_rejects_incompatible_type() {
        let t = sample();
        assert!(t.lookup(41025, 100, TypeId::M_SP_NA_1).is_none());
    }

    #[test]
    fn lookup_by_label_roundtrips() {
        let t = sample();
        let p = t.lookup_by_label("TS-1").unwrap();
        assert_eq!(p.info_object_address, 2000);
    }

    #[test]
    fn gi_trigger_flag_is_point_specific() {
        let t = sample();
        assert!(t.is_gi_trigger_point(41025, 2000));
        assert!(!t.is_gi_trigger_point(41025, 100));
    }

    #[test]
    fn station_group_listing_includes_both_points() {
        let t = sample();
        assert_eq!(t.list_by_gi_group(0).len(), 2);
    }
}
