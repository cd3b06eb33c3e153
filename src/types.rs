//! Shared data types: type IDs, quality flags, decoded values, and readings.
//!
//! These mirror the shapes `lib60870-sys::types` exposes at the FFI
//! boundary (`Quality` is a `bitflags!` set for the same reason theirs is),
//! but are redefined locally so they can carry `serde`/`Display` and cover
//! every type ID this crate's exchange table needs to reason about,
//! including the timestamped control-direction range (58–64) that the sys
//! crate's `TypeId` enum does not expose.

use std::sync::Arc;
use std::time::SystemTime;

/// The upstream sink readings are handed to (spec.md §4.7 `register_ingest`).
/// A type alias rather than a trait: every caller just needs `Fn(Reading)`,
/// and a boxed closure is what the teacher's own `Closer`/callback plumbing
/// in `admin.rs` uses for the same kind of one-shot host hook.
pub type IngestCallback = Arc<dyn Fn(Reading) + Send + Sync>;

/// An IEC 60870-5 ASDU type identification, as a plain `u8` newtype.
///
/// Using a newtype instead of a closed enum means `lookup()` can compare
/// type IDs it does not otherwise understand (and reject them) without a
/// fallible conversion at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u8);

#[allow(non_upper_case_globals)]
impl TypeId {
    // Monitoring direction (type id < 41).
    pub const M_SP_NA_1: TypeId = TypeId(1);
    pub const M_DP_NA_1: TypeId = TypeId(3);
    pub const M_ST_NA_1: TypeId = TypeId(5);
    pub const M_ME_NA_1: TypeId = TypeId(9);
    pub const M_ME_NB_1: TypeId = TypeId(11);
    pub const M_ME_NC_1: TypeId = TypeId(13);
    pub const M_ME_ND_1: TypeId = TypeId(21);
    pub const M_SP_TB_1: TypeId = TypeId(30);
    pub const M_DP_TB_1: TypeId = TypeId(31);
    pub const M_ST_TB_1: TypeId = TypeId(32);
    pub const M_BO_TB_1: TypeId = TypeId(33);
    pub const M_ME_TD_1: TypeId = TypeId(34);
    pub const M_ME_TE_1: TypeId = TypeId(35);
    pub const M_ME_TF_1: TypeId = TypeId(36);
    pub const M_IT_TB_1: TypeId = TypeId(37);

    // Control direction, single-phase.
    pub const C_SC_NA_1: TypeId = TypeId(45);
    pub const C_DC_NA_1: TypeId = TypeId(46);
    pub const C_RC_NA_1: TypeId = TypeId(47);
    pub const C_SE_NA_1: TypeId = TypeId(48);
    pub const C_SE_NB_1: TypeId = TypeId(49);
    pub const C_SE_NC_1: TypeId = TypeId(50);
    pub const C_BO_NA_1: TypeId = TypeId(51);

    // Control direction, with CP56Time2a.
    pub const C_SC_TA_1: TypeId = TypeId(58);
    pub const C_DC_TA_1: TypeId = TypeId(59);
    pub const C_RC_TA_1: TypeId = TypeId(60);
    pub const C_SE_TA_1: TypeId = TypeId(61);
    pub const C_SE_TB_1: TypeId = TypeId(62);
    pub const C_SE_TC_1: TypeId = TypeId(63);
    pub const C_BO_TA_1: TypeId = TypeId(64);

    // System.
    pub const M_EI_NA_1: TypeId = TypeId(70);
    pub const C_IC_NA_1: TypeId = TypeId(100);
    pub const C_CS_NA_1: TypeId = TypeId(103);

    /// Monitoring-direction type IDs are < 41 (spec.md GLOSSARY).
    pub fn is_monitoring(self) -> bool {
        self.0 < 41
    }

    /// True for the supported command range, 45..=51 ∪ 58..=64 (spec.md §4.4).
    pub fn is_command(self) -> bool {
        (45..=51).contains(&self.0) || (58..=64).contains(&self.0)
    }

    /// True if this type id's command variant carries a CP56Time2a tag.
    pub fn carries_timestamp(self) -> bool {
        matches!(
            self,
            TypeId::M_SP_TB_1
                | TypeId::M_DP_TB_1
                | TypeId::M_ST_TB_1
                | TypeId::M_BO_TB_1
                | TypeId::M_ME_TD_1
                | TypeId::M_ME_TE_1
                | TypeId::M_ME_TF_1
                | TypeId::M_IT_TB_1
                | TypeId::C_SC_TA_1
                | TypeId::C_DC_TA_1
                | TypeId::C_RC_TA_1
                | TypeId::C_SE_TA_1
                | TypeId::C_SE_TB_1
                | TypeId::C_SE_TC_1
                | TypeId::C_BO_TA_1
        )
    }
}

/// Type-compatibility classes used by `ExchangeTable::lookup` (spec.md §4.1).
///
/// Membership is symmetric and reflexive within a class: any two type IDs
/// in the same class are mutually compatible, and every type ID is
/// compatible with itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityClass {
    SinglePoint,
    DoublePoint,
    StepPosition,
    MeasuredNormalized,
    MeasuredScaled,
    MeasuredShortFloat,
    Command(TypeId, TypeId),
}

impl CompatibilityClass {
    /// Returns the class a monitoring-direction type ID belongs to, or
    /// `None` if it has no defined compatibility class (commands are
    /// compared type-for-type with their timestamped sibling instead, see
    /// `are_compatible`).
    pub fn of(type_id: TypeId) -> Option<CompatibilityClass> {
        use CompatibilityClass::*;
        match type_id {
            TypeId::M_SP_NA_1 | TypeId::M_SP_TB_1 => Some(SinglePoint),
            TypeId::M_DP_NA_1 | TypeId::M_DP_TB_1 => Some(DoublePoint),
            TypeId::M_ST_NA_1 | TypeId::M_ST_TB_1 => Some(StepPosition),
            TypeId::M_ME_NA_1 | TypeId::M_ME_TD_1 | TypeId::M_ME_ND_1 => Some(MeasuredNormalized),
            TypeId::M_ME_NB_1 | TypeId::M_ME_TE_1 => Some(MeasuredScaled),
            TypeId::M_ME_NC_1 | TypeId::M_ME_TF_1 => Some(MeasuredShortFloat),
            _ => None,
        }
    }
}

/// Each command type is compatible with its own timestamped sibling only.
const COMMAND_SIBLINGS: &[(TypeId, TypeId)] = &[
    (TypeId::C_SC_NA_1, TypeId::C_SC_TA_1),
    (TypeId::C_DC_NA_1, TypeId::C_DC_TA_1),
    (TypeId::C_RC_NA_1, TypeId::C_RC_TA_1),
    (TypeId::C_SE_NA_1, TypeId::C_SE_TA_1),
    (TypeId::C_SE_NB_1, TypeId::C_SE_TB_1),
    (TypeId::C_SE_NC_1, TypeId::C_SE_TC_1),
    (TypeId::C_BO_NA_1, TypeId::C_BO_TA_1),
];

/// True when `received` may satisfy a point whose exchange table entry
/// expects `expected` (spec.md §4.1). Reflexive and symmetric.
pub fn are_compatible(expected: TypeId, received: TypeId) -> bool {
    if expected == received {
        return true;
    }
    if let (Some(a), Some(b)) = (CompatibilityClass::of(expected), CompatibilityClass::of(received)) {
        return a == b;
    }
    COMMAND_SIBLINGS
        .iter()
        .any(|&(n, t)| (expected == n && received == t) || (expected == t && received == n))
}

bitflags::bitflags! {
    /// Quality descriptor flags carried by a decoded information object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Quality: u8 {
        const INVALID     = 0b0000_0001; // iv
        const NOT_TOPICAL = 0b0000_0010; // nt
        const SUBSTITUTED = 0b0000_0100; // sb
        const BLOCKED     = 0b0000_1000; // bl
        const OVERFLOW    = 0b0001_0000; // ov
    }
}

/// A polymorphic decoded data-point value (spec.md §9 design note).
///
/// A dedicated `StepPos`/`StringTuple` variant keeps the wire/label-
/// compatible `"[pos,transient]"` rendering out of the hot decode path —
/// it's only formatted when a `Reading` is turned into a label string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    StepPos(i8, bool),
    BitString32(u32),
    StringTuple(String),
}

impl Value {
    /// Renders a step-position value as the legacy `"[pos,transient]"` form
    /// preserved for wire/label compatibility (spec.md §9).
    pub fn step_pos_string(pos: i8, transient: bool) -> Value {
        Value::StringTuple(format!("[{},{}]", pos, transient))
    }
}

/// A CP56Time2a time tag, decoded to its component parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeTag {
    pub at: SystemTimeMillis,
    pub invalid: bool,
    pub summer_time: bool,
    pub substituted: bool,
}

/// Milliseconds since the Unix epoch, wrapped so `TimeTag` stays `Copy`
/// (`SystemTime` is not meaningfully `Copy`-cheap across platforms but a
/// millisecond count is).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SystemTimeMillis(pub u64);

impl SystemTimeMillis {
    pub fn now() -> SystemTimeMillis {
        let d = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        SystemTimeMillis(d.as_millis() as u64)
    }
}

/// A single reading emitted upward through the registered ingest callback
/// (spec.md §3). One `Reading` corresponds to one decoded information
/// object (or one synthetic quality-only datapoint from the quality
/// projector).
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub label: String,
    pub do_type: TypeId,
    pub do_ca: u16,
    pub do_oa: u8,
    pub do_ioa: u32,
    pub do_cot: u8,
    pub do_test: bool,
    pub do_negative: bool,
    pub do_value: Value,
    pub do_quality: Quality,
    pub do_ts: Option<TimeTag>,
    /// The BCR sequence number riding alongside an integrated-totals value.
    /// `None` for every other type (SPEC_FULL.md §4.4 supplement).
    pub do_value_seq: Option<u8>,
}

impl Reading {
    pub fn is_invalid(&self) -> bool {
        self.do_quality.contains(Quality::INVALID)
    }

    /// Builds a synthetic, quality-only reading as emitted by the quality
    /// projector: no originator, no command-direction semantics, no value.
    pub fn synthetic(label: String, do_type: TypeId, do_ca: u16, do_ioa: u32, do_quality: Quality) -> Reading {
        Reading {
            label,
            do_type,
            do_ca,
            do_oa: 0,
            do_ioa,
            do_cot: cot::SPONTANEOUS,
            do_test: false,
            do_negative: false,
            do_value: Value::Bool(false),
            do_quality,
            do_ts: None,
            do_value_seq: None,
        }
    }
}

/// Cause-of-transmission values this crate reasons about directly; the
/// remainder pass through as a raw `u8` on `Reading::do_cot`.
pub mod cot {
    pub const SPONTANEOUS: u8 = 3;
    pub const INTERROGATED_BY_STATION: u8 = 20;
    pub const ACTIVATION: u8 = 6;
    pub const ACTIVATION_CON: u8 = 7;
    pub const ACTIVATION_TERMINATION: u8 = 10;
    pub const UNKNOWN_TYPE_ID: u8 = 44;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_is_reflexive_and_symmetric() {
        assert!(are_compatible(TypeId::M_SP_NA_1, TypeId::M_SP_NA_1));
        assert!(are_compatible(TypeId::M_SP_NA_1, TypeId::M_SP_TB_1));
        assert!(are_compatible(TypeId::M_SP_TB_1, TypeId::M_SP_NA_1));
        assert!(!are_compatible(TypeId::M_SP_NA_1, TypeId::M_DP_NA_1));
    }

    #[test]
    fn command_siblings_compatible_only_with_each_other() {
        assert!(are_compatible(TypeId::C_SC_NA_1, TypeId::C_SC_TA_1));
        assert!(!are_compatible(TypeId::C_SC_NA_1, TypeId::C_DC_TA_1));
    }

    #[test]
    fn step_pos_renders_legacy_string() {
        let v = Value::step_pos_string(5, true);
        assert_eq!(v, Value::StringTuple("[5,true]".to_string()));
    }

    #[test]
    fn monitoring_direction_is_type_id_below_41() {
        assert!(TypeId::M_IT_TB_1.is_monitoring());
        assert!(TypeId(40).is_monitoring());
        assert!(!TypeId(41).is_monitoring());
    }
}
