//! C6: the quality projector — synthesizes substitute readings when the real
//! thing can't be had (spec.md §4.6).
//!
//! Stateless by design: every entry point here takes the exchange table and
//! ingest callback it needs and emits directly, rather than owning timers
//! itself. The 500 ms connection-loss delay is the caller's (the redundancy
//! supervisor's) responsibility to schedule — this module only knows how to
//! build and flush the synthetic readings once that moment arrives,
//! mirroring how the teacher keeps `Driver` (the mechanism) separate from
//! whatever schedules its polls.

use crate::exchange::ExchangeTable;
use crate::types::{IngestCallback, Quality, Reading};

/// Marks every monitoring-direction point **INVALID**. Fired once, on the
/// redundancy supervisor's first start (spec.md §4.6).
pub fn mark_all_invalid(table: &ExchangeTable, ingest: &IngestCallback) {
    emit_for_all_monitoring_points(table, ingest, Quality::INVALID);
}

/// Marks every monitoring-direction point **NON_TOPICAL**, 500 ms after the
/// active endpoint is lost (spec.md §4.6). Single-shot per disconnect
/// episode; the caller is responsible for only invoking this once per loss.
pub fn mark_all_non_topical(table: &ExchangeTable, ingest: &IngestCallback) {
    emit_for_all_monitoring_points(table, ingest, Quality::NOT_TOPICAL);
}

fn emit_for_all_monitoring_points(table: &ExchangeTable, ingest: &IngestCallback, quality: Quality) {
    for group in 0..16 {
        for point in table.list_by_gi_group(group) {
            if !point.expected_type_id.is_monitoring() {
                continue;
            }
            // `list_by_gi_group` only returns group members; avoid emitting
            // the same point once per group it belongs to.
            if group != lowest_group(point.gi_group_mask) {
                continue;
            }
            ingest(Reading::synthetic(
                point.label.clone(),
                point.expected_type_id,
                point.common_address,
                point.info_object_address,
                quality,
            ));
        }
    }
}

fn lowest_group(mask: u16) -> u16 {
    if mask == 0 {
        0
    } else {
        mask.trailing_zeros() as u16
    }
}

/// Marks **INVALID** every still-missing station-group point on GI
/// failure/timeout (spec.md §4.4/§4.6). `received` holds the `(ca, ioa)`
/// pairs the current GI cycle has already seen.
pub fn mark_missing_station_group_invalid(
    table: &ExchangeTable,
    ingest: &IngestCallback,
    received: &std::collections::HashSet<(u16, u32)>,
) {
    for point in table.list_by_gi_group(0) {
        if received.contains(&(point.common_address, point.info_object_address)) {
            continue;
        }
        ingest(Reading::synthetic(
            point.label.clone(),
            point.expected_type_id,
            point.common_address,
            point.info_object_address,
            Quality::INVALID,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{DataPoint, STATION_GROUP_BIT};
    use crate::types::TypeId;
    use std::sync::{Arc, Mutex};

    fn table() -> ExchangeTable {
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

    fn recording_ingest() -> (IngestCallback, Arc<Mutex<Vec<Reading>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let recorded = sink.clone();
        let cb: IngestCallback = Arc::new(move |r: Reading| recorded.lock().unwrap().push(r));
        (cb, sink)
    }

    #[test]
    fn mark_all_invalid_hits_every_monitoring_point_once() {
        let t = table();
        let (cb, sink) = recording_ingest();
        mark_all_invalid(&t, &cb);
        let readings = sink.lock().unwrap();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.is_invalid()));
    }

    #[test]
    fn missing_station_group_points_only_flag_unreceived() {
        let t = table();
        let (cb, sink) = recording_ingest();
        let mut received = std::collections::HashSet::new();
        received.insert((41025u16, 100u32));
        mark_missing_station_group_invalid(&t, &cb, &received);
        let readings = sink.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].label, "TS-1");
    }
}
