//! End-to-end scenarios driving the public API the same way the south-service
//! host does: build an `Endpoint` (or a full `Supervisor`) over a mock
//! transport, push wire events at it, and assert on what comes out of the
//! ingest callback. These correspond to spec.md §8's literal scenarios.

mod mocks;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use iec104_client_connector::codec::{DecodedAsdu, DecodedObject, TransportEvent, WireCommand};
use iec104_client_connector::commands::CommandsRegistry;
use iec104_client_connector::config::{ApplicationConfig, EndpointSpec};
use iec104_client_connector::endpoint::{Endpoint, GiStatus, State};
use iec104_client_connector::exchange::{DataPoint, ExchangeTable, STATION_GROUP_BIT};
use iec104_client_connector::redundancy::Supervisor;
use iec104_client_connector::types::{cot, IngestCallback, Quality, Reading, TypeId, Value};

use mocks::mock_transport::MockTransportFactory;

const TICK: Duration = Duration::from_millis(150);

fn recording_ingest() -> (IngestCallback, Arc<Mutex<Vec<Reading>>>) {
    let sink: Arc<Mutex<Vec<Reading>>> = Arc::new(Mutex::new(Vec::new()));
    let sink2 = sink.clone();
    let ingest: IngestCallback = Arc::new(move |r| sink2.lock().unwrap().push(r));
    (ingest, sink)
}

fn endpoint_spec() -> EndpointSpec {
    EndpointSpec {
        server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        tcp_port: 2404,
        client_bind_ip: None,
        autoconnect: true,
        autostart: false,
    }
}

/// An application config with time sync disabled (so the GI cycle starts
/// immediately on activation) and no command-parallelism cap, unless a test
/// overrides individual fields on the returned value.
fn app_config() -> ApplicationConfig {
    ApplicationConfig {
        orig_addr: 0,
        ca_asdu_size: 2,
        ioaddr_size: 3,
        asdu_size: 0,
        time_sync: 0,
        gi_enabled: true,
        gi_all_ca: false,
        gi_time: 10,
        gi_cycle: 0,
        gi_repeat_count: 0,
        cmd_parallel: 0,
        cmd_exec_timeout: Duration::from_secs(10),
        default_ca: 41025,
        time_sync_ca: None,
    }
}

fn three_measurements_table() -> ExchangeTable {
    ExchangeTable::build(vec![
        DataPoint {
            common_address: 41025,
            info_object_address: 100,
            label: "TM-100".into(),
            expected_type_id: TypeId::M_ME_NB_1,
            gi_group_mask: STATION_GROUP_BIT,
            triggers_gi_on_value_zero: false,
        },
        DataPoint {
            common_address: 41025,
            info_object_address: 101,
            label: "TM-101".into(),
            expected_type_id: TypeId::M_ME_NB_1,
            gi_group_mask: STATION_GROUP_BIT,
            triggers_gi_on_value_zero: false,
        },
        DataPoint {
            common_address: 41025,
            info_object_address: 102,
            label: "TM-102".into(),
            expected_type_id: TypeId::M_ME_NB_1,
            gi_group_mask: STATION_GROUP_BIT,
            triggers_gi_on_value_zero: false,
        },
    ])
}

#[allow(clippy::too_many_arguments)]
fn spawn_endpoint(
    app: ApplicationConfig,
    exchange: ExchangeTable,
    cmd_parallel: usize,
) -> (Arc<Endpoint>, MockTransportFactory, Arc<Mutex<Vec<Reading>>>) {
    let (ingest, sink) = recording_ingest();
    let factory = MockTransportFactory::new();
    let factory_handle = factory.clone();
    let commands = Arc::new(CommandsRegistry::new(cmd_parallel, Duration::from_secs(10)));
    let ep = Endpoint::new(
        endpoint_spec(),
        'A',
        "RG1-A".into(),
        Arc::new(app),
        Arc::new(exchange),
        commands,
        ingest,
        factory_handle.factory(),
    );
    ep.spawn();
    (ep, factory, sink)
}

fn monitoring_asdu(cot: u8, objects: Vec<DecodedObject>) -> DecodedAsdu {
    DecodedAsdu {
        type_id: TypeId::M_ME_NB_1,
        cot,
        ca: 41025,
        originator_address: 0,
        is_test: false,
        is_negative: false,
        objects,
    }
}

fn interrogation_asdu(cot: u8, negative: bool) -> DecodedAsdu {
    DecodedAsdu {
        type_id: TypeId::C_IC_NA_1,
        cot,
        ca: 41025,
        originator_address: 0,
        is_test: false,
        is_negative: negative,
        objects: vec![],
    }
}

// -- Scenario 1: general interrogation succeeds -----------------------------

#[test]
fn gi_cycle_delivers_three_readings_and_finishes() {
    let (ep, transport, sink) = spawn_endpoint(app_config(), three_measurements_table(), 0);

    ep.request_connect();
    thread::sleep(TICK);
    assert_eq!(ep.state(), State::ConnectedInactive);

    ep.request_activate();
    thread::sleep(TICK);
    assert_eq!(ep.state(), State::ConnectedActive);
    assert_eq!(ep.gi_status(), GiStatus::Started);

    transport.push_event(TransportEvent::AsduReceived(monitoring_asdu(
        cot::INTERROGATED_BY_STATION,
        vec![
            DecodedObject {
                ioa: 100,
                value: Value::Int(-1),
                quality: Quality::empty(),
                ts: None,
            },
            DecodedObject {
                ioa: 101,
                value: Value::Int(23),
                quality: Quality::empty(),
                ts: None,
            },
            DecodedObject {
                ioa: 102,
                value: Value::Int(2300),
                quality: Quality::empty(),
                ts: None,
            },
        ],
    )));
    thread::sleep(TICK);

    transport.push_event(TransportEvent::AsduReceived(interrogation_asdu(cot::ACTIVATION_CON, false)));
    thread::sleep(TICK);
    assert_eq!(ep.gi_status(), GiStatus::InProgress);

    transport.push_event(TransportEvent::AsduReceived(interrogation_asdu(
        cot::ACTIVATION_TERMINATION,
        false,
    )));
    thread::sleep(TICK);
    assert_eq!(ep.gi_status(), GiStatus::Finished);

    ep.stop();
    thread::sleep(TICK);

    let readings = sink.lock().unwrap();
    let values: Vec<_> = readings
        .iter()
        .filter(|r| r.do_cot == cot::INTERROGATED_BY_STATION)
        .map(|r| (r.do_ioa, r.do_value.clone()))
        .collect();
    assert_eq!(values.len(), 3);
    assert!(values.contains(&(100, Value::Int(-1))));
    assert!(values.contains(&(101, Value::Int(23))));
    assert!(values.contains(&(102, Value::Int(2300))));
}

// -- Scenario 2: connection lost mid-GI degrades quality after 500 ms -------

#[test]
fn connection_loss_during_gi_projects_invalid_quality_after_delay() {
    let (ep, transport, sink) = spawn_endpoint(app_config(), three_measurements_table(), 0);

    ep.request_connect();
    thread::sleep(TICK);
    ep.request_activate();
    thread::sleep(TICK);
    assert_eq!(ep.gi_status(), GiStatus::Started);

    // Only one of the three points answers before the link drops.
    transport.push_event(TransportEvent::AsduReceived(monitoring_asdu(
        cot::INTERROGATED_BY_STATION,
        vec![DecodedObject {
            ioa: 100,
            value: Value::Int(5),
            quality: Quality::empty(),
            ts: None,
        }],
    )));
    thread::sleep(TICK);

    transport.push_event(TransportEvent::Closed);
    thread::sleep(TICK);
    assert_eq!(ep.state(), State::WaitForReconnect);

    // The 500 ms delayed NOT_TOPICAL broadcast is the redundancy
    // supervisor's responsibility, not a single endpoint's; see
    // `supervisor_degrades_quality_500ms_after_active_endpoint_drops`.
    ep.stop();
    thread::sleep(TICK);

    let readings = sink.lock().unwrap();
    assert!(readings.iter().any(|r| r.do_ioa == 100 && r.do_value == Value::Int(5)));
}

#[test]
fn supervisor_degrades_quality_500ms_after_active_endpoint_drops() {
    let (ingest, sink) = recording_ingest();
    let factory = MockTransportFactory::new();
    let commands = Arc::new(CommandsRegistry::new(0, Duration::from_secs(10)));
    let exchange = Arc::new(three_measurements_table());
    let ep = Endpoint::new(
        endpoint_spec(),
        'A',
        "RG1-A".into(),
        Arc::new(app_config()),
        exchange.clone(),
        commands.clone(),
        ingest.clone(),
        factory.factory(),
    );

    let supervisor = Supervisor::new(vec![ep], commands, exchange, ingest, "iec104".into());
    supervisor.start();

    // Supervisor elects and activates the only endpoint.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(supervisor.status_event().connx_status, "connected");

    // Drop the link.
    factory.push_event(TransportEvent::Closed);

    // Immediately after the drop, quality has not yet degraded.
    thread::sleep(Duration::from_millis(150));
    assert!(!sink
        .lock()
        .unwrap()
        .iter()
        .any(|r| r.do_quality.contains(Quality::NOT_TOPICAL)));

    // Past the 500 ms grace period, every station-group point is degraded.
    thread::sleep(Duration::from_millis(600));
    let degraded = sink
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.do_quality.contains(Quality::NOT_TOPICAL))
        .count();
    assert_eq!(degraded, 3);

    supervisor.stop();
}

// -- Scenario 4: command parallelism cap -------------------------------------

#[test]
fn second_command_is_rejected_when_parallelism_cap_is_one() {
    let (ep, transport, _sink) = spawn_endpoint(app_config(), three_measurements_table(), 1);

    ep.request_connect();
    thread::sleep(TICK);
    ep.request_activate();
    thread::sleep(TICK);
    assert_eq!(ep.state(), State::ConnectedActive);

    let first = ep.send_command(WireCommand::Single {
        ca: 41025,
        ioa: 2000,
        value: true,
        select: false,
        with_time: false,
    });
    assert!(first, "first command should be admitted");

    let second = ep.send_command(WireCommand::Single {
        ca: 41025,
        ioa: 2001,
        value: true,
        select: false,
        with_time: false,
    });
    assert!(!second, "second command should be rejected by the parallelism cap");

    assert_eq!(transport.commands_sent().len(), 1);
    ep.stop();
}

// -- Scenario 5: status request before any connection ------------------------

#[test]
fn status_request_before_start_reports_not_connected_idle() {
    let (ingest, sink) = recording_ingest();
    let factory = MockTransportFactory::new();
    let commands = Arc::new(CommandsRegistry::new(0, Duration::from_secs(10)));
    let exchange = Arc::new(three_measurements_table());
    let ep = Endpoint::new(
        endpoint_spec(),
        'A',
        "RG1-A".into(),
        Arc::new(app_config()),
        exchange.clone(),
        commands.clone(),
        ingest.clone(),
        factory.factory(),
    );
    let supervisor = Supervisor::new(vec![ep], commands, exchange, ingest, "iec104".into());

    supervisor.emit_status_now();

    let readings = sink.lock().unwrap();
    assert_eq!(readings.len(), 1);
    assert!(readings[0].do_value == Value::StringTuple(
        "{\"connx_status\":\"not connected\",\"gi_status\":\"idle\"}".into()
    ));
}

// -- Scenario 6: spontaneous value triggers a fresh GI -----------------------

#[test]
fn spontaneous_single_point_false_requests_a_new_gi() {
    let table = ExchangeTable::build(vec![DataPoint {
        common_address: 41025,
        info_object_address: 2000,
        label: "TS-1".into(),
        expected_type_id: TypeId::M_SP_NA_1,
        gi_group_mask: STATION_GROUP_BIT,
        triggers_gi_on_value_zero: true,
    }]);
    let (ep, transport, _sink) = spawn_endpoint(app_config(), table, 0);

    ep.request_connect();
    thread::sleep(TICK);
    ep.request_activate();
    thread::sleep(TICK);

    // Let the first (automatic) GI cycle finish so the point is no longer
    // in-progress when the spontaneous value arrives.
    transport.push_event(TransportEvent::AsduReceived(interrogation_asdu(cot::ACTIVATION_CON, false)));
    thread::sleep(TICK);
    transport.push_event(TransportEvent::AsduReceived(interrogation_asdu(
        cot::ACTIVATION_TERMINATION,
        false,
    )));
    thread::sleep(TICK);
    assert_eq!(ep.gi_status(), GiStatus::Finished);

    let spontaneous = DecodedAsdu {
        type_id: TypeId::M_SP_NA_1,
        cot: cot::SPONTANEOUS,
        ca: 41025,
        originator_address: 0,
        is_test: false,
        is_negative: false,
        objects: vec![DecodedObject {
            ioa: 2000,
            value: Value::Bool(false),
            quality: Quality::empty(),
            ts: None,
        }],
    };
    transport.push_event(TransportEvent::AsduReceived(spontaneous));
    thread::sleep(TICK);

    assert!(ep.has_gi_requested());
    ep.stop();
}

// -- Scenario 3: reconnect after the slave comes back back -----------------

#[test]
fn supervisor_reconnects_and_restarts_gi_once_slave_returns() {
    let (ingest, sink) = recording_ingest();
    let factory = MockTransportFactory::new();
    let commands = Arc::new(CommandsRegistry::new(0, Duration::from_secs(10)));
    let exchange = Arc::new(three_measurements_table());
    let ep = Endpoint::new(
        endpoint_spec(),
        'A',
        "RG1-A".into(),
        Arc::new(app_config()),
        exchange.clone(),
        commands.clone(),
        ingest.clone(),
        factory.factory(),
    );

    let supervisor = Supervisor::new(vec![ep], commands, exchange, ingest, "iec104".into());
    supervisor.start();

    thread::sleep(Duration::from_millis(300));
    assert_eq!(supervisor.status_event().connx_status, "connected");

    // Kill the slave: the endpoint drops into `WaitForReconnect` for 10 s,
    // then sits `Idle` until the supervisor's 5 s backup cascade reconnects
    // it. Total worst-case wait is the sum of both timers plus headroom.
    factory.push_event(TransportEvent::Closed);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(supervisor.status_event().connx_status, "not connected");

    // Worst case: 10 s `WaitForReconnect` delay plus up to 5 s until the
    // next backup-cascade tick reconnects the now-idle endpoint.
    thread::sleep(Duration::from_secs(17));
    assert_eq!(supervisor.status_event().connx_status, "connected");

    supervisor.stop();
    drop(sink);
}
