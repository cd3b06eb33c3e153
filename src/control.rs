//! C7: the control surface (spec.md §4.7) — the only API the external
//! south-service host calls: `set_config`, `start`, `stop`,
//! `register_ingest`, and the `operation` entrypoint for commands and
//! status queries.
//!
//! Grounded on the teacher's top-level `App`/`Loader` split in `app.rs` —
//! a thin public object that resolves configuration into runtime state and
//! owns the lifetime of everything beneath it — generalized from "one proxy
//! process" to "one pluggable south connector" the host starts and stops
//! repeatedly within its own process.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde_json::Value as Json;

use crate::codec::{Lib60870Transport, Transport, TransportEvent, WireCommand};
use crate::commands::CommandsRegistry;
use crate::config::{ApplicationConfig, EndpointSpec, ExchangeDocument, ProtocolStackDocument, RedundancyGroup, TlsDocument};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::exchange::ExchangeTable;
use crate::redundancy::Supervisor;
use crate::types::IngestCallback;

struct LoadedConfig {
    groups: Vec<RedundancyGroup>,
    app: Arc<ApplicationConfig>,
    exchange: Arc<ExchangeTable>,
    asset: String,
    audit_level: String,
}

/// The crate's single public entrypoint. One `ControlSurface` corresponds
/// to one south-service plugin instance (spec.md §9: "the plugin instance
/// is the only root").
pub struct ControlSurface {
    data_dir: PathBuf,
    loaded: RwLock<Option<LoadedConfig>>,
    ingest: RwLock<Option<IngestCallback>>,
    supervisor: RwLock<Option<Arc<Supervisor>>>,
}

impl ControlSurface {
    pub fn new(data_dir: impl Into<PathBuf>) -> ControlSurface {
        ControlSurface {
            data_dir: data_dir.into(),
            loaded: RwLock::new(None),
            ingest: RwLock::new(None),
            supervisor: RwLock::new(None),
        }
    }

    pub fn register_ingest(&self, callback: IngestCallback) {
        *self.ingest.write().unwrap() = Some(callback);
    }

    /// Parses and validates all three documents. Idempotent: calling twice
    /// with byte-identical JSON produces an exchange table and application
    /// config that compare equal (spec.md §8 "Configuration load is
    /// idempotent"). Readiness (`Ok(())`) is only returned once all three
    /// succeed; a partial failure leaves the previous configuration (if any)
    /// untouched.
    pub fn set_config(&self, protocol_json: &str, exchange_json: &str, tls_json: Option<&str>) -> Result<()> {
        let protocol = ProtocolStackDocument::from_json_str(protocol_json)?;
        let (groups, app) = protocol.resolve()?;

        let exchange = ExchangeDocument::from_json_str(exchange_json)?;
        let table = exchange.resolve()?;

        if let Some(tls_json) = tls_json {
            if groups.iter().any(|g| g.use_tls) {
                let tls = TlsDocument::from_json_str(tls_json)?;
                tls.resolve(&self.data_dir)?;
            }
        } else if groups.iter().any(|g| g.use_tls) {
            return Err(Error::Tls("tls enabled for a redundancy group but no TLS document supplied".into()));
        }

        *self.loaded.write().unwrap() = Some(LoadedConfig {
            groups,
            app: Arc::new(app),
            exchange: Arc::new(table),
            asset: protocol.south_monitoring.asset.clone(),
            audit_level: protocol.south_monitoring.audit_level.clone(),
        });
        Ok(())
    }

    /// Configured audit verbosity (spec.md §4.7 [SUPPLEMENT]). Defaults to
    /// `"info"` until a configuration has been loaded.
    pub fn log_level(&self) -> String {
        self.loaded
            .read()
            .unwrap()
            .as_ref()
            .map(|c| c.audit_level.clone())
            .unwrap_or_else(|| "info".to_string())
    }

    /// Builds every endpoint and starts the supervisor. Idempotent: a
    /// second call while already started is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.supervisor.read().unwrap().is_some() {
            return Ok(());
        }
        let ingest = self
            .ingest
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::NotReady("register_ingest must be called before start"))?;
        let loaded_guard = self.loaded.read().unwrap();
        let loaded = loaded_guard.as_ref().ok_or(Error::NotReady("set_config must succeed before start"))?;

        let commands = Arc::new(CommandsRegistry::new(loaded.app.cmd_parallel, loaded.app.cmd_exec_timeout));
        let mut endpoints = Vec::new();
        for group in &loaded.groups {
            for (i, spec) in group.endpoints.iter().enumerate() {
                let path_letter = if i == 0 { 'A' } else { 'B' };
                let tag = format!("{}-{}", group.name, path_letter);
                endpoints.push(build_endpoint(
                    spec.clone(),
                    path_letter,
                    tag,
                    loaded.app.clone(),
                    loaded.exchange.clone(),
                    commands.clone(),
                    ingest.clone(),
                ));
            }
        }

        let supervisor = Supervisor::new(endpoints, commands, loaded.exchange.clone(), ingest, loaded.asset.clone());
        supervisor.start();
        *self.supervisor.write().unwrap() = Some(supervisor);
        Ok(())
    }

    /// Idempotent, re-entrant safe (spec.md §4.7).
    pub fn stop(&self) {
        if let Some(supervisor) = self.supervisor.write().unwrap().take() {
            supervisor.stop();
        }
    }

    /// Dispatches one of the three named operations (spec.md §4.7).
    pub fn operation(&self, name: &str, params: &Json) -> Result<()> {
        match name {
            "IEC104Command" => self.op_iec104_command(params),
            "CS104_Connection_sendInterrogationCommand" => self.op_send_interrogation(params),
            "request_connection_status" => self.op_request_connection_status(),
            other => Err(Error::Config(format!("unknown operation {:?}", other))),
        }
    }

    fn supervisor(&self) -> Result<Arc<Supervisor>> {
        self.supervisor
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::NotReady("start() has not been called"))
    }

    fn op_request_connection_status(&self) -> Result<()> {
        self.supervisor()?.emit_status_now();
        Ok(())
    }

    fn op_send_interrogation(&self, params: &Json) -> Result<()> {
        let ca = params
            .get(0)
            .and_then(Json::as_u64)
            .ok_or_else(|| Error::Config("expected [ca]".into()))? as u16;
        let supervisor = self.supervisor()?;
        let endpoint = supervisor.active_endpoint().ok_or(Error::NotReady("no active endpoint"))?;
        if endpoint.send_interrogation_now(ca) {
            Ok(())
        } else {
            Err(Error::NotReady("interrogation send failed"))
        }
    }

    /// spec.md §8 invariant 5: "A command not found in the exchange table is
    /// rejected synchronously without enqueuing" — checked here, before the
    /// outstanding-commands registry ever sees the command, by looking the
    /// `(ca, ioa)` up against the point's own wire type (grounded on the
    /// original's `checkExchangeDataLayer` guard ahead of admission).
    fn op_iec104_command(&self, params: &Json) -> Result<()> {
        let supervisor = self.supervisor()?;
        let endpoint = supervisor.active_endpoint().ok_or(Error::NotReady("no active endpoint"))?;
        let cmd = parse_iec104_command(params)?;

        let loaded_guard = self.loaded.read().unwrap();
        let loaded = loaded_guard.as_ref().ok_or(Error::NotReady("set_config must succeed before start"))?;
        if loaded.exchange.lookup(cmd.ca(), cmd.ioa(), cmd.type_id()).is_none() {
            return Err(Error::UnknownPoint { ca: cmd.ca(), ioa: cmd.ioa() });
        }
        drop(loaded_guard);

        if endpoint.send_command(cmd) {
            Ok(())
        } else {
            Err(Error::NotReady("command rejected (parallelism cap or send failure)"))
        }
    }
}

fn build_endpoint(
    spec: EndpointSpec,
    path_letter: char,
    tag: String,
    app: Arc<ApplicationConfig>,
    exchange: Arc<ExchangeTable>,
    commands: Arc<CommandsRegistry>,
    ingest: IngestCallback,
) -> Arc<Endpoint> {
    let server_ip: IpAddr = spec.server_ip;
    let tcp_port = spec.tcp_port;
    let originator_address = app.orig_addr;
    let connect_timeout = std::time::Duration::from_secs(30);

    Endpoint::new(
        spec,
        path_letter,
        tag,
        app,
        exchange,
        commands,
        ingest,
        Box::new(move |events_tx: std::sync::mpsc::Sender<TransportEvent>| {
            Lib60870Transport::new(server_ip, tcp_port, originator_address, connect_timeout, events_tx)
                .map(|t| Box::new(t) as Box<dyn Transport>)
        }),
    )
}

/// Parses `[type, ca, ioa, cot, negative, se, test, ts, value]` (spec.md
/// §4.7) into a [`WireCommand`]. `cot`/`negative`/`test` describe the
/// command's own framing and are applied by the wire codec layer below this
/// crate's `Transport` seam; only the fields `WireCommand` itself carries
/// are extracted here.
fn parse_iec104_command(params: &Json) -> Result<WireCommand> {
    let get_str = |i: usize| params.get(i).and_then(Json::as_str).map(str::to_string);
    let get_u64 = |i: usize| params.get(i).and_then(Json::as_u64);
    let get_bool = |i: usize| params.get(i).and_then(Json::as_bool).unwrap_or(false);
    let get_f64 = |i: usize| params.get(i).and_then(Json::as_f64);

    let type_name = get_str(0).ok_or_else(|| Error::Config("missing command type".into()))?;
    let ca = get_u64(1).ok_or_else(|| Error::Config("missing ca".into()))? as u16;
    let ioa = get_u64(2).ok_or_else(|| Error::Config("missing ioa".into()))? as u32;
    let select = get_bool(5);
    let with_time = get_bool(7);
    let value = params.get(8).cloned().unwrap_or(Json::Null);

    Ok(match type_name.as_str() {
        "single" => WireCommand::Single {
            ca,
            ioa,
            value: value.as_bool().unwrap_or(false),
            select,
            with_time,
        },
        "double" => WireCommand::Double {
            ca,
            ioa,
            value: value.as_u64().unwrap_or(0) as u8,
            select,
            with_time,
        },
        "step" => WireCommand::Step {
            ca,
            ioa,
            up: value.as_bool().unwrap_or(false),
            select,
            with_time,
        },
        "setpoint_normalized" => WireCommand::SetpointNormalized {
            ca,
            ioa,
            value: value.as_i64().unwrap_or(0) as i16,
            select,
            with_time,
        },
        "setpoint_scaled" => WireCommand::SetpointScaled {
            ca,
            ioa,
            value: value.as_i64().unwrap_or(0) as i16,
            select,
            with_time,
        },
        "setpoint_short" => WireCommand::SetpointShort {
            ca,
            ioa,
            value: get_f64(8).unwrap_or(0.0) as f32,
            select,
            with_time,
        },
        other => return Err(Error::Config(format!("unknown command type {:?}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_single_command() {
        let params = json!(["single", 41025, 2000, 6, false, true, false, false, true]);
        let cmd = parse_iec104_command(&params).unwrap();
        match cmd {
            WireCommand::Single { ca, ioa, value, select, .. } => {
                assert_eq!(ca, 41025);
                assert_eq!(ioa, 2000);
                assert!(value);
                assert!(select);
            }
            _ => panic!("expected Single"),
        }
    }

    #[test]
    fn rejects_unknown_command_type() {
        let params = json!(["bogus", 1, 2]);
        assert!(parse_iec104_command(&params).is_err());
    }

    #[test]
    fn operation_before_start_is_not_ready() {
        let surface = ControlSurface::new("/tmp/iec104-test");
        let result = surface.operation("request_connection_status", &json!([]));
        assert!(matches!(result, Err(Error::NotReady(_))));
    }
}
