//! C8 (ambient): parses and validates the three JSON configuration
//! documents of spec.md §6 into typed, immutable runtime structures.
//!
//! Grounded on the teacher's `config.rs` (`AppConfig`/`ProxyConfig`, a
//! `from_str` entrypoint) and `connector/config.rs` (raw `*Config` structs
//! with `Option` fields resolved against defaults in a `mk_*` constructor,
//! `#[serde(deny_unknown_fields, rename_all = "camelCase")]`). Unlike the
//! teacher, these documents are JSON only — the host always supplies JSON
//! (spec.md §6), so there is no YAML-or-JSON sniffing here.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::exchange::{DataPoint, ExchangeTable, STATION_GROUP_BIT};
use crate::types::TypeId;

/// Default `connections[].port` (spec.md §6).
pub const DEFAULT_TCP_PORT: u16 = 2404;

// ---------------------------------------------------------------------
// Protocol-stack document
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProtocolStackDocument {
    pub transport_layer: TransportLayerConfig,
    pub application_layer: ApplicationLayerConfig,
    pub south_monitoring: SouthMonitoringConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TransportLayerConfig {
    pub redundancy_groups: Vec<RedundancyGroupConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RedundancyGroupConfig {
    pub rg_name: String,
    #[serde(default)]
    pub tls: bool,
    pub connections: Vec<ConnectionConfig>,
    #[serde(default = "default_k")]
    pub k: u16,
    #[serde(default = "default_w")]
    pub w: u16,
    #[serde(default = "default_t0")]
    pub t0: u8,
    #[serde(default = "default_t1")]
    pub t1: u8,
    #[serde(default = "default_t2")]
    pub t2: u8,
    #[serde(default = "default_t3")]
    pub t3: u32,
}

fn default_k() -> u16 {
    12
}
fn default_w() -> u16 {
    8
}
fn default_t0() -> u8 {
    30
}
fn default_t1() -> u8 {
    15
}
fn default_t2() -> u8 {
    10
}
fn default_t3() -> u32 {
    20
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub srv_ip: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub clt_ip: Option<IpAddr>,
    #[serde(default = "default_true")]
    pub conn: bool,
    #[serde(default)]
    pub start: bool,
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}
fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ApplicationLayerConfig {
    #[serde(default)]
    pub orig_addr: u8,
    #[serde(default = "default_ca_size")]
    pub ca_asdu_size: u8,
    #[serde(default = "default_ioa_size")]
    pub ioaddr_size: u8,
    #[serde(default)]
    pub asdu_size: u8,
    #[serde(default)]
    pub time_sync: u32,
    #[serde(default = "default_true")]
    pub gi_enabled: bool,
    #[serde(default)]
    pub gi_all_ca: bool,
    #[serde(default)]
    pub gi_time: u32,
    #[serde(default)]
    pub gi_cycle: u32,
    #[serde(default)]
    pub gi_repeat_count: u32,
    #[serde(default)]
    pub cmd_parallel: usize,
    #[serde(default = "default_cmd_exec_timeout")]
    pub cmd_exec_timeout: u64,
    pub default_ca: u16,
    pub time_sync_ca: Option<u16>,
}

fn default_ca_size() -> u8 {
    2
}
fn default_ioa_size() -> u8 {
    3
}
fn default_cmd_exec_timeout() -> u64 {
    10_000
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SouthMonitoringConfig {
    pub asset: String,
    /// **[SUPPLEMENT]** audit verbosity knob, grounded on the original
    /// `logfile`/`logging` sub-config (`examples/original_source/include/
    /// iec104_client_config.h`).
    #[serde(default = "default_audit_level")]
    pub audit_level: String,
}

fn default_audit_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------
// Resolved runtime structures
// ---------------------------------------------------------------------

/// APCI timing parameters, validated against spec.md §6's ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApciTiming {
    pub k: u16,
    pub w: u16,
    pub t0: u8,
    pub t1: u8,
    pub t2: u8,
    pub t3: u32,
}

impl ApciTiming {
    fn validate(&self) -> Result<()> {
        if !(1..=32767).contains(&self.k) {
            return Err(Error::Config(format!("k={} out of range 1..32767", self.k)));
        }
        if !(1..=32767).contains(&self.w) {
            return Err(Error::Config(format!("w={} out of range 1..32767", self.w)));
        }
        if self.t0 == 0 {
            return Err(Error::Config("t0 must be in 1..255".into()));
        }
        if self.t1 == 0 {
            return Err(Error::Config("t1 must be in 1..255".into()));
        }
        if self.t2 == 0 {
            return Err(Error::Config("t2 must be in 1..255".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSpec {
    pub server_ip: IpAddr,
    pub tcp_port: u16,
    pub client_bind_ip: Option<IpAddr>,
    pub autoconnect: bool,
    pub autostart: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedundancyGroup {
    pub name: String,
    pub index: usize,
    pub use_tls: bool,
    pub apci: ApciTiming,
    pub endpoints: Vec<EndpointSpec>,
}

/// The broadcast CA for this configuration's `ca_asdu_size` (spec.md §8
/// boundary case: 1-octet CA ⇒ `0xFF`, 2-octet CA ⇒ `0xFFFF`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationConfig {
    pub orig_addr: u8,
    pub ca_asdu_size: u8,
    pub ioaddr_size: u8,
    pub asdu_size: u16,
    pub time_sync: u32,
    pub gi_enabled: bool,
    pub gi_all_ca: bool,
    pub gi_time: u32,
    pub gi_cycle: u32,
    pub gi_repeat_count: u32,
    pub cmd_parallel: usize,
    pub cmd_exec_timeout: Duration,
    pub default_ca: u16,
    pub time_sync_ca: Option<u16>,
}

impl ApplicationConfig {
    pub fn broadcast_ca(&self) -> u16 {
        if self.ca_asdu_size == 1 {
            0xFF
        } else {
            0xFFFF
        }
    }

    /// Effective maximum ASDU size (spec.md §8 boundary case: `0` ⇒ 249).
    pub fn effective_asdu_size(&self) -> u16 {
        if self.asdu_size == 0 {
            249
        } else {
            self.asdu_size
        }
    }
}

impl ProtocolStackDocument {
    pub fn from_json_str(s: &str) -> Result<ProtocolStackDocument> {
        Ok(serde_json::from_str(s)?)
    }

    /// Validates and lowers this document into its runtime structures.
    pub fn resolve(&self) -> Result<(Vec<RedundancyGroup>, ApplicationConfig)> {
        if self.transport_layer.redundancy_groups.is_empty() {
            return Err(Error::Config("at least one redundancy group is required".into()));
        }
        let mut groups = Vec::with_capacity(self.transport_layer.redundancy_groups.len());
        for (index, rg) in self.transport_layer.redundancy_groups.iter().enumerate() {
            if rg.connections.is_empty() {
                return Err(Error::Config(format!("redundancy group {} has no connections", rg.rg_name)));
            }
            let apci = ApciTiming {
                k: rg.k,
                w: rg.w,
                t0: rg.t0,
                t1: rg.t1,
                t2: rg.t2,
                t3: rg.t3,
            };
            apci.validate()?;
            let endpoints = rg
                .connections
                .iter()
                .map(|c| EndpointSpec {
                    server_ip: c.srv_ip,
                    tcp_port: c.port,
                    client_bind_ip: c.clt_ip,
                    autoconnect: c.conn,
                    autostart: c.start,
                })
                .collect();
            groups.push(RedundancyGroup {
                name: rg.rg_name.clone(),
                index,
                use_tls: rg.tls,
                apci,
                endpoints,
            });
        }

        let a = &self.application_layer;
        if !(1..=2).contains(&a.ca_asdu_size) {
            return Err(Error::Config("ca_asdu_size must be 1 or 2".into()));
        }
        if !(1..=3).contains(&a.ioaddr_size) {
            return Err(Error::Config("ioaddr_size must be 1..=3".into()));
        }
        let app = ApplicationConfig {
            orig_addr: a.orig_addr,
            ca_asdu_size: a.ca_asdu_size,
            ioaddr_size: a.ioaddr_size,
            asdu_size: a.asdu_size as u16,
            time_sync: a.time_sync,
            gi_enabled: a.gi_enabled,
            gi_all_ca: a.gi_all_ca,
            gi_time: a.gi_time,
            gi_cycle: a.gi_cycle,
            gi_repeat_count: a.gi_repeat_count,
            cmd_parallel: a.cmd_parallel,
            cmd_exec_timeout: Duration::from_millis(a.cmd_exec_timeout),
            default_ca: a.default_ca,
            time_sync_ca: a.time_sync_ca,
        };
        Ok((groups, app))
    }
}

// ---------------------------------------------------------------------
// Exchange document
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ExchangeDocument {
    pub datapoints: Vec<DatapointConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DatapointConfig {
    pub label: String,
    #[serde(default)]
    pub pivot_subtypes: Vec<String>,
    pub protocols: Vec<ProtocolConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProtocolConfig {
    pub name: String,
    pub address: String,
    pub typeid: String,
    #[serde(default)]
    pub gi_groups: Vec<u16>,
}

impl ExchangeDocument {
    pub fn from_json_str(s: &str) -> Result<ExchangeDocument> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn resolve(&self) -> Result<ExchangeTable> {
        let mut points = Vec::with_capacity(self.datapoints.len());
        let mut seen_labels = HashSet::new();
        let mut seen_addrs = HashSet::new();
        for dp in &self.datapoints {
            let proto = dp
                .protocols
                .iter()
                .find(|p| p.name == "iec104")
                .ok_or_else(|| Error::Config(format!("datapoint {} has no iec104 protocol entry", dp.label)))?;
            let (ca, ioa) = parse_address(&proto.address)?;
            let expected_type_id = parse_type_id(&proto.typeid)?;
            let mut gi_group_mask: u16 = 0;
            for g in &proto.gi_groups {
                gi_group_mask |= 1 << g;
            }
            if gi_group_mask == 0 {
                gi_group_mask = STATION_GROUP_BIT;
            }
            let triggers_gi_on_value_zero = dp.pivot_subtypes.iter().any(|s| s == "trigger_south_gi");

            if !seen_labels.insert(dp.label.clone()) {
                return Err(Error::Config(format!("duplicate datapoint label {}", dp.label)));
            }
            if !seen_addrs.insert((ca, ioa)) {
                return Err(Error::Config(format!("duplicate (ca,ioa) ({},{})", ca, ioa)));
            }

            points.push(DataPoint {
                common_address: ca,
                info_object_address: ioa,
                label: dp.label.clone(),
                expected_type_id,
                gi_group_mask,
                triggers_gi_on_value_zero,
            });
        }
        Ok(ExchangeTable::build(points))
    }
}

/// Parses a `"CA-IOA"` address string (spec.md §6).
fn parse_address(s: &str) -> Result<(u16, u32)> {
    let (ca_str, ioa_str) = s
        .split_once('-')
        .ok_or_else(|| Error::Config(format!("malformed address {:?}, expected CA-IOA", s)))?;
    let ca: u16 = ca_str
        .parse()
        .map_err(|_| Error::Config(format!("invalid CA in address {:?}", s)))?;
    let ioa: u32 = ioa_str
        .parse()
        .map_err(|_| Error::Config(format!("invalid IOA in address {:?}", s)))?;
    Ok((ca, ioa))
}

/// Maps the exchange document's named type IDs onto [`TypeId`]. Only the
/// type IDs spec.md §6 lists as supported are accepted; anything else is a
/// configuration error (unlike an unrecognized *received* type, which is
/// merely logged and ignored at runtime per spec.md §7).
fn parse_type_id(name: &str) -> Result<TypeId> {
    Ok(match name {
        "M_SP_NA_1" => TypeId::M_SP_NA_1,
        "M_DP_NA_1" => TypeId::M_DP_NA_1,
        "M_ST_NA_1" => TypeId::M_ST_NA_1,
        "M_ME_NA_1" => TypeId::M_ME_NA_1,
        "M_ME_NB_1" => TypeId::M_ME_NB_1,
        "M_ME_NC_1" => TypeId::M_ME_NC_1,
        "M_ME_ND_1" => TypeId::M_ME_ND_1,
        "M_SP_TB_1" => TypeId::M_SP_TB_1,
        "M_DP_TB_1" => TypeId::M_DP_TB_1,
        "M_ST_TB_1" => TypeId::M_ST_TB_1,
        "M_BO_TB_1" => TypeId::M_BO_TB_1,
        "M_ME_TD_1" => TypeId::M_ME_TD_1,
        "M_ME_TE_1" => TypeId::M_ME_TE_1,
        "M_ME_TF_1" => TypeId::M_ME_TF_1,
        "M_IT_TB_1" => TypeId::M_IT_TB_1,
        "C_SC_NA_1" => TypeId::C_SC_NA_1,
        "C_DC_NA_1" => TypeId::C_DC_NA_1,
        "C_RC_NA_1" => TypeId::C_RC_NA_1,
        "C_SE_NA_1" => TypeId::C_SE_NA_1,
        "C_SE_NB_1" => TypeId::C_SE_NB_1,
        "C_SE_NC_1" => TypeId::C_SE_NC_1,
        "C_BO_NA_1" => TypeId::C_BO_NA_1,
        "C_SC_TA_1" => TypeId::C_SC_TA_1,
        "C_DC_TA_1" => TypeId::C_DC_TA_1,
        "C_RC_TA_1" => TypeId::C_RC_TA_1,
        "C_SE_TA_1" => TypeId::C_SE_TA_1,
        "C_SE_TB_1" => TypeId::C_SE_TB_1,
        "C_SE_TC_1" => TypeId::C_SE_TC_1,
        "C_BO_TA_1" => TypeId::C_BO_TA_1,
        other => return Err(Error::Config(format!("unsupported type id {:?}", other))),
    })
}

// ---------------------------------------------------------------------
// TLS document
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TlsDocument {
    pub tls_conf: TlsConf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TlsConf {
    pub private_key: String,
    pub own_cert: String,
    #[serde(default)]
    pub ca_certs: Vec<CertFile>,
    #[serde(default)]
    pub remote_certs: Vec<CertFile>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CertFile {
    pub cert_file: String,
}

/// Resolved TLS material, ready to hand to `rustls::ClientConfig`.
pub struct TlsSettings {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsDocument {
    pub fn from_json_str(s: &str) -> Result<TlsDocument> {
        Ok(serde_json::from_str(s)?)
    }

    /// Resolves certificate filenames under `<data_dir>/etc/certs/` (or
    /// `/pem/` for filenames ending in `.pem`, spec.md §6).
    pub fn resolve(&self, data_dir: &Path) -> Result<TlsSettings> {
        let mut root_store = rustls::RootCertStore::empty();
        for cert in &self.tls_conf.ca_certs {
            let path = cert_path(data_dir, &cert.cert_file);
            let f = File::open(&path).map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(f))
                .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?;
            for der in certs {
                root_store
                    .add(&rustls::Certificate(der))
                    .map_err(|e| Error::Tls(e.to_string()))?;
            }
        }

        let own_cert_path = cert_path(data_dir, &self.tls_conf.own_cert);
        let own_cert_file =
            File::open(&own_cert_path).map_err(|e| Error::Tls(format!("{}: {}", own_cert_path.display(), e)))?;
        let own_certs = rustls_pemfile::certs(&mut BufReader::new(own_cert_file))
            .map_err(|e| Error::Tls(format!("{}: {}", own_cert_path.display(), e)))?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();

        let key_path = cert_path(data_dir, &self.tls_conf.private_key);
        let key_file = File::open(&key_path).map_err(|e| Error::Tls(format!("{}: {}", key_path.display(), e)))?;
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
            .map_err(|e| Error::Tls(format!("{}: {}", key_path.display(), e)))?;
        let key = keys
            .pop()
            .map(rustls::PrivateKey)
            .ok_or_else(|| Error::Tls(format!("{}: no private key found", key_path.display())))?;

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_single_cert(own_certs, key)
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(TlsSettings {
            client_config: Arc::new(config),
        })
    }
}

fn cert_path(data_dir: &Path, filename: &str) -> std::path::PathBuf {
    if filename.ends_with(".pem") {
        data_dir.join("etc").join("pem").join(filename)
    } else {
        data_dir.join("etc").join("certs").join(filename)
    }
}
