//! C3: the redundancy supervisor (spec.md §4.3) — owns every [`Endpoint`]
//! in every redundancy group, elects exactly one active endpoint, demotes
//! spares, cascades reconnection of backups, and reacts to failure within a
//! bounded switchover time.
//!
//! Grounded on the teacher's `balancer::manager::Manager`, which owns a map
//! of endpoints behind a lock and runs its own tick loop electing/evicting
//! members; the single-active-endpoint slot here plays the same role the
//! teacher's "which endpoint does the next request go to" choice does,
//! generalized from per-request selection to a long-lived election.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::audit::{self, Outcome};
use crate::commands::CommandsRegistry;
use crate::endpoint::{Endpoint, State};
use crate::exchange::ExchangeTable;
use crate::quality;
use crate::types::IngestCallback;

const TICK: Duration = Duration::from_millis(100);
const BACKUP_CASCADE_TIMEOUT: Duration = Duration::from_secs(5);
const QUALITY_DEGRADE_DELAY: Duration = Duration::from_millis(500);

/// `{connx_status, gi_status}` south-monitoring event (spec.md §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub connx_status: &'static str,
    pub gi_status: &'static str,
}

pub struct Supervisor {
    endpoints: Vec<Arc<Endpoint>>,
    commands: Arc<CommandsRegistry>,
    exchange: Arc<ExchangeTable>,
    ingest: IngestCallback,
    status_asset: String,
    active: Mutex<Option<usize>>,
    last_status: Mutex<Option<StatusEvent>>,
    cascade_armed_at: Mutex<Instant>,
    degrade_pending_since: Mutex<Option<Instant>>,
    degrade_fired: AtomicBool,
    started: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    first_start_done: AtomicBool,
}

impl Supervisor {
    pub fn new(
        endpoints: Vec<Arc<Endpoint>>,
        commands: Arc<CommandsRegistry>,
        exchange: Arc<ExchangeTable>,
        ingest: IngestCallback,
        status_asset: String,
    ) -> Arc<Supervisor> {
        Arc::new(Supervisor {
            endpoints,
            commands,
            exchange,
            ingest,
            status_asset,
            active: Mutex::new(None),
            last_status: Mutex::new(None),
            cascade_armed_at: Mutex::new(Instant::now()),
            degrade_pending_since: Mutex::new(None),
            degrade_fired: AtomicBool::new(false),
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            first_start_done: AtomicBool::new(false),
        })
    }

    pub fn active_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.active.lock().unwrap().map(|i| self.endpoints[i].clone())
    }

    pub fn status_event(&self) -> StatusEvent {
        let connx_status = match self.active_endpoint() {
            Some(ep) if ep.is_active() => "connected",
            _ => "not connected",
        };
        let gi_status = match self.active_endpoint() {
            Some(ep) => gi_status_str(ep.gi_status()),
            None => "idle",
        };
        StatusEvent {
            connx_status,
            gi_status,
        }
    }

    /// Forces a one-shot status event regardless of de-duplication (spec.md
    /// §4.7 `"request_connection_status"`).
    pub fn emit_status_now(&self) {
        let event = self.status_event();
        self.emit_reading_for(&event);
    }

    fn maybe_emit_status(&self) {
        let event = self.status_event();
        let mut last = self.last_status.lock().unwrap();
        if last.as_ref() == Some(&event) {
            return;
        }
        *last = Some(event.clone());
        drop(last);
        self.emit_reading_for(&event);
    }

    fn emit_reading_for(&self, event: &StatusEvent) {
        use crate::types::{Quality, Reading, TypeId, Value};
        (self.ingest)(Reading {
            label: self.status_asset.clone(),
            do_type: TypeId(0),
            do_ca: 0,
            do_oa: 0,
            do_ioa: 0,
            do_cot: crate::types::cot::SPONTANEOUS,
            do_test: false,
            do_negative: false,
            do_value: Value::StringTuple(format!(
                "{{\"connx_status\":\"{}\",\"gi_status\":\"{}\"}}",
                event.connx_status, event.gi_status
            )),
            do_quality: Quality::empty(),
            do_ts: None,
            do_value_seq: None,
        });
    }

    /// Spawns every endpoint thread plus the supervisor's own 100 ms tick
    /// loop (spec.md §4.3). Idempotent: a second call is a no-op while
    /// already started.
    pub fn start(self: &Arc<Supervisor>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.first_start_done.swap(true, Ordering::SeqCst) {
            quality::mark_all_invalid(&self.exchange, &self.ingest);
        }
        let mut handles = Vec::new();
        for ep in &self.endpoints {
            handles.push(ep.spawn());
        }
        let this = Arc::clone(self);
        handles.push(
            std::thread::Builder::new()
                .name("redundancy-supervisor".into())
                .spawn(move || this.run())
                .expect("failed to spawn supervisor thread"),
        );
        *self.threads.lock().unwrap() = handles;
    }

    /// Idempotent; joins every endpoint loop, clears outstanding commands,
    /// and broadcasts a final NOT_CONNECTED (spec.md §4.3 point 5).
    pub fn stop(self: &Arc<Supervisor>) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for ep in &self.endpoints {
            ep.stop();
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
        self.commands.clear();
        *self.active.lock().unwrap() = None;
        self.maybe_emit_status();
    }

    fn run(&self) {
        while self.started.load(Ordering::SeqCst) {
            self.tick();
            std::thread::sleep(TICK);
        }
    }

    fn tick(&self) {
        self.commands.sweep_timeouts();
        self.detect_failure();
        self.elect();
        self.demote_spares();
        self.cascade_backups();
        self.apply_pending_degrade();
        self.maybe_emit_status();
    }

    /// Election (spec.md §4.3 point 1): first autoconnect-eligible endpoint
    /// in declaration order that is connected but not yet active.
    fn elect(&self) {
        if self.active.lock().unwrap().is_some() {
            return;
        }
        for (i, ep) in self.endpoints.iter().enumerate() {
            if !ep.spec.autoconnect {
                continue;
            }
            if matches!(ep.state(), State::ConnectedInactive | State::ConnectedActive) {
                ep.request_activate();
                *self.active.lock().unwrap() = Some(i);
                self.degrade_fired.store(false, Ordering::SeqCst);
                *self.degrade_pending_since.lock().unwrap() = None;
                audit::record("SRVFL", Outcome::Success, &ep.tag, "endpoint elected active");
                return;
            }
        }
    }

    /// Spare demotion (spec.md §4.3 point 3): connected, not active, and
    /// `autostart == false` endpoints are asked to disconnect.
    fn demote_spares(&self) {
        let active_idx = *self.active.lock().unwrap();
        for (i, ep) in self.endpoints.iter().enumerate() {
            if Some(i) == active_idx {
                continue;
            }
            if ep.is_connected() && !ep.spec.autostart {
                ep.request_disconnect();
            }
        }
    }

    /// Backup cascade (spec.md §4.3 point 2): if nothing is connected,
    /// issue `Connect()` on every idle endpoint every 5 s.
    fn cascade_backups(&self) {
        if self.endpoints.iter().any(|e| e.is_connected()) {
            *self.cascade_armed_at.lock().unwrap() = Instant::now() + BACKUP_CASCADE_TIMEOUT;
            return;
        }
        let due = {
            let armed = self.cascade_armed_at.lock().unwrap();
            Instant::now() >= *armed
        };
        if !due {
            return;
        }
        for ep in &self.endpoints {
            if ep.state() == State::Idle {
                ep.request_connect();
            }
        }
        *self.cascade_armed_at.lock().unwrap() = Instant::now() + BACKUP_CASCADE_TIMEOUT;
    }

    /// Failure detection (spec.md §4.3 point 4): clears the active slot and
    /// arms a one-shot 500 ms delayed quality broadcast.
    fn detect_failure(&self) {
        let active_idx = *self.active.lock().unwrap();
        let Some(i) = active_idx else {
            return;
        };
        if self.endpoints[i].is_connected() {
            return;
        }
        *self.active.lock().unwrap() = None;
        audit::record("SRVFL", Outcome::Warning, &self.endpoints[i].tag, "active endpoint lost");
        let mut since = self.degrade_pending_since.lock().unwrap();
        if since.is_none() {
            *since = Some(Instant::now());
            self.degrade_fired.store(false, Ordering::SeqCst);
        }
    }

    fn apply_pending_degrade(&self) {
        if self.degrade_fired.load(Ordering::SeqCst) {
            return;
        }
        let due = {
            let since = self.degrade_pending_since.lock().unwrap();
            since.is_some_and(|at| Instant::now() >= at + QUALITY_DEGRADE_DELAY)
        };
        if !due {
            return;
        }
        quality::mark_all_non_topical(&self.exchange, &self.ingest);
        self.degrade_fired.store(true, Ordering::SeqCst);
    }
}

fn gi_status_str(status: crate::endpoint::GiStatus) -> &'static str {
    use crate::endpoint::GiStatus::*;
    match status {
        Idle => "idle",
        Started => "started",
        InProgress => "in_progress",
        Finished => "finished",
        Failed => "failed",
    }
}
