//! C2: the per-TCP-endpoint connection state machine (spec.md §4.2) — by
//! far the largest component. One [`Endpoint`] owns one [`Transport`], runs
//! its own thread, and is driven by two things: events the transport pushes
//! onto its `mpsc` channel, and request flags the redundancy supervisor sets
//! from its own thread (`request_connect`/`request_activate`/
//! `request_disconnect`). Mirrors the teacher's one-`Connector`-per-endpoint
//! shape, generalized from a single-threaded reactor task to a dedicated
//! `std::thread` per spec.md §5.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::audit::{self, Outcome};
use crate::codec::{DecodedAsdu, Transport, TransportEvent, WireCommand};
use crate::commands::CommandsRegistry;
use crate::config::{ApplicationConfig, EndpointSpec};
use crate::dispatcher;
use crate::exchange::ExchangeTable;
use crate::types::IngestCallback;

const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    ConnectedInactive,
    ConnectedActive,
    Closed,
    WaitForReconnect,
    FatalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiStatus {
    Idle,
    Started,
    InProgress,
    Finished,
    Failed,
}

/// Mutable endpoint state, guarded by `Endpoint::runtime` (spec.md §5:
/// "Per-endpoint connection handle: guarded by the endpoint's own lock").
struct Runtime {
    state: State,
    time_synchronised: bool,
    first_time_sync_done: bool,
    first_gi_sent: bool,
    interrogation_in_progress: bool,
    end_of_init_received: bool,
    gi_requested: bool,
    next_time_sync_at: Option<Instant>,
    next_gi_start_at: Option<Instant>,
    interrogation_sent_at: Option<Instant>,
    delay_expiration_at: Option<Instant>,
    interrogation_request_state: u8,
    gi_status: GiStatus,
    last_audit_tag: String,
    connect_requested: bool,
    activate_requested: bool,
    disconnect_requested: bool,
    gi_ca_queue: VecDeque<u16>,
    gi_pending: HashSet<(u16, u32)>,
}

impl Runtime {
    fn new() -> Runtime {
        Runtime {
            state: State::Idle,
            time_synchronised: false,
            first_time_sync_done: false,
            first_gi_sent: false,
            interrogation_in_progress: false,
            end_of_init_received: false,
            gi_requested: false,
            next_time_sync_at: None,
            next_gi_start_at: None,
            interrogation_sent_at: None,
            delay_expiration_at: None,
            interrogation_request_state: 0,
            gi_status: GiStatus::Idle,
            last_audit_tag: String::new(),
            connect_requested: false,
            activate_requested: false,
            disconnect_requested: false,
            gi_ca_queue: VecDeque::new(),
            gi_pending: HashSet::new(),
        }
    }
}

/// One TCP endpoint, driven by its own `run()` loop on a dedicated thread.
pub struct Endpoint {
    pub spec: EndpointSpec,
    pub path_letter: char,
    pub tag: String,
    app: Arc<ApplicationConfig>,
    exchange: Arc<ExchangeTable>,
    commands: Arc<CommandsRegistry>,
    ingest: IngestCallback,
    transport_factory: Box<dyn Fn(Sender<TransportEvent>) -> Option<Box<dyn Transport>> + Send + Sync>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    events_tx: Sender<TransportEvent>,
    events_rx: Mutex<Receiver<TransportEvent>>,
    runtime: Mutex<Runtime>,
    started: AtomicBool,
}

impl Endpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: EndpointSpec,
        path_letter: char,
        tag: String,
        app: Arc<ApplicationConfig>,
        exchange: Arc<ExchangeTable>,
        commands: Arc<CommandsRegistry>,
        ingest: IngestCallback,
        transport_factory: Box<dyn Fn(Sender<TransportEvent>) -> Option<Box<dyn Transport>> + Send + Sync>,
    ) -> Arc<Endpoint> {
        let (events_tx, events_rx) = mpsc::channel();
        Arc::new(Endpoint {
            spec,
            path_letter,
            tag,
            app,
            exchange,
            commands,
            ingest,
            transport_factory,
            transport: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            runtime: Mutex::new(Runtime::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> State {
        self.runtime.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), State::ConnectedInactive | State::ConnectedActive)
    }

    pub fn is_active(&self) -> bool {
        self.state() == State::ConnectedActive
    }

    pub fn gi_status(&self) -> GiStatus {
        self.runtime.lock().unwrap().gi_status
    }

    // -- requests from the supervisor's thread ---------------------------

    pub fn request_connect(&self) {
        self.runtime.lock().unwrap().connect_requested = true;
    }

    pub fn request_activate(&self) {
        self.runtime.lock().unwrap().activate_requested = true;
    }

    pub fn request_disconnect(&self) {
        self.runtime.lock().unwrap().disconnect_requested = true;
    }

    /// External GI trigger (spec.md §4.4 point 6 / §8 scenario 6).
    pub fn request_gi(&self) {
        self.runtime.lock().unwrap().gi_requested = true;
    }

    pub fn has_gi_requested(&self) -> bool {
        self.runtime.lock().unwrap().gi_requested
    }

    // -- lifecycle ---------------------------------------------------------

    /// Spawns the endpoint's own thread. Returns the `JoinHandle` so the
    /// supervisor can join it during shutdown (spec.md §4.3 point 5).
    pub fn spawn(self: &Arc<Endpoint>) -> std::thread::JoinHandle<()> {
        self.started.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("endpoint-{}", this.tag))
            .spawn(move || this.run())
            .expect("failed to spawn endpoint thread")
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn run(&self) {
        while self.started.load(Ordering::SeqCst) {
            self.drain_events();
            self.process_requests();
            if self.state() == State::ConnectedActive {
                self.execute_periodic_tasks();
            }
            self.check_delay_expiration();
            std::thread::sleep(TICK);
        }
    }

    fn drain_events(&self) {
        let rx = self.events_rx.lock().unwrap();
        while let Ok(event) = rx.try_recv() {
            self.handle_transport_event(event);
        }
    }

    fn process_requests(&self) {
        let (connect, activate, disconnect) = {
            let mut rt = self.runtime.lock().unwrap();
            let c = std::mem::take(&mut rt.connect_requested);
            let a = std::mem::take(&mut rt.activate_requested);
            let d = std::mem::take(&mut rt.disconnect_requested);
            (c, a, d)
        };
        if connect && self.state() == State::Idle {
            self.do_connect();
        }
        if activate && self.state() == State::ConnectedInactive {
            self.do_activate();
        }
        if disconnect && self.is_connected() {
            self.do_close();
        }
    }

    // -- state transitions (spec.md §4.2 table) -----------------------------

    fn do_connect(&self) {
        {
            let mut rt = self.runtime.lock().unwrap();
            rt.state = State::Connecting;
            rt.delay_expiration_at = Some(Instant::now() + RECONNECT_DELAY);
        }
        let transport = (self.transport_factory)(self.events_tx.clone());
        let Some(mut transport) = transport else {
            self.fail_to_connect();
            return;
        };
        match transport.connect() {
            Ok(()) => {
                *self.transport.lock().unwrap() = Some(transport);
                // A real `Lib60870Transport` also surfaces `Opened` through
                // its event channel; calling this directly covers mock
                // transports that skip the event round-trip.
                self.handle_transport_event(TransportEvent::Opened);
            }
            Err(_) => self.fail_to_connect(),
        }
    }

    fn fail_to_connect(&self) {
        self.transition_closed();
    }

    fn do_activate(&self) {
        if let Some(t) = self.transport.lock().unwrap().as_mut() {
            t.send_start_dt();
        }
        let mut rt = self.runtime.lock().unwrap();
        rt.state = State::ConnectedActive;
        rt.last_audit_tag = "active".into();
        drop(rt);
        audit::record("SRVFL", Outcome::Success, &self.tag, "endpoint activated");
    }

    fn do_close(&self) {
        if let Some(t) = self.transport.lock().unwrap().as_mut() {
            t.close();
        }
        self.transition_closed();
    }

    fn transition_closed(&self) {
        {
            let mut rt = self.runtime.lock().unwrap();
            rt.state = State::Closed;
        }
        *self.transport.lock().unwrap() = None;
        audit::record("SRVFL", Outcome::Information, &self.tag, "endpoint disconnected");
        let mut rt = self.runtime.lock().unwrap();
        rt.state = State::WaitForReconnect;
        rt.delay_expiration_at = Some(Instant::now() + RECONNECT_DELAY);
        rt.time_synchronised = false;
        rt.first_time_sync_done = false;
        rt.first_gi_sent = false;
        rt.interrogation_in_progress = false;
        rt.end_of_init_received = false;
        rt.interrogation_request_state = 0;
        rt.gi_status = GiStatus::Idle;
    }

    fn check_delay_expiration(&self) {
        let (state, expired) = {
            let rt = self.runtime.lock().unwrap();
            let expired = rt.delay_expiration_at.is_some_and(|at| Instant::now() >= at);
            (rt.state, expired)
        };
        if !expired {
            return;
        }
        match state {
            State::Connecting => {
                // spec.md §4.2: "delay_expiration_at elapsed | Idle | close socket"
                if let Some(t) = self.transport.lock().unwrap().as_mut() {
                    t.close();
                }
                *self.transport.lock().unwrap() = None;
                let mut rt = self.runtime.lock().unwrap();
                rt.state = State::Idle;
                rt.delay_expiration_at = None;
            }
            State::WaitForReconnect => {
                let mut rt = self.runtime.lock().unwrap();
                rt.state = State::Idle;
                rt.delay_expiration_at = None;
            }
            _ => {}
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                let mut rt = self.runtime.lock().unwrap();
                rt.state = State::ConnectedInactive;
                rt.last_audit_tag = "passive".into();
                drop(rt);
                audit::record("SRVFL", Outcome::Success, &self.tag, "endpoint connected (passive)");
            }
            TransportEvent::Closed | TransportEvent::Failed => {
                self.transition_closed();
            }
            TransportEvent::StartDtConReceived => {
                let mut rt = self.runtime.lock().unwrap();
                rt.next_time_sync_at = Some(Instant::now());
                rt.time_synchronised = false;
                rt.first_time_sync_done = false;
                rt.first_gi_sent = false;
                rt.next_gi_start_at = None;
            }
            TransportEvent::StopDtConReceived => {
                let mut rt = self.runtime.lock().unwrap();
                rt.state = State::ConnectedInactive;
            }
            TransportEvent::AsduReceived(asdu) => self.handle_asdu(asdu),
        }
    }

    fn handle_asdu(&self, asdu: DecodedAsdu) {
        dispatcher::handle_asdu(self, &self.exchange, &self.commands, &self.ingest, asdu);
    }

    // -- periodic tasks (spec.md §4.2, only while ConnectedActive) ----------

    fn execute_periodic_tasks(&self) {
        self.execute_time_sync();
        self.check_gi_timeout();
        self.execute_gi_cycle();
    }

    /// spec.md §4.2/§7: if `gi_time` seconds elapse with no GI completion,
    /// mark the cycle FAILED and close the connection (§8 scenario 2).
    fn check_gi_timeout(&self) {
        if self.app.gi_time == 0 {
            return;
        }
        let timed_out = {
            let rt = self.runtime.lock().unwrap();
            rt.interrogation_in_progress
                && rt
                    .interrogation_sent_at
                    .is_some_and(|at| Instant::now().saturating_duration_since(at) > Duration::from_secs(self.app.gi_time as u64))
        };
        if timed_out {
            log::warn!("GI timeout on {}", self.tag);
            self.fail_gi_cycle();
        }
    }

    fn execute_time_sync(&self) {
        if self.app.time_sync == 0 {
            return;
        }
        let due = {
            let rt = self.runtime.lock().unwrap();
            rt.next_time_sync_at.is_some_and(|at| Instant::now() >= at)
        };
        if !due {
            return;
        }
        let ca = self.app.time_sync_ca.unwrap_or(self.app.default_ca);
        let sent = self
            .transport
            .lock()
            .unwrap()
            .as_mut()
            .map(|t| t.send_clock_sync(ca))
            .unwrap_or(false);
        let mut rt = self.runtime.lock().unwrap();
        if sent {
            // Completion (ACT-CON/UNKNOWN-TYPE-ID) is applied from the
            // dispatcher once the response ASDU arrives; here we only avoid
            // re-sending before a response window elapses.
            rt.next_time_sync_at = Some(Instant::now() + Duration::from_secs(self.app.time_sync as u64));
        } else {
            log::warn!("time-sync send failed on {}", self.tag);
        }
    }

    /// Applies a received time-sync completion (spec.md §4.2).
    pub(crate) fn complete_time_sync(&self, negative: bool) {
        let mut rt = self.runtime.lock().unwrap();
        if negative {
            log::error!("time-sync ACT-CON negative on {}", self.tag);
            return;
        }
        rt.time_synchronised = true;
        rt.first_time_sync_done = true;
        rt.next_time_sync_at = Some(Instant::now() + Duration::from_secs(self.app.time_sync.max(1) as u64));
    }

    fn execute_gi_cycle(&self) {
        if !self.app.gi_enabled {
            return;
        }
        let rt_snapshot = {
            let rt = self.runtime.lock().unwrap();
            (
                rt.first_time_sync_done || self.app.time_sync == 0,
                rt.interrogation_in_progress,
                rt.next_gi_start_at,
                rt.gi_requested,
                rt.gi_status,
            )
        };
        let (time_sync_ready, in_progress, next_start, gi_requested, gi_status) = rt_snapshot;
        if !time_sync_ready || in_progress {
            return;
        }

        let due_by_schedule = next_start.is_some_and(|at| Instant::now() >= at);
        let due_by_end_of_init = {
            let mut rt = self.runtime.lock().unwrap();
            std::mem::take(&mut rt.end_of_init_received)
        };
        let due_by_external_trigger =
            gi_requested && matches!(gi_status, GiStatus::Failed | GiStatus::Finished | GiStatus::Idle);
        let first_cycle = !{ self.runtime.lock().unwrap().first_gi_sent };

        if !(first_cycle || due_by_schedule || due_by_end_of_init || due_by_external_trigger) {
            return;
        }

        self.start_gi_cycle();
    }

    fn start_gi_cycle(&self) {
        let cas: Vec<u16> = if self.app.gi_all_ca {
            self.exchange
                .list_by_gi_group(0)
                .iter()
                .map(|p| p.common_address)
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            vec![self.app.broadcast_ca()]
        };

        let pending = self
            .exchange
            .list_by_gi_group(0)
            .iter()
            .map(|p| (p.common_address, p.info_object_address))
            .collect();

        {
            let mut rt = self.runtime.lock().unwrap();
            rt.first_gi_sent = true;
            rt.interrogation_in_progress = true;
            rt.interrogation_request_state = 1;
            rt.gi_status = GiStatus::Started;
            rt.gi_ca_queue = cas.into();
            rt.gi_pending = pending;
            rt.interrogation_sent_at = Some(Instant::now());
        }
        self.send_next_gi_ca();
    }

    fn send_next_gi_ca(&self) {
        let ca = {
            let mut rt = self.runtime.lock().unwrap();
            rt.gi_ca_queue.pop_front()
        };
        let Some(ca) = ca else {
            self.finish_gi_cycle(GiStatus::Finished);
            return;
        };
        let sent = self
            .transport
            .lock()
            .unwrap()
            .as_mut()
            .map(|t| t.send_interrogation(ca))
            .unwrap_or(false);
        if !sent {
            self.fail_gi_cycle();
        }
    }

    /// Applies an INTERROGATION_COMMAND response (spec.md §4.2/§4.4).
    pub(crate) fn on_interrogation_response(&self, negative: bool, is_act_term: bool) {
        let state = self.runtime.lock().unwrap().interrogation_request_state;
        if !is_act_term && state == 1 {
            if negative {
                self.fail_gi_cycle();
                return;
            }
            let mut rt = self.runtime.lock().unwrap();
            rt.interrogation_request_state = 2;
            rt.gi_status = GiStatus::InProgress;
            rt.interrogation_sent_at = Some(Instant::now());
        } else if is_act_term && state == 2 {
            // More CAs queued under gi_for_all_ca sends the next one instead
            // of finishing; only the last CA's ACT-TERM truly completes it.
            let more_pending = !self.runtime.lock().unwrap().gi_ca_queue.is_empty();
            if more_pending {
                {
                    let mut rt = self.runtime.lock().unwrap();
                    rt.interrogation_request_state = 1;
                }
                self.send_next_gi_ca();
            } else {
                self.finish_gi_cycle(GiStatus::Finished);
            }
        }
    }

    fn fail_gi_cycle(&self) {
        dispatcher::project_missing_station_group(self);
        self.finish_gi_cycle(GiStatus::Failed);
        self.request_disconnect();
    }

    fn finish_gi_cycle(&self, status: GiStatus) {
        if status == GiStatus::Finished {
            dispatcher::project_missing_station_group(self);
        }
        let mut rt = self.runtime.lock().unwrap();
        rt.interrogation_in_progress = false;
        rt.interrogation_request_state = 0;
        rt.gi_status = status;
        rt.gi_requested = false;
        rt.next_gi_start_at = if self.app.gi_cycle > 0 {
            Some(Instant::now() + Duration::from_secs(self.app.gi_cycle as u64))
        } else {
            None
        };
    }

    pub(crate) fn on_end_of_initialisation(&self) {
        self.runtime.lock().unwrap().end_of_init_received = true;
    }

    pub(crate) fn gi_pending_snapshot(&self) -> HashSet<(u16, u32)> {
        self.runtime.lock().unwrap().gi_pending.clone()
    }

    pub(crate) fn remove_from_gi_pending(&self, ca: u16, ioa: u32) {
        self.runtime.lock().unwrap().gi_pending.remove(&(ca, ioa));
    }

    pub(crate) fn gi_in_progress(&self) -> bool {
        self.runtime.lock().unwrap().interrogation_in_progress
    }

    pub(crate) fn exchange(&self) -> &ExchangeTable {
        &self.exchange
    }

    pub(crate) fn ingest(&self) -> &IngestCallback {
        &self.ingest
    }

    // -- command sending (spec.md §4.2 "six primitives") --------------------

    /// Forces an interrogation on `ca` outside the normal GI-cycle bookkeeping
    /// (spec.md §4.7 `"CS104_Connection_sendInterrogationCommand"`). Does not
    /// touch `interrogation_request_state`/`gi_status`; a response still
    /// flows through the dispatcher like any other ASDU.
    pub fn send_interrogation_now(&self, ca: u16) -> bool {
        if !self.is_active() {
            return false;
        }
        self.transport
            .lock()
            .unwrap()
            .as_mut()
            .map(|t| t.send_interrogation(ca))
            .unwrap_or(false)
    }

    /// Sends one command. Must not be called unless `is_active()`. Takes
    /// `self: &Arc<Endpoint>` (rather than `&self`) because the outstanding
    /// commands registry needs a `Weak<Endpoint>` to keep the endpoint alive
    /// until the command resolves (spec.md §4.5/§9).
    pub fn send_command(self: &Arc<Endpoint>, cmd: WireCommand) -> bool {
        if !self.is_active() {
            return false;
        }
        let endpoint_ref = Arc::downgrade(self);
        if !self.commands.admit(cmd.type_id(), cmd.ca(), cmd.ioa(), endpoint_ref) {
            return false;
        }
        let sent = self
            .transport
            .lock()
            .unwrap()
            .as_mut()
            .map(|t| t.send_command(cmd))
            .unwrap_or(false);
        if !sent {
            self.commands.complete_act_term(cmd.type_id(), cmd.ca(), cmd.ioa());
        }
        sent
    }
}
