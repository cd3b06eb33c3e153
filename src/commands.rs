//! C5: the outstanding-commands registry — tracks commands sent downstream
//! awaiting ACT-CON/ACT-TERM, with per-command timeouts and a global
//! parallelism cap (spec.md §4.5).
//!
//! Grounded on the teacher's `balancer::manager` pattern of a single
//! `Mutex`-guarded collection swept by the supervisor tick, and on spec.md
//! §5's mutex-ordering rule (`active_endpoint → outstanding`): callers that
//! need both locks must take the active-endpoint lock first.

use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::types::TypeId;

/// One command sent downstream and not yet resolved.
pub struct OutstandingCommand {
    pub type_id: TypeId,
    pub ca: u16,
    pub ioa: u32,
    pub endpoint: Weak<Endpoint>,
    pub act_con_received: bool,
    pub submitted_at: Instant,
}

impl OutstandingCommand {
    /// Single/double/step commands wait for ACT-CON then ACT-TERM;
    /// setpoints are removed on ACT-CON alone (spec.md §4.5).
    fn is_two_phase(&self) -> bool {
        matches!(
            self.type_id,
            TypeId::C_SC_NA_1
                | TypeId::C_SC_TA_1
                | TypeId::C_DC_NA_1
                | TypeId::C_DC_TA_1
                | TypeId::C_RC_NA_1
                | TypeId::C_RC_TA_1
        )
    }
}

/// Single-mutex-guarded list of outstanding commands (spec.md §4.5
/// "Concurrency: a single mutex serialises list access").
pub struct CommandsRegistry {
    inner: Mutex<Vec<OutstandingCommand>>,
    /// `0` means unbounded (spec.md §3 invariant on `cmd_parallel`).
    limit: usize,
    /// Configured `cmd_exec_timeout` (spec.md §4.5), applied by
    /// `sweep_timeouts` on every supervisor tick.
    exec_timeout: Duration,
}

impl Default for CommandsRegistry {
    fn default() -> CommandsRegistry {
        CommandsRegistry::new(0, Duration::from_millis(10_000))
    }
}

impl CommandsRegistry {
    pub fn new(cmd_parallel: usize, cmd_exec_timeout: Duration) -> CommandsRegistry {
        CommandsRegistry {
            inner: Mutex::new(Vec::new()),
            limit: cmd_parallel,
            exec_timeout: cmd_exec_timeout,
        }
    }

    /// Admits a new outstanding command, or rejects it if `limit` is already
    /// reached. Callers must roll back their wire send on `false`.
    pub fn admit(&self, type_id: TypeId, ca: u16, ioa: u32, endpoint: Weak<Endpoint>) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if self.limit > 0 && guard.len() >= self.limit {
            return false;
        }
        guard.push(OutstandingCommand {
            type_id,
            ca,
            ioa,
            endpoint,
            act_con_received: false,
            submitted_at: Instant::now(),
        });
        true
    }

    /// Applies an ACT-CON for `(type_id, ca, ioa)`. Two-phase commands stay
    /// in the registry awaiting ACT-TERM with their timer reset; setpoints
    /// are removed immediately. Returns `true` if a match was found.
    pub fn complete_act_con(&self, type_id: TypeId, ca: u16, ioa: u32) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let Some(pos) = guard
            .iter()
            .position(|c| c.type_id == type_id && c.ca == ca && c.ioa == ioa)
        else {
            return false;
        };
        if guard[pos].is_two_phase() {
            guard[pos].act_con_received = true;
            guard[pos].submitted_at = Instant::now();
        } else {
            guard.remove(pos);
        }
        true
    }

    /// Applies an ACT-TERM, removing the matching two-phase command.
    pub fn complete_act_term(&self, type_id: TypeId, ca: u16, ioa: u32) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.len();
        guard.retain(|c| !(c.type_id == type_id && c.ca == ca && c.ioa == ioa));
        guard.len() != before
    }

    /// Removes entries whose ACT-CON (or, once received, ACT-TERM) phase has
    /// exceeded `cmd_exec_timeout` since `submitted_at`, logging a warning
    /// per removal (spec.md §4.5/§7). Called once per 100 ms supervisor tick.
    pub fn sweep_timeouts(&self) {
        let mut guard = self.inner.lock().unwrap();
        let now = Instant::now();
        guard.retain(|c| {
            let expired = now.saturating_duration_since(c.submitted_at) > self.exec_timeout;
            if expired {
                log::warn!(
                    "command timeout: type_id={:?} ca={} ioa={} act_con_received={}",
                    c.type_id,
                    c.ca,
                    c.ioa,
                    c.act_con_received
                );
            }
            !expired
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all outstanding commands without ACT-TERM (spec.md §5
    /// "Cancellation ... outstanding commands are dropped without ACT-TERM"),
    /// called during supervisor shutdown before endpoints are dropped so the
    /// registry's `Weak<Endpoint>` handles never outlive their targets.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn no_endpoint() -> Weak<Endpoint> {
        Weak::new()
    }

    fn reg(cmd_parallel: usize) -> CommandsRegistry {
        CommandsRegistry::new(cmd_parallel, std::time::Duration::from_secs(10))
    }

    #[test]
    fn admission_respects_parallelism_cap() {
        let reg = reg(1);
        assert!(reg.admit(TypeId::C_SC_NA_1, 1, 100, no_endpoint()));
        assert!(!reg.admit(TypeId::C_SC_NA_1, 1, 200, no_endpoint()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unbounded_when_limit_zero() {
        let reg = reg(0);
        for ioa in 0..50 {
            assert!(reg.admit(TypeId::C_SC_NA_1, 1, ioa, no_endpoint()));
        }
        assert_eq!(reg.len(), 50);
    }

    #[test]
    fn two_phase_command_survives_act_con_and_clears_on_act_term() {
        let reg = reg(0);
        reg.admit(TypeId::C_SC_NA_1, 1, 100, no_endpoint());
        assert!(reg.complete_act_con(TypeId::C_SC_NA_1, 1, 100));
        assert_eq!(reg.len(), 1, "two-phase command awaits ACT-TERM");
        assert!(reg.complete_act_term(TypeId::C_SC_NA_1, 1, 100));
        assert!(reg.is_empty());
    }

    #[test]
    fn setpoint_clears_on_act_con_alone() {
        let reg = reg(0);
        reg.admit(TypeId::C_SE_NA_1, 1, 100, no_endpoint());
        assert!(reg.complete_act_con(TypeId::C_SE_NA_1, 1, 100));
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let reg = CommandsRegistry::new(0, std::time::Duration::from_secs(0));
        reg.admit(TypeId::C_SC_NA_1, 1, 100, no_endpoint());
        reg.sweep_timeouts();
        assert!(reg.is_empty());
    }
}
