//! Multi-key scheduler: budgets, health, cool-downs, atomic reservation
//!
//! Each configured key carries a requests-per-minute and tokens-per-minute
//! budget tracked over a 60-second window that starts at the first debit of
//! the current minute. Reservation is a check-and-debit under one lock, so
//! two concurrent callers can never both spend the last slot of a budget.
//!
//! The one rule this module must never bend: a safety-policy block is not a
//! capacity signal. Releasing a reservation with `SafetyBlock` leaves the
//! key healthy and out of cool-down.

use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Workload classes guide key-tier selection and safety escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClass {
    Light,
    Standard,
    Heavy,
}

impl WorkloadClass {
    /// The priority tag this workload prefers on a key.
    pub fn preferred_tag(&self) -> &'static str {
        match self {
            WorkloadClass::Light | WorkloadClass::Standard => "flash",
            WorkloadClass::Heavy => "pro",
        }
    }

    /// One step up the tier ladder; `Heavy` stays heavy.
    pub fn escalate(&self) -> WorkloadClass {
        match self {
            WorkloadClass::Light => WorkloadClass::Standard,
            WorkloadClass::Standard | WorkloadClass::Heavy => WorkloadClass::Heavy,
        }
    }
}

/// Model selection hint carried with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelPreference {
    Any,
    Exact(String),
}

impl ModelPreference {
    fn matches(&self, model_name: &str) -> bool {
        match self {
            ModelPreference::Any => true,
            ModelPreference::Exact(name) => name == model_name,
        }
    }
}

/// One configured key with a resolved credential.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key_id: String,
    /// Opaque credential handle, already resolved from the secret store.
    pub credential: String,
    pub model_name: String,
    pub priority_tags: Vec<String>,
    pub rpm_budget: u32,
    pub tpm_budget: u64,
    pub active: bool,
}

/// Outcome reported when a reservation is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Ok,
    RateLimited,
    SafetyBlock,
    TransientError,
    FatalError,
}

/// A capacity debit held for the duration of one request.
#[derive(Debug)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub key_id: String,
    pub model: String,
    pub credential: String,
    pub prompt_tokens: u64,
    pub reserved_completion_tokens: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ReserveError {
    /// No key matches the model preference at all.
    #[error("no key matches model preference")]
    NoMatchingKey,
    /// Matching keys exist but none has budget or health right now.
    #[error("all matching keys are exhausted or cooling down")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum KeyManagerError {
    #[error("keys manifest is empty after filtering inactive keys")]
    NoActiveKeys,
}

/// Exponential cool-down: base 2, initial 1 s, capped at 60 s, ±25% jitter.
pub(crate) fn cooldown_backoff(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(6);
    let base_secs = (1u64 << exp).min(60);
    let base_ms = base_secs * 1000;
    let jitter_span = base_ms / 4;
    let jitter: i64 = rand::thread_rng().gen_range(-(jitter_span as i64)..=(jitter_span as i64));
    Duration::from_millis((base_ms as i64 + jitter).max(1) as u64)
}

const WINDOW: Duration = Duration::from_secs(60);
const TRANSIENT_COOL_DOWN: Duration = Duration::from_secs(30);

struct KeyState {
    record: KeyRecord,
    window_started: Option<Instant>,
    rpm_used: u32,
    tpm_used: u64,
    healthy: bool,
    cool_down_until: Option<Instant>,
    consecutive_rate_limits: u32,
    last_error: Option<ReleaseOutcome>,
    last_used: Option<Instant>,
}

impl KeyState {
    fn new(record: KeyRecord) -> Self {
        Self {
            record,
            window_started: None,
            rpm_used: 0,
            tpm_used: 0,
            healthy: true,
            cool_down_until: None,
            consecutive_rate_limits: 0,
            last_error: None,
            last_used: None,
        }
    }

    fn in_cool_down(&self, now: Instant) -> bool {
        self.cool_down_until.map(|t| t > now).unwrap_or(false)
    }

    /// Roll the window forward if more than a minute has passed.
    fn refresh_window(&mut self, now: Instant) {
        if let Some(started) = self.window_started {
            if now.duration_since(started) >= WINDOW {
                self.window_started = None;
                self.rpm_used = 0;
                self.tpm_used = 0;
            }
        }
    }

    fn remaining_rpm(&self) -> u32 {
        self.record.rpm_budget.saturating_sub(self.rpm_used)
    }

    fn remaining_tpm(&self) -> u64 {
        self.record.tpm_budget.saturating_sub(self.tpm_used)
    }
}

struct OpenReservation {
    key_id: String,
    tpm_debited: u64,
    deadline: Instant,
}

struct KeyTable {
    keys: Vec<KeyState>,
    open: HashMap<Uuid, OpenReservation>,
}

/// Configuration for the key manager.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// One request's timeout; leaked reservations are reaped after twice this.
    pub request_timeout: Duration,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Selects and reserves eligible keys, and absorbs request outcomes.
pub struct KeyManager {
    table: Mutex<KeyTable>,
    config: KeyManagerConfig,
}

impl KeyManager {
    pub fn new(records: Vec<KeyRecord>, config: KeyManagerConfig) -> Result<Self, KeyManagerError> {
        let keys: Vec<KeyState> = records
            .into_iter()
            .filter(|r| r.active)
            .map(KeyState::new)
            .collect();
        if keys.is_empty() {
            return Err(KeyManagerError::NoActiveKeys);
        }
        Ok(Self {
            table: Mutex::new(KeyTable {
                keys,
                open: HashMap::new(),
            }),
            config,
        })
    }

    /// Reserve capacity for one request.
    pub fn reserve(
        &self,
        model_preference: &ModelPreference,
        workload: WorkloadClass,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<Reservation, ReserveError> {
        self.reserve_with_preference(model_preference, workload, prompt_tokens, completion_tokens, None)
    }

    /// Reserve capacity, preferring a specific key when it is still eligible.
    /// The safety-recovery path uses this to retry on the same key first.
    pub fn reserve_with_preference(
        &self,
        model_preference: &ModelPreference,
        workload: WorkloadClass,
        prompt_tokens: u64,
        completion_tokens: u64,
        preferred_key: Option<&str>,
    ) -> Result<Reservation, ReserveError> {
        let needed_tpm = prompt_tokens + completion_tokens;
        let now = Instant::now();
        let mut table = self.table.lock().expect("key table poisoned");

        let mut matching = false;
        for key in table.keys.iter_mut() {
            key.refresh_window(now);
            if model_preference.matches(&key.record.model_name) {
                matching = true;
            }
        }
        if !matching {
            return Err(ReserveError::NoMatchingKey);
        }

        let eligible: Vec<usize> = table
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| {
                k.healthy
                    && !k.in_cool_down(now)
                    && model_preference.matches(&k.record.model_name)
                    && k.remaining_rpm() >= 1
                    && k.remaining_tpm() >= needed_tpm
            })
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            return Err(ReserveError::Exhausted);
        }

        // Prefer tag-matching keys; fall back across tiers when none qualify.
        let tag = workload.preferred_tag();
        let tagged: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|&i| table.keys[i].record.priority_tags.iter().any(|t| t == tag))
            .collect();
        let pool = if tagged.is_empty() { eligible } else { tagged };

        let chosen = preferred_key
            .and_then(|id| {
                pool.iter()
                    .copied()
                    .find(|&i| table.keys[i].record.key_id == id)
            })
            .unwrap_or_else(|| {
                // Rank by TPM headroom, break ties round-robin by least
                // recent use (never-used keys first).
                let mut ranked = pool.clone();
                ranked.sort_by(|&a, &b| {
                    let ka = &table.keys[a];
                    let kb = &table.keys[b];
                    kb.remaining_tpm()
                        .cmp(&ka.remaining_tpm())
                        .then_with(|| match (ka.last_used, kb.last_used) {
                            (None, None) => std::cmp::Ordering::Equal,
                            (None, Some(_)) => std::cmp::Ordering::Less,
                            (Some(_), None) => std::cmp::Ordering::Greater,
                            (Some(a), Some(b)) => a.cmp(&b),
                        })
                });
                ranked[0]
            });

        // Debit inside the same lock: this is the atomic check-and-set.
        let key = &mut table.keys[chosen];
        if key.window_started.is_none() {
            key.window_started = Some(now);
        }
        key.rpm_used += 1;
        key.tpm_used += needed_tpm;
        key.last_used = Some(now);

        let reservation = Reservation {
            reservation_id: Uuid::new_v4(),
            key_id: key.record.key_id.clone(),
            model: key.record.model_name.clone(),
            credential: key.record.credential.clone(),
            prompt_tokens,
            reserved_completion_tokens: completion_tokens,
        };
        table.open.insert(
            reservation.reservation_id,
            OpenReservation {
                key_id: reservation.key_id.clone(),
                tpm_debited: needed_tpm,
                deadline: now + 2 * self.config.request_timeout,
            },
        );

        debug!(
            key_id = %reservation.key_id,
            tpm = needed_tpm,
            "reserved key capacity"
        );
        Ok(reservation)
    }

    /// Release a reservation with its outcome, settling token accounting.
    pub fn release(
        &self,
        reservation: Reservation,
        actual_completion_tokens: u64,
        outcome: ReleaseOutcome,
    ) {
        let now = Instant::now();
        let mut table = self.table.lock().expect("key table poisoned");

        let open = table.open.remove(&reservation.reservation_id);
        if open.is_none() {
            // Already handled by the reaper; nothing left to settle.
            warn!(key_id = %reservation.key_id, "release for unknown reservation");
            return;
        }

        let Some(key) = table
            .keys
            .iter_mut()
            .find(|k| k.record.key_id == reservation.key_id)
        else {
            return;
        };

        let debited = reservation.prompt_tokens + reservation.reserved_completion_tokens;
        match outcome {
            ReleaseOutcome::Ok => {
                // Settle to the real spend: prompt plus actual completion.
                let actual = reservation.prompt_tokens + actual_completion_tokens;
                key.tpm_used = key.tpm_used.saturating_sub(debited) + actual;
                key.consecutive_rate_limits = 0;
                key.last_error = None;
            }
            ReleaseOutcome::SafetyBlock => {
                // A policy refusal consumed no completion budget, and it says
                // nothing about the key's capacity or health.
                key.tpm_used = key.tpm_used.saturating_sub(debited);
                key.last_error = Some(ReleaseOutcome::SafetyBlock);
            }
            ReleaseOutcome::RateLimited => {
                key.tpm_used = key.tpm_used.saturating_sub(debited);
                key.consecutive_rate_limits += 1;
                let back_off = cooldown_backoff(key.consecutive_rate_limits);
                key.cool_down_until = Some(now + back_off);
                key.last_error = Some(ReleaseOutcome::RateLimited);
                info!(
                    key_id = %reservation.key_id,
                    back_off_ms = back_off.as_millis() as u64,
                    "key rate limited, cooling down"
                );
            }
            ReleaseOutcome::TransientError => {
                key.tpm_used = key.tpm_used.saturating_sub(debited);
                key.cool_down_until = Some(now + TRANSIENT_COOL_DOWN);
                key.last_error = Some(ReleaseOutcome::TransientError);
            }
            ReleaseOutcome::FatalError => {
                key.tpm_used = key.tpm_used.saturating_sub(debited);
                key.healthy = false;
                key.last_error = Some(ReleaseOutcome::FatalError);
                warn!(key_id = %reservation.key_id, "key marked unhealthy until manual reset");
            }
        }
    }

    /// Reap reservations never released within `2 × request_timeout`,
    /// treating each as a transient error.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock().expect("key table poisoned");

        let expired: Vec<Uuid> = table
            .open
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(open) = table.open.remove(id) {
                warn!(key_id = %open.key_id, "reaping leaked reservation");
                if let Some(key) = table
                    .keys
                    .iter_mut()
                    .find(|k| k.record.key_id == open.key_id)
                {
                    key.tpm_used = key.tpm_used.saturating_sub(open.tpm_debited);
                    key.cool_down_until = Some(now + TRANSIENT_COOL_DOWN);
                    key.last_error = Some(ReleaseOutcome::TransientError);
                }
            }
        }
        expired.len()
    }

    /// Background reaper task; ticks at half the request timeout.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.request_timeout / 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let reaped = manager.reap_expired();
                if reaped > 0 {
                    info!(count = reaped, "reaper released leaked reservations");
                }
            }
        })
    }

    /// Manually restore a key marked unhealthy by a fatal error.
    pub fn reset_key(&self, key_id: &str) -> bool {
        let mut table = self.table.lock().expect("key table poisoned");
        if let Some(key) = table.keys.iter_mut().find(|k| k.record.key_id == key_id) {
            key.healthy = true;
            key.cool_down_until = None;
            key.consecutive_rate_limits = 0;
            key.last_error = None;
            true
        } else {
            false
        }
    }

    pub fn health(&self) -> KeyManagerSnapshot {
        let now = Instant::now();
        let table = self.table.lock().expect("key table poisoned");
        KeyManagerSnapshot {
            keys: table
                .keys
                .iter()
                .map(|k| KeySnapshot {
                    key_id: k.record.key_id.clone(),
                    model_name: k.record.model_name.clone(),
                    healthy: k.healthy,
                    in_cool_down: k.in_cool_down(now),
                    rpm_used: k.rpm_used,
                    rpm_budget: k.record.rpm_budget,
                    tpm_used: k.tpm_used,
                    tpm_budget: k.record.tpm_budget,
                    consecutive_rate_limits: k.consecutive_rate_limits,
                    last_error: k.last_error,
                })
                .collect(),
            open_reservations: table.open.len(),
        }
    }
}

/// Point-in-time view of one key.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub key_id: String,
    pub model_name: String,
    pub healthy: bool,
    pub in_cool_down: bool,
    pub rpm_used: u32,
    pub rpm_budget: u32,
    pub tpm_used: u64,
    pub tpm_budget: u64,
    pub consecutive_rate_limits: u32,
    pub last_error: Option<ReleaseOutcome>,
}

/// Point-in-time view of the whole key pool.
#[derive(Debug, Clone, Serialize)]
pub struct KeyManagerSnapshot {
    pub keys: Vec<KeySnapshot>,
    pub open_reservations: usize,
}

impl KeyManagerSnapshot {
    /// The manager is serviceable while at least one key can take traffic.
    pub fn any_serviceable(&self) -> bool {
        self.keys.iter().any(|k| k.healthy && !k.in_cool_down)
    }

    pub fn key(&self, key_id: &str) -> Option<&KeySnapshot> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }
}
