//! Recheck scheduling: persisted interval state, due detection, and the
//! periodic trigger that wakes the check flow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, info};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::store::{KeyValueStore, StoreError, StoreValue};

/// Unique name the periodic recheck is registered under.
pub const SCHEDULE_NAME: &str = "xcman-update-check";

/// Remaining time below which a check is treated as already due.
pub const NEAR_DUE_THRESHOLD: Duration = Duration::from_secs(60);

/// Shortest period a trigger is registered with.
pub const MIN_TRIGGER_PERIOD_MINUTES: u64 = 15;

pub mod keys {
    pub const SELECTED_MODEL: &str = "selected_model";
    pub const INTERVAL_DAYS: &str = "interval_days";
    pub const INTERVAL_HOURS: &str = "interval_hours";
    pub const INTERVAL_MINUTES: &str = "interval_minutes";
    pub const LAST_CHECK_MILLIS: &str = "last_check_millis";
    pub const REMINDER_ENABLED: &str = "reminder_enabled";
    pub const UNHIDDEN_LAUNCH: &str = "unhidden_launch";
    pub const MANUAL_LAUNCH: &str = "manual_launch";
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckInterval {
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
}

impl CheckInterval {
    #[must_use]
    pub fn new(days: u32, hours: u32, minutes: u32) -> Self {
        Self {
            days,
            hours,
            minutes,
        }
    }

    #[must_use]
    pub fn as_minutes(self) -> u64 {
        u64::from(self.days) * 24 * 60 + u64::from(self.hours) * 60 + u64::from(self.minutes)
    }

    #[must_use]
    pub fn as_millis(self) -> i64 {
        i64::try_from(self.as_minutes() * 60_000).unwrap_or(i64::MAX)
    }
}

impl std::fmt::Display for CheckInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}d {}h {}m", self.days, self.hours, self.minutes)
    }
}

/// Snapshot of the persisted scheduling keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub interval: Option<CheckInterval>,
    pub last_check_epoch_millis: Option<i64>,
    pub reminder_enabled: bool,
    pub due_flag: bool,
}

impl ScheduleState {
    /// The interval, if reminders are on and one has been configured.
    #[must_use]
    pub fn active_interval(&self) -> Option<CheckInterval> {
        self.interval.filter(|_| self.reminder_enabled)
    }

    /// Time left before the next check. Clock jumps backwards are treated
    /// as no time elapsed.
    #[must_use]
    pub fn remaining_millis(&self, now_millis: i64) -> Option<i64> {
        let interval = self.active_interval()?;
        let elapsed = (now_millis - self.last_check_epoch_millis.unwrap_or(0)).max(0);
        Some(interval.as_millis().saturating_sub(elapsed))
    }
}

/// Typed access to the scheduling keys of a [`KeyValueStore`].
#[derive(Clone)]
pub struct ScheduleStore {
    store: Arc<dyn KeyValueStore>,
}

impl ScheduleStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    pub fn load(&self) -> Result<ScheduleState, StoreError> {
        let days = self.store.get_int(keys::INTERVAL_DAYS)?;
        let hours = self.store.get_int(keys::INTERVAL_HOURS)?;
        let minutes = self.store.get_int(keys::INTERVAL_MINUTES)?;
        let interval = (days.is_some() || hours.is_some() || minutes.is_some()).then(|| {
            CheckInterval::new(
                non_negative(days),
                non_negative(hours),
                non_negative(minutes),
            )
        });

        Ok(ScheduleState {
            interval,
            last_check_epoch_millis: self.store.get_long(keys::LAST_CHECK_MILLIS)?,
            reminder_enabled: self.store.get_bool(keys::REMINDER_ENABLED)?.unwrap_or(false),
            due_flag: self.store.get_bool(keys::UNHIDDEN_LAUNCH)?.unwrap_or(false),
        })
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be written.
    pub fn set_interval(&self, interval: CheckInterval) -> Result<(), StoreError> {
        self.store
            .put(keys::INTERVAL_DAYS, StoreValue::Int(clamp_i32(interval.days)))?;
        self.store
            .put(keys::INTERVAL_HOURS, StoreValue::Int(clamp_i32(interval.hours)))?;
        self.store.put(
            keys::INTERVAL_MINUTES,
            StoreValue::Int(clamp_i32(interval.minutes)),
        )
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be written.
    pub fn set_reminder_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.store
            .put(keys::REMINDER_ENABLED, StoreValue::Bool(enabled))
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be written.
    pub fn set_last_check(&self, epoch_millis: i64) -> Result<(), StoreError> {
        self.store
            .put(keys::LAST_CHECK_MILLIS, StoreValue::Long(epoch_millis))
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be written.
    pub fn clear_last_check(&self) -> Result<(), StoreError> {
        self.store.remove(keys::LAST_CHECK_MILLIS)
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    pub fn is_due(&self) -> Result<bool, StoreError> {
        Ok(self.store.get_bool(keys::UNHIDDEN_LAUNCH)?.unwrap_or(false))
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be written.
    pub fn set_due(&self, due: bool) -> Result<(), StoreError> {
        self.store.put(keys::UNHIDDEN_LAUNCH, StoreValue::Bool(due))
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    pub fn manual_launch(&self) -> Result<bool, StoreError> {
        Ok(self.store.get_bool(keys::MANUAL_LAUNCH)?.unwrap_or(false))
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be written.
    pub fn set_manual_launch(&self, manual: bool) -> Result<(), StoreError> {
        self.store.put(keys::MANUAL_LAUNCH, StoreValue::Bool(manual))
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    pub fn selected_model(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get_string(keys::SELECTED_MODEL)?
            .filter(|model| !model.trim().is_empty()))
    }

    /// # Errors
    /// Returns an error when the underlying store cannot be written.
    pub fn set_selected_model(&self, model: Option<&str>) -> Result<(), StoreError> {
        match model {
            Some(model) => self
                .store
                .put(keys::SELECTED_MODEL, StoreValue::String(model.to_string())),
            None => self.store.remove(keys::SELECTED_MODEL),
        }
    }
}

fn non_negative(value: Option<i32>) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Leave an existing registration under the same name untouched.
    KeepExisting,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    KeptExisting,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("no async runtime is available to host trigger {name}")]
    NoRuntime { name: String },
}

/// Something that can wake the process periodically under a unique name.
pub trait PeriodicTrigger: Send + Sync {
    /// # Errors
    /// Returns an error when the trigger cannot be registered.
    fn schedule(
        &self,
        name: &str,
        interval_minutes: u64,
        initial_delay_minutes: u64,
        policy: TriggerPolicy,
    ) -> Result<RegistrationOutcome, TriggerError>;

    /// # Errors
    /// Returns an error when the trigger cannot be cancelled.
    fn cancel(&self, name: &str) -> Result<(), TriggerError>;
}

pub type TriggerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process trigger backed by tokio timers. Each name owns one task.
pub struct TokioTrigger {
    runtime: tokio::runtime::Handle,
    on_fire: TriggerCallback,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTrigger {
    /// # Errors
    /// Returns an error when called outside a tokio runtime.
    pub fn new(on_fire: TriggerCallback) -> Result<Self, TriggerError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TriggerError::NoRuntime {
                name: SCHEDULE_NAME.to_string(),
            })?;
        Ok(Self {
            runtime,
            on_fire,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn is_scheduled(&self, name: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.get(name).is_some_and(|task| !task.is_finished())
    }
}

impl PeriodicTrigger for TokioTrigger {
    fn schedule(
        &self,
        name: &str,
        interval_minutes: u64,
        initial_delay_minutes: u64,
        policy: TriggerPolicy,
    ) -> Result<RegistrationOutcome, TriggerError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = tasks.get(name) {
            if policy == TriggerPolicy::KeepExisting && !existing.is_finished() {
                debug!("Trigger {name} already registered, keeping it");
                return Ok(RegistrationOutcome::KeptExisting);
            }
            existing.abort();
        }

        let period = Duration::from_secs(interval_minutes.max(1) * 60);
        let initial_delay = Duration::from_secs(initial_delay_minutes * 60);
        let on_fire = Arc::clone(&self.on_fire);
        let task = self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticks = tokio::time::interval_at(start, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                on_fire().await;
            }
        });

        tasks.insert(name.to_string(), task);
        info!("Registered trigger {name} every {interval_minutes} min");
        Ok(RegistrationOutcome::Registered)
    }

    fn cancel(&self, name: &str) -> Result<(), TriggerError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = tasks.remove(name) {
            task.abort();
            info!("Cancelled trigger {name}");
        }
        Ok(())
    }
}

impl Drop for TokioTrigger {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.values() {
            task.abort();
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    /// Reminders are off or no interval has been configured.
    Idle,
    Scheduled,
    CheckDue,
    Checking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStart {
    Started { was_due: bool },
    AlreadyRunning,
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives the recheck state machine over a [`ScheduleStore`].
pub struct Scheduler {
    store: ScheduleStore,
    trigger: Arc<dyn PeriodicTrigger>,
    registering: AtomicBool,
    checking: AtomicBool,
}

impl Scheduler {
    #[must_use]
    pub fn new(store: ScheduleStore, trigger: Arc<dyn PeriodicTrigger>) -> Self {
        Self {
            store,
            trigger,
            registering: AtomicBool::new(false),
            checking: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Time until the next check, or `None` while idle.
    ///
    /// # Errors
    /// Returns an error when the persisted state cannot be read.
    pub fn time_remaining(&self, now_millis: i64) -> Result<Option<Duration>, ScheduleError> {
        let state = self.store.load()?;
        Ok(state.remaining_millis(now_millis).map(|remaining| {
            Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
        }))
    }

    /// Work out the current phase, persisting the due flag the first time
    /// the interval is found to have elapsed.
    ///
    /// # Errors
    /// Returns an error when the persisted state cannot be read or written.
    pub fn evaluate(&self, now_millis: i64) -> Result<SchedulePhase, ScheduleError> {
        let state = self.store.load()?;
        let Some(remaining) = state.remaining_millis(now_millis) else {
            return Ok(SchedulePhase::Idle);
        };

        if self.checking.load(Ordering::Acquire) {
            return Ok(SchedulePhase::Checking);
        }
        if state.due_flag {
            return Ok(SchedulePhase::CheckDue);
        }

        let threshold = i64::try_from(NEAR_DUE_THRESHOLD.as_millis()).unwrap_or(i64::MAX);
        if remaining <= threshold {
            info!("Update check is due ({remaining} ms remaining)");
            self.store.set_due(true)?;
            return Ok(SchedulePhase::CheckDue);
        }

        Ok(SchedulePhase::Scheduled)
    }

    /// Turn reminders on with `interval` and (re)register the trigger.
    /// The first check comes one interval after the first configuration.
    ///
    /// # Errors
    /// Returns an error when the state cannot be persisted or the trigger
    /// cannot be registered.
    pub fn configure(
        &self,
        interval: CheckInterval,
        now_millis: i64,
    ) -> Result<SchedulePhase, ScheduleError> {
        let previous = self.store.load()?;
        self.store.set_interval(interval)?;
        self.store.set_reminder_enabled(true)?;
        if previous.last_check_epoch_millis.is_none() {
            self.store.set_last_check(now_millis)?;
        }

        if previous.active_interval() != Some(interval) {
            self.trigger.cancel(SCHEDULE_NAME)?;
        }
        self.register_trigger()?;
        info!("Update reminders enabled every {interval}");
        self.evaluate(now_millis)
    }

    /// Turn reminders off, forgetting the due flag and last check time.
    ///
    /// # Errors
    /// Returns an error when the state cannot be persisted or the trigger
    /// cannot be cancelled.
    pub fn disable(&self) -> Result<SchedulePhase, ScheduleError> {
        self.store.set_reminder_enabled(false)?;
        self.store.set_due(false)?;
        self.store.clear_last_check()?;
        self.trigger.cancel(SCHEDULE_NAME)?;
        info!("Update reminders disabled");
        Ok(SchedulePhase::Idle)
    }

    /// Register the periodic trigger for the configured interval. Returns
    /// `None` when idle or when another registration is already running.
    ///
    /// # Errors
    /// Returns an error when the state cannot be read or the trigger
    /// refuses the registration.
    pub fn register_trigger(&self) -> Result<Option<RegistrationOutcome>, ScheduleError> {
        if self
            .registering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Trigger registration already in progress");
            return Ok(None);
        }
        let _guard = FlagGuard(&self.registering);

        let Some(interval) = self.store.load()?.active_interval() else {
            return Ok(None);
        };

        let minutes = interval.as_minutes().max(MIN_TRIGGER_PERIOD_MINUTES);
        let outcome =
            self.trigger
                .schedule(SCHEDULE_NAME, minutes, minutes, TriggerPolicy::KeepExisting)?;
        Ok(Some(outcome))
    }

    /// Follow interval changes another process persisted. `registered` is
    /// the interval the trigger currently runs with; returns the one it runs
    /// with afterwards.
    ///
    /// # Errors
    /// Returns an error when the state cannot be read or the trigger
    /// refuses the change.
    pub fn sync_trigger(
        &self,
        registered: Option<CheckInterval>,
    ) -> Result<Option<CheckInterval>, ScheduleError> {
        let current = self.store.load()?.active_interval();
        if current == registered {
            return Ok(current);
        }

        self.trigger.cancel(SCHEDULE_NAME)?;
        match current {
            Some(interval) => {
                self.register_trigger()?;
                info!("Update reminder interval changed to {interval}");
            }
            None => info!("Update reminders were turned off"),
        }
        Ok(current)
    }

    /// Re-register after a reboot or process restart.
    ///
    /// # Errors
    /// See [`Scheduler::register_trigger`].
    pub fn on_boot(&self) -> Result<Option<RegistrationOutcome>, ScheduleError> {
        self.register_trigger()
    }

    /// Enter the check flow. Only one check runs at a time.
    ///
    /// # Errors
    /// Returns an error when the due flag cannot be read.
    pub fn begin_check(&self) -> Result<CheckStart, ScheduleError> {
        if self.checking.swap(true, Ordering::AcqRel) {
            return Ok(CheckStart::AlreadyRunning);
        }

        match self.store.is_due() {
            Ok(was_due) => Ok(CheckStart::Started { was_due }),
            Err(error) => {
                self.checking.store(false, Ordering::Release);
                Err(error.into())
            }
        }
    }

    /// Leave the check flow. A successful check records `now_millis` as the
    /// last check and clears the due flag; a failed one leaves both alone.
    ///
    /// # Errors
    /// Returns an error when the state cannot be persisted.
    pub fn complete_check(
        &self,
        now_millis: i64,
        succeeded: bool,
    ) -> Result<SchedulePhase, ScheduleError> {
        let result = if succeeded {
            self.store
                .set_last_check(now_millis)
                .and_then(|()| self.store.set_due(false))
        } else {
            Ok(())
        };
        self.checking.store(false, Ordering::Release);
        result?;
        self.evaluate(now_millis)
    }
}
