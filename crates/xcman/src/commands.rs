use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use xcman_core::schedule::{
    CheckStart, RegistrationOutcome, TriggerError, TriggerPolicy, now_millis,
};
use xcman_core::{
    AdbDevice, AppDescriptor, CheckInterval, DownloadQueue, DrainSummary, HttpDownloader,
    JsonFileStore, KeyValueStore, ManifestClient, PackageInfo, PeriodicTrigger, QueueEvent,
    SchedulePhase, ScheduleStore, Scheduler, StoreValue, TokioTrigger, UpdateSession,
    VersionSelector,
};
use xcman_platform::AppPaths;

use crate::cache::ManifestCache;
use crate::error::AppError;
use crate::settings::{AppSettings, UpdateBehavior};

const SELECTION_KEY_PREFIX: &str = "upgrade_selection.";

/// How often `watch` re-reads the state file for interval changes made by
/// `xcman schedule` or `xcman disable`.
const STATE_POLL_PERIOD: Duration = Duration::from_secs(30);

fn selection_key(package_id: &str) -> String {
    format!("{SELECTION_KEY_PREFIX}{package_id}")
}

/// Trigger used by one-shot commands. The process exits right after, so
/// the actual timer belongs to `xcman watch`, which re-registers from the
/// persisted state on start.
struct DeferredTrigger;

impl PeriodicTrigger for DeferredTrigger {
    fn schedule(
        &self,
        name: &str,
        interval_minutes: u64,
        _initial_delay_minutes: u64,
        _policy: TriggerPolicy,
    ) -> Result<RegistrationOutcome, TriggerError> {
        debug!("Trigger {name} ({interval_minutes} min) will be registered by `xcman watch`");
        Ok(RegistrationOutcome::Registered)
    }

    fn cancel(&self, name: &str) -> Result<(), TriggerError> {
        debug!("Trigger {name} cancelled");
        Ok(())
    }
}

pub struct App {
    paths: AppPaths,
    settings: AppSettings,
    store: Arc<dyn KeyValueStore>,
    schedule: ScheduleStore,
}

impl App {
    pub fn new(paths: AppPaths, settings: AppSettings) -> Result<Self, AppError> {
        let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(paths.state_file())?);
        let schedule = ScheduleStore::new(Arc::clone(&store));
        Ok(Self {
            paths,
            settings,
            store,
            schedule,
        })
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.schedule.clone(), Arc::new(DeferredTrigger))
    }

    fn device(&self) -> Result<Arc<AdbDevice>, AppError> {
        let device = AdbDevice::detect(
            self.settings.adb_path.clone(),
            self.settings.device_serial.clone(),
        )?;
        Ok(Arc::new(device))
    }

    fn session(&self, device: Arc<AdbDevice>) -> Result<UpdateSession, AppError> {
        let client =
            ManifestClient::with_timeout(self.settings.endpoints(), self.settings.http_timeout())?;
        let selector = VersionSelector::new(self.settings.xcguide_alternate_url.clone());
        let mut session = UpdateSession::new(client, device, selector)
            .with_retry(self.settings.retry_policy())
            .with_model_override(self.schedule.selected_model()?);

        if let Some(cache) = ManifestCache::load(&self.paths) {
            session.restore(cache.descriptors);
        }
        Ok(session)
    }

    /// Run one check through the scheduler so the due flag and last check
    /// time follow the outcome. A successful result replaces the cache.
    async fn run_check(
        &self,
        scheduler: &Scheduler,
        session: &mut UpdateSession,
    ) -> Result<(), AppError> {
        if scheduler.begin_check()? == CheckStart::AlreadyRunning {
            return Err(AppError::CheckInProgress);
        }

        let result = session.check_for_updates().await.map(<[_]>::to_vec);
        scheduler.complete_check(now_millis(), result.is_ok())?;

        let descriptors = result?;
        ManifestCache::new(descriptors).save(&self.paths);
        Ok(())
    }

    pub async fn check(&self) -> Result<(), AppError> {
        self.schedule.set_manual_launch(true)?;
        let mut session = self.session(self.device()?)?;
        let scheduler = self.scheduler();

        if let Err(error) = self.run_check(&scheduler, &mut session).await {
            if !session.descriptors().is_empty() {
                println!("Update check failed; showing the previous result.");
                print_descriptors(session.descriptors());
            }
            return Err(error);
        }

        print_descriptors(session.descriptors());
        Ok(())
    }

    pub fn status(&self) -> Result<(), AppError> {
        match ManifestCache::load(&self.paths) {
            Some(cache) => {
                println!(
                    "Last result from {}:",
                    cache.cached_at.format("%Y-%m-%d %H:%M UTC")
                );
                print_descriptors(&cache.descriptors);
            }
            None => println!("No check has completed yet. Run `xcman check`."),
        }

        let scheduler = self.scheduler();
        let now = now_millis();
        let phase = scheduler.evaluate(now)?;
        let state = self.schedule.load()?;
        match (phase, state.interval) {
            (SchedulePhase::Idle, _) | (_, None) => println!("Reminders: off"),
            (phase, Some(interval)) => {
                let remaining = scheduler
                    .time_remaining(now)?
                    .map_or_else(|| "-".to_string(), format_remaining);
                println!("Reminders: every {interval} ({phase:?}, next in {remaining})");
            }
        }

        println!("Check due: {}", if state.due_flag { "yes" } else { "no" });
        let manual = self.schedule.manual_launch()?;
        println!("Opened manually: {}", if manual { "yes" } else { "no" });
        if let Some(model) = self.schedule.selected_model()? {
            println!("Device model override: {model}");
        }

        // Reading the status consumes the manual launch marker; the due flag
        // only goes away with a completed check.
        self.schedule.set_manual_launch(false)?;
        Ok(())
    }

    pub fn select(&self, package_id: &str, selected: bool) -> Result<(), AppError> {
        if let Some(cache) = ManifestCache::load(&self.paths)
            && !cache.descriptors.iter().any(|d| d.package_id == package_id)
        {
            return Err(AppError::UnknownPackage(package_id.to_string()));
        }

        self.store
            .put(&selection_key(package_id), StoreValue::Bool(selected))?;
        println!(
            "{package_id} {} for the next upgrade",
            if selected { "selected" } else { "deselected" }
        );
        Ok(())
    }

    fn apply_saved_selections(&self, session: &mut UpdateSession) -> Result<(), AppError> {
        let package_ids: Vec<String> = session
            .descriptors()
            .iter()
            .map(|d| d.package_id.clone())
            .collect();
        for package_id in package_ids {
            if let Some(selected) = self.store.get_bool(&selection_key(&package_id))? {
                session.set_selected(&package_id, selected);
            }
        }
        Ok(())
    }

    pub async fn upgrade(&self, packages: &[String]) -> Result<(), AppError> {
        self.schedule.set_manual_launch(true)?;
        let device = self.device()?;
        let mut session = self.session(Arc::clone(&device))?;
        let scheduler = self.scheduler();

        if let Err(error) = self.run_check(&scheduler, &mut session).await {
            if session.descriptors().is_empty() {
                return Err(error);
            }
            warn!("Upgrading from the cached result: {error}");
            println!("Update check failed ({error}); using the previous result.");
        }

        if packages.is_empty() {
            self.apply_saved_selections(&mut session)?;
        } else {
            if let Some(unknown) = packages
                .iter()
                .find(|p| !session.descriptors().iter().any(|d| &d.package_id == *p))
            {
                return Err(AppError::UnknownPackage(unknown.clone()));
            }
            let package_ids: Vec<String> = session
                .descriptors()
                .iter()
                .map(|d| d.package_id.clone())
                .collect();
            for package_id in package_ids {
                let wanted = packages.contains(&package_id);
                session.set_selected(&package_id, wanted);
            }
        }

        if session.selected().is_empty() {
            println!("Nothing to upgrade.");
            return Ok(());
        }

        let summary = self.download(&session, device).await?;
        for package_id in &summary.installed {
            self.store.remove(&selection_key(package_id))?;
        }
        print_summary(&summary);
        Ok(())
    }

    async fn download(
        &self,
        session: &UpdateSession,
        device: Arc<AdbDevice>,
    ) -> Result<DrainSummary, AppError> {
        let timeout = self.settings.http_timeout();
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(format!("xcman/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        let downloader = HttpDownloader::new(client, self.settings.download_dir(&self.paths));

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        });

        let mut queue = DownloadQueue::new(
            Arc::new(downloader),
            device,
            self.settings.download_base_url.clone(),
        )
        .with_events(events_tx);
        session.enqueue_selected(&mut queue);
        let summary = queue.drain().await;
        queue.dispose();
        let _ = printer.await;

        Ok(summary)
    }

    pub fn schedule(&self, interval: CheckInterval) -> Result<(), AppError> {
        let phase = self.scheduler().configure(interval, now_millis())?;
        println!("Update reminders every {interval}.");
        if phase == SchedulePhase::CheckDue {
            println!("A check is due now.");
        }
        println!("Keep `xcman watch` running to be reminded.");
        Ok(())
    }

    pub fn disable(&self) -> Result<(), AppError> {
        self.scheduler().disable()?;
        println!("Update reminders are off.");
        Ok(())
    }

    pub async fn model(&self, name: Option<&str>, clear: bool) -> Result<(), AppError> {
        if clear {
            self.schedule.set_selected_model(None)?;
            println!("Using the model reported by the device.");
        } else if let Some(name) = name {
            self.schedule.set_selected_model(Some(name))?;
            println!("Manager builds will be picked for {name}.");
        } else {
            match self.schedule.selected_model()? {
                Some(model) => println!("{model} (override)"),
                None => println!("{} (reported by the device)", self.device()?.device_model().await?),
            }
        }
        Ok(())
    }

    pub async fn tick(&self) -> Result<(), AppError> {
        self.tick_with(&self.scheduler()).await
    }

    /// One periodic wake-up: check if due, then act on the configured
    /// update behavior.
    async fn tick_with(&self, scheduler: &Scheduler) -> Result<(), AppError> {
        if self.settings.update_behavior == UpdateBehavior::DoNotCheck {
            debug!("Scheduled checks are turned off in settings");
            return Ok(());
        }

        let phase = scheduler.evaluate(now_millis())?;
        if phase != SchedulePhase::CheckDue {
            debug!("Tick in phase {phase:?}, nothing to do");
            return Ok(());
        }

        let device = self.device()?;
        let mut session = self.session(Arc::clone(&device))?;
        self.run_check(scheduler, &mut session).await?;

        let outdated = session.outdated();
        if outdated.is_empty() {
            info!("Scheduled check: everything is up to date");
            return Ok(());
        }

        match self.settings.update_behavior {
            UpdateBehavior::AutomaticallyUpdate => {
                info!("Scheduled check: installing {} updates", outdated.len());
                let summary = self.download(&session, device).await?;
                print_summary(&summary);
            }
            UpdateBehavior::Notify | UpdateBehavior::DoNotCheck => {
                println!("Updates available:");
                print_descriptors(outdated);
                println!("Run `xcman upgrade` to install them.");
            }
        }
        Ok(())
    }

    /// Register the in-process trigger and handle its wake-ups until
    /// interrupted. `check_now` runs a tick before waiting.
    pub async fn watch(&self, check_now: bool) -> Result<(), AppError> {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let trigger = TokioTrigger::new(Arc::new(move || {
            let wake_tx = wake_tx.clone();
            async move {
                let _ = wake_tx.try_send(());
            }
            .boxed()
        }))?;
        let scheduler = Scheduler::new(self.schedule.clone(), Arc::new(trigger));

        if scheduler.on_boot()?.is_none() {
            println!("Update reminders are off. Turn them on with `xcman schedule`.");
            return Ok(());
        }
        let mut registered = self.schedule.load()?.active_interval();

        if check_now {
            self.logged_tick(&scheduler).await;
        } else {
            // Catch up on an interval that elapsed while the machine was off.
            scheduler.evaluate(now_millis())?;
        }

        info!("Watching for update reminders");
        let mut poll = tokio::time::interval(STATE_POLL_PERIOD);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                woke = wake_rx.recv() => {
                    if woke.is_none() {
                        break;
                    }
                    self.logged_tick(&scheduler).await;
                }
                _ = poll.tick() => {
                    match scheduler.sync_trigger(registered) {
                        Ok(current) => registered = current,
                        Err(error) => warn!("Could not refresh the reminder schedule: {error}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping watch");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn logged_tick(&self, scheduler: &Scheduler) {
        if let Err(error) = self.tick_with(scheduler).await {
            warn!("Scheduled check failed: {error}");
            eprintln!("xcman: scheduled check failed: {error}");
        }
    }
}

fn print_descriptors<'a>(descriptors: impl IntoIterator<Item = &'a AppDescriptor>) {
    for descriptor in descriptors {
        let marker = if descriptor.is_outdated() { "*" } else { " " };
        println!(
            "{marker} {:<24} {:<22} installed {:<12} available {}",
            descriptor.name,
            descriptor.package_id,
            descriptor.installed_version,
            descriptor.highest_server_version
        );
    }
}

fn print_event(event: &QueueEvent) {
    match event {
        QueueEvent::Dispatched {
            package_id,
            source_url,
            ..
        } => println!("Downloading {package_id} from {source_url}"),
        QueueEvent::Installed {
            package_id, path, ..
        } => println!("Installing {package_id} from {}", path.display()),
        QueueEvent::Failed {
            package_id, reason, ..
        } => println!("Skipped {package_id}: {reason}"),
        QueueEvent::Drained(_) => {}
    }
}

fn print_summary(summary: &DrainSummary) {
    println!(
        "{} sent to the installer, {} failed.",
        summary.installed.len(),
        summary.failed.len()
    );
}

fn format_remaining(remaining: Duration) -> String {
    let minutes = remaining.as_secs() / 60;
    let (days, hours, minutes) = (minutes / (24 * 60), (minutes / 60) % 24, minutes % 60);
    match (days, hours) {
        (0, 0) => format!("{minutes}m"),
        (0, _) => format!("{hours}h {minutes}m"),
        _ => format!("{days}d {hours}h {minutes}m"),
    }
}
