//! Background job framework.
//!
//! Every long-running subsystem composes a [`JobHost`]: two bus sessions
//! (publisher, and subscriber carrying the `$state = lost` last-will), the
//! lifecycle state machine, the published-settings surface, the
//! duplicate-process guard, and the exit protocol. Concrete jobs register
//! per-setting handlers and lifecycle hooks, then drive their own worker
//! threads.
//!
//! Settings are commands: a payload on `…/<setting>/set` (or the broadcast-
//! unit variant) is routed to the owning job's handler; an accepted value is
//! republished retained so every observer converges on the same view.

use std::collections::HashMap;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::bus::{BusClient, BusOptions, LastWill, Message, Qos};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::naming::{self, UNIVERSAL_UNIT};
use crate::stores::{Stores, names};

/// Homie-style lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Ready,
    Sleeping,
    Disconnected,
    /// Published by the broker as the last-will when a job dies abruptly;
    /// a live process never sets it on itself.
    Lost,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Init => "init",
            JobState::Ready => "ready",
            JobState::Sleeping => "sleeping",
            JobState::Disconnected => "disconnected",
            JobState::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "init" => Some(JobState::Init),
            "ready" => Some(JobState::Ready),
            "sleeping" => Some(JobState::Sleeping),
            "disconnected" => Some(JobState::Disconnected),
            "lost" => Some(JobState::Lost),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared shape of one published setting.
#[derive(Debug, Clone)]
pub struct SettingMeta {
    pub datatype: &'static str,
    pub settable: bool,
    pub unit: Option<&'static str>,
}

impl SettingMeta {
    pub fn float(settable: bool, unit: Option<&'static str>) -> Self {
        Self {
            datatype: "float",
            settable,
            unit,
        }
    }
}

/// Node-level wiring shared by every job in the process.
#[derive(Clone)]
pub struct NodeCtx {
    pub namespace: String,
    pub leader: String,
    pub unit: String,
    pub experiment: String,
    pub is_leader: bool,
    pub stores: Stores,
}

impl NodeCtx {
    /// Resolve identity from config; the experiment comes from the leader's
    /// retained announcement unless overridden.
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.cluster.namespace.clone(),
            leader: config.cluster.leader.clone(),
            unit: naming::unit_name(config),
            experiment: if config.cluster.experiment.is_empty() {
                naming::FALLBACK_EXPERIMENT.to_string()
            } else {
                config.cluster.experiment.clone()
            },
            is_leader: config.cluster.is_leader,
            stores: Stores::from_config(config),
        }
    }

    /// Ask the leader which experiment is active; override and fallback apply.
    pub fn resolve_experiment(&mut self, publisher: &BusClient) {
        let topic = format!("{}/latest_experiment", self.namespace);
        if let Ok(Some(message)) =
            publisher.subscribe_once(&topic, Qos::ExactlyOnce, Duration::from_secs(2))
        {
            let name = message.payload_str();
            if !name.trim().is_empty() {
                self.experiment = name.trim().to_string();
            }
        }
    }
}

type SetHandler = Box<dyn Fn(&JobHost, &str) -> Option<String> + Send + Sync>;
type Hook = Box<dyn Fn(&JobHost) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_ready: Option<Hook>,
    on_sleeping: Option<Hook>,
    on_disconnect: Option<Hook>,
}

/// The shared core of a background job.
pub struct JobHost {
    pub job_name: String,
    pub ctx: NodeCtx,
    publisher: Arc<BusClient>,
    subscriber: Arc<BusClient>,
    state: Mutex<JobState>,
    state_changed: Condvar,
    settings: Mutex<Vec<(String, SettingMeta)>>,
    handlers: Mutex<HashMap<String, SetHandler>>,
    hooks: Mutex<Hooks>,
    exit_on_disconnect: AtomicBool,
    disconnecting: AtomicBool,
}

impl JobHost {
    /// INIT phase: duplicate guard, both bus sessions, `$state = init`,
    /// signal wiring. The caller then declares settings and hooks, calls
    /// [`JobHost::activate`], and finally [`JobHost::ready`].
    pub fn init(job_name: &str, ctx: NodeCtx) -> Result<Arc<Self>> {
        ensure_not_already_running(&ctx.stores, job_name)?;

        let pid = process::id();
        let publisher = Arc::new(BusClient::connect(
            &ctx.leader,
            &format!("{}-pub-{job_name}-{pid}", ctx.unit),
            BusOptions::default(),
        )?);

        let state_topic = naming::topic(
            &ctx.namespace,
            &ctx.unit,
            &ctx.experiment,
            &format!("{job_name}/$state"),
        );
        let subscriber = Arc::new(BusClient::connect(
            &ctx.leader,
            &format!("{}-sub-{job_name}-{pid}", ctx.unit),
            BusOptions {
                last_will: Some(LastWill {
                    topic: state_topic,
                    payload: JobState::Lost.as_str().into(),
                    qos: Qos::ExactlyOnce,
                    retain: true,
                }),
                ..BusOptions::default()
            },
        )?);

        let host = Arc::new(Self {
            job_name: job_name.to_string(),
            ctx,
            publisher,
            subscriber,
            state: Mutex::new(JobState::Init),
            state_changed: Condvar::new(),
            settings: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Hooks::default()),
            exit_on_disconnect: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
        });

        crate::logging::attach_bus(
            Arc::clone(&host.publisher),
            host.exp_topic("logs/app"),
        );
        host.publish_job("$state", JobState::Init.as_str().as_bytes(), Qos::ExactlyOnce, true)?;

        // after a broker hiccup the retained lost must be overwritten
        let reconnect_host = Arc::downgrade(&host);
        host.subscriber.set_on_reconnect(move || {
            if let Some(host) = reconnect_host.upgrade() {
                let state = *host.state.lock().unwrap();
                let _ = host.publish_job("$state", state.as_str().as_bytes(), Qos::ExactlyOnce, true);
            }
        });

        wire_signals(&host);
        log::debug!("{job_name}: init");
        Ok(host)
    }

    // -- settings surface ---------------------------------------------------

    /// Declare one published setting and its `set` handler. The handler
    /// returns the accepted value to republish, or `None` to reject.
    pub fn declare_setting<F>(&self, name: &str, meta: SettingMeta, handler: F)
    where
        F: Fn(&JobHost, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.settings
            .lock()
            .unwrap()
            .push((name.to_string(), meta));
        self.handlers
            .lock()
            .unwrap()
            .insert(name.to_string(), Box::new(handler));
    }

    /// Announce `$properties`/`$settable` and start the `set` listeners.
    /// Call after every `declare_setting`.
    pub fn activate(self: &Arc<Self>) -> Result<()> {
        let (property_list, settables) = {
            let settings = self.settings.lock().unwrap();
            let list = settings
                .iter()
                .map(|(name, _)| name.as_str())
                .chain(std::iter::once("state"))
                .collect::<Vec<_>>()
                .join(",");
            let settables: Vec<(String, bool)> = settings
                .iter()
                .map(|(name, meta)| (name.clone(), meta.settable))
                .collect();
            (list, settables)
        };
        self.publish_job("$properties", property_list.as_bytes(), Qos::AtLeastOnce, true)?;
        for (name, settable) in settables {
            self.publish_job(
                &format!("{name}/$settable"),
                settable.to_string().as_bytes(),
                Qos::AtLeastOnce,
                true,
            )?;
        }

        let unit_filter = self.job_topic("+/set");
        let broadcast_filter = naming::topic(
            &self.ctx.namespace,
            UNIVERSAL_UNIT,
            &self.ctx.experiment,
            &format!("{}/+/set", self.job_name),
        );
        let host = Arc::clone(self);
        self.subscriber.subscribe_callback(
            &[unit_filter.as_str(), broadcast_filter.as_str()],
            Qos::AtLeastOnce,
            true,
            move |message| host.handle_set(message),
        )?;
        Ok(())
    }

    fn handle_set(&self, message: &Message) {
        let segments: Vec<&str> = message.topic.split('/').collect();
        if segments.len() != 6 {
            return;
        }
        let attr = segments[4].trim_start_matches('$');
        let payload = message.payload_str();

        if attr == "state" {
            match JobState::parse(&payload) {
                Some(next) => self.transition(next),
                None => log::debug!("{}: ignoring unknown state {payload:?}", self.job_name),
            }
            return;
        }

        let accepted = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(attr) {
                Some(handler) => handler(self, &payload),
                None => {
                    log::debug!("unable to set {attr} in {}", self.job_name);
                    return;
                }
            }
        };
        match accepted {
            Some(value) => {
                log::info!("{}: updated {attr} to {value}", self.job_name);
                let _ = self.publish_setting(attr, value.as_bytes());
            }
            None => log::debug!("{}: rejected value {payload:?} for {attr}", self.job_name),
        }
    }

    /// Republish a setting's current value, retained, exactly-once.
    pub fn publish_setting(&self, name: &str, value: &[u8]) -> Result<()> {
        self.publish_job(name, value, Qos::ExactlyOnce, true)
    }

    // -- publishing ---------------------------------------------------------

    /// `<ns>/<unit>/<exp>/<job>/<tail>`
    pub fn job_topic(&self, tail: &str) -> String {
        naming::topic(
            &self.ctx.namespace,
            &self.ctx.unit,
            &self.ctx.experiment,
            &format!("{}/{tail}", self.job_name),
        )
    }

    /// `<ns>/<unit>/<exp>/<tail>`
    pub fn exp_topic(&self, tail: &str) -> String {
        naming::topic(&self.ctx.namespace, &self.ctx.unit, &self.ctx.experiment, tail)
    }

    pub fn publish_job(&self, tail: &str, payload: &[u8], qos: Qos, retain: bool) -> Result<()> {
        self.publisher
            .publish(&self.job_topic(tail), payload, qos, retain)
    }

    pub fn publish_exp(&self, tail: &str, payload: &[u8], qos: Qos, retain: bool) -> Result<()> {
        self.publisher
            .publish(&self.exp_topic(tail), payload, qos, retain)
    }

    pub fn publisher(&self) -> Arc<BusClient> {
        Arc::clone(&self.publisher)
    }

    pub fn subscribe<F>(&self, filters: &[&str], qos: Qos, allow_retained: bool, callback: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscriber
            .subscribe_callback(filters, qos, allow_retained, callback)
    }

    pub fn subscribe_once(
        &self,
        topic: &str,
        qos: Qos,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        self.subscriber.subscribe_once(topic, qos, timeout)
    }

    pub fn unsubscribe(&self, filter: &str) {
        if let Err(e) = self.subscriber.unsubscribe(filter) {
            log::debug!("{}: unsubscribe {filter} failed: {e}", self.job_name);
        }
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn on_ready<F: Fn(&JobHost) + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().unwrap().on_ready = Some(Box::new(hook));
    }

    pub fn on_sleeping<F: Fn(&JobHost) + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().unwrap().on_sleeping = Some(Box::new(hook));
    }

    pub fn on_disconnect<F: Fn(&JobHost) + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().unwrap().on_disconnect = Some(Box::new(hook));
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    pub fn ready(&self) {
        self.transition(JobState::Ready);
    }

    /// Make `petrid` exit the process once the job disconnects.
    pub fn set_exit_on_disconnect(&self, exit: bool) {
        self.exit_on_disconnect.store(exit, Ordering::SeqCst);
    }

    pub fn transition(&self, next: JobState) {
        let current = *self.state.lock().unwrap();
        if current == next {
            return;
        }
        match next {
            JobState::Ready => {
                self.run_hook(|h| h.on_ready.as_ref());
                self.set_state(JobState::Ready);
                log::info!("{}: ready", self.job_name);
            }
            JobState::Sleeping => {
                self.run_hook(|h| h.on_sleeping.as_ref());
                self.set_state(JobState::Sleeping);
                log::debug!("{}: sleeping", self.job_name);
            }
            JobState::Disconnected => self.disconnect(),
            JobState::Init | JobState::Lost => {
                log::debug!("{}: ignoring transition to {next}", self.job_name);
            }
        }
    }

    fn run_hook(&self, pick: impl Fn(&Hooks) -> Option<&Hook>) {
        let hooks = self.hooks.lock().unwrap();
        if let Some(hook) = pick(&hooks) {
            hook(self);
        }
    }

    fn set_state(&self, next: JobState) {
        *self.state.lock().unwrap() = next;
        self.state_changed.notify_all();
        let _ = self.publish_job("$state", next.as_str().as_bytes(), Qos::ExactlyOnce, true);
    }

    /// True once the exit protocol has begun; long waits should bail out.
    pub fn is_shutting_down(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        // job-specific teardown first: timers cancelled, hardware released
        self.run_hook(|h| h.on_disconnect.as_ref());

        self.set_state(JobState::Disconnected);
        log::info!("{}: disconnected", self.job_name);
        crate::logging::detach_bus();

        clear_running_flag(&self.ctx.stores, &self.job_name);

        // the subscriber carries the last-will; give it the orderly exit
        self.subscriber.disconnect();
        self.publisher.disconnect();

        if self.exit_on_disconnect.load(Ordering::SeqCst) {
            // SAFETY: raising a signal on our own pid; the USR1 handler exits 0.
            unsafe {
                libc::kill(process::id() as libc::pid_t, libc::SIGUSR1);
            }
        }
    }

    /// Park the caller until the job reaches DISCONNECTED.
    pub fn block_until_disconnected(&self) {
        let mut state = self.state.lock().unwrap();
        while *state != JobState::Disconnected {
            state = self.state_changed.wait(state).unwrap();
        }
    }
}

/// Parse helper for `set` handlers: cast the payload to the setting's type.
pub fn parse_setting<T: std::str::FromStr>(payload: &str) -> Option<T> {
    payload.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Duplicate-process guard
// ---------------------------------------------------------------------------

/// Refuse to start when another live process already runs `job_name`.
/// Stale flags from dead processes are reclaimed.
pub fn ensure_not_already_running(stores: &Stores, job_name: &str) -> Result<()> {
    let cache = stores.intermittent(names::JOBS_RUNNING);
    let mut guard = cache.open()?;
    if let Some(existing) = guard.get(job_name) {
        if let Ok(pid) = existing.parse::<i32>() {
            if pid != process::id() as i32 && process_is_alive(pid) {
                log::warn!("{job_name} is already running (pid {pid}); aborting");
                return Err(Error::DuplicateJob(job_name.to_string()));
            }
        }
    }
    guard.set(job_name, process::id().to_string());
    Ok(())
}

pub fn clear_running_flag(stores: &Stores, job_name: &str) {
    if let Ok(mut guard) = stores.intermittent(names::JOBS_RUNNING).open() {
        guard.delete(job_name);
    }
}

/// Jobs flagged as running by a live process on this node.
pub fn jobs_running(stores: &Stores) -> Vec<String> {
    let binding = stores.intermittent(names::JOBS_RUNNING);
    let Ok(guard) = binding.open() else {
        return Vec::new();
    };
    guard
        .keys()
        .filter(|job| {
            guard
                .get(job)
                .and_then(|pid| pid.parse::<i32>().ok())
                .is_some_and(process_is_alive)
        })
        .map(str::to_string)
        .collect()
}

fn process_is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs permission/liveness checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn wire_signals(host: &Arc<JobHost>) {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
    use signal_hook::iterator::Signals;

    let Ok(mut signals) = Signals::new([SIGTERM, SIGINT, SIGHUP, SIGUSR1]) else {
        log::error!("{}: could not install signal handlers", host.job_name);
        return;
    };
    let weak = Arc::downgrade(host);
    std::thread::Builder::new()
        .name(format!("{}-signals", host.job_name))
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGUSR1 => process::exit(0),
                    _ => match weak.upgrade() {
                        Some(host) => host.transition(JobState::Disconnected),
                        None => process::exit(0),
                    },
                }
            }
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_stores() -> (tempfile::TempDir, Stores) {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("p"), dir.path().join("i"));
        (dir, stores)
    }

    // -----------------------------------------------------------------------
    // Lifecycle strings
    // -----------------------------------------------------------------------

    #[test]
    fn state_strings_round_trip() {
        for state in [
            JobState::Init,
            JobState::Ready,
            JobState::Sleeping,
            JobState::Disconnected,
            JobState::Lost,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("zombie"), None);
    }

    // -----------------------------------------------------------------------
    // Duplicate-process guard
    // -----------------------------------------------------------------------

    #[test]
    fn first_start_claims_the_flag() {
        let (_dir, stores) = scratch_stores();
        ensure_not_already_running(&stores, "stirring").unwrap();
        assert!(jobs_running(&stores).contains(&"stirring".to_string()));
    }

    #[test]
    fn live_duplicate_is_rejected() {
        let (_dir, stores) = scratch_stores();
        // our own pid stands in for "another live process"
        let other_pid = unsafe { libc::getppid() };
        stores
            .intermittent(names::JOBS_RUNNING)
            .open()
            .unwrap()
            .set("od_reading", other_pid.to_string());
        let second = ensure_not_already_running(&stores, "od_reading");
        assert!(matches!(second, Err(Error::DuplicateJob(_))));
    }

    #[test]
    fn stale_flag_from_dead_process_is_reclaimed() {
        let (_dir, stores) = scratch_stores();
        stores
            .intermittent(names::JOBS_RUNNING)
            .open()
            .unwrap()
            .set("stirring", "99999999");
        assert!(ensure_not_already_running(&stores, "stirring").is_ok());
    }

    #[test]
    fn clear_running_flag_releases() {
        let (_dir, stores) = scratch_stores();
        ensure_not_already_running(&stores, "monitor").unwrap();
        clear_running_flag(&stores, "monitor");
        assert!(jobs_running(&stores).is_empty());
    }

    // -----------------------------------------------------------------------
    // Setting parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_setting_casts_to_target_type() {
        assert_eq!(parse_setting::<f64>(" 1.25 "), Some(1.25));
        assert_eq!(parse_setting::<u32>("500"), Some(500));
        assert_eq!(parse_setting::<f64>("not-a-number"), None);
    }
}
