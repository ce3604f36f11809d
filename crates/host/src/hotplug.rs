//! Hotplug dispatcher and session supervisor
//!
//! Arrival notifications come from libusb on the USB event thread. The
//! dispatcher never blocks that thread: each device gets its own probe
//! thread, which becomes the session thread if the device is an accessory.
//! The supervisor keeps every such thread joinable and indexes the live
//! sessions so they can be listed and stopped at shutdown.

use crate::session::{AccessorySession, SessionContext};
use crate::usb::{self, DriverSettings, ProbeOutcome, UsbDevice};
use common::{SessionInfo, SessionKey};
use rusb::{Device, Hotplug, UsbContext};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every probe/session thread
#[derive(Default)]
pub struct SessionSupervisor {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sessions: Mutex<HashMap<SessionKey, Arc<AccessorySession>>>,
    stopping: AtomicBool,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a supervised thread, reaping finished ones first
    pub fn spawn<F>(&self, name: String, task: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|handle| !handle.is_finished());

        let handle = std::thread::Builder::new().name(name).spawn(task)?;
        tasks.push(handle);
        Ok(())
    }

    /// Index a live session; after `stop_all` it is stopped straight away
    pub fn register(&self, session: &Arc<AccessorySession>) {
        let mut sessions = lock(&self.sessions);
        if self.stopping.load(Ordering::Acquire) {
            session.stop();
        }
        sessions.insert(session.key(), session.clone());
    }

    pub fn unregister(&self, key: SessionKey) {
        lock(&self.sessions).remove(&key);
    }

    /// Snapshot of live sessions, oldest first
    pub fn live_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = lock(&self.sessions)
            .values()
            .map(|session| session.info())
            .collect();
        sessions.sort_by_key(|info| info.key);
        sessions
    }

    /// Threads not yet reaped
    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Clear every live session's running flag
    pub fn stop_all(&self) {
        let sessions = lock(&self.sessions);
        self.stopping.store(true, Ordering::Release);
        for session in sessions.values() {
            session.stop();
        }
    }

    /// Wait for every supervised thread to finish
    pub fn join_all(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for handle in tasks {
            let name = handle.thread().name().unwrap_or("session").to_string();
            if let Err(e) = handle.join() {
                error!("Thread {} panicked: {:?}", name, e);
            }
        }
    }
}

/// Turns device arrivals into supervised probe threads
pub struct Dispatcher {
    settings: Arc<DriverSettings>,
    filters: Arc<[String]>,
    context: SessionContext,
    supervisor: Arc<SessionSupervisor>,
    next_key: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        settings: DriverSettings,
        filters: Vec<String>,
        context: SessionContext,
        supervisor: Arc<SessionSupervisor>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            filters: filters.into(),
            context,
            supervisor,
            next_key: AtomicU64::new(1),
        }
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Handle a device arrival without blocking the caller
    pub fn dispatch<D: UsbDevice + 'static>(&self, device: D) {
        let key = SessionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let settings = self.settings.clone();
        let filters = self.filters.clone();
        let context = self.context.clone();
        let supervisor = self.supervisor.clone();

        let spawned = self.supervisor.spawn(format!("usb-{}", key.0), move || {
            probe_and_run(device, key, &settings, &filters, context, &supervisor);
        });

        if let Err(e) = spawned {
            error!("Failed to spawn probe thread for {}: {}", key, e);
        }
    }
}

fn probe_and_run<D: UsbDevice>(
    device: D,
    key: SessionKey,
    settings: &DriverSettings,
    filters: &[String],
    context: SessionContext,
    supervisor: &SessionSupervisor,
) {
    let location = match device.location() {
        Ok(location) => location,
        Err(e) => {
            warn!("Failed to read device descriptor: {}", e);
            return;
        }
    };

    if !usb::is_probe_candidate(&location, filters) {
        debug!("Device ignored by filter: {}", location);
        return;
    }
    info!("Device found: {}", location);

    match usb::probe(&device, settings, &*context.table) {
        Ok(ProbeOutcome::Session(link)) => {
            let session = AccessorySession::new(key, link, context);
            supervisor.register(&session);
            session.run();
            supervisor.unregister(key);
        }
        Ok(ProbeOutcome::ModeSwitchRequested(id)) => {
            debug!("{} re-enumerating as accessory {}", location, id);
        }
        Ok(ProbeOutcome::NotAnAccessory) => {}
        Err(e) => warn!("Probe of {} failed: {}", location, e),
    }
}

/// libusb hotplug callback feeding the dispatcher
pub struct HotplugHandler {
    dispatcher: Arc<Dispatcher>,
}

impl HotplugHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl<T: UsbContext + 'static> Hotplug<T> for HotplugHandler {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.dispatcher.dispatch(device);
    }

    fn device_left(&mut self, device: Device<T>) {
        // Sessions notice removal through their own transfer errors
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
    }
}
