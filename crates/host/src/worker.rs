//! USB event thread
//!
//! Owns the libusb context and the hotplug registration. libusb invokes the
//! hotplug callback from inside `handle_events`, so this loop is what feeds
//! the dispatcher. Between event rounds it answers relay commands from the
//! async side.

use crate::hotplug::{Dispatcher, HotplugHandler, SessionSupervisor};
use common::{RelayCommand, RelayWorker};
use rusb::{Context, HotplugBuilder, Registration, UsbContext};
use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("libusb was built without hotplug support")]
    HotplugUnsupported,

    #[error("USB initialization failed: {0}")]
    Usb(#[from] rusb::Error),

    #[error("failed to spawn USB worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("USB worker exited during startup")]
    Startup,
}

pub struct UsbWorkerThread {
    // Dropped before `context`
    registration: Option<Registration<Context>>,
    context: Context,
    supervisor: Arc<SessionSupervisor>,
    worker: RelayWorker,
}

impl UsbWorkerThread {
    /// Create the context and register for arrivals, enumerating devices
    /// already attached
    pub fn new(worker: RelayWorker, dispatcher: Arc<Dispatcher>) -> Result<Self, WorkerError> {
        if !rusb::has_hotplug() {
            return Err(WorkerError::HotplugUnsupported);
        }

        let context = Context::new()?;
        let supervisor = dispatcher.supervisor().clone();
        let registration = HotplugBuilder::new()
            .enumerate(true)
            .register(&context, Box::new(HotplugHandler::new(dispatcher)))?;
        debug!("Hot-plug callbacks registered");

        Ok(Self {
            registration: Some(registration),
            context,
            supervisor,
            worker,
        })
    }

    /// Event loop; returns after `Shutdown` once every session thread is joined
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(RelayCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }
        }

        // No new arrivals past this point
        self.registration.take();

        self.supervisor.stop_all();
        self.supervisor.join_all();
        info!("USB worker thread stopped");
    }

    fn handle_command(&mut self, cmd: RelayCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match cmd {
            RelayCommand::ListSessions { response } => {
                let sessions = self.supervisor.live_sessions();
                debug!("Listing {} sessions", sessions.len());
                let _ = response.send(sessions);
            }
            RelayCommand::Shutdown => {}
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }
}

/// Start the USB worker thread
///
/// Blocks until the context and hotplug registration are set up, so that
/// startup failures surface here rather than on the thread.
pub fn spawn_usb_worker(
    worker: RelayWorker,
    dispatcher: Arc<Dispatcher>,
) -> Result<JoinHandle<()>, WorkerError> {
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);

    let handle = std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || match UsbWorkerThread::new(worker, dispatcher) {
            Ok(thread) => {
                let _ = ready_tx.send(Ok(()));
                thread.run();
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(WorkerError::Startup)
        }
    }
}
