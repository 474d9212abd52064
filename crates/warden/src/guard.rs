//! Control loop
//!
//! Drives one event at a time through decide, enforce and notify. Reload and
//! shutdown requests arrive on a queue fed by the signal listener and are
//! applied between events, never during one.

use crate::engine::decide;
use crate::enforcement::{Enforcer, UnbindControl};
use crate::monitor::EventSource;
use crate::notify::Notifier;
use crate::policy::PolicyStore;
use crate::service;
use common::{Decision, DeviceEvent, OutcomeRecord};
use std::fmt;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requests delivered to the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Re-read the policy file
    Reload,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Starting,
    Monitoring,
    ReloadPending,
    ShuttingDown,
}

/// Why [`Guard::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM, SIGINT or an explicit shutdown request
    Requested,
    /// The event source closed
    EndOfStream,
    /// The event source failed
    SourceFailed(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Requested => write!(f, "shutdown requested"),
            ShutdownReason::EndOfStream => write!(f, "event stream closed"),
            ShutdownReason::SourceFailed(e) => write!(f, "event source failed: {}", e),
        }
    }
}

/// Create the control queue
pub fn control_channel() -> (
    mpsc::UnboundedSender<ControlSignal>,
    mpsc::UnboundedReceiver<ControlSignal>,
) {
    mpsc::unbounded_channel()
}

/// Translate SIGHUP into [`ControlSignal::Reload`] and SIGTERM/SIGINT into
/// [`ControlSignal::Shutdown`]
///
/// The task only enqueues. It exits once the receiving side is gone.
pub fn spawn_signal_listener(
    sender: mpsc::UnboundedSender<ControlSignal>,
) -> std::io::Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP, scheduling policy reload");
                    ControlSignal::Reload
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down");
                    ControlSignal::Shutdown
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT, shutting down");
                    ControlSignal::Shutdown
                }
            };

            if sender.send(request).is_err() {
                debug!("Control loop gone, signal listener exiting");
                break;
            }
        }
    }))
}

/// The authorization daemon's event loop
pub struct Guard<S, C> {
    source: S,
    policy: PolicyStore,
    enforcer: Enforcer<C>,
    notifier: Box<dyn Notifier>,
    state: GuardState,
}

impl<S: EventSource, C: UnbindControl> Guard<S, C> {
    pub fn new(
        source: S,
        policy: PolicyStore,
        enforcer: Enforcer<C>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            policy,
            enforcer,
            notifier,
            state: GuardState::Starting,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Process events until shutdown is requested or the source ends
    ///
    /// Pending control requests always win over the next event. Consumes the
    /// guard, so the event source is dropped on return.
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> ShutdownReason {
        self.state = GuardState::Monitoring;
        self.notifier.daemon_started(env!("CARGO_PKG_VERSION"));
        self.report_status();

        let mut signals_open = true;
        let reason = loop {
            tokio::select! {
                biased;

                request = signals.recv(), if signals_open => match request {
                    Some(ControlSignal::Reload) => self.reload_policy(),
                    Some(ControlSignal::Shutdown) => break ShutdownReason::Requested,
                    None => {
                        warn!(
                            "Control queue closed, reload and shutdown requests \
                             are no longer received"
                        );
                        signals_open = false;
                    }
                },

                event = self.source.next_event() => match event {
                    Ok(Some(event)) => {
                        self.handle_event(event).await;
                    }
                    Ok(None) => break ShutdownReason::EndOfStream,
                    Err(e) => break ShutdownReason::SourceFailed(e.to_string()),
                },
            }
        };

        self.state = GuardState::ShuttingDown;
        match &reason {
            ShutdownReason::SourceFailed(_) => error!("Stopping monitoring: {}", reason),
            _ => info!("Stopping monitoring: {}", reason),
        }
        self.notifier.daemon_stopped(&reason.to_string());
        reason
    }

    /// Decide on one event, unbind it if denied and present, report the outcome
    ///
    /// Events without a device node are not processed and yield no record.
    pub async fn handle_event(&mut self, event: DeviceEvent) -> Option<OutcomeRecord> {
        if event.devnode.is_none() {
            debug!("Ignoring {} event without device node: {}", event.action, event.devpath);
            return None;
        }

        let snapshot = self.policy.snapshot();
        let decision = decide(&event, &snapshot);

        let enforcement = match decision {
            Decision::Deny(_) if event.action.is_present() => {
                Some(self.enforcer.enforce(&event.devpath).await)
            }
            _ => None,
        };

        let record = OutcomeRecord::new(event, decision, enforcement);
        self.notifier.outcome(&record);
        Some(record)
    }

    /// Re-read the policy file; on failure the previous allow-list stays active
    pub fn reload_policy(&mut self) {
        self.state = GuardState::ReloadPending;
        if let Err(e) = service::notify_reloading() {
            warn!("Failed to notify systemd: {:#}", e);
        }

        let result = self.policy.reload();
        self.notifier.policy_reloaded(self.policy.path(), &result);

        self.state = GuardState::Monitoring;
        if let Err(e) = service::notify_ready() {
            warn!("Failed to notify systemd: {:#}", e);
        }
        self.report_status();
    }

    fn report_status(&self) {
        let status = format!(
            "Monitoring USB devices, {} allow-list entries{}",
            self.policy.snapshot().len(),
            if self.enforcer.is_dry_run() {
                " (dry run)"
            } else {
                ""
            }
        );
        if let Err(e) = service::notify_status(&status) {
            debug!("Failed to send status to systemd: {:#}", e);
        }
    }
}
