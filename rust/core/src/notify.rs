//! Inter-processor notification lines

use crate::{IpcError, ProcId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handler fired when a remote processor raises its line; receives the
/// id of the processor that signalled.
pub type NotifyCallback = Arc<dyn Fn(ProcId) + Send + Sync>;

/// Capability set every notification driver provides.
///
/// Callbacks run in the signalling context and must only hand off work
/// (set a flag, wake a task), never dispatch messages themselves.
pub trait Notifier: Send + Sync {
    /// Install the handler for signals raised by `remote`
    fn register_callback(&self, remote: ProcId, callback: NotifyCallback) -> Result<()>;

    /// Remove the handler for signals raised by `remote`
    fn unregister_callback(&self, remote: ProcId) -> Result<()>;

    /// Raise the line towards `remote`
    fn signal(&self, remote: ProcId) -> Result<()>;

    /// Mask signals arriving from `remote`; they are latched, not lost
    fn disable_interrupt(&self, remote: ProcId);

    /// Unmask signals from `remote`, firing once if one was latched
    fn enable_interrupt(&self, remote: ProcId);

    /// Driver name for logs
    fn driver_name(&self) -> &'static str;
}

#[derive(Default)]
struct Line {
    callback: Option<NotifyCallback>,
    masked: bool,
    pending: bool,
    raised: u64,
}

/// In-process mailbox connecting any number of processors.
///
/// Holds one line per ordered `(from, to)` pair. A signal on a masked or
/// unhandled line is latched and delivered once, so several raises before
/// the receiver runs coalesce into a single callback.
#[derive(Default)]
pub struct MailboxHub {
    lines: Mutex<HashMap<(ProcId, ProcId), Line>>,
}

impl fmt::Debug for MailboxHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxHub")
            .field("lines", &self.lines.lock().len())
            .finish()
    }
}

impl MailboxHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Driver instance for one processor
    pub fn notifier(self: &Arc<Self>, local: ProcId) -> MailboxNotifier {
        MailboxNotifier {
            hub: Arc::clone(self),
            local,
        }
    }

    /// Number of times `from` raised the line towards `to`
    pub fn signals_raised(&self, from: ProcId, to: ProcId) -> u64 {
        self.lines
            .lock()
            .get(&(from, to))
            .map(|line| line.raised)
            .unwrap_or(0)
    }

    /// Whether a signal from `from` to `to` is latched and undelivered
    pub fn is_pending(&self, from: ProcId, to: ProcId) -> bool {
        self.lines
            .lock()
            .get(&(from, to))
            .map(|line| line.pending)
            .unwrap_or(false)
    }

    fn raise(&self, from: ProcId, to: ProcId) {
        let fire = {
            let mut lines = self.lines.lock();
            let line = lines.entry((from, to)).or_default();
            line.raised += 1;
            match (&line.callback, line.masked) {
                (Some(callback), false) => Some(Arc::clone(callback)),
                _ => {
                    line.pending = true;
                    None
                }
            }
        };

        // Callbacks run outside the lock so they may signal in turn.
        if let Some(callback) = fire {
            callback(from);
        } else {
            trace!("Latched signal {} -> {}", from, to);
        }
    }

    fn install(&self, from: ProcId, to: ProcId, callback: Option<NotifyCallback>) {
        let fire = {
            let mut lines = self.lines.lock();
            let line = lines.entry((from, to)).or_default();
            line.callback = callback;
            take_pending(line)
        };
        if let Some(callback) = fire {
            callback(from);
        }
    }

    fn set_masked(&self, from: ProcId, to: ProcId, masked: bool) {
        let fire = {
            let mut lines = self.lines.lock();
            let line = lines.entry((from, to)).or_default();
            line.masked = masked;
            take_pending(line)
        };
        if let Some(callback) = fire {
            callback(from);
        }
    }
}

fn take_pending(line: &mut Line) -> Option<NotifyCallback> {
    if line.pending && !line.masked {
        if let Some(callback) = &line.callback {
            line.pending = false;
            return Some(Arc::clone(callback));
        }
    }
    None
}

/// One processor's view of a [`MailboxHub`]
#[derive(Clone)]
pub struct MailboxNotifier {
    hub: Arc<MailboxHub>,
    local: ProcId,
}

impl MailboxNotifier {
    pub fn local(&self) -> ProcId {
        self.local
    }
}

impl Notifier for MailboxNotifier {
    fn register_callback(&self, remote: ProcId, callback: NotifyCallback) -> Result<()> {
        if remote == self.local {
            return Err(IpcError::Notify(format!(
                "{} cannot register a line to itself",
                remote
            )));
        }
        debug!("Mailbox line {} -> {} handled", remote, self.local);
        self.hub.install(remote, self.local, Some(callback));
        Ok(())
    }

    fn unregister_callback(&self, remote: ProcId) -> Result<()> {
        debug!("Mailbox line {} -> {} released", remote, self.local);
        self.hub.install(remote, self.local, None);
        Ok(())
    }

    fn signal(&self, remote: ProcId) -> Result<()> {
        if remote == self.local {
            return Err(IpcError::Notify(format!("{} cannot signal itself", remote)));
        }
        self.hub.raise(self.local, remote);
        Ok(())
    }

    fn disable_interrupt(&self, remote: ProcId) {
        self.hub.set_masked(remote, self.local, true);
    }

    fn enable_interrupt(&self, remote: ProcId) {
        self.hub.set_masked(remote, self.local, false);
    }

    fn driver_name(&self) -> &'static str {
        "mailbox"
    }
}
