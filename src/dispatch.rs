//! Dispatcher thread
//!
//! One dispatcher per network instance. It is the only thread that runs
//! message handlers, connection callbacks, posted tasks, and timer
//! actions, so protocol state never needs cross-thread coordination
//! beyond posting work here.
//!
//! ## Inputs
//! - command channel: posted tasks (the cross-thread call), timer armings,
//!   stop
//! - inbound queue: bounded MPSC of `(Msg, Conn)` fed by reader threads
//! - event channel: connection setup/teardown notifications
//! - timer heap: deadlines drained between channel activity
//!
//! The inbound queue is drained at most `burst_size` messages per slice;
//! after a full burst the loop re-enters `select!` so tasks, events, and
//! timers are never starved by a message flood.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;

use crate::error::LinkError;
use crate::msg::{Msg, Opcode};
use crate::pool::ConnRef;
use crate::timer::{ArmToken, TimerAction, TimerHandle, TimerQueue};

/// Work posted to the dispatcher from any thread.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handler bound to an opcode; invoked on the dispatcher.
pub(crate) type MsgHandler = Arc<dyn Fn(Msg, ConnRef) + Send + Sync>;

/// Connection state callback: `(conn, connected)`.
pub(crate) type ConnCallback = Arc<dyn Fn(&ConnRef, bool) + Send + Sync>;

/// Error callback: `(error, fatal)`.
pub(crate) type ErrorCallback = Arc<dyn Fn(&LinkError, bool) + Send + Sync>;

/// Sleep cap when no timer is armed.
const IDLE_TICK: Duration = Duration::from_millis(100);

pub(crate) enum Cmd {
    Task(Task),
    Arm {
        delay: Duration,
        token: ArmToken,
        action: TimerAction,
    },
    Stop,
}

/// Connection lifecycle notifications from the pool threads.
pub(crate) enum ConnEvent {
    SetUp(ConnRef),
    TearDown(ConnRef),
}

/// Callback registry shared between the dispatcher and the public API.
///
/// Only the dispatcher invokes anything stored here; the mutexes exist so
/// registration can happen from user threads.
pub(crate) struct NetShared {
    pub handlers: Mutex<HashMap<Opcode, MsgHandler>>,
    /// Layer-internal hook (client index, peer state machine); runs before
    /// the user's conn handler.
    pub conn_hook: Mutex<Option<ConnCallback>>,
    pub conn_handler: Mutex<Option<ConnCallback>>,
    pub error_cb: Mutex<Option<ErrorCallback>>,
}

impl NetShared {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            conn_hook: Mutex::new(None),
            conn_handler: Mutex::new(None),
            error_cb: Mutex::new(None),
        }
    }

    /// Route an error to the registered callback.
    pub fn report(&self, err: &LinkError, fatal: bool) {
        if fatal {
            tracing::error!("dispatcher error: {}", err);
        } else {
            tracing::warn!("recoverable error: {}", err);
        }
        let cb = self.error_cb.lock().clone();
        if let Some(cb) = cb {
            cb(err, fatal);
        }
    }

    /// Drop all registered callbacks. Breaks the reference cycle between
    /// the registry and layer objects captured in handlers.
    pub fn clear_callbacks(&self) {
        self.handlers.lock().clear();
        *self.conn_hook.lock() = None;
        *self.conn_handler.lock() = None;
        *self.error_cb.lock() = None;
    }
}

/// Cloneable handle used to post work onto the dispatcher.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    cmd_tx: Sender<Cmd>,
}

impl DispatcherHandle {
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.cmd_tx.send(Cmd::Task(Box::new(f)));
    }

    /// Arm `timer` to run `f` after `delay`, invalidating any previous
    /// arming of the same handle.
    pub fn schedule(&self, delay: Duration, timer: &TimerHandle, f: impl FnOnce() + Send + 'static) {
        let token = timer.arm();
        let _ = self.cmd_tx.send(Cmd::Arm {
            delay,
            token,
            action: Box::new(f),
        });
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
    }
}

/// Spawn the dispatcher thread for one network instance.
pub(crate) fn spawn(
    shared: Arc<NetShared>,
    inbound_rx: Receiver<(Msg, ConnRef)>,
    event_rx: Receiver<ConnEvent>,
    burst_size: usize,
) -> std::io::Result<(DispatcherHandle, JoinHandle<()>)> {
    let (cmd_tx, cmd_rx) = unbounded();
    let thread = thread::Builder::new()
        .name("peerlink-dispatcher".to_string())
        .spawn(move || run_loop(shared, cmd_rx, inbound_rx, event_rx, burst_size))?;
    Ok((DispatcherHandle { cmd_tx }, thread))
}

fn run_loop(
    shared: Arc<NetShared>,
    cmd_rx: Receiver<Cmd>,
    inbound_rx: Receiver<(Msg, ConnRef)>,
    event_rx: Receiver<ConnEvent>,
    burst_size: usize,
) {
    let mut timers = TimerQueue::new();

    tracing::debug!("dispatcher started (burst_size {})", burst_size);

    'outer: loop {
        // Lifecycle events outrank messages: a connection's setup hook must
        // run before its first message is dispatched.
        while let Ok(ev) = event_rx.try_recv() {
            handle_event(&shared, ev);
        }

        let timeout = timers
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_TICK);

        select! {
            recv(cmd_rx) -> cmd => match cmd {
                Ok(Cmd::Task(task)) => run_guarded(&shared, "task", task),
                Ok(Cmd::Arm { delay, token, action }) => {
                    timers.insert(Instant::now() + delay, token, action);
                }
                Ok(Cmd::Stop) | Err(_) => break 'outer,
            },
            recv(event_rx) -> ev => match ev {
                Ok(ev) => handle_event(&shared, ev),
                Err(_) => break 'outer,
            },
            recv(inbound_rx) -> item => match item {
                Ok((msg, conn)) => {
                    dispatch_msg(&shared, msg, conn);
                    // Drain the rest of this burst without re-entering
                    // select; then yield back to tasks/events/timers.
                    for _ in 1..burst_size {
                        match inbound_rx.try_recv() {
                            Ok((msg, conn)) => dispatch_msg(&shared, msg, conn),
                            Err(_) => break,
                        }
                    }
                }
                Err(_) => break 'outer,
            },
            default(timeout) => {}
        }

        for action in timers.pop_due(Instant::now()) {
            run_guarded(&shared, "timer", action);
        }
    }

    tracing::debug!("dispatcher stopped");
}

/// Look up the handler for one inbound message and invoke it.
fn dispatch_msg(shared: &NetShared, msg: Msg, conn: ConnRef) {
    let handler = shared.handlers.lock().get(&msg.opcode()).cloned();
    match handler {
        None => {
            tracing::warn!("unknown opcode: 0x{:02x}, dropping message", msg.opcode());
        }
        Some(handler) => {
            tracing::trace!(
                "got message opcode 0x{:02x} ({} bytes) from {}",
                msg.opcode(),
                msg.length(),
                conn.addr()
            );
            run_guarded(shared, "message handler", move || handler(msg, conn));
        }
    }
}

fn handle_event(shared: &NetShared, ev: ConnEvent) {
    let (conn, connected) = match ev {
        ConnEvent::SetUp(conn) => (conn, true),
        ConnEvent::TearDown(conn) => (conn, false),
    };
    let hook = shared.conn_hook.lock().clone();
    if let Some(hook) = hook {
        run_guarded(shared, "conn hook", || hook(&conn, connected));
    }
    let cb = shared.conn_handler.lock().clone();
    if let Some(cb) = cb {
        run_guarded(shared, "conn handler", || cb(&conn, connected));
    }
}

/// Run dispatcher-thread work, converting panics into a fatal report so
/// one misbehaving handler cannot take the loop down.
fn run_guarded(shared: &NetShared, what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        shared.report(&LinkError::Dispatch(format!("{} panicked", what)), true);
    }
}
