//! In-process peer used by tests and the CLI.
//!
//! Every written command is decoded and recorded. Transactions and replies are
//! acknowledged with `BR_TRANSACTION_COMPLETE` the way the kernel does, then a
//! responder closure decides what else to deliver. A read with nothing queued
//! waits briefly and then reports `BR_FINISHED`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use binder_wire::{decode, Command, CommandReader, CommandWriter, Return, WireRecord};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::driver::{Driver, DriverError, FrozenInfo, ProcessIdentity, WriteRead};

pub type Responder = Box<dyn FnMut(&Command) -> Vec<Return> + Send>;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(20);
const EINVAL: i32 = 22;

#[derive(Default)]
struct ScriptState {
    written: Vec<Command>,
    pending: VecDeque<Return>,
    responder: Option<Responder>,
    closed: bool,
    interrupts: usize,
    round_trips: usize,
    thread_exits: usize,
    max_threads: Option<usize>,
    frozen: HashMap<i32, bool>,
    frozen_info: HashMap<i32, FrozenInfo>,
}

pub struct ScriptedDriver {
    state: Mutex<ScriptState>,
    arrived: Condvar,
    idle_timeout: Duration,
    identity: ProcessIdentity,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            arrived: Condvar::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            identity: ProcessIdentity {
                pid: std::process::id() as i32,
                uid: 0,
            },
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&Command) -> Vec<Return> + Send + 'static,
    {
        let driver = Self::new();
        driver.set_responder(responder);
        driver
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Command) -> Vec<Return> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queues a record for the next read, waking a blocked reader.
    pub fn push_return(&self, ret: Return) {
        self.state.lock().pending.push_back(ret);
        self.arrived.notify_all();
    }

    /// Every command written so far, in write order.
    pub fn written(&self) -> Vec<Command> {
        self.state.lock().written.clone()
    }

    pub fn take_written(&self) -> Vec<Command> {
        std::mem::take(&mut self.state.lock().written)
    }

    /// Makes every later exchange fail with a bad descriptor.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.arrived.notify_all();
    }

    /// Fails the next `count` exchanges with `Interrupted`.
    pub fn interrupt_next(&self, count: usize) {
        self.state.lock().interrupts = count;
    }

    pub fn round_trips(&self) -> usize {
        self.state.lock().round_trips
    }

    pub fn thread_exits(&self) -> usize {
        self.state.lock().thread_exits
    }

    pub fn max_threads(&self) -> Option<usize> {
        self.state.lock().max_threads
    }

    pub fn is_frozen(&self, pid: i32) -> bool {
        self.state.lock().frozen.get(&pid).copied().unwrap_or(false)
    }

    pub fn set_frozen_info(&self, pid: i32, info: FrozenInfo) {
        self.state.lock().frozen_info.insert(pid, info);
    }

    fn record(state: &mut ScriptState, cmd: Command) {
        trace!(command = cmd.name(), "scripted peer received");
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&cmd),
            None => Vec::new(),
        };
        let is_transaction = matches!(
            cmd,
            Command::Transaction(_)
                | Command::Reply(_)
                | Command::TransactionSg { .. }
                | Command::ReplySg { .. }
        );
        if is_transaction && !replies.iter().any(acknowledges) {
            state.pending.push_back(Return::TransactionComplete);
        }
        state.pending.extend(replies);
        state.written.push(cmd);
    }
}

/// Records the peer sends in place of a completion acknowledgement.
fn acknowledges(ret: &Return) -> bool {
    matches!(
        ret,
        Return::TransactionComplete
            | Return::TransactionPendingFrozen
            | Return::OnewaySpamSuspect
            | Return::DeadReply
            | Return::FailedReply
            | Return::FrozenReply
    )
}

impl Driver for ScriptedDriver {
    fn write_read(&self, bwr: &mut WriteRead<'_>) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DriverError::BadDescriptor);
        }
        if state.interrupts > 0 {
            state.interrupts -= 1;
            return Err(DriverError::Interrupted);
        }
        state.round_trips += 1;

        let mut input = CommandReader::from_bytes(bwr.write);
        while let Some(next) = decode::<Command>(&mut input) {
            match next {
                Ok(cmd) => Self::record(&mut state, cmd),
                Err(err) => {
                    warn!("scripted peer rejected write: {err}");
                    return Err(DriverError::Errno(EINVAL));
                }
            }
        }
        bwr.write_consumed = bwr.write.len();

        if bwr.read_size == 0 {
            return Ok(());
        }

        let deadline = Instant::now() + self.idle_timeout;
        while state.pending.is_empty() && !state.closed {
            if self.arrived.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.closed {
            return Err(DriverError::BadDescriptor);
        }
        if state.pending.is_empty() {
            state.pending.push_back(Return::Finished);
        }

        bwr.read.clear();
        while let Some(front) = state.pending.front() {
            let mut record = CommandWriter::new();
            front
                .encode(&mut record)
                .map_err(|_| DriverError::Errno(EINVAL))?;
            if !bwr.read.is_empty() && bwr.read.len() + record.len() > bwr.read_size {
                break;
            }
            bwr.read.extend_from_slice(record.as_bytes());
            state.pending.pop_front();
        }
        Ok(())
    }

    fn thread_exit(&self) {
        self.state.lock().thread_exits += 1;
    }

    fn set_max_threads(&self, max_threads: usize) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DriverError::BadDescriptor);
        }
        state.max_threads = Some(max_threads);
        Ok(())
    }

    fn freeze(&self, pid: i32, enable: bool, _timeout_ms: u32) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DriverError::BadDescriptor);
        }
        state.frozen.insert(pid, enable);
        Ok(())
    }

    fn frozen_info(&self, pid: i32) -> Result<FrozenInfo, DriverError> {
        let state = self.state.lock();
        if state.closed {
            return Err(DriverError::BadDescriptor);
        }
        Ok(state.frozen_info.get(&pid).copied().unwrap_or_default())
    }

    fn identity(&self) -> ProcessIdentity {
        self.identity
    }
}
