//! Per-thread transaction engine.
//!
//! An [`IpcThread`] owns the outbound and inbound command buffers of one OS
//! thread and drives every exchange with the peer for it. Inbound commands
//! that arrive while a call is waiting for its reply are executed in place,
//! which is how nested calls between processes chain.

use std::sync::Arc;

use binder_wire::protocol::{TF_ACCEPT_FDS, TF_CLEAR_BUF, TF_ONE_WAY, TF_STATUS_CODE};
use binder_wire::{
    decode, Command, CommandReader, CommandWriter, HandleCookie, Parcel, PtrCookie, Return,
    TransactionData, WireError, WireRecord,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::binder::{Binder, DeathRecipient, FrozenStateListener};
use crate::config::CallRestriction;
use crate::driver::{DriverError, WriteRead};
use crate::error::{fatal, status_to_result, BinderError, BinderResult, TransactStatus};
use crate::identity::{CallingIdentity, WorkSource, UNSET_WORK_SOURCE};
use crate::process::ProcessContext;
use crate::refs::{Deref, DerefQueues, Pin, PostWritePins};

pub struct IpcThread {
    process: ProcessContext,
    out: CommandWriter,
    input: CommandReader,
    calling: CallingIdentity,
    work_source: WorkSource,
    strict_mode_policy: i32,
    last_transaction_flags: u32,
    call_restriction: CallRestriction,
    last_error: Option<BinderError>,
    derefs: DerefQueues<u64>,
    post_write: PostWritePins,
    /// Peer buffers returned by dropped parcels, written as `BC_FREE_BUFFER`.
    released: Arc<Mutex<Vec<u64>>>,
    /// Latched once the peer descriptor is gone.
    dead: bool,
    is_looper: bool,
    is_flushing: bool,
    serving_depth: usize,
}

impl IpcThread {
    pub(crate) fn new(process: ProcessContext) -> Self {
        let identity = process.identity();
        let call_restriction = process.config().call_restriction;
        Self {
            process,
            out: CommandWriter::with_capacity(256),
            input: CommandReader::new(),
            calling: CallingIdentity {
                pid: identity.pid,
                uid: identity.uid,
                sid: None,
                has_explicit: false,
            },
            work_source: WorkSource::default(),
            strict_mode_policy: 0,
            last_transaction_flags: 0,
            call_restriction,
            last_error: None,
            derefs: DerefQueues::default(),
            post_write: PostWritePins::default(),
            released: Arc::new(Mutex::new(Vec::new())),
            dead: false,
            is_looper: false,
            is_flushing: false,
            serving_depth: 0,
        }
    }

    pub fn process(&self) -> &ProcessContext {
        &self.process
    }

    // ---- outbound calls ----

    /// Sends a transaction to `handle`.
    ///
    /// One-way calls return once the peer has taken the write. Other calls
    /// wait for the reply, executing whatever the peer interleaves with it.
    pub fn transact(
        &mut self,
        handle: u32,
        code: u32,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: u32,
    ) -> BinderResult<TransactStatus> {
        if self.dead {
            return Err(BinderError::DeadObject);
        }
        if data.error() != 0 {
            let err = BinderError::from_code(data.error());
            self.last_error = Some(err);
            return Err(err);
        }
        let flags = flags | TF_ACCEPT_FDS;
        trace!(handle, code, flags, size = data.data_size(), "transact");
        self.write_transaction_data(false, flags, handle, code, data)?;

        if flags & TF_ONE_WAY != 0 {
            return self.wait_for_response(None);
        }
        match self.call_restriction {
            CallRestriction::None => {}
            CallRestriction::ErrorIfNotOneway => {
                error!(code, "process making non-oneway call but is restricted");
            }
            CallRestriction::FatalIfNotOneway => {
                fatal!("process may not make non-oneway calls (code: {code})");
            }
        }
        match reply {
            Some(reply) => self.wait_for_response(Some(reply)),
            None => {
                let mut discarded = Parcel::new();
                self.wait_for_response(Some(&mut discarded))
            }
        }
    }

    /// Replies to the transaction this thread is serving.
    pub fn send_reply(&mut self, reply: &Parcel, flags: u32) -> BinderResult<()> {
        self.write_transaction_data(true, flags, u32::MAX, 0, reply)?;
        self.wait_for_response(None).map(|_| ())
    }

    fn write_transaction_data(
        &mut self,
        is_reply: bool,
        flags: u32,
        handle: u32,
        code: u32,
        data: &Parcel,
    ) -> BinderResult<()> {
        let tr = if data.error() == 0 {
            let (payload, offsets) = data.to_wire();
            TransactionData::to_handle(handle, code, flags, payload, offsets)
        } else {
            let status = data.error().to_le_bytes().to_vec();
            TransactionData::to_handle(handle, code, flags | TF_STATUS_CODE, status, Vec::new())
        };
        let cmd = if is_reply {
            Command::Reply(tr)
        } else {
            Command::Transaction(tr)
        };
        self.write_command(&cmd)
    }

    fn wait_for_response(&mut self, reply: Option<&mut Parcel>) -> BinderResult<TransactStatus> {
        let result = self.wait_loop(reply);
        if let Err(err) = result {
            self.last_error = Some(err);
        }
        result
    }

    fn wait_loop(&mut self, mut reply: Option<&mut Parcel>) -> BinderResult<TransactStatus> {
        loop {
            self.talk_with_driver(true)?;
            let ret = match decode::<Return>(&mut self.input) {
                None => continue,
                Some(Ok(ret)) => ret,
                Some(Err(WireError::UnknownCommand { tag })) => {
                    error!("skipping unknown command {tag:#x} from driver");
                    continue;
                }
                Some(Err(err)) => {
                    error!("malformed record while waiting for response: {err}");
                    return Err(BinderError::FailedTransaction);
                }
            };
            trace!(command = ret.name(), "wait_for_response");

            match ret {
                Return::TransactionComplete => {
                    if reply.is_none() {
                        return Ok(TransactStatus::Completed);
                    }
                }
                Return::OnewaySpamSuspect => {
                    error!("process seems to be sending too many oneway calls");
                    if reply.is_none() {
                        return Ok(TransactStatus::Completed);
                    }
                }
                Return::TransactionPendingFrozen => {
                    warn!("sending oneway calls to frozen process");
                    return Ok(TransactStatus::PendingFrozen);
                }
                Return::DeadReply => return Err(BinderError::DeadObject),
                Return::FailedReply => return Err(BinderError::FailedTransaction),
                Return::FrozenReply => {
                    warn!("transaction failed because process frozen");
                    return Err(BinderError::FailedTransaction);
                }
                Return::AcquireResult(result) => {
                    return if result != 0 {
                        Ok(TransactStatus::Completed)
                    } else {
                        Err(BinderError::InvalidOperation)
                    };
                }
                Return::Reply(tr) => {
                    let Some(reply) = reply.as_deref_mut() else {
                        self.free_buffer(tr.buffer_id)?;
                        continue;
                    };
                    if tr.flags & TF_STATUS_CODE == 0 {
                        let hook = self.release_hook();
                        reply.adopt(tr.data, tr.offsets, tr.buffer_id, hook);
                        return Ok(TransactStatus::Completed);
                    }
                    let status = match tr.data.get(..4) {
                        Some(raw) => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                        None => {
                            error!(size = tr.data.len(), "status reply too short");
                            self.free_buffer(tr.buffer_id)?;
                            return Err(BinderError::FailedTransaction);
                        }
                    };
                    self.free_buffer(tr.buffer_id)?;
                    return status_to_result(status).map(|()| TransactStatus::Completed);
                }
                other => self.execute_command(other)?,
            }
        }
    }

    // ---- driver exchange ----

    /// One exchange with the peer.
    ///
    /// Reads only once the inbound buffer is drained, and only hands over the
    /// outbound bytes when not receiving or when a read is needed anyway.
    pub fn talk_with_driver(&mut self, do_receive: bool) -> BinderResult<()> {
        if self.dead {
            return Err(BinderError::DeadObject);
        }
        self.write_released_buffers()?;

        let need_read = self.input.is_drained();
        let write_len = if !do_receive || need_read {
            self.out.len()
        } else {
            0
        };
        let read_size = if do_receive && need_read {
            self.process.config().read_buffer_capacity
        } else {
            0
        };
        if write_len == 0 && read_size == 0 {
            return Ok(());
        }

        let driver = self.process.driver();
        let mut read = Vec::with_capacity(read_size);
        let mut bwr = WriteRead {
            write: &self.out.as_bytes()[..write_len],
            write_consumed: 0,
            read: &mut read,
            read_size,
        };
        let outcome = loop {
            match driver.write_read(&mut bwr) {
                Err(DriverError::Interrupted) => continue,
                other => break other,
            }
        };
        let consumed = bwr.write_consumed;

        match outcome {
            Ok(()) => {}
            Err(DriverError::BadDescriptor) => {
                error!("binder descriptor is no longer valid");
                self.dead = true;
                return Err(BinderError::DeadObject);
            }
            Err(err) => return Err(err.into()),
        }

        if consumed > 0 {
            if consumed < self.out.len() {
                fatal!(
                    "driver did not consume write buffer: consumed {consumed} of {} bytes",
                    self.out.len()
                );
            }
            self.out.clear();
            self.process_post_write_derefs();
        }
        if read_size > 0 {
            self.input.reset(read);
        }
        Ok(())
    }

    /// Pushes buffered commands to the peer without waiting for anything.
    pub fn flush_commands(&mut self) {
        if self.dead {
            return;
        }
        if let Err(err) = self.talk_with_driver(false) {
            warn!("flush_commands failed: {err}");
        }
        // Dropping post-write pins can queue more commands.
        if !self.out.is_empty() {
            if let Err(err) = self.talk_with_driver(false) {
                warn!("flush_commands failed: {err}");
            }
        }
        if !self.out.is_empty() {
            warn!(bytes = self.out.len(), "commands still pending after flush_commands");
        }
    }

    /// Flushes when nothing else guarantees this thread will reach the peer soon.
    pub fn flush_if_needed(&mut self) -> bool {
        if self.is_looper || self.serving_depth > 0 || self.is_flushing {
            return false;
        }
        self.is_flushing = true;
        self.flush_commands();
        self.is_flushing = false;
        true
    }

    fn write_command(&mut self, cmd: &Command) -> BinderResult<()> {
        self.write_released_buffers()?;
        trace!(command = cmd.name(), "queue");
        cmd.encode(&mut self.out)?;
        Ok(())
    }

    fn write_released_buffers(&mut self) -> BinderResult<()> {
        let released = std::mem::take(&mut *self.released.lock());
        for buffer_id in released {
            Command::FreeBuffer(buffer_id).encode(&mut self.out)?;
        }
        Ok(())
    }

    fn release_hook(&self) -> impl FnOnce(u64) + Send + 'static {
        let released = Arc::clone(&self.released);
        move |buffer_id| released.lock().push(buffer_id)
    }

    // ---- inbound commands ----

    /// Waits for the next command and executes it inside a pool slot.
    pub fn get_and_execute_command(&mut self) -> BinderResult<()> {
        self.talk_with_driver(true)?;
        let ret = match decode::<Return>(&mut self.input) {
            None => return Ok(()),
            Some(Ok(ret)) => ret,
            Some(Err(WireError::UnknownCommand { tag })) => {
                error!("skipping unknown command {tag:#x} from driver");
                return Ok(());
            }
            Some(Err(err)) => {
                error!("malformed record from driver: {err}");
                self.last_error = Some(BinderError::FailedTransaction);
                return Err(BinderError::FailedTransaction);
            }
        };
        trace!(command = ret.name(), "processing top-level command");

        let process = self.process.clone();
        process.pool().acquire_slot();
        let result = self.execute_command(ret);
        process.pool().release_slot();
        result
    }

    pub fn execute_command(&mut self, ret: Return) -> BinderResult<()> {
        let result = self.dispatch(ret);
        if let Err(err) = result {
            self.last_error = Some(err);
        }
        result
    }

    fn dispatch(&mut self, ret: Return) -> BinderResult<()> {
        let process = self.process.clone();
        match ret {
            Return::Error(code) => status_to_result(code),
            Return::Ok | Return::Noop => Ok(()),
            Return::Acquire(target) => {
                process.nodes().acquire(target);
                self.write_command(&Command::AcquireDone(target))
            }
            Return::Release(target) => {
                process.nodes().check_cookie(target);
                self.derefs.push_strong(target.ptr);
                Ok(())
            }
            Return::IncRefs(target) => {
                process.nodes().inc_weak(target);
                self.write_command(&Command::IncRefsDone(target))
            }
            Return::DecRefs(target) => {
                self.derefs.push_weak(target.ptr);
                Ok(())
            }
            Return::AttemptAcquire { target, .. } => {
                let success = process.nodes().attempt_acquire(target);
                if !success {
                    warn!(ptr = target.ptr, "attempt to acquire a node that is gone");
                }
                self.write_command(&Command::AcquireResult(success as i32))
            }
            Return::Transaction(tr) => self.execute_transaction(tr, None),
            Return::TransactionSecCtx { data, secctx } => self.execute_transaction(data, Some(secctx)),
            Return::DeadBinder(cookie) => {
                match process.notifications().obituary(cookie) {
                    Some((handle, recipient)) => recipient.binder_died(handle),
                    None => warn!(cookie, "obituary for unknown death subscription"),
                }
                self.write_command(&Command::DeadBinderDone(cookie))
            }
            Return::ClearDeathNotificationDone(cookie) => {
                if !process.notifications().finish_clear_death(cookie) {
                    warn!(cookie, "death notification cleared without a pending request");
                }
                Ok(())
            }
            Return::FrozenBinder(info) => {
                match process.notifications().frozen_listener(info.cookie) {
                    Some((handle, listener)) => listener.on_state_changed(handle, info.is_frozen),
                    None => warn!(cookie = info.cookie, "freeze state for unknown subscription"),
                }
                self.write_command(&Command::FreezeNotificationDone(info.cookie))
            }
            Return::ClearFreezeNotificationDone(cookie) => {
                if !process.notifications().finish_clear_freeze(cookie) {
                    warn!(cookie, "freeze notification cleared without a pending request");
                }
                Ok(())
            }
            Return::Finished => Err(BinderError::TimedOut),
            Return::SpawnLooper => {
                process.spawn_pooled_thread(false);
                Ok(())
            }
            other => {
                error!(command = other.name(), "bad command received from driver");
                Err(BinderError::Unknown)
            }
        }
    }

    fn execute_transaction(&mut self, tr: TransactionData, secctx: Option<u64>) -> BinderResult<()> {
        let TransactionData {
            target,
            cookie,
            code,
            flags,
            sender_pid,
            sender_euid,
            buffer_id,
            data,
            offsets,
            ..
        } = tr;
        let hook = self.release_hook();
        let mut buffer = Parcel::from_peer(data, offsets, buffer_id, hook);

        let saved_calling = std::mem::replace(
            &mut self.calling,
            CallingIdentity {
                pid: sender_pid,
                uid: sender_euid,
                sid: secctx,
                has_explicit: false,
            },
        );
        let saved_policy = self.strict_mode_policy;
        let saved_flags = std::mem::replace(&mut self.last_transaction_flags, flags);
        let saved_work_source = self.work_source;
        self.clear_calling_work_source();
        self.clear_propagate_work_source();

        let object = if target == 0 {
            self.process.context_object()
        } else {
            self.process.nodes().promote(target, cookie)
        };
        let mut reply = Parcel::new();
        self.serving_depth += 1;
        let result = match object {
            Some(object) => object.on_transact(self, code, &mut buffer, &mut reply, flags),
            None => Err(BinderError::UnknownTransaction),
        };
        debug_assert!(self.serving_depth > 0, "serving depth underflow");
        self.serving_depth -= 1;

        if flags & TF_ONE_WAY == 0 {
            if let Err(err) = result {
                reply.set_error(err.code());
            }
            // Return the inbound buffer before the caller can see the reply.
            buffer.clear();
            if let Err(err) = self.send_reply(&reply, flags & TF_CLEAR_BUF) {
                error!("error in send_reply for synchronous call: {err}");
            }
        } else if let Err(err) = result {
            info!(
                code,
                reply_size = reply.data_size(),
                "oneway function results on binder at {target:#x} will be dropped but finished with status {err}"
            );
        }

        self.calling = saved_calling;
        self.strict_mode_policy = saved_policy;
        self.last_transaction_flags = saved_flags;
        self.work_source = saved_work_source;
        Ok(())
    }

    // ---- deferred reference work ----

    /// Applies releases requested by the peer once the inbound buffer is drained.
    pub fn process_pending_derefs(&mut self) {
        if !self.input.is_drained() {
            return;
        }
        loop {
            let mut queues = std::mem::take(&mut self.derefs);
            if queues.is_empty() {
                break;
            }
            queues.drain_with(|deref, queues| {
                match deref {
                    Deref::Weak(ptr) => self.process.nodes().dec_weak(ptr),
                    Deref::Strong(ptr) => {
                        let owner = self.process.nodes().dec_strong(ptr);
                        if let Some(owner) = owner {
                            owner.on_last_strong_ref(self);
                        }
                        queues.push_weak(ptr);
                    }
                }
                queues.append(&mut self.derefs);
            });
        }
    }

    pub fn process_post_write_derefs(&mut self) {
        self.post_write.release();
    }

    // ---- thread pool ----

    /// Serves the peer until told to leave.
    ///
    /// Non-main threads leave when the peer reports there is no more work;
    /// every thread leaves when the peer is gone.
    pub fn join_thread_pool(&mut self, is_main: bool) {
        debug!(is_main, "thread joining the pool");
        let process = self.process.clone();
        process.pool().thread_joined();
        let enter = if is_main {
            Command::EnterLooper
        } else {
            Command::RegisterLooper
        };
        if let Err(err) = self.write_command(&enter) {
            error!("failed to queue looper registration: {err}");
        }
        self.is_looper = true;

        let result = loop {
            self.process_pending_derefs();
            let result = self.get_and_execute_command();
            match result {
                Ok(()) => {}
                Err(BinderError::TimedOut) if !is_main => break result,
                Err(BinderError::TimedOut) => {}
                Err(BinderError::DeadObject | BinderError::ConnectionRefused) => break result,
                Err(err) => fatal!("get_and_execute_command returned unexpected error {err}, aborting"),
            }
        };
        debug!(is_main, ?result, "thread leaving the pool");

        if let Err(err) = self.write_command(&Command::ExitLooper) {
            error!("failed to queue looper exit: {err}");
        }
        self.is_looper = false;
        if let Err(err) = self.talk_with_driver(false) {
            warn!("talk_with_driver in join_thread_pool returned error: {err}");
        }
        process.pool().thread_left();
    }

    /// Registers this thread as a looper driven by an external poll loop.
    pub fn setup_polling(&mut self) -> BinderResult<()> {
        if self.dead {
            return Err(BinderError::DeadObject);
        }
        self.write_command(&Command::EnterLooper)?;
        self.flush_commands();
        self.process.pool().thread_joined();
        Ok(())
    }

    /// Executes everything the peer has ready, for use after a poll wakeup.
    pub fn handle_polled_commands(&mut self) -> BinderResult<()> {
        let result = loop {
            let result = self.get_and_execute_command();
            if self.input.is_drained() {
                break result;
            }
        };
        self.process_pending_derefs();
        self.flush_commands();
        result
    }

    // ---- remote handle references ----

    pub fn inc_strong_handle(&mut self, handle: u32, proxy: &Pin) -> BinderResult<()> {
        self.write_command(&Command::Acquire(handle))?;
        if !self.flush_if_needed() {
            self.post_write.hold_strong(Arc::clone(proxy));
        }
        Ok(())
    }

    pub fn dec_strong_handle(&mut self, handle: u32) -> BinderResult<()> {
        self.write_command(&Command::Release(handle))?;
        self.flush_if_needed();
        Ok(())
    }

    pub fn inc_weak_handle(&mut self, handle: u32, proxy: &Pin) -> BinderResult<()> {
        self.write_command(&Command::IncRefs(handle))?;
        if !self.flush_if_needed() {
            self.post_write.hold_weak(Arc::downgrade(proxy));
        }
        Ok(())
    }

    pub fn dec_weak_handle(&mut self, handle: u32) -> BinderResult<()> {
        self.write_command(&Command::DecRefs(handle))?;
        self.flush_if_needed();
        Ok(())
    }

    /// Promoting a remote weak reference is not supported in this direction.
    pub fn attempt_inc_strong_handle(&mut self, handle: u32) -> BinderResult<()> {
        warn!(handle, "attempt_inc_strong_handle is not supported");
        Err(BinderError::InvalidOperation)
    }

    pub fn expunge_handle(&mut self, handle: u32) {
        trace!(handle, "expunge handle");
    }

    /// Returns a peer buffer.
    pub fn free_buffer(&mut self, buffer_id: u64) -> BinderResult<()> {
        self.write_command(&Command::FreeBuffer(buffer_id))?;
        self.flush_if_needed();
        Ok(())
    }

    /// Writes a local object into `parcel`, keeping it alive until the next write lands.
    pub fn write_local_object(
        &mut self,
        parcel: &mut Parcel,
        object: &Arc<dyn Binder>,
    ) -> BinderResult<PtrCookie> {
        let node = self.process.nodes().register(object);
        parcel.write_object(node.ptr)?;
        parcel.write_u64(node.cookie)?;
        let pin: Pin = Arc::new(Arc::clone(object));
        self.post_write.hold_strong(pin);
        Ok(node)
    }

    // ---- death and freeze notifications ----

    pub fn request_death_notification(
        &mut self,
        handle: u32,
        recipient: Arc<dyn DeathRecipient>,
    ) -> BinderResult<u64> {
        if self.dead {
            return Err(BinderError::DeadObject);
        }
        let process = self.process.clone();
        let notifications = process.notifications();
        let cookie = notifications.add_death(handle, recipient);
        if let Err(err) = self.write_command(&Command::RequestDeathNotification(HandleCookie {
            handle,
            cookie,
        })) {
            notifications.forget_death(cookie);
            return Err(err);
        }
        self.flush_commands();
        Ok(cookie)
    }

    pub fn clear_death_notification(&mut self, cookie: u64) -> BinderResult<()> {
        let Some(handle) = self.process.notifications().begin_clear_death(cookie) else {
            return Err(BinderError::BadValue);
        };
        self.write_command(&Command::ClearDeathNotification(HandleCookie { handle, cookie }))?;
        self.flush_commands();
        Ok(())
    }

    pub fn request_freeze_notification(
        &mut self,
        handle: u32,
        listener: Arc<dyn FrozenStateListener>,
    ) -> BinderResult<u64> {
        if self.dead {
            return Err(BinderError::DeadObject);
        }
        let process = self.process.clone();
        let notifications = process.notifications();
        let cookie = notifications.add_freeze(handle, listener);
        if let Err(err) = self.write_command(&Command::RequestFreezeNotification(HandleCookie {
            handle,
            cookie,
        })) {
            notifications.forget_freeze(cookie);
            return Err(err);
        }
        self.flush_commands();
        Ok(cookie)
    }

    pub fn clear_freeze_notification(&mut self, cookie: u64) -> BinderResult<()> {
        let Some(handle) = self.process.notifications().begin_clear_freeze(cookie) else {
            return Err(BinderError::BadValue);
        };
        self.write_command(&Command::ClearFreezeNotification(HandleCookie { handle, cookie }))?;
        self.flush_commands();
        Ok(())
    }

    // ---- calling identity ----

    pub fn calling_pid(&self) -> i32 {
        self.calling.pid
    }

    pub fn calling_uid(&self) -> u32 {
        self.calling.uid
    }

    pub fn calling_sid(&self) -> Option<u64> {
        self.calling.sid
    }

    pub fn has_explicit_identity(&self) -> bool {
        self.calling.has_explicit
    }

    /// Assumes this process's own identity, returning a token for the caller's.
    pub fn clear_calling_identity(&mut self) -> i64 {
        let token = self.calling.token();
        let own = self.process.identity();
        self.calling = CallingIdentity {
            pid: own.pid,
            uid: own.uid,
            sid: None,
            has_explicit: true,
        };
        token
    }

    pub fn restore_calling_identity(&mut self, token: i64) {
        self.calling = CallingIdentity::from_token(token);
    }

    // ---- work source ----

    pub fn calling_work_source_uid(&self) -> i32 {
        self.work_source.uid
    }

    pub fn should_propagate_work_source(&self) -> bool {
        self.work_source.propagate
    }

    pub fn set_calling_work_source_uid(&mut self, uid: i32) -> i64 {
        let token = self.set_calling_work_source_uid_without_propagation(uid);
        self.work_source.propagate = true;
        token
    }

    pub fn set_calling_work_source_uid_without_propagation(&mut self, uid: i32) -> i64 {
        let token = self.work_source.token();
        self.work_source.uid = uid;
        token
    }

    pub fn clear_calling_work_source(&mut self) -> i64 {
        self.set_calling_work_source_uid(UNSET_WORK_SOURCE)
    }

    pub fn clear_propagate_work_source(&mut self) {
        self.work_source.propagate = false;
    }

    pub fn restore_calling_work_source(&mut self, token: i64) {
        self.work_source = WorkSource::from_token(token);
    }

    // ---- misc state ----

    pub fn strict_mode_policy(&self) -> i32 {
        self.strict_mode_policy
    }

    pub fn set_strict_mode_policy(&mut self, policy: i32) {
        self.strict_mode_policy = policy;
    }

    pub fn last_transaction_binder_flags(&self) -> u32 {
        self.last_transaction_flags
    }

    pub fn set_last_transaction_binder_flags(&mut self, flags: u32) {
        self.last_transaction_flags = flags;
    }

    pub fn call_restriction(&self) -> CallRestriction {
        self.call_restriction
    }

    pub fn set_call_restriction(&mut self, restriction: CallRestriction) {
        self.call_restriction = restriction;
    }

    pub fn last_error(&self) -> Option<BinderError> {
        self.last_error
    }

    pub fn is_looper(&self) -> bool {
        self.is_looper
    }

    /// True while a local handler runs on this thread.
    pub fn is_serving(&self) -> bool {
        self.serving_depth > 0
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Bytes queued for the peer but not yet written.
    pub fn pending_out(&self) -> usize {
        self.out.len()
    }

    pub fn pending_derefs(&self) -> usize {
        self.derefs.len()
    }
}

impl Drop for IpcThread {
    fn drop(&mut self) {
        if self.process.is_shutdown() {
            return;
        }
        self.flush_commands();
        self.process.driver().thread_exit();
    }
}
