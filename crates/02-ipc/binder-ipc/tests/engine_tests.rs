//! Engine scenarios against the scripted peer.
//! Each test builds its own context so thread-local engines never overlap.

use std::process::{self, Stdio};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use binder_ipc::{
    Binder, BinderError, BinderResult, CallRestriction, DeathRecipient, FrozenStateListener,
    IpcConfig, IpcThread, ProcessContext, ProcessIdentity, ScriptedDriver, ThreadPool,
    TransactStatus,
};
use binder_wire::protocol::{TF_ACCEPT_FDS, TF_ONE_WAY, TF_STATUS_CODE};
use binder_wire::{Command, FrozenStateInfo, HandleCookie, Parcel, Return, TransactionData};

const OWN_PID: i32 = 4242;
const OWN_UID: u32 = 10_001;

fn scripted() -> ScriptedDriver {
    ScriptedDriver::new().with_identity(ProcessIdentity {
        pid: OWN_PID,
        uid: OWN_UID,
    })
}

fn context(driver: &Arc<ScriptedDriver>) -> ProcessContext {
    let driver: Arc<dyn binder_ipc::Driver> = driver.clone();
    ProcessContext::init(driver, IpcConfig::default()).expect("init")
}

fn inbound(data: Vec<u8>, buffer_id: u64) -> TransactionData {
    TransactionData {
        data,
        buffer_id,
        ..TransactionData::default()
    }
}

fn position(written: &[Command], pred: impl Fn(&Command) -> bool) -> usize {
    written
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("command missing from {written:?}"))
}

/// Doubles an i32 and records who called it.
#[derive(Default)]
struct Doubler {
    caller_pid: AtomicI32,
    caller_uid: AtomicU32,
    last_refs: AtomicUsize,
}

impl Binder for Doubler {
    fn on_transact(
        &self,
        engine: &mut IpcThread,
        _code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        _flags: u32,
    ) -> BinderResult<()> {
        self.caller_pid.store(engine.calling_pid(), Ordering::SeqCst);
        self.caller_uid.store(engine.calling_uid(), Ordering::SeqCst);
        let value = data.read_i32()?;
        reply.write_i32(value * 2)?;
        Ok(())
    }

    fn on_last_strong_ref(&self, _engine: &mut IpcThread) {
        self.last_refs.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn sync_call_adopts_reply_and_frees_it_on_drop() {
    let driver = Arc::new(scripted());
    driver.set_responder(|cmd| match cmd {
        Command::Transaction(tr) if tr.code == 1 => vec![
            Return::TransactionComplete,
            Return::Reply(inbound(7i32.to_le_bytes().to_vec(), 0x99)),
        ],
        _ => Vec::new(),
    });
    let ctx = context(&driver);

    let mut data = Parcel::new();
    data.write_i32(3).unwrap();
    let mut reply = Parcel::new();
    let status = ctx.transact(5, 1, &data, Some(&mut reply), 0).unwrap();
    assert_eq!(status, TransactStatus::Completed);
    assert_eq!(reply.read_i32().unwrap(), 7);
    assert_eq!(reply.buffer_id(), Some(0x99));

    drop(reply);
    ctx.flush_commands().unwrap();

    let written = driver.written();
    let Command::Transaction(sent) = &written[0] else {
        panic!("expected transaction first, got {written:?}");
    };
    assert_eq!(sent.handle(), 5);
    assert_ne!(sent.flags & TF_ACCEPT_FDS, 0);
    assert_eq!(sent.data, 3i32.to_le_bytes());
    assert!(written.contains(&Command::FreeBuffer(0x99)));
}

#[test]
fn one_way_call_returns_on_completion() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    let status = ctx.transact(2, 9, &Parcel::new(), None, TF_ONE_WAY).unwrap();
    assert_eq!(status, TransactStatus::Completed);
    assert_eq!(driver.round_trips(), 1);
}

#[test]
fn one_way_call_to_frozen_peer_reports_pending() {
    let driver = Arc::new(scripted());
    driver.set_responder(|cmd| match cmd {
        Command::Transaction(_) => vec![Return::TransactionPendingFrozen],
        _ => Vec::new(),
    });
    let ctx = context(&driver);
    let status = ctx.transact(2, 9, &Parcel::new(), None, TF_ONE_WAY).unwrap();
    assert_eq!(status, TransactStatus::PendingFrozen);
}

#[test]
fn sync_call_to_frozen_peer_fails() {
    let driver = Arc::new(scripted());
    driver.set_responder(|cmd| match cmd {
        Command::Transaction(_) => vec![Return::FrozenReply],
        _ => Vec::new(),
    });
    let ctx = context(&driver);
    let err = ctx.transact(2, 9, &Parcel::new(), None, 0).unwrap_err();
    assert_eq!(err, BinderError::FailedTransaction);
}

#[test]
fn status_reply_surfaces_as_error_and_frees_buffer() {
    let driver = Arc::new(scripted());
    driver.set_responder(|cmd| match cmd {
        Command::Transaction(_) => {
            let mut status = inbound((-22i32).to_le_bytes().to_vec(), 0x31);
            status.flags = TF_STATUS_CODE;
            vec![Return::TransactionComplete, Return::Reply(status)]
        }
        _ => Vec::new(),
    });
    let ctx = context(&driver);
    let mut reply = Parcel::new();
    let err = ctx.transact(1, 1, &Parcel::new(), Some(&mut reply), 0).unwrap_err();
    assert_eq!(err, BinderError::BadValue);
    assert!(driver.written().contains(&Command::FreeBuffer(0x31)));
    let last = ctx.with_thread(|engine| engine.last_error()).unwrap();
    assert_eq!(last, Some(BinderError::BadValue));
}

#[test]
fn errored_parcel_is_not_sent() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    let mut data = Parcel::new();
    data.set_error(BinderError::NoMemory.code());
    let err = ctx.transact(1, 1, &data, None, 0).unwrap_err();
    assert_eq!(err, BinderError::NoMemory);
    assert_eq!(driver.round_trips(), 0);
}

#[test]
fn closed_peer_latches_dead() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    driver.close();
    let err = ctx.transact(1, 1, &Parcel::new(), None, TF_ONE_WAY).unwrap_err();
    assert_eq!(err, BinderError::DeadObject);
    assert!(ctx.with_thread(|engine| engine.is_dead()).unwrap());

    let again = ctx.transact(1, 1, &Parcel::new(), None, TF_ONE_WAY).unwrap_err();
    assert_eq!(again, BinderError::DeadObject);
    assert_eq!(driver.round_trips(), 0);
}

#[test]
fn interrupted_exchange_is_retried() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    driver.interrupt_next(2);
    let status = ctx.transact(1, 1, &Parcel::new(), None, TF_ONE_WAY).unwrap();
    assert_eq!(status, TransactStatus::Completed);
    assert_eq!(driver.round_trips(), 1);
}

#[test]
fn nested_inbound_call_is_served_while_waiting() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    let doubler = Arc::new(Doubler::default());
    let object: Arc<dyn Binder> = doubler.clone();
    let node = ctx.register_local_object(&object);

    driver.set_responder(move |cmd| match cmd {
        Command::Transaction(tr) if tr.handle() == 9 => {
            let nested = TransactionData {
                target: node.ptr,
                cookie: node.cookie,
                code: 2,
                sender_pid: 77,
                sender_euid: 1000,
                buffer_id: 0x50,
                data: 5i32.to_le_bytes().to_vec(),
                ..TransactionData::default()
            };
            vec![Return::TransactionComplete, Return::Transaction(nested)]
        }
        Command::Reply(_) => vec![
            Return::TransactionComplete,
            Return::Reply(inbound(1i32.to_le_bytes().to_vec(), 0x51)),
        ],
        _ => Vec::new(),
    });

    let mut reply = Parcel::new();
    ctx.transact(9, 1, &Parcel::new(), Some(&mut reply), 0).unwrap();
    assert_eq!(reply.read_i32().unwrap(), 1);
    assert_eq!(doubler.caller_pid.load(Ordering::SeqCst), 77);
    assert_eq!(doubler.caller_uid.load(Ordering::SeqCst), 1000);

    let (pid, uid) = ctx
        .with_thread(|engine| (engine.calling_pid(), engine.calling_uid()))
        .unwrap();
    assert_eq!((pid, uid), (OWN_PID, OWN_UID));

    let written = driver.written();
    let freed = position(&written, |c| *c == Command::FreeBuffer(0x50));
    let replied = position(&written, |c| matches!(c, Command::Reply(_)));
    assert!(freed < replied, "inbound buffer must be freed before replying");
    let Command::Reply(sent) = &written[replied] else {
        unreachable!()
    };
    assert_eq!(sent.handle(), u32::MAX);
    assert_eq!(sent.data, 10i32.to_le_bytes());
}

#[test]
fn pool_thread_replies_with_status_for_missing_target_and_leaves_when_idle() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    driver.push_return(Return::Transaction(inbound(Vec::new(), 0x60)));

    ctx.join_thread_pool(false).unwrap();

    let written = driver.written();
    assert_eq!(written.first(), Some(&Command::RegisterLooper));
    assert_eq!(written.last(), Some(&Command::ExitLooper));
    let replied = position(&written, |c| matches!(c, Command::Reply(_)));
    let Command::Reply(sent) = &written[replied] else {
        unreachable!()
    };
    assert_ne!(sent.flags & TF_STATUS_CODE, 0);
    assert_eq!(sent.data, BinderError::UnknownTransaction.code().to_le_bytes());
    assert!(position(&written, |c| *c == Command::FreeBuffer(0x60)) < replied);
    assert_eq!(ctx.pool().current_threads(), 0);
}

#[test]
fn peer_reference_counts_drive_the_node_lifecycle() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    let doubler = Arc::new(Doubler::default());
    let object: Arc<dyn Binder> = doubler.clone();
    let node = ctx.register_local_object(&object);
    drop(object);

    driver.push_return(Return::IncRefs(node));
    driver.push_return(Return::Acquire(node));
    driver.push_return(Return::Release(node));
    driver.push_return(Return::DecRefs(node));

    ctx.join_thread_pool(false).unwrap();

    let written = driver.written();
    assert!(written.contains(&Command::IncRefsDone(node)));
    assert!(written.contains(&Command::AcquireDone(node)));
    assert_eq!(doubler.last_refs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.nodes().counts(node.ptr), None);
    assert_eq!(Arc::strong_count(&doubler), 1);
}

#[derive(Default)]
struct Obituaries {
    handles: parking_lot::Mutex<Vec<u32>>,
}

impl DeathRecipient for Obituaries {
    fn binder_died(&self, handle: u32) {
        self.handles.lock().push(handle);
    }
}

#[test]
fn death_notification_is_delivered_and_cleared() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    let recipient = Arc::new(Obituaries::default());

    let cookie = ctx
        .with_thread(|engine| engine.request_death_notification(3, recipient.clone()))
        .unwrap()
        .unwrap();
    assert!(driver
        .written()
        .contains(&Command::RequestDeathNotification(HandleCookie { handle: 3, cookie })));

    driver.push_return(Return::DeadBinder(cookie));
    ctx.join_thread_pool(false).unwrap();
    assert_eq!(*recipient.handles.lock(), vec![3]);
    assert!(driver.written().contains(&Command::DeadBinderDone(cookie)));

    ctx.with_thread(|engine| engine.clear_death_notification(cookie))
        .unwrap()
        .unwrap();
    assert!(driver
        .written()
        .contains(&Command::ClearDeathNotification(HandleCookie { handle: 3, cookie })));
    driver.push_return(Return::ClearDeathNotificationDone(cookie));
    ctx.join_thread_pool(false).unwrap();
    assert_eq!(ctx.notifications().death_count(), 0);
}

#[derive(Default)]
struct FreezeLog {
    changes: parking_lot::Mutex<Vec<(u32, bool)>>,
}

impl FrozenStateListener for FreezeLog {
    fn on_state_changed(&self, handle: u32, is_frozen: bool) {
        self.changes.lock().push((handle, is_frozen));
    }
}

#[test]
fn freeze_notification_reports_state_and_clears() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    let listener = Arc::new(FreezeLog::default());

    let cookie = ctx
        .with_thread(|engine| engine.request_freeze_notification(6, listener.clone()))
        .unwrap()
        .unwrap();
    assert!(driver
        .written()
        .contains(&Command::RequestFreezeNotification(HandleCookie { handle: 6, cookie })));
    assert_eq!(ctx.notifications().freeze_count(), 1);

    driver.push_return(Return::FrozenBinder(FrozenStateInfo {
        cookie,
        is_frozen: true,
    }));
    ctx.join_thread_pool(false).unwrap();
    assert_eq!(*listener.changes.lock(), vec![(6, true)]);
    assert!(driver.written().contains(&Command::FreezeNotificationDone(cookie)));

    ctx.with_thread(|engine| engine.clear_freeze_notification(cookie))
        .unwrap()
        .unwrap();
    driver.push_return(Return::ClearFreezeNotificationDone(cookie));
    ctx.join_thread_pool(false).unwrap();
    assert_eq!(ctx.notifications().freeze_count(), 0);
}

#[test]
fn shut_down_context_refuses_engines() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    ctx.flush_commands().unwrap();
    ctx.shutdown();
    let err = ctx.transact(1, 1, &Parcel::new(), None, TF_ONE_WAY).unwrap_err();
    assert_eq!(err, BinderError::Unavailable);
}

#[test]
fn engine_cannot_be_borrowed_twice_on_one_thread() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    let nested = ctx.with_thread(|_| ctx.with_thread(|_| ())).unwrap();
    assert_eq!(nested, Err(BinderError::Unavailable));
}

const ABORT_CHILD: &str = "BINDER_IPC_ABORT_CHILD";

/// Reruns the test `name` in a child process that takes the fatal branch.
///
/// A failed assertion or a panic exits with 101; only an abort kills the
/// child without an exit status of that kind.
fn child_aborts(name: &str) -> bool {
    let status = process::Command::new(std::env::current_exe().expect("test binary"))
        .args(["--exact", name, "--test-threads=1", "--nocapture"])
        .env(ABORT_CHILD, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("spawn child test");
    !status.success() && status.code() != Some(101)
}

fn in_abort_child() -> bool {
    std::env::var_os(ABORT_CHILD).is_some()
}

#[test]
fn fatal_restriction_aborts_sync_calls() {
    if in_abort_child() {
        let driver = Arc::new(scripted());
        let ctx = ProcessContext::init(
            driver.clone(),
            IpcConfig {
                call_restriction: CallRestriction::FatalIfNotOneway,
                ..IpcConfig::default()
            },
        )
        .unwrap();
        let _ = ctx.transact(1, 1, &Parcel::new(), None, 0);
        return;
    }
    assert!(child_aborts("fatal_restriction_aborts_sync_calls"));
}

#[test]
fn pool_underflow_on_a_worker_takes_the_process_down() {
    if in_abort_child() {
        let pool = Arc::new(ThreadPool::new(&IpcConfig::default()));
        let worker = Arc::clone(&pool);
        let _ = std::thread::spawn(move || worker.release_slot()).join();
        // Only reachable if the worker's failure stayed on that thread.
        pool.acquire_slot();
        return;
    }
    assert!(child_aborts("pool_underflow_on_a_worker_takes_the_process_down"));
}

#[test]
fn identity_and_work_source_tokens_restore_state() {
    let driver = Arc::new(scripted());
    let ctx = context(&driver);
    ctx.with_thread(|engine| {
        let token = engine.clear_calling_identity();
        assert!(engine.has_explicit_identity());
        assert_eq!(engine.calling_pid(), OWN_PID);
        engine.restore_calling_identity(token);
        assert!(!engine.has_explicit_identity());

        let ws = engine.set_calling_work_source_uid(1234);
        assert_eq!(engine.calling_work_source_uid(), 1234);
        assert!(engine.should_propagate_work_source());
        engine.restore_calling_work_source(ws);
        assert_eq!(engine.calling_work_source_uid(), -1);
        assert!(!engine.should_propagate_work_source());
    })
    .unwrap();
}

#[test]
fn started_pool_runs_a_main_thread_until_the_peer_goes_away() {
    let driver = Arc::new(scripted().with_idle_timeout(Duration::from_millis(5)));
    let ctx = context(&driver);
    ctx.start_thread_pool();
    assert!(ctx.is_thread_pool_started());
    assert_eq!(ctx.pool().kernel_started_threads(), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.pool().current_threads() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(ctx.pool().current_threads(), 1);

    driver.close();
    while ctx.pool().current_threads() != 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(ctx.pool().current_threads(), 0);
    assert!(driver.written().contains(&Command::EnterLooper));
}

#[test]
fn pool_cannot_shrink_after_start_but_can_grow() {
    let driver = Arc::new(scripted().with_idle_timeout(Duration::from_millis(5)));
    let ctx = context(&driver);
    ctx.set_thread_pool_max_thread_count(4).unwrap();
    assert_eq!(driver.max_threads(), Some(4));
    ctx.start_thread_pool();
    ctx.set_thread_pool_max_thread_count(6).unwrap();
    assert_eq!(ctx.pool().max_threads(), 6);
    driver.close();
}
