//! Process-wide state shared by every engine: the peer handle, the thread
//! pool, local nodes, notification subscriptions and the context object.
//!
//! Each OS thread gets its own [`IpcThread`] per context, created lazily on
//! first use and torn down when the thread exits or the context shuts down.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use binder_wire::{Parcel, PtrCookie};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::binder::Binder;
use crate::config::IpcConfig;
use crate::driver::{Driver, FrozenInfo, ProcessIdentity};
use crate::engine::IpcThread;
use crate::error::{fatal, BinderError, BinderResult, TransactStatus};
use crate::nodes::NodeTable;
use crate::notify::NotificationRegistry;
use crate::pool::ThreadPool;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

enum EngineSlot {
    Idle(Box<IpcThread>),
    /// The engine is lent out to a caller further up this thread's stack.
    Busy,
}

thread_local! {
    static ENGINES: RefCell<HashMap<u64, EngineSlot>> = RefCell::new(HashMap::new());
}

struct ProcessShared {
    id: u64,
    driver: Arc<dyn Driver>,
    config: IpcConfig,
    identity: ProcessIdentity,
    pool: ThreadPool,
    nodes: NodeTable,
    notifications: NotificationRegistry,
    context_object: Mutex<Option<Arc<dyn Binder>>>,
    background_scheduling_disabled: AtomicBool,
    shutdown: AtomicBool,
}

/// Handle to the process-wide engine state. Cloning is cheap.
#[derive(Clone)]
pub struct ProcessContext {
    shared: Arc<ProcessShared>,
}

impl ProcessContext {
    /// Configures the peer and builds the shared state.
    pub fn init(driver: Arc<dyn Driver>, config: IpcConfig) -> BinderResult<Self> {
        if let Err(err) = driver.set_max_threads(config.max_threads) {
            error!("binder ioctl to set max threads failed: {err}");
            return Err(err.into());
        }
        if let Err(err) = driver.enable_oneway_spam_detection(config.oneway_spam_detection) {
            warn!("failed to set oneway spam detection: {err}");
        }
        let identity = driver.identity();
        debug!(pid = identity.pid, uid = identity.uid, max_threads = config.max_threads, "process context ready");
        Ok(Self {
            shared: Arc::new(ProcessShared {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                pool: ThreadPool::new(&config),
                driver,
                config,
                identity,
                nodes: NodeTable::default(),
                notifications: NotificationRegistry::default(),
                context_object: Mutex::new(None),
                background_scheduling_disabled: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.shared.driver)
    }

    pub fn config(&self) -> &IpcConfig {
        &self.shared.config
    }

    pub fn identity(&self) -> ProcessIdentity {
        self.shared.identity
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.shared.pool
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.shared.nodes
    }

    pub fn notifications(&self) -> &NotificationRegistry {
        &self.shared.notifications
    }

    /// Runs `f` with the calling thread's engine for this context.
    ///
    /// Fails with [`BinderError::Unavailable`] after shutdown, or when the
    /// engine is already lent out further up the stack; handlers should use
    /// the engine they are given instead.
    pub fn with_thread<R>(&self, f: impl FnOnce(&mut IpcThread) -> R) -> BinderResult<R> {
        if self.is_shutdown() {
            return Err(BinderError::Unavailable);
        }
        let id = self.shared.id;
        let mut engine = ENGINES
            .try_with(|engines| match engines.borrow_mut().insert(id, EngineSlot::Busy) {
                Some(EngineSlot::Idle(engine)) => Ok(engine),
                Some(EngineSlot::Busy) => Err(BinderError::Unavailable),
                None => Ok(Box::new(IpcThread::new(self.clone()))),
            })
            .map_err(|_| BinderError::Unavailable)??;

        let result = f(&mut engine);

        let shut_down = self.is_shutdown();
        let returned = ENGINES.try_with(move |engines| {
            let mut engines = engines.borrow_mut();
            if shut_down {
                engines.remove(&id);
                None
            } else {
                engines.insert(id, EngineSlot::Idle(engine))
            }
        });
        if returned.is_err() {
            warn!("thread engine returned after thread-local teardown");
        }
        Ok(result)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stops handing out engines and drops the calling thread's one.
    ///
    /// Engines dropped after this point skip their final flush.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let id = self.shared.id;
        let removed = ENGINES
            .try_with(|engines| engines.borrow_mut().remove(&id))
            .ok()
            .flatten();
        drop(removed);
        debug!("process context shut down");
    }

    /// Sends a transaction from the calling thread.
    pub fn transact(
        &self,
        handle: u32,
        code: u32,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: u32,
    ) -> BinderResult<TransactStatus> {
        self.with_thread(|engine| engine.transact(handle, code, data, reply, flags))?
    }

    pub fn flush_commands(&self) -> BinderResult<()> {
        self.with_thread(|engine| engine.flush_commands())
    }

    /// Turns the calling thread into a pool thread until it is told to leave.
    pub fn join_thread_pool(&self, is_main: bool) -> BinderResult<()> {
        self.with_thread(|engine| engine.join_thread_pool(is_main))
    }

    // ---- thread pool ----

    /// Marks the pool started and spawns its main thread. Later calls are no-ops.
    pub fn start_thread_pool(&self) {
        if self.pool().max_threads() == 0 {
            warn!(
                "extra binder threads were disabled; only threads that join the pool \
                 themselves will serve incoming calls"
            );
        }
        if self.pool().mark_started() {
            self.spawn_pooled_thread(true);
        }
    }

    pub fn is_thread_pool_started(&self) -> bool {
        self.pool().is_started()
    }

    pub fn make_thread_name(&self) -> String {
        format!("binder:{}_{:X}", self.identity().pid, self.pool().next_seq())
    }

    /// Starts a thread that joins the pool. Ignored until the pool is started.
    pub fn spawn_pooled_thread(&self, is_main: bool) {
        if !self.pool().is_started() {
            return;
        }
        let name = self.make_thread_name();
        debug!(%name, is_main, "spawning pooled thread");
        let ctx = self.clone();
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(err) = ctx.join_thread_pool(is_main) {
                warn!("pooled thread could not join: {err}");
            }
        });
        match spawned {
            Ok(_) => self.pool().kernel_thread_spawned(),
            Err(err) => error!(%name, "failed to spawn pooled thread: {err}"),
        }
    }

    /// Changes how many threads the peer may ask for. The pool cannot shrink once started.
    pub fn set_thread_pool_max_thread_count(&self, max_threads: usize) -> BinderResult<()> {
        let current = self.pool().max_threads();
        if self.pool().is_started() && max_threads < current {
            fatal!("cannot shrink binder thread pool from {current} to {max_threads} after starting");
        }
        if let Err(err) = self.shared.driver.set_max_threads(max_threads) {
            error!("binder ioctl to set max threads failed: {err}");
            return Err(err.into());
        }
        self.pool().set_max_threads(max_threads);
        Ok(())
    }

    pub fn thread_pool_max_total_thread_count(&self) -> usize {
        self.pool().max_total_thread_count()
    }

    pub fn block_until_thread_available(&self) {
        self.pool().block_until_thread_available();
    }

    pub fn disable_background_scheduling(&self, disable: bool) {
        self.shared
            .background_scheduling_disabled
            .store(disable, Ordering::Release);
    }

    pub fn is_background_scheduling_disabled(&self) -> bool {
        self.shared.background_scheduling_disabled.load(Ordering::Acquire)
    }

    // ---- freezing ----

    pub fn freeze(&self, pid: i32, enable: bool, timeout_ms: u32) -> BinderResult<()> {
        self.shared
            .driver
            .freeze(pid, enable, timeout_ms)
            .map_err(BinderError::from)
    }

    pub fn frozen_info(&self, pid: i32) -> BinderResult<FrozenInfo> {
        self.shared.driver.frozen_info(pid).map_err(BinderError::from)
    }

    // ---- local objects ----

    /// Installs the object that serves transactions sent to handle 0.
    pub fn set_context_object(&self, object: Arc<dyn Binder>) {
        *self.shared.context_object.lock() = Some(object);
    }

    pub fn context_object(&self) -> Option<Arc<dyn Binder>> {
        self.shared.context_object.lock().clone()
    }

    pub fn register_local_object(&self, object: &Arc<dyn Binder>) -> PtrCookie {
        self.nodes().register(object)
    }
}
