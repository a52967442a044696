use binder_wire::Parcel;

use crate::engine::IpcThread;
use crate::error::BinderResult;

/// A local object that serves incoming transactions.
///
/// Handlers run on the thread that received the transaction and get that
/// thread's engine, so they may issue nested calls through it.
pub trait Binder: Send + Sync {
    fn on_transact(
        &self,
        engine: &mut IpcThread,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        flags: u32,
    ) -> BinderResult<()>;

    /// The peer dropped its last strong reference.
    fn on_last_strong_ref(&self, _engine: &mut IpcThread) {}
}

/// Told when the process behind a remote handle dies.
pub trait DeathRecipient: Send + Sync {
    fn binder_died(&self, handle: u32);
}

/// Told when the process behind a remote handle is frozen or thawed.
pub trait FrozenStateListener: Send + Sync {
    fn on_state_changed(&self, handle: u32, is_frozen: bool);
}
