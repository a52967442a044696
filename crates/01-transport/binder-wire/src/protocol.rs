//! Driver protocol numbers.
//!
//! Command tags use the kernel's ioctl encoding, which stores the size of the
//! fixed payload next to the command number. The reader relies on that to step
//! over tags it does not recognise.

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_TYPESHIFT: u32 = IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT) | ((size as u32) << IOC_SIZESHIFT) | ((ty as u32) << IOC_TYPESHIFT) | nr
}

const fn io(ty: u8, nr: u32) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

const fn iow(ty: u8, nr: u32, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

const fn ior(ty: u8, nr: u32, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

/// Size in bytes of the fixed payload that follows `tag`.
#[inline]
pub const fn payload_size(tag: u32) -> usize {
    ((tag >> IOC_SIZESHIFT) & ((1 << IOC_SIZEBITS) - 1)) as usize
}

/// Fixed header of a transaction record.
pub const TRANSACTION_DATA_SIZE: usize = 64;
/// Transaction header followed by a security-context pointer.
pub const TRANSACTION_DATA_SECCTX_SIZE: usize = TRANSACTION_DATA_SIZE + 8;
/// Transaction header followed by the scatter-gather buffer size.
pub const TRANSACTION_DATA_SG_SIZE: usize = TRANSACTION_DATA_SIZE + 8;
/// `{ptr, cookie}` pair.
pub const PTR_COOKIE_SIZE: usize = 16;
/// `{priority, ptr, cookie}` triple, priority padded to eight bytes.
pub const PRI_PTR_COOKIE_SIZE: usize = 24;
/// `{priority, handle}` pair.
pub const PRI_DESC_SIZE: usize = 8;
/// Packed `{handle, cookie}` pair.
pub const HANDLE_COOKIE_SIZE: usize = 12;
/// `{cookie, is_frozen, reserved}` record.
pub const FROZEN_STATE_INFO_SIZE: usize = 16;

const I32: usize = 4;
const PTR: usize = 8;

pub const BC_TRANSACTION: u32 = iow(b'c', 0, TRANSACTION_DATA_SIZE);
pub const BC_REPLY: u32 = iow(b'c', 1, TRANSACTION_DATA_SIZE);
pub const BC_ACQUIRE_RESULT: u32 = iow(b'c', 2, I32);
pub const BC_FREE_BUFFER: u32 = iow(b'c', 3, PTR);
pub const BC_INCREFS: u32 = iow(b'c', 4, I32);
pub const BC_ACQUIRE: u32 = iow(b'c', 5, I32);
pub const BC_RELEASE: u32 = iow(b'c', 6, I32);
pub const BC_DECREFS: u32 = iow(b'c', 7, I32);
pub const BC_INCREFS_DONE: u32 = iow(b'c', 8, PTR_COOKIE_SIZE);
pub const BC_ACQUIRE_DONE: u32 = iow(b'c', 9, PTR_COOKIE_SIZE);
pub const BC_ATTEMPT_ACQUIRE: u32 = iow(b'c', 10, PRI_DESC_SIZE);
pub const BC_REGISTER_LOOPER: u32 = io(b'c', 11);
pub const BC_ENTER_LOOPER: u32 = io(b'c', 12);
pub const BC_EXIT_LOOPER: u32 = io(b'c', 13);
pub const BC_REQUEST_DEATH_NOTIFICATION: u32 = iow(b'c', 14, HANDLE_COOKIE_SIZE);
pub const BC_CLEAR_DEATH_NOTIFICATION: u32 = iow(b'c', 15, HANDLE_COOKIE_SIZE);
pub const BC_DEAD_BINDER_DONE: u32 = iow(b'c', 16, PTR);
pub const BC_TRANSACTION_SG: u32 = iow(b'c', 17, TRANSACTION_DATA_SG_SIZE);
pub const BC_REPLY_SG: u32 = iow(b'c', 18, TRANSACTION_DATA_SG_SIZE);
pub const BC_REQUEST_FREEZE_NOTIFICATION: u32 = iow(b'c', 19, HANDLE_COOKIE_SIZE);
pub const BC_CLEAR_FREEZE_NOTIFICATION: u32 = iow(b'c', 20, HANDLE_COOKIE_SIZE);
pub const BC_FREEZE_NOTIFICATION_DONE: u32 = iow(b'c', 21, PTR);

pub const BR_ERROR: u32 = ior(b'r', 0, I32);
pub const BR_OK: u32 = io(b'r', 1);
pub const BR_TRANSACTION_SEC_CTX: u32 = ior(b'r', 2, TRANSACTION_DATA_SECCTX_SIZE);
pub const BR_TRANSACTION: u32 = ior(b'r', 2, TRANSACTION_DATA_SIZE);
pub const BR_REPLY: u32 = ior(b'r', 3, TRANSACTION_DATA_SIZE);
pub const BR_ACQUIRE_RESULT: u32 = ior(b'r', 4, I32);
pub const BR_DEAD_REPLY: u32 = io(b'r', 5);
pub const BR_TRANSACTION_COMPLETE: u32 = io(b'r', 6);
pub const BR_INCREFS: u32 = ior(b'r', 7, PTR_COOKIE_SIZE);
pub const BR_ACQUIRE: u32 = ior(b'r', 8, PTR_COOKIE_SIZE);
pub const BR_RELEASE: u32 = ior(b'r', 9, PTR_COOKIE_SIZE);
pub const BR_DECREFS: u32 = ior(b'r', 10, PTR_COOKIE_SIZE);
pub const BR_ATTEMPT_ACQUIRE: u32 = ior(b'r', 11, PRI_PTR_COOKIE_SIZE);
pub const BR_NOOP: u32 = io(b'r', 12);
pub const BR_SPAWN_LOOPER: u32 = io(b'r', 13);
pub const BR_FINISHED: u32 = io(b'r', 14);
pub const BR_DEAD_BINDER: u32 = ior(b'r', 15, PTR);
pub const BR_CLEAR_DEATH_NOTIFICATION_DONE: u32 = ior(b'r', 16, PTR);
pub const BR_FAILED_REPLY: u32 = io(b'r', 17);
pub const BR_FROZEN_REPLY: u32 = io(b'r', 18);
pub const BR_ONEWAY_SPAM_SUSPECT: u32 = io(b'r', 19);
pub const BR_TRANSACTION_PENDING_FROZEN: u32 = io(b'r', 20);
pub const BR_FROZEN_BINDER: u32 = ior(b'r', 21, FROZEN_STATE_INFO_SIZE);
pub const BR_CLEAR_FREEZE_NOTIFICATION_DONE: u32 = ior(b'r', 22, PTR);

/// The call does not wait for a reply.
pub const TF_ONE_WAY: u32 = 0x01;
/// Contents are the component's root object.
pub const TF_ROOT_OBJECT: u32 = 0x04;
/// Contents are a 32-bit status code.
pub const TF_STATUS_CODE: u32 = 0x08;
/// The receiver accepts file descriptors.
pub const TF_ACCEPT_FDS: u32 = 0x10;
/// The peer scrubs the transaction buffer once it is freed.
pub const TF_CLEAR_BUF: u32 = 0x20;
