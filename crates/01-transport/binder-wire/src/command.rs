//! Closed command sets for both directions of the driver exchange.
//!
//! `Command` is what a process writes (`BC_*`), `Return` is what the driver
//! hands back (`BR_*`). Both directions implement [`WireRecord`] so an
//! in-process peer can decode what the engine wrote and encode its answers.

use crate::buffer::{CommandReader, CommandWriter};
use crate::error::{WireError, WireResult};
use crate::protocol::*;

/// Encodes into and decodes from the flat driver byte stream.
pub trait WireRecord: Sized {
    fn encode(&self, out: &mut CommandWriter) -> WireResult<()>;
    fn decode(input: &mut CommandReader) -> WireResult<Self>;
}

/// Transaction header plus its inline payload.
///
/// `target` is a handle on outbound records and a node pointer on inbound
/// ones. `buffer_id` names the peer-owned buffer that carried the payload and
/// has to be handed back with `BC_FREE_BUFFER`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionData {
    pub target: u64,
    pub cookie: u64,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: i32,
    pub sender_euid: u32,
    pub buffer_id: u64,
    pub offsets_id: u64,
    pub data: Vec<u8>,
    pub offsets: Vec<u64>,
}

impl TransactionData {
    /// Outbound record addressed to a remote handle.
    pub fn to_handle(handle: u32, code: u32, flags: u32, data: Vec<u8>, offsets: Vec<u64>) -> Self {
        Self {
            target: handle as u64,
            code,
            flags,
            data,
            offsets,
            ..Self::default()
        }
    }

    #[inline]
    pub fn handle(&self) -> u32 {
        self.target as u32
    }

    #[inline]
    pub fn is_one_way(&self) -> bool {
        self.flags & TF_ONE_WAY != 0
    }

    fn encode_header(&self, out: &mut CommandWriter) -> WireResult<()> {
        out.put_u64(self.target)?;
        out.put_u64(self.cookie)?;
        out.put_u32(self.code)?;
        out.put_u32(self.flags)?;
        out.put_i32(self.sender_pid)?;
        out.put_u32(self.sender_euid)?;
        out.put_u64(self.data.len() as u64)?;
        out.put_u64((self.offsets.len() * 8) as u64)?;
        out.put_u64(self.buffer_id)?;
        out.put_u64(self.offsets_id)
    }

    fn encode_body(&self, out: &mut CommandWriter) -> WireResult<()> {
        out.put_bytes(&self.data)?;
        for offset in &self.offsets {
            out.put_u64(*offset)?;
        }
        Ok(())
    }

    /// Reads the fixed header, leaving the payload sizes for [`Self::decode_body`].
    fn decode_header(input: &mut CommandReader) -> WireResult<(Self, usize, usize)> {
        let needed = TRANSACTION_DATA_SIZE;
        if input.remaining() < needed {
            return Err(WireError::Truncated {
                needed,
                available: input.remaining(),
            });
        }
        let mut tr = TransactionData {
            target: input.get_u64()?,
            cookie: input.get_u64()?,
            code: input.get_u32()?,
            flags: input.get_u32()?,
            sender_pid: input.get_i32()?,
            sender_euid: input.get_u32()?,
            ..Self::default()
        };
        let data_size = input.get_u64()? as usize;
        let offsets_size = input.get_u64()? as usize;
        tr.buffer_id = input.get_u64()?;
        tr.offsets_id = input.get_u64()?;
        if offsets_size % 8 != 0 {
            return Err(WireError::Malformed("offsets size is not a multiple of 8"));
        }
        let needed = data_size.saturating_add(offsets_size);
        if needed > input.remaining() {
            return Err(WireError::Truncated {
                needed,
                available: input.remaining(),
            });
        }
        Ok((tr, data_size, offsets_size))
    }

    fn decode_body(
        mut self,
        input: &mut CommandReader,
        data_size: usize,
        offsets_size: usize,
    ) -> WireResult<Self> {
        self.data = input.take_bytes(data_size)?.to_vec();
        self.offsets = (0..offsets_size / 8)
            .map(|_| input.get_u64())
            .collect::<WireResult<_>>()?;
        Ok(self)
    }

    fn encode_full(&self, out: &mut CommandWriter) -> WireResult<()> {
        self.encode_header(out)?;
        self.encode_body(out)
    }

    fn decode_full(input: &mut CommandReader) -> WireResult<Self> {
        let (tr, data_size, offsets_size) = Self::decode_header(input)?;
        tr.decode_body(input, data_size, offsets_size)
    }
}

/// Node reference pair: weak-reference block and owning object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PtrCookie {
    pub ptr: u64,
    pub cookie: u64,
}

impl PtrCookie {
    fn encode(&self, out: &mut CommandWriter) -> WireResult<()> {
        out.put_u64(self.ptr)?;
        out.put_u64(self.cookie)
    }

    fn decode(input: &mut CommandReader) -> WireResult<Self> {
        Ok(Self {
            ptr: input.get_u64()?,
            cookie: input.get_u64()?,
        })
    }
}

/// Remote handle plus the local cookie a notification should carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HandleCookie {
    pub handle: u32,
    pub cookie: u64,
}

impl HandleCookie {
    fn encode(&self, out: &mut CommandWriter) -> WireResult<()> {
        out.put_u32(self.handle)?;
        out.put_u64(self.cookie)
    }

    fn decode(input: &mut CommandReader) -> WireResult<Self> {
        Ok(Self {
            handle: input.get_u32()?,
            cookie: input.get_u64()?,
        })
    }
}

/// Freeze state change reported for a registered cookie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrozenStateInfo {
    pub cookie: u64,
    pub is_frozen: bool,
}

/// Outbound (`BC_*`) records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Transaction(TransactionData),
    Reply(TransactionData),
    TransactionSg { data: TransactionData, buffers_size: u64 },
    ReplySg { data: TransactionData, buffers_size: u64 },
    AcquireResult(i32),
    FreeBuffer(u64),
    IncRefs(u32),
    Acquire(u32),
    Release(u32),
    DecRefs(u32),
    IncRefsDone(PtrCookie),
    AcquireDone(PtrCookie),
    AttemptAcquire { priority: i32, handle: u32 },
    RegisterLooper,
    EnterLooper,
    ExitLooper,
    RequestDeathNotification(HandleCookie),
    ClearDeathNotification(HandleCookie),
    DeadBinderDone(u64),
    RequestFreezeNotification(HandleCookie),
    ClearFreezeNotification(HandleCookie),
    FreezeNotificationDone(u64),
}

impl Command {
    pub fn tag(&self) -> u32 {
        match self {
            Command::Transaction(_) => BC_TRANSACTION,
            Command::Reply(_) => BC_REPLY,
            Command::TransactionSg { .. } => BC_TRANSACTION_SG,
            Command::ReplySg { .. } => BC_REPLY_SG,
            Command::AcquireResult(_) => BC_ACQUIRE_RESULT,
            Command::FreeBuffer(_) => BC_FREE_BUFFER,
            Command::IncRefs(_) => BC_INCREFS,
            Command::Acquire(_) => BC_ACQUIRE,
            Command::Release(_) => BC_RELEASE,
            Command::DecRefs(_) => BC_DECREFS,
            Command::IncRefsDone(_) => BC_INCREFS_DONE,
            Command::AcquireDone(_) => BC_ACQUIRE_DONE,
            Command::AttemptAcquire { .. } => BC_ATTEMPT_ACQUIRE,
            Command::RegisterLooper => BC_REGISTER_LOOPER,
            Command::EnterLooper => BC_ENTER_LOOPER,
            Command::ExitLooper => BC_EXIT_LOOPER,
            Command::RequestDeathNotification(_) => BC_REQUEST_DEATH_NOTIFICATION,
            Command::ClearDeathNotification(_) => BC_CLEAR_DEATH_NOTIFICATION,
            Command::DeadBinderDone(_) => BC_DEAD_BINDER_DONE,
            Command::RequestFreezeNotification(_) => BC_REQUEST_FREEZE_NOTIFICATION,
            Command::ClearFreezeNotification(_) => BC_CLEAR_FREEZE_NOTIFICATION,
            Command::FreezeNotificationDone(_) => BC_FREEZE_NOTIFICATION_DONE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Transaction(_) => "BC_TRANSACTION",
            Command::Reply(_) => "BC_REPLY",
            Command::TransactionSg { .. } => "BC_TRANSACTION_SG",
            Command::ReplySg { .. } => "BC_REPLY_SG",
            Command::AcquireResult(_) => "BC_ACQUIRE_RESULT",
            Command::FreeBuffer(_) => "BC_FREE_BUFFER",
            Command::IncRefs(_) => "BC_INCREFS",
            Command::Acquire(_) => "BC_ACQUIRE",
            Command::Release(_) => "BC_RELEASE",
            Command::DecRefs(_) => "BC_DECREFS",
            Command::IncRefsDone(_) => "BC_INCREFS_DONE",
            Command::AcquireDone(_) => "BC_ACQUIRE_DONE",
            Command::AttemptAcquire { .. } => "BC_ATTEMPT_ACQUIRE",
            Command::RegisterLooper => "BC_REGISTER_LOOPER",
            Command::EnterLooper => "BC_ENTER_LOOPER",
            Command::ExitLooper => "BC_EXIT_LOOPER",
            Command::RequestDeathNotification(_) => "BC_REQUEST_DEATH_NOTIFICATION",
            Command::ClearDeathNotification(_) => "BC_CLEAR_DEATH_NOTIFICATION",
            Command::DeadBinderDone(_) => "BC_DEAD_BINDER_DONE",
            Command::RequestFreezeNotification(_) => "BC_REQUEST_FREEZE_NOTIFICATION",
            Command::ClearFreezeNotification(_) => "BC_CLEAR_FREEZE_NOTIFICATION",
            Command::FreezeNotificationDone(_) => "BC_FREEZE_NOTIFICATION_DONE",
        }
    }
}

impl WireRecord for Command {
    fn encode(&self, out: &mut CommandWriter) -> WireResult<()> {
        out.put_u32(self.tag())?;
        match self {
            Command::Transaction(tr) | Command::Reply(tr) => tr.encode_full(out),
            Command::TransactionSg { data, buffers_size } | Command::ReplySg { data, buffers_size } => {
                data.encode_header(out)?;
                out.put_u64(*buffers_size)?;
                data.encode_body(out)
            }
            Command::AcquireResult(result) => out.put_i32(*result),
            Command::FreeBuffer(id)
            | Command::DeadBinderDone(id)
            | Command::FreezeNotificationDone(id) => out.put_u64(*id),
            Command::IncRefs(handle)
            | Command::Acquire(handle)
            | Command::Release(handle)
            | Command::DecRefs(handle) => out.put_u32(*handle),
            Command::IncRefsDone(pc) | Command::AcquireDone(pc) => pc.encode(out),
            Command::AttemptAcquire { priority, handle } => {
                out.put_i32(*priority)?;
                out.put_u32(*handle)
            }
            Command::RegisterLooper | Command::EnterLooper | Command::ExitLooper => Ok(()),
            Command::RequestDeathNotification(hc)
            | Command::ClearDeathNotification(hc)
            | Command::RequestFreezeNotification(hc)
            | Command::ClearFreezeNotification(hc) => hc.encode(out),
        }
    }

    fn decode(input: &mut CommandReader) -> WireResult<Self> {
        let tag = input.get_u32()?;
        let cmd = match tag {
            BC_TRANSACTION => Command::Transaction(TransactionData::decode_full(input)?),
            BC_REPLY => Command::Reply(TransactionData::decode_full(input)?),
            BC_TRANSACTION_SG | BC_REPLY_SG => {
                let (tr, data_size, offsets_size) = TransactionData::decode_header(input)?;
                let buffers_size = input.get_u64()?;
                let data = tr.decode_body(input, data_size, offsets_size)?;
                if tag == BC_TRANSACTION_SG {
                    Command::TransactionSg { data, buffers_size }
                } else {
                    Command::ReplySg { data, buffers_size }
                }
            }
            BC_ACQUIRE_RESULT => Command::AcquireResult(input.get_i32()?),
            BC_FREE_BUFFER => Command::FreeBuffer(input.get_u64()?),
            BC_INCREFS => Command::IncRefs(input.get_u32()?),
            BC_ACQUIRE => Command::Acquire(input.get_u32()?),
            BC_RELEASE => Command::Release(input.get_u32()?),
            BC_DECREFS => Command::DecRefs(input.get_u32()?),
            BC_INCREFS_DONE => Command::IncRefsDone(PtrCookie::decode(input)?),
            BC_ACQUIRE_DONE => Command::AcquireDone(PtrCookie::decode(input)?),
            BC_ATTEMPT_ACQUIRE => Command::AttemptAcquire {
                priority: input.get_i32()?,
                handle: input.get_u32()?,
            },
            BC_REGISTER_LOOPER => Command::RegisterLooper,
            BC_ENTER_LOOPER => Command::EnterLooper,
            BC_EXIT_LOOPER => Command::ExitLooper,
            BC_REQUEST_DEATH_NOTIFICATION => {
                Command::RequestDeathNotification(HandleCookie::decode(input)?)
            }
            BC_CLEAR_DEATH_NOTIFICATION => Command::ClearDeathNotification(HandleCookie::decode(input)?),
            BC_DEAD_BINDER_DONE => Command::DeadBinderDone(input.get_u64()?),
            BC_REQUEST_FREEZE_NOTIFICATION => {
                Command::RequestFreezeNotification(HandleCookie::decode(input)?)
            }
            BC_CLEAR_FREEZE_NOTIFICATION => {
                Command::ClearFreezeNotification(HandleCookie::decode(input)?)
            }
            BC_FREEZE_NOTIFICATION_DONE => Command::FreezeNotificationDone(input.get_u64()?),
            other => {
                input.skip(payload_size(other));
                return Err(WireError::UnknownCommand { tag: other });
            }
        };
        Ok(cmd)
    }
}

/// Inbound (`BR_*`) records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Return {
    Error(i32),
    Ok,
    Transaction(TransactionData),
    TransactionSecCtx { data: TransactionData, secctx: u64 },
    Reply(TransactionData),
    AcquireResult(i32),
    DeadReply,
    TransactionComplete,
    IncRefs(PtrCookie),
    Acquire(PtrCookie),
    Release(PtrCookie),
    DecRefs(PtrCookie),
    AttemptAcquire { priority: i32, target: PtrCookie },
    Noop,
    SpawnLooper,
    Finished,
    DeadBinder(u64),
    ClearDeathNotificationDone(u64),
    FailedReply,
    FrozenReply,
    OnewaySpamSuspect,
    TransactionPendingFrozen,
    FrozenBinder(FrozenStateInfo),
    ClearFreezeNotificationDone(u64),
}

impl Return {
    pub fn tag(&self) -> u32 {
        match self {
            Return::Error(_) => BR_ERROR,
            Return::Ok => BR_OK,
            Return::Transaction(_) => BR_TRANSACTION,
            Return::TransactionSecCtx { .. } => BR_TRANSACTION_SEC_CTX,
            Return::Reply(_) => BR_REPLY,
            Return::AcquireResult(_) => BR_ACQUIRE_RESULT,
            Return::DeadReply => BR_DEAD_REPLY,
            Return::TransactionComplete => BR_TRANSACTION_COMPLETE,
            Return::IncRefs(_) => BR_INCREFS,
            Return::Acquire(_) => BR_ACQUIRE,
            Return::Release(_) => BR_RELEASE,
            Return::DecRefs(_) => BR_DECREFS,
            Return::AttemptAcquire { .. } => BR_ATTEMPT_ACQUIRE,
            Return::Noop => BR_NOOP,
            Return::SpawnLooper => BR_SPAWN_LOOPER,
            Return::Finished => BR_FINISHED,
            Return::DeadBinder(_) => BR_DEAD_BINDER,
            Return::ClearDeathNotificationDone(_) => BR_CLEAR_DEATH_NOTIFICATION_DONE,
            Return::FailedReply => BR_FAILED_REPLY,
            Return::FrozenReply => BR_FROZEN_REPLY,
            Return::OnewaySpamSuspect => BR_ONEWAY_SPAM_SUSPECT,
            Return::TransactionPendingFrozen => BR_TRANSACTION_PENDING_FROZEN,
            Return::FrozenBinder(_) => BR_FROZEN_BINDER,
            Return::ClearFreezeNotificationDone(_) => BR_CLEAR_FREEZE_NOTIFICATION_DONE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Return::Error(_) => "BR_ERROR",
            Return::Ok => "BR_OK",
            Return::Transaction(_) => "BR_TRANSACTION",
            Return::TransactionSecCtx { .. } => "BR_TRANSACTION_SEC_CTX",
            Return::Reply(_) => "BR_REPLY",
            Return::AcquireResult(_) => "BR_ACQUIRE_RESULT",
            Return::DeadReply => "BR_DEAD_REPLY",
            Return::TransactionComplete => "BR_TRANSACTION_COMPLETE",
            Return::IncRefs(_) => "BR_INCREFS",
            Return::Acquire(_) => "BR_ACQUIRE",
            Return::Release(_) => "BR_RELEASE",
            Return::DecRefs(_) => "BR_DECREFS",
            Return::AttemptAcquire { .. } => "BR_ATTEMPT_ACQUIRE",
            Return::Noop => "BR_NOOP",
            Return::SpawnLooper => "BR_SPAWN_LOOPER",
            Return::Finished => "BR_FINISHED",
            Return::DeadBinder(_) => "BR_DEAD_BINDER",
            Return::ClearDeathNotificationDone(_) => "BR_CLEAR_DEATH_NOTIFICATION_DONE",
            Return::FailedReply => "BR_FAILED_REPLY",
            Return::FrozenReply => "BR_FROZEN_REPLY",
            Return::OnewaySpamSuspect => "BR_ONEWAY_SPAM_SUSPECT",
            Return::TransactionPendingFrozen => "BR_TRANSACTION_PENDING_FROZEN",
            Return::FrozenBinder(_) => "BR_FROZEN_BINDER",
            Return::ClearFreezeNotificationDone(_) => "BR_CLEAR_FREEZE_NOTIFICATION_DONE",
        }
    }
}

impl WireRecord for Return {
    fn encode(&self, out: &mut CommandWriter) -> WireResult<()> {
        out.put_u32(self.tag())?;
        match self {
            Return::Error(code) | Return::AcquireResult(code) => out.put_i32(*code),
            Return::Transaction(tr) | Return::Reply(tr) => tr.encode_full(out),
            Return::TransactionSecCtx { data, secctx } => {
                data.encode_header(out)?;
                out.put_u64(*secctx)?;
                data.encode_body(out)
            }
            Return::IncRefs(pc) | Return::Acquire(pc) | Return::Release(pc) | Return::DecRefs(pc) => {
                pc.encode(out)
            }
            Return::AttemptAcquire { priority, target } => {
                out.put_i32(*priority)?;
                out.put_zeros(4)?;
                target.encode(out)
            }
            Return::DeadBinder(cookie)
            | Return::ClearDeathNotificationDone(cookie)
            | Return::ClearFreezeNotificationDone(cookie) => out.put_u64(*cookie),
            Return::FrozenBinder(info) => {
                out.put_u64(info.cookie)?;
                out.put_u32(info.is_frozen as u32)?;
                out.put_u32(0)
            }
            Return::Ok
            | Return::DeadReply
            | Return::TransactionComplete
            | Return::Noop
            | Return::SpawnLooper
            | Return::Finished
            | Return::FailedReply
            | Return::FrozenReply
            | Return::OnewaySpamSuspect
            | Return::TransactionPendingFrozen => Ok(()),
        }
    }

    fn decode(input: &mut CommandReader) -> WireResult<Self> {
        let tag = input.get_u32()?;
        let ret = match tag {
            BR_ERROR => Return::Error(input.get_i32()?),
            BR_OK => Return::Ok,
            BR_TRANSACTION => Return::Transaction(TransactionData::decode_full(input)?),
            BR_TRANSACTION_SEC_CTX => {
                let (tr, data_size, offsets_size) = TransactionData::decode_header(input)?;
                let secctx = input.get_u64()?;
                let data = tr.decode_body(input, data_size, offsets_size)?;
                Return::TransactionSecCtx { data, secctx }
            }
            BR_REPLY => Return::Reply(TransactionData::decode_full(input)?),
            BR_ACQUIRE_RESULT => Return::AcquireResult(input.get_i32()?),
            BR_DEAD_REPLY => Return::DeadReply,
            BR_TRANSACTION_COMPLETE => Return::TransactionComplete,
            BR_INCREFS => Return::IncRefs(PtrCookie::decode(input)?),
            BR_ACQUIRE => Return::Acquire(PtrCookie::decode(input)?),
            BR_RELEASE => Return::Release(PtrCookie::decode(input)?),
            BR_DECREFS => Return::DecRefs(PtrCookie::decode(input)?),
            BR_ATTEMPT_ACQUIRE => {
                let priority = input.get_i32()?;
                input.take_bytes(4)?;
                Return::AttemptAcquire {
                    priority,
                    target: PtrCookie::decode(input)?,
                }
            }
            BR_NOOP => Return::Noop,
            BR_SPAWN_LOOPER => Return::SpawnLooper,
            BR_FINISHED => Return::Finished,
            BR_DEAD_BINDER => Return::DeadBinder(input.get_u64()?),
            BR_CLEAR_DEATH_NOTIFICATION_DONE => Return::ClearDeathNotificationDone(input.get_u64()?),
            BR_FAILED_REPLY => Return::FailedReply,
            BR_FROZEN_REPLY => Return::FrozenReply,
            BR_ONEWAY_SPAM_SUSPECT => Return::OnewaySpamSuspect,
            BR_TRANSACTION_PENDING_FROZEN => Return::TransactionPendingFrozen,
            BR_FROZEN_BINDER => {
                let cookie = input.get_u64()?;
                let is_frozen = input.get_u32()? != 0;
                input.get_u32()?;
                Return::FrozenBinder(FrozenStateInfo { cookie, is_frozen })
            }
            BR_CLEAR_FREEZE_NOTIFICATION_DONE => {
                Return::ClearFreezeNotificationDone(input.get_u64()?)
            }
            other => {
                input.skip(payload_size(other));
                return Err(WireError::UnknownCommand { tag: other });
            }
        };
        Ok(ret)
    }
}

/// Appends `record` to `out`.
pub fn encode<R: WireRecord>(record: &R, out: &mut CommandWriter) -> WireResult<()> {
    record.encode(out)
}

/// Decodes the next record, or `None` once the reader is drained.
///
/// A truncated record drains the reader so a caller looping on this cannot
/// spin on the same bytes.
pub fn decode<R: WireRecord>(input: &mut CommandReader) -> Option<WireResult<R>> {
    if input.is_drained() {
        return None;
    }
    let result = R::decode(input);
    if matches!(result, Err(WireError::Truncated { .. } | WireError::Malformed(_))) {
        input.drain();
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_return(ret: Return) -> Return {
        let mut out = CommandWriter::new();
        ret.encode(&mut out).unwrap();
        let mut input = CommandReader::from_bytes(out.as_bytes());
        let decoded = decode::<Return>(&mut input).unwrap().unwrap();
        assert!(input.is_drained());
        decoded
    }

    #[test]
    fn reply_carries_inline_payload() {
        let reply = Return::Reply(TransactionData {
            flags: TF_STATUS_CODE,
            buffer_id: 9,
            data: vec![1, 2, 3, 4],
            offsets: vec![0],
            ..TransactionData::default()
        });
        assert_eq!(round_trip_return(reply.clone()), reply);
    }

    #[test]
    fn attempt_acquire_keeps_priority_padding() {
        let ret = Return::AttemptAcquire {
            priority: -3,
            target: PtrCookie { ptr: 7, cookie: 8 },
        };
        let mut out = CommandWriter::new();
        ret.encode(&mut out).unwrap();
        assert_eq!(out.len(), 4 + PRI_PTR_COOKIE_SIZE);
        assert_eq!(round_trip_return(ret.clone()), ret);
    }

    #[test]
    fn unknown_tag_is_skipped_by_encoded_size() {
        let mut out = CommandWriter::new();
        let bogus = (2u32 << 30) | (8 << 16) | ((b'r' as u32) << 8) | 0x7f;
        out.put_u32(bogus).unwrap();
        out.put_u64(0).unwrap();
        Return::Noop.encode(&mut out).unwrap();

        let mut input = CommandReader::from_bytes(out.as_bytes());
        assert_eq!(
            decode::<Return>(&mut input),
            Some(Err(WireError::UnknownCommand { tag: bogus }))
        );
        assert_eq!(decode::<Return>(&mut input), Some(Ok(Return::Noop)));
        assert_eq!(decode::<Return>(&mut input), None);
    }

    #[test]
    fn truncated_transaction_drains_reader() {
        let mut out = CommandWriter::new();
        Command::Transaction(TransactionData::to_handle(1, 2, 0, vec![0; 16], Vec::new()))
            .encode(&mut out)
            .unwrap();
        let bytes = &out.as_bytes()[..out.len() - 4];
        let mut input = CommandReader::from_bytes(bytes);
        assert!(matches!(
            decode::<Command>(&mut input),
            Some(Err(WireError::Truncated { .. }))
        ));
        assert!(input.is_drained());
    }

    #[test]
    fn handle_cookie_is_packed() {
        let mut out = CommandWriter::new();
        Command::RequestDeathNotification(HandleCookie { handle: 3, cookie: 4 })
            .encode(&mut out)
            .unwrap();
        assert_eq!(out.len(), 4 + HANDLE_COOKIE_SIZE);
    }
}
