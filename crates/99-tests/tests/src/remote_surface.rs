//! A surface served over binder: inbound calls draw frames that end up
//! in front of the compositor.

use std::sync::Arc;

use binder_ipc::{
    Binder, BinderError, BinderResult, IpcConfig, IpcThread, ProcessContext, ProcessIdentity, ScriptedDriver,
};
use binder_wire::protocol::{TF_ONE_WAY, TF_STATUS_CODE};
use binder_wire::{Command, Parcel, PtrCookie, Return, TransactionData};
use blast_queue::{BlastBufferQueue, BlastConfig, RecordingComposer, SurfaceControl, SurfaceId};
use buffer_queue::{Api, BufferQueueProducer, QueueBufferInput, QueueError, PIXEL_FORMAT_RGBA_8888};

const DRAW: u32 = 1;
const DISCONNECT: u32 = 2;
const SURFACE: u64 = 7;

struct SurfaceService {
    bbq: BlastBufferQueue,
    producer: BufferQueueProducer,
}

impl SurfaceService {
    fn new(composer: Arc<RecordingComposer>) -> Self {
        let bbq = BlastBufferQueue::new(&BlastConfig::default(), composer).expect("queue");
        bbq.update(&SurfaceControl::new(SURFACE), 32, 32, PIXEL_FORMAT_RGBA_8888)
            .expect("update");
        let producer = bbq.producer();
        producer.connect(None, Api::Cpu, false).expect("connect");
        Self { bbq, producer }
    }

    fn draw(&self, width: u32, height: u32) -> Result<u64, QueueError> {
        let out = self.producer.dequeue_buffer(width, height, 0, 0)?;
        self.producer.request_buffer(out.slot)?;
        self.producer.queue_buffer(out.slot, QueueBufferInput::default())?;
        Ok(self.bbq.last_acquired_frame_number())
    }
}

fn queue_status(err: QueueError) -> BinderError {
    BinderError::from_code(err.code())
}

impl Binder for SurfaceService {
    fn on_transact(
        &self,
        _engine: &mut IpcThread,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        _flags: u32,
    ) -> BinderResult<()> {
        match code {
            DRAW => {
                let width = u32::try_from(data.read_i32()?).map_err(|_| BinderError::BadValue)?;
                let height = u32::try_from(data.read_i32()?).map_err(|_| BinderError::BadValue)?;
                let frame = self.draw(width, height).map_err(queue_status)?;
                reply.write_i32(frame as i32)?;
                Ok(())
            }
            DISCONNECT => self.producer.disconnect(Api::Cpu).map_err(queue_status),
            _ => Err(BinderError::UnknownTransaction),
        }
    }
}

struct Setup {
    driver: Arc<ScriptedDriver>,
    ctx: ProcessContext,
    composer: Arc<RecordingComposer>,
    node: PtrCookie,
    _service: Arc<dyn Binder>,
}

fn setup() -> Setup {
    let driver = Arc::new(ScriptedDriver::new().with_identity(ProcessIdentity { pid: 300, uid: 1000 }));
    let dyn_driver: Arc<dyn binder_ipc::Driver> = driver.clone();
    let ctx = ProcessContext::init(dyn_driver, IpcConfig::default()).expect("init");
    let composer = Arc::new(RecordingComposer::new());
    let service: Arc<dyn Binder> = Arc::new(SurfaceService::new(composer.clone()));
    let node = ctx.register_local_object(&service);
    let surface_setup = composer.try_next().expect("surface setup transaction");
    assert!(surface_setup.transaction.layer(SurfaceId(SURFACE)).is_some());
    Setup {
        driver,
        ctx,
        composer,
        node,
        _service: service,
    }
}

fn call(node: PtrCookie, code: u32, flags: u32, data: &[i32], buffer_id: u64) -> Return {
    Return::Transaction(TransactionData {
        target: node.ptr,
        cookie: node.cookie,
        code,
        flags,
        sender_pid: 500,
        sender_euid: 10_050,
        buffer_id,
        data: data.iter().flat_map(|value| value.to_le_bytes()).collect(),
        ..TransactionData::default()
    })
}

fn replies(written: &[Command]) -> Vec<&TransactionData> {
    written
        .iter()
        .filter_map(|cmd| match cmd {
            Command::Reply(reply) => Some(reply),
            _ => None,
        })
        .collect()
}

fn presented_frame(composer: &RecordingComposer) -> u64 {
    let applied = composer.try_next().expect("frame transaction");
    let frame = applied
        .transaction
        .layer(SurfaceId(SURFACE))
        .and_then(|layer| layer.buffer.as_ref())
        .map(|buffer| buffer.frame_number)
        .expect("buffer in transaction");
    composer.present(applied.transaction);
    frame
}

#[test]
fn remote_draw_reaches_the_compositor_and_replies_with_the_frame() {
    let s = setup();
    s.driver.push_return(call(s.node, DRAW, 0, &[32, 32], 0x10));
    s.driver.push_return(call(s.node, DRAW, 0, &[32, 32], 0x11));

    s.ctx.join_thread_pool(false).unwrap();

    let written = s.driver.written();
    let sent = replies(&written);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].data, 1i32.to_le_bytes());
    assert_eq!(sent[1].data, 2i32.to_le_bytes());
    assert!(sent.iter().all(|reply| reply.flags & TF_STATUS_CODE == 0));
    assert!(written.contains(&Command::FreeBuffer(0x10)));
    assert!(written.contains(&Command::FreeBuffer(0x11)));

    assert_eq!(presented_frame(&s.composer), 1);
    assert_eq!(presented_frame(&s.composer), 2);
    assert_eq!(s.composer.current_frame(SurfaceId(SURFACE)), Some(2));
}

#[test]
fn one_way_draws_are_never_answered() {
    let s = setup();
    s.driver.push_return(call(s.node, DRAW, TF_ONE_WAY, &[32, 32], 0x20));

    s.ctx.join_thread_pool(false).unwrap();

    let written = s.driver.written();
    assert!(replies(&written).is_empty());
    assert!(written.contains(&Command::FreeBuffer(0x20)));
    assert_eq!(presented_frame(&s.composer), 1);
}

#[test]
fn queue_failures_travel_back_as_status_replies() {
    let s = setup();
    s.driver.push_return(call(s.node, DISCONNECT, 0, &[], 0x30));
    s.driver.push_return(call(s.node, DRAW, 0, &[16, 16], 0x31));
    s.driver.push_return(call(s.node, DRAW, 0, &[-1, 16], 0x32));

    s.ctx.join_thread_pool(false).unwrap();

    let written = s.driver.written();
    let sent = replies(&written);
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].flags & TF_STATUS_CODE, 0);

    assert_ne!(sent[1].flags & TF_STATUS_CODE, 0);
    let not_connected = queue_status(QueueError::NotConnected).code();
    assert_eq!(sent[1].data, not_connected.to_le_bytes());

    assert_ne!(sent[2].flags & TF_STATUS_CODE, 0);
    assert_eq!(sent[2].data, BinderError::BadValue.code().to_le_bytes());

    assert!(s.composer.try_next().is_none());
}
