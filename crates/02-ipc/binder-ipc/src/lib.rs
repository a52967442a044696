//! Binder transaction engine.
//!
//! One [`IpcThread`] per OS thread talks to the peer through a [`Driver`]
//! and executes whatever the peer sends back: nested transactions, reference
//! count requests, death and freeze notifications. [`ProcessContext`] holds the
//! state shared across threads and hands each thread its engine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use binder_ipc::{IpcConfig, ProcessContext, ScriptedDriver};
//! use binder_wire::Parcel;
//!
//! let ctx = ProcessContext::init(Arc::new(ScriptedDriver::new()), IpcConfig::default())?;
//! let mut data = Parcel::new();
//! data.write_i32(42)?;
//! ctx.transact(1, 1, &data, None, binder_wire::protocol::TF_ONE_WAY)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod binder;
mod config;
mod driver;
mod engine;
mod error;
pub mod identity;
mod nodes;
mod notify;
mod pool;
mod process;
mod refs;
mod scripted;

pub use binder::{Binder, DeathRecipient, FrozenStateListener};
pub use config::{CallRestriction, IpcConfig};
pub use driver::{Driver, DriverError, FrozenInfo, ProcessIdentity, WriteRead};
pub use engine::IpcThread;
pub use error::{status_to_result, BinderError, BinderResult, TransactStatus};
pub use identity::{CallingIdentity, WorkSource};
pub use nodes::NodeTable;
pub use notify::NotificationRegistry;
pub use pool::ThreadPool;
pub use process::ProcessContext;
pub use refs::{Deref, DerefQueues, Pin, PostWritePins, WeakPin};
pub use scripted::{Responder, ScriptedDriver};
