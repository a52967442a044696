//! Wire format spoken with the binder driver.
//!
//! * [`protocol`] – ioctl-encoded command tags and transaction flags.
//! * [`Command`] / [`Return`] – closed record sets for each direction, see [`WireRecord`].
//! * [`CommandWriter`] / [`CommandReader`] – the byte buffers handed to and filled by the driver.
//! * [`Parcel`] – typed payload container that returns peer buffers when dropped.

mod buffer;
mod command;
mod error;
mod parcel;
pub mod protocol;

pub use buffer::{CommandReader, CommandWriter};
pub use command::{
    decode, encode, Command, FrozenStateInfo, HandleCookie, PtrCookie, Return, TransactionData,
    WireRecord,
};
pub use error::{WireError, WireResult};
pub use parcel::Parcel;
