//! NFSv4.1 operation handlers
//!
//! Individual handlers for each NFSv4.1 COMPOUND operation, grouped by the
//! state they touch. Every handler is an `NfsServer` method taking the
//! compound environment and its decoded arguments, and returns the result
//! body or an error.

mod deleg;
mod dir;
mod fh;
mod layout;
mod lock;
mod open;
mod session;
mod stateid;

pub use layout::{LayoutCommitArgs, LayoutGetArgs, LayoutGetRes, LayoutReturnArgs};
pub use lock::{LockArgs, LockTArgs, LockUArgs, Locker};
pub use open::{
    CreateMode, OpenArgs, OpenClaim, OpenDowngradeArgs, OpenHow, OpenRes, ReadArgs, ReadRes,
    SetAttrArgs, WriteArgs, WriteRes, CLOSED_STATEID,
};
pub use session::{
    CreateSessionArgs, CreateSessionRes, ExchangeIdArgs, ExchangeIdRes, SequenceArgs, SequenceRes,
};

use crate::error::NfsResult;

use super::compound::ResBody;

/// Result of an operation
pub type OpResult = NfsResult<ResBody>;
