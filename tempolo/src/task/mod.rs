//! Result handles with an explicit completion state machine.

mod cell;
pub(crate) use self::cell::{TaskCell, Work};
pub use self::cell::Runnable;

mod error;
pub use self::error::{RejectReason, TaskError};
pub(crate) use self::error::panic_payload_as_str;

mod handle;
pub use self::handle::TaskHandle;

pub mod id;
pub use self::id::{Id, try_id};

mod state;
pub use self::state::TaskState;

mod waiters;
