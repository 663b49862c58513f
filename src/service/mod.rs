//! The worker's RPC surface: method ids, request messages and the dispatch
//! table.

mod handlers;
mod messages;
mod method;
mod table;

pub use messages::{FusedRecvTensorRequest, RecvTensorRequest};
pub use method::MethodId;
pub use table::{Handler, MethodDispatchTable};
