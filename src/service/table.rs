//! Method dispatch table.
//!
//! One handler per [`MethodId`], fixed when the table is built. Handlers run
//! on the connection's read loop: they decode what they need and hand the
//! rest of the call to the compute pool, except for the unimplemented
//! methods which answer on the spot.

use std::sync::Arc;

use super::handlers;
use super::MethodId;
use crate::call::ServerCall;
use crate::worker::Worker;

/// Entry point for one method.
pub type Handler = fn(&Arc<Worker>, ServerCall);

/// Fixed mapping from method to handler.
pub struct MethodDispatchTable {
    handlers: [Handler; MethodId::COUNT],
}

impl MethodDispatchTable {
    /// Table with every method registered.
    pub fn new() -> Self {
        let mut table = Self {
            handlers: [handlers::unimplemented as Handler; MethodId::COUNT],
        };

        table.register(MethodId::RunGraph, handlers::run_graph);
        table.register(MethodId::RecvTensor, handlers::recv_tensor);
        table.register(MethodId::FusedRecvTensor, handlers::fused_recv_tensor);

        for method in [
            MethodId::GetStatus,
            MethodId::CreateWorkerSession,
            MethodId::DeleteWorkerSession,
            MethodId::RegisterGraph,
            MethodId::DeregisterGraph,
            MethodId::CleanupGraph,
            MethodId::CleanupAll,
            MethodId::Logging,
            MethodId::Tracing,
        ] {
            table.register(method, handlers::forward);
        }

        for method in [
            MethodId::RecvBuf,
            MethodId::CompleteGroup,
            MethodId::CompleteInstance,
            MethodId::GetStepSequence,
        ] {
            table.register(method, handlers::unimplemented);
        }

        table
    }

    /// Set the handler for `method`.
    pub fn register(&mut self, method: MethodId, handler: Handler) {
        self.handlers[method.index()] = handler;
    }

    pub fn handler(&self, method: MethodId) -> Handler {
        self.handlers[method.index()]
    }

    pub fn dispatch(&self, worker: &Arc<Worker>, call: ServerCall) {
        (self.handler(call.method()))(worker, call);
    }
}

impl Default for MethodDispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_method_has_expected_handler() {
        let table = MethodDispatchTable::new();
        let unimplemented = handlers::unimplemented as Handler as usize;
        for method in MethodId::ALL {
            let is_unimplemented = table.handler(method) as usize == unimplemented;
            let expected = matches!(
                method,
                MethodId::RecvBuf
                    | MethodId::CompleteGroup
                    | MethodId::CompleteInstance
                    | MethodId::GetStepSequence
            );
            assert_eq!(is_unimplemented, expected, "{}", method);
        }
    }

    #[test]
    fn test_transfer_methods_routed() {
        let table = MethodDispatchTable::new();
        assert_eq!(
            table.handler(MethodId::RecvTensor) as usize,
            handlers::recv_tensor as Handler as usize
        );
        assert_eq!(
            table.handler(MethodId::FusedRecvTensor) as usize,
            handlers::fused_recv_tensor as Handler as usize
        );
        assert_eq!(
            table.handler(MethodId::Logging) as usize,
            handlers::forward as Handler as usize
        );
    }
}
