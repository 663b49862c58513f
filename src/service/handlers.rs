//! Per-method handlers.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::{FusedRecvTensorRequest, RecvTensorRequest};
use crate::call::{CallOptions, CallState, ServerCall};
use crate::error::WorkerError;
use crate::tensor::now_micros;
use crate::transfer::{FusedTensorResponse, TensorResponse, NETWORK_LATENCY_MICROS};
use crate::worker::Worker;

/// Client-to-handler delta, `None` when the client sent no start stamp.
fn request_delta(handle_start: i64, recv_req_start: i64) -> Option<i64> {
    (recv_req_start > 0).then(|| handle_start - recv_req_start - NETWORK_LATENCY_MICROS)
}

/// Time from the client's start stamp to scheduling, on the client's clock.
fn scheduled_micros(now: i64, delta: i64, recv_req_start: i64) -> Option<i64> {
    (recv_req_start > 0).then(|| now - delta - recv_req_start)
}

/// Store the client-to-handler delta in `options` and trace it.
fn record_request_start(options: &CallOptions, method: &str, handle_start: i64, recv_req_start: i64) {
    if let Some(delta) = request_delta(handle_start, recv_req_start) {
        options.set_delta_micros(delta);
        trace!(method, micros = delta, "request start to handler");
    }
}

fn trace_scheduled(options: &CallOptions, method: &str, recv_req_start: i64) {
    if let Some(micros) = scheduled_micros(now_micros(), options.delta_micros(), recv_req_start) {
        trace!(method, micros, "request start to scheduled");
    }
}

pub(crate) fn recv_tensor(worker: &Arc<Worker>, call: ServerCall) {
    let handle_start = now_micros();
    let request: RecvTensorRequest = match call.decode() {
        Ok(request) => request,
        Err(err) => return call.respond(Err(err)),
    };
    let trace_timing = worker.config().trace_timing;
    if trace_timing {
        record_request_start(call.options(), "RecvTensor", handle_start, request.recv_req_start_micros);
    }

    let task_worker = worker.clone();
    worker.pool().spawn_call(async move {
        let state: CallState<RecvTensorRequest, TensorResponse> = CallState::new(call, request);
        if trace_timing {
            trace_scheduled(state.options(), "RecvTensor", state.request.recv_req_start_micros);
        }
        let step_id = state.request.step_id;
        let key = state.request.rendezvous_key.clone();
        let options = state.options().clone();
        task_worker
            .transfer()
            .recv_tensor(step_id, &key, &options, move |result| state.finish_with(result));
    });
}

pub(crate) fn fused_recv_tensor(worker: &Arc<Worker>, call: ServerCall) {
    let handle_start = now_micros();
    let request: FusedRecvTensorRequest = match call.decode() {
        Ok(request) => request,
        Err(err) => return call.respond(Err(err)),
    };
    let trace_timing = worker.config().trace_timing;
    if trace_timing {
        record_request_start(
            call.options(),
            "FusedRecvTensor",
            handle_start,
            request.recv_req_start_micros,
        );
    }

    let task_worker = worker.clone();
    worker.pool().spawn_call(async move {
        let state: CallState<FusedRecvTensorRequest, FusedTensorResponse> =
            CallState::new(call, request);
        if trace_timing {
            trace_scheduled(
                state.options(),
                "FusedRecvTensor",
                state.request.recv_req_start_micros,
            );
        }
        let step_id = state.request.step_id;
        let keys = state.request.rendezvous_keys.clone();
        let options = state.options().clone();
        task_worker
            .transfer()
            .fused_recv_tensor(step_id, &keys, &options, move |result| state.finish_with(result));
    });
}

pub(crate) fn run_graph(worker: &Arc<Worker>, call: ServerCall) {
    let graph = worker.graph().clone();
    worker.pool().spawn_call(async move {
        let request = call.payload().clone();
        let state: CallState<Bytes, Bytes> = CallState::new(call, request);
        let result = graph
            .run_graph(state.options().clone(), state.request.clone())
            .await;
        state.finish_with(result);
    });
}

/// Methods served entirely by the graph engine.
pub(crate) fn forward(worker: &Arc<Worker>, call: ServerCall) {
    let graph = worker.graph().clone();
    worker.pool().spawn_call(async move {
        let request = call.payload().clone();
        let state: CallState<Bytes, Bytes> = CallState::new(call, request);
        let result = graph.handle(state.method(), state.request.clone());
        state.finish_with(result);
    });
}

/// Answer at once; nothing is scheduled.
pub(crate) fn unimplemented(_worker: &Arc<Worker>, call: ServerCall) {
    let method = call.method().name();
    call.respond(Err(WorkerError::Unimplemented(method)));
}
