//! Per-call request/response state.

use std::sync::Arc;

use bytes::Bytes;

use super::{CallOptions, ResponseBody, ServerCall};
use crate::error::Result;
use crate::service::MethodId;

/// A response that can be written to the wire.
pub trait WireResponse: Default + Send + 'static {
    fn into_body(self) -> Result<ResponseBody>;
}

/// Opaque forwarded responses.
impl WireResponse for Bytes {
    fn into_body(self) -> Result<ResponseBody> {
        Ok(ResponseBody::from_bytes(self))
    }
}

/// Request and response of one call, owned by whoever is working on it.
///
/// [`finish`](Self::finish) consumes the state, so nothing can touch the
/// request or response after the answer went out.
pub struct CallState<Req, Resp> {
    pub request: Req,
    pub response: Resp,
    call: ServerCall,
}

impl<Req, Resp: WireResponse> CallState<Req, Resp> {
    pub fn new(call: ServerCall, request: Req) -> Self {
        Self {
            request,
            response: Resp::default(),
            call,
        }
    }

    pub fn method(&self) -> MethodId {
        self.call.method()
    }

    pub fn options(&self) -> &Arc<CallOptions> {
        self.call.options()
    }

    /// Answer the call: the response on `Ok`, the error otherwise.
    pub fn finish(self, status: Result<()>) {
        let Self { response, call, .. } = self;
        call.respond(status.and_then(|()| response.into_body()));
    }

    /// Store `result` as the response, then [`finish`](Self::finish).
    pub fn finish_with(mut self, result: Result<Resp>) {
        match result {
            Ok(response) => {
                self.response = response;
                self.finish(Ok(()));
            }
            Err(err) => self.finish(Err(err)),
        }
    }
}
