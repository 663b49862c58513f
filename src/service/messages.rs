//! Request messages of the two transfer methods.

use serde::{Deserialize, Serialize};

/// `recv-tensor` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvTensorRequest {
    pub step_id: i64,
    pub rendezvous_key: String,
    /// Client clock when the request was issued; 0 when unknown.
    #[serde(default)]
    pub recv_req_start_micros: i64,
}

/// `fused-recv-tensor` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedRecvTensorRequest {
    pub step_id: i64,
    pub rendezvous_keys: Vec<String>,
    #[serde(default)]
    pub recv_req_start_micros: i64,
}
