//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with `to_vec_named`: structs go out as maps keyed by field
//! name, so clients can add fields without breaking older workers.
//!
//! # Example
//!
//! ```
//! use rendezvous_worker::codec::MsgPackCodec;
//! use rendezvous_worker::service::RecvTensorRequest;
//!
//! let req = RecvTensorRequest {
//!     step_id: 7,
//!     rendezvous_key: "k".to_string(),
//!     recv_req_start_micros: 0,
//! };
//! let encoded = MsgPackCodec::encode(&req).unwrap();
//! let decoded: RecvTensorRequest = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, req);
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
