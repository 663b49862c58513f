//! Payload codecs.
//!
//! - [`MsgPackCodec`] - requests and response metadata, via `rmp-serde`
//!   (`to_vec_named`, so structs are maps)
//! - [`TensorCodec`] - tensor responses: MsgPack metadata followed by the
//!   raw tensor bytes
//!
//! Codecs are marker structs with static methods rather than trait objects.
//!
//! # Example
//!
//! ```
//! use rendezvous_worker::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;
mod tensor;

pub use msgpack::MsgPackCodec;
pub use tensor::TensorCodec;
