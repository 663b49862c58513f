//! Tensor response encoding.
//!
//! A response payload is
//!
//! ```text
//! [meta_len: u32 BE][meta: MsgPack][raw tensor bytes, slot order]
//! ```
//!
//! `meta` carries `send_start_micros` and one entry per slot with the
//! element type, shape and the length of that slot's raw bytes in the
//! tail. Bulk-copyable tensors go in the tail as is, so the encoder hands
//! the writer the tensors' own [`Bytes`] instead of copying them.
//! Non bulk-copyable tensors travel inside `meta` in serialized form and
//! take no tail bytes.

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use super::MsgPackCodec;
use crate::call::{ResponseBody, WireResponse};
use crate::error::{Result, WorkerError};
use crate::tensor::{DataType, SerializedTensor, Tensor};
use crate::transfer::{FusedTensorResponse, TensorPayload, TensorResponse, TensorSlot};

#[derive(Debug, Serialize, Deserialize)]
struct SlotMeta {
    is_dead: bool,
    dtype: DataType,
    shape: Vec<u64>,
    raw_len: u64,
    serialized: Option<SerializedTensor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseMeta {
    send_start_micros: i64,
    slots: Vec<SlotMeta>,
}

/// Encoder/decoder for tensor responses.
pub struct TensorCodec;

impl TensorCodec {
    /// Encode slots into response segments.
    pub fn encode(slots: Vec<TensorSlot>, send_start_micros: i64) -> Result<ResponseBody> {
        let mut metas = Vec::with_capacity(slots.len());
        let mut tails = Vec::with_capacity(slots.len());

        for slot in slots {
            let meta = match slot.payload {
                TensorPayload::Tensor(tensor) => {
                    let raw = match tensor.as_bytes() {
                        Some(bytes) => bytes.clone(),
                        None => {
                            // Element tensors can't go in the tail.
                            let serialized = tensor.to_serialized();
                            metas.push(SlotMeta {
                                is_dead: slot.is_dead,
                                dtype: serialized.dtype,
                                shape: serialized.shape.clone(),
                                raw_len: 0,
                                serialized: Some(serialized),
                            });
                            continue;
                        }
                    };
                    let meta = SlotMeta {
                        is_dead: slot.is_dead,
                        dtype: tensor.dtype(),
                        shape: tensor.shape().dims().to_vec(),
                        raw_len: raw.len() as u64,
                        serialized: None,
                    };
                    if !raw.is_empty() {
                        tails.push(raw);
                    }
                    meta
                }
                TensorPayload::Serialized(serialized) => SlotMeta {
                    is_dead: slot.is_dead,
                    dtype: serialized.dtype,
                    shape: serialized.shape.clone(),
                    raw_len: 0,
                    serialized: Some(serialized),
                },
            };
            metas.push(meta);
        }

        let meta = MsgPackCodec::encode(&ResponseMeta {
            send_start_micros,
            slots: metas,
        })?;
        let meta_len = u32::try_from(meta.len())
            .map_err(|_| WorkerError::Internal(format!("response metadata too large: {}", meta.len())))?;

        let mut segments = Vec::with_capacity(tails.len() + 2);
        segments.push(Bytes::copy_from_slice(&meta_len.to_be_bytes()));
        segments.push(Bytes::from(meta));
        segments.extend(tails);
        Ok(ResponseBody::new(segments))
    }

    /// Decode a payload produced by [`encode`](Self::encode).
    ///
    /// Tail tensors are slices of `payload`.
    pub fn decode(mut payload: Bytes) -> Result<(Vec<TensorSlot>, i64)> {
        if payload.len() < 4 {
            return Err(WorkerError::Protocol(format!(
                "tensor response too short: {} bytes",
                payload.len()
            )));
        }
        let meta_len = payload.get_u32() as usize;
        if meta_len > payload.len() {
            return Err(WorkerError::Protocol(format!(
                "tensor response metadata length {} exceeds payload {}",
                meta_len,
                payload.len()
            )));
        }
        let meta_bytes = payload.split_to(meta_len);
        let meta: ResponseMeta = MsgPackCodec::decode(&meta_bytes)?;

        let mut slots = Vec::with_capacity(meta.slots.len());
        for slot in meta.slots {
            let payload = match slot.serialized {
                Some(serialized) => TensorPayload::Serialized(serialized),
                None => {
                    let raw_len = usize::try_from(slot.raw_len).unwrap_or(usize::MAX);
                    if raw_len > payload.len() {
                        return Err(WorkerError::Protocol(format!(
                            "tensor tail needs {} bytes, {} left",
                            raw_len,
                            payload.len()
                        )));
                    }
                    let raw = payload.split_to(raw_len);
                    TensorPayload::Tensor(Tensor::from_bytes(slot.dtype, slot.shape, raw)?)
                }
            };
            slots.push(TensorSlot::new(payload, slot.is_dead));
        }

        if !payload.is_empty() {
            return Err(WorkerError::Protocol(format!(
                "{} trailing bytes after tensor response",
                payload.len()
            )));
        }
        Ok((slots, meta.send_start_micros))
    }
}

impl WireResponse for TensorResponse {
    fn into_body(self) -> Result<ResponseBody> {
        TensorCodec::encode(vec![self.slot], self.send_start_micros)
    }
}

impl WireResponse for FusedTensorResponse {
    fn into_body(self) -> Result<ResponseBody> {
        TensorCodec::encode(self.slots, self.send_start_micros)
    }
}

impl TensorResponse {
    /// Decode a `recv-tensor` response payload.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let (mut slots, send_start_micros) = TensorCodec::decode(payload)?;
        if slots.len() != 1 {
            return Err(WorkerError::Protocol(format!(
                "recv-tensor response has {} slots",
                slots.len()
            )));
        }
        let slot = slots.remove(0);
        Ok(Self {
            slot,
            send_start_micros,
        })
    }
}

impl FusedTensorResponse {
    /// Decode a `fused-recv-tensor` response payload.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let (slots, send_start_micros) = TensorCodec::decode(payload)?;
        Ok(Self {
            slots,
            send_start_micros,
        })
    }
}
