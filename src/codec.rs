//! MessagePack framing of request and reply payloads
//!
//! # Request layout
//!
//! A request is a stream of independently encoded MessagePack values, not a
//! single container:
//!
//! ```text
//! N | bin_0 .. bin_{N-1} | marker | flag | rank_0 .. rank_{N-1} | dims.. | mask dims..
//! ```
//!
//! Ranks are not nested with their shapes, so slicing the trailing dimension
//! list needs the ranks; dtypes are not transmitted at all and come from the
//! model's input layout ([`InputSpec`]).
//!
//! # Reply layout
//!
//! A reply is one map:
//! `{Outputs: {name: bin}, OutputRanks: [..], OutputShapes: [[..]], OutputDataTypes: [..]}`.

use crate::dtype::DType;
use crate::error::{BridgeError, Result};
use crate::tensor::{TensorDescriptor, TensorSet};
use ndarray::{ArrayD, IxDyn};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Marker identifying the request encoding scheme
pub const FORMAT_MARKER: &str = "json";

const KEY_OUTPUTS: &str = "Outputs";
const KEY_RANKS: &str = "OutputRanks";
const KEY_SHAPES: &str = "OutputShapes";
const KEY_DTYPES: &str = "OutputDataTypes";

/// One model input as declared by the model configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub dtype: DType,
}

impl InputSpec {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Everything a module sends to the engine in one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub tensors: TensorSet,
    pub marker: String,
    pub flag: bool,
    /// Extent of the all-true mask; only the dimensions travel
    pub mask_shape: Option<Vec<usize>>,
}

impl RequestFrame {
    pub fn new(tensors: TensorSet) -> Self {
        Self {
            tensors,
            marker: FORMAT_MARKER.to_string(),
            flag: true,
            mask_shape: None,
        }
    }

    pub fn with_mask(mut self, shape: Vec<usize>) -> Self {
        self.mask_shape = Some(shape);
        self
    }

    pub fn with_flag(mut self, flag: bool) -> Self {
        self.flag = flag;
        self
    }

    /// The mask as a native array
    pub fn mask(&self) -> Option<ArrayD<bool>> {
        self.mask_shape
            .as_ref()
            .map(|shape| ArrayD::from_elem(IxDyn(shape), true))
    }
}

fn encode_error<E: Display>(err: E) -> BridgeError {
    BridgeError::Format(format!("encode failed: {}", err))
}

fn write_uint(buf: &mut Vec<u8>, value: usize) -> Result<()> {
    rmp::encode::write_uint(buf, value as u64)
        .map(|_| ())
        .map_err(encode_error)
}

/// Encode a request into the value stream described in the module docs
pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>> {
    let payload_bytes: usize = frame.tensors.iter().map(|t| t.data().len() + 5).sum();
    let mut buf = Vec::with_capacity(payload_bytes + 64);

    write_uint(&mut buf, frame.tensors.len())?;
    for tensor in &frame.tensors {
        rmp::encode::write_bin(&mut buf, tensor.data()).map_err(encode_error)?;
    }
    rmp::encode::write_str(&mut buf, &frame.marker).map_err(encode_error)?;
    rmp::encode::write_bool(&mut buf, frame.flag).map_err(encode_error)?;
    for tensor in &frame.tensors {
        write_uint(&mut buf, tensor.rank())?;
    }
    for tensor in &frame.tensors {
        for &dim in tensor.shape() {
            write_uint(&mut buf, dim)?;
        }
    }
    if let Some(mask) = &frame.mask_shape {
        for &dim in mask {
            write_uint(&mut buf, dim)?;
        }
    }

    Ok(buf)
}

fn next_value(cursor: &mut &[u8], what: &str) -> Result<Value> {
    if cursor.is_empty() {
        return Err(BridgeError::Format(format!("payload ends before {}", what)));
    }
    rmpv::decode::read_value(cursor)
        .map_err(|e| BridgeError::Format(format!("cannot decode {}: {}", what, e)))
}

fn as_usize(value: &Value, what: &str) -> Result<usize> {
    value
        .as_u64()
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| BridgeError::Format(format!("{} is not a non-negative integer", what)))
}

/// Decode a request; `inputs` supplies names and dtypes in encoding order
pub fn decode_request(payload: &[u8], inputs: &[InputSpec]) -> Result<RequestFrame> {
    let mut cursor = payload;

    let count = as_usize(&next_value(&mut cursor, "tensor count")?, "tensor count")?;
    if count != inputs.len() {
        return Err(BridgeError::Format(format!(
            "request carries {} tensors, model declares {}",
            count,
            inputs.len()
        )));
    }

    let mut buffers = Vec::with_capacity(count);
    for input in inputs {
        let value = next_value(&mut cursor, &input.name)?;
        let Value::Binary(bytes) = value else {
            return Err(BridgeError::Format(format!(
                "tensor '{}' is not a binary value",
                input.name
            )));
        };
        buffers.push(bytes);
    }

    let marker = next_value(&mut cursor, "format marker")?;
    let marker = marker
        .as_str()
        .ok_or_else(|| BridgeError::Format("format marker is not a string".into()))?
        .to_string();
    let flag = next_value(&mut cursor, "flag")?
        .as_bool()
        .ok_or_else(|| BridgeError::Format("flag is not a boolean".into()))?;

    let mut ranks = Vec::with_capacity(count);
    for input in inputs {
        let what = format!("rank of '{}'", input.name);
        ranks.push(as_usize(&next_value(&mut cursor, &what)?, &what)?);
    }

    let mut dims = Vec::new();
    while !cursor.is_empty() {
        dims.push(as_usize(&next_value(&mut cursor, "dimension")?, "dimension")?);
    }
    let needed = ranks
        .iter()
        .try_fold(0usize, |acc, &rank| acc.checked_add(rank))
        .ok_or_else(|| BridgeError::Format("sum of tensor ranks overflows".into()))?;
    if dims.len() < needed {
        return Err(BridgeError::Format(format!(
            "ranks need {} dimensions, request has {}",
            needed,
            dims.len()
        )));
    }

    let mut tensors = TensorSet::new();
    let mut offset = 0;
    for ((input, bytes), rank) in inputs.iter().zip(buffers).zip(ranks) {
        let shape = dims[offset..offset + rank].to_vec();
        offset += rank;
        tensors.insert(TensorDescriptor::new(input.name.clone(), input.dtype, shape, bytes)?)?;
    }
    let mask_shape = (offset < dims.len()).then(|| dims[offset..].to_vec());

    Ok(RequestFrame {
        tensors,
        marker,
        flag,
        mask_shape,
    })
}

/// Encode engine outputs as the reply record
pub fn encode_reply(outputs: &TensorSet) -> Result<Vec<u8>> {
    let count = outputs.len() as u32;
    let mut buf = Vec::with_capacity(outputs.iter().map(|t| t.data().len() + 32).sum::<usize>() + 64);

    rmp::encode::write_map_len(&mut buf, 4).map_err(encode_error)?;

    rmp::encode::write_str(&mut buf, KEY_OUTPUTS).map_err(encode_error)?;
    rmp::encode::write_map_len(&mut buf, count).map_err(encode_error)?;
    for tensor in outputs {
        rmp::encode::write_str(&mut buf, tensor.name()).map_err(encode_error)?;
        rmp::encode::write_bin(&mut buf, tensor.data()).map_err(encode_error)?;
    }

    rmp::encode::write_str(&mut buf, KEY_RANKS).map_err(encode_error)?;
    rmp::encode::write_array_len(&mut buf, count).map_err(encode_error)?;
    for tensor in outputs {
        write_uint(&mut buf, tensor.rank())?;
    }

    rmp::encode::write_str(&mut buf, KEY_SHAPES).map_err(encode_error)?;
    rmp::encode::write_array_len(&mut buf, count).map_err(encode_error)?;
    for tensor in outputs {
        rmp::encode::write_array_len(&mut buf, tensor.rank() as u32).map_err(encode_error)?;
        for &dim in tensor.shape() {
            write_uint(&mut buf, dim)?;
        }
    }

    rmp::encode::write_str(&mut buf, KEY_DTYPES).map_err(encode_error)?;
    rmp::encode::write_array_len(&mut buf, count).map_err(encode_error)?;
    for tensor in outputs {
        rmp::encode::write_sint(&mut buf, i64::from(tensor.dtype().code())).map_err(encode_error)?;
    }

    Ok(buf)
}

fn field<'a>(record: &'a [(Value, Value)], key: &str) -> Result<&'a Value> {
    record
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
        .ok_or_else(|| BridgeError::Format(format!("reply has no '{}' field", key)))
}

fn array<'a>(value: &'a Value, what: &str) -> Result<&'a [Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| BridgeError::Format(format!("'{}' is not an array", what)))
}

/// Decode the engine's reply record into named output tensors
pub fn decode_reply(payload: &[u8]) -> Result<TensorSet> {
    let mut cursor = payload;
    let record = next_value(&mut cursor, "reply record")?;
    if !cursor.is_empty() {
        return Err(BridgeError::Format(format!(
            "{} trailing bytes after reply record",
            cursor.len()
        )));
    }
    let record = record
        .as_map()
        .ok_or_else(|| BridgeError::Format("reply is not a map".into()))?;

    let outputs = field(record, KEY_OUTPUTS)?
        .as_map()
        .ok_or_else(|| BridgeError::Format(format!("'{}' is not a map", KEY_OUTPUTS)))?;
    let ranks = array(field(record, KEY_RANKS)?, KEY_RANKS)?;
    let shapes = array(field(record, KEY_SHAPES)?, KEY_SHAPES)?;
    let dtypes = array(field(record, KEY_DTYPES)?, KEY_DTYPES)?;

    let count = outputs.len();
    if ranks.len() != count || shapes.len() != count || dtypes.len() != count {
        return Err(BridgeError::Format(format!(
            "reply lists {} outputs, {} ranks, {} shapes, {} dtypes",
            count,
            ranks.len(),
            shapes.len(),
            dtypes.len()
        )));
    }

    let mut set = TensorSet::new();
    for (i, (name, bytes)) in outputs.iter().enumerate() {
        let name = name
            .as_str()
            .ok_or_else(|| BridgeError::Format(format!("output {} has no string name", i)))?;
        let bytes = bytes
            .as_slice()
            .ok_or_else(|| BridgeError::Format(format!("output '{}' is not binary", name)))?;

        let rank = as_usize(&ranks[i], KEY_RANKS)?;
        let shape = array(&shapes[i], KEY_SHAPES)?
            .iter()
            .map(|d| as_usize(d, KEY_SHAPES))
            .collect::<Result<Vec<_>>>()?;
        if shape.len() != rank {
            return Err(BridgeError::Format(format!(
                "output '{}' has rank {} but {} dimensions",
                name,
                rank,
                shape.len()
            )));
        }
        let code = dtypes[i]
            .as_i64()
            .ok_or_else(|| BridgeError::Format(format!("dtype of '{}' is not an integer", name)))?;
        let dtype = DType::from_code(code)?;

        set.insert_received(TensorDescriptor::new(name, dtype, shape, bytes.to_vec())?)?;
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_request() -> RequestFrame {
        let image: Vec<f32> = (0..12).map(|v| v as f32 * 0.25).collect();
        let tensors = TensorSet::from_descriptors(vec![
            TensorDescriptor::from_elements("image", vec![1, 3, 2, 2], &image).unwrap(),
            TensorDescriptor::from_elements("threshold", vec![1], &[0.5f32]).unwrap(),
        ])
        .unwrap();
        RequestFrame::new(tensors).with_mask(vec![2, 2])
    }

    fn scenario_inputs() -> Vec<InputSpec> {
        vec![
            InputSpec::new("image", DType::Float32),
            InputSpec::new("threshold", DType::Float32),
        ]
    }

    fn read_all(payload: &[u8]) -> Vec<Value> {
        let mut cursor = payload;
        let mut values = Vec::new();
        while !cursor.is_empty() {
            values.push(rmpv::decode::read_value(&mut cursor).unwrap());
        }
        values
    }

    #[test]
    fn test_request_round_trip() {
        let request = scenario_request();
        let payload = encode_request(&request).unwrap();
        let decoded = decode_request(&payload, &scenario_inputs()).unwrap();

        assert_eq!(decoded, request);
        let image = decoded.tensors.get("image").unwrap();
        assert_eq!(image.shape(), &[1, 3, 2, 2]);
        assert_eq!(image.to_vec::<f32>().unwrap()[11], 2.75);
        assert_eq!(
            decoded.tensors.get("threshold").unwrap().to_vec::<f32>().unwrap(),
            vec![0.5]
        );
        let mask = decoded.mask().unwrap();
        assert_eq!(mask.shape(), &[2, 2]);
        assert!(mask.iter().all(|&m| m));
    }

    #[test]
    fn test_request_value_positions() {
        let payload = encode_request(&scenario_request()).unwrap();
        let values = read_all(&payload);

        // N, 2 buffers, marker, flag, 2 ranks, 4 + 1 dims, 2 mask dims
        assert_eq!(values.len(), 1 + 2 + 1 + 1 + 2 + 5 + 2);
        assert_eq!(values[0].as_u64(), Some(2));
        assert_eq!(values[1].as_slice().unwrap().len(), 48);
        assert_eq!(values[2].as_slice().unwrap(), &0.5f32.to_ne_bytes());
        assert_eq!(values[3].as_str(), Some(FORMAT_MARKER));
        assert_eq!(values[4].as_bool(), Some(true));
        let trailer: Vec<u64> = values[5..].iter().map(|v| v.as_u64().unwrap()).collect();
        assert_eq!(trailer, vec![4, 1, 1, 3, 2, 2, 1, 2, 2]);
    }

    #[test]
    fn test_request_without_mask() {
        let mut request = scenario_request();
        request.mask_shape = None;
        let request = request.with_flag(false);
        let payload = encode_request(&request).unwrap();
        let decoded = decode_request(&payload, &scenario_inputs()).unwrap();
        assert_eq!(decoded.mask_shape, None);
        assert!(!decoded.flag);
    }

    #[test]
    fn test_request_layout_mismatch() {
        let payload = encode_request(&scenario_request()).unwrap();
        let err = decode_request(&payload, &scenario_inputs()[..1]).unwrap_err();
        assert!(err.is_format_error());

        let wrong_dtype = vec![
            InputSpec::new("image", DType::Float64),
            InputSpec::new("threshold", DType::Float32),
        ];
        let err = decode_request(&payload, &wrong_dtype).unwrap_err();
        assert!(matches!(err, BridgeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_reply_boxes_scenario() {
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let boxes = TensorDescriptor::from_elements("boxes", vec![4, 6], &values).unwrap();
        let reply = encode_reply(&TensorSet::from_descriptors(vec![boxes]).unwrap()).unwrap();

        let outputs = decode_reply(&reply).unwrap();
        assert_eq!(outputs.len(), 1);
        let boxes = outputs.get("boxes").unwrap();
        assert_eq!(boxes.shape(), &[4, 6]);
        assert_eq!(boxes.dtype(), DType::Float32);
        assert_eq!(boxes.to_vec::<f32>().unwrap(), values);
    }

    #[test]
    fn test_reply_round_trip_mixed_dtypes() {
        let set = TensorSet::from_descriptors(vec![
            TensorDescriptor::from_elements("scores", vec![3], &[0.9f64, 0.5, 0.1]).unwrap(),
            TensorDescriptor::from_elements("classes", vec![3, 1], &[1i64, 7, 2]).unwrap(),
            TensorDescriptor::from_elements("count", vec![], &[3u32]).unwrap(),
        ])
        .unwrap();
        let decoded = decode_reply(&encode_reply(&set).unwrap()).unwrap();
        assert_eq!(decoded, set);
    }

    fn reply_with(shape: Vec<u64>, rank: u64, byte_len: usize) -> Vec<u8> {
        let record = Value::Map(vec![
            (
                Value::from(KEY_OUTPUTS),
                Value::Map(vec![(Value::from("boxes"), Value::Binary(vec![0u8; byte_len]))]),
            ),
            (Value::from(KEY_RANKS), Value::Array(vec![Value::from(rank)])),
            (
                Value::from(KEY_SHAPES),
                Value::Array(vec![Value::Array(shape.into_iter().map(Value::from).collect())]),
            ),
            (Value::from(KEY_DTYPES), Value::Array(vec![Value::from(1)])),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &record).unwrap();
        buf
    }

    #[test]
    fn test_reply_shape_disagrees_with_buffer() {
        let ok = reply_with(vec![4, 6], 2, 96);
        assert!(decode_reply(&ok).is_ok());

        let err = decode_reply(&reply_with(vec![4, 6], 2, 92)).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ShapeMismatch { expected: 96, got: 92, .. }
        ));
        assert!(err.is_format_error());

        let err = decode_reply(&reply_with(vec![4, 6], 3, 96)).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_reply_with_overflowing_shape() {
        let err = decode_reply(&reply_with(vec![1 << 62, 16], 2, 4)).unwrap_err();
        assert!(err.is_format_error());

        let err = decode_reply(&reply_with(vec![u64::MAX, u64::MAX], 2, 0)).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_request_with_overflowing_ranks() {
        let mut payload = Vec::new();
        rmp::encode::write_uint(&mut payload, 2).unwrap();
        rmp::encode::write_bin(&mut payload, &[0u8; 4]).unwrap();
        rmp::encode::write_bin(&mut payload, &[0u8; 4]).unwrap();
        rmp::encode::write_str(&mut payload, FORMAT_MARKER).unwrap();
        rmp::encode::write_bool(&mut payload, true).unwrap();
        rmp::encode::write_uint(&mut payload, u64::MAX).unwrap();
        rmp::encode::write_uint(&mut payload, 2).unwrap();
        rmp::encode::write_uint(&mut payload, 1).unwrap();

        let err = decode_request(&payload, &scenario_inputs()).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_reply_with_repeated_output_name() {
        let entry = || (Value::from("x"), Value::Binary(vec![0u8; 4]));
        let record = Value::Map(vec![
            (Value::from(KEY_OUTPUTS), Value::Map(vec![entry(), entry()])),
            (
                Value::from(KEY_RANKS),
                Value::Array(vec![Value::from(1), Value::from(1)]),
            ),
            (
                Value::from(KEY_SHAPES),
                Value::Array(vec![
                    Value::Array(vec![Value::from(1)]),
                    Value::Array(vec![Value::from(1)]),
                ]),
            ),
            (
                Value::from(KEY_DTYPES),
                Value::Array(vec![Value::from(1), Value::from(1)]),
            ),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &record).unwrap();

        let err = decode_reply(&buf).unwrap_err();
        assert!(err.is_format_error());
        assert!(!matches!(err, BridgeError::DuplicateTensor(_)));
    }

    #[test]
    fn test_reply_must_be_a_record() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(vec![Value::from(1)])).unwrap();
        assert!(decode_reply(&buf).unwrap_err().is_format_error());

        assert!(decode_reply(&[]).unwrap_err().is_format_error());

        let mut trailing = reply_with(vec![4, 6], 2, 96);
        trailing.push(0xc0);
        assert!(decode_reply(&trailing).unwrap_err().is_format_error());

        let mut missing = Vec::new();
        rmpv::encode::write_value(
            &mut missing,
            &Value::Map(vec![(Value::from(KEY_OUTPUTS), Value::Map(vec![]))]),
        )
        .unwrap();
        assert!(decode_reply(&missing).unwrap_err().is_format_error());
    }
}
