//! Conversion between native arrays, descriptors and the FFI aggregate
//!
//! [`TensorValue`] is the typed, native side: one `ndarray::ArrayD` per dtype.
//! [`TensorDescriptor`] is the flat side. [`InputAggregate`] and
//! [`read_aggregate`] bridge descriptors to the fixed-layout `tensors_struct`
//! consumed by the inference engine.
//!
//! # Ownership
//!
//! The aggregate never owns the tensor bytes it points at. An
//! [`InputAggregate`] borrows its [`TensorSet`], so the borrow checker keeps
//! the bytes alive for as long as the aggregate can be handed to the engine.
//! Output aggregates point into engine-owned memory that stays valid until
//! `runtime_inference_cleanup`; [`read_aggregate`] copies out of it.

use crate::dtype::DType;
use crate::error::{BridgeError, Result};
use crate::tensor::{checked_byte_len, checked_element_count, Element, TensorDescriptor, TensorSet};
use ndarray::{ArrayD, IxDyn};
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

/// A native n-dimensional array of one of the supported dtypes
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Int8(ArrayD<i8>),
    UInt8(ArrayD<u8>),
    Int16(ArrayD<i16>),
    UInt16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    UInt32(ArrayD<u32>),
    Int64(ArrayD<i64>),
    UInt64(ArrayD<u64>),
    Bool(ArrayD<bool>),
    String(ArrayD<String>),
}

macro_rules! with_array {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            TensorValue::Float32($arr) => $body,
            TensorValue::Float64($arr) => $body,
            TensorValue::Int8($arr) => $body,
            TensorValue::UInt8($arr) => $body,
            TensorValue::Int16($arr) => $body,
            TensorValue::UInt16($arr) => $body,
            TensorValue::Int32($arr) => $body,
            TensorValue::UInt32($arr) => $body,
            TensorValue::Int64($arr) => $body,
            TensorValue::UInt64($arr) => $body,
            TensorValue::Bool($arr) => $body,
            TensorValue::String($arr) => $body,
        }
    };
}

macro_rules! impl_from_array {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<ArrayD<$ty>> for TensorValue {
                fn from(array: ArrayD<$ty>) -> Self {
                    TensorValue::$variant(array)
                }
            }
        )*
    };
}

impl_from_array! {
    f32 => Float32,
    f64 => Float64,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    bool => Bool,
    String => String,
}

fn pack<T: Element>(name: String, array: &ArrayD<T>) -> Result<TensorDescriptor> {
    let mut data = Vec::with_capacity(array.len() * T::DTYPE.width());
    // `iter` walks logical row-major order whatever the memory layout
    for &value in array.iter() {
        value.write_ne(&mut data);
    }
    TensorDescriptor::new(name, T::DTYPE, array.shape().to_vec(), data)
}

fn unpack<T: Element>(descriptor: &TensorDescriptor) -> Result<ArrayD<T>> {
    let values = descriptor.to_vec::<T>()?;
    ArrayD::from_shape_vec(IxDyn(descriptor.shape()), values)
        .map_err(|e| BridgeError::Format(format!("tensor '{}': {}", descriptor.name(), e)))
}

impl TensorValue {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::Float32(_) => DType::Float32,
            TensorValue::Float64(_) => DType::Float64,
            TensorValue::Int8(_) => DType::Int8,
            TensorValue::UInt8(_) => DType::UInt8,
            TensorValue::Int16(_) => DType::Int16,
            TensorValue::UInt16(_) => DType::UInt16,
            TensorValue::Int32(_) => DType::Int32,
            TensorValue::UInt32(_) => DType::UInt32,
            TensorValue::Int64(_) => DType::Int64,
            TensorValue::UInt64(_) => DType::UInt64,
            TensorValue::Bool(_) => DType::Bool,
            TensorValue::String(_) => DType::String,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, array => array.shape())
    }

    /// Flatten into a descriptor named `name`
    pub fn to_descriptor(&self, name: impl Into<String>) -> Result<TensorDescriptor> {
        let name = name.into();
        match self {
            TensorValue::Float32(a) => pack(name, a),
            TensorValue::Float64(a) => pack(name, a),
            TensorValue::Int8(a) => pack(name, a),
            TensorValue::UInt8(a) => pack(name, a),
            TensorValue::Int16(a) => pack(name, a),
            TensorValue::UInt16(a) => pack(name, a),
            TensorValue::Int32(a) => pack(name, a),
            TensorValue::UInt32(a) => pack(name, a),
            TensorValue::Int64(a) => pack(name, a),
            TensorValue::UInt64(a) => pack(name, a),
            TensorValue::Bool(a) => pack(name, a),
            TensorValue::String(a) => {
                let values: Vec<&str> = a.iter().map(String::as_str).collect();
                TensorDescriptor::from_strings(name, a.shape().to_vec(), &values)
            }
        }
    }

    /// Rebuild the native array a descriptor describes
    pub fn from_descriptor(descriptor: &TensorDescriptor) -> Result<Self> {
        Ok(match descriptor.dtype() {
            DType::Float32 => TensorValue::Float32(unpack(descriptor)?),
            DType::Float64 => TensorValue::Float64(unpack(descriptor)?),
            DType::Int8 => TensorValue::Int8(unpack(descriptor)?),
            DType::UInt8 => TensorValue::UInt8(unpack(descriptor)?),
            DType::Int16 => TensorValue::Int16(unpack(descriptor)?),
            DType::UInt16 => TensorValue::UInt16(unpack(descriptor)?),
            DType::Int32 => TensorValue::Int32(unpack(descriptor)?),
            DType::UInt32 => TensorValue::UInt32(unpack(descriptor)?),
            DType::Int64 => TensorValue::Int64(unpack(descriptor)?),
            DType::UInt64 => TensorValue::UInt64(unpack(descriptor)?),
            DType::Bool => TensorValue::Bool(unpack(descriptor)?),
            DType::String => {
                let values = descriptor.strings()?;
                let array = ArrayD::from_shape_vec(IxDyn(descriptor.shape()), values)
                    .map_err(|e| {
                        BridgeError::Format(format!("tensor '{}': {}", descriptor.name(), e))
                    })?;
                TensorValue::String(array)
            }
        })
    }

    /// Borrow the `f32` array, if that is what this holds
    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            TensorValue::Float32(a) => Some(a),
            _ => None,
        }
    }
}

/// Marshal named native arrays into an ordered [`TensorSet`]
pub fn marshal_set<I, S>(values: I) -> Result<TensorSet>
where
    I: IntoIterator<Item = (S, TensorValue)>,
    S: Into<String>,
{
    let mut set = TensorSet::new();
    for (name, value) in values {
        set.insert(value.to_descriptor(name)?)?;
    }
    Ok(set)
}

/// Unmarshal a [`TensorSet`] into named native arrays, preserving order
pub fn unmarshal_set(set: &TensorSet) -> Result<Vec<(String, TensorValue)>> {
    set.iter()
        .map(|d| Ok((d.name().to_string(), TensorValue::from_descriptor(d)?)))
        .collect()
}

/// Fixed-layout tensor aggregate shared with the inference engine
/// (`tensors_struct` on the C side).
#[repr(C)]
#[derive(Debug)]
pub struct RawTensors {
    pub num_tensors: usize,
    pub names: *mut *mut c_char,
    pub data_types: *mut c_int,
    pub ranks: *mut usize,
    pub shapes: *mut *mut usize,
    pub data: *mut *mut c_void,
}

impl RawTensors {
    /// Zeroed aggregate for the engine to fill
    pub fn empty() -> Self {
        Self {
            num_tensors: 0,
            names: ptr::null_mut(),
            data_types: ptr::null_mut(),
            ranks: ptr::null_mut(),
            shapes: ptr::null_mut(),
            data: ptr::null_mut(),
        }
    }
}

impl Default for RawTensors {
    fn default() -> Self {
        Self::empty()
    }
}

/// `char*` table backing one string tensor
struct StringTable {
    _owned: Vec<CString>,
    _ptrs: Vec<*const c_char>,
}

/// Input aggregate borrowing a [`TensorSet`].
///
/// Owns the parallel metadata arrays; the tensor bytes stay in the set.
pub struct InputAggregate<'a> {
    raw: RawTensors,
    _names: Vec<CString>,
    _name_ptrs: Vec<*mut c_char>,
    _data_types: Vec<c_int>,
    _ranks: Vec<usize>,
    _shapes: Vec<Vec<usize>>,
    _shape_ptrs: Vec<*mut usize>,
    strings: Vec<StringTable>,
    _data_ptrs: Vec<*mut c_void>,
    _set: PhantomData<&'a TensorSet>,
}

impl<'a> InputAggregate<'a> {
    pub fn new(set: &'a TensorSet) -> Result<Self> {
        let count = set.len();
        let mut names = Vec::with_capacity(count);
        let mut data_types = Vec::with_capacity(count);
        let mut ranks = Vec::with_capacity(count);
        let mut shapes: Vec<Vec<usize>> = Vec::with_capacity(count);
        let mut strings = Vec::new();
        let mut data_ptrs = Vec::with_capacity(count);

        for tensor in set {
            let name = CString::new(tensor.name()).map_err(|_| {
                BridgeError::Format(format!("tensor name '{}' contains a NUL", tensor.name()))
            })?;
            names.push(name);
            data_types.push(tensor.dtype().code() as c_int);
            ranks.push(tensor.rank());
            shapes.push(tensor.shape().to_vec());

            if tensor.dtype() == DType::String {
                let owned = tensor
                    .strings()?
                    .into_iter()
                    .map(|s| CString::new(s).map_err(|e| BridgeError::Format(e.to_string())))
                    .collect::<Result<Vec<_>>>()?;
                let ptrs: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();
                // Heap buffer of `ptrs` does not move when the table is pushed
                data_ptrs.push(ptrs.as_ptr() as *mut c_void);
                strings.push(StringTable {
                    _owned: owned,
                    _ptrs: ptrs,
                });
            } else {
                data_ptrs.push(tensor.data().as_ptr() as *mut c_void);
            }
        }

        let mut name_ptrs: Vec<*mut c_char> =
            names.iter().map(|n| n.as_ptr() as *mut c_char).collect();
        let mut shape_ptrs: Vec<*mut usize> =
            shapes.iter_mut().map(|s| s.as_mut_ptr()).collect();

        let raw = RawTensors {
            num_tensors: count,
            names: name_ptrs.as_mut_ptr(),
            data_types: data_types.as_mut_ptr(),
            ranks: ranks.as_mut_ptr(),
            shapes: shape_ptrs.as_mut_ptr(),
            data: data_ptrs.as_mut_ptr(),
        };

        Ok(Self {
            raw,
            _names: names,
            _name_ptrs: name_ptrs,
            _data_types: data_types,
            _ranks: ranks,
            _shapes: shapes,
            _shape_ptrs: shape_ptrs,
            strings,
            _data_ptrs: data_ptrs,
            _set: PhantomData,
        })
    }

    /// Pointer handed to `runtime_inference_execution`
    pub fn as_mut_ptr(&mut self) -> *mut RawTensors {
        &mut self.raw
    }

    pub fn raw(&self) -> &RawTensors {
        &self.raw
    }

    /// Number of string tensors passed as `char*` tables
    pub fn string_tensor_count(&self) -> usize {
        self.strings.len()
    }
}

/// Copy an engine-filled aggregate into an owned [`TensorSet`].
///
/// # Safety
/// Every non-null pointer in `raw` must be valid for the extents its
/// `num_tensors`, `ranks` and `shapes` entries declare, names must be
/// NUL-terminated, and string tensors must point at `char*` tables.
pub unsafe fn read_aggregate(raw: &RawTensors) -> Result<TensorSet> {
    let count = raw.num_tensors;
    if count == 0 {
        return Ok(TensorSet::new());
    }
    if raw.names.is_null()
        || raw.data_types.is_null()
        || raw.ranks.is_null()
        || raw.shapes.is_null()
        || raw.data.is_null()
    {
        return Err(BridgeError::Format(format!(
            "aggregate declares {} tensors but has null arrays",
            count
        )));
    }

    let names = std::slice::from_raw_parts(raw.names, count);
    let data_types = std::slice::from_raw_parts(raw.data_types, count);
    let ranks = std::slice::from_raw_parts(raw.ranks, count);
    let shapes = std::slice::from_raw_parts(raw.shapes, count);
    let data = std::slice::from_raw_parts(raw.data, count);

    let mut set = TensorSet::new();
    for i in 0..count {
        if names[i].is_null() {
            return Err(BridgeError::Format(format!("tensor {} has no name", i)));
        }
        let name = CStr::from_ptr(names[i])
            .to_str()
            .map_err(|_| BridgeError::Format(format!("tensor {} name is not UTF-8", i)))?
            .to_string();
        let dtype = DType::from_code(i64::from(data_types[i]))?;

        let shape = if ranks[i] == 0 {
            Vec::new()
        } else if shapes[i].is_null() {
            return Err(BridgeError::Format(format!("tensor '{}' has no shape", name)));
        } else {
            std::slice::from_raw_parts(shapes[i], ranks[i]).to_vec()
        };
        let elements = checked_element_count(&shape).ok_or_else(|| {
            BridgeError::Format(format!("shape {:?} of tensor '{}' overflows", shape, name))
        })?;

        if elements > 0 && data[i].is_null() {
            return Err(BridgeError::Format(format!("tensor '{}' has no data", name)));
        }

        let descriptor = if dtype == DType::String {
            let ptrs: &[*const c_char] = if elements == 0 {
                &[]
            } else {
                std::slice::from_raw_parts(data[i] as *const *const c_char, elements)
            };
            let values = ptrs
                .iter()
                .map(|&p| {
                    if p.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(p).to_string_lossy().into_owned()
                    }
                })
                .collect::<Vec<_>>();
            TensorDescriptor::from_strings(name, shape, &values)?
        } else {
            let len = checked_byte_len(&name, &shape, dtype)?;
            let bytes = if len == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(data[i] as *const u8, len).to_vec()
            };
            TensorDescriptor::new(name, dtype, shape, bytes)?
        };
        set.insert_received(descriptor)?;
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array, ArrayD};

    fn sample_values() -> Vec<(&'static str, TensorValue)> {
        vec![
            (
                "tensor1",
                Array::from_shape_vec(IxDyn(&[1, 11]), (0..11).map(|v| v as f32).collect())
                    .unwrap()
                    .into(),
            ),
            (
                "tensor2",
                Array::from_shape_vec(IxDyn(&[20, 1]), (-20..0).map(|v| v as i8).collect())
                    .unwrap()
                    .into(),
            ),
            (
                "tensor3",
                Array::from_shape_vec(IxDyn(&[5, 5]), (0..25).map(|v| v as f64 / 7.0).collect())
                    .unwrap()
                    .into(),
            ),
            (
                "tensor4",
                Array::from_shape_vec(IxDyn(&[1, 2, 3, 4]), (0..24).map(|v| v % 3 == 0).collect())
                    .unwrap()
                    .into(),
            ),
        ]
    }

    #[test]
    fn test_value_descriptor_round_trip() {
        for (name, value) in sample_values() {
            let descriptor = value.to_descriptor(name).unwrap();
            assert_eq!(descriptor.dtype(), value.dtype());
            assert_eq!(descriptor.shape(), value.shape());
            assert_eq!(TensorValue::from_descriptor(&descriptor).unwrap(), value);
        }
    }

    #[test]
    fn test_non_standard_layout_is_flattened_row_major() {
        let array = Array::from_shape_vec(IxDyn(&[2, 3]), vec![1u16, 2, 3, 4, 5, 6]).unwrap();
        let transposed: ArrayD<u16> = array.t().to_owned();
        let value = TensorValue::from(array.t().to_owned());
        let descriptor = value.to_descriptor("t").unwrap();
        assert_eq!(descriptor.shape(), &[3, 2]);
        assert_eq!(descriptor.to_vec::<u16>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
        assert_eq!(TensorValue::from_descriptor(&descriptor).unwrap(), TensorValue::UInt16(transposed));
    }

    #[test]
    fn test_aggregate_round_trip() {
        let set = marshal_set(sample_values()).unwrap();
        let mut aggregate = InputAggregate::new(&set).unwrap();
        assert!(!aggregate.as_mut_ptr().is_null());
        assert_eq!(aggregate.raw().num_tensors, 4);

        let copied = unsafe { read_aggregate(aggregate.raw()) }.unwrap();
        assert_eq!(copied, set);

        let native = unmarshal_set(&copied).unwrap();
        let names: Vec<&str> = native.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["tensor1", "tensor2", "tensor3", "tensor4"]);
        for ((_, got), (_, want)) in native.iter().zip(sample_values()) {
            assert_eq!(got, &want);
        }
    }

    #[test]
    fn test_aggregate_metadata_layout() {
        let set = marshal_set(vec![(
            "nms_sensitivity",
            TensorValue::from(arr1(&[0.5f32]).into_dyn()),
        )])
        .unwrap();
        let aggregate = InputAggregate::new(&set).unwrap();
        let raw = aggregate.raw();
        unsafe {
            assert_eq!(*raw.data_types, DType::Float32.code());
            assert_eq!(*raw.ranks, 1);
            assert_eq!(**raw.shapes, 1);
            assert_eq!(*(*raw.data as *const f32), 0.5);
            assert_eq!(CStr::from_ptr(*raw.names).to_str().unwrap(), "nms_sensitivity");
        }
    }

    #[test]
    fn test_string_tensor_through_aggregate() {
        let labels = Array::from_shape_vec(
            IxDyn(&[2]),
            vec!["person".to_string(), "bicycle".to_string()],
        )
        .unwrap();
        let set = marshal_set(vec![("labels", TensorValue::from(labels.clone()))]).unwrap();
        let aggregate = InputAggregate::new(&set).unwrap();
        assert_eq!(aggregate.string_tensor_count(), 1);

        let copied = unsafe { read_aggregate(aggregate.raw()) }.unwrap();
        let native = unmarshal_set(&copied).unwrap();
        assert_eq!(native[0].1, TensorValue::String(labels));
    }

    #[test]
    fn test_read_aggregate_rejects_null_arrays() {
        let mut raw = RawTensors::empty();
        assert!(unsafe { read_aggregate(&raw) }.unwrap().is_empty());

        raw.num_tensors = 1;
        let err = unsafe { read_aggregate(&raw) }.unwrap_err();
        assert!(err.is_format_error());
    }
}
