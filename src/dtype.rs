//! Tensor element types and their stable wire codes

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::raw::c_char;

/// Element type of a tensor.
///
/// The discriminants are the integer codes used on the wire and in the FFI
/// aggregate. Code 10 is reserved and never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum DType {
    Float32 = 1,
    UInt8 = 2,
    Int8 = 3,
    UInt16 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    String = 8,
    Bool = 9,
    Float64 = 11,
    UInt32 = 12,
    UInt64 = 13,
}

impl DType {
    /// Every dtype, in code order
    pub const ALL: [DType; 12] = [
        DType::Float32,
        DType::UInt8,
        DType::Int8,
        DType::UInt16,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::String,
        DType::Bool,
        DType::Float64,
        DType::UInt32,
        DType::UInt64,
    ];

    /// Wire code of this dtype
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a dtype by wire code
    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|dtype| i64::from(dtype.code()) == code)
            .ok_or(BridgeError::UnknownDType(code))
    }

    /// Size of one element in bytes.
    ///
    /// For `String` this is the width of a `char*`, which is only meaningful
    /// inside the FFI aggregate.
    #[inline]
    pub fn width(self) -> usize {
        match self {
            DType::UInt8 | DType::Int8 | DType::Bool => 1,
            DType::UInt16 | DType::Int16 => 2,
            DType::Float32 | DType::Int32 | DType::UInt32 => 4,
            DType::Float64 | DType::Int64 | DType::UInt64 => 8,
            DType::String => std::mem::size_of::<*const c_char>(),
        }
    }

    /// Whether `data.len() == element_count * width()` holds for this dtype
    #[inline]
    pub fn is_fixed_width(self) -> bool {
        self != DType::String
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::UInt8 => "uint8",
            DType::Int8 => "int8",
            DType::UInt16 => "uint16",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::String => "string",
            DType::Bool => "bool",
            DType::Float64 => "float64",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
