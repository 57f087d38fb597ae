//! Flat tensor descriptors and ordered tensor sets
//!
//! A [`TensorDescriptor`] is the language-independent form of one tensor:
//! name, dtype, shape and the exact row-major bytes. Everything that crosses
//! a process or FFI boundary is expressed in terms of descriptors.

use crate::dtype::DType;
use crate::error::{BridgeError, Result};

/// Number of elements described by a shape (1 for a scalar)
#[inline]
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Element count of a shape received from a peer; `None` on overflow
#[inline]
pub fn checked_element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Byte length of a fixed-width tensor, rejecting shapes that overflow `usize`
pub(crate) fn checked_byte_len(name: &str, shape: &[usize], dtype: DType) -> Result<usize> {
    checked_element_count(shape)
        .and_then(|count| count.checked_mul(dtype.width()))
        .ok_or_else(|| {
            BridgeError::Format(format!(
                "shape {:?} of tensor '{}' overflows the addressable size",
                shape, name
            ))
        })
}

/// Fixed-width element type that can be packed into a descriptor
pub trait Element: Copy + 'static {
    const DTYPE: DType;

    /// Append the native-endian bytes of `self`
    fn write_ne(self, out: &mut Vec<u8>);

    /// Read one element from exactly `DTYPE.width()` bytes
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn write_ne(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element! {
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
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    #[inline]
    fn write_ne(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// One tensor: name, dtype, shape and raw row-major bytes.
///
/// For fixed-width dtypes `data.len() == element_count(shape) * dtype.width()`
/// always holds. String tensors store each element as UTF-8 followed by a
/// NUL byte.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorDescriptor {
    /// Build a descriptor from raw bytes, validating the length against the shape
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<Self> {
        let name = name.into();

        if dtype.is_fixed_width() {
            let expected = checked_byte_len(&name, &shape, dtype)?;
            if data.len() != expected {
                return Err(BridgeError::ShapeMismatch {
                    name,
                    expected,
                    got: data.len(),
                });
            }
        } else {
            let count = checked_element_count(&shape).ok_or_else(|| {
                BridgeError::Format(format!("shape {:?} of tensor '{}' overflows", shape, name))
            })?;
            let terminators = data.iter().filter(|&&b| b == 0).count();
            if terminators != count || data.last().map_or(count != 0, |&b| b != 0) {
                return Err(BridgeError::Format(format!(
                    "string tensor '{}' holds {} terminated strings, shape needs {}",
                    name, terminators, count
                )));
            }
            if std::str::from_utf8(&data).is_err() {
                return Err(BridgeError::Format(format!(
                    "string tensor '{}' is not valid UTF-8",
                    name
                )));
            }
        }

        Ok(Self {
            name,
            dtype,
            shape,
            data,
        })
    }

    /// Pack a typed slice laid out in row-major order
    pub fn from_elements<T: Element>(
        name: impl Into<String>,
        shape: Vec<usize>,
        values: &[T],
    ) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.width());
        for &value in values {
            value.write_ne(&mut data);
        }
        Self::new(name, T::DTYPE, shape, data)
    }

    /// Pack string elements laid out in row-major order
    pub fn from_strings<S: AsRef<str>>(
        name: impl Into<String>,
        shape: Vec<usize>,
        values: &[S],
    ) -> Result<Self> {
        let name = name.into();
        let mut data = Vec::new();
        for value in values {
            let value = value.as_ref();
            if value.as_bytes().contains(&0) {
                return Err(BridgeError::Format(format!(
                    "string tensor '{}' contains an interior NUL",
                    name
                )));
            }
            data.extend_from_slice(value.as_bytes());
            data.push(0);
        }
        Self::new(name, DType::String, shape, data)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    /// Raw bytes, row-major
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Unpack into typed elements; fails if `T` does not match the dtype
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(BridgeError::Format(format!(
                "tensor '{}' is {}, requested {}",
                self.name,
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.width())
            .map(T::read_ne)
            .collect())
    }

    /// Unpack a string tensor
    pub fn strings(&self) -> Result<Vec<String>> {
        if self.dtype != DType::String {
            return Err(BridgeError::Format(format!(
                "tensor '{}' is {}, not string",
                self.name, self.dtype
            )));
        }
        // Validated as UTF-8 with one terminator per element in `new`
        Ok(self
            .data
            .split(|&b| b == 0)
            .take(self.element_count())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }
}

/// Insertion-ordered set of uniquely named tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorSet {
    tensors: Vec<TensorDescriptor>,
}

impl TensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate names
    pub fn from_descriptors<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = TensorDescriptor>,
    {
        let mut set = Self::new();
        for descriptor in descriptors {
            set.insert(descriptor)?;
        }
        Ok(set)
    }

    /// Append a tensor; its position is the encoding position
    pub fn insert(&mut self, descriptor: TensorDescriptor) -> Result<()> {
        if self.get(descriptor.name()).is_some() {
            return Err(BridgeError::DuplicateTensor(descriptor.name));
        }
        self.tensors.push(descriptor);
        Ok(())
    }

    /// Append a tensor received from a peer; a repeated name is a malformed payload
    pub(crate) fn insert_received(&mut self, descriptor: TensorDescriptor) -> Result<()> {
        if self.get(descriptor.name()).is_some() {
            return Err(BridgeError::Format(format!(
                "output name '{}' appears more than once",
                descriptor.name
            )));
        }
        self.tensors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TensorDescriptor> {
        self.tensors.iter().find(|t| t.name() == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TensorDescriptor> {
        self.tensors.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.name())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// First tensor in insertion order
    pub fn first(&self) -> Option<&TensorDescriptor> {
        self.tensors.first()
    }
}

impl IntoIterator for TensorSet {
    type Item = TensorDescriptor;
    type IntoIter = std::vec::IntoIter<TensorDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl<'a> IntoIterator for &'a TensorSet {
    type Item = &'a TensorDescriptor;
    type IntoIter = std::slice::Iter<'a, TensorDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}
