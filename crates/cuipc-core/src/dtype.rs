//! Element type definitions

/// Supported element types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    UInt8 = 0,
    Int8 = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    UInt64 = 6,
    Int64 = 7,
    Float16 = 8,
    Float32 = 9,
    Float64 = 10,
}

impl DType {
    /// Size in bytes
    pub const fn size(&self) -> usize {
        match self {
            DType::UInt8 | DType::Int8 => 1,
            DType::UInt16 | DType::Int16 | DType::Float16 => 2,
            DType::UInt32 | DType::Int32 | DType::Float32 => 4,
            DType::UInt64 | DType::Int64 | DType::Float64 => 8,
        }
    }

    /// Convert from u8
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DType::UInt8),
            1 => Some(DType::Int8),
            2 => Some(DType::UInt16),
            3 => Some(DType::Int16),
            4 => Some(DType::UInt32),
            5 => Some(DType::Int32),
            6 => Some(DType::UInt64),
            7 => Some(DType::Int64),
            8 => Some(DType::Float16),
            9 => Some(DType::Float32),
            10 => Some(DType::Float64),
            _ => None,
        }
    }

    /// Array interface type string (`"<i4"`, `"<f4"`, ...), little endian
    pub const fn typestr(&self) -> &'static str {
        match self {
            DType::UInt8 => "|u1",
            DType::Int8 => "|i1",
            DType::UInt16 => "<u2",
            DType::Int16 => "<i2",
            DType::UInt32 => "<u4",
            DType::Int32 => "<i4",
            DType::UInt64 => "<u8",
            DType::Int64 => "<i8",
            DType::Float16 => "<f2",
            DType::Float32 => "<f4",
            DType::Float64 => "<f8",
        }
    }

    /// Parse an array interface type string.
    ///
    /// Single byte types accept any byte order marker; wider types must be
    /// little endian or native (`=`).
    pub fn from_typestr(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        let order = chars.next()?;
        let kind = chars.next()?;
        let width: usize = chars.as_str().parse().ok()?;
        if width > 1 && !matches!(order, '<' | '=') {
            return None;
        }
        if !matches!(order, '<' | '>' | '=' | '|') {
            return None;
        }
        match (kind, width) {
            ('u', 1) => Some(DType::UInt8),
            ('i', 1) => Some(DType::Int8),
            ('u', 2) => Some(DType::UInt16),
            ('i', 2) => Some(DType::Int16),
            ('u', 4) => Some(DType::UInt32),
            ('i', 4) => Some(DType::Int32),
            ('u', 8) => Some(DType::UInt64),
            ('i', 8) => Some(DType::Int64),
            ('f', 2) => Some(DType::Float16),
            ('f', 4) => Some(DType::Float32),
            ('f', 8) => Some(DType::Float64),
            _ => None,
        }
    }
}

mod private {
    pub trait Sealed {}
}

/// Host element types that can be copied to and from device buffers byte for byte.
///
/// Sealed: every implementor is a primitive without padding or invalid bit
/// patterns.
pub trait Element: private::Sealed + Copy + Default + Send + Sync + 'static {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;
            }
        )*
    };
}

impl_element!(
    u8 => UInt8,
    i8 => Int8,
    u16 => UInt16,
    i16 => Int16,
    u32 => UInt32,
    i32 => Int32,
    u64 => UInt64,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
);

/// View host elements as bytes
pub(crate) fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // Safety: Element is sealed to padding-free primitives
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

/// View host elements as mutable bytes
pub(crate) fn as_bytes_mut<T: Element>(data: &mut [T]) -> &mut [u8] {
    // Safety: Element is sealed to primitives valid for every bit pattern
    unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, std::mem::size_of_val(data))
    }
}
