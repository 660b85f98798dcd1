//! Element types usable in communicator operations.
//!
//! [`Datatype`] is a sealed trait mapping Rust primitives to the datatype
//! tags understood by the MPI shim, and carrying the element-wise reduction
//! used by backends that reduce in Rust.
//!
//! | Rust Type | MPI Equivalent     | Tag Value |
//! |-----------|-------------------|-----------|
//! | `f32`     | `MPI_FLOAT`       | 0         |
//! | `f64`     | `MPI_DOUBLE`      | 1         |
//! | `i32`     | `MPI_INT32_T`     | 2         |
//! | `i64`     | `MPI_INT64_T`     | 3         |
//! | `u8`      | `MPI_UINT8_T`     | 4         |
//! | `u32`     | `MPI_UINT32_T`    | 5         |
//! | `u64`     | `MPI_UINT64_T`    | 6         |

use crate::ReduceOp;

mod sealed {
    pub trait Sealed {}
}

/// Tag values matching the `SHAN_MPI_*` defines in `csrc/shan_mpi.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DatatypeTag {
    /// 32-bit floating point (`MPI_FLOAT`)
    F32 = 0,
    /// 64-bit floating point (`MPI_DOUBLE`)
    F64 = 1,
    /// 32-bit signed integer (`MPI_INT32_T`)
    I32 = 2,
    /// 64-bit signed integer (`MPI_INT64_T`)
    I64 = 3,
    /// 8-bit unsigned integer (`MPI_UINT8_T`)
    U8 = 4,
    /// 32-bit unsigned integer (`MPI_UINT32_T`)
    U32 = 5,
    /// 64-bit unsigned integer (`MPI_UINT64_T`)
    U64 = 6,
}

/// Trait for element types of communicator operations.
///
/// This is a **sealed trait**: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`],
/// [`u32`] and [`u64`] implement it. Every implementor is plain old data, so
/// buffers can be viewed as bytes by in-process backends.
pub trait Datatype: sealed::Sealed + bytemuck::Pod + Send + Sync + 'static {
    /// The datatype tag used for FFI dispatch to the C layer.
    const TAG: DatatypeTag;

    /// Combine two values with a reduction operator.
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_integer_datatype {
    ($ty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl Datatype for $ty {
            const TAG: DatatypeTag = $tag;

            fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum => a.wrapping_add(b),
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Prod => a.wrapping_mul(b),
                }
            }
        }
    };
}

macro_rules! impl_float_datatype {
    ($ty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl Datatype for $ty {
            const TAG: DatatypeTag = $tag;

            fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Prod => a * b,
                }
            }
        }
    };
}

impl_float_datatype!(f32, DatatypeTag::F32);
impl_float_datatype!(f64, DatatypeTag::F64);
impl_integer_datatype!(i32, DatatypeTag::I32);
impl_integer_datatype!(i64, DatatypeTag::I64);
impl_integer_datatype!(u8, DatatypeTag::U8);
impl_integer_datatype!(u32, DatatypeTag::U32);
impl_integer_datatype!(u64, DatatypeTag::U64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datatype_tags_match_c_defines() {
        assert_eq!(f32::TAG as i32, 0);
        assert_eq!(f64::TAG as i32, 1);
        assert_eq!(i32::TAG as i32, 2);
        assert_eq!(i64::TAG as i32, 3);
        assert_eq!(u8::TAG as i32, 4);
        assert_eq!(u32::TAG as i32, 5);
        assert_eq!(u64::TAG as i32, 6);
    }

    #[test]
    fn integer_reductions() {
        assert_eq!(i64::reduce(3, 9, ReduceOp::Max), 9);
        assert_eq!(i32::reduce(-3, 9, ReduceOp::Min), -3);
        assert_eq!(u8::reduce(200, 100, ReduceOp::Sum), 44);
        assert_eq!(u64::reduce(6, 7, ReduceOp::Prod), 42);
    }

    #[test]
    fn float_reductions() {
        assert_eq!(f64::reduce(1.5, -2.0, ReduceOp::Max), 1.5);
        assert_eq!(f32::reduce(1.5, 2.5, ReduceOp::Sum), 4.0);
    }
}
