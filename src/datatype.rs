//! Describing data
//!
//! Messages are sequences of elements of a single type. A Rust type that may travel in a message
//! implements `Equivalence`; the trait is implemented for the primitive types and for arrays and
//! tuples of them. User types opt in with an empty `impl`:
//!
//! ```
//! use threadmpi::traits::Equivalence;
//!
//! #[derive(Copy, Clone, Debug, Default, PartialEq)]
//! struct Particle {
//!     position: [f64; 3],
//!     charge: i8,
//! }
//!
//! impl Equivalence for Particle {}
//! ```
//!
//! A `Buffer` describes a piece of memory that operations read from, a `BufferMut` one that
//! they write to. Both are implemented for single `Equivalence` values and for slices of them.
//!
//! On the way through the matcher the contents of a send buffer travel as a `Payload`, an owned
//! and type-erased copy of the elements that remembers their type. A receive checks that type
//! before writing to its buffer.

use std::any::{self, Any};
use std::fmt;
use std::slice;

use conv::ConvUtil;

use crate::error::{Error, Result};
use crate::Count;

/// Datatype traits
pub mod traits {
    pub use super::{Buffer, BufferMut, Equivalence};
}

/// A type whose values can be copied into a message.
///
/// Values are copied bitwise between participants, so the type has to be `Copy`. It also has to
/// be `Send` and `'static` since the copy outlives the sending call and crosses threads.
pub trait Equivalence: Copy + Send + 'static {}

macro_rules! equivalent_system_datatype {
    ($($rstype:ty),* $(,)?) => {
        $(
        impl Equivalence for $rstype {}
        )*
    }
}

equivalent_system_datatype!(
    bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
);

impl<T: Equivalence, const N: usize> Equivalence for [T; N] {}
impl<A: Equivalence, B: Equivalence> Equivalence for (A, B) {}
impl<A: Equivalence, B: Equivalence, C: Equivalence> Equivalence for (A, B, C) {}

/// A buffer that can be read from, e.g. the contents of a send.
pub trait Buffer {
    /// Element type of the buffer
    type Item: Equivalence;
    /// The elements of the buffer
    fn as_items(&self) -> &[Self::Item];
}

impl<T: Equivalence> Buffer for T {
    type Item = T;
    fn as_items(&self) -> &[T] {
        slice::from_ref(self)
    }
}

impl<T: Equivalence> Buffer for [T] {
    type Item = T;
    fn as_items(&self) -> &[T] {
        self
    }
}

/// A buffer that can be written to, e.g. the destination of a receive.
pub trait BufferMut: Buffer {
    /// The elements of the buffer
    fn as_items_mut(&mut self) -> &mut [Self::Item];
}

impl<T: Equivalence> BufferMut for T {
    fn as_items_mut(&mut self) -> &mut [T] {
        slice::from_mut(self)
    }
}

impl<T: Equivalence> BufferMut for [T] {
    fn as_items_mut(&mut self) -> &mut [T] {
        self
    }
}

/// Converts a buffer length to a `Count`.
pub(crate) fn count_of(len: usize) -> Result<Count> {
    len.value_as::<Count>().map_err(|_| Error::InvalidSize(len))
}

/// The owned, type-erased contents of a message
pub struct Payload {
    data: Box<dyn Any + Send>,
    count: Count,
    type_name: &'static str,
}

impl Payload {
    /// Copies the contents of `buf` into a new payload.
    pub fn from_buffer<B: Buffer + ?Sized>(buf: &B) -> Result<Payload> {
        Payload::from_vec(buf.as_items().to_vec())
    }

    /// Takes ownership of `items`.
    pub fn from_vec<T: Equivalence>(items: Vec<T>) -> Result<Payload> {
        let count = count_of(items.len())?;
        Ok(Payload {
            data: Box::new(items),
            count,
            type_name: any::type_name::<T>(),
        })
    }

    /// Number of elements in the payload
    pub fn count(&self) -> Count {
        self.count
    }

    /// Name of the element type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Unwraps the elements, if they are of type `T`.
    pub fn into_vec<T: Equivalence>(self) -> Result<Vec<T>> {
        let type_name = self.type_name;
        self.data
            .downcast::<Vec<T>>()
            .map(|items| *items)
            .map_err(|_| Error::TypeMismatch {
                expected: any::type_name::<T>(),
                sent: type_name,
            })
    }

    /// Copies as many elements as fit into `buf` and returns how many were copied.
    pub fn copy_into<T: Equivalence>(&self, buf: &mut [T]) -> Result<Count> {
        let items = self
            .data
            .downcast_ref::<Vec<T>>()
            .ok_or(Error::TypeMismatch {
                expected: any::type_name::<T>(),
                sent: self.type_name,
            })?;
        let n = items.len().min(buf.len());
        buf[..n].copy_from_slice(&items[..n]);
        count_of(n)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("count", &self.count)
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn single_values_are_buffers_of_one() {
        let x = 3.5f64;
        assert_eq!(x.as_items(), &[3.5]);
        let mut y = 0u8;
        y.as_items_mut()[0] = 9;
        assert_eq!(y, 9);
    }

    #[test]
    fn copy_into_truncates_to_the_shorter_side() {
        let payload = Payload::from_buffer(&[1i32, 2, 3, 4][..]).unwrap();
        assert_eq!(payload.count(), 4);

        let mut short = [0i32; 2];
        assert_eq!(payload.copy_into(&mut short[..]).unwrap(), 2);
        assert_eq!(short, [1, 2]);

        let mut long = [0i32; 6];
        assert_eq!(payload.copy_into(&mut long[..]).unwrap(), 4);
        assert_eq!(long, [1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn element_types_are_checked() {
        let payload = Payload::from_buffer(&[1u16, 2][..]).unwrap();
        let mut wrong = [0u32; 2];
        let err = payload.copy_into(&mut wrong[..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(payload.into_vec::<u16>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn arrays_travel_as_single_elements() {
        let rows = [[1u8, 2], [3, 4], [5, 6]];
        let payload = Payload::from_buffer(&rows[..]).unwrap();
        assert_eq!(payload.count(), 3);
        assert_eq!(payload.type_name(), any::type_name::<[u8; 2]>());
    }
}
