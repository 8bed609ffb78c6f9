//! Shaped, non-owning views over engine-owned numeric memory.
//!
//! The optimizer hands every array argument over as a bare pointer plus an
//! element count. This module is the only place where such pointers become
//! slices. Everything above it works with:
//!
//! - [`BufferView`] / [`BufferViewMut`]: a flat region of `f64` or `i32`
//!   elements, valid for one callback invocation only
//! - [`Coordinates`] / [`CoordinatesMut`]: the region reshaped as one column per
//!   atom (a 3 × N nalgebra view, which is exactly the row-major N × 3 layout
//!   the engine uses)
//!
//! Shape requests whose element count does not match the region are protocol
//! violations and panic. They are never turned into recoverable errors.

use nalgebra::{DMatrixViewMut, MatrixView3xX, MatrixViewMut3xX};
use std::fmt;

/// Per-atom coordinates (or gradients) borrowed from a flat buffer.
///
/// Column `i` holds the x, y and z components of atom `i`.
pub type Coordinates<'a> = MatrixView3xX<'a, f64>;

/// Mutable counterpart of [`Coordinates`].
pub type CoordinatesMut<'a> = MatrixViewMut3xX<'a, f64>;

/// Numeric kind of a buffer element as declared by the binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericKind {
    /// `real(c_double)`
    Float64,
    /// `integer(c_int)`
    Int32,
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericKind::Float64 => write!(f, "f64"),
            NumericKind::Int32 => write!(f, "i32"),
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for i32 {}
}

/// Element types that may cross the engine boundary.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + sealed::Sealed + 'static {
    /// Kind tag for this element type.
    const KIND: NumericKind;
}

impl Element for f64 {
    const KIND: NumericKind = NumericKind::Float64;
}

impl Element for i32 {
    const KIND: NumericKind = NumericKind::Int32;
}

/// Read-only view over an engine-owned array.
#[derive(Debug, Clone, Copy)]
pub struct BufferView<'a, T: Element> {
    data: &'a [T],
}

/// Read-write view over an engine-owned array.
///
/// Writes land in engine memory immediately; nothing is buffered.
#[derive(Debug)]
pub struct BufferViewMut<'a, T: Element> {
    data: &'a mut [T],
}

impl<'a, T: Element> BufferView<'a, T> {
    /// Wraps an existing slice.
    pub fn new(data: &'a [T]) -> Self {
        Self { data }
    }

    /// Wraps `len` elements starting at `ptr`.
    ///
    /// A zero-length view ignores `ptr` entirely, since the engine is free to
    /// pass any address for an empty array.
    ///
    /// # Safety
    ///
    /// For `len > 0`, `ptr` must point to `len` initialised elements that stay
    /// valid and are not written by anyone else for `'a`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is null while `len > 0`.
    pub unsafe fn from_raw(ptr: *const T, len: usize) -> Self {
        if len == 0 {
            return Self { data: &[] };
        }
        assert!(!ptr.is_null(), "engine passed a null {} array of length {}", T::KIND, len);
        Self {
            data: unsafe { std::slice::from_raw_parts(ptr, len) },
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Numeric kind of the elements.
    pub fn kind(&self) -> NumericKind {
        T::KIND
    }

    /// Flat access.
    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }
}

impl<'a> BufferView<'a, f64> {
    /// Reshapes the buffer as `len / 3` atoms.
    ///
    /// # Panics
    ///
    /// Panics if the length is not a multiple of three.
    pub fn atoms(&self) -> Coordinates<'a> {
        let natoms = atom_count(self.data.len());
        Coordinates::from_slice(self.data, natoms)
    }
}

impl<'a, T: Element> BufferViewMut<'a, T> {
    /// Wraps an existing mutable slice.
    pub fn new(data: &'a mut [T]) -> Self {
        Self { data }
    }

    /// Wraps `len` elements starting at `ptr` for reading and writing.
    ///
    /// # Safety
    ///
    /// For `len > 0`, `ptr` must point to `len` elements that stay valid and
    /// are not accessed through any other path for `'a`. The elements may be
    /// uninitialised only if the caller overwrites them before reading.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is null while `len > 0`.
    pub unsafe fn from_raw(ptr: *mut T, len: usize) -> Self {
        if len == 0 {
            return Self::new(&mut []);
        }
        assert!(!ptr.is_null(), "engine passed a null {} array of length {}", T::KIND, len);
        Self::new(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Numeric kind of the elements.
    pub fn kind(&self) -> NumericKind {
        T::KIND
    }

    /// Flat read access.
    pub fn as_slice(&self) -> &[T] {
        &*self.data
    }

    /// Flat write access.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut *self.data
    }

    /// Overwrites every element with `value`.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Copies `values` into the buffer element by element.
    ///
    /// # Panics
    ///
    /// Panics if the lengths differ.
    pub fn write_all(&mut self, values: &[T]) {
        assert_eq!(
            values.len(),
            self.data.len(),
            "cannot write {} values into a {} buffer of length {}",
            values.len(),
            T::KIND,
            self.data.len()
        );
        self.data.copy_from_slice(values);
    }
}

impl<'a> BufferViewMut<'a, f64> {
    /// Read-only per-atom reshape.
    pub fn atoms(&self) -> Coordinates<'_> {
        let natoms = atom_count(self.data.len());
        Coordinates::from_slice(&*self.data, natoms)
    }

    /// Writable per-atom reshape.
    ///
    /// # Panics
    ///
    /// Panics if the length is not a multiple of three.
    pub fn atoms_mut(&mut self) -> CoordinatesMut<'_> {
        let natoms = atom_count(self.data.len());
        CoordinatesMut::from_slice(&mut *self.data, natoms)
    }

    /// Splits a `2 × natoms × 3` buffer into one writable view per state.
    ///
    /// # Panics
    ///
    /// Panics unless the length is `6 × natoms`.
    pub fn states_mut(&mut self) -> [CoordinatesMut<'_>; 2] {
        assert!(
            self.data.len() % 2 == 0,
            "two-state buffer of odd length {}",
            self.data.len()
        );
        let half = self.data.len() / 2;
        let natoms = atom_count(half);
        let (first, second) = self.data.split_at_mut(half);
        [
            CoordinatesMut::from_slice(first, natoms),
            CoordinatesMut::from_slice(second, natoms),
        ]
    }

    /// Reshapes an `n × n` buffer as a square matrix in column-major order.
    ///
    /// # Panics
    ///
    /// Panics unless the length is `n * n`.
    pub fn square_mut(&mut self, n: usize) -> DMatrixViewMut<'_, f64> {
        let expected = n
            .checked_mul(n)
            .unwrap_or_else(|| panic!("square dimension {} overflows", n));
        assert_eq!(
            self.data.len(),
            expected,
            "buffer of length {} cannot be viewed as {}x{}",
            self.data.len(),
            n,
            n
        );
        DMatrixViewMut::from_slice(&mut *self.data, n, n)
    }
}

/// Number of atoms held by a flat coordinate buffer of `len` elements.
fn atom_count(len: usize) -> usize {
    assert!(
        len % 3 == 0,
        "coordinate buffer length {} is not a multiple of 3",
        len
    );
    len / 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, Matrix3xX};

    #[test]
    fn test_roundtrip_preserves_exact_values() {
        let original = [
            0.1, -2.5e-12, 3.0, 1.0 / 3.0, f64::MAX, -0.0, 7.25, f64::MIN_POSITIVE, 1e300,
        ];
        let mut engine = [f64::NAN; 9];

        {
            let mut view = BufferViewMut::new(&mut engine);
            let source = Matrix3xX::from_column_slice(&original);
            view.atoms_mut().copy_from(&source);
        }

        let view = BufferView::new(&engine);
        let atoms = view.atoms();
        assert_eq!(atoms.ncols(), 3);
        for (i, value) in original.iter().enumerate() {
            assert_eq!(atoms[(i % 3, i / 3)].to_bits(), value.to_bits());
        }
    }

    #[test]
    fn test_atoms_follow_row_major_layout() {
        let flat = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let view = BufferView::new(&flat);
        let atoms = view.atoms();
        assert_eq!(atoms.ncols(), 2);
        assert_eq!((atoms[(0, 0)], atoms[(1, 0)], atoms[(2, 0)]), (1.0, 2.0, 3.0));
        assert_eq!((atoms[(0, 1)], atoms[(1, 1)], atoms[(2, 1)]), (4.0, 5.0, 6.0));
    }

    #[test]
    fn test_writes_reach_underlying_memory_immediately() {
        let mut flat = [0.0; 6];
        let mut view = BufferViewMut::new(&mut flat);
        view.atoms_mut()[(2, 1)] = 9.0;
        assert_eq!(view.as_slice()[5], 9.0);
        view.fill(1.0);
        assert_eq!(flat, [1.0; 6]);
    }

    #[test]
    fn test_states_split_into_halves() {
        let mut flat = [0.0; 12];
        {
            let mut view = BufferViewMut::new(&mut flat);
            let [mut first, mut second] = view.states_mut();
            first.fill(1.0);
            second.fill(2.0);
        }
        assert_eq!(&flat[..6], &[1.0; 6]);
        assert_eq!(&flat[6..], &[2.0; 6]);
    }

    #[test]
    fn test_square_view_is_column_major() {
        let mut flat = [0.0; 4];
        let mut view = BufferViewMut::new(&mut flat);
        let source = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        view.square_mut(2).copy_from(&source);
        assert_eq!(flat, [1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_zero_length_raw_view_ignores_pointer() {
        let view = unsafe { BufferView::<i32>::from_raw(std::ptr::null(), 0) };
        assert!(view.is_empty());
        assert_eq!(view.kind(), NumericKind::Int32);
    }

    #[test]
    #[should_panic(expected = "not a multiple of 3")]
    fn test_mismatched_shape_is_a_contract_violation() {
        let flat = [0.0; 4];
        let _ = BufferView::new(&flat).atoms();
    }

    #[test]
    #[should_panic(expected = "cannot be viewed as 3x3")]
    fn test_square_view_rejects_wrong_length() {
        let mut flat = [0.0; 8];
        let _ = BufferViewMut::new(&mut flat).square_mut(3);
    }
}
