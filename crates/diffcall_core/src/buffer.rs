//! Buffer views over runtime-owned memory and owning buffers for callback results.
//!
//! Inputs handed over by the external runtime are wrapped as [`ArrayView`]s: they
//! borrow the memory for the duration of one call and never release it. Results
//! produced by a host callback are [`OwnedArray`]s: they carry a release hook
//! that runs exactly once, either when the array is dropped or right after its
//! contents have been copied into the caller's output buffer.

use std::fmt;
use std::ptr::{self, NonNull};

use nalgebra::DMatrix;

use crate::error::{BridgeError, BridgeResult};
use crate::traits::{Element, Real};

/// Per-dimension extents and element strides of an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
    strides: Vec<usize>,
}

impl Shape {
    /// Row-major contiguous layout.
    pub fn contiguous(dims: &[usize]) -> Self {
        let mut strides = vec![0; dims.len()];
        let mut acc = 1;
        for (stride, &dim) in strides.iter_mut().zip(dims).rev() {
            *stride = acc;
            acc *= dim;
        }
        Self {
            dims: dims.to_vec(),
            strides,
        }
    }

    pub fn vector(len: usize) -> Self {
        Self::contiguous(&[len])
    }

    pub fn strided(dims: &[usize], strides: &[usize]) -> BridgeResult<Self> {
        if dims.len() != strides.len() {
            return Err(BridgeError::shape("stride rank", dims.len(), strides.len()));
        }
        Ok(Self {
            dims: dims.to_vec(),
            strides: strides.to_vec(),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the largest memory offset reachable through this shape.
    pub fn span(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        1 + self
            .dims
            .iter()
            .zip(&self.strides)
            .map(|(&dim, &stride)| (dim - 1) * stride)
            .sum::<usize>()
    }

    pub fn is_contiguous(&self) -> bool {
        *self == Shape::contiguous(&self.dims)
    }

    fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.dims.len() {
            return None;
        }
        let mut offset = 0;
        for ((&i, &dim), &stride) in index.iter().zip(&self.dims).zip(&self.strides) {
            if i >= dim {
                return None;
            }
            offset += i * stride;
        }
        Some(offset)
    }

    /// Memory offset of the `flat`-th element in logical row-major order.
    fn offset_of_flat(&self, mut flat: usize) -> usize {
        let mut offset = 0;
        for (&dim, &stride) in self.dims.iter().zip(&self.strides).rev() {
            offset += (flat % dim) * stride;
            flat /= dim;
        }
        offset
    }
}

/// Non-owning view over memory that belongs to someone else.
///
/// The lifetime ties the view to the call that created it, so a callback
/// receiving one cannot stash it anywhere that outlives the call.
#[derive(Debug, Clone)]
pub struct ArrayView<'a, T: Element> {
    data: &'a [T],
    shape: Shape,
}

impl<'a, T: Element> ArrayView<'a, T> {
    pub fn from_slice(data: &'a [T]) -> Self {
        Self {
            data,
            shape: Shape::vector(data.len()),
        }
    }

    pub fn with_shape(data: &'a [T], shape: Shape) -> BridgeResult<Self> {
        if shape.span() > data.len() {
            return Err(BridgeError::shape("view span", shape.span(), data.len()));
        }
        Ok(Self { data, shape })
    }

    /// Wraps `shape.span()` elements starting at `ptr` without copying.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `shape.span()` elements for `'a`, and
    /// the memory must not be mutated while the view exists.
    pub unsafe fn from_raw(ptr: *const T, shape: Shape) -> Self {
        let span = shape.span();
        let data = if span == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(ptr, span)
        };
        Self { data, shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.shape.offset(index).map(|offset| self.data[offset])
    }

    /// Elements in logical row-major order.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len()).map(move |flat| self.data[self.shape.offset_of_flat(flat)])
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    pub fn as_slice(&self) -> Option<&'a [T]> {
        let data: &'a [T] = self.data;
        self.shape
            .is_contiguous()
            .then(|| &data[..self.shape.len()])
    }
}

type ReleaseHook<T> = Box<dyn FnOnce(NonNull<T>, usize) + Send>;

/// Buffer allocated on the bridge side, released exactly once.
pub struct OwnedArray<T: Element> {
    ptr: NonNull<T>,
    len: usize,
    shape: Shape,
    release: Option<ReleaseHook<T>>,
}

// The array owns its allocation exclusively; the hook is `Send`.
unsafe impl<T: Element> Send for OwnedArray<T> {}
unsafe impl<T: Element> Sync for OwnedArray<T> {}

impl<T: Element> OwnedArray<T> {
    pub fn from_vec(data: Vec<T>, dims: &[usize]) -> BridgeResult<Self> {
        let shape = Shape::contiguous(dims);
        if shape.len() != data.len() {
            return Err(BridgeError::shape("owned array dims", shape.len(), data.len()));
        }
        let boxed = data.into_boxed_slice();
        let len = boxed.len();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<T>();
        // SAFETY: `ptr` and `len` come from the boxed slice leaked just above.
        Ok(unsafe {
            Self::from_raw_parts(ptr, &[len], |ptr, len| {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)));
            })
            .with_shape_unchecked(shape)
        })
    }

    pub fn vector(data: Vec<T>) -> Self {
        let len = data.len();
        match Self::from_vec(data, &[len]) {
            Ok(array) => array,
            Err(_) => unreachable!("vector dims always match the data length"),
        }
    }

    /// Takes ownership of `dims.iter().product()` contiguous elements at `ptr`.
    /// `release` receives the pointer and element count exactly once.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of the full element count until `release`
    /// runs, and nothing else may free it.
    pub unsafe fn from_raw_parts<F>(ptr: NonNull<T>, dims: &[usize], release: F) -> Self
    where
        F: FnOnce(NonNull<T>, usize) + Send + 'static,
    {
        let shape = Shape::contiguous(dims);
        Self {
            ptr,
            len: shape.len(),
            shape,
            release: Some(Box::new(release)),
        }
    }

    fn with_shape_unchecked(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: guaranteed by the constructors until the hook runs in `drop`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Copies the flattened contents into `out` and releases the buffer.
    /// On a length mismatch `out` is left untouched.
    pub fn copy_into(self, out: &mut [T]) -> BridgeResult<()> {
        if self.len != out.len() {
            return Err(BridgeError::shape("callback result", out.len(), self.len));
        }
        out.copy_from_slice(self.as_slice());
        Ok(())
    }

    pub fn into_vec(self) -> Vec<T> {
        self.as_slice().to_vec()
    }
}

impl<T: Element + nalgebra::Scalar> OwnedArray<T> {
    /// Flattens a matrix in row-major order, one row per time point.
    pub fn from_matrix(matrix: &DMatrix<T>) -> Self {
        let (rows, cols) = matrix.shape();
        let data: Vec<T> = (0..rows)
            .flat_map(|i| (0..cols).map(move |j| matrix[(i, j)]))
            .collect();
        match Self::from_vec(data, &[rows, cols]) {
            Ok(array) => array,
            Err(_) => unreachable!("matrix shape always matches its element count"),
        }
    }
}

impl<T: Element> Drop for OwnedArray<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.ptr, self.len);
        }
    }
}

impl<T: Element> fmt::Debug for OwnedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedArray")
            .field("shape", &self.shape)
            .field("data", &self.as_slice())
            .finish()
    }
}

/// Sanity-check array `[0, 1, ..., count - 1]` backed by a raw allocation
/// that is handed back through its release hook.
pub fn diagnostic_array(count: usize) -> OwnedArray<Real> {
    let values: Box<[Real]> = (0..count).map(|n| n as Real).collect();
    let ptr = NonNull::from(Box::leak(values)).cast::<Real>();
    // SAFETY: the allocation was leaked above and is reclaimed only by the hook.
    unsafe {
        OwnedArray::from_raw_parts(ptr, &[count], |ptr, len| {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)));
            tracing::debug!(len, "released diagnostic array");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted(data: Vec<f64>, dims: &[usize], releases: &Arc<AtomicUsize>) -> OwnedArray<f64> {
        let counter = Arc::clone(releases);
        let len = data.len();
        let ptr = NonNull::from(Box::leak(data.into_boxed_slice())).cast::<f64>();
        assert_eq!(dims.iter().product::<usize>(), len);
        unsafe {
            OwnedArray::from_raw_parts(ptr, dims, move |ptr, len| {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)));
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[test]
    fn contiguous_shape_has_row_major_strides() {
        let shape = Shape::contiguous(&[3, 2]);
        assert_eq!(shape.strides(), &[2, 1]);
        assert_eq!(shape.len(), 6);
        assert_eq!(shape.span(), 6);
        assert!(shape.is_contiguous());
    }

    #[test]
    fn strided_shape_rejects_rank_mismatch() {
        let err = Shape::strided(&[2, 2], &[1]).unwrap_err();
        assert!(matches!(err, BridgeError::ShapeMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn empty_shape_has_zero_span() {
        let shape = Shape::contiguous(&[0, 4]);
        assert!(shape.is_empty());
        assert_eq!(shape.span(), 0);
    }

    #[test]
    fn strided_view_reads_a_column() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let column = Shape::strided(&[3], &[2]).expect("shape");
        let view = ArrayView::with_shape(&data[1..], column).expect("view");
        assert_eq!(view.to_vec(), vec![2.0, 4.0, 6.0]);
        assert!(view.as_slice().is_none());
    }

    #[test]
    fn transposed_view_iterates_in_logical_order() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        // 2x3 matrix stored as its 3x2 transpose.
        let shape = Shape::strided(&[2, 3], &[1, 2]).expect("shape");
        let view = ArrayView::with_shape(&data, shape).expect("view");
        assert_eq!(view.to_vec(), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
        assert_eq!(view.get(&[1, 2]), Some(6.0));
        assert_eq!(view.get(&[2, 0]), None);
    }

    #[test]
    fn view_rejects_span_beyond_data() {
        let data = [1.0, 2.0];
        let err = ArrayView::with_shape(&data, Shape::vector(3)).unwrap_err();
        assert!(matches!(err, BridgeError::ShapeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn raw_view_borrows_without_copying() {
        let data = vec![0.5, 1.5, 2.5];
        let view = unsafe { ArrayView::from_raw(data.as_ptr(), Shape::vector(3)) };
        let slice = view.as_slice().expect("contiguous");
        assert_eq!(slice.as_ptr(), data.as_ptr());
        assert_eq!(slice, &[0.5, 1.5, 2.5]);
    }

    #[test]
    fn raw_view_of_zero_elements_ignores_pointer() {
        let view = unsafe { ArrayView::<f64>::from_raw(ptr::null(), Shape::vector(0)) };
        assert!(view.is_empty());
        assert_eq!(view.to_vec(), Vec::<f64>::new());
    }

    #[test]
    fn owned_array_releases_once_on_drop() {
        let releases = Arc::new(AtomicUsize::new(0));
        let array = counted(vec![1.0, 2.0], &[2], &releases);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        drop(array);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn copy_into_releases_after_copy() {
        let releases = Arc::new(AtomicUsize::new(0));
        let array = counted(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2], &releases);
        let mut out = [0.0; 6];
        array.copy_into(&mut out).expect("copy");
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn copy_into_rejects_short_result_without_writing() {
        let releases = Arc::new(AtomicUsize::new(0));
        let array = counted(vec![1.0, 2.0, 3.0, 4.0, 5.0], &[5], &releases);
        let mut out = [-1.0; 6];
        let err = array.copy_into(&mut out).unwrap_err();
        assert!(matches!(err, BridgeError::ShapeMismatch { expected: 6, actual: 5, .. }));
        assert_eq!(out, [-1.0; 6]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_vec_checks_dims() {
        let err = OwnedArray::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]).unwrap_err();
        assert!(matches!(err, BridgeError::ShapeMismatch { expected: 4, actual: 3, .. }));

        let array = OwnedArray::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).expect("array");
        assert_eq!(array.shape().dims(), &[2, 2]);
        assert_eq!(array.into_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn from_matrix_flattens_row_major() {
        let matrix = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let array = OwnedArray::from_matrix(&matrix);
        assert_eq!(array.shape().dims(), &[3, 2]);
        assert_eq!(array.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn empty_vector_round_trips() {
        let array = OwnedArray::<f64>::vector(Vec::new());
        assert!(array.is_empty());
        let mut out: [f64; 0] = [];
        array.copy_into(&mut out).expect("empty copy");
    }

    #[test]
    fn diagnostic_array_counts_up() {
        let array = diagnostic_array(10);
        assert_eq!(array.len(), 10);
        assert_eq!(array.as_slice()[0], 0.0);
        assert_eq!(array.as_slice()[9], 9.0);
    }
}
