// flat weight matrices shared by all training threads.
//
// Training follows the Hogwild scheme: every worker reads and writes rows of the same
// matrices through raw pointers, with no locks and no atomics. Two workers touching the
// same row at the same time may lose or mix an update; that is accepted, collisions are
// rare and the learning rate keeps their effect small. Outside of training (no worker
// alive) the matrix is accessed through the ordinary borrow-checked methods.

use crate::errors::{DepVecError, Result};

use ndarray::Array2;

const CACHE_LINE_FLOATS: usize = 32;

// 128 bytes, the alignment the matrices are allocated with
#[repr(C, align(128))]
#[derive(Clone, Copy)]
struct CacheLine([f32; CACHE_LINE_FLOATS]);

/// Word-major, dimension-minor `rows x width` matrix of f32.
pub struct SharedMatrix {
    // owns the allocation, never resized after construction
    _lines: Vec<CacheLine>,
    ptr: *mut f32,
    rows: usize,
    width: usize,
}

// rows are mutated concurrently only through `row_ptr`, whose callers accept the races
unsafe impl Sync for SharedMatrix {}
unsafe impl Send for SharedMatrix {}

impl SharedMatrix {

    /// Zero-filled matrix.
    pub fn new(rows: usize, width: usize) -> Result<Self> {

        let floats = rows
            .checked_mul(width)
            .ok_or_else(|| DepVecError::Allocation(format!("{} x {} floats", rows, width)))?;
        let n_lines = (floats + CACHE_LINE_FLOATS - 1) / CACHE_LINE_FLOATS;

        let mut lines: Vec<CacheLine> = Vec::new();
        lines.try_reserve_exact(n_lines).map_err(|_| {
            DepVecError::Allocation(format!("{} MB for a {} x {} matrix", floats * 4 / 1048576, rows, width))
        })?;
        lines.resize(n_lines, CacheLine([0.0; CACHE_LINE_FLOATS]));
        let ptr = lines.as_mut_ptr() as *mut f32;

        Ok(Self {
            _lines: lines,
            ptr,
            rows,
            width,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.rows * self.width) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.rows * self.width) }
    }

    pub fn row(&self, idx: usize) -> &[f32] {
        &self.as_slice()[idx * self.width..(idx + 1) * self.width]
    }

    pub fn row_mut(&mut self, idx: usize) -> &mut [f32] {
        let width = self.width;
        &mut self.as_mut_slice()[idx * width..(idx + 1) * width]
    }

    pub fn fill(&mut self, value: f32) {
        self.as_mut_slice().fill(value);
    }

    pub fn to_array2(&self) -> Array2<f32> {
        // shape always matches the buffer length
        Array2::from_shape_vec((self.rows, self.width), self.as_slice().to_vec())
            .unwrap_or_else(|_| Array2::zeros((self.rows, self.width)))
    }

    /// Pointer to dimension `offset` of row `idx`.
    ///
    /// # Safety
    /// Writes through the pointer race with any other thread using this matrix; callers
    /// must be training workers and no shared slice of the matrix may be alive meanwhile.
    /// At most `width - offset` floats may be accessed.
    #[inline]
    pub unsafe fn row_ptr(&self, idx: usize, offset: usize) -> *mut f32 {
        debug_assert!(idx < self.rows, "row {} out of {}", idx, self.rows);
        debug_assert!(offset <= self.width);
        self.ptr.add(idx * self.width + offset)
    }
}


// raw kernels of the update rules, they tolerate `x` and `y` overlapping

/// Sum of `x[i] * y[i]`.
///
/// # Safety
/// Both pointers must be valid for `len` reads.
#[inline]
pub unsafe fn dot(x: *const f32, y: *const f32, len: usize) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..len {
        sum += *x.add(i) * *y.add(i);
    }
    sum
}

/// `y += g * x`
///
/// # Safety
/// `x` must be valid for `len` reads and `y` for `len` writes.
#[inline]
pub unsafe fn axpy(g: f32, x: *const f32, y: *mut f32, len: usize) {
    for i in 0..len {
        *y.add(i) += g * *x.add(i);
    }
}


#[cfg(test)]
mod tests {

    use super::{axpy, dot, SharedMatrix};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rows_are_contiguous_and_aligned() {

        let mut m = SharedMatrix::new(3, 5).unwrap();
        assert_eq!(m.as_slice().len(), 15);
        assert_eq!(m.as_slice().as_ptr() as usize % 128, 0);
        assert!(m.as_slice().iter().all(|x| *x == 0.0));

        m.row_mut(1).copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(&m.as_slice()[5..10], &[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(m.to_array2().row(1).to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn kernels() {
        let mut m = SharedMatrix::new(2, 3).unwrap();
        m.row_mut(0).copy_from_slice(&[1.0, 2.0, 3.0]);
        m.row_mut(1).copy_from_slice(&[4.0, 5.0, 6.0]);
        unsafe {
            assert_eq!(dot(m.row_ptr(0, 0), m.row_ptr(1, 0), 3), 32.0);
            axpy(0.5, m.row_ptr(1, 1), m.row_ptr(0, 1), 2);
        }
        assert_eq!(m.row(0), &[1.0, 4.5, 6.0]);
    }

    #[test]
    fn unsynchronized_writers_on_disjoint_rows() {

        let m = Arc::new(SharedMatrix::new(8, 4).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    let one = [1.0f32; 4];
                    for _ in 0..1000 {
                        unsafe { axpy(1.0, one.as_ptr(), m.row_ptr(t, 0), 4) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(m.as_slice().iter().all(|x| *x == 1000.0));
    }
}
