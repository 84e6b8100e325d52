//! Owned row-major buffers for tile operands
//!
//! A [`MatrixBuffer`] is the memory side of every tile load and store: a
//! contiguous row-major block of `rows × cols` elements whose row stride is
//! `cols × size_of::<T>()` bytes. Inputs are `i8`, accumulators are `i32`.
//!
//! # Example
//!
//! ```
//! use tilemm::MatrixBuffer;
//!
//! let a = MatrixBuffer::<i8>::filled(16, 64, 2);
//! assert_eq!(a.stride(), 64);
//!
//! let c = MatrixBuffer::<i32>::new(16, 16);
//! assert_eq!(c.stride(), 64);
//! ```

use std::fmt;

use crate::{Result, TileError};

/// Element types that can live in a tile
///
/// Only the two widths the dot-product-accumulate primitive consumes and
/// produces are implemented.
pub trait TileElement: bytemuck::Pod + Default + PartialEq + fmt::Debug + fmt::Display {
    /// Element width in bytes
    const WIDTH: usize;
}

impl TileElement for i8 {
    const WIDTH: usize = 1;
}

impl TileElement for i32 {
    const WIDTH: usize = 4;
}

/// A row-major matrix buffer that exclusively owns its storage
///
/// Dimensions are fixed at construction; the buffer is filled by its owner
/// and read or written in place by the tile engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixBuffer<T: TileElement> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: TileElement> MatrixBuffer<T> {
    /// Creates a zero-filled `rows × cols` buffer
    pub fn new(rows: usize, cols: usize) -> Self {
        MatrixBuffer {
            rows,
            cols,
            data: vec![T::default(); rows * cols],
        }
    }

    /// Creates a buffer with every element set to `value`
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        MatrixBuffer {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Creates a buffer from row-major data
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `data.len() != rows * cols`
    ///
    /// # Example
    ///
    /// ```
    /// use tilemm::MatrixBuffer;
    ///
    /// let m = MatrixBuffer::from_vec(2, 2, vec![1i8, 2, 3, 4]).unwrap();
    /// assert_eq!(m.get(1, 0), Some(&3));
    /// assert!(MatrixBuffer::from_vec(2, 2, vec![1i8, 2, 3]).is_err());
    /// ```
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(TileError::InvalidInput(format!(
                "Data length {} does not match buffer dimensions {}x{} (expected {})",
                data.len(),
                rows,
                cols,
                rows * cols
            )));
        }
        Ok(MatrixBuffer { rows, cols, data })
    }

    /// Returns the number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the number of columns (elements per row)
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Returns the shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Row stride in bytes
    ///
    /// This is the only stride that may be handed to a tile load or store
    /// addressing this buffer.
    pub fn stride(&self) -> usize {
        self.cols * T::WIDTH
    }

    /// Bytes per row, equal to the stride for a dense buffer
    pub fn row_bytes(&self) -> usize {
        self.stride()
    }

    /// Overwrites every element with `value`
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Gets a reference to an element at (row, col)
    ///
    /// Returns `None` if indices are out of bounds
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row >= self.rows || col >= self.cols {
            None
        } else {
            self.data.get(row * self.cols + col)
        }
    }

    /// Gets a mutable reference to an element at (row, col)
    ///
    /// Returns `None` if indices are out of bounds
    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
        if row >= self.rows || col >= self.cols {
            None
        } else {
            let idx = row * self.cols + col;
            self.data.get_mut(idx)
        }
    }

    /// Returns one row as a slice
    pub fn row(&self, row: usize) -> Option<&[T]> {
        if row >= self.rows {
            None
        } else {
            Some(&self.data[row * self.cols..(row + 1) * self.cols])
        }
    }

    /// Returns a reference to the underlying data
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Raw bytes of the buffer, `rows × stride()` long
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Mutable raw bytes of the buffer, `rows × stride()` long
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.data)
    }

    /// Consumes the buffer and returns its data
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl MatrixBuffer<i32> {
    /// Sum of all cells, used to compare runs cheaply
    pub fn checksum(&self) -> i64 {
        self.data.iter().map(|&v| i64::from(v)).sum()
    }
}

impl<T: TileElement> fmt::Display for MatrixBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.data.chunks(self.cols.max(1)) {
            let mut first = true;
            for value in row {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{value}")?;
                first = false;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
