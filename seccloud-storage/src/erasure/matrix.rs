use super::gf256;

/// Dense row-major matrix over GF(2^8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zero(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut m = Self::zero(size, size);
        for i in 0..size {
            m.set(i, i, 1);
        }
        m
    }

    /// Systematic generator for `k` data and `m` coding slices: the identity on
    /// top of an `m x k` Cauchy matrix. Every square submatrix of a Cauchy
    /// matrix is invertible, so any `k` rows of the result are too.
    pub fn systematic_generator(k: usize, m: usize) -> Self {
        assert!(k + m <= 256, "k + m must not exceed the field size");
        let mut g = Self::zero(k + m, k);
        for i in 0..k {
            g.set(i, i, 1);
        }
        for i in 0..m {
            let x = (k + i) as u8;
            for j in 0..k {
                let y = j as u8;
                g.set(k + i, j, gf256::inv(gf256::add(x, y)));
            }
        }
        g
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[u8] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// New matrix made of the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut out = Self::zero(rows.len(), self.cols);
        for (dst, &src) in rows.iter().enumerate() {
            out.data[dst * self.cols..(dst + 1) * self.cols].copy_from_slice(self.row(src));
        }
        out
    }

    pub fn multiply(&self, other: &Matrix) -> Matrix {
        assert_eq!(self.cols, other.rows);
        let mut out = Self::zero(self.rows, other.cols);
        for r in 0..self.rows {
            for c in 0..other.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc ^= gf256::mul(self.get(r, i), other.get(i, c));
                }
                out.set(r, c, acc);
            }
        }
        out
    }

    /// Gauss-Jordan inversion. Returns `None` for a singular or non-square matrix.
    pub fn invert(&self) -> Option<Matrix> {
        if self.rows != self.cols {
            return None;
        }
        let n = self.rows;
        let mut work = self.clone();
        let mut inverse = Self::identity(n);

        for col in 0..n {
            let pivot = (col..n).find(|&r| work.get(r, col) != 0)?;
            if pivot != col {
                work.swap_rows(pivot, col);
                inverse.swap_rows(pivot, col);
            }

            let scale = gf256::inv(work.get(col, col));
            work.scale_row(col, scale);
            inverse.scale_row(col, scale);

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor != 0 {
                    work.add_scaled_row(col, r, factor);
                    inverse.add_scaled_row(col, r, factor);
                }
            }
        }

        Some(inverse)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    fn scale_row(&mut self, row: usize, factor: u8) {
        for c in 0..self.cols {
            let v = self.get(row, c);
            self.set(row, c, gf256::mul(v, factor));
        }
    }

    // row[dst] += factor * row[src]
    fn add_scaled_row(&mut self, src: usize, dst: usize, factor: u8) {
        for c in 0..self.cols {
            let v = self.get(dst, c) ^ gf256::mul(factor, self.get(src, c));
            self.set(dst, c, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
        fn go(start: usize, n: usize, k: usize, cur: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if cur.len() == k {
                out.push(cur.clone());
                return;
            }
            for i in start..n {
                cur.push(i);
                go(i + 1, n, k, cur, out);
                cur.pop();
            }
        }
        let mut out = Vec::new();
        go(0, n, k, &mut Vec::new(), &mut out);
        out
    }

    #[test]
    fn test_generator_is_systematic() {
        let g = Matrix::systematic_generator(4, 2);
        assert_eq!(g.select_rows(&[0, 1, 2, 3]), Matrix::identity(4));
    }

    #[test]
    fn test_any_k_rows_are_invertible() {
        for (k, m) in [(4, 2), (3, 3), (6, 3), (2, 1)] {
            let g = Matrix::systematic_generator(k, m);
            for rows in combinations(k + m, k) {
                let sub = g.select_rows(&rows);
                let inv = sub
                    .invert()
                    .unwrap_or_else(|| panic!("rows {:?} of ({}, {}) are singular", rows, k, m));
                assert_eq!(sub.multiply(&inv), Matrix::identity(k));
            }
        }
    }

    #[test]
    fn test_singular_matrix_has_no_inverse() {
        let mut m = Matrix::zero(2, 2);
        m.set(0, 0, 3);
        m.set(0, 1, 5);
        m.set(1, 0, 3);
        m.set(1, 1, 5);
        assert!(m.invert().is_none());
        assert!(Matrix::zero(2, 3).invert().is_none());
    }
}
