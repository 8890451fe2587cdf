use bytes::Bytes;
use tracing::trace;

use super::gf256;
use super::matrix::Matrix;
use crate::error::{Result, StorageError};

/// Default padding unit: every slice is a multiple of this many bytes.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Output of [`ErasureCodec::encode`].
#[derive(Debug, Clone)]
pub struct EncodedSlices {
    pub data: Vec<Bytes>,
    pub coding: Vec<Bytes>,
    /// Uniform size of every slice. The original input size is not
    /// recoverable from the slices and must be stored alongside them.
    pub slice_size: usize,
}

impl EncodedSlices {
    /// Data slices then coding slices, indexed like the generator rows.
    pub fn into_ordered(self) -> Vec<Bytes> {
        self.data.into_iter().chain(self.coding).collect()
    }
}

/// Systematic Reed-Solomon style codec over GF(2^8): `k` data slices and `m`
/// coding slices, any `k` of which reconstruct the input.
#[derive(Debug, Clone)]
pub struct ErasureCodec {
    k: usize,
    m: usize,
    alignment: usize,
    generator: Matrix,
}

impl ErasureCodec {
    pub fn new(k: usize, m: usize, alignment: usize) -> Result<Self> {
        if k == 0 || m == 0 {
            return Err(StorageError::Configuration(format!(
                "k and m must be positive (k = {}, m = {})",
                k, m
            )));
        }
        if k + m > 256 {
            return Err(StorageError::Configuration(format!(
                "k + m must be at most 256 (k = {}, m = {})",
                k, m
            )));
        }
        if alignment == 0 {
            return Err(StorageError::Configuration("alignment must be positive".into()));
        }
        Ok(Self {
            k,
            m,
            alignment,
            generator: Matrix::systematic_generator(k, m),
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> usize {
        self.m
    }

    /// Slice size produced for an input of `size` bytes.
    pub fn slice_size_for(&self, size: usize) -> usize {
        let unit = self.k * self.alignment;
        let units = size.div_ceil(unit).max(1);
        units * self.alignment
    }

    pub fn encode(&self, input: &[u8]) -> Result<EncodedSlices> {
        let slice_size = self.slice_size_for(input.len());
        let padded_len = slice_size
            .checked_mul(self.k)
            .ok_or_else(|| StorageError::Encoding(format!("input of {} bytes is too large", input.len())))?;

        let mut padded = Vec::with_capacity(padded_len);
        padded.extend_from_slice(input);
        padded.resize(padded_len, 0);
        let padded = Bytes::from(padded);

        let data: Vec<Bytes> = (0..self.k)
            .map(|i| padded.slice(i * slice_size..(i + 1) * slice_size))
            .collect();

        let coding = (0..self.m)
            .map(|i| {
                let coefficients = self.generator.row(self.k + i);
                let mut parity = vec![0u8; slice_size];
                for (coef, share) in coefficients.iter().zip(&data) {
                    gf256::mul_add_slice(*coef, share, &mut parity);
                }
                Bytes::from(parity)
            })
            .collect();

        trace!(size = input.len(), slice_size, k = self.k, m = self.m, "encoded input");

        Ok(EncodedSlices {
            data,
            coding,
            slice_size,
        })
    }

    /// Rebuilds the original `original_size` bytes from whichever slices are
    /// present. `data` must have `k` entries and `coding` `m` entries, with
    /// `None` standing for a lost slice.
    pub fn decode(
        &self,
        original_size: usize,
        data: &[Option<Bytes>],
        coding: &[Option<Bytes>],
    ) -> Result<Vec<u8>> {
        if data.len() != self.k || coding.len() != self.m {
            return Err(StorageError::Decoding(format!(
                "expected {} data and {} coding slice positions, got {} and {}",
                self.k,
                self.m,
                data.len(),
                coding.len()
            )));
        }

        let present: Vec<(usize, &Bytes)> = data
            .iter()
            .chain(coding)
            .enumerate()
            .filter_map(|(row, slice)| slice.as_ref().map(|s| (row, s)))
            .collect();

        if present.len() < self.k {
            return Err(StorageError::Decoding(format!(
                "{} slices available, at least {} required",
                present.len(),
                self.k
            )));
        }

        let slice_size = present[0].1.len();
        if present.iter().any(|(_, s)| s.len() != slice_size) {
            return Err(StorageError::Decoding("slices have inconsistent sizes".into()));
        }
        if original_size > slice_size * self.k {
            return Err(StorageError::Decoding(format!(
                "original size {} exceeds the {} bytes carried by the slices",
                original_size,
                slice_size * self.k
            )));
        }

        let mut output = vec![0u8; slice_size * self.k];

        if data.iter().all(Option::is_some) {
            for (i, share) in data.iter().flatten().enumerate() {
                output[i * slice_size..(i + 1) * slice_size].copy_from_slice(share);
            }
        } else {
            // Any k present rows of the generator form an invertible matrix;
            // its inverse maps those slices back onto the data shares.
            let chosen = &present[..self.k];
            let rows: Vec<usize> = chosen.iter().map(|(row, _)| *row).collect();
            let decode_matrix = self.generator.select_rows(&rows).invert().ok_or_else(|| {
                StorageError::Decoding(format!(
                    "decode matrix for rows {:?} is singular, generator invariant violated",
                    rows
                ))
            })?;

            for (i, slot) in data.iter().enumerate() {
                let out = &mut output[i * slice_size..(i + 1) * slice_size];
                match slot {
                    Some(share) => out.copy_from_slice(share),
                    None => {
                        for (j, (_, slice)) in chosen.iter().enumerate() {
                            gf256::mul_add_slice(decode_matrix.get(i, j), slice, out);
                        }
                    }
                }
            }
            trace!(rows = ?rows, "reconstructed missing data slices");
        }

        output.truncate(original_size);
        Ok(output)
    }
}
