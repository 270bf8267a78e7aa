//! Physical layout permutation shared across dtype instantiations.
//! Single-threaded on purpose: callers run it per-tensor from already
//! parallel contexts.

use anyhow::{bail, Result};

use crate::core::shape::permute;
use crate::core::tensor::Tensor;

/// Scatter `src` (row-major over `dims`) into `dst` laid out row-major over
/// `permute(dims, perm)`.
pub fn transpose<T: Copy>(src: &[T], dst: &mut [T], dims: &[usize], perm: &[usize]) {
    let rank = dims.len();
    debug_assert_eq!(perm.len(), rank);
    let out_dims = permute(dims, perm);

    let mut src_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        src_strides[i] = src_strides[i + 1] * dims[i + 1];
    }

    let total: usize = dims.iter().product();
    let mut coord = vec![0usize; rank];
    for (o, slot) in dst.iter_mut().enumerate().take(total) {
        // decompose the output linear index over out_dims
        let mut rem = o;
        for k in (0..rank).rev() {
            coord[k] = rem % out_dims[k];
            rem /= out_dims[k];
        }
        let mut s = 0;
        for k in 0..rank {
            s += coord[k] * src_strides[perm[k]];
        }
        *slot = src[s];
    }
}

/// Permute a tensor's buffer in place (through a scratch copy) and update
/// its shape to match.
pub fn reorder_tensor(t: &Tensor, perm: &[usize]) -> Result<()> {
    let dims = t.shape();
    if dims.len() != perm.len() {
        bail!(
            "reorder rank mismatch on '{}': {} dims vs {} perm entries",
            t.name(),
            dims.len(),
            perm.len()
        );
    }
    match t.dtype().size() {
        1 => {
            let data = t.as_mut_slice::<u8>()?;
            let mut tmp = data.to_vec();
            transpose(data, &mut tmp, &dims, perm);
            data.copy_from_slice(&tmp);
        }
        2 => {
            let data = t.as_mut_slice::<u16>()?;
            let mut tmp = data.to_vec();
            transpose(data, &mut tmp, &dims, perm);
            data.copy_from_slice(&tmp);
        }
        4 => {
            let data = t.as_mut_slice::<u32>()?;
            let mut tmp = data.to_vec();
            transpose(data, &mut tmp, &dims, perm);
            data.copy_from_slice(&tmp);
        }
        n => bail!("reorder does not support {}-byte elements", n),
    }
    t.set_shape(permute(&dims, perm));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::DType;

    #[test]
    fn test_transpose_2d() {
        let src = [1u8, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 6];
        transpose(&src, &mut dst, &[2, 3], &[1, 0]);
        assert_eq!(dst, [1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_transpose_roundtrip_4d() {
        let dims = [2usize, 3, 4, 5];
        let n: usize = dims.iter().product();
        let src: Vec<u32> = (0..n as u32).collect();
        let mut once = vec![0u32; n];
        transpose(&src, &mut once, &dims, &[2, 0, 1, 3]);
        // inverse of {2,0,1,3} is {1,2,0,3}
        let mid = crate::core::shape::permute(&dims, &[2, 0, 1, 3]);
        let mut back = vec![0u32; n];
        transpose(&once, &mut back, &mid, &[1, 2, 0, 3]);
        assert_eq!(back, src);
    }

    #[test]
    fn test_reorder_tensor_updates_shape() {
        let data: Vec<u8> = (0..24).collect();
        let t = Tensor::from_data("r", DType::S8, vec![2, 3, 4], data);
        reorder_tensor(&t, &[2, 0, 1]).unwrap();
        assert_eq!(t.shape(), vec![4, 2, 3]);
    }
}
