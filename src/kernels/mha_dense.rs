//! Reference int8 dense attention kernel.
//!
//! Layout contract: Q/K/V are `[batch, seq, head_num, head_size]` signed
//! 8-bit rows with a configurable token stride (3x hidden when reading out
//! of a merged QKV allocation), the mask is one i32 valid-key-length per
//! batch, dst is `[batch, q_seq, head_num, head_size]` u8 (or f32). The
//! optional additive mask is broadcast f32 logits bias.

use anyhow::{bail, Result};
use rayon::prelude::*;

use crate::core::buffer::DType;
use crate::kernels::{mha_io, Kernel, KernelKind, OperatorDesc, RtBuf};

const WS_ALIGN: usize = 64;

pub struct DenseMhaKernel {
    bs: usize,
    q_seq: usize,
    k_seq: usize,
    head_num: usize,
    head_size: usize,
    /// elements between consecutive tokens in the Q/K/V buffers
    src_stride: usize,
    qk_rescale: f32,
    softmax_rescale: f32,
    qkv_rescale: f32,
    dst_zp: i32,
    dst_f32: bool,
    /// (b, h, i, j) strides into the additive mask, 0 = broadcast axis
    badd_strides: Option<[usize; 4]>,
    /// head_size tile for the integer QK product; sums are exact either way
    block: Option<usize>,
}

impl DenseMhaKernel {
    pub fn new(desc: &OperatorDesc, block: Option<usize>) -> Result<Self> {
        if desc.kind != KernelKind::MhaDense {
            bail!("dense MHA kernel built from {} descriptor", desc.kind.as_str());
        }
        let q = &desc.tensors[mha_io::QUERY];
        let k = &desc.tensors[mha_io::KEY];
        let v = &desc.tensors[mha_io::VALUE];
        let mask = &desc.tensors[mha_io::MASK];
        let dst = &desc.tensors[mha_io::DST];

        for (role, t) in [("query", q), ("key", k), ("value", v)] {
            if t.dtype != DType::S8 {
                bail!("dense MHA {} must be s8, got {}", role, t.dtype.as_str());
            }
            if t.shape.len() != 4 {
                bail!("dense MHA {} must be rank 4, got {:?}", role, t.shape);
            }
        }
        if mask.dtype != DType::S32 {
            bail!("dense MHA mask must be s32, got {}", mask.dtype.as_str());
        }
        let dst_f32 = match dst.dtype {
            DType::U8 => false,
            DType::F32 => true,
            other => bail!("dense MHA dst must be u8 or fp32, got {}", other.as_str()),
        };

        let (bs, q_seq, head_num, head_size) =
            (q.shape[0], q.shape[1], q.shape[2], q.shape[3]);
        let k_seq = k.shape[1];
        if k.shape != [bs, k_seq, head_num, head_size]
            || v.shape != [bs, k_seq, head_num, head_size]
        {
            bail!(
                "dense MHA K/V shapes {:?}/{:?} inconsistent with Q {:?}",
                k.shape,
                v.shape,
                q.shape
            );
        }
        if mask.shape != [bs] {
            bail!("dense MHA mask shape {:?}, want [{}]", mask.shape, bs);
        }
        let dst_numel: usize = dst.shape.iter().product();
        if dst_numel != bs * q_seq * head_num * head_size {
            bail!(
                "dense MHA dst numel {} mismatches {}x{}x{}x{}",
                dst_numel,
                bs,
                q_seq,
                head_num,
                head_size
            );
        }

        let hidden = head_num * head_size;
        let src_stride = if desc.attr_is("merged_QKV", "True") {
            3 * hidden
        } else {
            hidden
        };

        let badd_strides = if desc.tensors.len() == 6 {
            let badd = &desc.tensors[5];
            if badd.dtype != DType::F32 {
                bail!("additive mask must be fp32, got {}", badd.dtype.as_str());
            }
            Some(Self::badd_strides(&badd.shape, bs, head_num, q_seq, k_seq)?)
        } else {
            None
        };

        Ok(Self {
            bs,
            q_seq,
            k_seq,
            head_num,
            head_size,
            src_stride,
            qk_rescale: desc.attr_f32("QK_rescale")?,
            softmax_rescale: desc.attr_f32("softmax_rescale")?,
            qkv_rescale: desc.attr_f32("QKV_rescale")?,
            dst_zp: desc.attr_i32("QKV_dstzp")?,
            dst_f32,
            badd_strides,
            block,
        })
    }

    /// Squeezed additive-mask shapes and their meaning, rightmost first:
    /// [k], [q,k], [b,q,k], [b,h,q,k].
    fn badd_strides(
        shape: &[usize],
        bs: usize,
        head: usize,
        q_seq: usize,
        k_seq: usize,
    ) -> Result<[usize; 4]> {
        let want: &[usize] = match shape.len() {
            1 => &[k_seq],
            2 => &[q_seq, k_seq],
            3 => &[bs, q_seq, k_seq],
            4 => &[bs, head, q_seq, k_seq],
            _ => bail!("unsupported additive mask rank {}", shape.len()),
        };
        if shape != want {
            bail!("additive mask shape {:?}, want {:?}", shape, want);
        }
        Ok(match shape.len() {
            1 => [0, 0, 0, 1],
            2 => [0, 0, k_seq, 1],
            3 => [q_seq * k_seq, 0, k_seq, 1],
            _ => [head * q_seq * k_seq, q_seq * k_seq, k_seq, 1],
        })
    }

    fn ws_chunk(&self) -> usize {
        (self.k_seq * 4 + self.k_seq).div_ceil(WS_ALIGN) * WS_ALIGN
    }

    fn dot(&self, q_row: &[i8], k_row: &[i8]) -> i32 {
        let step = self.block.unwrap_or(self.head_size).max(1);
        let mut acc = 0i32;
        let mut d = 0;
        while d < self.head_size {
            let end = (d + step).min(self.head_size);
            let mut part = 0i32;
            for t in d..end {
                part += q_row[t] as i32 * k_row[t] as i32;
            }
            acc += part;
            d = end;
        }
        acc
    }
}

impl Kernel for DenseMhaKernel {
    fn workspace_size(&self) -> usize {
        self.bs * self.head_num * self.ws_chunk()
    }

    fn execute(&self, rt: &[RtBuf]) -> Result<()> {
        if rt.len() < mha_io::COUNT {
            bail!("dense MHA expects {} runtime buffers", mha_io::COUNT);
        }
        let (bs, q_seq, k_seq) = (self.bs, self.q_seq, self.k_seq);
        let (head, hs) = (self.head_num, self.head_size);
        let stride = self.src_stride;
        let hidden = head * hs;

        let src_min = |seq: usize| (bs * seq - 1) * stride + hidden;
        let q = rt[mha_io::QUERY].as_slice::<i8>();
        let k = rt[mha_io::KEY].as_slice::<i8>();
        let v = rt[mha_io::VALUE].as_slice::<i8>();
        let mask = rt[mha_io::MASK].as_slice::<i32>();
        if q.len() < src_min(q_seq) || k.len() < src_min(k_seq) || v.len() < src_min(k_seq) {
            bail!("dense MHA source buffer too small");
        }
        if mask.len() < bs {
            bail!("dense MHA mask buffer too small");
        }
        let dst_numel = bs * q_seq * hidden;
        let dst = rt[mha_io::DST];
        if dst.len < dst_numel * if self.dst_f32 { 4 } else { 1 } {
            bail!("dense MHA dst buffer too small");
        }
        let ws = rt[mha_io::WORKSPACE];
        if ws.len < self.workspace_size() {
            bail!("dense MHA workspace too small");
        }
        let badd = match (&self.badd_strides, rt[mha_io::BINARY_ADD].is_null()) {
            (Some(_), true) => bail!("dense MHA built with additive mask but none passed"),
            (Some(s), false) => Some((rt[mha_io::BINARY_ADD].as_slice::<f32>(), *s)),
            (None, _) => None,
        };

        let chunk = self.ws_chunk();
        let ws_addr = ws.ptr as usize;
        let dst_addr = dst.ptr as usize;

        (0..bs * head).into_par_iter().for_each(|t| {
            let b = t / head;
            let h = t % head;
            let valid = (mask[b].max(0) as usize).min(k_seq);

            let scores = unsafe {
                std::slice::from_raw_parts_mut((ws_addr + t * chunk) as *mut f32, k_seq)
            };
            let quant = unsafe {
                std::slice::from_raw_parts_mut((ws_addr + t * chunk + k_seq * 4) as *mut u8, k_seq)
            };

            for i in 0..q_seq {
                let q_off = (b * q_seq + i) * stride + h * hs;
                let q_row = &q[q_off..q_off + hs];

                for j in 0..valid {
                    let k_off = (b * k_seq + j) * stride + h * hs;
                    let s = self.dot(q_row, &k[k_off..k_off + hs]);
                    let mut x = s as f32 * self.qk_rescale;
                    if let Some((bias, st)) = &badd {
                        x += bias[b * st[0] + h * st[1] + i * st[2] + j * st[3]];
                    }
                    scores[j] = x;
                }

                quant.fill(0);
                if valid > 0 {
                    let row = &mut scores[..valid];
                    let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    let mut sum = 0.0f32;
                    for val in row.iter_mut() {
                        *val = (*val - max_val).exp();
                        sum += *val;
                    }
                    for (j, val) in row.iter().enumerate() {
                        let p = *val / sum;
                        quant[j] = (p * self.softmax_rescale).round().clamp(0.0, 255.0) as u8;
                    }
                }

                for d in 0..hs {
                    let mut acc = 0i32;
                    for j in 0..valid {
                        let v_off = (b * k_seq + j) * stride + h * hs + d;
                        acc += quant[j] as i32 * v[v_off] as i32;
                    }
                    let out_idx = ((b * q_seq + i) * head + h) * hs + d;
                    if self.dst_f32 {
                        let out = unsafe {
                            std::slice::from_raw_parts_mut(dst_addr as *mut f32, dst_numel)
                        };
                        out[out_idx] = acc as f32 * self.qkv_rescale;
                    } else {
                        let out = unsafe {
                            std::slice::from_raw_parts_mut(dst_addr as *mut u8, dst_numel)
                        };
                        let val = (acc as f32 * self.qkv_rescale).round() as i32 + self.dst_zp;
                        out[out_idx] = val.clamp(0, 255) as u8;
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::TensorDesc;
    use rand::Rng;
    use std::collections::BTreeMap;

    fn desc(
        bs: usize,
        q_seq: usize,
        k_seq: usize,
        head: usize,
        hs: usize,
        attrs: &[(&str, &str)],
    ) -> OperatorDesc {
        let s8 = |s: Vec<usize>| TensorDesc::new(s, DType::S8);
        let tensors = vec![
            s8(vec![bs, q_seq, head, hs]),
            s8(vec![bs, k_seq, head, hs]),
            s8(vec![bs, k_seq, head, hs]),
            TensorDesc::new(vec![bs], DType::S32),
            TensorDesc::new(vec![bs, q_seq, head, hs], DType::U8),
        ];
        let attrs: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorDesc::new(KernelKind::MhaDense, tensors, attrs, 1).unwrap()
    }

    fn run(kernel: &DenseMhaKernel, q: &[i8], k: &[i8], v: &[i8], mask: &[i32]) -> Vec<u8> {
        let mut dst = vec![0u8; kernel.bs * kernel.q_seq * kernel.head_num * kernel.head_size];
        // u64 backing keeps the f32 score rows aligned
        let mut ws = vec![0u64; kernel.workspace_size().div_ceil(8)];
        let rt = vec![
            RtBuf::new(q.as_ptr() as *mut u8, q.len()),
            RtBuf::new(k.as_ptr() as *mut u8, k.len()),
            RtBuf::new(v.as_ptr() as *mut u8, v.len()),
            RtBuf::new(mask.as_ptr() as *mut u8, mask.len() * 4),
            RtBuf::new(dst.as_mut_ptr(), dst.len()),
            RtBuf::new(ws.as_mut_ptr() as *mut u8, ws.len() * 8),
            RtBuf::null(),
        ];
        kernel.execute(&rt).unwrap();
        dst
    }

    #[test]
    fn test_uniform_attention_averages_values() {
        // two identical keys -> softmax 0.5/0.5 -> dst ~= mean(v) rescaled
        let d = desc(
            1,
            1,
            2,
            1,
            1,
            &[
                ("QK_rescale", "1.0"),
                ("softmax_rescale", "255.0"),
                ("QKV_rescale", &format!("{}", 1.0 / 255.0)),
                ("QKV_dstzp", "0"),
                ("merged_QKV", "False"),
            ],
        );
        let kernel = DenseMhaKernel::new(&d, None).unwrap();
        let dst = run(&kernel, &[1], &[1, 1], &[100, 50], &[2]);
        assert_eq!(dst, vec![75]);
    }

    #[test]
    fn test_mask_limits_attended_keys() {
        let d = desc(
            1,
            1,
            2,
            1,
            1,
            &[
                ("QK_rescale", "1.0"),
                ("softmax_rescale", "255.0"),
                ("QKV_rescale", &format!("{}", 1.0 / 255.0)),
                ("QKV_dstzp", "0"),
                ("merged_QKV", "False"),
            ],
        );
        let kernel = DenseMhaKernel::new(&d, None).unwrap();
        // only the first key is valid -> all weight on v[0]
        let dst = run(&kernel, &[1], &[1, 1], &[100, 50], &[1]);
        assert_eq!(dst, vec![100]);
    }

    #[test]
    fn test_blocked_matches_reference() {
        let mut rng = rand::rng();
        let (bs, q_seq, k_seq, head, hs) = (2, 3, 5, 4, 96);
        let d = desc(
            bs,
            q_seq,
            k_seq,
            head,
            hs,
            &[
                ("QK_rescale", "0.004"),
                ("softmax_rescale", "255.0"),
                ("QKV_rescale", "0.0005"),
                ("QKV_dstzp", "4"),
                ("merged_QKV", "False"),
            ],
        );
        let n_src = bs * k_seq * head * hs;
        let q: Vec<i8> = (0..bs * q_seq * head * hs)
            .map(|_| rng.random_range(-127..=127))
            .collect();
        let k: Vec<i8> = (0..n_src).map(|_| rng.random_range(-127..=127)).collect();
        let v: Vec<i8> = (0..n_src).map(|_| rng.random_range(-127..=127)).collect();
        let mask = vec![k_seq as i32; bs];

        let reference = DenseMhaKernel::new(&d, None).unwrap();
        let blocked = DenseMhaKernel::new(&d, Some(64)).unwrap();
        assert_eq!(
            run(&reference, &q, &k, &v, &mask),
            run(&blocked, &q, &k, &v, &mask)
        );
    }

    #[test]
    fn test_rejects_non_s8_sources() {
        let mut d = desc(1, 1, 1, 1, 1, &[]);
        d.tensors[0].dtype = DType::F32;
        assert!(DenseMhaKernel::new(&d, None).is_err());
    }
}
