//! Reference int8 attention kernel for the structured-sparse layout.
//!
//! Layout contract: Q/K/V and dst are `[batch, head_num, head_size, seq]`
//! with the sequence dimension innermost (the blocked layout the sparse
//! matmul family operates on). The mask is an additive f32 logits bias per
//! (batch, key) position.

use anyhow::{bail, Result};
use rayon::prelude::*;

use crate::core::buffer::DType;
use crate::kernels::{mha_io, Kernel, KernelKind, OperatorDesc, RtBuf};

const WS_ALIGN: usize = 64;

pub struct TransposeMhaKernel {
    bs: usize,
    seq: usize,
    head_num: usize,
    head_size: usize,
    qk_rescale: f32,
    softmax_rescale: f32,
    qkv_rescale: f32,
    dst_zp: i32,
}

impl TransposeMhaKernel {
    pub fn new(desc: &OperatorDesc) -> Result<Self> {
        if desc.kind != KernelKind::MhaTranspose {
            bail!(
                "transpose MHA kernel built from {} descriptor",
                desc.kind.as_str()
            );
        }
        let q = &desc.tensors[mha_io::QUERY];
        let k = &desc.tensors[mha_io::KEY];
        let v = &desc.tensors[mha_io::VALUE];
        let mask = &desc.tensors[mha_io::MASK];
        let dst = &desc.tensors[mha_io::DST];

        for (role, t) in [("query", q), ("key", k), ("value", v)] {
            if t.dtype != DType::S8 {
                bail!("transpose MHA {} must be s8, got {}", role, t.dtype.as_str());
            }
            if t.shape.len() != 4 {
                bail!("transpose MHA {} must be rank 4, got {:?}", role, t.shape);
            }
        }
        if mask.dtype != DType::F32 {
            bail!("transpose MHA mask must be fp32, got {}", mask.dtype.as_str());
        }
        if dst.dtype != DType::U8 {
            bail!("transpose MHA dst must be u8, got {}", dst.dtype.as_str());
        }

        let (bs, head_num, head_size, seq) = (q.shape[0], q.shape[1], q.shape[2], q.shape[3]);
        if k.shape != q.shape || v.shape != q.shape {
            bail!(
                "transpose MHA Q/K/V shapes differ: {:?} {:?} {:?}",
                q.shape,
                k.shape,
                v.shape
            );
        }
        if mask.shape != [bs, seq] {
            bail!(
                "transpose MHA mask shape {:?}, want [{}, {}]",
                mask.shape,
                bs,
                seq
            );
        }
        if dst.shape.iter().product::<usize>() != bs * head_num * head_size * seq {
            bail!("transpose MHA dst numel mismatches sources");
        }

        Ok(Self {
            bs,
            seq,
            head_num,
            head_size,
            qk_rescale: desc.attr_f32("QK_rescale")?,
            softmax_rescale: desc.attr_f32("softmax_rescale")?,
            qkv_rescale: desc.attr_f32("QKV_rescale")?,
            dst_zp: desc.attr_i32("QKV_dstzp")?,
        })
    }

    fn ws_chunk(&self) -> usize {
        (self.seq * 4 + self.seq).div_ceil(WS_ALIGN) * WS_ALIGN
    }
}

impl Kernel for TransposeMhaKernel {
    fn workspace_size(&self) -> usize {
        self.bs * self.head_num * self.ws_chunk()
    }

    fn execute(&self, rt: &[RtBuf]) -> Result<()> {
        if rt.len() < mha_io::COUNT {
            bail!("transpose MHA expects {} runtime buffers", mha_io::COUNT);
        }
        let (bs, seq) = (self.bs, self.seq);
        let (head, hs) = (self.head_num, self.head_size);
        let numel = bs * head * hs * seq;

        let q = rt[mha_io::QUERY].as_slice::<i8>();
        let k = rt[mha_io::KEY].as_slice::<i8>();
        let v = rt[mha_io::VALUE].as_slice::<i8>();
        let mask = rt[mha_io::MASK].as_slice::<f32>();
        if q.len() < numel || k.len() < numel || v.len() < numel {
            bail!("transpose MHA source buffer too small");
        }
        if mask.len() < bs * seq {
            bail!("transpose MHA mask buffer too small");
        }
        let dst = rt[mha_io::DST];
        if dst.len < numel {
            bail!("transpose MHA dst buffer too small");
        }
        let ws = rt[mha_io::WORKSPACE];
        if ws.len < self.workspace_size() {
            bail!("transpose MHA workspace too small");
        }

        let chunk = self.ws_chunk();
        let ws_addr = ws.ptr as usize;
        let dst_addr = dst.ptr as usize;

        // (b, h, d, s) element offset in the batch-minor layout
        let at = move |b: usize, h: usize, d: usize, s: usize| ((b * head + h) * hs + d) * seq + s;

        (0..bs * head).into_par_iter().for_each(|t| {
            let b = t / head;
            let h = t % head;

            let scores = unsafe {
                std::slice::from_raw_parts_mut((ws_addr + t * chunk) as *mut f32, seq)
            };
            let quant = unsafe {
                std::slice::from_raw_parts_mut((ws_addr + t * chunk + seq * 4) as *mut u8, seq)
            };
            let out = unsafe { std::slice::from_raw_parts_mut(dst_addr as *mut u8, numel) };

            for i in 0..seq {
                for j in 0..seq {
                    let mut acc = 0i32;
                    for d in 0..hs {
                        acc += q[at(b, h, d, i)] as i32 * k[at(b, h, d, j)] as i32;
                    }
                    scores[j] = acc as f32 * self.qk_rescale + mask[b * seq + j];
                }

                let max_val = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let mut sum = 0.0f32;
                for val in scores.iter_mut() {
                    *val = (*val - max_val).exp();
                    sum += *val;
                }
                for (j, val) in scores.iter().enumerate() {
                    let p = *val / sum;
                    quant[j] = (p * self.softmax_rescale).round().clamp(0.0, 255.0) as u8;
                }

                for d in 0..hs {
                    let mut acc = 0i32;
                    for j in 0..seq {
                        acc += quant[j] as i32 * v[at(b, h, d, j)] as i32;
                    }
                    let val = (acc as f32 * self.qkv_rescale).round() as i32 + self.dst_zp;
                    out[at(b, h, d, i)] = val.clamp(0, 255) as u8;
                }
            }
        });

        Ok(())
    }
}
