//! Quantized multi-head attention over int8 activations.
//!
//! Supports a merged QKV activation (one contiguous tensor per token) or
//! three split tensors, each with an optional additive attention-bias mask,
//! and picks between the dense kernel and the batch-minor structured-sparse
//! kernel based on the configured output reshape.

use anyhow::{anyhow, bail, Result};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::buffer::{DType, TensorFormat};
use crate::core::memory::Memory;
use crate::core::quant;
use crate::core::shape::{parse_dims, parse_perm, permute};
use crate::core::tensor::Tensor;
use crate::kernels::{self, mha_io, Kernel, KernelKind, OperatorDesc, RtBuf, TensorDesc};
use crate::model::config::OperatorConfig;
use crate::operators::{unref_tensors, Operator};

/// Offsets (in elements) of the key and value blocks past the query start
/// inside one merged QKV token row: query at 0, key at hidden, value at
/// 2 * hidden.
pub fn merged_qkv_offsets(hidden_size: usize) -> (usize, usize) {
    (hidden_size, 2 * hidden_size)
}

struct CalibPair {
    min: Arc<Tensor>,
    max: Arc<Tensor>,
}

impl CalibPair {
    fn scales(&self, dtype: DType) -> Result<Vec<f32>> {
        let mins = self.min.as_slice::<f32>()?;
        let maxs = self.max.as_slice::<f32>()?;
        Ok(mins
            .iter()
            .zip(maxs.iter())
            .map(|(&lo, &hi)| quant::scale(lo, hi, dtype))
            .collect())
    }

    fn min0(&self) -> Result<f32> {
        Ok(self.min.as_slice::<f32>()?[0])
    }
}

struct Calibration {
    q: CalibPair,
    k: CalibPair,
    v: CalibPair,
    qk: CalibPair,
    dst: CalibPair,
}

impl Calibration {
    fn bind(t: &[Arc<Tensor>]) -> Self {
        let pair = |i: usize| CalibPair {
            min: t[i].clone(),
            max: t[i + 1].clone(),
        };
        Self {
            q: pair(0),
            k: pair(2),
            v: pair(4),
            qk: pair(6),
            dst: pair(8),
        }
    }
}

/// Input binding over the four supported arities. Named fields instead of
/// positional indexing so an added input cannot silently shift the rest.
enum AttentionInputs {
    Merged {
        qkv: Arc<Tensor>,
        mask: Arc<Tensor>,
        bias: Option<Arc<Tensor>>,
        calib: Calibration,
    },
    Split {
        q: Arc<Tensor>,
        k: Arc<Tensor>,
        v: Arc<Tensor>,
        mask: Arc<Tensor>,
        bias: Option<Arc<Tensor>>,
        calib: Calibration,
    },
}

impl AttentionInputs {
    fn bind(input: &[Arc<Tensor>]) -> Result<Self> {
        match input.len() {
            12 => Ok(Self::Merged {
                qkv: input[0].clone(),
                mask: input[1].clone(),
                bias: None,
                calib: Calibration::bind(&input[2..]),
            }),
            13 => Ok(Self::Merged {
                qkv: input[0].clone(),
                mask: input[1].clone(),
                bias: Some(input[2].clone()),
                calib: Calibration::bind(&input[3..]),
            }),
            14 => Ok(Self::Split {
                q: input[0].clone(),
                k: input[1].clone(),
                v: input[2].clone(),
                mask: input[3].clone(),
                bias: None,
                calib: Calibration::bind(&input[4..]),
            }),
            15 => Ok(Self::Split {
                q: input[0].clone(),
                k: input[1].clone(),
                v: input[2].clone(),
                mask: input[3].clone(),
                bias: Some(input[4].clone()),
                calib: Calibration::bind(&input[5..]),
            }),
            n => bail!("unsupported MultiHeadAttention input arity {}", n),
        }
    }

    fn mask(&self) -> &Arc<Tensor> {
        match self {
            Self::Merged { mask, .. } | Self::Split { mask, .. } => mask,
        }
    }

    fn bias(&self) -> Option<&Arc<Tensor>> {
        match self {
            Self::Merged { bias, .. } | Self::Split { bias, .. } => bias.as_ref(),
        }
    }

    fn calib(&self) -> &Calibration {
        match self {
            Self::Merged { calib, .. } | Self::Split { calib, .. } => calib,
        }
    }

    fn activation_dtype(&self) -> DType {
        match self {
            Self::Merged { qkv, .. } => qkv.dtype(),
            Self::Split { q, .. } => q.dtype(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Unconfigured,
    Prepared,
    Shaped,
    Executable,
}

pub struct MultiHeadAttentionOperator {
    name: String,
    q_perm: Vec<usize>,
    k_perm: Vec<usize>,
    v_perm: Vec<usize>,
    dst_perm: Vec<usize>,
    output_scale: f32,
    dst_reshape: Vec<i64>,
    is_sparse: bool,
    /// "auto" rewrites an all-ones mask when q/k sequence lengths differ;
    /// "off" never touches the mask.
    decoder_mask_auto: bool,
    alloc: Arc<dyn Memory>,

    inputs: Option<AttentionInputs>,
    raw_inputs: Vec<Arc<Tensor>>,
    dst: Option<Arc<Tensor>>,

    qk_rescale: f32,
    softmax_rescale: f32,
    qkv_rescale: f32,
    dst_zp: i32,
    q_scale: f32,
    k_scale: f32,
    v_scale: f32,
    dst_scale: f32,

    bs: usize,
    seq_len: usize,
    head_num: usize,
    head_size: usize,
    hidden: usize,
    src_shape: Vec<usize>,

    desc: Option<OperatorDesc>,
    kernel: Option<Box<dyn Kernel>>,
    kernel_choice: Option<String>,
    stage: Stage,
}

impl MultiHeadAttentionOperator {
    pub fn new(conf: &OperatorConfig, alloc: Arc<dyn Memory>) -> Result<Self> {
        let perm = |key: &str| -> Result<Vec<usize>> {
            conf.attr(key).map(parse_perm).transpose().map(Option::unwrap_or_default)
        };
        let dst_reshape = conf
            .attr("reshape")
            .map(parse_dims)
            .transpose()?
            .unwrap_or_default();
        // the sparse path is requested by a reshape with a concrete leading dim
        let is_sparse = dst_reshape.first().is_some_and(|&d| d > 0);
        let output_scale = conf
            .attr("output_scale")
            .map(|s| s.parse::<f32>())
            .transpose()
            .map_err(|_| anyhow!("bad output_scale on operator '{}'", conf.name))?
            .unwrap_or(1.0);
        let decoder_mask_auto = conf.attr("decoder_mask") != Some("off");

        Ok(Self {
            name: conf.name.clone(),
            q_perm: perm("Q_perm")?,
            k_perm: perm("K_perm")?,
            v_perm: perm("V_perm")?,
            dst_perm: perm("dst_perm")?,
            output_scale,
            dst_reshape,
            is_sparse,
            decoder_mask_auto,
            alloc,
            inputs: None,
            raw_inputs: Vec::new(),
            dst: None,
            qk_rescale: 1.0,
            softmax_rescale: 1.0,
            qkv_rescale: 1.0,
            dst_zp: 0,
            q_scale: 1.0,
            k_scale: 1.0,
            v_scale: 1.0,
            dst_scale: 1.0,
            bs: 0,
            seq_len: 0,
            head_num: 0,
            head_size: 0,
            hidden: 0,
            src_shape: Vec::new(),
            desc: None,
            kernel: None,
            kernel_choice: None,
            stage: Stage::Unconfigured,
        })
    }

    fn common_attrs(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("QK_rescale".into(), self.qk_rescale.to_string());
        attrs.insert("softmax_rescale".into(), self.softmax_rescale.to_string());
        attrs.insert("QKV_rescale".into(), self.qkv_rescale.to_string());
        attrs.insert("QKV_dstzp".into(), self.dst_zp.to_string());
        attrs.insert("Q_scale".into(), self.q_scale.to_string());
        attrs.insert("K_scale".into(), self.k_scale.to_string());
        attrs.insert("V_scale".into(), self.v_scale.to_string());
        attrs.insert("DST_scale".into(), self.dst_scale.to_string());
        attrs.insert("QK_output_scale".into(), self.output_scale.to_string());
        attrs
    }

    fn build_kernel(&mut self, desc: OperatorDesc) -> Result<()> {
        self.kernel = Some(kernels::build(&desc, self.kernel_choice.as_deref())?);
        self.desc = Some(desc);
        self.stage = Stage::Shaped;
        Ok(())
    }

    /// Resolve a configured reshape against the produced element count,
    /// inferring at most one -1 axis.
    fn resolve_reshape(reshape: &[i64], total: usize) -> Result<Vec<usize>> {
        let known: usize = reshape.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
        let inferred = reshape.iter().filter(|&&d| d < 0).count();
        if inferred > 1 {
            bail!("reshape {:?} has more than one inferred axis", reshape);
        }
        let dims: Vec<usize> = reshape
            .iter()
            .map(|&d| if d < 0 { total / known.max(1) } else { d as usize })
            .collect();
        if dims.iter().product::<usize>() != total {
            bail!("reshape {:?} incompatible with {} elements", reshape, total);
        }
        Ok(dims)
    }

    fn reshape_dense(&mut self) -> Result<()> {
        let dst = self.dst.clone().unwrap();
        let bias_shape = self.inputs.as_ref().unwrap().bias().map(|b| b.shape());
        let mut attrs = self.common_attrs();

        let (src_descs, attn_shape, bs) = match self.inputs.as_ref().unwrap() {
            AttentionInputs::Split { q, k, v, .. } => {
                // decoder-style graphs give Q and K/V different sequence lengths
                let q_shape = q.shape();
                let k_shape = k.shape();
                let v_shape = v.shape();
                let q_p = permute(&q_shape, &self.q_perm);
                let k_p = permute(&k_shape, &self.k_perm);
                let v_p = permute(&v_shape, &self.v_perm);
                let qk_shape = [q_p[0], q_p[1], q_p[2], k_p[3]];
                let attn_shape = permute(
                    &[qk_shape[0], qk_shape[1], qk_shape[2], v_p[3]],
                    &self.dst_perm,
                );
                attrs.insert("merged_QKV".into(), "False".into());
                let descs = vec![
                    TensorDesc::new(q_shape.clone(), DType::S8),
                    TensorDesc::new(k_shape, DType::S8),
                    TensorDesc::new(v_shape, DType::S8),
                ];
                (descs, attn_shape, q_shape[0])
            }
            AttentionInputs::Merged { qkv, .. } => {
                let qkv_shape = qkv.shape();
                if qkv_shape.len() != 5 {
                    bail!(
                        "merged QKV must be [batch, seq, 3, head_num, head_size], got {:?}",
                        qkv_shape
                    );
                }
                let (bs, seq_len) = (qkv_shape[0], qkv_shape[1]);
                let (head_num, head_size) = (qkv_shape[3], qkv_shape[4]);
                let hidden = head_num * head_size;
                // offset contract: three hidden-size blocks per token
                let expect = bs * seq_len * 3 * hidden;
                if qkv.numel() != expect {
                    bail!(
                        "merged QKV '{}' holds {} elements, want {} (3 x hidden x tokens)",
                        qkv.name(),
                        qkv.numel(),
                        expect
                    );
                }
                let attn_shape = vec![bs, seq_len, head_num, head_size];
                attrs.insert("merged_QKV".into(), "True".into());
                let descs = vec![
                    TensorDesc::new(attn_shape.clone(), DType::S8),
                    TensorDesc::new(attn_shape.clone(), DType::S8),
                    TensorDesc::new(attn_shape.clone(), DType::S8),
                ];
                self.bs = bs;
                self.seq_len = seq_len;
                self.head_num = head_num;
                self.head_size = head_size;
                self.hidden = hidden;
                (descs, attn_shape, bs)
            }
        };

        dst.set_shape(attn_shape.clone());

        let mut tensors = src_descs;
        tensors.push(TensorDesc::new(vec![bs], DType::S32));
        tensors.push(TensorDesc::new(attn_shape, dst.dtype()));
        if let Some(shape) = bias_shape {
            // drop size-1 axes; the kernel broadcasts the rest
            let squeezed: Vec<usize> = shape.into_iter().filter(|&d| d != 1).collect();
            tensors.push(TensorDesc {
                shape: squeezed,
                dtype: DType::F32,
                format: TensorFormat::Plain,
            });
        }

        let desc = OperatorDesc::new(
            KernelKind::MhaDense,
            tensors,
            attrs,
            rayon::current_num_threads(),
        )?;
        self.build_kernel(desc)?;

        if !self.dst_reshape.is_empty() {
            let dims = Self::resolve_reshape(&self.dst_reshape, dst.numel())?;
            dst.set_shape(dims);
        }
        Ok(())
    }

    fn reshape_sparse(&mut self) -> Result<()> {
        let AttentionInputs::Split { q, .. } = self.inputs.as_ref().unwrap() else {
            bail!("sparse attention requires split Q/K/V inputs");
        };
        let q_shape = q.shape();
        let batch_minor = q.format() == TensorFormat::BatchMinor;
        self.src_shape = q_shape.clone();
        if batch_minor {
            // blocked layout: [batch, head_num, head_size, _, seq]
            self.bs = q_shape[0];
            self.head_num = q_shape[1];
            self.head_size = q_shape[2];
            self.seq_len = q_shape[4];
        } else {
            // [head_num, head_size, batch, seq]
            self.head_num = q_shape[0];
            self.head_size = q_shape[1];
            self.bs = q_shape[2];
            self.seq_len = q_shape[3];
        }
        self.hidden = self.head_num * self.head_size;

        let mut attrs = self.common_attrs();
        attrs.insert("seq_pad".into(), self.seq_len.to_string());
        attrs.insert("batch".into(), self.bs.to_string());
        attrs.insert("head_num".into(), self.head_num.to_string());
        attrs.insert("k".into(), self.head_size.to_string());
        attrs.insert("seq_len".into(), self.seq_len.to_string());

        let kernel_shape = vec![self.bs, self.head_num, self.head_size, self.seq_len];
        let tensors = vec![
            TensorDesc::new(kernel_shape.clone(), DType::S8),
            TensorDesc::new(kernel_shape.clone(), DType::S8),
            TensorDesc::new(kernel_shape.clone(), DType::S8),
            TensorDesc::new(vec![self.bs, self.seq_len], DType::F32),
            TensorDesc::new(kernel_shape, DType::U8),
        ];
        let desc = OperatorDesc::new(
            KernelKind::MhaTranspose,
            tensors,
            attrs,
            rayon::current_num_threads(),
        )?;
        self.build_kernel(desc)?;

        let dst = self.dst.as_ref().unwrap();
        dst.set_shape(vec![self.bs, self.seq_len, self.head_num, self.head_size]);
        if !self.dst_reshape.is_empty() {
            if batch_minor {
                dst.set_shape(vec![self.bs, self.hidden, self.seq_len]);
            } else {
                let dims = Self::resolve_reshape(&self.dst_reshape, dst.numel())?;
                dst.set_shape(dims);
            }
        }
        Ok(())
    }

    /// Dense merged input: resolve the three source pointers inside the one
    /// allocation per the offset contract.
    fn merged_sources(&self, qkv: &Arc<Tensor>) -> Result<[RtBuf; 3]> {
        let base = qkv.mutable_data()?;
        let total = qkv.size_bytes();
        let (k_off, v_off) = merged_qkv_offsets(self.hidden);
        Ok([
            RtBuf::new(base, total),
            RtBuf::new(unsafe { base.add(k_off) }, total - k_off),
            RtBuf::new(unsafe { base.add(v_off) }, total - v_off),
        ])
    }

    /// Decoder-only graphs hand in an all-ones mask with unequal Q/K
    /// sequence lengths; broadcast the key length to every batch entry so
    /// the kernel attends over the whole cache. Gated by the `decoder_mask`
    /// attribute.
    fn rewrite_decoder_mask(&self, q: &Arc<Tensor>, k: &Arc<Tensor>, mask: &Arc<Tensor>) -> Result<()> {
        if !self.decoder_mask_auto {
            return Ok(());
        }
        let q_seq = q.shape()[1];
        let k_seq = k.shape()[1];
        if q_seq == k_seq {
            return Ok(());
        }
        let mask_data = mask.as_mut_slice::<i32>()?;
        if mask_data.iter().any(|&m| m != 1) {
            return Ok(());
        }
        mask_data.par_iter_mut().for_each(|m| *m = k_seq as i32);
        Ok(())
    }

    fn forward_dense(&mut self) -> Result<()> {
        let inputs = self.inputs.as_ref().unwrap();
        let dst = self.dst.as_ref().unwrap();
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| anyhow!("operator '{}' forward before reshape", self.name))?;

        let sources = match inputs {
            AttentionInputs::Split { q, k, v, mask, .. } => {
                self.rewrite_decoder_mask(q, k, mask)?;
                [
                    RtBuf::new(q.mutable_data()?, q.size_bytes()),
                    RtBuf::new(k.mutable_data()?, k.size_bytes()),
                    RtBuf::new(v.mutable_data()?, v.size_bytes()),
                ]
            }
            AttentionInputs::Merged { qkv, .. } => self.merged_sources(qkv)?,
        };

        let mask = inputs.mask();
        let bias = match inputs.bias() {
            Some(b) => RtBuf::new(b.mutable_data()?, b.size_bytes()),
            None => RtBuf::null(),
        };

        let workspace = self.alloc.acquire(kernel.workspace_size().max(1));
        let mut rt = [RtBuf::null(); mha_io::COUNT];
        rt[mha_io::QUERY] = sources[0];
        rt[mha_io::KEY] = sources[1];
        rt[mha_io::VALUE] = sources[2];
        rt[mha_io::MASK] = RtBuf::new(mask.mutable_data()?, mask.size_bytes());
        rt[mha_io::DST] = RtBuf::new(dst.mutable_data()?, dst.size_bytes());
        rt[mha_io::WORKSPACE] = RtBuf::new(workspace.ptr, workspace.size);
        rt[mha_io::BINARY_ADD] = bias;

        let result = kernel.execute(&rt);
        self.alloc.unref(&workspace);
        result?;

        unref_tensors(&self.raw_inputs);
        self.stage = Stage::Executable;
        Ok(())
    }

    fn forward_sparse(&mut self) -> Result<()> {
        let inputs = self.inputs.as_ref().unwrap();
        let dst = self.dst.as_ref().unwrap();
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| anyhow!("operator '{}' forward before reshape", self.name))?;
        let AttentionInputs::Split { q, k, v, mask, .. } = inputs else {
            bail!("sparse attention requires split Q/K/V inputs");
        };

        let plain = q.format() != TensorFormat::BatchMinor;
        if plain {
            // re-layout into the kernel's batch-minor order; dominant extra
            // cost of the sparse path
            for t in [q, k, v] {
                t.set_shape(self.src_shape.clone());
                kernels::reorder::reorder_tensor(t, &[2, 0, 1, 3])?;
            }
        }

        let final_shape = dst.shape();
        dst.set_shape(vec![self.bs, self.head_num, self.head_size, self.seq_len]);

        let workspace = self.alloc.acquire(kernel.workspace_size().max(1));
        let mut rt = [RtBuf::null(); mha_io::COUNT];
        rt[mha_io::QUERY] = RtBuf::new(q.mutable_data()?, q.size_bytes());
        rt[mha_io::KEY] = RtBuf::new(k.mutable_data()?, k.size_bytes());
        rt[mha_io::VALUE] = RtBuf::new(v.mutable_data()?, v.size_bytes());
        rt[mha_io::MASK] = RtBuf::new(mask.mutable_data()?, mask.size_bytes());
        rt[mha_io::DST] = RtBuf::new(dst.mutable_data()?, dst.size_bytes());
        rt[mha_io::WORKSPACE] = RtBuf::new(workspace.ptr, workspace.size);

        let result = kernel.execute(&rt);
        self.alloc.unref(&workspace);
        result?;

        if plain {
            // [batch, head, head_size, seq] -> [batch, seq, head, head_size]
            kernels::reorder::reorder_tensor(dst, &[0, 3, 1, 2])?;
        }
        dst.set_shape(final_shape);

        unref_tensors(&self.raw_inputs);
        self.stage = Stage::Executable;
        Ok(())
    }
}

impl Operator for MultiHeadAttentionOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &str {
        "MultiHeadAttention"
    }

    fn prepare(&mut self, input: &[Arc<Tensor>], output: &[Arc<Tensor>]) -> Result<()> {
        let inputs = AttentionInputs::bind(input)?;
        let dst = output
            .first()
            .ok_or_else(|| anyhow!("operator '{}' has no output tensor", self.name))?
            .clone();

        if inputs.bias().is_some() && self.is_sparse {
            bail!(
                "operator '{}': an additive attention mask cannot be combined with the sparse path",
                self.name
            );
        }
        let act = inputs.activation_dtype();
        if act != DType::S8 {
            bail!(
                "operator '{}' supports only s8 activations, got {}",
                self.name,
                act.as_str()
            );
        }
        if dst.dtype() != DType::U8 && dst.dtype() != DType::F32 {
            bail!(
                "operator '{}' destination must be u8 or fp32, got {}",
                self.name,
                dst.dtype().as_str()
            );
        }

        let calib = inputs.calib();
        let q_scales = calib.q.scales(DType::S8)?;
        let k_scales = calib.k.scales(DType::S8)?;
        let v_scales = calib.v.scales(DType::S8)?;
        // post-softmax activations quantize to u8
        let qk_scales = calib.qk.scales(DType::U8)?;
        let dst_scales = calib.dst.scales(dst.dtype())?;

        self.q_scale = q_scales[0];
        self.k_scale = k_scales[0];
        self.v_scale = v_scales[0];
        self.dst_scale = dst_scales[0];
        self.qk_rescale = quant::rescale(q_scales[0], k_scales[0], None) * self.output_scale;
        self.softmax_rescale = 1.0 / qk_scales[0];
        self.qkv_rescale = quant::rescale(qk_scales[0], v_scales[0], Some(dst_scales[0]));
        self.dst_zp = quant::zero_point(calib.dst.min0()?, dst_scales[0], dst.dtype());
        if self.is_sparse {
            // sparse kernels fold the attention temperature into the rescale
            let head_size = Self::head_size_hint(&inputs) as f32;
            self.qk_rescale /= head_size.sqrt();
        }

        self.raw_inputs = input.to_vec();
        self.inputs = Some(inputs);
        self.dst = Some(dst);
        self.stage = Stage::Prepared;
        Ok(())
    }

    fn reshape(&mut self, _input: &[Arc<Tensor>], _output: &[Arc<Tensor>]) -> Result<()> {
        if self.stage == Stage::Unconfigured {
            bail!("operator '{}' reshape before prepare", self.name);
        }
        if self.is_sparse {
            self.reshape_sparse()
        } else {
            self.reshape_dense()
        }
    }

    fn forward(&mut self, _input: &[Arc<Tensor>], _output: &[Arc<Tensor>]) -> Result<()> {
        if self.inputs.is_none() {
            bail!("operator '{}' forward before prepare", self.name);
        }
        if self.is_sparse {
            self.forward_sparse()
        } else {
            self.forward_dense()
        }
    }

    fn kernel_kind(&self) -> Option<KernelKind> {
        Some(if self.is_sparse {
            KernelKind::MhaTranspose
        } else {
            KernelKind::MhaDense
        })
    }

    fn descriptor(&self) -> Option<&OperatorDesc> {
        self.desc.as_ref()
    }

    fn set_kernel_choice(&mut self, choice: Option<String>) {
        self.kernel_choice = choice;
    }

    fn kernel_choice(&self) -> Option<&str> {
        self.kernel_choice.as_deref()
    }
}

impl MultiHeadAttentionOperator {
    /// Head size as visible before reshape derives it, for the sparse
    /// temperature fold.
    fn head_size_hint(inputs: &AttentionInputs) -> usize {
        match inputs {
            AttentionInputs::Split { q, .. } => {
                let s = q.shape();
                if q.format() == TensorFormat::BatchMinor {
                    s.get(2).copied().unwrap_or(1)
                } else {
                    s.get(1).copied().unwrap_or(1)
                }
            }
            AttentionInputs::Merged { qkv, .. } => {
                qkv.shape().last().copied().unwrap_or(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pool::PoolAllocator;
    use std::collections::BTreeMap;

    fn conf(name: &str, attrs: &[(&str, &str)]) -> OperatorConfig {
        OperatorConfig {
            name: name.to_string(),
            op_type: "MultiHeadAttention".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn f32s(name: &str, shape: Vec<usize>, vals: &[f32]) -> Arc<Tensor> {
        let bytes = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        Arc::new(Tensor::from_data(name, DType::F32, shape, bytes))
    }

    fn i32s(name: &str, shape: Vec<usize>, vals: &[i32]) -> Arc<Tensor> {
        let bytes = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        Arc::new(Tensor::from_data(name, DType::S32, shape, bytes))
    }

    fn s8s(name: &str, shape: Vec<usize>, vals: &[i8]) -> Arc<Tensor> {
        let bytes = vals.iter().map(|&v| v as u8).collect();
        Arc::new(Tensor::from_data(name, DType::S8, shape, bytes))
    }

    /// q/k/v at scale 1, softmax quantized over the unit interval, dst over
    /// the full u8 range with zero point 0.
    fn calib_tensors() -> Vec<Arc<Tensor>> {
        let mut out = Vec::new();
        for (tag, lo, hi) in [
            ("Q", -127.0f32, 127.0f32),
            ("K", -127.0, 127.0),
            ("V", -127.0, 127.0),
            ("QK", 0.0, 1.0),
            ("dst", 0.0, 255.0),
        ] {
            out.push(f32s(&format!("{}_min", tag), vec![1], &[lo]));
            out.push(f32s(&format!("{}_max", tag), vec![1], &[hi]));
        }
        out
    }

    fn dst_tensor(alloc: &Arc<PoolAllocator>) -> Arc<Tensor> {
        Arc::new(Tensor::new(
            "attn_out",
            DType::U8,
            TensorFormat::Plain,
            vec![],
            Some(alloc.clone() as Arc<dyn Memory>),
        ))
    }

    fn run_op(
        op: &mut MultiHeadAttentionOperator,
        input: &[Arc<Tensor>],
        output: &[Arc<Tensor>],
    ) -> Result<()> {
        op.prepare(input, output)?;
        op.reshape(input, output)?;
        op.forward(input, output)
    }

    #[test]
    fn test_merged_qkv_offsets_contract() {
        assert_eq!(merged_qkv_offsets(64), (64, 128));
        assert_eq!(merged_qkv_offsets(2), (2, 4));
    }

    #[test]
    fn test_unsupported_arity_rejected() {
        let alloc = Arc::new(PoolAllocator::new());
        let mut op =
            MultiHeadAttentionOperator::new(&conf("mha", &[]), alloc.clone()).unwrap();
        let input: Vec<Arc<Tensor>> = calib_tensors(); // only 10 tensors
        let output = vec![dst_tensor(&alloc)];
        assert!(op.prepare(&input, &output).is_err());
    }

    #[test]
    fn test_sparse_with_additive_mask_rejected_before_kernel_build() {
        let alloc = Arc::new(PoolAllocator::new());
        // positive leading reshape dim selects the sparse path
        let mut op =
            MultiHeadAttentionOperator::new(&conf("mha", &[("reshape", "1,2,1,1")]), alloc.clone())
                .unwrap();
        assert!(op.is_sparse);

        let q = s8s("q", vec![1, 1, 1, 2], &[1, 1]);
        let k = s8s("k", vec![1, 1, 1, 2], &[1, 1]);
        let v = s8s("v", vec![1, 1, 1, 2], &[100, 50]);
        let mask = f32s("mask", vec![1, 2], &[0.0, 0.0]);
        let bias = f32s("bias", vec![1, 2, 2], &[0.0; 4]);
        let mut input = vec![q, k, v, mask, bias];
        input.extend(calib_tensors());
        assert_eq!(input.len(), 15);
        let output = vec![dst_tensor(&alloc)];

        let err = op.prepare(&input, &output).unwrap_err();
        assert!(err.to_string().contains("sparse"), "{}", err);
        assert!(op.kernel.is_none(), "kernel must not be constructed");
    }

    #[test]
    fn test_decoder_mask_rewritten_to_key_seq_len() {
        let alloc = Arc::new(PoolAllocator::new());
        let mut op = MultiHeadAttentionOperator::new(&conf("mha", &[]), alloc.clone()).unwrap();

        // q_seq 1 != k_seq 4 with an all-ones mask: decoder pattern
        let q = s8s("q", vec![1, 1, 2, 4], &[1; 8]);
        let k = s8s("k", vec![1, 4, 2, 4], &[1; 32]);
        let v = s8s("v", vec![1, 4, 2, 4], &[50; 32]);
        let mask = i32s("mask", vec![1], &[1]);
        let mut input = vec![q, k, v, mask.clone()];
        input.extend(calib_tensors());
        let output = vec![dst_tensor(&alloc)];

        run_op(&mut op, &input, &output).unwrap();
        assert_eq!(mask.as_slice::<i32>().unwrap(), &[4]);
    }

    #[test]
    fn test_non_ones_mask_left_untouched() {
        let alloc = Arc::new(PoolAllocator::new());
        let mut op = MultiHeadAttentionOperator::new(&conf("mha", &[]), alloc.clone()).unwrap();

        let q = s8s("q", vec![1, 1, 2, 4], &[1; 8]);
        let k = s8s("k", vec![1, 4, 2, 4], &[1; 32]);
        let v = s8s("v", vec![1, 4, 2, 4], &[50; 32]);
        let mask = i32s("mask", vec![1], &[2]);
        let mut input = vec![q, k, v, mask.clone()];
        input.extend(calib_tensors());
        let output = vec![dst_tensor(&alloc)];

        run_op(&mut op, &input, &output).unwrap();
        assert_eq!(mask.as_slice::<i32>().unwrap(), &[2]);
    }

    #[test]
    fn test_decoder_rewrite_disabled_by_attribute() {
        let alloc = Arc::new(PoolAllocator::new());
        let mut op =
            MultiHeadAttentionOperator::new(&conf("mha", &[("decoder_mask", "off")]), alloc.clone())
                .unwrap();

        let q = s8s("q", vec![1, 1, 2, 4], &[1; 8]);
        let k = s8s("k", vec![1, 4, 2, 4], &[1; 32]);
        let v = s8s("v", vec![1, 4, 2, 4], &[50; 32]);
        let mask = i32s("mask", vec![1], &[1]);
        let mut input = vec![q, k, v, mask.clone()];
        input.extend(calib_tensors());
        let output = vec![dst_tensor(&alloc)];

        run_op(&mut op, &input, &output).unwrap();
        assert_eq!(mask.as_slice::<i32>().unwrap(), &[1]);
    }

    #[test]
    fn test_merged_dense_forward() {
        let alloc = Arc::new(PoolAllocator::new());
        let mut op = MultiHeadAttentionOperator::new(&conf("mha", &[]), alloc.clone()).unwrap();

        // [batch=1, seq=2, 3, head=1, head_size=2]; per-token rows are
        // [q0, q1, k0, k1, v0, v1]
        let qkv = s8s(
            "qkv",
            vec![1, 2, 3, 1, 2],
            &[1, 1, 1, 1, 100, 100, 1, 1, 1, 1, 50, 50],
        );
        let mask = i32s("mask", vec![1], &[2]);
        let mut input = vec![qkv, mask];
        input.extend(calib_tensors());
        assert_eq!(input.len(), 12);
        let output = vec![dst_tensor(&alloc)];

        run_op(&mut op, &input, &output).unwrap();
        let dst = &output[0];
        assert_eq!(dst.shape(), vec![1, 2, 1, 2]);
        assert_eq!(dst.dtype(), DType::U8);
        // equal logits average the two value rows: (100 + 50) / 2
        assert_eq!(dst.as_slice::<u8>().unwrap(), &[75, 75, 75, 75]);
    }

    #[test]
    fn test_sparse_forward_reorders_and_averages() {
        let alloc = Arc::new(PoolAllocator::new());
        let mut op =
            MultiHeadAttentionOperator::new(&conf("mha", &[("reshape", "1,2,1,1")]), alloc.clone())
                .unwrap();
        assert!(op.is_sparse);

        // plain sparse input layout: [head_num, head_size, batch, seq]
        let q = s8s("q", vec![1, 1, 1, 2], &[1, 1]);
        let k = s8s("k", vec![1, 1, 1, 2], &[1, 1]);
        let v = s8s("v", vec![1, 1, 1, 2], &[100, 50]);
        let mask = f32s("mask", vec![1, 2], &[0.0, 0.0]);
        let mut input = vec![q, k, v, mask];
        input.extend(calib_tensors());
        assert_eq!(input.len(), 14);
        let output = vec![dst_tensor(&alloc)];

        run_op(&mut op, &input, &output).unwrap();
        let dst = &output[0];
        assert_eq!(dst.shape(), vec![1, 2, 1, 1]);
        assert_eq!(dst.as_slice::<u8>().unwrap(), &[75, 75]);
    }
}
