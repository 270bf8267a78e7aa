//! Per-operator kernel selection.
//!
//! Every graph node is driven through a `Dispatcher`. In serving mode it
//! pins the persisted kernel choice (or the kind's default) before the
//! operator's reshape builds its kernel; in tuning mode it benchmarks every
//! registered candidate against representative data and records the fastest
//! into the dispatch table.

use anyhow::Result;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Instant;

use crate::core::buffer::DType;
use crate::core::tensor::Tensor;
use crate::kernels::{self, mha_io, OperatorDesc, RtBuf};
use crate::operators::Operator;

pub mod table;

pub use table::{DispatchTable, TableEntry};

/// Timed executions per candidate during tuning.
const TUNE_RUNS: u32 = 10;

pub struct Dispatcher {
    op: Box<dyn Operator>,
}

impl Dispatcher {
    pub fn new(op: Box<dyn Operator>) -> Self {
        Self { op }
    }

    pub fn name(&self) -> &str {
        self.op.name()
    }

    pub fn op_type(&self) -> &str {
        self.op.op_type()
    }

    pub fn kernel_choice(&self) -> Option<&str> {
        self.op.kernel_choice()
    }

    pub fn prepare(&mut self, input: &[Arc<Tensor>], output: &[Arc<Tensor>]) -> Result<()> {
        self.op.prepare(input, output)
    }

    pub fn reshape(&mut self, input: &[Arc<Tensor>], output: &[Arc<Tensor>]) -> Result<()> {
        self.op.reshape(input, output)
    }

    pub fn forward(&mut self, input: &[Arc<Tensor>], output: &[Arc<Tensor>]) -> Result<()> {
        let start = Instant::now();
        self.op.forward(input, output)?;
        debug!(
            "operator '{}' ({}) forward {:.3} ms",
            self.op.name(),
            self.op.op_type(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    /// Dispatch-table key for the current input shapes. Re-tuning and
    /// kernel rebuilds key off this, so a dynamic axis resolving to a new
    /// value lands on a fresh entry.
    pub fn table_key(&self, input: &[Arc<Tensor>]) -> String {
        let sig: Vec<String> = input
            .iter()
            .map(|t| {
                t.shape()
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join("x")
            })
            .collect();
        format!("{}|{}", self.op.name(), sig.join(";"))
    }

    /// Select the kernel implementation for the current input shapes.
    ///
    /// Serving mode only pins the choice; the model's reshape pass performs
    /// the actual build. Tuning mode reshapes eagerly to obtain the
    /// descriptor, benchmarks, records the winner and rebuilds with it.
    pub fn select_kernel(
        &mut self,
        input: &[Arc<Tensor>],
        output: &[Arc<Tensor>],
        table: &mut DispatchTable,
        tuning: bool,
    ) -> Result<()> {
        if self.op.kernel_kind().is_none() {
            return Ok(());
        }
        let key = self.table_key(input);
        if !tuning {
            let choice = table.get(&key).map(|e| e.kernel_impl.clone());
            self.op.set_kernel_choice(choice);
            return Ok(());
        }

        self.op.reshape(input, output)?;
        let Some(desc) = self.op.descriptor().cloned() else {
            return Ok(());
        };
        if let Some(winner) = tune(&desc) {
            let rebuild = self.op.kernel_choice() != Some(winner.as_str());
            table.insert(
                key,
                TableEntry {
                    kernel_impl: winner.clone(),
                    attrs: desc.attrs.clone(),
                },
            );
            self.op.set_kernel_choice(Some(winner));
            if rebuild {
                self.op.reshape(input, output)?;
            }
        }
        Ok(())
    }
}

/// Benchmark every registered candidate for the descriptor and return the
/// fastest one. A candidate that fails to build is skipped; `None` means no
/// candidate survived.
fn tune(desc: &OperatorDesc) -> Option<String> {
    let mut best: Option<(String, f64)> = None;
    for &name in kernels::candidates(desc.kind) {
        let kernel = match kernels::build(desc, Some(name)) {
            Ok(k) => k,
            Err(e) => {
                warn!("tuning: candidate '{}' failed to build, skipping: {}", name, e);
                continue;
            }
        };

        // representative buffers, aligned and shaped per the descriptor
        let mut buffers: Vec<Vec<u64>> = Vec::new();
        let mut rt = vec![RtBuf::null(); mha_io::COUNT];
        for (i, t) in desc.tensors.iter().enumerate() {
            let mut bytes = t.shape.iter().product::<usize>() * t.dtype.size();
            if i <= mha_io::VALUE && desc.attr_is("merged_QKV", "True") {
                // sources are strided views into one merged allocation
                bytes *= 3;
            }
            let mut buf = vec![0u64; bytes.max(1).div_ceil(8)];
            fill_representative(&mut buf, bytes, t.dtype);
            let role = if i < mha_io::WORKSPACE { i } else { mha_io::BINARY_ADD };
            rt[role] = RtBuf::new(buf.as_mut_ptr() as *mut u8, bytes);
            buffers.push(buf);
        }
        let ws_bytes = kernel.workspace_size().max(1);
        let mut ws = vec![0u64; ws_bytes.div_ceil(8)];
        rt[mha_io::WORKSPACE] = RtBuf::new(ws.as_mut_ptr() as *mut u8, ws_bytes);

        if let Err(e) = kernel.execute(&rt) {
            warn!("tuning: candidate '{}' failed to run, skipping: {}", name, e);
            continue;
        }
        let start = Instant::now();
        let mut ok = true;
        for _ in 0..TUNE_RUNS {
            if kernel.execute(&rt).is_err() {
                ok = false;
                break;
            }
        }
        if !ok {
            continue;
        }
        let avg_ms = start.elapsed().as_secs_f64() * 1000.0 / TUNE_RUNS as f64;
        debug!("tuning: '{}' averaged {:.4} ms", name, avg_ms);
        if best.as_ref().is_none_or(|(_, t)| avg_ms < *t) {
            best = Some((name.to_string(), avg_ms));
        }
    }
    best.map(|(name, _)| name)
}

fn fill_representative(buf: &mut [u64], bytes: usize, dtype: DType) {
    use rand::Rng;
    match dtype {
        DType::S8 => {
            let data =
                unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut i8, bytes) };
            let mut rng = rand::rng();
            for v in data.iter_mut() {
                *v = rng.random_range(-127..=127);
            }
        }
        DType::S32 => {
            // worst-case mask: attend over the whole sequence
            let data = unsafe {
                std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut i32, bytes / 4)
            };
            data.fill(i32::MAX);
        }
        // f32 masks/bias stay zero, destinations are overwritten anyway
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::{DType, TensorFormat};
    use crate::core::memory::Memory;
    use crate::memory::pool::PoolAllocator;
    use crate::model::config::OperatorConfig;
    use crate::operators::MultiHeadAttentionOperator;
    use std::collections::BTreeMap;

    fn mha_io_tensors(alloc: &Arc<PoolAllocator>) -> (Vec<Arc<Tensor>>, Vec<Arc<Tensor>>) {
        let s8 = |name: &str, shape: Vec<usize>, val: i8| {
            let n: usize = shape.iter().product();
            Arc::new(Tensor::from_data(name, DType::S8, shape, vec![val as u8; n]))
        };
        let f32s = |name: &str, vals: &[f32]| {
            let bytes = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
            Arc::new(Tensor::from_data(name, DType::F32, vec![vals.len()], bytes))
        };
        let mask_bytes: Vec<u8> = 4i32.to_le_bytes().to_vec();
        let mut input = vec![
            s8("q", vec![1, 4, 2, 8], 1),
            s8("k", vec![1, 4, 2, 8], 1),
            s8("v", vec![1, 4, 2, 8], 3),
            Arc::new(Tensor::from_data("mask", DType::S32, vec![1], mask_bytes)),
        ];
        for (tag, lo, hi) in [
            ("Q", -127.0f32, 127.0f32),
            ("K", -127.0, 127.0),
            ("V", -127.0, 127.0),
            ("QK", 0.0, 1.0),
            ("dst", 0.0, 255.0),
        ] {
            input.push(f32s(&format!("{}_min", tag), &[lo]));
            input.push(f32s(&format!("{}_max", tag), &[hi]));
        }
        let dst = Arc::new(Tensor::new(
            "attn_out",
            DType::U8,
            TensorFormat::Plain,
            vec![],
            Some(alloc.clone() as Arc<dyn Memory>),
        ));
        (input, vec![dst])
    }

    fn mha_dispatcher(alloc: &Arc<PoolAllocator>) -> Dispatcher {
        let conf = OperatorConfig {
            name: "mha0".to_string(),
            op_type: "MultiHeadAttention".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
        };
        Dispatcher::new(Box::new(
            MultiHeadAttentionOperator::new(&conf, alloc.clone()).unwrap(),
        ))
    }

    #[test]
    fn test_tuning_then_serving_selects_recorded_kernel() {
        let alloc = Arc::new(PoolAllocator::new());
        let (input, output) = mha_io_tensors(&alloc);

        // tuning pass records a winner
        let mut table = DispatchTable::default();
        let mut tuned = mha_dispatcher(&alloc);
        tuned.prepare(&input, &output).unwrap();
        tuned
            .select_kernel(&input, &output, &mut table, true)
            .unwrap();
        let key = tuned.table_key(&input);
        let recorded = table
            .get(&key)
            .expect("tuning must record an entry")
            .kernel_impl
            .clone();
        assert_eq!(tuned.kernel_choice(), Some(recorded.as_str()));

        // a fresh serving instance lands on the identical implementation
        let (input2, output2) = mha_io_tensors(&alloc);
        let mut serving = mha_dispatcher(&alloc);
        serving.prepare(&input2, &output2).unwrap();
        serving
            .select_kernel(&input2, &output2, &mut table, false)
            .unwrap();
        serving.reshape(&input2, &output2).unwrap();
        assert_eq!(serving.kernel_choice(), Some(recorded.as_str()));
    }

    #[test]
    fn test_serving_without_entry_uses_default() {
        let alloc = Arc::new(PoolAllocator::new());
        let (input, output) = mha_io_tensors(&alloc);
        let mut table = DispatchTable::default();
        let mut d = mha_dispatcher(&alloc);
        d.prepare(&input, &output).unwrap();
        d.select_kernel(&input, &output, &mut table, false).unwrap();
        d.reshape(&input, &output).unwrap();
        // no pinned choice: the kind default is used
        assert_eq!(d.kernel_choice(), None);
        d.forward(&input, &output).unwrap();
    }

    #[test]
    fn test_table_key_tracks_shapes() {
        let alloc = Arc::new(PoolAllocator::new());
        let (input, _) = mha_io_tensors(&alloc);
        let d = mha_dispatcher(&alloc);
        let key = d.table_key(&input[..1]);
        assert_eq!(key, "mha0|1x4x2x8");
    }
}
