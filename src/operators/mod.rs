use anyhow::{bail, Result};
use std::sync::Arc;

use crate::core::memory::Memory;
use crate::core::tensor::Tensor;
use crate::kernels::{KernelKind, OperatorDesc};
use crate::model::config::OperatorConfig;

pub mod multi_head_attention;

pub use multi_head_attention::MultiHeadAttentionOperator;

/// One graph node. Drives through three phases: `prepare` (bind inputs,
/// derive quantization parameters, cache anything shape-independent),
/// `reshape` (derive output shapes and build the kernel for the current
/// input shapes) and `forward` (execute). `reshape` runs again whenever an
/// input's concrete shape changes.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn op_type(&self) -> &str;

    fn prepare(&mut self, input: &[Arc<Tensor>], output: &[Arc<Tensor>]) -> Result<()> {
        let _ = (input, output);
        Ok(())
    }

    fn reshape(&mut self, input: &[Arc<Tensor>], output: &[Arc<Tensor>]) -> Result<()> {
        let _ = (input, output);
        Ok(())
    }

    fn forward(&mut self, input: &[Arc<Tensor>], output: &[Arc<Tensor>]) -> Result<()> {
        let _ = (input, output);
        Ok(())
    }

    /// Kernel kind this operator dispatches on, if any.
    fn kernel_kind(&self) -> Option<KernelKind> {
        None
    }

    /// Descriptor built by the last `reshape`, for the dispatcher to
    /// benchmark candidates against.
    fn descriptor(&self) -> Option<&OperatorDesc> {
        None
    }

    /// Pin the kernel implementation the next `reshape` must build.
    /// `None` restores the kind's default.
    fn set_kernel_choice(&mut self, choice: Option<String>) {
        let _ = choice;
    }

    fn kernel_choice(&self) -> Option<&str> {
        None
    }
}

/// Graph-boundary sentinel: owns the model inputs and weights as outputs,
/// performs no compute.
pub struct InputOperator {
    name: String,
}

impl Operator for InputOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &str {
        "Input"
    }
}

/// Graph-boundary sentinel: its inputs are the model outputs.
pub struct OutputOperator {
    name: String,
}

impl Operator for OutputOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &str {
        "Output"
    }
}

/// Build an operator from its configured type tag.
pub fn build(conf: &OperatorConfig, alloc: Arc<dyn Memory>) -> Result<Box<dyn Operator>> {
    match conf.op_type.as_str() {
        "Input" => Ok(Box::new(InputOperator {
            name: conf.name.clone(),
        })),
        "Output" => Ok(Box::new(OutputOperator {
            name: conf.name.clone(),
        })),
        "MultiHeadAttention" => Ok(Box::new(MultiHeadAttentionOperator::new(conf, alloc)?)),
        other => bail!("unknown operator type '{}' for operator '{}'", other, conf.name),
    }
}

/// Drop one life from every tensor an operator consumed this pass.
pub(crate) fn unref_tensors(tensors: &[Arc<Tensor>]) {
    for t in tensors {
        t.unref();
    }
}
