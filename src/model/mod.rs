//! The graph executor. Owns the full tensor set, resolves producer/consumer
//! edges from the named-tensor table, drives Prepare/Reshape/Forward over
//! the operator list in declaration order, and fans multi-stream operators
//! out to a bounded worker pool.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::core::buffer::{DType, TensorFormat};
use crate::core::memory::Memory;
use crate::core::tensor::Tensor;
use crate::dispatch::{DispatchTable, Dispatcher};
use crate::memory::pool::PoolAllocator;
use crate::memory::shared::SharedRegion;
use crate::operators;

pub mod config;
pub mod weights;

use config::{ModelConfig, TensorConfig};
use weights::WeightReader;

/// Behavior knobs the environment selects. Constructed explicitly and
/// passed in; `from_env` reads the conventional variables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Map weights into a cross-process shared region instead of private
    /// buffers.
    pub shared_weight: bool,
    /// Benchmark kernel candidates and persist the winners instead of
    /// executing the graph.
    pub tuning: bool,
    pub dispatch_table_path: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            shared_weight: false,
            tuning: false,
            dispatch_table_path: Self::default_table_path(),
        }
    }
}

impl EngineOptions {
    pub fn from_env() -> Self {
        let dispatch_table_path = match std::env::var_os("ENGINE_DISPATCH_TABLE_FILE_ROOT") {
            Some(root) => PathBuf::from(root),
            None => Self::default_table_path(),
        };
        Self {
            shared_weight: std::env::var_os("ENGINE_SHARED_WEIGHT").is_some(),
            tuning: std::env::var_os("ENGINE_DISPATCHER_TUNING_ON").is_some(),
            dispatch_table_path,
        }
    }

    fn default_table_path() -> PathBuf {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".cache/qnn_workspace"))
            .unwrap_or_else(std::env::temp_dir);
        base.join("engine_dispatch_table.json")
    }
}

pub struct Model {
    name: String,
    operators: Vec<Dispatcher>,
    tensors: Vec<Arc<Tensor>>,
    input_vecs: Vec<Vec<Arc<Tensor>>>,
    output_vecs: Vec<Vec<Arc<Tensor>>>,
    model_input_tensors: Vec<Arc<Tensor>>,
    model_input_configs: Vec<TensorConfig>,
    model_output_tensors: Vec<Arc<Tensor>>,
    alloc: Arc<PoolAllocator>,
    options: EngineOptions,
    dispatch_table: DispatchTable,
    /// operator index -> declared stream concurrency
    multi_stream_tasks: BTreeMap<usize, usize>,
    stream_pool: Option<rayon::ThreadPool>,
    shared_region: Option<SharedRegion>,
    reshape_passes: usize,
    first_pass: bool,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("name", &self.name).finish()
    }
}

impl Model {
    pub fn from_config(
        conf: &ModelConfig,
        weight_path: Option<&std::path::Path>,
        alloc: Arc<PoolAllocator>,
        options: EngineOptions,
    ) -> Result<Self> {
        let weights = weight_path.map(WeightReader::open).transpose()?;
        let shared_region = if options.shared_weight {
            Some(SharedRegion::attach(&format!("qnn_{}", conf.name))?)
        } else {
            None
        };

        let mut model = Self {
            name: conf.name.clone(),
            operators: Vec::new(),
            tensors: Vec::new(),
            input_vecs: vec![Vec::new(); conf.operators.len()],
            output_vecs: vec![Vec::new(); conf.operators.len()],
            model_input_tensors: Vec::new(),
            model_input_configs: Vec::new(),
            model_output_tensors: Vec::new(),
            dispatch_table: DispatchTable::load(&options.dispatch_table_path)?,
            alloc,
            options,
            multi_stream_tasks: BTreeMap::new(),
            stream_pool: None,
            shared_region,
            reshape_passes: 0,
            first_pass: true,
        };

        // build all the operators and wire their edges: every input must
        // come from some earlier output, model inputs and weights included
        let mut name_index: HashMap<String, usize> = HashMap::new();
        for (op_id, op_conf) in conf.operators.iter().enumerate() {
            let mem: Arc<dyn Memory> = model.alloc.clone();
            model
                .operators
                .push(Dispatcher::new(operators::build(op_conf, mem)?));
            for out_conf in &op_conf.outputs {
                model.set_output(op_id, op_conf, out_conf, weights.as_ref(), &mut name_index)?;
            }
            for in_conf in &op_conf.inputs {
                model.set_input(op_id, op_conf, in_conf, &name_index)?;
            }
        }
        for t in &model.tensors {
            debug!("tensor '{}' life {}", t.name(), t.life());
        }

        for i in 0..model.operators.len() {
            let (ins, outs) = (&model.input_vecs[i], &model.output_vecs[i]);
            model.operators[i]
                .prepare(ins, outs)
                .with_context(|| format!("prepare operator '{}'", conf.operators[i].name))?;
        }

        for (i, op_conf) in conf.operators.iter().enumerate() {
            if let Some(streams) = op_conf.attr("multi_stream") {
                let streams: usize = streams
                    .parse()
                    .map_err(|_| anyhow!("bad multi_stream on operator '{}'", op_conf.name))?;
                model.multi_stream_tasks.insert(i, streams.max(1));
            }
        }
        if let Some(&max_streams) = model.multi_stream_tasks.values().max() {
            let available = std::thread::available_parallelism().map_or(1, |n| n.get());
            let threads = (max_streams + (max_streams & 1)).min(available);
            model.stream_pool = Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .context("build multi-stream thread pool")?,
            );
            info!(
                "multi-stream pool initialized with {} threads ({} available)",
                threads, available
            );
        }

        Ok(model)
    }

    /// Tensor edge starting from an operator output. Weight outputs of the
    /// Input operator load their bytes here; location-less Input outputs are
    /// the model's inputs.
    fn set_output(
        &mut self,
        op_id: usize,
        op_conf: &config::OperatorConfig,
        t_conf: &TensorConfig,
        weights: Option<&WeightReader>,
        name_index: &mut HashMap<String, usize>,
    ) -> Result<()> {
        if name_index.contains_key(&t_conf.name) {
            bail!("duplicate output tensor name '{}'", t_conf.name);
        }
        let dtype = DType::from_str(&t_conf.dtype)?;
        let format = match &t_conf.format {
            Some(f) => TensorFormat::from_str(f)?,
            None => TensorFormat::Plain,
        };
        let tensor = Arc::new(Tensor::new(
            t_conf.name.clone(),
            dtype,
            format,
            t_conf.initial_dims(),
            Some(self.alloc.clone() as Arc<dyn Memory>),
        ));
        name_index.insert(t_conf.name.clone(), self.tensors.len());
        self.tensors.push(tensor.clone());
        self.output_vecs[op_id].push(tensor.clone());

        if op_conf.op_type == "Input" {
            if t_conf.is_weight() {
                let reader = weights.ok_or_else(|| {
                    anyhow!("weight tensor '{}' but no weight file given", t_conf.name)
                })?;
                let (offset, length) = (t_conf.location[0], t_conf.location[1]);
                match &self.shared_region {
                    Some(region) => {
                        let ptr = region.load_segment(offset, length, |buf| {
                            buf.copy_from_slice(reader.slice(offset, length)?);
                            Ok(())
                        })?;
                        tensor.bind_external(ptr, length as usize);
                    }
                    None => tensor.bind_owned(reader.slice(offset, length)?.to_vec()),
                }
            } else {
                self.model_input_tensors.push(tensor);
                self.model_input_configs.push(t_conf.clone());
            }
        }
        Ok(())
    }

    /// Tensor edge consumed by an operator; bumps the producer tensor's
    /// life. Output-operator inputs are the model's outputs.
    fn set_input(
        &mut self,
        op_id: usize,
        op_conf: &config::OperatorConfig,
        t_conf: &TensorConfig,
        name_index: &HashMap<String, usize>,
    ) -> Result<()> {
        let &id = name_index.get(&t_conf.name).ok_or_else(|| {
            anyhow!(
                "unknown input tensor '{}' on operator '{}'",
                t_conf.name,
                op_conf.name
            )
        })?;
        let tensor = self.tensors[id].clone();
        tensor.add_life(1);
        self.input_vecs[op_id].push(tensor.clone());
        if op_conf.op_type == "Output" {
            self.model_output_tensors.push(tensor);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reshape passes run so far; a second Forward with unchanged shapes
    /// must not add one.
    pub fn reshape_passes(&self) -> usize {
        self.reshape_passes
    }

    pub fn operator_kernel_choice(&self, name: &str) -> Option<&str> {
        self.operators
            .iter()
            .find(|d| d.name() == name)
            .and_then(|d| d.kernel_choice())
    }

    /// Run one pass over the graph. Takes one tensor per declared model
    /// input and returns one per declared model output (empty in tuning
    /// mode, which benchmarks instead of executing).
    pub fn forward(&mut self, input_data: &[Tensor]) -> Result<Vec<Tensor>> {
        if input_data.len() != self.model_input_tensors.len() {
            bail!(
                "model '{}' takes {} inputs, got {}",
                self.name,
                self.model_input_tensors.len(),
                input_data.len()
            );
        }

        let mut reshape_model = self.first_pass;
        for (i, data) in input_data.iter().enumerate() {
            let data_shape = data.shape();
            let conf_shape = &self.model_input_configs[i].shape;
            let origin_shape = self.model_input_tensors[i].shape();
            if data_shape.len() != conf_shape.len() {
                bail!(
                    "input '{}' rank {} does not match configured rank {}",
                    data.name(),
                    data_shape.len(),
                    conf_shape.len()
                );
            }
            for axis in 0..data_shape.len() {
                if data_shape[axis] != origin_shape[axis] {
                    // only axes declared dynamic may move between passes
                    if conf_shape[axis] != -1 {
                        bail!(
                            "input '{}' axis {} is {} but the model needs {}",
                            data.name(),
                            axis,
                            data_shape[axis],
                            conf_shape[axis]
                        );
                    }
                    reshape_model = true;
                }
            }
        }
        for (i, data) in input_data.iter().enumerate() {
            let target = &self.model_input_tensors[i];
            target.bind_external(data.mutable_data()?, data.size_bytes());
            target.set_shape(data.shape());
        }

        self.set_dispatch_kernel(reshape_model)?;

        if self.options.tuning {
            // tuning benchmarks in place of execution; winners were saved
            self.first_pass = false;
            return Ok(Vec::new());
        }

        if reshape_model {
            for i in 0..self.operators.len() {
                let (ins, outs) = (&self.input_vecs[i], &self.output_vecs[i]);
                self.operators[i]
                    .reshape(ins, outs)
                    .with_context(|| format!("reshape operator '{}'", self.operators[i].name()))?;
            }
            self.reshape_passes += 1;
        }

        self.run_forward_pass()?;
        self.first_pass = false;

        let mut outputs = Vec::with_capacity(self.model_output_tensors.len());
        for t in &self.model_output_tensors {
            let bytes = unsafe {
                std::slice::from_raw_parts(t.data()?, t.size_bytes())
            };
            outputs.push(Tensor::from_data(
                t.name(),
                t.dtype(),
                t.shape(),
                bytes.to_vec(),
            ));
        }
        Ok(outputs)
    }

    /// Serving mode refreshes table choices only when shapes moved; tuning
    /// mode re-selects (and re-benchmarks) every operator, then persists.
    fn set_dispatch_kernel(&mut self, reshape_model: bool) -> Result<()> {
        let tuning = self.options.tuning;
        if tuning || reshape_model {
            for i in 0..self.operators.len() {
                let (ins, outs) = (&self.input_vecs[i], &self.output_vecs[i]);
                self.operators[i].select_kernel(ins, outs, &mut self.dispatch_table, tuning)?;
            }
        }
        if tuning && !self.dispatch_table.is_empty() {
            self.dispatch_table.save(&self.options.dispatch_table_path)?;
            info!(
                "dispatch table saved to {}",
                self.options.dispatch_table_path.display()
            );
        }
        Ok(())
    }

    /// Declaration-order execution; consecutive multi-stream operators form
    /// fork-join groups on the worker pool, bounded by the group head's
    /// declared concurrency.
    fn run_forward_pass(&mut self) -> Result<()> {
        let n = self.operators.len();
        let mut i = 0;
        while i < n {
            let Some(&streams) = self.multi_stream_tasks.get(&i) else {
                let (ins, outs) = (&self.input_vecs[i], &self.output_vecs[i]);
                self.operators[i]
                    .forward(ins, outs)
                    .with_context(|| format!("forward operator '{}'", self.operators[i].name()))?;
                i += 1;
                continue;
            };

            let mut end = i;
            while end < n && self.multi_stream_tasks.contains_key(&end) && end - i < streams {
                end += 1;
            }
            let pool = self
                .stream_pool
                .as_ref()
                .ok_or_else(|| anyhow!("multi-stream operator without a worker pool"))?;
            let input_vecs = &self.input_vecs;
            let output_vecs = &self.output_vecs;
            let first_err: Mutex<Option<anyhow::Error>> = Mutex::new(None);
            pool.scope(|scope| {
                for (k, d) in self.operators[i..end].iter_mut().enumerate() {
                    let (ins, outs) = (&input_vecs[i + k], &output_vecs[i + k]);
                    let first_err = &first_err;
                    scope.spawn(move |_| {
                        if let Err(e) = d.forward(ins, outs) {
                            first_err.lock().unwrap().get_or_insert(e);
                        }
                    });
                }
            });
            if let Some(e) = first_err.into_inner().unwrap() {
                return Err(e);
            }
            i = end;
        }
        Ok(())
    }
}
