//! Keras-style Sequential networks (LSTM / Dense / Dropout) rebuilt on candle.

use anyhow::bail;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{lstm, LSTMConfig, Linear, Module, VarBuilder, LSTM, RNN};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::artifact::ModelArtifact;
use crate::gestures::SequenceClassifier;
use crate::model_loader::LoadError;

/// Dtype names a strict load accepts for precision fields.
const KNOWN_DTYPES: [&str; 6] = [
    "float16",
    "float32",
    "float64",
    "bfloat16",
    "mixed_float16",
    "mixed_bfloat16",
];

/// Canonical precision-policy class understood without aliases.
const POLICY_CLASS: &str = "Policy";

/// Alias table consulted when resolving serialized class names.
#[derive(Debug, Clone, Default)]
pub struct CompatScope {
    aliases: HashMap<String, String>,
}

impl CompatScope {
    /// No aliases: only canonical class names resolve.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Recognizes the newer `DTypePolicy` name as `Policy`.
    pub fn standard() -> Self {
        Self::strict().with_alias("DTypePolicy", POLICY_CLASS)
    }

    pub fn with_alias(mut self, alias: &str, canonical: &str) -> Self {
        self.aliases.insert(alias.to_string(), canonical.to_string());
        self
    }

    pub fn resolve<'a>(&'a self, class_name: &'a str) -> Option<&'a str> {
        if class_name == POLICY_CLASS {
            return Some(POLICY_CLASS);
        }
        self.aliases.get(class_name).map(String::as_str)
    }

    fn check_precision(&self, field: &str, spec: &DTypeSpec) -> Result<(), LoadError> {
        match spec {
            DTypeSpec::Name(name) if KNOWN_DTYPES.contains(&name.as_str()) => Ok(()),
            DTypeSpec::Name(name) => Err(LoadError::Unsupported {
                what: "dtype",
                detail: format!("{field} = '{name}'"),
            }),
            DTypeSpec::Object(policy) => match self.resolve(&policy.class_name) {
                Some(POLICY_CLASS) => {
                    debug!("{} resolved {} -> {}", field, policy.class_name, POLICY_CLASS);
                    Ok(())
                }
                _ => Err(LoadError::UnknownClass(policy.class_name.clone())),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
    Softmax,
}

impl Activation {
    pub fn parse(name: &str) -> Result<Self, LoadError> {
        match name {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "softmax" => Ok(Activation::Softmax),
            other => Err(LoadError::Unsupported {
                what: "activation",
                detail: other.to_string(),
            }),
        }
    }

    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Linear => Ok(xs.clone()),
            Activation::Relu => xs.relu(),
            Activation::Tanh => xs.tanh(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(xs),
            Activation::Softmax => candle_nn::ops::softmax_last_dim(xs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    /// `None` when the model accepts any sequence length.
    pub steps: Option<usize>,
    pub features: usize,
}

impl InputShape {
    /// `[batch, steps, features]` with nullable entries.
    fn from_batch_shape(dims: &[Option<usize>]) -> Result<Self, LoadError> {
        match dims {
            [_, steps, Some(features)] => Ok(Self {
                steps: *steps,
                features: *features,
            }),
            _ => Err(LoadError::Unsupported {
                what: "input shape",
                detail: format!("{dims:?} (expected [batch, steps, features])"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerSpec {
    Lstm {
        name: String,
        units: usize,
        return_sequences: bool,
        use_bias: bool,
    },
    Dense {
        name: String,
        units: usize,
        activation: Activation,
        use_bias: bool,
    },
    Dropout {
        name: String,
    },
}

/// Weight the architecture expects to find in the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl WeightSpec {
    fn new(layer: &str, weight: &str, shape: Vec<usize>) -> Self {
        Self {
            name: format!("{layer}/{weight}"),
            shape,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Architecture {
    pub name: Option<String>,
    pub input: InputShape,
    pub layers: Vec<LayerSpec>,
}

// Typed schema used by the strict loader. Unknown keys are ignored; missing
// required keys and unresolvable classes are errors.

#[derive(Deserialize)]
struct SerializedModel {
    class_name: String,
    config: Value,
}

#[derive(Deserialize)]
struct SequentialConfig {
    #[serde(default)]
    name: Option<String>,
    layers: Vec<SerializedLayer>,
    #[serde(default)]
    build_input_shape: Option<Vec<Option<usize>>>,
}

#[derive(Deserialize)]
struct SerializedLayer {
    class_name: String,
    config: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DTypeSpec {
    Name(String),
    Object(SerializedPolicy),
}

#[derive(Deserialize)]
struct SerializedPolicy {
    class_name: String,
}

#[derive(Deserialize)]
struct PrecisionFields {
    #[serde(default)]
    dtype: Option<DTypeSpec>,
    #[serde(default)]
    dtype_policy: Option<DTypeSpec>,
}

#[derive(Deserialize)]
struct InputLayerConfig {
    batch_input_shape: Vec<Option<usize>>,
    #[serde(flatten)]
    precision: PrecisionFields,
}

#[derive(Deserialize)]
struct LstmConfig {
    name: String,
    units: usize,
    #[serde(default)]
    return_sequences: bool,
    #[serde(default = "default_tanh")]
    activation: String,
    #[serde(default = "default_sigmoid")]
    recurrent_activation: String,
    #[serde(default = "default_true")]
    use_bias: bool,
    #[serde(default)]
    go_backwards: bool,
    #[serde(flatten)]
    precision: PrecisionFields,
}

#[derive(Deserialize)]
struct DenseConfig {
    name: String,
    units: usize,
    #[serde(default = "default_linear")]
    activation: String,
    #[serde(default = "default_true")]
    use_bias: bool,
    #[serde(flatten)]
    precision: PrecisionFields,
}

#[derive(Deserialize)]
struct DropoutConfig {
    name: String,
    #[serde(flatten)]
    precision: PrecisionFields,
}

fn default_tanh() -> String {
    "tanh".to_string()
}
fn default_sigmoid() -> String {
    "sigmoid".to_string()
}
fn default_linear() -> String {
    "linear".to_string()
}
fn default_true() -> bool {
    true
}

impl PrecisionFields {
    fn check(&self, scope: &CompatScope) -> Result<(), LoadError> {
        if let Some(spec) = &self.dtype {
            scope.check_precision("dtype", spec)?;
        }
        if let Some(spec) = &self.dtype_policy {
            scope.check_precision("dtype_policy", spec)?;
        }
        Ok(())
    }
}

fn lstm_spec(
    name: String,
    units: usize,
    return_sequences: bool,
    use_bias: bool,
    activation: &str,
    recurrent_activation: &str,
    go_backwards: bool,
) -> Result<LayerSpec, LoadError> {
    // candle's cell is fixed to tanh / sigmoid
    if activation != "tanh" || recurrent_activation != "sigmoid" {
        return Err(LoadError::Unsupported {
            what: "LSTM activation",
            detail: format!("{name}: {activation}/{recurrent_activation}"),
        });
    }
    if go_backwards {
        return Err(LoadError::Unsupported {
            what: "LSTM option",
            detail: format!("{name}: go_backwards"),
        });
    }
    Ok(LayerSpec::Lstm {
        name,
        units,
        return_sequences,
        use_bias,
    })
}

impl Architecture {
    pub fn new(name: Option<String>, input: InputShape, layers: Vec<LayerSpec>) -> Result<Self, LoadError> {
        let arch = Self { name, input, layers };
        arch.validate()?;
        Ok(arch)
    }

    /// Strict parse through the typed schema. Precision fields must resolve
    /// inside `scope`, input layers must carry `batch_input_shape`.
    pub fn from_config(blob: &str, scope: &CompatScope) -> Result<Self, LoadError> {
        let model: SerializedModel = serde_json::from_str(blob)?;
        if model.class_name != "Sequential" {
            return Err(LoadError::Unsupported {
                what: "model class",
                detail: model.class_name,
            });
        }
        let config: SequentialConfig = serde_json::from_value(model.config)?;

        let mut input = None;
        let mut layers = Vec::with_capacity(config.layers.len());
        for layer in config.layers {
            match layer.class_name.as_str() {
                "InputLayer" => {
                    let c: InputLayerConfig = serde_json::from_value(layer.config)?;
                    c.precision.check(scope)?;
                    input = Some(InputShape::from_batch_shape(&c.batch_input_shape)?);
                }
                "LSTM" => {
                    let c: LstmConfig = serde_json::from_value(layer.config)?;
                    c.precision.check(scope)?;
                    layers.push(lstm_spec(
                        c.name,
                        c.units,
                        c.return_sequences,
                        c.use_bias,
                        &c.activation,
                        &c.recurrent_activation,
                        c.go_backwards,
                    )?);
                }
                "Dense" => {
                    let c: DenseConfig = serde_json::from_value(layer.config)?;
                    c.precision.check(scope)?;
                    layers.push(LayerSpec::Dense {
                        name: c.name,
                        units: c.units,
                        activation: Activation::parse(&c.activation)?,
                        use_bias: c.use_bias,
                    });
                }
                "Dropout" => {
                    let c: DropoutConfig = serde_json::from_value(layer.config)?;
                    c.precision.check(scope)?;
                    layers.push(LayerSpec::Dropout { name: c.name });
                }
                other => {
                    return Err(LoadError::Unsupported {
                        what: "layer",
                        detail: other.to_string(),
                    })
                }
            }
        }

        let input = match (input, config.build_input_shape) {
            (Some(shape), _) => shape,
            (None, Some(dims)) => InputShape::from_batch_shape(&dims)?,
            (None, None) => return Err(LoadError::MalformedConfig("no input shape".to_string())),
        };
        Self::new(config.name, input, layers)
    }

    /// Lenient reconstruction straight from the JSON tree. Precision fields
    /// are ignored, either shape field name is accepted, and the layer list
    /// may sit under `config.layers` or be the `config` array itself.
    pub fn reconstruct(blob: &str) -> Result<Self, LoadError> {
        let root: Value = serde_json::from_str(blob)?;
        match root.get("class_name").and_then(Value::as_str) {
            Some("Sequential") => {}
            other => {
                return Err(LoadError::Unsupported {
                    what: "model class",
                    detail: other.unwrap_or("<missing>").to_string(),
                })
            }
        }

        let (name, layers, build_shape) = match root.get("config") {
            Some(Value::Array(layers)) => (None, layers, None),
            Some(Value::Object(c)) => {
                let layers = c
                    .get("layers")
                    .and_then(Value::as_array)
                    .ok_or_else(|| LoadError::MalformedConfig("config has no layer list".to_string()))?;
                let name = c.get("name").and_then(Value::as_str).map(str::to_string);
                (name, layers, c.get("build_input_shape"))
            }
            _ => return Err(LoadError::MalformedConfig("missing model config".to_string())),
        };

        let mut layer_shape = None;
        let mut specs = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let class = layer
                .get("class_name")
                .and_then(Value::as_str)
                .ok_or_else(|| LoadError::MalformedConfig(format!("layer {i} has no class_name")))?;
            let conf = layer
                .get("config")
                .and_then(Value::as_object)
                .ok_or_else(|| LoadError::MalformedConfig(format!("layer {i} ({class}) has no config")))?;

            if layer_shape.is_none() {
                if let Some(dims) = conf.get("batch_input_shape").or_else(|| conf.get("batch_shape")) {
                    layer_shape = Some(shape_from_value(dims)?);
                }
            }

            match class {
                "InputLayer" => {}
                "LSTM" => specs.push(lstm_spec(
                    required_name(conf, i)?,
                    required_usize(conf, "units", i)?,
                    optional_bool(conf, "return_sequences", false),
                    optional_bool(conf, "use_bias", true),
                    optional_str(conf, "activation", "tanh"),
                    optional_str(conf, "recurrent_activation", "sigmoid"),
                    optional_bool(conf, "go_backwards", false),
                )?),
                "Dense" => specs.push(LayerSpec::Dense {
                    name: required_name(conf, i)?,
                    units: required_usize(conf, "units", i)?,
                    activation: Activation::parse(optional_str(conf, "activation", "linear"))?,
                    use_bias: optional_bool(conf, "use_bias", true),
                }),
                "Dropout" => specs.push(LayerSpec::Dropout {
                    name: required_name(conf, i)?,
                }),
                other => {
                    return Err(LoadError::Unsupported {
                        what: "layer",
                        detail: other.to_string(),
                    })
                }
            }
        }

        let input = match (layer_shape, build_shape) {
            (Some(shape), _) => shape,
            (None, Some(dims)) => shape_from_value(dims)?,
            (None, None) => return Err(LoadError::MalformedConfig("no input shape".to_string())),
        };
        Self::new(name, input, specs)
    }

    fn validate(&self) -> Result<(), LoadError> {
        if self.input.features == 0 {
            return Err(LoadError::MalformedConfig("input has zero features".to_string()));
        }
        if !self.layers.iter().any(|l| !matches!(l, LayerSpec::Dropout { .. })) {
            return Err(LoadError::MalformedConfig("model has no trainable layers".to_string()));
        }
        let mut sequence = true;
        for layer in &self.layers {
            match layer {
                LayerSpec::Lstm {
                    name,
                    units,
                    return_sequences,
                    ..
                } => {
                    if !sequence {
                        return Err(LoadError::Unsupported {
                            what: "topology",
                            detail: format!("{name} receives a non-sequence input"),
                        });
                    }
                    if *units == 0 {
                        return Err(LoadError::MalformedConfig(format!("{name} has zero units")));
                    }
                    sequence = *return_sequences;
                }
                LayerSpec::Dense { name, units, .. } if *units == 0 => {
                    return Err(LoadError::MalformedConfig(format!("{name} has zero units")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Keras weight layout: kernels are `[in, out]`, LSTM gates packed i, f, c, o.
    pub fn expected_weights(&self) -> Vec<WeightSpec> {
        let mut specs = Vec::new();
        let mut dim = self.input.features;
        for layer in &self.layers {
            match layer {
                LayerSpec::Lstm {
                    name,
                    units,
                    use_bias,
                    ..
                } => {
                    specs.push(WeightSpec::new(name, "kernel", vec![dim, 4 * units]));
                    specs.push(WeightSpec::new(name, "recurrent_kernel", vec![*units, 4 * units]));
                    if *use_bias {
                        specs.push(WeightSpec::new(name, "bias", vec![4 * units]));
                    }
                    dim = *units;
                }
                LayerSpec::Dense {
                    name,
                    units,
                    use_bias,
                    ..
                } => {
                    specs.push(WeightSpec::new(name, "kernel", vec![dim, *units]));
                    if *use_bias {
                        specs.push(WeightSpec::new(name, "bias", vec![*units]));
                    }
                    dim = *units;
                }
                LayerSpec::Dropout { .. } => {}
            }
        }
        specs
    }

    /// Width of the final layer's output.
    pub fn output_dim(&self) -> usize {
        self.layers
            .iter()
            .rev()
            .find_map(|l| match l {
                LayerSpec::Lstm { units, .. } | LayerSpec::Dense { units, .. } => Some(*units),
                LayerSpec::Dropout { .. } => None,
            })
            .unwrap_or(self.input.features)
    }

    /// Every expected weight must be present with exactly the expected shape.
    pub fn check_weights<S: AsRef<[usize]>>(&self, shapes: &HashMap<String, S>) -> Result<(), LoadError> {
        for spec in self.expected_weights() {
            let actual: &[usize] = shapes
                .get(&spec.name)
                .ok_or_else(|| LoadError::MissingWeight(spec.name.clone()))?
                .as_ref();
            if actual != spec.shape.as_slice() {
                return Err(LoadError::ShapeMismatch {
                    name: spec.name,
                    expected: spec.shape,
                    actual: actual.to_vec(),
                });
            }
        }
        Ok(())
    }
}

fn shape_from_value(value: &Value) -> Result<InputShape, LoadError> {
    let dims: Vec<Option<usize>> = serde_json::from_value(value.clone())?;
    InputShape::from_batch_shape(&dims)
}

fn required_name(conf: &Map<String, Value>, idx: usize) -> Result<String, LoadError> {
    conf.get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LoadError::MalformedConfig(format!("layer {idx} has no name")))
}

fn required_usize(conf: &Map<String, Value>, key: &str, idx: usize) -> Result<usize, LoadError> {
    conf.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| LoadError::MalformedConfig(format!("layer {idx} has no integer '{key}'")))
}

fn optional_bool(conf: &Map<String, Value>, key: &str, default: bool) -> bool {
    conf.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn optional_str<'a>(conf: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    conf.get(key).and_then(Value::as_str).unwrap_or(default)
}

enum Layer {
    Lstm { cell: LSTM, return_sequences: bool },
    Dense { linear: Linear, activation: Activation },
}

/// Inference-only network built from an [`Architecture`] and Keras-layout weights.
pub struct SequenceModel {
    arch: Architecture,
    layers: Vec<Layer>,
    device: Device,
}

impl SequenceModel {
    pub fn build(
        arch: Architecture,
        mut tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self, LoadError> {
        let shapes: HashMap<String, Vec<usize>> = tensors
            .iter()
            .map(|(name, t)| (name.clone(), t.dims().to_vec()))
            .collect();
        arch.check_weights(&shapes)?;

        let mut take = |layer: &str, weight: &str| -> Result<Tensor, LoadError> {
            let key = format!("{layer}/{weight}");
            let t = tensors.remove(&key).ok_or(LoadError::MissingWeight(key))?;
            Ok(t.to_dtype(DType::F32)?.to_device(device)?)
        };

        let mut layers = Vec::with_capacity(arch.layers.len());
        let mut dim = arch.input.features;
        for spec in &arch.layers {
            match spec {
                LayerSpec::Lstm {
                    name,
                    units,
                    return_sequences,
                    use_bias,
                } => {
                    let kernel = take(name, "kernel")?;
                    let recurrent = take(name, "recurrent_kernel")?;
                    let bias = if *use_bias {
                        take(name, "bias")?
                    } else {
                        Tensor::zeros(4 * units, DType::F32, device)?
                    };
                    // candle keeps the PyTorch layout: [4 * hidden, in], two biases
                    let vars = HashMap::from([
                        ("weight_ih_l0".to_string(), kernel.t()?.contiguous()?),
                        ("weight_hh_l0".to_string(), recurrent.t()?.contiguous()?),
                        ("bias_ih_l0".to_string(), bias),
                        ("bias_hh_l0".to_string(), Tensor::zeros(4 * units, DType::F32, device)?),
                    ]);
                    let vb = VarBuilder::from_tensors(vars, DType::F32, device);
                    let cell = lstm(dim, *units, LSTMConfig::default(), vb)?;
                    layers.push(Layer::Lstm {
                        cell,
                        return_sequences: *return_sequences,
                    });
                    dim = *units;
                }
                LayerSpec::Dense {
                    name,
                    units,
                    activation,
                    use_bias,
                } => {
                    let kernel = take(name, "kernel")?;
                    let bias = if *use_bias { Some(take(name, "bias")?) } else { None };
                    layers.push(Layer::Dense {
                        linear: Linear::new(kernel.t()?.contiguous()?, bias),
                        activation: *activation,
                    });
                    dim = *units;
                }
                LayerSpec::Dropout { .. } => {}
            }
        }

        debug!(
            "built sequence model {:?}: {} layers, output dim {}",
            arch.name,
            layers.len(),
            dim
        );
        Ok(Self {
            arch,
            layers,
            device: device.clone(),
        })
    }

    /// Parses the artifact strictly and builds the network.
    pub fn from_artifact(path: &Path, scope: &CompatScope, device: &Device) -> Result<Self, LoadError> {
        let artifact = ModelArtifact::open(path)?;
        let blob = artifact
            .config_blob()?
            .ok_or_else(|| LoadError::MissingConfig(path.to_path_buf()))?;
        let arch = Architecture::from_config(&blob, scope)?;
        Self::build(arch, artifact.load_tensors(device)?, device)
    }

    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    /// `input`: `[batch, steps, features]`.
    pub fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = input.clone();
        for layer in &self.layers {
            xs = match layer {
                Layer::Lstm {
                    cell,
                    return_sequences,
                } => {
                    let states = cell.seq(&xs)?;
                    if *return_sequences {
                        cell.states_to_tensor(&states)?
                    } else {
                        states
                            .last()
                            .map(|s| s.h().clone())
                            .ok_or_else(|| candle_core::Error::Msg("empty input sequence".to_string()))?
                    }
                }
                Layer::Dense { linear, activation } => activation.apply(&linear.forward(&xs)?)?,
            };
        }
        Ok(xs)
    }
}

impl SequenceClassifier for SequenceModel {
    fn input_shape(&self) -> (Option<usize>, usize) {
        (self.arch.input.steps, self.arch.input.features)
    }

    fn predict_proba(&self, sequence: &[f32], steps: usize, features: usize) -> anyhow::Result<Vec<f32>> {
        if sequence.len() != steps * features {
            bail!(
                "sequence holds {} values, expected {}x{}",
                sequence.len(),
                steps,
                features
            );
        }
        let input = Tensor::from_slice(sequence, (1, steps, features), &self.device)?;
        let out = self.forward(&input)?;
        let probs = match out.rank() {
            2 => out.i(0)?,
            // return_sequences on the last recurrent layer: score the final step
            3 => {
                let last = out.dim(1)? - 1;
                out.i((0, last))?
            }
            r => bail!("unexpected model output rank {}", r),
        };
        Ok(probs.to_vec1::<f32>()?)
    }
}
