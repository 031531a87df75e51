//! Fixed-point rewriting.
//!
//! Two passes over the graph. Pass one runs every calibration sample through
//! the float interpreter and accumulates per-tensor range statistics. Pass
//! two chooses scale and zero-point for every tensor (weights from their own
//! data, activations from the observed ranges), rewrites weight constants to
//! the target integer type, and inserts Requantize nodes where a
//! multi-input operator would otherwise mix scales.

pub mod dataset;
pub mod stats;

use crate::config::{CalibrationMethod, QuantDtype, QuantizationConfig};
use crate::errors::{ConvertError, Result, Warning};
use crate::ir::{eval, Constant, ElemType, Graph, OpKind, QuantParams, TensorId};
use dataset::CalibrationDataset;
use stats::TensorStats;
use std::collections::HashMap;

/// Scales below this are degenerate: the observed range was (near) empty.
const MIN_SCALE: f32 = 1e-8;

impl QuantParams {
    /// Choose scale and zero-point covering `[low, high]` for the target
    /// type. The range is widened to include zero first, so that zero is
    /// always exactly representable.
    pub fn from_range(low: f32, high: f32, dtype: QuantDtype, symmetric: bool) -> Self {
        let low = low.min(0.0);
        let high = high.max(0.0);
        let (qmin, qmax) = (dtype.qmin() as f32, dtype.qmax() as f32);

        if symmetric {
            let bound = low.abs().max(high.abs());
            let scale = (bound / qmax).max(MIN_SCALE);
            return Self { scale, zero_point: 0 };
        }

        let scale = ((high - low) / (qmax - qmin)).max(MIN_SCALE);
        let zero_point = (qmin - low / scale).round() as i32;
        Self {
            scale,
            zero_point: zero_point.clamp(dtype.qmin(), dtype.qmax()),
        }
    }

    pub fn quantize_value(&self, v: f32, dtype: QuantDtype) -> i32 {
        let q = (v / self.scale).round() as i32 + self.zero_point;
        q.clamp(dtype.qmin(), dtype.qmax())
    }
}

/// Calibrate and rewrite the graph in place.
///
/// The graph must be fully shaped, optimized, and free of unsupported
/// sentinels; the pipeline checks the latter before calling in.
pub fn quantize(graph: &mut Graph, config: &QuantizationConfig) -> Result<Vec<Warning>> {
    let [input] = graph.inputs.as_slice() else {
        return Err(ConvertError::Quantize {
            reason: format!(
                "calibration supports exactly one graph input, model has {}",
                graph.inputs.len()
            ),
        });
    };
    let input = *input;
    let input_shape = graph.tensor(input).shape.clone();
    let dataset = CalibrationDataset::from_config(config, &input_shape)?;

    let observed = collect_stats(graph, input, &dataset)?;

    let mut warnings = Vec::new();
    quantize_weights(graph, config, &mut warnings);
    quantize_activations(graph, config, &observed, &mut warnings)?;
    insert_requantize(graph)?;
    graph.validate()?;
    Ok(warnings)
}

/// Pass one: simulate every sample, fold each activation's values into its
/// running statistics.
fn collect_stats(
    graph: &Graph,
    input: TensorId,
    dataset: &CalibrationDataset,
) -> Result<HashMap<TensorId, TensorStats>> {
    let mut observed: HashMap<TensorId, TensorStats> = HashMap::new();
    for sample in &dataset.samples {
        let mut feeds = HashMap::new();
        feeds.insert(input, sample.clone());
        let values = eval::run_graph(graph, &feeds)?;
        for (id, data) in &values {
            if graph.tensor(*id).is_const() {
                continue;
            }
            observed.entry(*id).or_default().observe(data);
        }
    }
    Ok(observed)
}

/// Pass two, weights: each constant gets parameters from its own value
/// range (always min/max; the calibration method only governs activations)
/// and its data rewritten to the integer type.
fn quantize_weights(graph: &mut Graph, config: &QuantizationConfig, warnings: &mut Vec<Warning>) {
    let ids: Vec<TensorId> = graph.tensors().filter(|t| t.is_const()).map(|t| t.id).collect();
    for id in ids {
        let Some(data) = graph.tensor(id).data.as_ref().and_then(Constant::as_f32) else {
            continue;
        };
        let low = data.iter().copied().fold(f32::INFINITY, f32::min);
        let high = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let qp = QuantParams::from_range(low, high, config.dtype, config.symmetric);
        if qp.scale <= MIN_SCALE && low == high {
            warnings.push(Warning::DegenerateRange {
                tensor: graph.tensor(id).label(),
            });
        }

        let quantized: Vec<i32> = graph
            .tensor(id)
            .data
            .as_ref()
            .and_then(Constant::as_f32)
            .map(|d| d.iter().map(|&v| qp.quantize_value(v, config.dtype)).collect())
            .unwrap_or_default();
        let tensor = graph.tensor_mut(id);
        tensor.data = Some(match config.dtype {
            QuantDtype::Int8 => Constant::I8(quantized.iter().map(|&q| q as i8).collect()),
            QuantDtype::Int16 => Constant::I16(quantized.iter().map(|&q| q as i16).collect()),
        });
        tensor.elem = elem_of(config.dtype);
        tensor.qparams = Some(qp);
    }
}

/// Pass two, activations: parameters from the calibrated ranges.
fn quantize_activations(
    graph: &mut Graph,
    config: &QuantizationConfig,
    observed: &HashMap<TensorId, TensorStats>,
    warnings: &mut Vec<Warning>,
) -> Result<()> {
    let ids: Vec<TensorId> = graph.tensors().filter(|t| !t.is_const()).map(|t| t.id).collect();
    for id in ids {
        let stats = observed.get(&id).ok_or_else(|| ConvertError::Quantize {
            reason: format!(
                "no calibration observations for tensor '{}'",
                graph.tensor(id).label()
            ),
        })?;
        let (low, high) = stats.range(config.method);
        if (high - low).abs() < MIN_SCALE {
            warnings.push(Warning::DegenerateRange {
                tensor: graph.tensor(id).label(),
            });
        }
        if config.method == CalibrationMethod::Percentile && (low > stats.min || high < stats.max) {
            warnings.push(Warning::PrecisionLoss {
                tensor: graph.tensor(id).label(),
                detail: format!(
                    "observed [{:.4}, {:.4}] clipped to [{low:.4}, {high:.4}]",
                    stats.min, stats.max
                ),
            });
        }
        let tensor = graph.tensor_mut(id);
        tensor.qparams = Some(QuantParams::from_range(low, high, config.dtype, config.symmetric));
        tensor.elem = elem_of(config.dtype);
    }
    Ok(())
}

/// Multi-input arithmetic executes in the scale of its first input; any
/// other input arriving with different parameters gets an explicit
/// Requantize node in front of it.
fn insert_requantize(graph: &mut Graph) -> Result<()> {
    for node_id in graph.topo_order()? {
        if !matches!(
            graph.node(node_id).op,
            OpKind::Add | OpKind::Mul | OpKind::Concat
        ) {
            continue;
        }
        let inputs = graph.node(node_id).inputs.clone();
        let Some(reference) = graph.tensor(inputs[0]).qparams else {
            continue;
        };
        for (slot, &inp) in inputs.iter().enumerate().skip(1) {
            // Constants stay in their own scale; their values are exactly
            // representable there and the encoder carries the parameters.
            if graph.tensor(inp).is_const() {
                continue;
            }
            let Some(qp) = graph.tensor(inp).qparams else {
                continue;
            };
            if same_params(qp, reference) {
                continue;
            }
            let source = graph.tensor(inp);
            let bridged = graph.add_tensor(
                Some(format!("{}_rq", source.label())),
                source.shape.clone(),
                source.elem,
                None,
            );
            graph.tensor_mut(bridged).qparams = Some(reference);
            let name = format!("{}_rq{slot}", graph.node(node_id).name);
            graph.add_node(
                name,
                OpKind::Requantize,
                Default::default(),
                vec![inp],
                vec![bridged],
            );
            graph.node_mut(node_id).inputs[slot] = bridged;
        }
    }
    Ok(())
}

fn same_params(a: QuantParams, b: QuantParams) -> bool {
    let rel = (a.scale - b.scale).abs() / b.scale.max(MIN_SCALE);
    rel < 1e-6 && a.zero_point == b.zero_point
}

fn elem_of(dtype: QuantDtype) -> ElemType {
    match dtype {
        QuantDtype::Int8 => ElemType::I8,
        QuantDtype::Int16 => ElemType::I16,
    }
}
