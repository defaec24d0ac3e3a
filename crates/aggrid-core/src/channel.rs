//! Weight channels: operation enum, raw descriptors and the normalizing registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{AggError, AggResult};
use crate::PointSet;

/// Maximum number of weight components per channel (RGB of a cell slot).
pub const MAX_WEIGHT_SIZE: usize = 3;

/// Per-channel aggregation operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation { Sum, Mean, Min, Max }

impl Operation {
    /// Cell fill value before any point is folded in.
    pub fn identity(self) -> f32 {
        match self {
            Operation::Sum | Operation::Mean => 0.0,
            Operation::Min => f32::INFINITY,
            Operation::Max => f32::NEG_INFINITY,
        }
    }

    /// Apply the operation to a plain list of values. `None` for an empty list.
    pub fn reduce<I: IntoIterator<Item = f64>>(self, values: I) -> Option<f64> {
        let mut n = 0usize;
        let mut acc = match self {
            Operation::Sum | Operation::Mean => 0.0,
            Operation::Min => f64::INFINITY,
            Operation::Max => f64::NEG_INFINITY,
        };
        for v in values {
            n += 1;
            acc = match self {
                Operation::Sum | Operation::Mean => acc + v,
                Operation::Min => acc.min(v),
                Operation::Max => acc.max(v),
            };
        }
        match (n, self) {
            (0, _) => None,
            (_, Operation::Mean) => Some(acc / n as f64),
            _ => Some(acc),
        }
    }
}

impl FromStr for Operation {
    type Err = AggError;
    fn from_str(s: &str) -> AggResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUM" => Ok(Operation::Sum),
            "MEAN" => Ok(Operation::Mean),
            "MIN" => Ok(Operation::Min),
            "MAX" => Ok(Operation::Max),
            _ => Err(AggError::UnsupportedOperation(s.to_string())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Sum => "SUM",
            Operation::Mean => "MEAN",
            Operation::Min => "MIN",
            Operation::Max => "MAX",
        };
        f.write_str(s)
    }
}

fn default_operation() -> String { "SUM".into() }

/// Raw channel descriptor as supplied by a calling layer or a config file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    /// 1..=3 column names in the point set. Empty: constant weight 1 (point counting).
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default = "default_operation")]
    pub operation: String,
    #[serde(default)]
    pub need_min: bool,
    #[serde(default)]
    pub need_max: bool,
    #[serde(default)]
    pub combine_min_max: bool,
}

impl ChannelSpec {
    pub fn new(id: &str, columns: &[&str], operation: &str) -> Self {
        Self {
            id: id.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            operation: operation.to_string(),
            need_min: false,
            need_max: false,
            combine_min_max: false,
        }
    }

    /// Point-count channel (constant weight).
    pub fn count(id: &str) -> Self { Self::new(id, &[], "SUM") }

    pub fn with_min_max(mut self, need_min: bool, need_max: bool) -> Self {
        self.need_min = need_min;
        self.need_max = need_max;
        self
    }

    pub fn combined(mut self) -> Self {
        self.need_min = true;
        self.need_max = true;
        self.combine_min_max = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WeightSource {
    Constant(f32),
    Columns(Vec<String>),
}

/// Canonical channel record produced by [`normalize_channels`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightChannel {
    pub id: String,
    pub size: usize,
    pub operation: Operation,
    pub source: WeightSource,
    pub need_min: bool,
    pub need_max: bool,
    /// Always implies `need_min && need_max`.
    pub combine_min_max: bool,
}

/// Validate raw descriptors and return canonical channels in input order.
pub fn normalize_channels(specs: &[ChannelSpec]) -> AggResult<Vec<WeightChannel>> {
    let mut out: Vec<WeightChannel> = Vec::with_capacity(specs.len());
    for spec in specs {
        if out.iter().any(|c| c.id == spec.id) {
            return Err(AggError::DuplicateChannel(spec.id.clone()));
        }
        let operation: Operation = spec.operation.parse()?;
        if spec.columns.len() > MAX_WEIGHT_SIZE {
            return Err(AggError::invalid_channel(
                &spec.id,
                format!("{} weight columns, at most {} supported", spec.columns.len(), MAX_WEIGHT_SIZE),
            ));
        }
        let (size, source) = if spec.columns.is_empty() {
            (1, WeightSource::Constant(1.0))
        } else {
            (spec.columns.len(), WeightSource::Columns(spec.columns.clone()))
        };
        out.push(WeightChannel {
            id: spec.id.clone(),
            size,
            operation,
            source,
            need_min: spec.need_min,
            need_max: spec.need_max,
            combine_min_max: spec.combine_min_max && spec.need_min && spec.need_max,
        });
    }
    Ok(out)
}

impl WeightChannel {
    /// Resolve the channel's columns against a point set.
    pub fn bind<'a>(&self, points: &'a PointSet) -> AggResult<ChannelWeights<'a>> {
        let src = match &self.source {
            WeightSource::Constant(v) => Bound::Constant(*v),
            WeightSource::Columns(names) => {
                let mut cols: SmallVec<[&'a [f32]; MAX_WEIGHT_SIZE]> = SmallVec::new();
                for name in names {
                    let col = points.attrs_f32.get(name).ok_or_else(|| AggError::MissingWeights {
                        channel: self.id.clone(),
                        column: name.clone(),
                    })?;
                    if col.len() != points.len() {
                        return Err(AggError::WeightLengthMismatch {
                            channel: self.id.clone(),
                            column: name.clone(),
                            got: col.len(),
                            expected: points.len(),
                        });
                    }
                    cols.push(col.as_slice());
                }
                Bound::Columns(cols)
            }
        };
        Ok(ChannelWeights { size: self.size, src })
    }
}

#[derive(Clone, Debug)]
enum Bound<'a> {
    Constant(f32),
    Columns(SmallVec<[&'a [f32]; MAX_WEIGHT_SIZE]>),
}

/// Borrowed weight accessor for one channel.
#[derive(Clone, Debug)]
pub struct ChannelWeights<'a> {
    size: usize,
    src: Bound<'a>,
}

impl<'a> ChannelWeights<'a> {
    pub fn size(&self) -> usize { self.size }

    #[inline]
    pub fn get(&self, point: usize, component: usize) -> f32 {
        match &self.src {
            Bound::Constant(v) => *v,
            Bound::Columns(cols) => cols[component][point],
        }
    }
}
