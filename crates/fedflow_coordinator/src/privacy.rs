//! Sanitization of incoming weight deltas.
//!
//! Delta documents stay opaque strings everywhere else; this module is
//! the one place that parses them into a typed view (a list of tensors
//! as flat float lists plus free-form metadata). It validates
//! finiteness, clips each tensor to a maximum L2 norm, and optionally
//! adds gaussian noise after clipping.

use rand_distr::{Distribution, Normal};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::PrivacyConfig;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PrivacyError {
    #[error("non-finite value in tensor {tensor}, element {element}: {value}")]
    NonFinite {
        tensor: usize,
        element: usize,
        value: f64,
    },
}

pub struct PrivacyFilter {
    config: PrivacyConfig,
}

impl PrivacyFilter {
    pub fn new(config: PrivacyConfig) -> Self {
        Self { config }
    }

    /// Scan every scalar for NaN / infinities, reporting the first
    /// offending coordinate.
    pub fn validate(&self, weight_delta: &[Vec<f64>]) -> Result<(), PrivacyError> {
        for (tensor, values) in weight_delta.iter().enumerate() {
            for (element, value) in values.iter().enumerate() {
                if !value.is_finite() {
                    return Err(PrivacyError::NonFinite {
                        tensor,
                        element,
                        value: *value,
                    });
                }
            }
        }
        Ok(())
    }

    /// Scale each tensor down uniformly so its L2 norm is at most
    /// `max_norm`. Tensors already within the bound are copied as-is.
    pub fn clip(&self, weight_delta: &[Vec<f64>]) -> Vec<Vec<f64>> {
        if self.config.max_norm <= 0.0 {
            return weight_delta.to_vec();
        }

        weight_delta
            .iter()
            .map(|tensor| {
                let norm = tensor.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm > self.config.max_norm {
                    let scale = self.config.max_norm / norm;
                    tensor.iter().map(|x| x * scale).collect()
                } else {
                    tensor.clone()
                }
            })
            .collect()
    }

    /// Add an independent gaussian sample to every scalar.
    pub fn add_noise(&self, weight_delta: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
        if !self.config.enable_noise || self.config.noise_scale <= 0.0 {
            return weight_delta;
        }
        let Ok(normal) = Normal::new(0.0, self.config.noise_scale) else {
            return weight_delta;
        };
        let mut rng = rand::thread_rng();
        weight_delta
            .into_iter()
            .map(|tensor| {
                tensor
                    .into_iter()
                    .map(|x| x + normal.sample(&mut rng))
                    .collect()
            })
            .collect()
    }

    /// Apply clipping then optional noise to the `weight_delta` field
    /// of a delta document, re-serialize with sorted keys, and append a
    /// `privacy_applied` metadata object. Other fields pass through
    /// verbatim.
    ///
    /// Documents that cannot be parsed are returned untouched; the
    /// admission chain has already run, so this path is a safety no-op.
    pub fn protect(&self, delta_document: &str) -> String {
        let Ok(Value::Object(mut doc)) = serde_json::from_str::<Value>(delta_document) else {
            return delta_document.to_string();
        };
        let Some(tensors) = doc.get("weight_delta").and_then(parse_tensors) else {
            return delta_document.to_string();
        };

        let protected = self.add_noise(self.clip(&tensors));
        doc.insert("weight_delta".to_string(), tensors_to_value(&protected));
        doc.insert(
            "privacy_applied".to_string(),
            json!({
                "clipping": self.config.max_norm > 0.0,
                "noise": self.config.enable_noise,
                "max_norm": if self.config.max_norm > 0.0 {
                    Some(self.config.max_norm)
                } else {
                    None
                },
                "noise_scale": if self.config.enable_noise {
                    Some(self.config.noise_scale)
                } else {
                    None
                },
            }),
        );

        // serde_json maps are ordered by key, so this serializes with
        // sorted keys.
        Value::Object(doc).to_string()
    }
}

/// Typed view of a `weight_delta` field: a list of tensors, each a flat
/// list of floats. Returns `None` for any other shape.
pub fn parse_tensors(value: &Value) -> Option<Vec<Vec<f64>>> {
    let outer = value.as_array()?;
    let mut tensors = Vec::with_capacity(outer.len());
    for row in outer {
        let inner = row.as_array()?;
        let mut tensor = Vec::with_capacity(inner.len());
        for scalar in inner {
            tensor.push(scalar_as_f64(scalar)?);
        }
        tensors.push(tensor);
    }
    Some(tensors)
}

fn scalar_as_f64(scalar: &Value) -> Option<f64> {
    match scalar {
        Value::Number(n) => n.as_f64(),
        // Sentinels left behind by `normalize_nonstandard_floats`.
        Value::String(s) if s == "NaN" => Some(f64::NAN),
        Value::String(s) if s == "Infinity" => Some(f64::INFINITY),
        Value::String(s) if s == "-Infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

/// Extract the typed tensor view from a raw delta document, if it has
/// one.
///
/// Python trainers serialize non-finite floats as the bare tokens
/// `NaN`, `Infinity` and `-Infinity`, which strict JSON parsers refuse.
/// When the strict parse fails, those tokens are rewritten (outside
/// string literals) into sentinel strings and the parse is retried, so
/// the finiteness check can still reject the document with coordinates.
pub fn tensors_from_document(delta_document: &str) -> Option<Vec<Vec<f64>>> {
    let doc: Value = match serde_json::from_str(delta_document) {
        Ok(doc) => doc,
        Err(_) => serde_json::from_str(&normalize_nonstandard_floats(delta_document)).ok()?,
    };
    parse_tensors(doc.get("weight_delta")?)
}

fn normalize_nonstandard_floats(raw: &str) -> String {
    const TOKENS: [(&str, &str); 3] = [
        ("-Infinity", "\"-Infinity\""),
        ("Infinity", "\"Infinity\""),
        ("NaN", "\"NaN\""),
    ];

    let mut out = String::with_capacity(raw.len() + 16);
    let mut i = 0;
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = raw[i..].chars().next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            i += ch.len_utf8();
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push('"');
            i += ch.len_utf8();
            continue;
        }
        if let Some((token, sentinel)) = TOKENS.iter().find(|(t, _)| raw[i..].starts_with(t)) {
            out.push_str(sentinel);
            i += token.len();
        } else {
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

fn tensors_to_value(tensors: &[Vec<f64>]) -> Value {
    Value::Array(
        tensors
            .iter()
            .map(|t| Value::Array(t.iter().map(|x| json!(x)).collect()))
            .collect(),
    )
}
