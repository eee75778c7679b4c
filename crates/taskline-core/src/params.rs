use std::collections::HashMap;

use crate::error::{Error, Result};

/// A single parameter value. Enough shapes to express everything the
/// predefined steps in `original_source/src/wast/predefined` pass around:
/// interpreter ids, file globs, flags, extra CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
    StrList(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

pub type ParameterMap = HashMap<String, ParamValue>;

/// One layer registered via a step builder's `parametrize` call: a set of
/// parameter names, one row of values per instance this layer contributes,
/// and a short id for each row used to build the instance's name suffix.
///
/// Grounded on spec.md §4.B / §3's `ParameterLayer`.
#[derive(Debug, Clone)]
pub struct ParameterLayer {
    pub names: Vec<String>,
    pub rows: Vec<Vec<ParamValue>>,
    pub ids: Vec<String>,
}

impl ParameterLayer {
    pub fn new(names: Vec<String>, rows: Vec<Vec<ParamValue>>, ids: Vec<String>) -> Self {
        Self { names, rows, ids }
    }
}

/// Expands a step definition's defaults and parameter layers into the
/// concrete `(parameters, id_suffix)` pair for every instance, by taking
/// the Cartesian product of each layer's rows on top of the defaults base.
///
/// This is a pure function of its inputs (spec.md §4.B/§8: "parametrization
/// is a pure function of the definition"), called exactly once per
/// definition at graph-build time.
pub fn expand(
    step_name: &str,
    defaults: &ParameterMap,
    layers: &[ParameterLayer],
) -> Result<Vec<(ParameterMap, String)>> {
    for layer in layers {
        for row in &layer.rows {
            if row.len() != layer.names.len() {
                return Err(Error::MismatchedNumberOfParameters {
                    name: step_name.to_string(),
                    expected: layer.names.len(),
                    actual: row.len(),
                });
            }
        }
    }

    // Explicit layers are combined among themselves first (a name set by two
    // explicit layers is a `ParameterConflict`); the defaults layer is only
    // merged in afterwards, as a fallback for names no explicit layer set
    // (spec.md §4.B step 3: "explicit overrides win").
    let mut combos: Vec<(ParameterMap, Vec<String>)> = vec![(ParameterMap::new(), Vec::new())];
    for layer in layers {
        let mut next = Vec::with_capacity(combos.len() * layer.rows.len().max(1));
        for (params, id_parts) in &combos {
            for (row_idx, row) in layer.rows.iter().enumerate() {
                let mut new_params = params.clone();
                for (name, value) in layer.names.iter().zip(row.iter()) {
                    if new_params.contains_key(name) {
                        return Err(Error::ParameterConflict {
                            name: step_name.to_string(),
                            parameter: name.clone(),
                        });
                    }
                    new_params.insert(name.clone(), value.clone());
                }
                let mut new_id_parts = id_parts.clone();
                new_id_parts.push(layer.ids[row_idx].clone());
                next.push((new_params, new_id_parts));
            }
        }
        combos = next;
    }

    Ok(combos
        .into_iter()
        .map(|(explicit, id_parts)| {
            let mut params = defaults.clone();
            params.extend(explicit);
            let id_suffix = id_parts
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("-");
            (params, id_suffix)
        })
        .collect())
}

/// Builds the fully-qualified instance name: the definition name, plus
/// `[id_suffix]` when the suffix is non-empty.
pub fn fully_qualified_name(step_name: &str, id_suffix: &str) -> String {
    if id_suffix.is_empty() {
        step_name.to_string()
    } else {
        format!("{step_name}[{id_suffix}]")
    }
}
