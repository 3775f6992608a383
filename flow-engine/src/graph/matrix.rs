// Matrix expansion
// Full cross product over a compound task's declared variable lists

use std::collections::BTreeMap;

use crate::value::Value;

/// Expand variable lists into every combination, variables in declaration
/// (key) order, earlier variables cycling slowest
pub fn expand_matrix(matrix: &BTreeMap<String, Vec<Value>>) -> Vec<BTreeMap<String, Value>> {
    let mut combinations: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];

    for (name, values) in matrix {
        if values.is_empty() {
            continue;
        }
        let mut expanded = Vec::with_capacity(combinations.len() * values.len());
        for combination in &combinations {
            for value in values {
                let mut next = combination.clone();
                next.insert(name.clone(), value.clone());
                expanded.push(next);
            }
        }
        combinations = expanded;
    }

    combinations
}

/// Render a combination as a stable node-name suffix, e.g. `[w=8,mode=fast]`
pub fn combination_suffix(combination: &BTreeMap<String, Value>) -> String {
    if combination.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = combination
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.as_string()))
        .collect();
    format!("[{}]", parts.join(","))
}
