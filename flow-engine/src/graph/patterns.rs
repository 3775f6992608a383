// Dataflow pattern matching
// Subset semantics: a consumer pattern is satisfied by a producer pattern
// when every consumer attribute is present in the producer with an equal
// value; the producer may carry extra attributes

use crate::defs::{ConsumeSpec, Pattern};

/// One consumer pattern against one producer pattern
pub fn pattern_matches(consumer: &Pattern, producer: &Pattern) -> bool {
    consumer
        .iter()
        .all(|(key, value)| producer.get(key) == Some(value))
}

/// OR semantics across pattern lists: any one matching pair is sufficient.
///
/// `consumes: all` and `consumes: none` never match here; keyword specs
/// control item acceptance on existing edges, not implicit edge creation.
pub fn consumes_match(consumes: &ConsumeSpec, produces: &[Pattern]) -> bool {
    consumes
        .patterns()
        .iter()
        .any(|consumer| produces.iter().any(|producer| pattern_matches(consumer, producer)))
}

/// Whether a produced item shape is accepted by a consume spec
pub fn accepts_shape(consumes: &ConsumeSpec, shape: &Pattern) -> bool {
    match consumes {
        ConsumeSpec::Keyword(keyword) => match keyword {
            crate::defs::ConsumeKeyword::All => true,
            crate::defs::ConsumeKeyword::None => false,
        },
        ConsumeSpec::Patterns(patterns) => {
            patterns.iter().any(|consumer| pattern_matches(consumer, shape))
        }
        ConsumeSpec::Unspecified => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn pattern(pairs: &[(&str, &str)]) -> Pattern {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn test_subset_match() {
        // Producer with extra attributes satisfies a narrower consumer
        let producer = pattern(&[("type", "fileset"), ("filetype", "verilog"), ("vendor", "s")]);
        let consumer = pattern(&[("type", "fileset"), ("filetype", "verilog")]);

        assert!(pattern_matches(&consumer, &producer));
    }

    #[test]
    fn test_value_mismatch_rejected() {
        let producer = pattern(&[("type", "fileset"), ("filetype", "verilog")]);
        let consumer = pattern(&[("type", "fileset"), ("filetype", "vhdl")]);

        assert!(!pattern_matches(&consumer, &producer));
    }

    #[test]
    fn test_or_semantics_across_patterns() {
        let produces = vec![pattern(&[("type", "fileset"), ("filetype", "verilog")])];
        let consumes = ConsumeSpec::Patterns(vec![
            pattern(&[("type", "fileset"), ("filetype", "vhdl")]),
            pattern(&[("type", "fileset"), ("filetype", "verilog")]),
        ]);

        assert!(consumes_match(&consumes, &produces));
    }

    #[test]
    fn test_keyword_specs_accept_shapes_not_edges() {
        let shape = pattern(&[("type", "fileset")]);

        assert!(accepts_shape(&ConsumeSpec::all(), &shape));
        assert!(!accepts_shape(&ConsumeSpec::none(), &shape));
        assert!(!accepts_shape(&ConsumeSpec::Unspecified, &shape));

        // Keywords never create implicit edges
        assert!(!consumes_match(&ConsumeSpec::all(), &[shape]));
    }
}
