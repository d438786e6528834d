//! Feature-expression evaluation.
//!
//! Two entry points:
//!
//! - [`evaluate_feature_counts`]: the two-pass filter. Pass one folds the
//!   term list into a candidate bitmap (AND intersects, OR/XOR union; a
//!   missing feature under AND clears everything). Pass two, only when some
//!   term carries a count, checks that each counted term still has `count`
//!   nodes inside the folded result.
//! - [`xor_alternatives`]: per-configuration alternative bitmap. XOR here
//!   is not symmetric difference; it means "the final allocation sits
//!   entirely within one alternative", so each configuration reports which
//!   alternatives it can serve and the picker carries one at a time.

use ns_core::{FeatureExpr, FeatureOp, FeatureRegistry, NodeMask, SelectionError, MAX_FEATURES};

/// Fold the expression over `node_mask`.
///
/// Returns `has_xor`. When no term carries a count, `node_mask` is
/// intersected in place with the folded result; when counts are present the
/// mask is left untouched and only the count check decides.
pub fn evaluate_feature_counts(
    expr: &FeatureExpr,
    registry: &FeatureRegistry,
    node_mask: &mut NodeMask,
) -> Result<bool, SelectionError> {
    if expr.is_empty() {
        return Ok(false);
    }

    let mut has_xor = false;
    let mut acc = node_mask.clone();
    for (i, term) in expr.terms.iter().enumerate() {
        // The first term has no predecessor to join with.
        let op = if i == 0 { FeatureOp::And } else { term.op };
        match registry.mask(&term.name) {
            Some(feature_mask) => match op {
                FeatureOp::And => acc.intersect(feature_mask),
                FeatureOp::Or => acc.union(feature_mask),
                FeatureOp::Xor => {
                    has_xor = true;
                    acc.union(feature_mask);
                }
            },
            None => {
                // Unknown feature: fatal under AND, harmless under OR/XOR.
                if op == FeatureOp::And {
                    acc.clear_all();
                }
            }
        }
    }

    if expr.has_counts() {
        for term in expr.terms.iter().filter(|t| t.count > 0) {
            let feature_mask = registry
                .mask(&term.name)
                .ok_or(SelectionError::InfeasibleFeatures)?;
            if feature_mask.overlap_count(&acc) < term.count {
                return Err(SelectionError::InfeasibleFeatures);
            }
        }
    } else {
        node_mask.intersect(&acc);
    }
    Ok(has_xor)
}

/// Which exclusive alternatives of `expr` does a configuration serve?
///
/// Returns a `MAX_FEATURES`-wide bitmap with bit *k* set iff every node of
/// `config_mask` carries the *k*-th XOR-grouped feature. Bit 0 is set when
/// the expression has no terms at all. An all-clear result means the
/// configuration serves no alternative and must be dropped.
pub fn xor_alternatives(
    expr: &FeatureExpr,
    registry: &FeatureRegistry,
    config_mask: &NodeMask,
) -> NodeMask {
    let mut bits = NodeMask::new(MAX_FEATURES);
    if expr.is_empty() {
        bits.set(0);
        return bits;
    }

    let mut position = 0usize;
    for i in 0..expr.terms.len() {
        if !expr.in_xor_group(i) {
            continue;
        }
        if let Some(feature_mask) = registry.mask(&expr.terms[i].name) {
            if config_mask.is_subset_of(feature_mask) {
                bits.set(position);
            }
        }
        position += 1;
    }
    bits
}
