//! Feature expressions.
//!
//! A job constrains node features with an ordered term list; each term is
//! `(name, combinator, count)`. The combinator of term *i* states how term
//! *i* joins the accumulated result (the first term's combinator is
//! ignored). `Xor` marks a mutually-exclusive alternative group: the final
//! allocation must sit entirely within one alternative.
//!
//! The text form accepted by the parser:
//!
//! ```text
//! bigmem&gpu            # intersection
//! fast|slow             # union
//! [fs1|fs2|fs3]         # one-of group (Xor)
//! 4*gpu&2*bigmem        # counted terms
//! ```
//!
//! A count of zero means "uncounted". Commas are accepted as `&`.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeatureOp {
    And,
    Or,
    Xor,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeatureTerm {
    pub name: String,
    pub op: FeatureOp,
    pub count: u32,
}

impl FeatureTerm {
    pub fn new(name: impl Into<String>, op: FeatureOp, count: u32) -> Self {
        Self {
            name: name.into(),
            op,
            count,
        }
    }
}

/// Parsed-as-given expression: term order is the text order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FeatureExpr {
    pub terms: Vec<FeatureTerm>,
}

impl FeatureExpr {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// True if any term carries a non-zero count.
    pub fn has_counts(&self) -> bool {
        self.terms.iter().any(|t| t.count > 0)
    }

    /// Term *i* belongs to an exclusive-alternative group when the join on
    /// either side of it is `Xor`.
    pub fn in_xor_group(&self, index: usize) -> bool {
        let own = self.terms[index].op == FeatureOp::Xor;
        let next = self
            .terms
            .get(index + 1)
            .map(|t| t.op == FeatureOp::Xor)
            .unwrap_or(false);
        own || next
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum FeatureParseError {
    #[error("empty feature name")]
    EmptyName,
    #[error("bad count in feature term `{0}`")]
    BadCount(String),
    #[error("unexpected character `{0}` in feature expression")]
    UnexpectedChar(char),
    #[error("unbalanced `[` / `]` in feature expression")]
    UnbalancedBracket,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Split a raw token into (name, count): `4*gpu` and `gpu*4` both parse.
fn split_term(raw: &str) -> Result<(String, u32), FeatureParseError> {
    let Some((left, right)) = raw.split_once('*') else {
        if raw.is_empty() {
            return Err(FeatureParseError::EmptyName);
        }
        return Ok((raw.to_string(), 0));
    };
    if left.is_empty() || right.is_empty() {
        return Err(FeatureParseError::BadCount(raw.to_string()));
    }
    if left.bytes().all(|b| b.is_ascii_digit()) {
        let count = left
            .parse()
            .map_err(|_| FeatureParseError::BadCount(raw.to_string()))?;
        Ok((right.to_string(), count))
    } else if right.bytes().all(|b| b.is_ascii_digit()) {
        let count = right
            .parse()
            .map_err(|_| FeatureParseError::BadCount(raw.to_string()))?;
        Ok((left.to_string(), count))
    } else {
        Err(FeatureParseError::BadCount(raw.to_string()))
    }
}

impl FromStr for FeatureExpr {
    type Err = FeatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut terms: Vec<FeatureTerm> = Vec::new();
        let mut token = String::new();
        // Combinator that will join the *next* completed token.
        let mut pending_op = FeatureOp::And;
        let mut in_group = false;

        let flush =
            |token: &mut String, op: FeatureOp, terms: &mut Vec<FeatureTerm>| -> Result<(), FeatureParseError> {
                if token.is_empty() {
                    return Err(FeatureParseError::EmptyName);
                }
                let (name, count) = split_term(token)?;
                terms.push(FeatureTerm { name, op, count });
                token.clear();
                Ok(())
            };

        for c in s.chars() {
            match c {
                c if is_name_char(c) || c == '*' => token.push(c),
                '&' | ',' if !in_group => {
                    flush(&mut token, pending_op, &mut terms)?;
                    pending_op = FeatureOp::And;
                }
                '|' if !in_group => {
                    flush(&mut token, pending_op, &mut terms)?;
                    pending_op = FeatureOp::Or;
                }
                '^' if !in_group => {
                    flush(&mut token, pending_op, &mut terms)?;
                    pending_op = FeatureOp::Xor;
                }
                '|' if in_group => {
                    flush(&mut token, pending_op, &mut terms)?;
                    pending_op = FeatureOp::Xor;
                }
                '[' if !in_group => {
                    if !token.is_empty() {
                        return Err(FeatureParseError::UnexpectedChar('['));
                    }
                    in_group = true;
                }
                ']' if in_group => {
                    flush(&mut token, pending_op, &mut terms)?;
                    pending_op = FeatureOp::And;
                    in_group = false;
                    token.clear();
                }
                c if c.is_whitespace() => {}
                c => return Err(FeatureParseError::UnexpectedChar(c)),
            }
        }
        if in_group {
            return Err(FeatureParseError::UnbalancedBracket);
        }
        if !token.is_empty() {
            flush(&mut token, pending_op, &mut terms)?;
        } else if !terms.is_empty() && !s.trim().ends_with(']') {
            // Trailing separator such as "gpu&".
            return Err(FeatureParseError::EmptyName);
        }
        Ok(FeatureExpr { terms })
    }
}

impl fmt::Display for FeatureExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(match term.op {
                    FeatureOp::And => "&",
                    FeatureOp::Or => "|",
                    FeatureOp::Xor => "^",
                })?;
            }
            if term.count > 0 {
                write!(f, "{}*{}", term.count, term.name)?;
            } else {
                f.write_str(&term.name)?;
            }
        }
        Ok(())
    }
}
