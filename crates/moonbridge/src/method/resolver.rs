//! Overload resolution
//!
//! Picks the signature of a [`CallAdapter`] that best accepts a list of VM
//! arguments. A candidate is admissible when its arity fits and every
//! argument extracts. Among admissible candidates the preference is:
//! 1. exact arity over omitted optionals over variadic absorption
//! 2. at the first position where two candidates differ, the better match,
//!    then the narrower parameter type
//! 3. registration order

use std::cmp::Ordering;

use super::adapter::CallAdapter;
use super::signature::Signature;
use super::types::Match;
use crate::error::{Error, Result};
use crate::value::HostValue;

/// How a candidate's arity fits the call, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ArityFit {
    Exact,
    OmittedOptionals,
    Variadic,
}

struct Candidate {
    index: usize,
    fit: ArityFit,
    /// Match quality and parameter specificity per argument
    scores: Vec<(Match, u8)>,
    args: Vec<HostValue>,
}

impl Candidate {
    /// Whether `self` should replace an earlier candidate `other`
    fn beats(&self, other: &Candidate) -> bool {
        match self.fit.cmp(&other.fit) {
            Ordering::Less => return true,
            Ordering::Greater => return false,
            Ordering::Equal => {}
        }
        self.scores
            .iter()
            .zip(&other.scores)
            .find(|(a, b)| a != b)
            .is_some_and(|(a, b)| a > b)
    }
}

/// Check one signature against the arguments
fn admit(index: usize, sig: &Signature, args: &[HostValue]) -> Option<Candidate> {
    let n = args.len();
    let fixed = sig.params().len();
    if n < sig.required() || (n > fixed && sig.variadic().is_none()) {
        return None;
    }

    let fit = if sig.variadic().is_some() {
        ArityFit::Variadic
    } else if n == fixed {
        ArityFit::Exact
    } else {
        ArityFit::OmittedOptionals
    };

    let mut scores = Vec::with_capacity(n);
    let mut converted = Vec::with_capacity(fixed + 1);
    for (i, param) in sig.params().iter().enumerate() {
        match args.get(i) {
            Some(arg) => {
                let (value, quality) = param.extract(arg)?;
                scores.push((quality, param.ty().specificity()));
                converted.push(value);
            }
            None => converted.push(HostValue::Nil),
        }
    }

    if let Some(tail) = sig.variadic() {
        let mut rest = Vec::new();
        for arg in args.iter().skip(fixed) {
            let (value, quality) = tail.extract(arg)?;
            scores.push((quality, tail.ty().specificity()));
            rest.push(value);
        }
        converted.push(HostValue::List(rest));
    }

    Some(Candidate {
        index,
        fit,
        scores,
        args: converted,
    })
}

/// Select the overload of `adapter` for `args`
///
/// Returns the candidate index and the arguments converted to its parameter
/// types.
pub fn resolve(adapter: &CallAdapter, args: Vec<HostValue>) -> Result<(usize, Vec<HostValue>)> {
    let mut best: Option<Candidate> = None;
    for (index, sig) in adapter.candidates().iter().enumerate() {
        let Some(candidate) = admit(index, sig, &args) else {
            continue;
        };
        let replace = match &best {
            Some(current) => candidate.beats(current),
            None => true,
        };
        if replace {
            best = Some(candidate);
        }
    }

    match best {
        Some(c) => Ok((c.index, c.args)),
        None => {
            let types: Vec<&str> = args.iter().map(HostValue::type_name).collect();
            let args = types.join(", ");
            tracing::debug!(function = adapter.name(), args = %args, "no matching overload");
            Err(Error::NoMatchingOverload {
                name: adapter.name().to_string(),
                args,
            })
        }
    }
}
