//! Hostlist expressions: `n[0-3,7]` expands to `n0 n1 n2 n3 n7`.

use regex::Regex;

use crate::config::ConfigError;

const BRACKET_PATTERN: &str = r"^([^\[\]]*)\[([0-9,\-]+)\]([^\[\]]*)$";

/// Expand one hostlist expression into node names.
///
/// Plain names pass through unchanged. Inside brackets, ranges keep the
/// zero padding of their lower bound (`n[08-10]` gives `n08 n09 n10`).
pub fn expand_hostlist(expr: &str) -> Result<Vec<String>, ConfigError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ConfigError::Hostlist(expr.to_string()));
    }
    if !expr.contains('[') && !expr.contains(']') {
        return Ok(vec![expr.to_string()]);
    }
    let bracket = Regex::new(BRACKET_PATTERN)?;
    let caps = bracket
        .captures(expr)
        .ok_or_else(|| ConfigError::Hostlist(expr.to_string()))?;
    let (prefix, body, suffix) = (&caps[1], &caps[2], &caps[3]);

    let mut names = Vec::new();
    for piece in body.split(',') {
        let (lo, hi) = piece.split_once('-').unwrap_or((piece, piece));
        let width = lo.len();
        let lo_n: u64 = lo
            .parse()
            .map_err(|_| ConfigError::Hostlist(expr.to_string()))?;
        let hi_n: u64 = hi
            .parse()
            .map_err(|_| ConfigError::Hostlist(expr.to_string()))?;
        if hi_n < lo_n {
            return Err(ConfigError::Hostlist(expr.to_string()));
        }
        for n in lo_n..=hi_n {
            names.push(format!("{prefix}{n:0width$}{suffix}"));
        }
    }
    Ok(names)
}

/// Expand a list of expressions, preserving order.
pub fn expand_all<'a>(exprs: impl IntoIterator<Item = &'a String>) -> Result<Vec<String>, ConfigError> {
    let mut names = Vec::new();
    for expr in exprs {
        names.extend(expand_hostlist(expr)?);
    }
    Ok(names)
}
