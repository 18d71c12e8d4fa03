//! Exception reporting with a bounded trace.

use ether_core::log::{gray, red};
use ether_core::value::Value;

/// `--trace-limit HEAD[,TAIL]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceLimit {
    pub head: usize,
    pub tail: usize,
}

impl Default for TraceLimit {
    fn default() -> Self {
        TraceLimit { head: 8, tail: 4 }
    }
}

impl std::str::FromStr for TraceLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid trace limit '{}'", part))
        };
        match s.split_once(',') {
            Some((head, tail)) => Ok(TraceLimit { head: parse(head)?, tail: parse(tail)? }),
            None => {
                let head = parse(s)?;
                Ok(TraceLimit { head, tail: 0 })
            }
        }
    }
}

/// Print an uncaught exception and its raise trace, newest site last.
pub fn print_exception(exn: &Value, limit: TraceLimit) {
    eprintln!("{} uncaught exception: {}", red("error:"), exn_payload(exn));
    let Value::Exn(e) = exn else { return };
    let trace = e.trace.borrow();
    if trace.is_empty() {
        return;
    }
    eprintln!("trace (most recent raise last):");
    let n = trace.len();
    for (i, loc) in trace.iter().enumerate() {
        if i < limit.head || i >= n.saturating_sub(limit.tail) {
            eprintln!("  at {}", loc);
        } else if i == limit.head {
            eprintln!("  {}", gray(&format!("... {} more sites ...", n - limit.head - limit.tail)));
        }
    }
}

fn exn_payload(exn: &Value) -> String {
    match exn {
        Value::Exn(e) => e.what.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trace_limit() {
        let limit: TraceLimit = "5,2".parse().unwrap();
        assert_eq!(limit, TraceLimit { head: 5, tail: 2 });
        let limit: TraceLimit = "7".parse().unwrap();
        assert_eq!(limit, TraceLimit { head: 7, tail: 0 });
        assert!("x,y".parse::<TraceLimit>().is_err());
    }
}
