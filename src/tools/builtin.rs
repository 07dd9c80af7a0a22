//! Illustrative tools that exercise the registry and dispatcher.
//!
//! Dozens of leaf utilities fit the same trivial shape: read args, produce
//! bytes. These three are that shape, kept deliberately thin. They are not
//! an attempt to reconstruct a full tool catalog.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::tools::ToolFn;

/// Returns its argument verbatim.
pub struct EchoTool;

#[async_trait]
impl ToolFn for EchoTool {
    async fn call(&self, args: &str) -> Result<String, CoreError> {
        Ok(args.to_string())
    }
}

/// A small recursive-descent arithmetic evaluator: `+ - * /`, parentheses,
/// unary minus, floating point literals. Hand-rolled rather than pulling in
/// a general expression-evaluation crate, since the grammar here is small
/// enough not to justify one.
pub struct CalculatorTool;

#[async_trait]
impl ToolFn for CalculatorTool {
    async fn call(&self, args: &str) -> Result<String, CoreError> {
        let value = eval_expr(args)?;
        Ok(format!("{value}"))
    }
}

fn eval_expr(input: &str) -> Result<f64, CoreError> {
    let tokens: Vec<char> = input.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pos = 0usize;
    let value = parse_add_sub(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(CoreError::ToolFailure {
            tool: "calculator".to_string(),
            reason: format!("unexpected trailing input at position {pos}"),
        });
    }
    Ok(value)
}

fn parse_add_sub(tokens: &[char], pos: &mut usize) -> Result<f64, CoreError> {
    let mut value = parse_mul_div(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some('+') => {
                *pos += 1;
                value += parse_mul_div(tokens, pos)?;
            }
            Some('-') => {
                *pos += 1;
                value -= parse_mul_div(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_mul_div(tokens: &[char], pos: &mut usize) -> Result<f64, CoreError> {
    let mut value = parse_unary(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some('*') => {
                *pos += 1;
                value *= parse_unary(tokens, pos)?;
            }
            Some('/') => {
                *pos += 1;
                let divisor = parse_unary(tokens, pos)?;
                if divisor == 0.0 {
                    return Err(CoreError::ToolFailure {
                        tool: "calculator".to_string(),
                        reason: "division by zero".to_string(),
                    });
                }
                value /= divisor;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_unary(tokens: &[char], pos: &mut usize) -> Result<f64, CoreError> {
    if tokens.get(*pos) == Some(&'-') {
        *pos += 1;
        return Ok(-parse_unary(tokens, pos)?);
    }
    parse_primary(tokens, pos)
}

fn parse_primary(tokens: &[char], pos: &mut usize) -> Result<f64, CoreError> {
    match tokens.get(*pos) {
        Some('(') => {
            *pos += 1;
            let value = parse_add_sub(tokens, pos)?;
            if tokens.get(*pos) != Some(&')') {
                return Err(CoreError::ToolFailure {
                    tool: "calculator".to_string(),
                    reason: "expected closing paren".to_string(),
                });
            }
            *pos += 1;
            Ok(value)
        }
        Some(c) if c.is_ascii_digit() || *c == '.' => {
            let start = *pos;
            while matches!(tokens.get(*pos), Some(c) if c.is_ascii_digit() || *c == '.') {
                *pos += 1;
            }
            let text: String = tokens[start..*pos].iter().collect();
            text.parse::<f64>().map_err(|_| CoreError::ToolFailure {
                tool: "calculator".to_string(),
                reason: format!("malformed number '{text}'"),
            })
        }
        _ => Err(CoreError::ToolFailure {
            tool: "calculator".to_string(),
            reason: "expected a number or '('".to_string(),
        }),
    }
}

/// Process-local key/value scratch space for the running agent. A
/// three-verb protocol (`PUT key value`, `GET key`, `DELETE key`) over an
/// `Arc<Mutex<HashMap<...>>>`, with no expiry sweep.
pub struct MemoryTool {
    store: Mutex<HashMap<String, String>>,
}

impl MemoryTool {
    pub fn new() -> Self {
        MemoryTool {
            store: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolFn for MemoryTool {
    async fn call(&self, args: &str) -> Result<String, CoreError> {
        let mut parts = args.splitn(3, ' ');
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        match verb.as_str() {
            "PUT" => {
                let key = parts.next().ok_or_else(|| CoreError::ToolFailure {
                    tool: "memory".to_string(),
                    reason: "PUT requires a key".to_string(),
                })?;
                let value = parts.next().unwrap_or("");
                self.store
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), value.to_string());
                Ok("OK".to_string())
            }
            "GET" => {
                let key = parts.next().ok_or_else(|| CoreError::ToolFailure {
                    tool: "memory".to_string(),
                    reason: "GET requires a key".to_string(),
                })?;
                match self.store.lock().unwrap().get(key) {
                    Some(v) => Ok(v.clone()),
                    None => Err(CoreError::NotFound {
                        what: format!("memory key '{key}'"),
                    }),
                }
            }
            "DELETE" => {
                let key = parts.next().ok_or_else(|| CoreError::ToolFailure {
                    tool: "memory".to_string(),
                    reason: "DELETE requires a key".to_string(),
                })?;
                let removed = self.store.lock().unwrap().remove(key).is_some();
                Ok(if removed { "OK" } else { "ERR:NOT_FOUND" }.to_string())
            }
            other => Err(CoreError::ToolFailure {
                tool: "memory".to_string(),
                reason: format!("unknown verb '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_argument() {
        assert_eq!(EchoTool.call("hi").await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn calculator_evaluates_precedence() {
        assert_eq!(CalculatorTool.call("2 + 3 * 4").await.unwrap(), "14");
    }

    #[tokio::test]
    async fn calculator_handles_parens_and_unary_minus() {
        assert_eq!(CalculatorTool.call("-(2 + 3) * 2").await.unwrap(), "-10");
    }

    #[tokio::test]
    async fn calculator_rejects_division_by_zero() {
        let err = CalculatorTool.call("1 / 0").await.unwrap_err();
        assert!(matches!(err, CoreError::ToolFailure { .. }));
    }

    #[tokio::test]
    async fn memory_put_then_get_roundtrips() {
        let memory = MemoryTool::new();
        memory.call("PUT name document").await.unwrap();
        assert_eq!(memory.call("GET name").await.unwrap(), "document");
    }

    #[tokio::test]
    async fn memory_get_missing_key_is_not_found() {
        let memory = MemoryTool::new();
        let err = memory.call("GET nope").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
