//! RPN size expressions, as used by the WIDTH/HEIGHT/WHEN directives.
//!
//! Tokens are whitespace separated: float literals, texture size
//! references like `HOOKED.w` or `NATIVE.height`, and the operators
//! `+ - * / % ! > < =`. Comparison and negation produce 0.0 or 1.0.

use opal_core::{OpalError, OpalResult};

/// Which texture dimension a variable refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    W,
    H,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Not,
    Gt,
    Lt,
    Eq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Const(f32),
    Var { name: String, axis: Axis },
    Op(Op),
}

/// A parsed RPN expression. Variables are resolved at evaluation time, so
/// the same expression can be re-evaluated as textures change size.
#[derive(Debug, Clone, PartialEq)]
pub struct SzExpr {
    tokens: Vec<Token>,
}

impl SzExpr {
    /// Parse a whitespace-separated RPN token list.
    pub fn parse(text: &str) -> OpalResult<SzExpr> {
        let mut tokens = Vec::new();
        for word in text.split_ascii_whitespace() {
            let token = match word {
                "+" => Token::Op(Op::Add),
                "-" => Token::Op(Op::Sub),
                "*" => Token::Op(Op::Mul),
                "/" => Token::Op(Op::Div),
                "%" => Token::Op(Op::Mod),
                "!" => Token::Op(Op::Not),
                ">" => Token::Op(Op::Gt),
                "<" => Token::Op(Op::Lt),
                "=" => Token::Op(Op::Eq),
                _ => {
                    if let Ok(v) = word.parse::<f32>() {
                        Token::Const(v)
                    } else if let Some((name, axis)) = word.rsplit_once('.') {
                        let axis = match axis {
                            "w" | "width" => Axis::W,
                            "h" | "height" => Axis::H,
                            _ => {
                                return Err(OpalError::InvalidArgument(format!(
                                    "unknown texture axis '{}' in '{}'",
                                    axis, word
                                )))
                            }
                        };
                        if name.is_empty()
                            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                        {
                            return Err(OpalError::InvalidArgument(format!(
                                "invalid texture name in '{}'",
                                word
                            )));
                        }
                        Token::Var {
                            name: name.to_string(),
                            axis,
                        }
                    } else {
                        return Err(OpalError::InvalidArgument(format!(
                            "unrecognized szexpr token '{}'",
                            word
                        )));
                    }
                }
            };
            tokens.push(token);
        }
        if tokens.is_empty() {
            return Err(OpalError::InvalidArgument("empty szexpr".into()));
        }
        Ok(SzExpr { tokens })
    }

    /// Evaluate against a variable resolver. The resolver returns None for
    /// unknown textures, which fails the evaluation.
    pub fn eval(&self, lookup: &dyn Fn(&str, Axis) -> Option<f32>) -> OpalResult<f32> {
        let mut stack: Vec<f32> = Vec::with_capacity(self.tokens.len());
        for token in &self.tokens {
            match token {
                Token::Const(v) => stack.push(*v),
                Token::Var { name, axis } => {
                    let v = lookup(name, *axis).ok_or_else(|| {
                        OpalError::InvalidArgument(format!(
                            "szexpr references unknown texture '{}'",
                            name
                        ))
                    })?;
                    stack.push(v);
                }
                Token::Op(Op::Not) => {
                    let x = stack
                        .pop()
                        .ok_or_else(|| OpalError::InvalidArgument("szexpr stack underflow".into()))?;
                    stack.push(if x == 0.0 { 1.0 } else { 0.0 });
                }
                Token::Op(op) => {
                    let b = stack.pop();
                    let a = stack.pop();
                    let (Some(a), Some(b)) = (a, b) else {
                        return Err(OpalError::InvalidArgument("szexpr stack underflow".into()));
                    };
                    let r = match op {
                        Op::Add => a + b,
                        Op::Sub => a - b,
                        Op::Mul => a * b,
                        Op::Div => a / b,
                        Op::Mod => a % b,
                        Op::Gt => (a > b) as u8 as f32,
                        Op::Lt => (a < b) as u8 as f32,
                        Op::Eq => (a == b) as u8 as f32,
                        Op::Not => unreachable!(),
                    };
                    stack.push(r);
                }
            }
        }
        if stack.len() != 1 {
            return Err(OpalError::InvalidArgument(format!(
                "szexpr leaves {} values on the stack",
                stack.len()
            )));
        }
        // Division and modulo can produce NaN/inf mid-expression; a
        // non-finite result is a failed evaluation, not a value.
        if !stack[0].is_finite() {
            return Err(OpalError::InvalidArgument(
                "szexpr result is not finite".into(),
            ));
        }
        Ok(stack[0])
    }

    /// Evaluate as a condition: nonzero is true.
    pub fn eval_bool(&self, lookup: &dyn Fn(&str, Axis) -> Option<f32>) -> OpalResult<bool> {
        Ok(self.eval(lookup)? != 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(name: &str, axis: Axis) -> Option<f32> {
        match (name, axis) {
            ("HOOKED", Axis::W) => Some(1280.0),
            ("HOOKED", Axis::H) => Some(720.0),
            ("OUTPUT", Axis::W) => Some(3840.0),
            ("OUTPUT", Axis::H) => Some(2160.0),
            _ => None,
        }
    }

    #[test]
    fn test_arithmetic() {
        let e = SzExpr::parse("HOOKED.w 2 *").unwrap();
        assert_eq!(e.eval(&fixed).unwrap(), 2560.0);
        let e = SzExpr::parse("OUTPUT.h HOOKED.h /").unwrap();
        assert_eq!(e.eval(&fixed).unwrap(), 3.0);
    }

    #[test]
    fn test_condition_upscale_only() {
        // True exactly when the output is larger than the source.
        let e = SzExpr::parse("OUTPUT.w HOOKED.w >").unwrap();
        assert!(e.eval_bool(&fixed).unwrap());
        let e = SzExpr::parse("HOOKED.w OUTPUT.w >").unwrap();
        assert!(!e.eval_bool(&fixed).unwrap());
    }

    #[test]
    fn test_not_and_equality() {
        let e = SzExpr::parse("HOOKED.w 1280 = !").unwrap();
        assert_eq!(e.eval(&fixed).unwrap(), 0.0);
    }

    #[test]
    fn test_stack_underflow_is_an_error() {
        let e = SzExpr::parse("2 +").unwrap();
        assert!(e.eval(&fixed).is_err());
    }

    #[test]
    fn test_leftover_stack_is_an_error() {
        let e = SzExpr::parse("1 2 3 +").unwrap();
        assert!(e.eval(&fixed).is_err());
    }

    #[test]
    fn test_unknown_texture_is_an_error() {
        let e = SzExpr::parse("NOSUCH.w").unwrap();
        assert!(e.eval(&fixed).is_err());
    }

    #[test]
    fn test_non_finite_result_is_an_error() {
        // 0/0 is NaN; a NaN condition must not count as true.
        let e = SzExpr::parse("0 0 /").unwrap();
        assert!(e.eval(&fixed).is_err());
        assert!(e.eval_bool(&fixed).is_err());
        // 1/0 is inf, equally unusable as a size.
        let e = SzExpr::parse("1 0 /").unwrap();
        assert!(e.eval(&fixed).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SzExpr::parse("HOOKED.q").is_err());
        assert!(SzExpr::parse("1 2 ?").is_err());
        assert!(SzExpr::parse("").is_err());
    }
}
