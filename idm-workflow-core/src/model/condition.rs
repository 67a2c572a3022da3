//! Sequence-flow condition expressions.
//!
//! Grammar (inside an optional `${ ... }` wrapper):
//!
//! ```text
//! or       := and ( "||" and )*
//! and      := unary ( "&&" unary )*
//! unary    := "!" unary | "(" or ")" | compare
//! compare  := operand ( ("==" | "!=" | "contains") operand )?
//! operand  := 'str' | "str" | true | false | null | path | number
//! path     := ident ( "." ident )*
//! ```
//!
//! Paths resolve against process variables; the first segment names the
//! variable and the rest walk into JSON objects. Unresolved paths are `null`.

use anyhow::{anyhow, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0, satisfy},
    combinator::{all_consuming, map, not, opt, recognize, value},
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde_json::Value;

use crate::vars::Variables;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Vec<Condition>),
    And(Vec<Condition>),
    Not(Box<Condition>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Truthy(Operand),
}

impl Condition {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let body = trimmed
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);
        match all_consuming(ws(or_expr))(body) {
            Ok((_, condition)) => Ok(condition),
            Err(e) => Err(anyhow!("invalid condition expression '{}': {}", expr, e)),
        }
    }

    pub fn evaluate(&self, vars: &Variables) -> bool {
        match self {
            Self::Or(items) => items.iter().any(|c| c.evaluate(vars)),
            Self::And(items) => items.iter().all(|c| c.evaluate(vars)),
            Self::Not(inner) => !inner.evaluate(vars),
            Self::Compare { left, op, right } => {
                let l = left.resolve(vars);
                let r = right.resolve(vars);
                match op {
                    CompareOp::Eq => values_equal(&l, &r),
                    CompareOp::Ne => !values_equal(&l, &r),
                    CompareOp::Contains => contains(&l, &r),
                }
            }
            Self::Truthy(operand) => truthy(&operand.resolve(vars)),
        }
    }
}

impl Operand {
    fn resolve(&self, vars: &Variables) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(segments) => {
                let Some((head, rest)) = segments.split_first() else {
                    return Value::Null;
                };
                let mut current = match vars.get(head) {
                    Some(v) => v,
                    None => return Value::Null,
                };
                for segment in rest {
                    match current.get(segment.as_str()) {
                        Some(v) => current = v,
                        None => return Value::Null,
                    }
                }
                current.clone()
            }
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ── Parsers ──

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn or_expr(input: &str) -> IResult<&str, Condition> {
    map(separated_list1(ws(tag("||")), and_expr), |mut items: Vec<Condition>| {
        if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::Or(items)
        }
    })(input)
}

fn and_expr(input: &str) -> IResult<&str, Condition> {
    map(separated_list1(ws(tag("&&")), unary), |mut items: Vec<Condition>| {
        if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::And(items)
        }
    })(input)
}

fn unary(input: &str) -> IResult<&str, Condition> {
    alt((
        map(preceded(ws(char('!')), unary), |c| Condition::Not(Box::new(c))),
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        comparison,
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Condition> {
    let (input, left) = ws(operand)(input)?;
    let (input, rest) = opt(pair(ws(compare_op), ws(operand)))(input)?;
    let condition = match rest {
        Some((op, right)) => Condition::Compare { left, op, right },
        None => Condition::Truthy(left),
    };
    Ok((input, condition))
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Contains, keyword("contains")),
    ))(input)
}

fn operand(input: &str) -> IResult<&str, Operand> {
    alt((
        map(literal, Operand::Literal),
        map(path, Operand::Path),
        map(double, |n: f64| Operand::Literal(serde_json::json!(n))),
    ))(input)
}

fn literal(input: &str) -> IResult<&str, Value> {
    alt((
        map(string_lit, |s: &str| Value::String(s.to_string())),
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        value(Value::Null, keyword("null")),
    ))(input)
}

fn string_lit(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
    ))(input)
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_char)))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

fn path(input: &str) -> IResult<&str, Vec<String>> {
    map(separated_list1(char('.'), ident), |parts: Vec<&str>| {
        parts.into_iter().map(str::to_string).collect()
    })(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn named_task_routing() {
        let c = Condition::parse("${task == 'update'}").unwrap();
        assert!(c.evaluate(&vars(&[("task", json!("update"))])));
        assert!(!c.evaluate(&vars(&[("task", json!("delete"))])));
        assert!(!c.evaluate(&Variables::new()));
    }

    #[test]
    fn null_and_boolean_literals() {
        let unset = Condition::parse("${enabled == null}").unwrap();
        assert!(unset.evaluate(&Variables::new()));
        assert!(unset.evaluate(&vars(&[("enabled", Value::Null)])));
        assert!(!unset.evaluate(&vars(&[("enabled", json!(true))])));

        let off = Condition::parse("${enabled == false}").unwrap();
        assert!(off.evaluate(&vars(&[("enabled", json!(false))])));
        assert!(!off.evaluate(&Variables::new()));
    }

    #[test]
    fn nested_paths_and_contains() {
        let c = Condition::parse("${approveCreate == true && identity.groups contains 'sensitive'}")
            .unwrap();
        let approved_sensitive = vars(&[
            ("approveCreate", json!(true)),
            ("identity", json!({"groups": ["staff", "sensitive"]})),
        ]);
        assert!(c.evaluate(&approved_sensitive));

        let approved_plain = vars(&[
            ("approveCreate", json!(true)),
            ("identity", json!({"groups": ["staff"]})),
        ]);
        assert!(!c.evaluate(&approved_plain));
    }

    #[test]
    fn negation_grouping_and_truthiness() {
        let c = Condition::parse("${!(suspended || locked)}").unwrap();
        assert!(c.evaluate(&Variables::new()));
        assert!(!c.evaluate(&vars(&[("locked", json!(true))])));

        let bare = Condition::parse("approveDelete").unwrap();
        assert!(bare.evaluate(&vars(&[("approveDelete", json!(true))])));
        assert!(!bare.evaluate(&vars(&[("approveDelete", json!(false))])));
    }

    #[test]
    fn numbers_compare_by_value() {
        let c = Condition::parse("${attempts != 3}").unwrap();
        assert!(!c.evaluate(&vars(&[("attempts", json!(3))])));
        assert!(c.evaluate(&vars(&[("attempts", json!(4))])));
    }

    #[test]
    fn keywords_do_not_swallow_identifiers() {
        let c = Condition::parse("${trueValue == 'x'}").unwrap();
        assert!(c.evaluate(&vars(&[("trueValue", json!("x"))])));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Condition::parse("${task ==}").is_err());
        assert!(Condition::parse("${task = 'x'}").is_err());
        assert!(Condition::parse("${(task == 'x'}").is_err());
    }
}
