//! Arithmetic formula compiler for derived values
//!
//! Formulas are short arithmetic expressions over node ids, e.g.
//! `"(strength + stamina) / 2"` or `"hunger < 20 ? 1 : 0"`. They are parsed
//! once at config load and cached keyed by the exact source string; each
//! cascade evaluates the compiled AST against the entity's current values.
//! Formulas are pure: no side effects, no state.

use ahash::AHashMap;
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, multispace0},
    combinator::recognize,
    multi::{fold_many0, many0, separated_list0},
    number::complete::double,
    sequence::{delimited, pair, preceded},
    IResult, Parser,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    /// A node id reference resolved from the evaluation context
    Ident(String),
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Ternary { cond: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("unknown identifier '{0}'")]
    UnknownIdent(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function {func} expected {expected} args, got {got}")]
    BadArity { func: String, expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("formula parse error: {message}")]
pub struct ParseError {
    pub message: String,
}

/// A parsed formula plus the identifiers it reads, in first-use order
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    pub expr: Expr,
    pub idents: Vec<String>,
}

impl CompiledFormula {
    pub fn compile(source: &str) -> Result<Self, ParseError> {
        let expr = parse(source)?;
        let mut idents = Vec::new();
        collect_idents(&expr, &mut idents);
        Ok(Self { expr, idents })
    }

    pub fn evaluate(&self, context: &AHashMap<String, f64>) -> Result<f64, EvalError> {
        eval(&self.expr, context)
    }
}

/// Per-config cache of compiled formulas keyed by exact source string
#[derive(Debug, Default)]
pub struct FormulaCache {
    compiled: AHashMap<String, CompiledFormula>,
}

impl FormulaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and cache; a parse failure leaves the formula uncached so
    /// evaluation falls back to the error default.
    pub fn insert(&mut self, source: &str) -> Result<&CompiledFormula, ParseError> {
        if !self.compiled.contains_key(source) {
            let compiled = CompiledFormula::compile(source)?;
            self.compiled.insert(source.to_string(), compiled);
        }
        Ok(&self.compiled[source])
    }

    pub fn get(&self, source: &str) -> Option<&CompiledFormula> {
        self.compiled.get(source)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

fn collect_idents(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Num(_) => {}
        Expr::Ident(name) => {
            if !out.iter().any(|n| n == name) {
                out.push(name.clone());
            }
        }
        Expr::Binary { left, right, .. } => {
            collect_idents(left, out);
            collect_idents(right, out);
        }
        Expr::Neg(inner) | Expr::Not(inner) => collect_idents(inner, out),
        Expr::Ternary { cond, then, otherwise } => {
            collect_idents(cond, out);
            collect_idents(then, out);
            collect_idents(otherwise, out);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_idents(arg, out);
            }
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

fn identifier(input: &str) -> IResult<&str, String> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))
    .map(|s: &str| s.to_string())
    .parse(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    double.map(Expr::Num).parse(input)
}

fn ident_ref(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    // A '(' after the identifier means this is a call, not a reference
    let (after_ws, _) = multispace0(rest)?;
    if after_ws.starts_with('(') {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    Ok((rest, Expr::Ident(name)))
}

fn call(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, args) = delimited(
        char('('),
        separated_list0(delimited(multispace0, char(','), multispace0), expr),
        preceded(multispace0, char(')')),
    )
    .parse(rest)?;
    Ok((rest, Expr::Call { name, args }))
}

fn atom(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    alt((
        delimited(char('('), delimited(multispace0, expr, multispace0), char(')')),
        call,
        ident_ref,
        number,
    ))
    .parse(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    alt((
        preceded(char('-'), unary).map(|e| Expr::Neg(Box::new(e))),
        preceded(char('!'), unary).map(|e| Expr::Not(Box::new(e))),
        atom,
    ))
    .parse(input)
}

fn product(input: &str) -> IResult<&str, Expr> {
    let (input, init) = unary(input)?;
    fold_many0(
        pair(
            delimited(multispace0, alt((char('*'), char('/'), char('%'))), multispace0),
            unary,
        ),
        move || init.clone(),
        |acc, (op_char, rhs)| {
            let op = match op_char {
                '*' => BinOp::Mul,
                '/' => BinOp::Div,
                _ => BinOp::Mod,
            };
            Expr::Binary { op, left: Box::new(acc), right: Box::new(rhs) }
        },
    )
    .parse(input)
}

fn sum(input: &str) -> IResult<&str, Expr> {
    let (input, init) = product(input)?;
    fold_many0(
        pair(delimited(multispace0, alt((char('+'), char('-'))), multispace0), product),
        move || init.clone(),
        |acc, (op_char, rhs)| {
            let op = if op_char == '+' { BinOp::Add } else { BinOp::Sub };
            Expr::Binary { op, left: Box::new(acc), right: Box::new(rhs) }
        },
    )
    .parse(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, init) = sum(input)?;
    fold_many0(
        pair(
            delimited(
                multispace0,
                alt((
                    tag(">=").map(|_| BinOp::Gte),
                    tag("<=").map(|_| BinOp::Lte),
                    tag("==").map(|_| BinOp::Eq),
                    tag("!=").map(|_| BinOp::Neq),
                    tag(">").map(|_| BinOp::Gt),
                    tag("<").map(|_| BinOp::Lt),
                )),
                multispace0,
            ),
            sum,
        ),
        move || init.clone(),
        |acc, (op, rhs)| Expr::Binary { op, left: Box::new(acc), right: Box::new(rhs) },
    )
    .parse(input)
}

fn conjunction(input: &str) -> IResult<&str, Expr> {
    let (input, init) = comparison(input)?;
    fold_many0(
        preceded(delimited(multispace0, tag("&&"), multispace0), comparison),
        move || init.clone(),
        |acc, rhs| Expr::Binary { op: BinOp::And, left: Box::new(acc), right: Box::new(rhs) },
    )
    .parse(input)
}

fn disjunction(input: &str) -> IResult<&str, Expr> {
    let (input, init) = conjunction(input)?;
    fold_many0(
        preceded(delimited(multispace0, tag("||"), multispace0), conjunction),
        move || init.clone(),
        |acc, rhs| Expr::Binary { op: BinOp::Or, left: Box::new(acc), right: Box::new(rhs) },
    )
    .parse(input)
}

/// `cond ? then : otherwise`, right-associative
fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, cond) = disjunction(input)?;
    let (input, _) = multispace0(input)?;
    if let Ok((rest, _)) = char::<_, nom::error::Error<&str>>('?').parse(input) {
        let (rest, then) = expr(rest)?;
        let (rest, _) = delimited(multispace0, char(':'), multispace0).parse(rest)?;
        let (rest, otherwise) = expr(rest)?;
        Ok((
            rest,
            Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
        ))
    } else {
        Ok((input, cond))
    }
}

fn parse(source: &str) -> Result<Expr, ParseError> {
    match expr(source.trim()) {
        Ok(("", parsed)) => Ok(parsed),
        Ok((remaining, _)) => {
            Err(ParseError { message: format!("unparsed input: '{}'", remaining) })
        }
        Err(e) => Err(ParseError { message: format!("{:?}", e) }),
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn truthy(v: f64) -> bool {
    v != 0.0
}

fn bool_num(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn eval(expr: &Expr, context: &AHashMap<String, f64>) -> Result<f64, EvalError> {
    match expr {
        Expr::Num(v) => Ok(*v),
        Expr::Ident(name) => context
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::UnknownIdent(name.clone())),
        Expr::Binary { op, left, right } => {
            let l = eval(left, context)?;
            let r = eval(right, context)?;
            // Division by zero follows IEEE semantics; the caller clamps
            Ok(match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                BinOp::Mod => l % r,
                BinOp::Gt => bool_num(l > r),
                BinOp::Lt => bool_num(l < r),
                BinOp::Gte => bool_num(l >= r),
                BinOp::Lte => bool_num(l <= r),
                BinOp::Eq => bool_num((l - r).abs() < f64::EPSILON),
                BinOp::Neq => bool_num((l - r).abs() >= f64::EPSILON),
                BinOp::And => bool_num(truthy(l) && truthy(r)),
                BinOp::Or => bool_num(truthy(l) || truthy(r)),
            })
        }
        Expr::Neg(inner) => Ok(-eval(inner, context)?),
        Expr::Not(inner) => Ok(bool_num(!truthy(eval(inner, context)?))),
        Expr::Ternary { cond, then, otherwise } => {
            if truthy(eval(cond, context)?) {
                eval(then, context)
            } else {
                eval(otherwise, context)
            }
        }
        Expr::Call { name, args } => {
            let values: Result<Vec<f64>, EvalError> =
                args.iter().map(|a| eval(a, context)).collect();
            let values = values?;
            let arity = |expected: usize| -> Result<(), EvalError> {
                if values.len() != expected {
                    Err(EvalError::BadArity {
                        func: name.clone(),
                        expected,
                        got: values.len(),
                    })
                } else {
                    Ok(())
                }
            };
            match name.as_str() {
                "abs" => {
                    arity(1)?;
                    Ok(values[0].abs())
                }
                "floor" => {
                    arity(1)?;
                    Ok(values[0].floor())
                }
                "ceil" => {
                    arity(1)?;
                    Ok(values[0].ceil())
                }
                "round" => {
                    arity(1)?;
                    Ok(values[0].round())
                }
                "sqrt" => {
                    arity(1)?;
                    Ok(values[0].sqrt())
                }
                "min" => {
                    arity(2)?;
                    Ok(values[0].min(values[1]))
                }
                "max" => {
                    arity(2)?;
                    Ok(values[0].max(values[1]))
                }
                "clamp" => {
                    arity(3)?;
                    Ok(values[0].clamp(values[1], values[2]))
                }
                _ => Err(EvalError::UnknownFunction(name.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, f64)]) -> AHashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_number_parses() {
        let f = CompiledFormula::compile("42.5").unwrap();
        assert_eq!(f.evaluate(&ctx(&[])).unwrap(), 42.5);
    }

    #[test]
    fn test_precedence() {
        let f = CompiledFormula::compile("2 + 3 * 4").unwrap();
        assert_eq!(f.evaluate(&ctx(&[])).unwrap(), 14.0);
    }

    #[test]
    fn test_parens_override_precedence() {
        let f = CompiledFormula::compile("(2 + 3) * 4").unwrap();
        assert_eq!(f.evaluate(&ctx(&[])).unwrap(), 20.0);
    }

    #[test]
    fn test_identifiers_resolve_from_context() {
        let f = CompiledFormula::compile("(strength + stamina) / 2").unwrap();
        let result = f.evaluate(&ctx(&[("strength", 14.0), ("stamina", 10.0)])).unwrap();
        assert_eq!(result, 12.0);
        assert_eq!(f.idents, vec!["strength", "stamina"]);
    }

    #[test]
    fn test_idents_deduplicated_in_order() {
        let f = CompiledFormula::compile("a + b * a").unwrap();
        assert_eq!(f.idents, vec!["a", "b"]);
    }

    #[test]
    fn test_ternary() {
        let f = CompiledFormula::compile("hunger < 20 ? 1 : 0").unwrap();
        assert_eq!(f.evaluate(&ctx(&[("hunger", 10.0)])).unwrap(), 1.0);
        assert_eq!(f.evaluate(&ctx(&[("hunger", 50.0)])).unwrap(), 0.0);
    }

    #[test]
    fn test_nested_ternary_right_associative() {
        let f = CompiledFormula::compile("x > 10 ? 2 : x > 5 ? 1 : 0").unwrap();
        assert_eq!(f.evaluate(&ctx(&[("x", 20.0)])).unwrap(), 2.0);
        assert_eq!(f.evaluate(&ctx(&[("x", 7.0)])).unwrap(), 1.0);
        assert_eq!(f.evaluate(&ctx(&[("x", 1.0)])).unwrap(), 0.0);
    }

    #[test]
    fn test_functions() {
        let f = CompiledFormula::compile("max(a, min(b, 10)) + sqrt(16)").unwrap();
        assert_eq!(f.evaluate(&ctx(&[("a", 2.0), ("b", 50.0)])).unwrap(), 14.0);
    }

    #[test]
    fn test_unary_negation() {
        let f = CompiledFormula::compile("-x + 5").unwrap();
        assert_eq!(f.evaluate(&ctx(&[("x", 3.0)])).unwrap(), 2.0);
    }

    #[test]
    fn test_logical_operators() {
        let f = CompiledFormula::compile("a > 1 && b < 5 || c == 2").unwrap();
        assert_eq!(f.evaluate(&ctx(&[("a", 2.0), ("b", 3.0), ("c", 0.0)])).unwrap(), 1.0);
        assert_eq!(f.evaluate(&ctx(&[("a", 0.0), ("b", 3.0), ("c", 2.0)])).unwrap(), 1.0);
        assert_eq!(f.evaluate(&ctx(&[("a", 0.0), ("b", 9.0), ("c", 0.0)])).unwrap(), 0.0);
    }

    #[test]
    fn test_unknown_ident_errors() {
        let f = CompiledFormula::compile("missing + 1").unwrap();
        assert!(matches!(
            f.evaluate(&ctx(&[])),
            Err(EvalError::UnknownIdent(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_division_by_zero_is_infinite() {
        let f = CompiledFormula::compile("1 / x").unwrap();
        assert!(f.evaluate(&ctx(&[("x", 0.0)])).unwrap().is_infinite());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(CompiledFormula::compile("1 + 2 }").is_err());
    }

    #[test]
    fn test_cache_reuses_compiled() {
        let mut cache = FormulaCache::new();
        cache.insert("a + b").unwrap();
        cache.insert("a + b").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a + b").is_some());
        assert!(cache.get("a - b").is_none());
    }
}
