//! Pixel-wise band algebra on data cubes
//!
//! Formulas reference bands by label, e.g. `"(B03 - B11) / (B03 + B11)"` for the
//! Normalized Difference Snow Index. Evaluation broadcasts over time, y and x and
//! produces a single-band cube.
//!
//! Undefined arithmetic is never an error: division by zero (including `0 / 0`)
//! yields NaN and NaN inputs propagate.

use crate::types::{CubeValue, DataCube, ScaError, ScaResult};
use ndarray::{Array4, Axis, Zip};
use regex::Regex;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Band(String),
    Op(char),
    LParen,
    RParen,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Band(String),
    BinOp {
        op: char,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
}

/// Expression with band labels resolved to cube band indices
#[derive(Debug, Clone)]
enum Resolved {
    Num(f64),
    Band(usize),
    BinOp {
        op: char,
        left: Box<Resolved>,
        right: Box<Resolved>,
    },
    Neg(Box<Resolved>),
}

fn tokenize(formula: &str) -> ScaResult<Vec<Token>> {
    let pattern = Regex::new(
        r"\s*(?:(?P<num>\d+\.?\d*(?:[eE][+-]?\d+)?|\.\d+(?:[eE][+-]?\d+)?)|(?P<band>[A-Za-z_][A-Za-z0-9_]*)|(?P<op>[-+*/])|(?P<lp>\()|(?P<rp>\))|(?P<bad>\S))",
    )
    .map_err(|e| ScaError::Formula(format!("Tokenizer pattern: {}", e)))?;

    let mut tokens = Vec::new();
    for caps in pattern.captures_iter(formula) {
        if let Some(m) = caps.name("num") {
            let value = m
                .as_str()
                .parse::<f64>()
                .map_err(|_| ScaError::Formula(format!("Invalid number: {}", m.as_str())))?;
            tokens.push(Token::Number(value));
        } else if let Some(m) = caps.name("band") {
            tokens.push(Token::Band(m.as_str().to_string()));
        } else if let Some(m) = caps.name("op") {
            // the op group always matches exactly one character
            if let Some(c) = m.as_str().chars().next() {
                tokens.push(Token::Op(c));
            }
        } else if caps.name("lp").is_some() {
            tokens.push(Token::LParen);
        } else if caps.name("rp").is_some() {
            tokens.push(Token::RParen);
        } else if let Some(m) = caps.name("bad") {
            return Err(ScaError::Formula(format!(
                "Unexpected character '{}' at offset {}",
                m.as_str(),
                m.start()
            )));
        }
    }

    if tokens.is_empty() {
        return Err(ScaError::Formula("Empty formula".to_string()));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// expr = term (('+' | '-') term)*
    fn parse_expr(&mut self) -> ScaResult<Expr> {
        let mut left = self.parse_term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_term()?;
            left = Expr::BinOp { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    /// term = factor (('*' | '/') factor)*
    fn parse_term(&mut self) -> ScaResult<Expr> {
        let mut left = self.parse_factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_factor()?;
            left = Expr::BinOp { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    /// factor = number | band | '(' expr ')' | ('-' | '+') factor
    fn parse_factor(&mut self) -> ScaResult<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Num(n)),
            Some(Token::Band(name)) => Ok(Expr::Band(name)),
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(ScaError::Formula("Expected closing parenthesis".to_string())),
                }
            }
            Some(Token::Op('-')) => Ok(Expr::Neg(Box::new(self.parse_factor()?))),
            Some(Token::Op('+')) => self.parse_factor(),
            other => Err(ScaError::Formula(format!("Unexpected token in formula: {:?}", other))),
        }
    }
}

fn collect_bands(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Num(_) => {}
        Expr::Band(name) => {
            out.insert(name.clone());
        }
        Expr::BinOp { left, right, .. } => {
            collect_bands(left, out);
            collect_bands(right, out);
        }
        Expr::Neg(inner) => collect_bands(inner, out),
    }
}

fn resolve(expr: &Expr, cube: &DataCube) -> ScaResult<Resolved> {
    Ok(match expr {
        Expr::Num(n) => Resolved::Num(*n),
        Expr::Band(name) => Resolved::Band(cube.band_index(name)?),
        Expr::BinOp { op, left, right } => Resolved::BinOp {
            op: *op,
            left: Box::new(resolve(left, cube)?),
            right: Box::new(resolve(right, cube)?),
        },
        Expr::Neg(inner) => Resolved::Neg(Box::new(resolve(inner, cube)?)),
    })
}

fn eval<F: Fn(usize) -> f64 + Copy>(expr: &Resolved, value_of: F) -> f64 {
    match expr {
        Resolved::Num(n) => *n,
        Resolved::Band(i) => value_of(*i),
        Resolved::Neg(inner) => -eval(inner, value_of),
        Resolved::BinOp { op, left, right } => {
            let l = eval(left, value_of);
            let r = eval(right, value_of);
            match op {
                '+' => l + r,
                '-' => l - r,
                '*' => l * r,
                '/' => {
                    if r == 0.0 {
                        f64::NAN
                    } else {
                        l / r
                    }
                }
                _ => f64::NAN,
            }
        }
    }
}

/// A parsed pixel-wise formula over named bands
#[derive(Debug, Clone)]
pub struct BandFormula {
    source: String,
    expr: Expr,
}

impl BandFormula {
    /// Parse a formula built from numbers, band labels, `+ - * /`, unary minus and
    /// parentheses.
    pub fn parse(formula: &str) -> ScaResult<Self> {
        let tokens = tokenize(formula)?;
        let mut parser = Parser::new(tokens);
        let expr = parser.parse_expr()?;
        if let Some(extra) = parser.peek() {
            return Err(ScaError::Formula(format!(
                "Unexpected trailing token {:?} in '{}'",
                extra, formula
            )));
        }
        Ok(Self { source: formula.to_string(), expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Band labels referenced by the formula, sorted
    pub fn band_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        collect_bands(&self.expr, &mut names);
        names.into_iter().collect()
    }

    /// Evaluate the formula for every cell of `cube`, producing a single-band cube
    /// labelled `output_label`.
    pub fn evaluate(&self, cube: &DataCube, output_label: &str) -> ScaResult<DataCube> {
        let (nt, nb, ny, nx) = cube.dim();
        log::info!("Evaluating band formula '{}' on {}x{}x{}x{} cube", self.source, nt, nb, ny, nx);

        let resolved = resolve(&self.expr, cube)?;
        let data = cube.data();
        let mut out = Array4::<CubeValue>::zeros((nt, 1, ny, nx));

        #[cfg(feature = "parallel")]
        {
            Zip::indexed(out.index_axis_mut(Axis(1), 0)).par_for_each(|(t, y, x), cell| {
                *cell = eval(&resolved, |b| data[[t, b, y, x]] as f64) as CubeValue;
            });
        }
        #[cfg(not(feature = "parallel"))]
        {
            Zip::indexed(out.index_axis_mut(Axis(1), 0)).for_each(|(t, y, x), cell| {
                *cell = eval(&resolved, |b| data[[t, b, y, x]] as f64) as CubeValue;
            });
        }

        let undefined = out.iter().filter(|v| v.is_nan()).count();
        log::debug!("Band formula produced {} undefined cells", undefined);

        DataCube::new(
            out,
            cube.times().to_vec(),
            vec![output_label.to_string()],
            cube.y().to_vec(),
            cube.x().to_vec(),
            cube.crs(),
        )
    }
}

/// `(a - b) / (a + b)` as a single-band cube
pub fn normalized_difference(
    cube: &DataCube,
    band_a: &str,
    band_b: &str,
    output_label: &str,
) -> ScaResult<DataCube> {
    let formula = BandFormula::parse(&format!("({a} - {b}) / ({a} + {b})", a = band_a, b = band_b))?;
    formula.evaluate(cube, output_label)
}

/// Normalized Difference Snow Index from a green and a short-wave infrared band
pub fn ndsi(cube: &DataCube, green: &str, swir: &str) -> ScaResult<DataCube> {
    normalized_difference(cube, green, swir, "NDSI")
}
