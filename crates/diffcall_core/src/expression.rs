//! Serialized expression functions.
//!
//! Residual and Jacobian functions arrive as strings of the form
//!
//! ```text
//! rhs(t, y, p) = -p * y; y * t
//! ```
//!
//! i.e. a name, an ordered list of inputs, and one or more `;`-separated
//! output expressions. [`Function::deserialize`] compiles every output to
//! bytecode for a small stack VM, which is then evaluated by [`Function::call`].

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

use crate::traits::Scalar;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of an input (by position in the signature) onto the stack.
    LoadInput(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based Virtual Machine for evaluating compiled outputs.
///
/// The VM is stateless; `execute` takes the bytecode, the input values and a
/// scratch stack, and returns the value left on the stack.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, inputs: &[T], stack: &mut Vec<T>) -> Result<T> {
        stack.clear();

        for op in &bytecode.ops {
            let value = match *op {
                OpCode::LoadConst(val) => {
                    T::from_f64(val).ok_or_else(|| anyhow!("Constant {val} is not representable"))?
                }
                OpCode::LoadInput(idx) => *inputs
                    .get(idx)
                    .ok_or_else(|| anyhow!("Input index {idx} out of range"))?,
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    }
                }
                OpCode::Sin => pop(stack)?.sin(),
                OpCode::Cos => pop(stack)?.cos(),
                OpCode::Exp => pop(stack)?.exp(),
                OpCode::Log => pop(stack)?.ln(),
                OpCode::Sqrt => pop(stack)?.sqrt(),
                OpCode::Neg => -pop(stack)?,
            };
            stack.push(value);
        }

        let result = pop(stack)?;
        if !stack.is_empty() {
            bail!("Malformed bytecode: {} values left on the stack", stack.len());
        }
        Ok(result)
    }
}

fn pop<T: Scalar>(stack: &mut Vec<T>) -> Result<T> {
    stack.pop().ok_or_else(|| anyhow!("Malformed bytecode: stack underflow"))
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Box<Expr>),            // functions like sin(x)
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves input names to positions.
pub struct Compiler {
    pub input_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(input_names: &[String]) -> Self {
        let input_map = input_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { input_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => match self.input_map.get(name) {
                Some(&idx) => ops.push(OpCode::LoadInput(idx)),
                None => bail!("Unknown input: {name}"),
            },
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => bail!("Unknown binary operator: {op}"),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => bail!("Unknown unary operator: {op}"),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "log" => OpCode::Log,
                    "sqrt" => OpCode::Sqrt,
                    _ => bail!("Unknown function: {func}"),
                });
            }
        }
        Ok(())
    }
}

/// Parses a single expression string into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Equals,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign = (d == '-' || d == '+') && num_str.ends_with(['e', 'E']);
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| anyhow!("Invalid number literal: {num_str}"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                ';' => Token::Semicolon,
                '=' => Token::Equals,
                _ => bail!("Unexpected character: {c:?}"),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

/// Nesting limit for parenthesised, negated and exponentiated subexpressions.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
            depth: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.consume() {
            Some(token) if token == expected => Ok(()),
            Some(token) => bail!("Expected {expected:?}, found {token:?}"),
            None => bail!("Expected {expected:?}, found end of input"),
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => bail!("Unexpected trailing token {token:?}"),
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.consume() {
            Some(Token::Identifier(name)) => Ok(name),
            Some(token) => bail!("Expected identifier, found {token:?}"),
            None => bail!("Expected identifier, found end of input"),
        }
    }

    /// `name(a, b, ...) =`
    fn parse_signature(&mut self) -> Result<(String, Vec<String>)> {
        let name = self.identifier()?;
        self.expect(Token::LParen)?;
        let mut inputs = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                inputs.push(self.identifier()?);
                if self.peek() == Some(&Token::Comma) {
                    self.consume();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        self.expect(Token::Equals)?;
        Ok((name, inputs))
    }

    /// `expr; expr; ...` with an optional trailing `;`.
    fn parse_outputs(&mut self) -> Result<Vec<Expr>> {
        let mut outputs = vec![self.parse_expression()?];
        while self.peek() == Some(&Token::Semicolon) {
            self.consume();
            if self.peek().is_none() {
                break;
            }
            outputs.push(self.parse_expression()?);
        }
        self.expect_end()?;
        Ok(outputs)
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;

        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut left = self.parse_power()?;

        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn nested(&mut self, parse: impl FnOnce(&mut Self) -> Result<Expr>) -> Result<Expr> {
        if self.depth >= MAX_DEPTH {
            bail!("Expression nested deeper than {MAX_DEPTH} levels");
        }
        self.depth += 1;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    // Right-associative: a ^ b ^ c == a ^ (b ^ c).
    fn parse_power(&mut self) -> Result<Expr> {
        self.nested(|parser| {
            let base = parser.parse_unary()?;
            if parser.peek() == Some(&Token::Caret) {
                parser.consume();
                let exponent = parser.parse_power()?;
                return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
            }
            Ok(base)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.nested(|parser| {
            if parser.peek() == Some(&Token::Minus) {
                parser.consume();
                let expr = parser.parse_unary()?;
                return Ok(Expr::Unary('-', Box::new(expr)));
            }
            parser.parse_primary()
        })
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => bail!("Unexpected token {token:?}"),
            None => bail!("Unexpected end of input"),
        }
    }
}

/// A deserialized, callable expression function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<Bytecode>,
}

impl Function {
    pub fn deserialize(data: &str) -> Result<Self> {
        let mut parser = Parser::new(data)?;
        let (name, inputs) = parser.parse_signature()?;
        let mut seen = HashMap::new();
        for (i, input) in inputs.iter().enumerate() {
            if let Some(first) = seen.insert(input.as_str(), i) {
                bail!("Input `{input}` of `{name}` is declared twice (positions {first} and {i})");
            }
        }
        let exprs = parser.parse_outputs()?;
        let compiler = Compiler::new(&inputs);
        let outputs = exprs
            .iter()
            .map(|expr| compiler.compile(expr))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| err.context(format!("Failed to compile `{name}`")))?;
        Ok(Self {
            name,
            inputs,
            outputs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn n_in(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_out(&self) -> usize {
        self.outputs.len()
    }

    pub fn call<T: Scalar>(&self, args: &[T]) -> Result<Vec<T>> {
        if args.len() != self.inputs.len() {
            bail!(
                "`{}` expects {} inputs, got {}",
                self.name,
                self.inputs.len(),
                args.len()
            );
        }
        let mut stack = Vec::with_capacity(16);
        self.outputs
            .iter()
            .map(|code| VM::execute(code, args, &mut stack))
            .collect()
    }
}

/// Deserializes a function from its string form.
pub fn generate_function(data: &str) -> Result<Function> {
    Function::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_precedence() {
        let expr = parse("1 + 2 * 3").expect("parse");
        let compiled = Compiler::new(&[]).compile(&expr).expect("compile");
        let mut stack = Vec::new();
        let value: f64 = VM::execute(&compiled, &[], &mut stack).expect("execute");
        assert_eq!(value, 7.0);
    }

    #[test]
    fn power_is_right_associative() {
        let function = generate_function("f() = 2 ^ 3 ^ 2").expect("function");
        assert_eq!(function.call::<f64>(&[]).expect("call"), vec![512.0]);
    }

    #[test]
    fn unary_minus_binds_tighter_than_product() {
        let function = generate_function("f(x) = -x * 3").expect("function");
        assert_eq!(function.call(&[2.0]).expect("call"), vec![-6.0]);
    }

    #[test]
    fn deserializes_multiple_outputs() {
        let function = generate_function("rhs(t, y, p) = -p * y; y * t;").expect("function");
        assert_eq!(function.name(), "rhs");
        assert_eq!(function.n_in(), 3);
        assert_eq!(function.n_out(), 2);
        let out = function.call(&[2.0, 3.0, 0.5]).expect("call");
        assert_eq!(out, vec![-1.5, 6.0]);
    }

    #[test]
    fn evaluates_builtin_functions() {
        let function = generate_function("g(x) = exp(log(x)) + sqrt(x) + sin(0) + cos(0)").expect("function");
        let out = function.call(&[4.0_f64]).expect("call");
        assert!((out[0] - 7.0).abs() < 1e-12);
    }

    #[test]
    fn scientific_literals_parse() {
        let function = generate_function("f(x) = 1.5e-3 * x + 2E2").expect("function");
        let out = function.call(&[1000.0_f64]).expect("call");
        assert!((out[0] - 201.5).abs() < 1e-12);
    }

    #[test]
    fn evaluates_in_f32() {
        let function = generate_function("f(a, b) = a / b").expect("function");
        assert_eq!(function.call(&[1.0f32, 4.0]).expect("call"), vec![0.25f32]);
    }

    #[test]
    fn unknown_input_is_an_error() {
        let err = generate_function("f(x) = x + z").unwrap_err();
        assert!(format!("{err:#}").contains("Unknown input: z"));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let err = generate_function("f(x) = tanh(x)").unwrap_err();
        assert!(format!("{err:#}").contains("Unknown function: tanh"));
    }

    #[test]
    fn duplicate_input_is_an_error() {
        assert!(generate_function("f(x, x) = x").is_err());
    }

    #[test]
    fn malformed_strings_are_errors() {
        assert!(generate_function("f(x) = 1 +").is_err());
        assert!(generate_function("f(x) = (x").is_err());
        assert!(generate_function("f(x) x").is_err());
        assert!(generate_function("f(x) = x $ 2").is_err());
        assert!(generate_function("f(x) = x x").is_err());
        assert!(parse("1..2").is_err());
    }

    #[test]
    fn deep_nesting_is_an_error() {
        let depth = 100_000;
        let input = format!("f() = {}1{}", "(".repeat(depth), ")".repeat(depth));
        let err = generate_function(&input).unwrap_err();
        assert!(format!("{err:#}").contains("nested deeper than"));

        assert!(generate_function(&format!("f() = {}1", "-".repeat(depth))).is_err());
        assert!(generate_function(&format!("f() = 1{}", "^1".repeat(depth))).is_err());
    }

    #[test]
    fn moderate_nesting_still_parses() {
        let input = format!("f() = {}2{}", "(".repeat(40), ")".repeat(40));
        let function = generate_function(&input).expect("function");
        assert_eq!(function.call::<f64>(&[]).expect("call"), vec![2.0]);
    }

    #[test]
    fn call_checks_arity() {
        let function = generate_function("f(a, b) = a + b").expect("function");
        let err = function.call(&[1.0]).unwrap_err();
        assert!(err.to_string().contains("expects 2 inputs, got 1"));
    }

    #[test]
    fn vm_rejects_unbalanced_bytecode() {
        let code = Bytecode {
            ops: vec![OpCode::LoadConst(1.0), OpCode::LoadConst(2.0)],
        };
        let mut stack = Vec::new();
        assert!(VM::execute::<f64>(&code, &[], &mut stack).is_err());

        let code = Bytecode {
            ops: vec![OpCode::Add],
        };
        assert!(VM::execute::<f64>(&code, &[], &mut stack).is_err());
    }
}
