//! Right-hand-side expressions of model variables.
//!
//! `Expr` is the lexed form and still refers to variables by name. `Node` is
//! the compiled form: an `evalexpr` operator tree in which every variable
//! reference has been rewritten to a slot of a [`Slots`] buffer.

use evalexpr::{build_operator_tree, Context, EvalexprError, EvalexprResult, Value};
use logos::Logos;

/// Identifier prefix of a resolved variable inside a compiled tree.
const SLOT_PREFIX: &str = "_";

#[derive(Logos, Clone, Debug, PartialEq)]
#[logos(skip r"[ \t\r\n]+")] // Skip whitespace
#[logos(skip r"\[[^\]\n]*\]")] // Skip unit annotations
enum Token {
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*", |lex| lex.slice().to_string())]
    Name(String),
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("^")]
    Caret,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
}

impl Token {
    fn starts_operand(&self) -> bool {
        matches!(self, Token::Number(_) | Token::Name(_) | Token::LParen | Token::Not)
    }

    fn ends_operand(&self) -> bool {
        matches!(self, Token::Number(_) | Token::Name(_) | Token::RParen)
    }

    fn operator(&self) -> &'static str {
        match self {
            Token::And => "&&",
            Token::Or => "||",
            Token::Not => "!",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Caret => "^",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Comma => ",",
            Token::Number(_) | Token::Name(_) => "",
        }
    }
}

/// Functions a right-hand side may call, with their accepted argument counts.
fn arity_ok(name: &str, n: usize) -> Option<bool> {
    Some(match name {
        "exp" | "log" | "log10" | "sqrt" | "abs" | "floor" | "ceil" | "sin" | "cos" | "tan" | "tanh" => n == 1,
        "pow" => n == 2,
        "if" => n == 3,
        "piecewise" => n >= 3 && n % 2 == 1,
        _ => return None,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    tokens: Vec<Token>,
}

#[derive(Clone, Debug)]
pub enum Node {
    Num(f64),
    Tree(evalexpr::Node),
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, String> {
        let mut tokens = Vec::new();
        let mut lexer = Token::lexer(src);
        while let Some(tok) = lexer.next() {
            match tok {
                Ok(tok) => tokens.push(tok),
                Err(()) => return Err(format!("unexpected {:?} in expression {src:?}", lexer.slice())),
            }
        }
        if tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        for pair in tokens.windows(2) {
            if pair[0].ends_operand() && pair[1].starts_operand() && !is_call(&pair[0], &pair[1]) {
                return Err(format!("missing operator in expression {src:?}"));
            }
        }
        let expr = Expr { tokens };
        expr.check_calls()?;
        build_operator_tree(&expr.render(&mut |_: &str| Some(0))?)
            .map_err(|e| format!("{e} in expression {src:?}"))?;
        Ok(expr)
    }

    /// A literal expression.
    pub fn number(value: f64) -> Expr {
        let tokens = if value.is_sign_negative() && value != 0.0 {
            vec![Token::Minus, Token::Number(-value)]
        } else {
            vec![Token::Number(value)]
        };
        Expr { tokens }
    }

    /// Appends every referenced name, in order of appearance.
    pub fn names<'a>(&'a self, out: &mut Vec<&'a str>) {
        for (i, tok) in self.tokens.iter().enumerate() {
            if let Token::Name(n) = tok {
                if !matches!(self.tokens.get(i + 1), Some(Token::LParen)) {
                    out.push(n);
                }
            }
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self.tokens.as_slice() {
            [Token::Number(v)] => Some(*v),
            [Token::Minus, Token::Number(v)] => Some(-v),
            _ => None,
        }
    }

    pub fn compile<F>(&self, resolve: &mut F) -> Result<Node, String>
    where
        F: FnMut(&str) -> Option<usize>,
    {
        if let Some(v) = self.as_number() {
            return Ok(Node::Num(v));
        }
        let text = self.render(resolve)?;
        build_operator_tree(&text)
            .map(Node::Tree)
            .map_err(|e| e.to_string())
    }

    /// Every call names a known function with an accepted number of arguments.
    fn check_calls(&self) -> Result<(), String> {
        for (i, pair) in self.tokens.windows(2).enumerate() {
            let (Token::Name(name), Token::LParen) = (&pair[0], &pair[1]) else {
                continue;
            };
            let mut depth = 0usize;
            let mut commas = 0usize;
            let mut empty = true;
            for tok in &self.tokens[i + 1..] {
                match tok {
                    Token::LParen => depth += 1,
                    Token::RParen => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    Token::Comma if depth == 1 => commas += 1,
                    _ => {}
                }
                if depth >= 1 && tok != &Token::LParen {
                    empty = false;
                }
            }
            let n = if empty { 0 } else { commas + 1 };
            match arity_ok(name, n) {
                None => return Err(format!("unknown function {name}")),
                Some(false) => return Err(format!("wrong number of arguments ({n}) for {name}")),
                Some(true) => {}
            }
        }
        Ok(())
    }

    /// Writes the expression in `evalexpr` syntax with every variable name
    /// replaced by its slot identifier.
    fn render<F>(&self, resolve: &mut F) -> Result<String, String>
    where
        F: FnMut(&str) -> Option<usize>,
    {
        let mut out = String::new();
        for (i, tok) in self.tokens.iter().enumerate() {
            let after_callee = i > 0 && is_call(&self.tokens[i - 1], tok);
            if !out.is_empty() && !after_callee {
                out.push(' ');
            }
            match tok {
                Token::Number(v) => {
                    // literals stay floats so `1 / 2` is not integer division
                    let text = v.to_string();
                    out.push_str(&text);
                    if !text.contains('.') {
                        out.push_str(".0");
                    }
                }
                Token::Name(n) if matches!(self.tokens.get(i + 1), Some(Token::LParen)) => out.push_str(n),
                Token::Name(n) => {
                    let slot = resolve(n).ok_or_else(|| format!("unknown variable {n}"))?;
                    out.push_str(SLOT_PREFIX);
                    out.push_str(&slot.to_string());
                }
                Token::Plus if i == 0 || !self.tokens[i - 1].ends_operand() => {}
                other => out.push_str(other.operator()),
            }
        }
        Ok(out)
    }
}

fn is_call(a: &Token, b: &Token) -> bool {
    matches!((a, b), (Token::Name(_), Token::LParen))
}

impl Node {
    /// Evaluates against `slots`; type errors and unknown slots give NaN.
    pub fn eval(&self, slots: &Slots) -> f64 {
        match self {
            Node::Num(v) => *v,
            Node::Tree(tree) => tree
                .eval_with_context(slots)
                .ok()
                .and_then(|v| number(&v).ok())
                .unwrap_or(f64::NAN),
        }
    }
}

/// Evaluation buffer: one value per model variable, addressed by slot.
#[derive(Clone, Debug)]
pub struct Slots(Vec<Value>);

impl Slots {
    pub fn new(len: usize) -> Self {
        Self(vec![Value::Float(0.0); len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, slot: usize) -> f64 {
        match self.0[slot] {
            Value::Float(v) => v,
            _ => f64::NAN,
        }
    }

    pub fn set(&mut self, slot: usize, value: f64) {
        self.0[slot] = Value::Float(value);
    }
}

fn number(v: &Value) -> EvalexprResult<f64> {
    match v {
        Value::Float(x) => Ok(*x),
        Value::Int(i) => Ok(*i as f64),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(EvalexprError::CustomMessage(format!("expected a number, got {other}"))),
    }
}

fn truth(v: &Value) -> EvalexprResult<bool> {
    match v {
        Value::Boolean(b) => Ok(*b),
        other => number(other).map(|x| x != 0.0),
    }
}

impl Context for Slots {
    fn get_value(&self, identifier: &str) -> Option<&Value> {
        let slot: usize = identifier.strip_prefix(SLOT_PREFIX)?.parse().ok()?;
        self.0.get(slot)
    }

    fn call_function(&self, identifier: &str, argument: &Value) -> EvalexprResult<Value> {
        let args: &[Value] = match argument {
            Value::Tuple(items) => items.as_slice(),
            Value::Empty => &[],
            single => std::slice::from_ref(single),
        };
        let x = match identifier {
            "if" => {
                let [c, a, b] = args else {
                    return Err(EvalexprError::CustomMessage("if takes three arguments".to_string()));
                };
                return Ok(Value::Float(number(if truth(c)? { a } else { b })?));
            }
            "piecewise" => {
                for pair in args.chunks(2) {
                    match pair {
                        [otherwise] => return Ok(Value::Float(number(otherwise)?)),
                        [c, v] if truth(c)? => return Ok(Value::Float(number(v)?)),
                        _ => {}
                    }
                }
                f64::NAN
            }
            "pow" => match args {
                [a, b] => number(a)?.powf(number(b)?),
                _ => return Err(EvalexprError::CustomMessage("pow takes two arguments".to_string())),
            },
            name => {
                let [a] = args else {
                    return Err(EvalexprError::CustomMessage(format!("{name} takes one argument")));
                };
                let a = number(a)?;
                match name {
                    "exp" => a.exp(),
                    "log" => a.ln(),
                    "log10" => a.log10(),
                    "sqrt" => a.sqrt(),
                    "abs" => a.abs(),
                    "floor" => a.floor(),
                    "ceil" => a.ceil(),
                    "sin" => a.sin(),
                    "cos" => a.cos(),
                    "tan" => a.tan(),
                    "tanh" => a.tanh(),
                    _ => return Err(EvalexprError::FunctionIdentifierNotFound(name.to_string())),
                }
            }
        };
        Ok(Value::Float(x))
    }

    fn are_builtin_functions_disabled(&self) -> bool {
        true
    }

    fn set_builtin_functions_disabled(&mut self, disabled: bool) -> EvalexprResult<()> {
        if disabled {
            Ok(())
        } else {
            Err(EvalexprError::CustomMessage(
                "model expressions only call model functions".to_string(),
            ))
        }
    }
}
