use std::fmt;

use crate::context::{Callable, EvalContext, Filter, Method, PostProcessContext};
use crate::datum::{Datum, DatumError};
use crate::error::WeftError;
use crate::tokenizer::{tokenize, Token, TokenKind, Tokenizer};

// ── AST ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Increment,
    Decrement,
}

impl UnaryOp {
    fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::Increment => "++",
            UnaryOp::Decrement => "--",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Cmp,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Cmp => "<=>",
        }
    }
}

/// What a call expression dispatches to. Resolved once during
/// post-processing so that the call itself is a table-free jump.
enum CallTarget {
    Unresolved,
    Function(Callable),
    Method(Method),
}

/// An expression node; `offset` is the byte offset of its first token in
/// the template source.
pub struct Expression {
    pub offset: usize,
    kind: ExprKind,
}

enum ExprKind {
    Literal(Datum),
    Name(String),
    Vector(Vec<Expression>),
    Map(Vec<(Expression, Expression)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Ternary {
        condition: Box<Expression>,
        then_expr: Box<Expression>,
        else_expr: Box<Expression>,
    },
    Member {
        lhs: Box<Expression>,
        name: String,
    },
    Index {
        lhs: Box<Expression>,
        index: Box<Expression>,
    },
    Call {
        lhs: Box<Expression>,
        args: Vec<Expression>,
        target: CallTarget,
    },
    FilterApply {
        lhs: Box<Expression>,
        name: String,
        filter: Option<Filter>,
    },
    Assign {
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    InplaceOp {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
}

fn datum_error(e: DatumError, offset: usize) -> WeftError {
    WeftError::new(e.kind, e.message, offset)
}

impl Expression {
    fn new(offset: usize, kind: ExprKind) -> Expression {
        Expression { offset, kind }
    }

    // ── Post-processing ────────────────────────────────────────────

    /// Resolve call targets and filters; runs once before evaluation.
    pub fn post_process(&mut self, ppctx: &PostProcessContext) -> Result<(), WeftError> {
        match &mut self.kind {
            ExprKind::Literal(_) | ExprKind::Name(_) => Ok(()),
            ExprKind::Vector(items) => {
                for item in items {
                    item.post_process(ppctx)?;
                }
                Ok(())
            }
            ExprKind::Map(entries) => {
                for (key, value) in entries {
                    key.post_process(ppctx)?;
                    value.post_process(ppctx)?;
                }
                Ok(())
            }
            ExprKind::Unary { operand, .. } => operand.post_process(ppctx),
            ExprKind::Binary { lhs, rhs, .. }
            | ExprKind::Assign { lhs, rhs }
            | ExprKind::InplaceOp { lhs, rhs, .. } => {
                lhs.post_process(ppctx)?;
                rhs.post_process(ppctx)
            }
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                condition.post_process(ppctx)?;
                then_expr.post_process(ppctx)?;
                else_expr.post_process(ppctx)
            }
            ExprKind::Member { lhs, .. } => lhs.post_process(ppctx),
            ExprKind::Index { lhs, index } => {
                lhs.post_process(ppctx)?;
                index.post_process(ppctx)
            }
            ExprKind::Call { lhs, args, target } => {
                for arg in args.iter_mut() {
                    arg.post_process(ppctx)?;
                }
                match &mut lhs.kind {
                    ExprKind::Name(name) => match ppctx.get_function(name) {
                        Some(callable) => {
                            *target = CallTarget::Function(callable);
                            Ok(())
                        }
                        None => Err(WeftError::parse(
                            format!("Could not find function {}()", name),
                            lhs.offset,
                        )),
                    },
                    ExprKind::Member { lhs: inner, name } => {
                        inner.post_process(ppctx)?;
                        match ppctx.get_method(name) {
                            Some(method) => {
                                *target = CallTarget::Method(method);
                                Ok(())
                            }
                            None => Err(WeftError::parse(
                                format!("Could not find method .{}()", name),
                                lhs.offset,
                            )),
                        }
                    }
                    _ => Err(WeftError::parse("Expression is not callable", lhs.offset)),
                }
            }
            ExprKind::FilterApply { lhs, name, filter } => {
                lhs.post_process(ppctx)?;
                match ppctx.get_filter(name) {
                    Some(found) => {
                        *filter = Some(found);
                        Ok(())
                    }
                    None => Err(WeftError::parse(
                        format!("Could not find filter {}", name),
                        self.offset,
                    )),
                }
            }
        }
    }

    // ── Evaluation ─────────────────────────────────────────────────

    pub fn evaluate(&self, ctx: &mut EvalContext) -> Result<Datum, WeftError> {
        match &self.kind {
            ExprKind::Literal(value) => Ok(value.clone()),
            ExprKind::Name(name) => ctx.get(name, self.offset),
            ExprKind::Vector(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.evaluate(ctx)?);
                }
                Ok(Datum::from(values))
            }
            ExprKind::Map(entries) => {
                let mut map = std::collections::BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.evaluate(ctx)?, value.evaluate(ctx)?);
                }
                Ok(Datum::from(map))
            }
            ExprKind::Unary { op, operand } => self.evaluate_unary(*op, operand, ctx),
            ExprKind::Binary { op, lhs, rhs } => self.evaluate_binary(*op, lhs, rhs, ctx),
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if condition.evaluate(ctx)?.truthy() {
                    then_expr.evaluate(ctx)
                } else {
                    else_expr.evaluate(ctx)
                }
            }
            ExprKind::Member { lhs, name } => {
                let value = lhs.evaluate(ctx)?;
                value
                    .index(&Datum::from(name.as_str()))
                    .map_err(|e| datum_error(e, self.offset))
            }
            ExprKind::Index { lhs, index } => {
                let key = index.evaluate(ctx)?;
                let value = lhs.evaluate(ctx)?;
                value.index(&key).map_err(|e| datum_error(e, self.offset))
            }
            ExprKind::Call { lhs, args, target } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(ctx)?);
                }
                match target {
                    CallTarget::Function(callable) => callable.call(ctx, &values, self.offset),
                    CallTarget::Method(method) => {
                        let ExprKind::Member { lhs: inner, .. } = &lhs.kind else {
                            return Err(WeftError::invalid_operation(
                                "Expression is not callable",
                                self.offset,
                            ));
                        };
                        let self_value = inner.evaluate_lvalue(ctx)?;
                        method(self_value, &values).map_err(|e| e.or_at(self.offset))
                    }
                    CallTarget::Unresolved => Err(WeftError::invalid_operation(
                        "Expression was not post-processed",
                        self.offset,
                    )),
                }
            }
            ExprKind::FilterApply { lhs, name, filter } => {
                let value = lhs.evaluate(ctx)?;
                match filter {
                    Some(filter) => Ok(Datum::from(filter(&value.to_string()))),
                    None => Err(WeftError::invalid_operation(
                        format!("Filter {} was not post-processed", name),
                        self.offset,
                    )),
                }
            }
            ExprKind::Assign { lhs, rhs } => {
                let value = rhs.evaluate(ctx)?;
                *lhs.evaluate_lvalue(ctx)? = value.clone();
                Ok(value)
            }
            ExprKind::InplaceOp { op, lhs, rhs } => {
                let value = rhs.evaluate(ctx)?;
                let offset = self.offset;
                let slot = lhs.evaluate_lvalue(ctx)?;
                let result = apply_binary(*op, slot, &value).map_err(|e| datum_error(e, offset))?;
                *slot = result.clone();
                Ok(result)
            }
        }
    }

    /// Resolve to a mutable storage slot inside the evaluation context.
    pub fn evaluate_lvalue<'a>(
        &self,
        ctx: &'a mut EvalContext,
    ) -> Result<&'a mut Datum, WeftError> {
        match &self.kind {
            ExprKind::Name(name) => ctx.get_mut_or_create(name, self.offset),
            ExprKind::Member { lhs, name } => {
                let offset = self.offset;
                let container = lhs.evaluate_lvalue(ctx)?;
                container
                    .index_mut(&Datum::from(name.as_str()))
                    .map_err(|e| datum_error(e, offset))
            }
            ExprKind::Index { lhs, index } => {
                let offset = self.offset;
                let key = index.evaluate(ctx)?;
                let container = lhs.evaluate_lvalue(ctx)?;
                container
                    .index_mut(&key)
                    .map_err(|e| datum_error(e, offset))
            }
            _ => Err(WeftError::invalid_operation(
                format!("Expression '{}' is not assignable", self),
                self.offset,
            )),
        }
    }

    fn evaluate_unary(
        &self,
        op: UnaryOp,
        operand: &Expression,
        ctx: &mut EvalContext,
    ) -> Result<Datum, WeftError> {
        match op {
            UnaryOp::Neg => {
                let value = operand.evaluate(ctx)?;
                value.neg().map_err(|e| datum_error(e, self.offset))
            }
            UnaryOp::Not => Ok(operand.evaluate(ctx)?.logical_not()),
            UnaryOp::BitNot => {
                let value = operand.evaluate(ctx)?;
                value.bit_not().map_err(|e| datum_error(e, self.offset))
            }
            UnaryOp::Increment | UnaryOp::Decrement => {
                let offset = self.offset;
                let one = Datum::from(1i64);
                let slot = operand.evaluate_lvalue(ctx)?;
                let result = if op == UnaryOp::Increment {
                    slot.add(&one)
                } else {
                    slot.sub(&one)
                }
                .map_err(|e| datum_error(e, offset))?;
                *slot = result.clone();
                Ok(result)
            }
        }
    }

    fn evaluate_binary(
        &self,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
        ctx: &mut EvalContext,
    ) -> Result<Datum, WeftError> {
        // Short-circuit forms first.
        match op {
            BinaryOp::And => {
                let left = lhs.evaluate(ctx)?;
                return if left.truthy() { rhs.evaluate(ctx) } else { Ok(left) };
            }
            BinaryOp::Or => {
                let left = lhs.evaluate(ctx)?;
                return if left.truthy() { Ok(left) } else { rhs.evaluate(ctx) };
            }
            _ => {}
        }

        let left = lhs.evaluate(ctx)?;
        let right = rhs.evaluate(ctx)?;
        match op {
            BinaryOp::Eq => Ok(Datum::from(left == right)),
            BinaryOp::Ne => Ok(Datum::from(left != right)),
            BinaryOp::Lt => Ok(Datum::from(left < right)),
            BinaryOp::Gt => Ok(Datum::from(left > right)),
            BinaryOp::Le => Ok(Datum::from(left <= right)),
            BinaryOp::Ge => Ok(Datum::from(left >= right)),
            BinaryOp::Cmp => Ok(Datum::from(match left.cmp(&right) {
                std::cmp::Ordering::Less => -1i64,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            })),
            _ => apply_binary(op, &left, &right).map_err(|e| datum_error(e, self.offset)),
        }
    }
}

fn apply_binary(op: BinaryOp, lhs: &Datum, rhs: &Datum) -> Result<Datum, DatumError> {
    match op {
        BinaryOp::Add => lhs.add(rhs),
        BinaryOp::Sub => lhs.sub(rhs),
        BinaryOp::Mul => lhs.mul(rhs),
        BinaryOp::Div => lhs.div(rhs),
        BinaryOp::Rem => lhs.rem(rhs),
        BinaryOp::Shl => lhs.shl(rhs),
        BinaryOp::Shr => lhs.shr(rhs),
        BinaryOp::BitAnd => lhs.bit_and(rhs),
        BinaryOp::BitOr => lhs.bit_or(rhs),
        BinaryOp::BitXor => lhs.bit_xor(rhs),
        _ => Err(DatumError {
            kind: crate::error::ErrorKind::InvalidOperation,
            message: format!("Operator {} is not an arithmetic operator", op.symbol()),
        }),
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Literal(value) => write!(f, "{}", value.repr_string()),
            ExprKind::Name(name) => write!(f, "{}", name),
            ExprKind::Vector(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            ExprKind::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            ExprKind::Unary { op, operand } => write!(f, "({} {})", op.symbol(), operand),
            ExprKind::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => write!(f, "({} ? {} : {})", condition, then_expr, else_expr),
            ExprKind::Member { lhs, name } => write!(f, "({}.{})", lhs, name),
            ExprKind::Index { lhs, index } => write!(f, "({}[{}])", lhs, index),
            ExprKind::Call { lhs, args, .. } => {
                write!(f, "({}(", lhs)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, "))")
            }
            ExprKind::FilterApply { lhs, name, .. } => write!(f, "({} ! {})", lhs, name),
            ExprKind::Assign { lhs, rhs } => write!(f, "({} = {})", lhs, rhs),
            ExprKind::InplaceOp { op, lhs, rhs } => {
                write!(f, "({} {}= {})", lhs, op.symbol(), rhs)
            }
        }
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ── Parser ─────────────────────────────────────────────────────────

// Binds tighter than every binary operator; unary operators capture
// postfix forms (`-a.b` negates the member) but not arithmetic.
const UNARY_PRECEDENCE: u8 = 15;

// (precedence, right-associative) for infix and postfix operators.
fn binary_precedence(op: &str) -> Option<(u8, bool)> {
    Some(match op {
        "=" | "+=" | "-=" | "*=" | "/=" | "%=" | "<<=" | ">>=" | "&=" | "|=" | "^=" => (1, true),
        "!" => (2, false),
        "?" => (3, true),
        "||" => (4, false),
        "&&" => (5, false),
        "|" => (6, false),
        "^" => (7, false),
        "&" => (8, false),
        "==" | "!=" => (9, false),
        "<" | ">" | "<=" | ">=" | "<=>" => (10, false),
        "<<" | ">>" => (11, false),
        "+" | "-" => (12, false),
        "*" | "/" | "%" => (13, false),
        "." | "[" | "(" => (20, false),
        _ => return None,
    })
}

fn simple_binary_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "||" => BinaryOp::Or,
        "&&" => BinaryOp::And,
        "|" => BinaryOp::BitOr,
        "^" => BinaryOp::BitXor,
        "&" => BinaryOp::BitAnd,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        ">" => BinaryOp::Gt,
        "<=" => BinaryOp::Le,
        ">=" => BinaryOp::Ge,
        "<=>" => BinaryOp::Cmp,
        "<<" => BinaryOp::Shl,
        ">>" => BinaryOp::Shr,
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        _ => return None,
    })
}

fn inplace_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "+=" => BinaryOp::Add,
        "-=" => BinaryOp::Sub,
        "*=" => BinaryOp::Mul,
        "/=" => BinaryOp::Div,
        "%=" => BinaryOp::Rem,
        "<<=" => BinaryOp::Shl,
        ">>=" => BinaryOp::Shr,
        "&=" => BinaryOp::BitAnd,
        "|=" => BinaryOp::BitOr,
        "^=" => BinaryOp::BitXor,
        _ => return None,
    })
}

struct ExpressionParser {
    tokens: Vec<Token>,
    index: usize,
}

impl ExpressionParser {
    fn new(text: &str, base: usize) -> ExpressionParser {
        let mut tokens = tokenize(text);
        for token in &mut tokens {
            token.offset += base;
        }
        ExpressionParser { tokens, index: 0 }
    }

    fn peek(&self) -> &Token {
        // The token list always ends with an End token; clamp to it.
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    fn expect_operator(&mut self, op: &str) -> Result<Token, WeftError> {
        let token = self.peek();
        if token.is_operator(op) {
            Ok(self.advance())
        } else {
            Err(WeftError::parse(
                format!("Expecting '{}', got '{}'", op, token),
                token.offset,
            ))
        }
    }

    fn check_token(&self) -> Result<(), WeftError> {
        let token = self.peek();
        match token.kind {
            TokenKind::ErrorInvalidCharacter => Err(WeftError::parse(
                format!("Invalid character '{}'", token.value),
                token.offset,
            )),
            TokenKind::ErrorEOTInBlockComment => Err(WeftError::parse(
                "Unterminated block comment",
                token.offset,
            )),
            TokenKind::ErrorEOTInString | TokenKind::ErrorLFInString => {
                Err(WeftError::parse("Unterminated string literal", token.offset))
            }
            _ => Ok(()),
        }
    }

    fn parse_expression(&mut self) -> Result<Expression, WeftError> {
        let lhs = self.parse_primary()?;
        self.parse_expression_1(lhs, 0)
    }

    // Precedence climbing; postfix forms are handled as maximal-binding
    // operators in the same loop.
    fn parse_expression_1(
        &mut self,
        mut lhs: Expression,
        min_precedence: u8,
    ) -> Result<Expression, WeftError> {
        loop {
            self.check_token()?;
            let token = self.peek();
            if token.kind != TokenKind::Operator {
                break;
            }
            let Some((precedence, _)) = binary_precedence(&token.value) else {
                break;
            };
            if precedence < min_precedence {
                break;
            }

            let op_token = self.advance();
            let offset = op_token.offset;
            match op_token.value.as_str() {
                "(" => {
                    let args = self.parse_call_arguments()?;
                    lhs = Expression::new(
                        offset,
                        ExprKind::Call {
                            lhs: Box::new(lhs),
                            args,
                            target: CallTarget::Unresolved,
                        },
                    );
                    continue;
                }
                "[" => {
                    let index = self.parse_expression()?;
                    self.expect_operator("]")?;
                    lhs = Expression::new(
                        offset,
                        ExprKind::Index {
                            lhs: Box::new(lhs),
                            index: Box::new(index),
                        },
                    );
                    continue;
                }
                "?" => {
                    let then_expr = self.parse_expression()?;
                    self.expect_operator(":")?;
                    let else_expr = self.parse_expression()?;
                    lhs = Expression::new(
                        offset,
                        ExprKind::Ternary {
                            condition: Box::new(lhs),
                            then_expr: Box::new(then_expr),
                            else_expr: Box::new(else_expr),
                        },
                    );
                    continue;
                }
                "." => {
                    let name = self.expect_name()?;
                    lhs = Expression::new(
                        offset,
                        ExprKind::Member {
                            lhs: Box::new(lhs),
                            name,
                        },
                    );
                    continue;
                }
                "!" => {
                    let name = self.expect_name()?;
                    lhs = Expression::new(
                        offset,
                        ExprKind::FilterApply {
                            lhs: Box::new(lhs),
                            name,
                            filter: None,
                        },
                    );
                    continue;
                }
                _ => {}
            }

            let mut rhs = self.parse_primary()?;
            loop {
                let next = self.peek();
                if next.kind != TokenKind::Operator {
                    break;
                }
                let Some((next_precedence, right_assoc)) = binary_precedence(&next.value) else {
                    break;
                };
                if next_precedence > precedence || (next_precedence == precedence && right_assoc) {
                    rhs = self.parse_expression_1(rhs, next_precedence)?;
                } else {
                    break;
                }
            }

            let op = op_token.value.as_str();
            lhs = if op == "=" {
                Expression::new(
                    offset,
                    ExprKind::Assign {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                )
            } else if let Some(binary) = inplace_op(op) {
                Expression::new(
                    offset,
                    ExprKind::InplaceOp {
                        op: binary,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                )
            } else if let Some(binary) = simple_binary_op(op) {
                Expression::new(
                    offset,
                    ExprKind::Binary {
                        op: binary,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                )
            } else {
                return Err(WeftError::parse(
                    format!("Unexpected operator '{}'", op),
                    offset,
                ));
            };
        }
        Ok(lhs)
    }

    fn expect_name(&mut self) -> Result<String, WeftError> {
        let token = self.peek();
        if token.kind == TokenKind::Name {
            Ok(self.advance().value)
        } else {
            Err(WeftError::parse(
                format!("Expecting a name, got '{}'", token),
                token.offset,
            ))
        }
    }

    fn parse_call_arguments(&mut self) -> Result<Vec<Expression>, WeftError> {
        let mut args = Vec::new();
        if self.peek().is_operator(")") {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            if self.peek().is_operator(",") {
                self.advance();
                continue;
            }
            self.expect_operator(")")?;
            return Ok(args);
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, WeftError> {
        self.check_token()?;
        let token = self.peek().clone();
        match token.kind {
            TokenKind::IntegerLiteral => {
                self.advance();
                let value = parse_integer_literal(&token.value, token.offset)?;
                Ok(Expression::new(token.offset, ExprKind::Literal(value)))
            }
            TokenKind::FloatLiteral => {
                self.advance();
                match token.value.parse::<f64>() {
                    Ok(value) => Ok(Expression::new(
                        token.offset,
                        ExprKind::Literal(Datum::from(value)),
                    )),
                    Err(_) => Err(WeftError::parse(
                        format!("Invalid float literal '{}'", token.value),
                        token.offset,
                    )),
                }
            }
            TokenKind::StringLiteral => {
                self.advance();
                Ok(Expression::new(
                    token.offset,
                    ExprKind::Literal(Datum::from(token.value.as_str())),
                ))
            }
            TokenKind::Name => {
                self.advance();
                let kind = match token.value.as_str() {
                    "true" => ExprKind::Literal(Datum::from(true)),
                    "false" => ExprKind::Literal(Datum::from(false)),
                    "null" => ExprKind::Literal(Datum::null()),
                    "undefined" => ExprKind::Literal(Datum::undefined()),
                    _ => ExprKind::Name(token.value),
                };
                Ok(Expression::new(token.offset, kind))
            }
            TokenKind::Operator => match token.value.as_str() {
                "(" => {
                    self.advance();
                    let inner = self.parse_expression()?;
                    self.expect_operator(")")?;
                    Ok(inner)
                }
                "[" => {
                    self.advance();
                    self.parse_vector_literal(token.offset)
                }
                "{" => {
                    self.advance();
                    self.parse_map_literal(token.offset)
                }
                "-" => self.parse_unary(UnaryOp::Neg),
                "+" => {
                    // Unary plus is a no-op.
                    self.advance();
                    let operand = self.parse_primary()?;
                    self.parse_expression_1(operand, UNARY_PRECEDENCE)
                }
                "!" => self.parse_unary(UnaryOp::Not),
                "~" => self.parse_unary(UnaryOp::BitNot),
                "++" => self.parse_unary(UnaryOp::Increment),
                "--" => self.parse_unary(UnaryOp::Decrement),
                _ => Err(WeftError::parse(
                    format!("Expecting an operand, got '{}'", token),
                    token.offset,
                )),
            },
            _ => Err(WeftError::parse(
                format!("Expecting an operand, got '{}'", token),
                token.offset,
            )),
        }
    }

    fn parse_unary(&mut self, op: UnaryOp) -> Result<Expression, WeftError> {
        let token = self.advance();
        let primary = self.parse_primary()?;
        let operand = self.parse_expression_1(primary, UNARY_PRECEDENCE)?;
        Ok(Expression::new(
            token.offset,
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        ))
    }

    fn parse_vector_literal(&mut self, offset: usize) -> Result<Expression, WeftError> {
        let mut items = Vec::new();
        loop {
            if self.peek().is_operator("]") {
                self.advance();
                return Ok(Expression::new(offset, ExprKind::Vector(items)));
            }
            items.push(self.parse_expression()?);
            if self.peek().is_operator(",") {
                self.advance();
                continue;
            }
            self.expect_operator("]")?;
            return Ok(Expression::new(offset, ExprKind::Vector(items)));
        }
    }

    fn parse_map_literal(&mut self, offset: usize) -> Result<Expression, WeftError> {
        let mut entries = Vec::new();
        loop {
            if self.peek().is_operator("}") {
                self.advance();
                return Ok(Expression::new(offset, ExprKind::Map(entries)));
            }
            let key = self.parse_expression()?;
            self.expect_operator(":")?;
            let value = self.parse_expression()?;
            entries.push((key, value));
            if self.peek().is_operator(",") {
                self.advance();
                continue;
            }
            self.expect_operator("}")?;
            return Ok(Expression::new(offset, ExprKind::Map(entries)));
        }
    }
}

fn parse_integer_literal(text: &str, offset: usize) -> Result<Datum, WeftError> {
    let (digits, radix) = if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        (rest, 8)
    } else if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        (rest, 2)
    } else if let Some(rest) = text.strip_prefix("0d").or_else(|| text.strip_prefix("0D")) {
        (rest, 10)
    } else {
        (text, 10)
    };
    match i64::from_str_radix(digits, radix) {
        Ok(value) => Ok(Datum::from(value)),
        Err(_) => Err(WeftError::parse(
            format!("Invalid integer literal '{}'", text),
            offset,
        )),
    }
}

/// Parse a complete expression; `base` is added to every source offset so
/// diagnostics point into the enclosing template.
pub fn parse_expression(text: &str, base: usize) -> Result<Expression, WeftError> {
    let mut parser = ExpressionParser::new(text, base);
    let expression = parser.parse_expression()?;
    let token = parser.peek();
    if token.kind != TokenKind::End {
        return Err(WeftError::parse(
            format!("Expecting an operator, got '{}'", token),
            token.offset,
        ));
    }
    Ok(expression)
}

/// Find the byte offset in `text` of the `end_op` operator that closes
/// the expression starting at the beginning of `text`, skipping over
/// nested brackets, strings, and comments.
pub fn find_end_of_expression(text: &str, end_op: &str) -> Option<usize> {
    let mut tokenizer = Tokenizer::new(text);
    let mut depth = 0usize;
    loop {
        let token = tokenizer.next_token();
        match token.kind {
            TokenKind::End
            | TokenKind::ErrorEOTInBlockComment
            | TokenKind::ErrorEOTInString => return None,
            TokenKind::Operator => {
                if depth == 0 && token.value == end_op {
                    return Some(token.offset);
                }
                match token.value.as_str() {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
            _ => {}
        }
    }
}
