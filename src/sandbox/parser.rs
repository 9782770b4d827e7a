//! Recursive-descent parser for the snippet language
//!
//! Nesting is bounded: every construct that deepens the tree counts
//! against `max_depth`, so a hostile snippet cannot exhaust the host stack
//! while being parsed, checked or evaluated.

use super::ast::*;
use super::lexer::{tokenize, Tok, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    Syntax { message: String, line: usize },
    TooDeep { line: usize, limit: usize },
}

type PResult<T> = Result<T, ParseError>;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Statements that parse in Python but have no meaning in a snippet
const UNSUPPORTED_STATEMENTS: &[&str] = &[
    "with", "try", "except", "finally", "raise", "return", "del", "assert", "yield", "async",
    "await",
];

/// Parse a snippet into a [`Program`]
pub fn parse(src: &str, max_depth: usize) -> PResult<Program> {
    let tokens = tokenize(src).map_err(|e| ParseError::Syntax {
        message: e.message,
        line: e.line,
    })?;
    let mut parser = Parser::new(tokens, max_depth, 0);
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

impl Parser {
    fn new(tokens: Vec<Token>, max_depth: usize, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
            max_depth,
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", op)))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", kw)))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(name) if !is_keyword(&name) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn syntax(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            message: message.into(),
            line: self.line(),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        self.syntax(format!("expected {}, found {}", expected, self.peek()))
    }

    fn descend(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ParseError::TooDeep {
                line: self.line(),
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth = self.depth.saturating_sub(levels);
    }

    // ---- statements ----

    fn program(&mut self) -> PResult<Program> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                Tok::Indent => return Err(self.syntax("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(Program { body })
    }

    /// One logical line may hold several `;`-separated simple statements
    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(name) => Some(name.clone()),
            _ => None,
        };

        let compound = match keyword.as_deref() {
            Some("if") => Some(self.if_statement()?),
            Some("for") => Some(self.for_statement()?),
            Some("while") => Some(self.while_statement()?),
            Some("def") => Some(self.skipped_definition(true)?),
            Some("class") => Some(self.skipped_definition(false)?),
            Some(kw @ ("elif" | "else")) => {
                return Err(self.syntax(format!("'{}' without a matching 'if'", kw)))
            }
            _ => None,
        };
        if let Some(kind) = compound {
            return Ok(vec![Stmt { kind, line }]);
        }

        let mut stmts = Vec::new();
        loop {
            let line = self.line();
            let kind = self.simple_statement()?;
            stmts.push(Stmt { kind, line });
            if self.eat_op(";") {
                if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
            }
            Tok::Eof | Tok::Dedent => {}
            _ => return Err(self.unexpected("end of line")),
        }
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> PResult<StmtKind> {
        if let Tok::Name(name) = self.peek().clone() {
            match name.as_str() {
                "pass" => {
                    self.pos += 1;
                    return Ok(StmtKind::Pass);
                }
                "break" => {
                    self.pos += 1;
                    return Ok(StmtKind::Break);
                }
                "continue" => {
                    self.pos += 1;
                    return Ok(StmtKind::Continue);
                }
                "import" => {
                    self.pos += 1;
                    return self.import_names();
                }
                "from" => {
                    self.pos += 1;
                    let module = self.dotted_name()?;
                    self.expect_keyword("import")?;
                    self.skip_to_line_end();
                    return Ok(StmtKind::Import {
                        modules: vec![module],
                    });
                }
                "global" | "nonlocal" => {
                    self.pos += 1;
                    let mut names = vec![self.expect_name()?];
                    while self.eat_op(",") {
                        names.push(self.expect_name()?);
                    }
                    return Ok(if name == "global" {
                        StmtKind::Global { names }
                    } else {
                        StmtKind::Nonlocal { names }
                    });
                }
                kw if UNSUPPORTED_STATEMENTS.contains(&kw) => {
                    return Err(self.syntax(format!("unsupported statement '{}'", kw)));
                }
                _ => {}
            }
        }
        self.expression_statement()
    }

    fn import_names(&mut self) -> PResult<StmtKind> {
        let mut modules = Vec::new();
        loop {
            modules.push(self.dotted_name()?);
            if self.eat_keyword("as") {
                self.expect_name()?;
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(StmtKind::Import { modules })
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = String::new();
        while self.eat_op(".") {
            name.push('.');
        }
        name.push_str(&self.expect_name()?);
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn skip_to_line_end(&mut self) {
        while !matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Op(";")) {
            self.pos += 1;
        }
    }

    fn expression_statement(&mut self) -> PResult<StmtKind> {
        let first = self.test_list()?;

        if self.at_op("=") {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat_op("=") {
                let next = self.test_list()?;
                if let Some(previous) = value.replace(next) {
                    targets.push(previous);
                }
            }
            for target in &targets {
                self.check_target(target)?;
            }
            return Ok(StmtKind::Assign {
                targets,
                value: value.ok_or_else(|| self.unexpected("an expression"))?,
            });
        }

        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            Tok::Op("**=") => Some(BinOp::Pow),
            Tok::Op(op @ ("&=" | "|=" | "^=" | "<<=" | ">>=" | ":=")) => {
                return Err(self.syntax(format!("unsupported operator '{}'", op)))
            }
            _ => None,
        };
        if let Some(op) = aug {
            self.pos += 1;
            if !matches!(
                first,
                Expr::Name(_) | Expr::Subscript { .. } | Expr::Attribute { .. }
            ) {
                return Err(self.syntax("illegal target for augmented assignment"));
            }
            let value = self.test_list()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }

        Ok(StmtKind::Expr(first))
    }

    fn check_target(&self, target: &Expr) -> PResult<()> {
        match target {
            Expr::Name(_) | Expr::Subscript { .. } | Expr::Attribute { .. } => Ok(()),
            Expr::Tuple(items) | Expr::List(items) => {
                items.iter().try_for_each(|item| self.check_target(item))
            }
            _ => Err(self.syntax("cannot assign to expression")),
        }
    }

    /// `:` followed by an indented block or a simple statement on the same line
    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.descend()?;

        let body = if matches!(self.peek(), Tok::Newline) {
            self.pos += 1;
            if !matches!(self.peek(), Tok::Indent) {
                return Err(self.syntax("expected an indented block"));
            }
            self.pos += 1;
            let mut body = Vec::new();
            loop {
                match self.peek() {
                    Tok::Dedent => {
                        self.pos += 1;
                        break;
                    }
                    Tok::Eof => break,
                    Tok::Newline => {
                        self.pos += 1;
                    }
                    _ => body.extend(self.statement()?),
                }
            }
            body
        } else {
            self.statement()?
        };

        self.ascend(1);
        Ok(body)
    }

    fn if_statement(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("if")?;
        let mut branches = Vec::new();
        let test = self.test()?;
        let body = self.block()?;
        branches.push((test, body));

        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let test = self.test()?;
                let body = self.block()?;
                branches.push((test, body));
            } else if self.eat_keyword("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn for_statement(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("for")?;
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.test_list()?;
        let body = self.block()?;
        if self.at_keyword("else") {
            return Err(self.syntax("'for ... else' is not supported"));
        }
        Ok(StmtKind::For { target, iter, body })
    }

    fn while_statement(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("while")?;
        let test = self.test()?;
        let body = self.block()?;
        if self.at_keyword("else") {
            return Err(self.syntax("'while ... else' is not supported"));
        }
        Ok(StmtKind::While { test, body })
    }

    /// `def`/`class` are recorded by name only; the body is skipped unparsed
    fn skipped_definition(&mut self, function: bool) -> PResult<StmtKind> {
        self.pos += 1;
        let name = match self.advance() {
            Tok::Name(name) => name,
            _ => return Err(self.unexpected("a name")),
        };

        let mut nesting = 0usize;
        loop {
            match self.advance() {
                Tok::Op("(" | "[" | "{") => nesting += 1,
                Tok::Op(")" | "]" | "}") => nesting = nesting.saturating_sub(1),
                Tok::Op(":") if nesting == 0 => break,
                Tok::Eof => return Err(self.syntax("unexpected end of input in definition")),
                _ => {}
            }
        }

        if matches!(self.peek(), Tok::Newline) {
            self.pos += 1;
            if matches!(self.peek(), Tok::Indent) {
                self.pos += 1;
                let mut indents = 1usize;
                while indents > 0 {
                    match self.advance() {
                        Tok::Indent => indents += 1,
                        Tok::Dedent => indents -= 1,
                        Tok::Eof => break,
                        _ => {}
                    }
                }
            }
        } else {
            while !matches!(self.peek(), Tok::Newline | Tok::Eof) {
                self.pos += 1;
            }
            if matches!(self.peek(), Tok::Newline) {
                self.pos += 1;
            }
        }

        Ok(if function {
            StmtKind::FunctionDef { name }
        } else {
            StmtKind::ClassDef { name }
        })
    }

    // ---- expressions ----

    /// Comma-separated tests; more than one (or a trailing comma) is a tuple
    fn test_list(&mut self) -> PResult<Expr> {
        let first = self.test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expression_end() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn at_expression_end(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Newline | Tok::Eof | Tok::Op("=" | ")" | "]" | "}" | ":" | ";")
        ) || matches!(self.peek(), Tok::Op(op) if op.ends_with('=') && *op != "==")
    }

    /// Loop and comprehension targets: names, subscripts, attributes, tuples
    fn target_list(&mut self) -> PResult<Expr> {
        let first = self.arith()?;
        let target = if self.at_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.at_keyword("in") {
                    break;
                }
                items.push(self.arith()?);
            }
            Expr::Tuple(items)
        } else {
            first
        };
        self.check_target(&target)?;
        Ok(target)
    }

    fn test(&mut self) -> PResult<Expr> {
        if self.at_keyword("lambda") {
            return self.lambda();
        }
        let body = self.or_test()?;
        if self.eat_keyword("if") {
            self.descend()?;
            let test = self.or_test()?;
            self.expect_keyword("else")?;
            let orelse = self.test()?;
            self.ascend(1);
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn lambda(&mut self) -> PResult<Expr> {
        self.expect_keyword("lambda")?;
        let mut params = Vec::new();
        while !self.at_op(":") {
            params.push(self.expect_name()?);
            if self.eat_op("=") {
                self.test()?;
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(":")?;
        self.descend()?;
        let body = self.test()?;
        self.ascend(1);
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let first = self.and_test()?;
        if !self.at_keyword("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("or") {
            values.push(self.and_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::Or,
            values,
        })
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let first = self.not_test()?;
        if !self.at_keyword("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("and") {
            values.push(self.not_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::And,
            values,
        })
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.eat_keyword("not") {
            self.descend()?;
            let operand = self.not_test()?;
            self.ascend(1);
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_next(), Tok::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                Tok::Name(n) if n == "not" && matches!(self.peek_next(), Tok::Name(m) if m == "in") => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                Tok::Op(op @ ("|" | "&" | "^" | "<<" | ">>" | "@")) => {
                    return Err(self.syntax(format!("unsupported operator '{}'", op)))
                }
                _ => break,
            };
            self.pos += 1;
            ops.push((op, self.arith()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn arith(&mut self) -> PResult<Expr> {
        let mut left = self.term()?;
        let mut chain = 0;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            chain += 1;
            let right = self.term()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        self.ascend(chain);
        Ok(left)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut left = self.factor()?;
        let mut chain = 0;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            chain += 1;
            let right = self.factor()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        self.ascend(chain);
        Ok(left)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            Tok::Op("~") => return Err(self.syntax("unsupported operator '~'")),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            self.descend()?;
            let operand = self.factor()?;
            self.ascend(1);
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.power()
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            self.descend()?;
            let exponent = self.factor()?;
            self.ascend(1);
            return Ok(Expr::Binary {
                left: Box::new(base),
                op: BinOp::Pow,
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        let mut chain = 0;
        loop {
            if self.eat_op(".") {
                self.descend()?;
                chain += 1;
                let attr = match self.advance() {
                    Tok::Name(name) => name,
                    _ => return Err(self.syntax("expected attribute name after '.'")),
                };
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else if self.eat_op("(") {
                self.descend()?;
                chain += 1;
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                self.descend()?;
                chain += 1;
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index,
                };
            } else {
                break;
            }
        }
        self.ascend(chain);
        Ok(expr)
    }

    fn call_arguments(&mut self) -> PResult<(Vec<Expr>, Vec<Keyword>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<Keyword> = Vec::new();

        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.syntax("argument unpacking is not supported"));
            }

            let is_keyword_arg = matches!(self.peek(), Tok::Name(_)) && matches!(self.peek_next(), Tok::Op("="));
            if is_keyword_arg {
                let name = match self.advance() {
                    Tok::Name(name) => name,
                    _ => return Err(self.unexpected("a keyword name")),
                };
                self.pos += 1;
                let value = self.test()?;
                if kwargs.iter().any(|k| k.name == name) {
                    return Err(self.syntax(format!("keyword argument repeated: {}", name)));
                }
                kwargs.push(Keyword { name, value });
            } else {
                if !kwargs.is_empty() {
                    return Err(self.syntax("positional argument follows keyword argument"));
                }
                let arg = self.test()?;
                if self.at_keyword("for") {
                    let generators = self.comprehension_clauses()?;
                    args.push(Expr::ListComp {
                        element: Box::new(arg),
                        generators,
                    });
                } else {
                    args.push(arg);
                }
            }

            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self) -> PResult<Index> {
        let lower = if self.at_op(":") {
            None
        } else {
            let expr = self.test()?;
            if !self.at_op(":") {
                if self.at_op(",") {
                    return Err(self.syntax("tuple indices are not supported"));
                }
                return Ok(Index::Single(Box::new(expr)));
            }
            Some(Box::new(expr))
        };

        self.expect_op(":")?;
        let upper = if self.at_op(":") || self.at_op("]") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        Ok(Index::Slice { lower, upper, step })
    }

    fn comprehension_clauses(&mut self) -> PResult<Vec<Generator>> {
        let mut generators = Vec::new();
        while self.eat_keyword("for") {
            self.descend()?;
            let target = self.target_list()?;
            self.expect_keyword("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_keyword("if") {
                conditions.push(self.or_test()?);
            }
            generators.push(Generator {
                target,
                iter,
                conditions,
            });
        }
        self.ascend(generators.len());
        Ok(generators)
    }

    fn atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Int(i) => {
                self.pos += 1;
                Ok(Expr::Const(Const::Int(i)))
            }
            Tok::Float(f) => {
                self.pos += 1;
                Ok(Expr::Const(Const::Float(f)))
            }
            Tok::Str(_) | Tok::FStr(_) => self.strings(line),
            Tok::Name(name) => {
                self.pos += 1;
                match name.as_str() {
                    "None" => Ok(Expr::Const(Const::None)),
                    "True" => Ok(Expr::Const(Const::Bool(true))),
                    "False" => Ok(Expr::Const(Const::Bool(false))),
                    kw if is_keyword(kw) => {
                        self.pos -= 1;
                        Err(self.syntax(format!("unexpected keyword '{}'", kw)))
                    }
                    _ => Ok(Expr::Name(name)),
                }
            }
            Tok::Op("(") => {
                self.pos += 1;
                self.descend()?;
                let expr = self.parenthesized()?;
                self.ascend(1);
                Ok(expr)
            }
            Tok::Op("[") => {
                self.pos += 1;
                self.descend()?;
                let expr = self.list_display()?;
                self.ascend(1);
                Ok(expr)
            }
            Tok::Op("{") => {
                self.pos += 1;
                self.descend()?;
                let expr = self.dict_display()?;
                self.ascend(1);
                Ok(expr)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parenthesized(&mut self) -> PResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.test()?;
        if self.at_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                generators,
            });
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(items))
    }

    fn list_display(&mut self) -> PResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.test()?;
        if self.at_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn dict_display(&mut self) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let key = self.test()?;
        if !self.eat_op(":") {
            return Err(self.syntax("set literals are not supported"));
        }
        let value = self.test()?;
        if self.at_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                generators,
            });
        }
        let mut entries = vec![(key, value)];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            if self.at_op("**") {
                return Err(self.syntax("dict unpacking is not supported"));
            }
            let key = self.test()?;
            self.expect_op(":")?;
            let value = self.test()?;
            entries.push((key, value));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(entries))
    }

    /// Adjacent literals concatenate; any f-string makes the whole run one
    fn strings(&mut self, line: usize) -> PResult<Expr> {
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut formatted = false;

        loop {
            match self.peek().clone() {
                Tok::Str(s) => {
                    self.pos += 1;
                    push_literal(&mut parts, &s);
                }
                Tok::FStr(body) => {
                    self.pos += 1;
                    formatted = true;
                    self.fstring_parts(&body, line, &mut parts)?;
                }
                _ => break,
            }
        }

        if formatted {
            return Ok(Expr::FString(parts));
        }
        let text = match parts.pop() {
            Some(FStringPart::Literal(text)) => text,
            _ => String::new(),
        };
        Ok(Expr::Const(Const::Str(text)))
    }

    fn fstring_parts(
        &mut self,
        body: &str,
        line: usize,
        parts: &mut Vec<FStringPart>,
    ) -> PResult<()> {
        let chars: Vec<char> = body.chars().collect();
        let mut literal = String::new();
        let mut i = 0;
        let fstring_error = |message: &str| ParseError::Syntax {
            message: format!("f-string: {}", message),
            line,
        };

        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    literal.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    literal.push('}');
                    i += 2;
                }
                '}' => return Err(fstring_error("single '}' is not allowed")),
                '{' => {
                    if !literal.is_empty() {
                        push_literal(parts, &std::mem::take(&mut literal));
                    }
                    i += 1;

                    let start = i;
                    let mut nesting = 0usize;
                    let mut quote: Option<char> = None;
                    let mut expr_end = None;
                    let mut conversion = None;
                    let mut spec_start = None;

                    while i < chars.len() {
                        let c = chars[i];
                        if let Some(q) = quote {
                            if c == q {
                                quote = None;
                            }
                        } else {
                            match c {
                                '\'' | '"' => quote = Some(c),
                                '(' | '[' | '{' => nesting += 1,
                                ')' | ']' => nesting = nesting.saturating_sub(1),
                                '}' if nesting > 0 => nesting -= 1,
                                '}' => break,
                                '!' if nesting == 0
                                    && expr_end.is_none()
                                    && chars.get(i + 1) != Some(&'=') =>
                                {
                                    expr_end = Some(i);
                                    conversion = chars.get(i + 1).copied();
                                    i += 1;
                                }
                                ':' if nesting == 0 && spec_start.is_none() => {
                                    expr_end.get_or_insert(i);
                                    spec_start = Some(i + 1);
                                }
                                _ => {}
                            }
                        }
                        i += 1;
                    }

                    if i >= chars.len() {
                        return Err(fstring_error("expecting '}'"));
                    }
                    let end = expr_end.unwrap_or(i);
                    let source: String = chars[start..end].iter().collect();
                    if source.trim().is_empty() {
                        return Err(fstring_error("empty expression not allowed"));
                    }
                    if let Some(c) = conversion {
                        if c != 'r' && c != 's' {
                            return Err(fstring_error("invalid conversion character"));
                        }
                    }
                    let spec = spec_start.map(|s| chars[s..i].iter().collect::<String>());

                    let value = self.sub_expression(source.trim(), line)?;
                    parts.push(FStringPart::Expr {
                        value: Box::new(value),
                        conversion,
                        spec,
                    });
                    i += 1;
                }
                c => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            push_literal(parts, &literal);
        }
        Ok(())
    }

    /// Parse an expression embedded in an f-string at the current depth
    fn sub_expression(&mut self, source: &str, line: usize) -> PResult<Expr> {
        let mut tokens = tokenize(source).map_err(|e| ParseError::Syntax {
            message: format!("f-string: {}", e.message),
            line,
        })?;
        for token in &mut tokens {
            token.line = line;
        }
        let mut inner = Parser::new(tokens, self.max_depth, self.depth + 1);
        if inner.depth > inner.max_depth {
            return Err(ParseError::TooDeep {
                line,
                limit: self.max_depth,
            });
        }
        let expr = inner.test_list()?;
        match inner.peek() {
            Tok::Newline | Tok::Eof => Ok(expr),
            _ => Err(inner.unexpected("'}'")),
        }
    }
}

fn push_literal(parts: &mut Vec<FStringPart>, text: &str) {
    if let Some(FStringPart::Literal(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(FStringPart::Literal(text.to_string()));
    }
}
