use std::path::Path;
use std::sync::Arc;

use crate::ast::{
    Binary, BinaryOp, Directive, DirectiveOption, DirectiveSection, FileNode, KeyBlock, Literal,
    Node, Pair, Reference, ResourceBlock, Span,
};
use crate::error::ParseError;

type ParseResult<T> = std::result::Result<T, ParseError>;

/// Parse one configuration or state file.
///
/// # Errors
///
/// Returns the first syntax error with its line and column.
pub fn parse(input: &str, path: &Path) -> ParseResult<FileNode> {
    let mut parser = Parser {
        input,
        pos: 0,
        file: Arc::from(path.display().to_string()),
    };
    let (body, end) = parser.parse_body(false)?;
    if let BodyEnd::End | BodyEnd::Else = end {
        return Err(parser.error("`end` without a matching block"));
    }
    Ok(FileNode {
        path: path.to_path_buf(),
        body,
    })
}

enum BodyEnd {
    Eof,
    End,
    Else,
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    file: Arc<str>,
}

const fn is_word_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/' | '*')
}

impl<'a> Parser<'a> {
    // ── Helpers ──────────────────────────────────────────────────────

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.remaining().chars().nth(1)
    }

    fn advance(&mut self, bytes: usize) {
        self.pos += bytes;
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.remaining().starts_with(prefix)
    }

    /// `keyword` followed by something that cannot continue a word.
    fn starts_with_keyword(&self, keyword: &str) -> bool {
        self.starts_with(keyword)
            && !self.remaining()[keyword.len()..]
                .chars()
                .next()
                .is_some_and(|ch| is_word_char(ch) || ch == ':')
    }

    fn eat_char(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance(ch.len_utf8());
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, ch: char) -> ParseResult<()> {
        if self.eat_char(ch) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{ch}`")))
        }
    }

    fn span(&self) -> Span {
        let consumed = &self.input[..self.pos];
        let line = consumed.matches('\n').count() + 1;
        let line_start = consumed.rfind('\n').map_or(0, |index| index + 1);
        let column = consumed[line_start..].chars().count() + 1;
        Span {
            file: Arc::clone(&self.file),
            line,
            column,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let span = self.span();
        ParseError {
            file: span.file,
            line: span.line,
            column: span.column,
            message: message.into(),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some('\n') => self.error(format!("expected {expected}, found end of line")),
            Some(ch) => self.error(format!("expected {expected}, found `{ch}`")),
            None => self.error(format!("expected {expected}, found end of file")),
        }
    }

    fn read_word(&mut self) -> Option<&'a str> {
        let remaining = self.remaining();
        let len = remaining
            .char_indices()
            .find(|(_, ch)| !is_word_char(*ch))
            .map_or(remaining.len(), |(index, _)| index);
        if len == 0 {
            return None;
        }
        self.advance(len);
        Some(&remaining[..len])
    }

    fn expect_word(&mut self, what: &str) -> ParseResult<&'a str> {
        self.read_word().ok_or_else(|| self.unexpected(what))
    }

    // ── Whitespace & comments ───────────────────────────────────────

    /// Skip spaces and comments without crossing a line break.
    fn skip_inline(&mut self) {
        while let Some(ch) = self.peek() {
            match ch {
                ' ' | '\t' | '\r' => self.advance(1),
                '#' => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance(ch.len_utf8());
                    }
                }
                _ => break,
            }
        }
    }

    fn skip_ws(&mut self) {
        loop {
            self.skip_inline();
            if !self.eat_char('\n') {
                break;
            }
        }
    }

    fn at_line_end(&mut self) -> bool {
        self.skip_inline();
        matches!(self.peek(), None | Some('\n'))
    }

    fn expect_line_end(&mut self) -> ParseResult<()> {
        if self.at_line_end() {
            let _ = self.eat_char('\n');
            Ok(())
        } else {
            Err(self.unexpected("end of line"))
        }
    }

    // ── Statements ──────────────────────────────────────────────────

    fn parse_body(&mut self, allow_else: bool) -> ParseResult<(Vec<Node>, BodyEnd)> {
        let mut body = Vec::new();
        loop {
            self.skip_ws();
            if self.peek().is_none() {
                return Ok((body, BodyEnd::Eof));
            }
            if self.starts_with_keyword("@end") {
                self.advance(4);
                self.expect_line_end()?;
                return Ok((body, BodyEnd::End));
            }
            if self.starts_with_keyword("end") {
                self.advance(3);
                self.expect_line_end()?;
                return Ok((body, BodyEnd::End));
            }
            if self.starts_with_keyword("@else") {
                if !allow_else {
                    return Err(self.error("`@else` outside of an `@if` block"));
                }
                self.advance(5);
                return Ok((body, BodyEnd::Else));
            }
            body.push(self.parse_statement()?);
        }
    }

    fn parse_block_body(&mut self, what: &str) -> ParseResult<Vec<Node>> {
        match self.parse_body(false)? {
            (body, BodyEnd::End) => Ok(body),
            (_, BodyEnd::Eof | BodyEnd::Else) => Err(self.error(format!("unterminated {what}"))),
        }
    }

    fn parse_statement(&mut self) -> ParseResult<Node> {
        let span = self.span();
        match self.peek() {
            Some('@') => self.parse_directive(span),
            Some('\'' | '"') => {
                let key = self.parse_string_key()?;
                self.skip_inline();
                self.expect_char(':')?;
                self.parse_pair_value(key, span)
            }
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => {
                let head = self.expect_word("a key or resource type")?;
                if self.starts_with("::") {
                    self.advance(2);
                    let kind = self.expect_word("a resource kind")?;
                    return self.parse_resource(format!("{head}::{kind}"), span);
                }
                self.skip_inline();
                if self.eat_char(':') {
                    return self.parse_pair_value(head.to_string(), span);
                }
                self.expect_line_end()?;
                let body = self.parse_block_body(&format!("block `{head}`"))?;
                Ok(Node::KeyBlock(KeyBlock {
                    key: head.to_string(),
                    body,
                    span,
                }))
            }
            _ => Err(self.unexpected("a statement")),
        }
    }

    fn parse_pair_value(&mut self, key: String, span: Span) -> ParseResult<Node> {
        self.skip_inline();
        let value = self.parse_expression()?;
        self.expect_line_end()?;
        Ok(Node::Pair(Box::new(Pair { key, value, span })))
    }

    fn parse_resource(&mut self, type_name: String, span: Span) -> ParseResult<Node> {
        self.skip_inline();
        if self.at_line_end() {
            return Err(self.error(format!("resource `{type_name}` needs a name")));
        }
        let name = self.parse_primary()?;
        self.expect_line_end()?;
        let body = self.parse_block_body(&format!("resource `{type_name}`"))?;
        Ok(Node::Resource(ResourceBlock {
            type_name,
            name: Box::new(name),
            body,
            span,
        }))
    }

    fn parse_directive(&mut self, span: Span) -> ParseResult<Node> {
        self.expect_char('@')?;
        let name = self.expect_word("a directive name")?.to_string();
        let bodyless = self.eat_char(':');
        let (arguments, options) = self.parse_directive_arguments()?;
        self.expect_line_end()?;

        let mut directive = Directive {
            name,
            arguments,
            options,
            bodyless,
            body: Vec::new(),
            sections: Vec::new(),
            span,
        };
        if bodyless {
            return Ok(Node::Directive(directive));
        }

        let allow_else = directive.name == "if";
        let (body, mut end) = self.parse_body(allow_else)?;
        directive.body = body;
        while let BodyEnd::Else = end {
            let section_span = self.span();
            self.skip_inline();
            let arguments = if self.starts_with_keyword("if") {
                self.advance(2);
                self.parse_directive_arguments()?.0
            } else {
                Vec::new()
            };
            self.expect_line_end()?;
            let (body, next) = self.parse_body(true)?;
            directive.sections.push(DirectiveSection {
                name: "else".to_string(),
                arguments,
                body,
                span: section_span,
            });
            end = next;
        }
        if let BodyEnd::Eof = end {
            return Err(self.error(format!("unterminated directive `@{}`", directive.name)));
        }
        Ok(Node::Directive(directive))
    }

    fn parse_directive_arguments(&mut self) -> ParseResult<(Vec<Node>, Vec<DirectiveOption>)> {
        let mut arguments = Vec::new();
        let mut options: Vec<DirectiveOption> = Vec::new();
        loop {
            if self.at_line_end() {
                break;
            }

            let option_name = if self.peek() == Some('-')
                && self.peek_second().is_some_and(|ch| ch.is_ascii_alphabetic())
            {
                self.advance(1);
                Some(self.expect_word("an option name")?.to_string())
            } else if self.starts_with_keyword("in") {
                self.advance(2);
                Some("in".to_string())
            } else {
                None
            };
            if let Some(name) = option_name {
                options.push(DirectiveOption {
                    name,
                    arguments: Vec::new(),
                });
                continue;
            }

            let value = self.parse_expression()?;
            match options.last_mut() {
                Some(option) => option.arguments.push(value),
                None => arguments.push(value),
            }
            self.skip_inline();
            let _ = self.eat_char(',');
        }
        Ok((arguments, options))
    }

    // ── Expressions ─────────────────────────────────────────────────

    fn parse_expression(&mut self) -> ParseResult<Node> {
        self.parse_binary(1)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> ParseResult<Node> {
        let mut left = self.parse_primary()?;
        loop {
            let saved = self.pos;
            self.skip_inline();
            let Some((op, len)) = self.peek_operator() else {
                self.pos = saved;
                break;
            };
            if op.precedence() < min_precedence {
                self.pos = saved;
                break;
            }
            self.advance(len);
            self.skip_ws();
            let right = self.parse_binary(op.precedence() + 1)?;
            left = Node::Binary(Box::new(Binary { op, left, right }));
        }
        Ok(left)
    }

    fn peek_operator(&self) -> Option<(BinaryOp, usize)> {
        const SYMBOLS: [(&str, BinaryOp); 6] = [
            ("==", BinaryOp::Eq),
            ("!=", BinaryOp::Ne),
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
        ];
        for (symbol, op) in SYMBOLS {
            if self.starts_with(symbol) {
                return Some((op, symbol.len()));
            }
        }
        if self.starts_with_keyword("and") {
            return Some((BinaryOp::And, 3));
        }
        if self.starts_with_keyword("or") {
            return Some((BinaryOp::Or, 2));
        }
        let op = match self.peek()? {
            '+' => BinaryOp::Add,
            '*' => BinaryOp::Mul,
            '/' => BinaryOp::Div,
            // `-name` starts a directive option, not a subtraction.
            '-' if !self.peek_second().is_some_and(|ch| ch.is_ascii_alphabetic()) => {
                BinaryOp::Sub
            }
            _ => return None,
        };
        Some((op, 1))
    }

    fn parse_primary(&mut self) -> ParseResult<Node> {
        match self.peek() {
            Some('\'') => Ok(Node::string(self.parse_single_quoted()?)),
            Some('"') => self.parse_double_quoted(),
            Some('$') if self.peek_second() == Some('(') => {
                Ok(Node::Reference(self.parse_reference()?))
            }
            Some('[') => self.parse_list(),
            Some('{') => self.parse_map(),
            Some('(') => {
                self.advance(1);
                self.skip_ws();
                let inner = self.parse_expression()?;
                self.skip_ws();
                self.expect_char(')')?;
                Ok(inner)
            }
            Some(ch)
                if ch.is_ascii_digit()
                    || (ch == '-' && self.peek_second().is_some_and(|next| next.is_ascii_digit())) =>
            {
                self.parse_number()
            }
            Some(ch) if is_word_char(ch) => {
                let word = self.expect_word("a value")?;
                Ok(Node::Literal(match word {
                    "true" => Literal::Bool(true),
                    "false" => Literal::Bool(false),
                    "null" => Literal::Null,
                    other => Literal::String(other.to_string()),
                }))
            }
            _ => Err(self.unexpected("a value")),
        }
    }

    fn parse_number(&mut self) -> ParseResult<Node> {
        let start = self.pos;
        let _ = self.eat_char('-');
        while self.peek().is_some_and(|ch| ch.is_ascii_digit()) {
            self.advance(1);
        }
        if self.peek() == Some('.') && self.peek_second().is_some_and(|ch| ch.is_ascii_digit()) {
            self.advance(1);
            while self.peek().is_some_and(|ch| ch.is_ascii_digit()) {
                self.advance(1);
            }
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map(|value| Node::Literal(Literal::Number(value)))
            .map_err(|_| self.error(format!("invalid number `{text}`")))
    }

    fn parse_list(&mut self) -> ParseResult<Node> {
        self.expect_char('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat_char(']') {
                return Ok(Node::List(items));
            }
            items.push(self.parse_expression()?);
            self.skip_ws();
            if !self.eat_char(',') && self.peek() != Some(']') {
                return Err(self.unexpected("`,` or `]`"));
            }
        }
    }

    fn parse_map(&mut self) -> ParseResult<Node> {
        self.expect_char('{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.eat_char('}') {
                return Ok(Node::Map(entries));
            }
            let span = self.span();
            let key = match self.peek() {
                Some('\'' | '"') => self.parse_string_key()?,
                _ => self.expect_word("a map key")?.to_string(),
            };
            self.skip_inline();
            self.expect_char(':')?;
            self.skip_ws();
            let value = self.parse_expression()?;
            entries.push(Pair { key, value, span });
            self.skip_ws();
            if !self.eat_char(',') && self.peek() != Some('}') {
                return Err(self.unexpected("`,` or `}`"));
            }
        }
    }

    fn parse_string_key(&mut self) -> ParseResult<String> {
        match self.parse_primary()? {
            Node::Literal(Literal::String(key)) => Ok(key),
            _ => Err(self.error("keys cannot be interpolated")),
        }
    }

    fn parse_single_quoted(&mut self) -> ParseResult<String> {
        self.expect_char('\'')?;
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some('\'') => {
                    self.advance(1);
                    return Ok(value);
                }
                Some('\\') => {
                    self.advance(1);
                    value.push(self.parse_escape(&['\''])?);
                }
                Some(ch) => {
                    value.push(ch);
                    self.advance(ch.len_utf8());
                }
            }
        }
    }

    fn parse_double_quoted(&mut self) -> ParseResult<Node> {
        self.expect_char('"')?;
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some('"') => {
                    self.advance(1);
                    break;
                }
                Some('\\') => {
                    self.advance(1);
                    text.push(self.parse_escape(&['"', '$'])?);
                }
                Some('$') if self.peek_second() == Some('(') => {
                    if !text.is_empty() {
                        parts.push(Node::string(std::mem::take(&mut text)));
                    }
                    parts.push(Node::Reference(self.parse_reference()?));
                }
                Some(ch) => {
                    text.push(ch);
                    self.advance(ch.len_utf8());
                }
            }
        }

        if parts.is_empty() {
            return Ok(Node::string(text));
        }
        if !text.is_empty() {
            parts.push(Node::string(text));
        }
        Ok(Node::Interpolated(parts))
    }

    fn parse_escape(&mut self, quotes: &[char]) -> ParseResult<char> {
        let Some(ch) = self.peek() else {
            return Err(self.error("unterminated escape"));
        };
        self.advance(ch.len_utf8());
        match ch {
            'n' => Ok('\n'),
            't' => Ok('\t'),
            '\\' => Ok('\\'),
            quote if quotes.contains(&quote) => Ok(quote),
            other => Err(self.error(format!("unknown escape `\\{other}`"))),
        }
    }

    fn parse_reference(&mut self) -> ParseResult<Reference> {
        let span = self.span();
        self.advance(2);
        self.skip_inline();
        let head = self.expect_word("a reference")?;

        if !self.starts_with("::") {
            self.skip_inline();
            self.expect_char(')')?;
            return Ok(Reference::Variable {
                path: head.split('.').map(str::to_string).collect(),
                span,
            });
        }

        self.advance(2);
        let kind = self.expect_word("a resource kind")?;
        self.skip_inline();
        let name = match self.peek() {
            Some(')' | '|') => None,
            _ => Some(Box::new(self.parse_primary()?)),
        };
        self.skip_inline();
        let attribute = if self.eat_char('|') {
            self.skip_inline();
            self.expect_word("an attribute name")?
                .split('.')
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        self.skip_inline();
        self.expect_char(')')?;
        Ok(Reference::Resource {
            type_name: format!("{head}::{kind}"),
            name,
            attribute,
            span,
        })
    }
}
