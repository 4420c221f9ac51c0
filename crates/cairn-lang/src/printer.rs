use std::fmt::{self, Write};

use crate::ast::{Directive, FileNode, Literal, Node, Pair, Reference};

const INDENT: &str = "    ";
const KEYWORDS: [&str; 7] = ["true", "false", "null", "and", "or", "end", "in"];

impl fmt::Display for Node {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_statement(formatter, self, 0)
    }
}

impl fmt::Display for FileNode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.body {
            write_statement(formatter, node, 0)?;
        }
        Ok(())
    }
}

fn write_statement(out: &mut impl Write, node: &Node, depth: usize) -> fmt::Result {
    let indent = INDENT.repeat(depth);
    match node {
        Node::Pair(pair) => {
            write!(out, "{indent}")?;
            write_key(out, &pair.key)?;
            out.write_str(": ")?;
            write_expression(out, &pair.value)?;
            out.write_char('\n')
        }
        Node::Resource(block) => {
            write!(out, "{indent}{} ", block.type_name)?;
            write_bare_or_expression(out, &block.name)?;
            out.write_char('\n')?;
            write_body(out, &block.body, depth + 1)?;
            writeln!(out, "{indent}end")
        }
        Node::KeyBlock(block) => {
            writeln!(out, "{indent}{}", block.key)?;
            write_body(out, &block.body, depth + 1)?;
            writeln!(out, "{indent}end")
        }
        Node::Directive(directive) => write_directive(out, directive, depth),
        expression => {
            write!(out, "{indent}")?;
            write_expression(out, expression)
        }
    }
}

fn write_body(out: &mut impl Write, body: &[Node], depth: usize) -> fmt::Result {
    for node in body {
        write_statement(out, node, depth)?;
    }
    Ok(())
}

fn write_directive(out: &mut impl Write, directive: &Directive, depth: usize) -> fmt::Result {
    let indent = INDENT.repeat(depth);
    write!(out, "{indent}@{}", directive.name)?;
    if directive.bodyless {
        out.write_char(':')?;
    }
    write_arguments(out, &directive.arguments)?;
    for option in &directive.options {
        write!(out, " -{}", option.name)?;
        write_arguments(out, &option.arguments)?;
    }
    out.write_char('\n')?;
    if directive.bodyless {
        return Ok(());
    }

    write_body(out, &directive.body, depth + 1)?;
    for section in &directive.sections {
        write!(out, "{indent}@{}", section.name)?;
        if !section.arguments.is_empty() {
            out.write_str(" if")?;
            write_arguments(out, &section.arguments)?;
        }
        out.write_char('\n')?;
        write_body(out, &section.body, depth + 1)?;
    }
    writeln!(out, "{indent}@end")
}

fn write_arguments(out: &mut impl Write, arguments: &[Node]) -> fmt::Result {
    for (index, argument) in arguments.iter().enumerate() {
        out.write_str(if index == 0 { " " } else { ", " })?;
        write_bare_or_expression(out, argument)?;
    }
    Ok(())
}

/// Resource names and directive arguments print as bare words when they
/// would parse back to the same string.
fn write_bare_or_expression(out: &mut impl Write, node: &Node) -> fmt::Result {
    match node.as_string_literal() {
        Some(word) if is_bare_word(word) => out.write_str(word),
        _ => write_expression(out, node),
    }
}

fn write_expression(out: &mut impl Write, node: &Node) -> fmt::Result {
    match node {
        Node::Literal(literal) => write_literal(out, literal),
        Node::Interpolated(parts) => {
            out.write_char('"')?;
            for part in parts {
                match part {
                    Node::Literal(Literal::String(text)) => {
                        for ch in text.chars() {
                            match ch {
                                '"' | '\\' | '$' => write!(out, "\\{ch}")?,
                                '\n' => out.write_str("\\n")?,
                                '\t' => out.write_str("\\t")?,
                                other => out.write_char(other)?,
                            }
                        }
                    }
                    other => write_expression(out, other)?,
                }
            }
            out.write_char('"')
        }
        Node::List(items) => {
            out.write_char('[')?;
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.write_str(", ")?;
                }
                write_expression(out, item)?;
            }
            out.write_char(']')
        }
        Node::Map(entries) => write_map(out, entries),
        Node::Reference(reference) => write_reference(out, reference),
        Node::Binary(binary) => {
            let precedence = binary.op.precedence();
            write_operand(out, &binary.left, precedence, false)?;
            write!(out, " {} ", binary.op.symbol())?;
            write_operand(out, &binary.right, precedence, true)
        }
        Node::Pair(pair) => {
            write_key(out, &pair.key)?;
            out.write_str(": ")?;
            write_expression(out, &pair.value)
        }
        statement @ (Node::Resource(_) | Node::KeyBlock(_) | Node::Directive(_)) => {
            write_statement(out, statement, 0)
        }
    }
}

fn write_operand(out: &mut impl Write, node: &Node, parent: u8, right: bool) -> fmt::Result {
    let needs_parens = match node {
        Node::Binary(child) => {
            let own = child.op.precedence();
            own < parent || (right && own == parent)
        }
        _ => false,
    };
    if needs_parens {
        out.write_char('(')?;
        write_expression(out, node)?;
        out.write_char(')')
    } else {
        write_expression(out, node)
    }
}

fn write_map(out: &mut impl Write, entries: &[Pair]) -> fmt::Result {
    if entries.is_empty() {
        return out.write_str("{}");
    }
    out.write_str("{ ")?;
    for (index, entry) in entries.iter().enumerate() {
        if index > 0 {
            out.write_str(", ")?;
        }
        write_key(out, &entry.key)?;
        out.write_str(": ")?;
        write_expression(out, &entry.value)?;
    }
    out.write_str(" }")
}

fn write_reference(out: &mut impl Write, reference: &Reference) -> fmt::Result {
    match reference {
        Reference::Variable { path, .. } => write!(out, "$({})", path.join(".")),
        Reference::Resource {
            type_name,
            name,
            attribute,
            ..
        } => {
            write!(out, "$({type_name}")?;
            if let Some(name) = name {
                out.write_char(' ')?;
                write_bare_or_expression(out, name)?;
            }
            if !attribute.is_empty() {
                write!(out, " | {}", attribute.join("."))?;
            }
            out.write_char(')')
        }
    }
}

fn write_literal(out: &mut impl Write, literal: &Literal) -> fmt::Result {
    match literal {
        Literal::Null => out.write_str("null"),
        Literal::Bool(value) => write!(out, "{value}"),
        Literal::Number(value) => {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                write!(out, "{value:.0}")
            } else {
                write!(out, "{value}")
            }
        }
        Literal::String(value) => write_quoted(out, value),
    }
}

fn write_quoted(out: &mut impl Write, value: &str) -> fmt::Result {
    out.write_char('\'')?;
    for ch in value.chars() {
        match ch {
            '\'' | '\\' => write!(out, "\\{ch}")?,
            '\n' => out.write_str("\\n")?,
            '\t' => out.write_str("\\t")?,
            other => out.write_char(other)?,
        }
    }
    out.write_char('\'')
}

fn write_key(out: &mut impl Write, key: &str) -> fmt::Result {
    let plain = key
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        && is_bare_word(key);
    if plain {
        out.write_str(key)
    } else {
        write_quoted(out, key)
    }
}

fn is_bare_word(word: &str) -> bool {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/' | '*'))
        && !KEYWORDS.contains(&word)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::path::Path;

    use crate::ast::{FileNode, Node, Reference, Span};
    use crate::parser::parse;

    fn normalize(nodes: &mut [Node]) {
        for node in nodes {
            normalize_node(node);
        }
    }

    fn normalize_node(node: &mut Node) {
        match node {
            Node::Pair(pair) => {
                pair.span = Span::synthetic();
                normalize_node(&mut pair.value);
            }
            Node::Resource(block) => {
                block.span = Span::synthetic();
                normalize_node(&mut block.name);
                normalize(&mut block.body);
            }
            Node::KeyBlock(block) => {
                block.span = Span::synthetic();
                normalize(&mut block.body);
            }
            Node::Directive(directive) => {
                directive.span = Span::synthetic();
                normalize(&mut directive.arguments);
                normalize(&mut directive.body);
                for option in &mut directive.options {
                    normalize(&mut option.arguments);
                }
                for section in &mut directive.sections {
                    section.span = Span::synthetic();
                    normalize(&mut section.arguments);
                    normalize(&mut section.body);
                }
            }
            Node::Reference(Reference::Variable { span, .. }) => *span = Span::synthetic(),
            Node::Reference(Reference::Resource { span, name, .. }) => {
                *span = Span::synthetic();
                if let Some(name) = name {
                    normalize_node(name);
                }
            }
            Node::Interpolated(items) | Node::List(items) => normalize(items),
            Node::Map(entries) => {
                for entry in entries {
                    entry.span = Span::synthetic();
                    normalize_node(&mut entry.value);
                }
            }
            Node::Binary(binary) => {
                normalize_node(&mut binary.left);
                normalize_node(&mut binary.right);
            }
            Node::Literal(_) => {}
        }
    }

    fn parse_normalized(source: &str) -> FileNode {
        let mut file = parse(source, Path::new("a.cairn")).expect("source parses");
        normalize(&mut file.body);
        file
    }

    fn round_trip(source: &str) -> String {
        let first = parse_normalized(source);
        let printed = first.to_string();
        let second = parse_normalized(&printed);
        assert_eq!(first, second, "printed form:\n{printed}");
        printed
    }

    #[test]
    fn prints_resource_in_canonical_form() {
        let printed = round_trip(
            "local::file index\n  path: '/tmp/it\\'s.html'\n  mode: 420\n  tags\n    team: \"web-$(team)\"\n  end\n  @uses-credentials: 'ops'\nend\n",
        );
        assert_eq!(
            printed,
            "local::file index\n    path: '/tmp/it\\'s.html'\n    mode: 420\n    tags\n        team: \"web-$(team)\"\n    end\n    @uses-credentials: ops\nend\n"
        );
    }

    #[test]
    fn prints_directives_with_sections_and_options() {
        let printed = round_trip(
            "@if $(a) and ($(b) or $(c))\n  x: 1\n@else if $(d)\n  x: 2\n@else\n  x: 3\n@end\n@extends: $(base) -exclude [name, 'type']\n",
        );
        assert!(printed.contains("@if $(a) and ($(b) or $(c))\n"));
        assert!(printed.contains("@else if $(d)\n"));
        assert!(printed.contains("@extends: $(base) -exclude ['name', 'type']\n"));
    }

    #[test]
    fn nested_loops_maps_and_references_survive_round_trip() {
        round_trip(
            "@for name, size -in ['a', 1.5, 'b']\n  local::file $(name)\n    path: \"/tmp/$(name)\\n\"\n    content: $(local::file seed | content)\n    meta: { 'odd key': [1, -2, null, true], nested: {} }\n    total: 1 - (2 - 3)\n  end\n@end\n",
        );
    }
}
