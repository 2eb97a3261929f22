//! Syntax tree nodes and lvalue rewriting.
//!
//! The parser builds one [`Node`] per declaration and the compiler emits it
//! immediately. Assignment targets are parsed as ordinary expressions first;
//! [`to_lvalue`] rewrites them into their target form once the `=` shows up.

use glua_core::{GluaError, Value};

/// One grammar production. Statement and expression forms share the enum;
/// the parser guarantees they only appear where they are valid.
#[derive(Debug, Clone)]
pub enum Node {
    // Declarations and statements
    FunctionDecl {
        name: String,
        parameters: Vec<String>,
        body: Vec<Node>,
        line: u32,
    },
    GlobalDecl {
        names: Vec<String>,
        values: Vec<Node>,
        line: u32,
    },
    LocalDecl {
        names: Vec<String>,
        values: Vec<Node>,
        line: u32,
    },
    MultipleAssignment {
        targets: Vec<Node>,
        values: Vec<Node>,
        line: u32,
    },
    Assert {
        value: Box<Node>,
        line: u32,
    },
    While {
        condition: Box<Node>,
        body: Vec<Node>,
        line: u32,
    },
    For {
        variable: String,
        values: Vec<Node>,
        body: Vec<Node>,
        line: u32,
    },
    If {
        condition: Box<Node>,
        then_branch: Vec<Node>,
        else_branch: Option<Vec<Node>>,
        line: u32,
    },
    Block {
        statements: Vec<Node>,
        line: u32,
    },
    Return {
        values: Vec<Node>,
        line: u32,
    },
    ExpressionStmt {
        expression: Box<Node>,
        line: u32,
    },

    // Expressions
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
        line: u32,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
        line: u32,
    },
    Call {
        callee: Box<Node>,
        arguments: Vec<Node>,
        /// True when the VM should expand every returned value instead of
        /// keeping only the first.
        is_assignment: bool,
        line: u32,
    },
    TableAccess {
        table: Box<Node>,
        key: Box<Node>,
        line: u32,
    },
    TableLiteral {
        entries: Vec<TableEntry>,
        line: u32,
    },
    Variable {
        name: String,
        line: u32,
    },
    Literal {
        value: Value,
        line: u32,
    },

    // Assignment forms produced by `to_lvalue`; their values come from the
    // VM's assign cursor, so they carry no value expression.
    VariableAssignment {
        name: String,
        line: u32,
    },
    TableAssignment {
        table: Box<Node>,
        key: Box<Node>,
        line: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Equals,
    NotEquals,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

/// A single entry of a table literal.
#[derive(Debug, Clone)]
pub enum TableEntry {
    /// `[k] = v` or `name = v`.
    Pair { key: Node, value: Node },
    /// A bare expression, stored at the next integer key.
    Positional(Node),
}

impl Node {
    /// The source line this node started on.
    pub fn line(&self) -> u32 {
        match self {
            Node::FunctionDecl { line, .. }
            | Node::GlobalDecl { line, .. }
            | Node::LocalDecl { line, .. }
            | Node::MultipleAssignment { line, .. }
            | Node::Assert { line, .. }
            | Node::While { line, .. }
            | Node::For { line, .. }
            | Node::If { line, .. }
            | Node::Block { line, .. }
            | Node::Return { line, .. }
            | Node::ExpressionStmt { line, .. }
            | Node::Binary { line, .. }
            | Node::Unary { line, .. }
            | Node::Call { line, .. }
            | Node::TableAccess { line, .. }
            | Node::TableLiteral { line, .. }
            | Node::Variable { line, .. }
            | Node::Literal { line, .. }
            | Node::VariableAssignment { line, .. }
            | Node::TableAssignment { line, .. } => *line,
        }
    }
}

/// Rewrite an expression into its assignment-target form.
///
/// Only bare variables and table accessors are legal targets; anything else
/// is a compile error attributed to the node's own line.
pub fn to_lvalue(node: Node) -> Result<Node, GluaError> {
    match node {
        Node::Variable { name, line } => Ok(Node::VariableAssignment { name, line }),
        Node::TableAccess { table, key, line } => Ok(Node::TableAssignment { table, key, line }),
        other => Err(GluaError::compile(
            "Invalid assignment target",
            other.line(),
        )),
    }
}

/// Mark a right-hand-side expression so calls expand their full return
/// sequence. Only outermost calls are affected; a call nested inside an
/// arithmetic expression still yields a single value.
pub fn expand_calls(node: Node) -> Node {
    match node {
        Node::Call {
            callee,
            arguments,
            line,
            ..
        } => Node::Call {
            callee,
            arguments,
            is_assignment: true,
            line,
        },
        other => other,
    }
}

/// Render the tree as an indented dump for the `PRINT_AST` flag.
pub fn dump(node: &Node) -> String {
    let mut out = String::new();
    dump_into(node, 0, &mut out);
    out
}

fn indent_line(out: &mut String, indent: usize, text: &str) {
    for _ in 0..indent {
        out.push_str("  ");
    }
    out.push_str(text);
    out.push('\n');
}

fn dump_into(node: &Node, indent: usize, out: &mut String) {
    match node {
        Node::FunctionDecl {
            name,
            parameters,
            body,
            ..
        } => {
            indent_line(out, indent, &format!("Function {name}"));
            indent_line(out, indent + 1, &format!("Parameters {parameters:?}"));
            indent_line(out, indent + 1, "Body");
            for statement in body {
                dump_into(statement, indent + 2, out);
            }
        }
        Node::GlobalDecl { names, values, .. } => {
            indent_line(out, indent, &format!("Global {names:?}"));
            for value in values {
                dump_into(value, indent + 1, out);
            }
        }
        Node::LocalDecl { names, values, .. } => {
            indent_line(out, indent, &format!("Local {names:?}"));
            for value in values {
                dump_into(value, indent + 1, out);
            }
        }
        Node::MultipleAssignment {
            targets, values, ..
        } => {
            indent_line(out, indent, "Assign");
            for target in targets {
                dump_into(target, indent + 1, out);
            }
            indent_line(out, indent + 1, "Values");
            for value in values {
                dump_into(value, indent + 2, out);
            }
        }
        Node::Assert { value, .. } => {
            indent_line(out, indent, "Assert");
            dump_into(value, indent + 1, out);
        }
        Node::While {
            condition, body, ..
        } => {
            indent_line(out, indent, "While");
            dump_into(condition, indent + 1, out);
            for statement in body {
                dump_into(statement, indent + 1, out);
            }
        }
        Node::For {
            variable,
            values,
            body,
            ..
        } => {
            indent_line(out, indent, &format!("For {variable}"));
            for value in values {
                dump_into(value, indent + 1, out);
            }
            indent_line(out, indent + 1, "Body");
            for statement in body {
                dump_into(statement, indent + 2, out);
            }
        }
        Node::If {
            condition,
            then_branch,
            else_branch,
            ..
        } => {
            indent_line(out, indent, "If");
            dump_into(condition, indent + 1, out);
            indent_line(out, indent + 1, "Then");
            for statement in then_branch {
                dump_into(statement, indent + 2, out);
            }
            if let Some(else_branch) = else_branch {
                indent_line(out, indent + 1, "Else");
                for statement in else_branch {
                    dump_into(statement, indent + 2, out);
                }
            }
        }
        Node::Block { statements, .. } => {
            indent_line(out, indent, "Block");
            for statement in statements {
                dump_into(statement, indent + 1, out);
            }
        }
        Node::Return { values, .. } => {
            indent_line(out, indent, "Return");
            for value in values {
                dump_into(value, indent + 1, out);
            }
        }
        Node::ExpressionStmt { expression, .. } => {
            indent_line(out, indent, "Expression");
            dump_into(expression, indent + 1, out);
        }
        Node::Binary { op, lhs, rhs, .. } => {
            indent_line(out, indent, &format!("{op:?}"));
            dump_into(lhs, indent + 1, out);
            dump_into(rhs, indent + 1, out);
        }
        Node::Unary { op, operand, .. } => {
            indent_line(out, indent, &format!("{op:?}"));
            dump_into(operand, indent + 1, out);
        }
        Node::Call {
            callee,
            arguments,
            is_assignment,
            ..
        } => {
            if *is_assignment {
                indent_line(out, indent, "Call (expanded)");
            } else {
                indent_line(out, indent, "Call");
            }
            dump_into(callee, indent + 1, out);
            if !arguments.is_empty() {
                indent_line(out, indent + 1, "Arguments");
                for argument in arguments {
                    dump_into(argument, indent + 2, out);
                }
            }
        }
        Node::TableAccess { table, key, .. } => {
            indent_line(out, indent, "TableGet");
            dump_into(table, indent + 1, out);
            dump_into(key, indent + 1, out);
        }
        Node::TableLiteral { entries, .. } => {
            indent_line(out, indent, "Table");
            for entry in entries {
                match entry {
                    TableEntry::Pair { key, value } => {
                        indent_line(out, indent + 1, "Pair");
                        dump_into(key, indent + 2, out);
                        dump_into(value, indent + 2, out);
                    }
                    TableEntry::Positional(value) => {
                        indent_line(out, indent + 1, "Value");
                        dump_into(value, indent + 2, out);
                    }
                }
            }
        }
        Node::Variable { name, .. } => indent_line(out, indent, &format!("Variable/{name}")),
        Node::Literal { value, .. } => indent_line(out, indent, &format!("Literal/{value}")),
        Node::VariableAssignment { name, .. } => {
            indent_line(out, indent, &format!("AssignTo/{name}"))
        }
        Node::TableAssignment { table, key, .. } => {
            indent_line(out, indent, "AssignTable");
            dump_into(table, indent + 1, out);
            dump_into(key, indent + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable(name: &str) -> Node {
        Node::Variable {
            name: name.to_string(),
            line: 1,
        }
    }

    #[test]
    fn test_variable_becomes_assignment_target() {
        let target = to_lvalue(variable("x")).unwrap();
        assert!(matches!(target, Node::VariableAssignment { ref name, .. } if name == "x"));
    }

    #[test]
    fn test_table_access_becomes_table_assignment() {
        let access = Node::TableAccess {
            table: Box::new(variable("t")),
            key: Box::new(Node::Literal {
                value: Value::string("k"),
                line: 1,
            }),
            line: 1,
        };
        let target = to_lvalue(access).unwrap();
        assert!(matches!(target, Node::TableAssignment { .. }));
    }

    #[test]
    fn test_literal_is_not_a_target() {
        let literal = Node::Literal {
            value: Value::Number(1.0),
            line: 7,
        };
        let err = to_lvalue(literal).unwrap_err();
        assert_eq!(err.line(), 7);
    }

    #[test]
    fn test_expand_calls_marks_only_calls() {
        let call = Node::Call {
            callee: Box::new(variable("f")),
            arguments: vec![],
            is_assignment: false,
            line: 1,
        };
        let expanded = expand_calls(call);
        assert!(matches!(
            expanded,
            Node::Call {
                is_assignment: true,
                ..
            }
        ));

        let untouched = expand_calls(variable("x"));
        assert!(matches!(untouched, Node::Variable { .. }));
    }
}
