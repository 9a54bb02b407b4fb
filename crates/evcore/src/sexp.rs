// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The atom-or-list debug tree every runtime entity renders to.
//!
//! This is the only external representational contract the core promises
//! (see the top-level purpose/scope note on the real S-expression I/O
//! library being out of scope): a minimal, dependency-free tree shape with
//! a compact machine form and an indented human form.

use std::fmt;

/// An atom-or-list symbolic tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

impl Sexp {
    pub fn atom(s: impl Into<String>) -> Self {
        Sexp::Atom(s.into())
    }

    pub fn list(items: Vec<Sexp>) -> Self {
        Sexp::List(items)
    }

    /// Tagged list: `(tag field1 field2 ...)`, the conventional shape for
    /// rendering a named record.
    pub fn tagged(tag: &str, fields: Vec<Sexp>) -> Self {
        let mut items = Vec::with_capacity(fields.len() + 1);
        items.push(Sexp::atom(tag));
        items.extend(fields);
        Sexp::List(items)
    }

    /// Whitespace-free machine form, e.g. `(fd(name"x")(state Open))`.
    pub fn to_compact_string(&self) -> String {
        let mut out = String::new();
        self.write_compact(&mut out);
        out
    }

    fn write_compact(&self, out: &mut String) {
        match self {
            Sexp::Atom(a) => {
                if needs_quoting(a) {
                    out.push('"');
                    out.push_str(&a.replace('\\', "\\\\").replace('"', "\\\""));
                    out.push('"');
                } else {
                    out.push_str(a);
                }
            }
            Sexp::List(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    item.write_compact(out);
                }
                out.push(')');
            }
        }
    }

    /// Indented human form.
    pub fn to_pretty_string(&self, indent: usize) -> String {
        let mut out = String::new();
        self.write_pretty(&mut out, 0, indent);
        out
    }

    fn write_pretty(&self, out: &mut String, depth: usize, indent: usize) {
        match self {
            Sexp::Atom(_) => self.write_compact(out),
            Sexp::List(items) if items.iter().all(|i| matches!(i, Sexp::Atom(_))) => {
                self.write_compact(out);
            }
            Sexp::List(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push('\n');
                        out.push_str(&" ".repeat((depth + 1) * indent));
                    }
                    item.write_pretty(out, depth + 1, indent);
                }
                out.push(')');
            }
        }
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '(' || c == ')' || c == '"')
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_compact_string())
    }
}

/// Implemented by every runtime entity that has a structured debug form.
pub trait ToSexp {
    fn to_sexp(&self) -> Sexp;
}
