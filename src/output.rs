//! Rendering values for the REPL echo and diagnostics.

use crate::value::{
    double_is_na, Type, Value, INTEGER32_NA, INTEGER_NA, LOGICAL_FALSE, LOGICAL_TRUE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Typed scalars: `3L`, quoted strings.
    Riposte,
    /// R's plainer echo.
    R,
}

const MAX_PRINT: usize = 100;
const LINE_WIDTH: usize = 80;

fn logical_str(b: u8) -> String {
    match b {
        LOGICAL_TRUE => "TRUE".into(),
        LOGICAL_FALSE => "FALSE".into(),
        _ => "NA".into(),
    }
}

fn integer_str(x: i64, format: Format) -> String {
    if x == INTEGER_NA {
        "NA".into()
    } else if format == Format::Riposte {
        format!("{}L", x)
    } else {
        format!("{}", x)
    }
}

fn double_str(x: f64) -> String {
    if double_is_na(x) {
        "NA".into()
    } else {
        format!("{}", x)
    }
}

fn character_str(s: crate::intern::Symbol) -> String {
    if s == crate::intern::strings().na {
        "NA".into()
    } else {
        format!("{:?}", s.as_str())
    }
}

/// Wrapped, index-prefixed vector layout.
fn stringify_vector(elements: Vec<String>, ty: Type, truncated: bool) -> String {
    if elements.is_empty() {
        return format!("{}(0)", ty.name());
    }
    let maxlen = elements.iter().map(|e| e.len()).max().unwrap_or(1);
    let indexwidth = format!("[{}]", elements.len()).len();
    let perline = (LINE_WIDTH.saturating_sub(indexwidth) / (maxlen + 1)).max(1);

    let mut out = String::new();
    for (line, chunk) in elements.chunks(perline).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{:>width$}", format!("[{}]", line * perline + 1), width = indexwidth));
        for e in chunk {
            out.push_str(&format!(" {:>width$}", e, width = maxlen));
        }
    }
    if truncated {
        out.push_str(" ...");
    }
    out
}

pub fn stringify(v: Value, format: Format) -> String {
    let n = v.length() as usize;
    let shown = n.min(MAX_PRINT);
    let truncated = n > MAX_PRINT;
    match v.tag() {
        Type::Null => "NULL".into(),
        Type::Nil => "nil".into(),
        Type::Logical => stringify_vector(
            v.logical_slice()[..shown].iter().map(|&b| logical_str(b)).collect(),
            Type::Logical,
            truncated,
        ),
        Type::Raw => stringify_vector(
            v.logical_slice()[..shown]
                .iter()
                .map(|&b| format!("{:02x}", b))
                .collect(),
            Type::Raw,
            truncated,
        ),
        Type::Integer => stringify_vector(
            v.integer_slice()[..shown]
                .iter()
                .map(|&x| integer_str(x, format))
                .collect(),
            Type::Integer,
            truncated,
        ),
        Type::Integer32 | Type::Logical32 => stringify_vector(
            v.int32_slice()[..shown]
                .iter()
                .map(|&x| {
                    if x == INTEGER32_NA {
                        "NA".into()
                    } else {
                        format!("{}", x)
                    }
                })
                .collect(),
            v.tag(),
            truncated,
        ),
        Type::Double => stringify_vector(
            v.double_slice()[..shown].iter().map(|&x| double_str(x)).collect(),
            Type::Double,
            truncated,
        ),
        Type::Character => stringify_vector(
            v.character_slice()[..shown]
                .iter()
                .map(|&s| character_str(s))
                .collect(),
            Type::Character,
            truncated,
        ),
        Type::List => {
            let mut out = String::new();
            for (i, el) in v.list_slice()[..shown].iter().enumerate() {
                out.push_str(&format!("[[{}]]\n", i + 1));
                out.push_str(&stringify(*el, format));
                out.push('\n');
                if i + 1 < shown {
                    out.push('\n');
                }
            }
            if truncated {
                out.push_str(" ...\n");
            }
            out
        }
        Type::ScalarString => format!("`{}`", v.scalar_symbol().as_str()),
        Type::Pairlist => deparse(v),
        Type::Environment => "environment".into(),
        Type::Closure => "function".into(),
        Type::Promise => "promise".into(),
        Type::Externalptr => "externalptr".into(),
        Type::Future => "future".into(),
    }
}

/// A compact source-ish rendering, used for `__call__` bindings and stack
/// dumps.
pub fn deparse(v: Value) -> String {
    match v.tag() {
        Type::Nil | Type::Null => "NULL".into(),
        Type::ScalarString => v.scalar_symbol().as_str().to_string(),
        Type::Character if v.length() == 1 => format!("{:?}", v.character_slice()[0].as_str()),
        Type::Integer if v.length() == 1 => integer_str(v.scalar_integer(), Format::R),
        Type::Double if v.length() == 1 => double_str(v.scalar_double()),
        Type::Logical if v.length() == 1 => logical_str(v.scalar_logical()),
        Type::Pairlist => {
            let head = v.pairlist_inner();
            let mut out = deparse(head.car);
            out.push('(');
            let mut cell = head.cdr;
            let mut first = true;
            while cell.tag() == Type::Pairlist {
                let inner = cell.pairlist_inner();
                if !first {
                    out.push_str(", ");
                }
                if inner.tag.tag() == Type::ScalarString {
                    out.push_str(inner.tag.scalar_symbol().as_str());
                    out.push('=');
                }
                out.push_str(&deparse(inner.car));
                first = false;
                cell = inner.cdr;
            }
            out.push(')');
            out
        }
        Type::Closure => "function".into(),
        Type::Environment => "environment".into(),
        _ => format!("<{}[{}]>", v.tag().name(), v.length()),
    }
}
