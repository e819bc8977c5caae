//! Prints an AST back as source code.
//!
//! Binary and unary expressions are always parenthesized and simple statements
//! always end with `;`, so the output parses back into the same tree.

use std::io::Write;

use crate::ast::*;

const INDENT_WIDTH: usize = 4;

pub fn print_program_source(program: &Program) -> String {
    let mut buf = Vec::with_capacity(1024);
    print_program(&mut buf, program).unwrap();
    String::from_utf8(buf).unwrap()
}

pub fn print_program(w: &mut impl Write, program: &Program) -> std::io::Result<()> {
    for file in &program.files {
        if let Some(package) = &file.package {
            writeln!(w, "package {}", package.name)?;
        }
        if !file.imports.is_empty() {
            writeln!(w, "import (")?;
            for import in &file.imports {
                sp(w, 1)?;
                writeln!(w, "\"{import}\"")?;
            }
            writeln!(w, ")")?;
        }
        for stmt in &file.statements {
            print_stmt(w, 0, stmt)?;
        }
    }
    Ok(())
}

fn print_stmt(w: &mut impl Write, i: usize, stmt: &Stmt) -> std::io::Result<()> {
    sp(w, i)?;
    write_stmt(w, i, stmt, false)?;
    if needs_terminator(stmt) {
        write!(w, ";")?;
    }
    writeln!(w)
}

fn needs_terminator(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Expr(expr) => !matches!(expr.kind, ExprKind::While(_)),
        StmtKind::Let { .. }
        | StmtKind::VarDecl(_)
        | StmtKind::List(_)
        | StmtKind::Return(_)
        | StmtKind::Defer(_) => true,
        StmtKind::Function(_)
        | StmtKind::If(_)
        | StmtKind::For(_)
        | StmtKind::Block(_)
        | StmtKind::Struct(_) => false,
    }
}

/// Writes a statement without indentation or terminator. Inside `if`/`for`
/// headers `control` is set.
fn write_stmt(w: &mut impl Write, i: usize, stmt: &Stmt, control: bool) -> std::io::Result<()> {
    match &stmt.kind {
        StmtKind::Expr(expr) => write_expr(w, i, expr, control)?,
        StmtKind::Let {
            constant,
            name,
            value,
        } => {
            let keyword = if *constant { "const" } else { "let" };
            write!(w, "{keyword} {} = ", name.name)?;
            write_expr(w, i, value, control)?;
        }
        StmtKind::VarDecl(VarDecl {
            ty,
            name,
            value,
            inferred,
        }) => {
            if *inferred {
                write!(w, "{} := ", name.name)?;
            } else {
                write!(w, "{} {} = ", ty.name(), name.name)?;
            }
            write_expr(w, i, value, control)?;
        }
        StmtKind::List(ListDecl {
            elem_ty,
            name,
            value,
        }) => {
            write!(w, "[]{} {} = ", elem_ty.name(), name.name)?;
            write_expr(w, i, value, control)?;
        }
        StmtKind::Return(values) => {
            write!(w, "return")?;
            for (idx, value) in values.iter().enumerate() {
                write!(w, "{}", if idx == 0 { " " } else { ", " })?;
                write_expr(w, i, value, control)?;
            }
        }
        StmtKind::Function(function) => {
            if function.exported {
                write!(w, "pub ")?;
            }
            match function.return_types.as_slice() {
                [] => write!(w, "fn ")?,
                [ty] => write!(w, "{} ", ty.name())?,
                types => {
                    write_types(w, types)?;
                    write!(w, " ")?;
                }
            }
            write!(w, "{}", function.name.name)?;
            write_params(w, &function.params)?;
            write!(w, " ")?;
            write_block(w, i, &function.body)?;
        }
        StmtKind::If(if_stmt) => write_if(w, i, if_stmt)?,
        StmtKind::For(For {
            init,
            condition,
            post,
            body,
        }) => {
            write!(w, "for ")?;
            write_stmt(w, i, init, true)?;
            write!(w, "; ")?;
            write_expr(w, i, condition, true)?;
            write!(w, "; ")?;
            if let Some(post) = post {
                write_stmt(w, i, post, true)?;
                write!(w, " ")?;
            }
            write_block(w, i, body)?;
        }
        StmtKind::Block(block) => write_block(w, i, block)?,
        StmtKind::Struct(StructDef { name, fields }) => {
            writeln!(w, "struct {} {{", name.name)?;
            for field in fields {
                sp(w, i + 1)?;
                writeln!(w, "{} {}", field.ty.name(), field.name.name)?;
            }
            sp(w, i)?;
            write!(w, "}}")?;
        }
        StmtKind::Defer(deferred) => {
            write!(w, "defer ")?;
            write_stmt(w, i, deferred, control)?;
        }
    }
    Ok(())
}

fn write_if(w: &mut impl Write, i: usize, if_stmt: &If) -> std::io::Result<()> {
    write!(w, "if ")?;
    write_expr(w, i, &if_stmt.condition, true)?;
    write!(w, " ")?;
    write_block(w, i, &if_stmt.consequence)?;
    match if_stmt.alternative.as_deref() {
        Some(Alternative::Else(block)) => {
            write!(w, " else ")?;
            write_block(w, i, block)?;
        }
        Some(Alternative::ElseIf(nested)) => {
            write!(w, " else ")?;
            write_if(w, i, nested)?;
        }
        None => (),
    }
    Ok(())
}

fn write_block(w: &mut impl Write, i: usize, block: &Block) -> std::io::Result<()> {
    writeln!(w, "{{")?;
    for stmt in &block.statements {
        print_stmt(w, i + 1, stmt)?;
    }
    sp(w, i)?;
    write!(w, "}}")
}

fn write_params(w: &mut impl Write, params: &[Param]) -> std::io::Result<()> {
    write!(w, "(")?;
    for (idx, param) in params.iter().enumerate() {
        if idx > 0 {
            write!(w, ", ")?;
        }
        write!(w, "{} {}", param.ty.name(), param.name.name)?;
    }
    write!(w, ")")
}

fn write_types(w: &mut impl Write, types: &[TypeName]) -> std::io::Result<()> {
    write!(w, "(")?;
    for (idx, ty) in types.iter().enumerate() {
        if idx > 0 {
            write!(w, ", ")?;
        }
        write!(w, "{}", ty.name())?;
    }
    write!(w, ")")
}

fn write_exprs(w: &mut impl Write, i: usize, exprs: &[Expr]) -> std::io::Result<()> {
    for (idx, expr) in exprs.iter().enumerate() {
        if idx > 0 {
            write!(w, ", ")?;
        }
        write_expr(w, i, expr, false)?;
    }
    Ok(())
}

fn write_expr(w: &mut impl Write, i: usize, expr: &Expr, control: bool) -> std::io::Result<()> {
    match &expr.kind {
        ExprKind::Id(ident) => write!(w, "{}", ident.name),
        ExprKind::Int(val) => write!(w, "{val}"),
        ExprKind::Float(val) => {
            // Positional notation only, the lexer reads no exponents.
            let text = val.to_string();
            if text.contains('.') {
                write!(w, "{text}")
            } else {
                write!(w, "{text}.0")
            }
        }
        ExprKind::String(val) => write!(w, "\"{val}\""),
        ExprKind::Bool(val) => write!(w, "{val}"),
        ExprKind::Binary { op, lhs, rhs } => {
            write!(w, "(")?;
            write_expr(w, i, lhs, control)?;
            write!(w, " {} ", op.symbol())?;
            write_expr(w, i, rhs, control)?;
            write!(w, ")")
        }
        ExprKind::Unary { op, expr: inner } => {
            write!(w, "({}", op.symbol())?;
            write_expr(w, i, inner, control)?;
            write!(w, ")")
        }
        ExprKind::Postfix { op, expr: inner } => {
            write_expr(w, i, inner, control)?;
            write!(w, "{}", op.symbol())
        }
        ExprKind::Assign { target, op, value } => {
            write!(w, "{} {} ", target.name, op.symbol())?;
            write_expr(w, i, value, control)
        }
        ExprKind::Call { callee, args } => {
            write!(w, "{}(", callee.name)?;
            write_exprs(w, i, args)?;
            write!(w, ")")
        }
        ExprKind::Index { collection, index } => {
            write_expr(w, i, collection, control)?;
            write!(w, "[")?;
            write_expr(w, i, index, false)?;
            write!(w, "]")
        }
        ExprKind::List(elements) => {
            write!(w, "[")?;
            write_exprs(w, i, elements)?;
            write!(w, "]")
        }
        ExprKind::StructLit(StructLiteral { name, fields }) => {
            // Inside a header, a bare `{` would open the body instead.
            if control {
                write!(w, "(")?;
            }
            write!(w, "{}{{", name.name)?;
            for (idx, (field, value)) in fields.iter().enumerate() {
                if idx > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{field}: ")?;
                write_expr(w, i, value, false)?;
            }
            write!(w, "}}")?;
            if control {
                write!(w, ")")?;
            }
            Ok(())
        }
        ExprKind::FieldAccess { receiver, field } => {
            write_expr(w, i, receiver, control)?;
            write!(w, ".{}", field.name)
        }
        ExprKind::FieldAssign {
            receiver,
            field,
            value,
        } => {
            write_expr(w, i, receiver, control)?;
            write!(w, ".{} = ", field.name)?;
            write_expr(w, i, value, control)
        }
        ExprKind::While(While {
            condition, body, ..
        }) => {
            write!(w, "for ")?;
            write_expr(w, i, condition, true)?;
            write!(w, " ")?;
            write_block(w, i, body)
        }
        ExprKind::Function(FunctionLiteral {
            params,
            return_types,
            body,
        }) => {
            write!(w, "fn")?;
            write_params(w, params)?;
            match return_types.as_slice() {
                [] => (),
                [ty] => write!(w, " {}", ty.name())?,
                types => {
                    write!(w, " ")?;
                    write_types(w, types)?;
                }
            }
            write!(w, " ")?;
            write_block(w, i, body)
        }
    }
}

fn sp(w: &mut impl Write, i: usize) -> std::io::Result<()> {
    write!(w, "{:width$}", "", width = i * INDENT_WIDTH)
}

#[cfg(test)]
mod tests {
    use crate::{
        parser::parse_program,
        util::fmt::{
            source::print_program_source,
            tree::{print_program_string, Detail},
        },
    };

    #[track_caller]
    fn assert_round_trip(src: &str) {
        let (first, errors) = parse_program(src, "test.pun");
        assert!(errors.is_empty(), "{errors:?}");

        let printed = print_program_source(&first);
        let (second, errors) = parse_program(&printed, "test.pun");
        assert!(errors.is_empty(), "{errors:?}\n{printed}");

        ::pretty_assertions::assert_eq!(
            print_program_string(&first, Detail::Shape),
            print_program_string(&second, Detail::Shape),
        );
    }

    #[test]
    fn test_round_trip_showcase() {
        assert_round_trip(include_str!("../../../demos/showcase.pun"));
    }

    #[test]
    fn test_round_trip_operators() {
        assert_round_trip(
            "x := 1\nx = -x * 2 + 3 % 4 - (5 - 6)\nlet y = !(x < 2) || x >= 3 && true\n\
             big := 100000000000000000000.0\nsmall := 0.0000001\nhalf := 2.5",
        );
    }

    #[test]
    fn test_round_trip_struct_literal_in_header() {
        assert_round_trip(
            "struct P { i32 x }\nfn main() {\n  p := 1\n  if p == (P{x: 1}) { return }\n}",
        );
    }

    #[test]
    fn test_round_trip_struct_literal_in_header_arguments() {
        assert_round_trip(
            "struct P { i32 x }\nfn main() {\n  if f(P{x: 1}) { return }\n  if [P{2}] == a { return }\n}",
        );
    }

    #[test]
    fn test_float_printed_without_exponent() {
        let (program, _) = parse_program("x := 100000000000000000000.0\ny := 3.0", "test.pun");
        let expected = ::indoc::indoc! {"
            x := 100000000000000000000.0;
            y := 3.0;
        "};
        ::pretty_assertions::assert_eq!(print_program_source(&program), expected);
    }

    #[test]
    fn test_printed_source() {
        let (program, _) = parse_program("pub i32 f(i32 a) { return a + 1 }", "test.pun");
        let expected = ::indoc::indoc! {"
            pub i32 f(i32 a) {
                return (a + 1);
            }
        "};
        ::pretty_assertions::assert_eq!(print_program_source(&program), expected);
    }
}
