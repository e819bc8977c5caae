use std::io::Write;

use crate::{ast::*, token::Position};

const INDENT_WIDTH: usize = 2;

/// How much of each node gets printed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Detail {
    /// Every node carries its source position.
    Positions,
    /// Positions are left out, so trees parsed from differently laid out
    /// sources can be compared.
    Shape,
}

pub fn print_program_string(program: &Program, d: Detail) -> String {
    let mut buf = Vec::with_capacity(1024);
    print_program(&mut buf, d, program).unwrap();
    String::from_utf8(buf).unwrap()
}

pub fn print_expr_string(expr: &Expr, d: Detail) -> String {
    let mut buf = Vec::with_capacity(512);
    print_expr(&mut buf, d, 0, expr).unwrap();
    String::from_utf8(buf).unwrap()
}

pub fn print_program(w: &mut impl Write, d: Detail, program: &Program) -> std::io::Result<()> {
    for file in &program.files {
        print_file(w, d, 0, file)?;
    }
    Ok(())
}

fn print_file(w: &mut impl Write, d: Detail, i: usize, file: &File) -> std::io::Result<()> {
    sp(w, i)?;
    writeln!(w, "file {}", file.filename)?;
    if let Some(package) = &file.package {
        sp(w, i + 1)?;
        writeln!(w, "package {}", package.name)?;
    }
    for import in &file.imports {
        sp(w, i + 1)?;
        writeln!(w, "import {import:?}")?;
    }
    for stmt in &file.statements {
        print_stmt(w, d, i + 1, stmt)?;
    }
    Ok(())
}

pub fn print_stmt(w: &mut impl Write, d: Detail, i: usize, stmt: &Stmt) -> std::io::Result<()> {
    let pos = at(d, stmt.pos);
    match &stmt.kind {
        StmtKind::Expr(expr) => return print_expr(w, d, i, expr),
        StmtKind::Let {
            constant,
            name,
            value,
        } => {
            sp(w, i)?;
            let keyword = if *constant { "const" } else { "let" };
            writeln!(w, "{keyword} {}{pos}", name.name)?;
            print_expr(w, d, i + 1, value)?;
        }
        StmtKind::VarDecl(VarDecl {
            ty,
            name,
            value,
            inferred,
        }) => {
            sp(w, i)?;
            let inferred = if *inferred { " inferred" } else { "" };
            writeln!(w, "declare {}: {}{inferred}{pos}", name.name, ty.name())?;
            print_expr(w, d, i + 1, value)?;
        }
        StmtKind::List(ListDecl {
            elem_ty,
            name,
            value,
        }) => {
            sp(w, i)?;
            writeln!(w, "list {}: []{}{pos}", name.name, elem_ty.name())?;
            print_expr(w, d, i + 1, value)?;
        }
        StmtKind::Return(values) => {
            sp(w, i)?;
            writeln!(w, "return{pos}")?;
            for value in values {
                print_expr(w, d, i + 1, value)?;
            }
        }
        StmtKind::Function(function) => {
            sp(w, i)?;
            let exported = if function.exported { " exported" } else { "" };
            writeln!(w, "function {}{exported}{pos}", function.name.name)?;
            print_signature(w, d, i + 1, &function.params, &function.return_types)?;
            print_block(w, d, i + 1, "body", &function.body)?;
        }
        StmtKind::If(if_stmt) => {
            sp(w, i)?;
            writeln!(w, "if{pos}")?;
            print_if_arms(w, d, i + 1, if_stmt)?;
        }
        StmtKind::For(For {
            init,
            condition,
            post,
            body,
        }) => {
            sp(w, i)?;
            writeln!(w, "for{pos}")?;
            sp(w, i + 1)?;
            writeln!(w, "init")?;
            print_stmt(w, d, i + 2, init)?;
            sp(w, i + 1)?;
            writeln!(w, "condition")?;
            print_expr(w, d, i + 2, condition)?;
            if let Some(post) = post {
                sp(w, i + 1)?;
                writeln!(w, "post")?;
                print_stmt(w, d, i + 2, post)?;
            }
            print_block(w, d, i + 1, "body", body)?;
        }
        StmtKind::Block(block) => {
            let label = format!("block{}", at(d, block.pos));
            print_block(w, d, i, &label, block)?;
        }
        StmtKind::Struct(StructDef { name, fields }) => {
            sp(w, i)?;
            writeln!(w, "struct {}{pos}", name.name)?;
            for field in fields {
                sp(w, i + 1)?;
                writeln!(w, "field {}: {}", field.name.name, field.ty.name())?;
            }
        }
        StmtKind::Defer(deferred) => {
            sp(w, i)?;
            writeln!(w, "defer{pos}")?;
            print_stmt(w, d, i + 1, deferred)?;
        }
    }
    Ok(())
}

fn print_if_arms(w: &mut impl Write, d: Detail, i: usize, if_stmt: &If) -> std::io::Result<()> {
    print_expr(w, d, i, &if_stmt.condition)?;
    print_block(w, d, i, "then", &if_stmt.consequence)?;
    match if_stmt.alternative.as_deref() {
        Some(Alternative::Else(block)) => print_block(w, d, i, "else", block)?,
        Some(Alternative::ElseIf(nested)) => {
            sp(w, i)?;
            writeln!(w, "else")?;
            sp(w, i + 1)?;
            writeln!(w, "if")?;
            print_if_arms(w, d, i + 2, nested)?;
        }
        None => (),
    }
    Ok(())
}

fn print_signature(
    w: &mut impl Write,
    _: Detail,
    i: usize,
    params: &[Param],
    return_types: &[TypeName],
) -> std::io::Result<()> {
    if !return_types.is_empty() {
        sp(w, i)?;
        write!(w, "returns ")?;
        for (idx, ty) in return_types.iter().enumerate() {
            if idx > 0 {
                write!(w, ", ")?;
            }
            write!(w, "{}", ty.name())?;
        }
        writeln!(w)?;
    }
    for param in params {
        sp(w, i)?;
        writeln!(w, "param {}: {}", param.name.name, param.ty.name())?;
    }
    Ok(())
}

fn print_block(
    w: &mut impl Write,
    d: Detail,
    i: usize,
    label: &str,
    block: &Block,
) -> std::io::Result<()> {
    sp(w, i)?;
    writeln!(w, "{label}")?;
    for stmt in &block.statements {
        print_stmt(w, d, i + 1, stmt)?;
    }
    Ok(())
}

pub fn print_expr(w: &mut impl Write, d: Detail, i: usize, expr: &Expr) -> std::io::Result<()> {
    sp(w, i)?;
    let pos = at(d, expr.pos);
    match &expr.kind {
        ExprKind::Id(ident) => {
            writeln!(w, "ident {}{pos}", ident.name)?;
        }
        ExprKind::Int(val) => {
            writeln!(w, "int {val}{pos}")?;
        }
        ExprKind::Float(val) => {
            writeln!(w, "float {val:?}{pos}")?;
        }
        ExprKind::String(val) => {
            writeln!(w, "string \"{val}\"{pos}")?;
        }
        ExprKind::Bool(val) => {
            writeln!(w, "bool {val}{pos}")?;
        }
        ExprKind::Binary { op, lhs, rhs } => {
            writeln!(w, "binary {op:?}{pos}")?;
            print_expr(w, d, i + 1, lhs)?;
            print_expr(w, d, i + 1, rhs)?;
        }
        ExprKind::Unary {
            op,
            expr: inner_expr,
        } => {
            writeln!(w, "unary {op:?}{pos}")?;
            print_expr(w, d, i + 1, inner_expr)?;
        }
        ExprKind::Postfix {
            op,
            expr: inner_expr,
        } => {
            writeln!(w, "postfix {op:?}{pos}")?;
            print_expr(w, d, i + 1, inner_expr)?;
        }
        ExprKind::Assign { target, op, value } => {
            writeln!(w, "assignment {} {}{pos}", target.name, op.symbol())?;
            print_expr(w, d, i + 1, value)?;
        }
        ExprKind::Call { callee, args } => {
            writeln!(w, "call {}{pos}", callee.name)?;
            for arg in args {
                print_expr(w, d, i + 1, arg)?;
            }
        }
        ExprKind::Index { collection, index } => {
            writeln!(w, "index{pos}")?;
            print_expr(w, d, i + 1, collection)?;
            print_expr(w, d, i + 1, index)?;
        }
        ExprKind::List(elements) => {
            writeln!(w, "list{pos}")?;
            for element in elements {
                print_expr(w, d, i + 1, element)?;
            }
        }
        ExprKind::StructLit(StructLiteral { name, fields }) => {
            writeln!(w, "struct literal {}{pos}", name.name)?;
            for (field, value) in fields {
                sp(w, i + 1)?;
                writeln!(w, "field {field}")?;
                print_expr(w, d, i + 2, value)?;
            }
        }
        ExprKind::FieldAccess { receiver, field } => {
            writeln!(w, "field access {}{pos}", field.name)?;
            print_expr(w, d, i + 1, receiver)?;
        }
        ExprKind::FieldAssign {
            receiver,
            field,
            value,
        } => {
            writeln!(w, "field assignment {}{pos}", field.name)?;
            print_expr(w, d, i + 1, receiver)?;
            print_expr(w, d, i + 1, value)?;
        }
        ExprKind::While(While {
            condition,
            body,
            id,
        }) => {
            writeln!(w, "while #{id}{pos}")?;
            print_expr(w, d, i + 1, condition)?;
            print_block(w, d, i + 1, "body", body)?;
        }
        ExprKind::Function(FunctionLiteral {
            params,
            return_types,
            body,
        }) => {
            writeln!(w, "function literal{pos}")?;
            print_signature(w, d, i + 1, params, return_types)?;
            print_block(w, d, i + 1, "body", body)?;
        }
    }
    Ok(())
}

fn sp(w: &mut impl Write, i: usize) -> std::io::Result<()> {
    write!(w, "{:width$}", "", width = i * INDENT_WIDTH)
}

/// Writes ` (line:column)`, or nothing when positions are left out.
fn at(d: Detail, pos: Position) -> impl std::fmt::Display {
    struct At(Option<Position>);

    impl std::fmt::Display for At {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self.0 {
                Some(pos) => write!(f, " ({pos})"),
                None => Ok(()),
            }
        }
    }

    At((d == Detail::Positions).then_some(pos))
}
