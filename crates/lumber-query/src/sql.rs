//! Rendering of the expression AST into ClickHouse SQL.
//!
//! The renderer is total and deterministic: it never consults the schema and
//! produces the same string for the same tree.

use crate::ast::{
    Expr, OrderByDirection, OrderByExpr, SelectCommand,
};

/// Renders a full SELECT statement.
pub fn select_to_sql(cmd: &SelectCommand) -> String {
    let mut sql = String::from("SELECT ");
    if cmd.is_distinct {
        sql.push_str("DISTINCT ");
    }
    if cmd.columns.is_empty() {
        sql.push('*');
    } else {
        sql.push_str(&join_exprs(&cmd.columns, ", "));
    }

    if let Some(from) = &cmd.from {
        sql.push_str(" FROM ");
        match from.as_ref() {
            Expr::Select(sub) => {
                sql.push('(');
                sql.push_str(&select_to_sql(sub));
                sql.push(')');
            }
            other => sql.push_str(&expr_to_sql(other)),
        }
    }

    if let Some(where_clause) = &cmd.where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(&expr_to_sql(where_clause));
    }

    if !cmd.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&join_exprs(&cmd.group_by, ", "));
    }

    if !cmd.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        let rendered: Vec<String> = cmd.order_by.iter().map(order_by_to_sql).collect();
        sql.push_str(&rendered.join(", "));
    }

    if cmd.sample_limit > 0 {
        sql.push_str(&format!(" LIMIT {}", cmd.sample_limit));
    } else if cmd.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", cmd.limit));
    }

    sql
}

/// Renders one expression node.
pub fn expr_to_sql(expr: &Expr) -> String {
    match expr {
        Expr::Literal(e) => e.value.clone(),
        Expr::ColumnRef(e) => quote_identifier(&e.column_name),
        Expr::TableRef(e) => quote_table_name(&e.name),
        Expr::Infix(e) => {
            let left = expr_to_sql(&e.left);
            let right = expr_to_sql(&e.right);
            let op = e.op.trim();
            // Boolean connectives are parenthesized so nesting stays
            // unambiguous after rewrite passes.
            if op.eq_ignore_ascii_case("AND") || op.eq_ignore_ascii_case("OR") {
                format!("({} {} {})", left, op, right)
            } else {
                format!("{} {} {}", left, op, right)
            }
        }
        Expr::Prefix(e) => {
            let args = join_exprs(&e.args, ", ");
            format!("{} ({})", e.op, args)
        }
        Expr::Function(e) => format!("{}({})", e.name, join_exprs(&e.args, ",")),
        Expr::MultiFunction(e) => {
            let mut out = e.name.clone();
            for arg in &e.args {
                out.push('(');
                out.push_str(&expr_to_sql(arg));
                out.push(')');
            }
            out
        }
        Expr::ArrayAccess(e) => {
            format!("{}[{}]", quote_identifier(&e.column.column_name), expr_to_sql(&e.index))
        }
        Expr::NestedProperty(e) => {
            format!("{}.{}", quote_identifier(&e.column.column_name), e.property.value)
        }
        Expr::Aliased(e) => format!("{} AS {}", expr_to_sql(&e.expr), quote_identifier(&e.alias)),
        Expr::OrderBy(e) => order_by_to_sql(e),
        Expr::Distinct(e) => format!("DISTINCT {}", expr_to_sql(&e.expr)),
        Expr::Lambda(e) => format!("{} -> {}", e.args.join(","), expr_to_sql(&e.body)),
        Expr::WindowFunction(e) => {
            let mut out = format!("{}({}) OVER (", e.name, join_exprs(&e.args, ","));
            if !e.partition_by.is_empty() {
                out.push_str("PARTITION BY ");
                out.push_str(&join_exprs(&e.partition_by, ", "));
            }
            if !e.order_by.is_empty() {
                if !e.partition_by.is_empty() {
                    out.push(' ');
                }
                out.push_str("ORDER BY ");
                let rendered: Vec<String> = e.order_by.iter().map(order_by_to_sql).collect();
                out.push_str(&rendered.join(", "));
            }
            out.push(')');
            out
        }
        Expr::Paren(e) => format!("({})", join_exprs(&e.exprs, ", ")),
        Expr::Select(c) => select_to_sql(c),
    }
}

fn order_by_to_sql(ob: &OrderByExpr) -> String {
    let exprs = join_exprs(&ob.exprs, ", ");
    match ob.direction {
        OrderByDirection::Asc => format!("{} asc", exprs),
        OrderByDirection::Desc => format!("{} desc", exprs),
    }
}

fn join_exprs(exprs: &[Expr], sep: &str) -> String {
    exprs.iter().map(expr_to_sql).collect::<Vec<_>>().join(sep)
}

/// Quotes an identifier with double quotes. `*` stays bare.
pub fn quote_identifier(name: &str) -> String {
    if name == "*" {
        return name.to_string();
    }
    format!("\"{}\"", name.replace('"', "\\\""))
}

/// Quotes a table name, keeping an optional `db.table` split.
fn quote_table_name(name: &str) -> String {
    match name.split_once('.') {
        Some((db, table)) if !db.is_empty() => {
            format!("{}.{}", quote_identifier(db), quote_identifier(table))
        }
        _ => quote_identifier(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        aliased, and, column, count_star, function, infix, lambda, quoted_literal, sort_column,
        table, OrderByDirection, SelectCommand,
    };

    #[test]
    fn test_simple_select() {
        let cmd = SelectCommand::new(
            vec![column("*")],
            vec![],
            vec![sort_column("timestamp", OrderByDirection::Desc)],
            Some(table("logs")),
            Some(infix(column("message"), "ILIKE", quoted_literal("%error%"))),
            10,
            0,
            false,
        );
        assert_eq!(
            select_to_sql(&cmd),
            r#"SELECT * FROM "logs" WHERE "message" ILIKE '%error%' ORDER BY "timestamp" desc LIMIT 10"#
        );
    }

    #[test]
    fn test_and_fold_renders_parenthesized() {
        let clause = and(vec![
            infix(
                column("timestamp"),
                ">=",
                function("parseDateTime64BestEffort", vec![quoted_literal("2024-02-02T13:47:16.029Z")]),
            ),
            infix(
                column("timestamp"),
                "<=",
                function("parseDateTime64BestEffort", vec![quoted_literal("2024-02-09T13:47:16.029Z")]),
            ),
        ])
        .unwrap();
        assert_eq!(
            expr_to_sql(&clause),
            r#"("timestamp" >= parseDateTime64BestEffort('2024-02-02T13:47:16.029Z') AND "timestamp" <= parseDateTime64BestEffort('2024-02-09T13:47:16.029Z'))"#
        );
    }

    #[test]
    fn test_function_args_join_without_space() {
        let expr = function(
            "isIPAddressInRange",
            vec![
                function("CAST", vec![column("client_ip"), quoted_literal("String")]),
                quoted_literal("10.0.0.0/8"),
            ],
        );
        assert_eq!(
            expr_to_sql(&expr),
            r#"isIPAddressInRange(CAST("client_ip",'String'),'10.0.0.0/8')"#
        );
    }

    #[test]
    fn test_lambda_and_group_by() {
        let exists = function(
            "arrayExists",
            vec![
                lambda(vec!["x".into()], infix(crate::ast::literal("x"), "LIKE", quoted_literal("%a%"))),
                column("tags"),
            ],
        );
        assert_eq!(expr_to_sql(&exists), r#"arrayExists(x -> x LIKE '%a%',"tags")"#);

        let cmd = SelectCommand::new(
            vec![aliased(column("host"), "key"), aliased(count_star(), "doc_count")],
            vec![column("host")],
            vec![],
            Some(table("logs")),
            None,
            0,
            0,
            false,
        );
        assert_eq!(
            select_to_sql(&cmd),
            r#"SELECT "host" AS "key", count(*) AS "doc_count" FROM "logs" GROUP BY "host""#
        );
    }

    #[test]
    fn test_subselect_from() {
        let inner = SelectCommand::new(
            vec![column("host")],
            vec![],
            vec![],
            Some(table("logs")),
            None,
            0,
            5000,
            false,
        );
        let outer = SelectCommand::new(
            vec![count_star()],
            vec![],
            vec![],
            Some(crate::ast::Expr::Select(Box::new(inner))),
            None,
            0,
            0,
            false,
        );
        assert_eq!(
            select_to_sql(&outer),
            r#"SELECT count(*) FROM (SELECT "host" FROM "logs" LIMIT 5000)"#
        );
    }
}
