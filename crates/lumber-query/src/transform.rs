//! Post-translation rewrite passes over the SELECT commands.
//!
//! Each pass is an [`ExprVisitor`] defaulting to structural identity, so it
//! rewrites only the nodes it recognizes. The pipeline is idempotent:
//! running it twice yields the same tree as running it once.

use tracing::warn;

use crate::ast::{
    self, column, function, infix, lambda, Expr, ExprVisitor, FunctionExpr, InfixExpr,
    SelectCommand,
};
use crate::context::IndexContext;
use crate::plan::Query;

pub struct TransformPipeline<'a> {
    ctx: &'a dyn IndexContext,
}

impl<'a> TransformPipeline<'a> {
    pub fn new(ctx: &'a dyn IndexContext) -> Self {
        Self { ctx }
    }

    pub fn transform(&self, queries: Vec<Query>) -> Vec<Query> {
        queries.into_iter().map(|q| self.transform_one(q)).collect()
    }

    fn transform_one(&self, mut query: Query) -> Query {
        let mut ip = IpRangePass { ctx: self.ctx };
        query.select = ip.visit_select(&query.select);

        let mut geo = GeoPointPass { ctx: self.ctx };
        query.select = geo.visit_select(&query.select);

        let mut array = ArrayColumnPass { ctx: self.ctx };
        query.select = array.visit_select(&query.select);

        query
    }
}

/// Equality and ILIKE comparisons of an `ip`-typed column against a literal
/// containing `/` become a range containment check.
struct IpRangePass<'a> {
    ctx: &'a dyn IndexContext,
}

impl ExprVisitor for IpRangePass<'_> {
    fn visit_infix(&mut self, e: &InfixExpr) -> Expr {
        if let (Expr::ColumnRef(col), Expr::Literal(lit)) = (&*e.left, &*e.right) {
            if lit.value.contains('/') && self.ctx.is_ip(&col.column_name) {
                let op = e.op.trim();
                if op == "=" || op.eq_ignore_ascii_case("ILIKE") {
                    let range = lit.value.replace('%', "");
                    return function(
                        "isIPAddressInRange",
                        vec![
                            function(
                                "CAST",
                                vec![
                                    Expr::ColumnRef(col.clone()),
                                    ast::quoted_literal("String"),
                                ],
                            ),
                            ast::literal(range),
                        ],
                    );
                }
                warn!(op = %e.op, column = %col.column_name, "ip range transformation omitted, operator is not = or ILIKE");
            }
        }
        ast::walk_infix(self, e)
    }
}

/// Selected or grouped geo_point columns expand into their `::lat`/`::lon`
/// component columns. The WHERE clause stays untouched.
struct GeoPointPass<'a> {
    ctx: &'a dyn IndexContext,
}

impl GeoPointPass<'_> {
    fn expand(&self, exprs: &[Expr]) -> Vec<Expr> {
        let mut out = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                Expr::ColumnRef(col) if self.ctx.is_geo_point(&col.column_name) => {
                    out.push(column(format!("{}::lat", col.column_name)));
                    out.push(column(format!("{}::lon", col.column_name)));
                }
                other => out.push(other.clone()),
            }
        }
        out
    }
}

impl ExprVisitor for GeoPointPass<'_> {
    fn visit_select(&mut self, c: &SelectCommand) -> SelectCommand {
        let mut rebuilt = c.clone();
        rebuilt.columns = self.expand(&c.columns);
        rebuilt.group_by = self.expand(&c.group_by);
        if let Some(from) = &c.from {
            if let Expr::Select(inner) = from.as_ref() {
                rebuilt.from = Some(Box::new(Expr::Select(Box::new(self.visit_select(inner)))));
            }
        }
        rebuilt
    }
}

/// Rewrites of operations over array-typed columns into array functions.
struct ArrayColumnPass<'a> {
    ctx: &'a dyn IndexContext,
}

impl ArrayColumnPass<'_> {
    fn db_column_type(&self, field_name: &str) -> String {
        let trimmed = field_name.trim_end_matches(".keyword");
        self.ctx.db_column_type(trimmed).unwrap_or_default()
    }
}

impl ExprVisitor for ArrayColumnPass<'_> {
    fn visit_infix(&mut self, e: &InfixExpr) -> Expr {
        if let Expr::ColumnRef(col) = &*e.left {
            let db_type = self.db_column_type(&col.column_name);
            if db_type.starts_with("Array") {
                let op = e.op.trim().to_uppercase();
                match op.as_str() {
                    "ILIKE" | "LIKE" if db_type == "Array(String)" => {
                        let rhs = self.visit_expr(&e.right);
                        let body = infix(ast::literal("x"), op, rhs);
                        return function(
                            "arrayExists",
                            vec![lambda(vec!["x".to_string()], body), (*e.left).clone()],
                        );
                    }
                    "=" => {
                        let rhs = self.visit_expr(&e.right);
                        return function("has", vec![(*e.left).clone(), rhs]);
                    }
                    _ => {
                        warn!(op = %e.op, column = %col.column_name, db_type, "unhandled array infix operation");
                    }
                }
            }
        }
        ast::walk_infix(self, e)
    }

    fn visit_function(&mut self, e: &FunctionExpr) -> Expr {
        if e.args.len() == 1 {
            if let Expr::ColumnRef(col) = &e.args[0] {
                let db_type = self.db_column_type(&col.column_name);
                if db_type.starts_with("Array") {
                    if e.name == "sumOrNull" && db_type == "Array(Int64)" {
                        let reduced = function(
                            "arrayReduce",
                            vec![ast::quoted_literal("sumOrNull"), e.args[0].clone()],
                        );
                        return function("sumOrNull", vec![reduced]);
                    }
                    warn!(name = %e.name, column = %col.column_name, db_type, "unhandled array function");
                }
            }
        }
        ast::walk_function(self, e)
    }

    fn visit_select(&mut self, c: &SelectCommand) -> SelectCommand {
        // queries without any array column pass through untouched
        let mut referenced = Vec::new();
        for expr in &c.columns {
            referenced.extend(ast::used_columns(expr));
        }
        if let Some(where_clause) = &c.where_clause {
            referenced.extend(ast::used_columns(where_clause));
        }
        let touches_array = referenced
            .iter()
            .any(|col| self.db_column_type(&col.column_name).starts_with("Array"));
        if !touches_array {
            return c.clone();
        }
        ast::walk_select(self, c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{quoted_literal, sort_column, table, OrderByDirection};
    use crate::context::testing::StaticContext;
    use crate::highlight::Highlighter;
    use crate::plan::{HitsShaper, PlanKind};
    use crate::sql::select_to_sql;

    fn query_with_where(ctx: &StaticContext, where_clause: Expr) -> Query {
        let select = SelectCommand::new(
            vec![ast::wildcard()],
            vec![],
            vec![sort_column("timestamp", OrderByDirection::Desc)],
            Some(table("logs")),
            Some(where_clause),
            10,
            0,
            false,
        );
        Query {
            select,
            table_name: "logs".to_string(),
            shaper: Box::new(HitsShaper {
                table_name: "logs".to_string(),
                timestamp_column: None,
                highlighter: Highlighter::disabled(),
                sort_field_names: vec![],
                aliases: vec![],
                add_source: true,
            }),
            plan_kind: PlanKind::Hits,
            agg_path: vec![],
            group_by_depth: 0,
            pipeline_parent: None,
            highlighter: None,
        }
    }

    fn where_sql(queries: &[Query]) -> String {
        let sql = select_to_sql(&queries[0].select);
        sql.split(" WHERE ").nth(1).unwrap_or("").split(" ORDER BY").next().unwrap().to_string()
    }

    #[test]
    fn test_ip_range_rewrite() {
        let ctx = StaticContext::new("logs")
            .with_column("client_ip", "IPv4")
            .with_ip("client_ip");
        let pipeline = TransformPipeline::new(&ctx);
        let q = query_with_where(
            &ctx,
            infix(column("client_ip"), "=", quoted_literal("10.0.0.0/8")),
        );
        let out = pipeline.transform(vec![q]);
        assert_eq!(
            where_sql(&out),
            r#"isIPAddressInRange(CAST("client_ip",'String'),'10.0.0.0/8')"#
        );
    }

    #[test]
    fn test_ip_without_slash_passes_through() {
        let ctx = StaticContext::new("logs")
            .with_column("client_ip", "IPv4")
            .with_ip("client_ip");
        let pipeline = TransformPipeline::new(&ctx);
        let q = query_with_where(
            &ctx,
            infix(column("client_ip"), "=", quoted_literal("10.0.0.1")),
        );
        let out = pipeline.transform(vec![q]);
        assert_eq!(where_sql(&out), r#""client_ip" = '10.0.0.1'"#);
    }

    #[test]
    fn test_array_string_equality_becomes_has() {
        let ctx = StaticContext::new("logs").with_column("tags", "Array(String)");
        let pipeline = TransformPipeline::new(&ctx);
        let q = query_with_where(&ctx, infix(column("tags"), "=", quoted_literal("prod")));
        let out = pipeline.transform(vec![q]);
        assert_eq!(where_sql(&out), r#"has("tags",'prod')"#);
    }

    #[test]
    fn test_array_string_ilike_becomes_array_exists() {
        let ctx = StaticContext::new("logs").with_column("tags", "Array(String)");
        let pipeline = TransformPipeline::new(&ctx);
        let q = query_with_where(
            &ctx,
            infix(column("tags"), "ILIKE", quoted_literal("%prod%")),
        );
        let out = pipeline.transform(vec![q]);
        assert_eq!(where_sql(&out), r#"arrayExists(x -> x ILIKE '%prod%',"tags")"#);
    }

    #[test]
    fn test_sum_or_null_on_int_array_wraps_array_reduce() {
        let ctx = StaticContext::new("logs").with_column("sizes", "Array(Int64)");
        let pipeline = TransformPipeline::new(&ctx);
        let mut q = query_with_where(&ctx, ast::literal("true"));
        q.select.columns = vec![function("sumOrNull", vec![column("sizes")])];
        let out = pipeline.transform(vec![q]);
        let sql = select_to_sql(&out[0].select);
        assert!(
            sql.contains(r#"sumOrNull(arrayReduce('sumOrNull',"sizes"))"#),
            "sql was: {}",
            sql
        );
    }

    #[test]
    fn test_geo_point_expands_in_columns_and_group_by_only() {
        let ctx = StaticContext::new("logs").with_geo_point("location");
        let pipeline = TransformPipeline::new(&ctx);
        let mut q = query_with_where(
            &ctx,
            infix(column("location"), "=", quoted_literal("x")),
        );
        q.select.columns = vec![column("location")];
        q.select.group_by = vec![column("location")];
        let out = pipeline.transform(vec![q]);
        let sql = select_to_sql(&out[0].select);
        assert!(sql.starts_with(r#"SELECT "location::lat", "location::lon" FROM"#), "sql was: {}", sql);
        assert!(sql.contains(r#"GROUP BY "location::lat", "location::lon""#));
        // the WHERE clause keeps the original column
        assert!(sql.contains(r#""location" = 'x'"#));
    }

    #[test]
    fn test_pipeline_is_idempotent() {
        let ctx = StaticContext::new("logs")
            .with_column("tags", "Array(String)")
            .with_column("client_ip", "IPv4")
            .with_ip("client_ip")
            .with_geo_point("location");
        let pipeline = TransformPipeline::new(&ctx);
        let mut q = query_with_where(
            &ctx,
            ast::and(vec![
                infix(column("tags"), "=", quoted_literal("prod")),
                infix(column("client_ip"), "ILIKE", quoted_literal("%10.0.0.0/8%")),
            ])
            .unwrap(),
        );
        q.select.columns = vec![column("location")];

        let once = pipeline.transform(vec![q]);
        let once_sql = select_to_sql(&once[0].select);
        let twice = pipeline.transform(once);
        assert_eq!(select_to_sql(&twice[0].select), once_sql);
    }
}
