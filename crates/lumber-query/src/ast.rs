//! Typed expression tree for SELECT commands.
//!
//! Every DSL request is translated into one or more [`SelectCommand`]s built
//! out of [`Expr`] nodes. Rewrite passes implement [`ExprVisitor`]; every
//! visitor method defaults to structural identity (rebuild the node, recurse
//! into children), so a pass only overrides the nodes it cares about.

/// A single expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal rendered verbatim into SQL. String literals carry their own
    /// single quotes (e.g. `'%foo%'`), numbers do not.
    Literal(LiteralExpr),
    ColumnRef(ColumnRef),
    TableRef(TableRef),
    Infix(InfixExpr),
    Prefix(PrefixExpr),
    Function(FunctionExpr),
    /// Parameterized function application, e.g. `quantiles(0.5,0.99)(latency)`.
    MultiFunction(MultiFunctionExpr),
    ArrayAccess(ArrayAccess),
    /// `column.property`, e.g. `"tags".size0`.
    NestedProperty(NestedProperty),
    Aliased(AliasedExpr),
    OrderBy(OrderByExpr),
    Distinct(DistinctExpr),
    Lambda(LambdaExpr),
    WindowFunction(WindowFunction),
    Paren(ParenExpr),
    Select(Box<SelectCommand>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralExpr {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfixExpr {
    pub left: Box<Expr>,
    pub op: String,
    pub right: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefixExpr {
    pub op: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpr {
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiFunctionExpr {
    pub name: String,
    /// First element is the parameter list, the rest are applied one
    /// parenthesized group each.
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayAccess {
    pub column: ColumnRef,
    pub index: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NestedProperty {
    pub column: ColumnRef,
    pub property: LiteralExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasedExpr {
    pub expr: Box<Expr>,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderByDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub exprs: Vec<Expr>,
    pub direction: OrderByDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistinctExpr {
    pub expr: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambdaExpr {
    pub args: Vec<String>,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowFunction {
    pub name: String,
    pub args: Vec<Expr>,
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParenExpr {
    pub exprs: Vec<Expr>,
}

/// A full SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectCommand {
    pub columns: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub from: Option<Box<Expr>>,
    pub where_clause: Option<Box<Expr>>,
    /// 0 means no LIMIT clause.
    pub limit: usize,
    /// 0 means no row sample; rendered as `LIMIT n` on the innermost select.
    pub sample_limit: usize,
    pub is_distinct: bool,
}

impl SelectCommand {
    pub fn new(
        columns: Vec<Expr>,
        group_by: Vec<Expr>,
        order_by: Vec<OrderByExpr>,
        from: Option<Expr>,
        where_clause: Option<Expr>,
        limit: usize,
        sample_limit: usize,
        is_distinct: bool,
    ) -> Self {
        Self {
            columns,
            group_by,
            order_by,
            from: from.map(Box::new),
            where_clause: where_clause.map(Box::new),
            limit,
            sample_limit,
            is_distinct,
        }
    }

    /// True when the select is a plain `SELECT *`.
    pub fn is_wildcard(&self) -> bool {
        self.columns.len() == 1 && self.columns[0] == wildcard()
    }

    /// Column names referenced by the ORDER BY clause, in order.
    pub fn order_by_field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for ob in &self.order_by {
            for expr in &ob.exprs {
                if let Expr::ColumnRef(c) = expr {
                    names.push(c.column_name.clone());
                }
            }
        }
        names
    }
}

// Constructor helpers, used pervasively by the parser and the passes.

pub fn literal(value: impl Into<String>) -> Expr {
    Expr::Literal(LiteralExpr { value: value.into() })
}

/// A string literal with surrounding single quotes.
pub fn quoted_literal(value: impl AsRef<str>) -> Expr {
    literal(format!("'{}'", value.as_ref()))
}

pub fn column(name: impl Into<String>) -> Expr {
    Expr::ColumnRef(ColumnRef { column_name: name.into() })
}

pub fn table(name: impl Into<String>) -> Expr {
    Expr::TableRef(TableRef { name: name.into() })
}

pub fn infix(left: Expr, op: impl Into<String>, right: Expr) -> Expr {
    Expr::Infix(InfixExpr { left: Box::new(left), op: op.into(), right: Box::new(right) })
}

pub fn prefix(op: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Prefix(PrefixExpr { op: op.into(), args })
}

pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Function(FunctionExpr { name: name.into(), args })
}

pub fn multi_function(name: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::MultiFunction(MultiFunctionExpr { name: name.into(), args })
}

pub fn array_access(column: ColumnRef, index: Expr) -> Expr {
    Expr::ArrayAccess(ArrayAccess { column, index: Box::new(index) })
}

pub fn nested_property(column: ColumnRef, property: impl Into<String>) -> Expr {
    Expr::NestedProperty(NestedProperty {
        column,
        property: LiteralExpr { value: property.into() },
    })
}

pub fn aliased(expr: Expr, alias: impl Into<String>) -> Expr {
    Expr::Aliased(AliasedExpr { expr: Box::new(expr), alias: alias.into() })
}

pub fn sort_column(name: impl Into<String>, direction: OrderByDirection) -> OrderByExpr {
    OrderByExpr { exprs: vec![column(name)], direction }
}

pub fn lambda(args: Vec<String>, body: Expr) -> Expr {
    Expr::Lambda(LambdaExpr { args, body: Box::new(body) })
}

pub fn paren(exprs: Vec<Expr>) -> Expr {
    Expr::Paren(ParenExpr { exprs })
}

pub fn wildcard() -> Expr {
    column("*")
}

pub fn count_star() -> Expr {
    function("count", vec![wildcard()])
}

/// Fold expressions with AND. `None` for an empty list, the sole expression
/// for a singleton.
pub fn and(exprs: Vec<Expr>) -> Option<Expr> {
    fold_binary(exprs, "AND")
}

/// Fold expressions with OR.
pub fn or(exprs: Vec<Expr>) -> Option<Expr> {
    fold_binary(exprs, "OR")
}

fn fold_binary(exprs: Vec<Expr>, op: &str) -> Option<Expr> {
    let mut iter = exprs.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, |acc, e| infix(acc, op, e)))
}

/// Collects every column referenced anywhere under the expression.
pub fn used_columns(expr: &Expr) -> Vec<ColumnRef> {
    let mut out = Vec::new();
    collect_columns(expr, &mut out);
    out
}

fn collect_columns(expr: &Expr, out: &mut Vec<ColumnRef>) {
    match expr {
        Expr::Literal(_) | Expr::TableRef(_) => {}
        Expr::ColumnRef(c) => out.push(c.clone()),
        Expr::Infix(e) => {
            collect_columns(&e.left, out);
            collect_columns(&e.right, out);
        }
        Expr::Prefix(e) => e.args.iter().for_each(|a| collect_columns(a, out)),
        Expr::Function(e) => e.args.iter().for_each(|a| collect_columns(a, out)),
        Expr::MultiFunction(e) => e.args.iter().for_each(|a| collect_columns(a, out)),
        Expr::ArrayAccess(e) => {
            out.push(e.column.clone());
            collect_columns(&e.index, out);
        }
        Expr::NestedProperty(e) => out.push(e.column.clone()),
        Expr::Aliased(e) => collect_columns(&e.expr, out),
        Expr::OrderBy(e) => e.exprs.iter().for_each(|a| collect_columns(a, out)),
        Expr::Distinct(e) => collect_columns(&e.expr, out),
        Expr::Lambda(e) => collect_columns(&e.body, out),
        Expr::WindowFunction(e) => {
            e.args.iter().for_each(|a| collect_columns(a, out));
            e.partition_by.iter().for_each(|a| collect_columns(a, out));
            for ob in &e.order_by {
                ob.exprs.iter().for_each(|a| collect_columns(a, out));
            }
        }
        Expr::Paren(e) => e.exprs.iter().for_each(|a| collect_columns(a, out)),
        Expr::Select(c) => {
            c.columns.iter().for_each(|a| collect_columns(a, out));
            c.group_by.iter().for_each(|a| collect_columns(a, out));
            for ob in &c.order_by {
                ob.exprs.iter().for_each(|a| collect_columns(a, out));
            }
            if let Some(w) = &c.where_clause {
                collect_columns(w, out);
            }
        }
    }
}

/// Rewriting visitor over the expression tree.
///
/// Default methods rebuild nodes structurally, so implementations override
/// only the variants they rewrite and the rest of the tree passes through
/// unchanged.
pub trait ExprVisitor {
    fn visit_literal(&mut self, e: &LiteralExpr) -> Expr {
        Expr::Literal(e.clone())
    }

    fn visit_column_ref(&mut self, e: &ColumnRef) -> Expr {
        Expr::ColumnRef(e.clone())
    }

    fn visit_table_ref(&mut self, e: &TableRef) -> Expr {
        Expr::TableRef(e.clone())
    }

    fn visit_infix(&mut self, e: &InfixExpr) -> Expr {
        walk_infix(self, e)
    }

    fn visit_prefix(&mut self, e: &PrefixExpr) -> Expr {
        walk_prefix(self, e)
    }

    fn visit_function(&mut self, e: &FunctionExpr) -> Expr {
        walk_function(self, e)
    }

    fn visit_multi_function(&mut self, e: &MultiFunctionExpr) -> Expr {
        Expr::MultiFunction(MultiFunctionExpr {
            name: e.name.clone(),
            args: walk_exprs(self, &e.args),
        })
    }

    fn visit_array_access(&mut self, e: &ArrayAccess) -> Expr {
        Expr::ArrayAccess(ArrayAccess {
            column: self.rebuild_column(&e.column),
            index: Box::new(self.visit_expr(&e.index)),
        })
    }

    fn visit_nested_property(&mut self, e: &NestedProperty) -> Expr {
        Expr::NestedProperty(NestedProperty {
            column: self.rebuild_column(&e.column),
            property: e.property.clone(),
        })
    }

    fn visit_aliased(&mut self, e: &AliasedExpr) -> Expr {
        Expr::Aliased(AliasedExpr {
            expr: Box::new(self.visit_expr(&e.expr)),
            alias: e.alias.clone(),
        })
    }

    fn visit_order_by(&mut self, e: &OrderByExpr) -> OrderByExpr {
        OrderByExpr { exprs: walk_exprs(self, &e.exprs), direction: e.direction }
    }

    fn visit_distinct(&mut self, e: &DistinctExpr) -> Expr {
        Expr::Distinct(DistinctExpr { expr: Box::new(self.visit_expr(&e.expr)) })
    }

    fn visit_lambda(&mut self, e: &LambdaExpr) -> Expr {
        Expr::Lambda(LambdaExpr {
            args: e.args.clone(),
            body: Box::new(self.visit_expr(&e.body)),
        })
    }

    fn visit_window_function(&mut self, e: &WindowFunction) -> Expr {
        Expr::WindowFunction(WindowFunction {
            name: e.name.clone(),
            args: walk_exprs(self, &e.args),
            partition_by: walk_exprs(self, &e.partition_by),
            order_by: e.order_by.iter().map(|ob| self.visit_order_by(ob)).collect(),
        })
    }

    fn visit_paren(&mut self, e: &ParenExpr) -> Expr {
        Expr::Paren(ParenExpr { exprs: walk_exprs(self, &e.exprs) })
    }

    fn visit_select(&mut self, c: &SelectCommand) -> SelectCommand {
        walk_select(self, c)
    }

    fn visit_expr(&mut self, expr: &Expr) -> Expr {
        dispatch(self, expr)
    }

    /// Visits a column ref and keeps it a column ref; a pass that rewrites
    /// columns into something else handles that in `visit_column_ref`.
    fn rebuild_column(&mut self, c: &ColumnRef) -> ColumnRef {
        match self.visit_column_ref(c) {
            Expr::ColumnRef(c2) => c2,
            _ => c.clone(),
        }
    }
}

pub fn dispatch<V: ExprVisitor + ?Sized>(v: &mut V, expr: &Expr) -> Expr {
    match expr {
        Expr::Literal(e) => v.visit_literal(e),
        Expr::ColumnRef(e) => v.visit_column_ref(e),
        Expr::TableRef(e) => v.visit_table_ref(e),
        Expr::Infix(e) => v.visit_infix(e),
        Expr::Prefix(e) => v.visit_prefix(e),
        Expr::Function(e) => v.visit_function(e),
        Expr::MultiFunction(e) => v.visit_multi_function(e),
        Expr::ArrayAccess(e) => v.visit_array_access(e),
        Expr::NestedProperty(e) => v.visit_nested_property(e),
        Expr::Aliased(e) => v.visit_aliased(e),
        Expr::OrderBy(e) => Expr::OrderBy(v.visit_order_by(e)),
        Expr::Distinct(e) => v.visit_distinct(e),
        Expr::Lambda(e) => v.visit_lambda(e),
        Expr::WindowFunction(e) => v.visit_window_function(e),
        Expr::Paren(e) => v.visit_paren(e),
        Expr::Select(c) => Expr::Select(Box::new(v.visit_select(c))),
    }
}

pub fn walk_exprs<V: ExprVisitor + ?Sized>(v: &mut V, exprs: &[Expr]) -> Vec<Expr> {
    exprs.iter().map(|e| v.visit_expr(e)).collect()
}

pub fn walk_infix<V: ExprVisitor + ?Sized>(v: &mut V, e: &InfixExpr) -> Expr {
    Expr::Infix(InfixExpr {
        left: Box::new(v.visit_expr(&e.left)),
        op: e.op.clone(),
        right: Box::new(v.visit_expr(&e.right)),
    })
}

pub fn walk_prefix<V: ExprVisitor + ?Sized>(v: &mut V, e: &PrefixExpr) -> Expr {
    Expr::Prefix(PrefixExpr { op: e.op.clone(), args: walk_exprs(v, &e.args) })
}

pub fn walk_function<V: ExprVisitor + ?Sized>(v: &mut V, e: &FunctionExpr) -> Expr {
    Expr::Function(FunctionExpr { name: e.name.clone(), args: walk_exprs(v, &e.args) })
}

pub fn walk_select<V: ExprVisitor + ?Sized>(v: &mut V, c: &SelectCommand) -> SelectCommand {
    SelectCommand {
        columns: walk_exprs(v, &c.columns),
        group_by: walk_exprs(v, &c.group_by),
        order_by: c.order_by.iter().map(|ob| v.visit_order_by(ob)).collect(),
        from: c.from.as_ref().map(|f| Box::new(v.visit_expr(f))),
        where_clause: c.where_clause.as_ref().map(|w| Box::new(v.visit_expr(w))),
        limit: c.limit,
        sample_limit: c.sample_limit,
        is_distinct: c.is_distinct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;
    impl ExprVisitor for Identity {}

    #[test]
    fn test_identity_visitor_preserves_tree() {
        let expr = infix(
            function("lower", vec![column("message")]),
            "ILIKE",
            quoted_literal("%err%"),
        );
        let mut v = Identity;
        assert_eq!(v.visit_expr(&expr), expr);
    }

    #[test]
    fn test_and_fold() {
        assert_eq!(and(vec![]), None);
        let single = column("a");
        assert_eq!(and(vec![single.clone()]), Some(single));

        let folded = and(vec![column("a"), column("b"), column("c")]).unwrap();
        match folded {
            Expr::Infix(outer) => {
                assert_eq!(outer.op, "AND");
                assert!(matches!(*outer.right, Expr::ColumnRef(_)));
            }
            other => panic!("expected infix, got {:?}", other),
        }
    }

    #[test]
    fn test_used_columns_walks_nested_shapes() {
        let expr = function(
            "arrayExists",
            vec![
                lambda(vec!["x".into()], infix(literal("x"), "LIKE", quoted_literal("%a%"))),
                column("tags"),
            ],
        );
        let cols = used_columns(&expr);
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].column_name, "tags");
    }

    #[test]
    fn test_rewriting_visitor_only_touches_target() {
        struct RenameCol;
        impl ExprVisitor for RenameCol {
            fn visit_column_ref(&mut self, e: &ColumnRef) -> Expr {
                if e.column_name == "old" {
                    column("new")
                } else {
                    Expr::ColumnRef(e.clone())
                }
            }
        }
        let expr = infix(column("old"), "=", quoted_literal("v"));
        let mut v = RenameCol;
        let rewritten = v.visit_expr(&expr);
        assert_eq!(used_columns(&rewritten)[0].column_name, "new");
    }
}
