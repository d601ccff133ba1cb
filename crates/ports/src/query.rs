//! 查询塑形
//!
//! [`Selection`] 是值类型的查询描述；[`Navigation`] 是作用于它的纯函数，
//! 可组合，不修改基础查询。

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

/// 过滤条件
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    Like {
        column: String,
        pattern: String,
    },
    IsNull(String),
    IsNotNull(String),
    InList {
        column: String,
        values: Vec<Value>,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ge, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Le, value)
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Condition::Like {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Condition::IsNotNull(column.into())
    }

    pub fn in_list<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Condition::InList {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::And(mut all) => {
                all.push(other);
                Condition::And(all)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut any) => {
                any.push(other);
                Condition::Or(any)
            }
            first => Condition::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// 条件引用的全部列名
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Compare { column, .. }
            | Condition::Like { column, .. }
            | Condition::InList { column, .. } => out.push(column),
            Condition::IsNull(column) | Condition::IsNotNull(column) => out.push(column),
            Condition::And(items) | Condition::Or(items) => {
                for item in items {
                    item.collect_columns(out);
                }
            }
            Condition::Not(inner) => inner.collect_columns(out),
        }
    }
}

/// 排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// 查询描述
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    conditions: Vec<Condition>,
    ordering: Vec<(String, SortDirection)>,
    limit: Option<u64>,
    offset: Option<u64>,
    tracking: bool,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            offset: None,
            tracking: true,
        }
    }
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加过滤条件（多个条件之间为 AND）
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.ordering.push((column.into(), direction));
        self
    }

    pub fn order_asc(self, column: impl Into<String>) -> Self {
        self.order_by(column, SortDirection::Asc)
    }

    pub fn order_desc(self, column: impl Into<String>) -> Self {
        self.order_by(column, SortDirection::Desc)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// 查询结果不附加到变更跟踪器
    pub fn no_tracking(mut self) -> Self {
        self.tracking = false;
        self
    }

    /// 去掉 limit / offset，用于统计总数
    pub fn without_paging(mut self) -> Self {
        self.limit = None;
        self.offset = None;
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn ordering(&self) -> &[(String, SortDirection)] {
        &self.ordering
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// 查询引用的全部列名（条件与排序）
    pub fn columns(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .flat_map(Condition::columns)
            .chain(self.ordering.iter().map(|(c, _)| c.as_str()))
            .collect()
    }
}

type Shape = dyn Fn(Selection) -> Selection + Send + Sync;

/// 查询塑形函数
#[derive(Clone)]
pub struct Navigation(Arc<Shape>);

impl Navigation {
    pub fn new(shape: impl Fn(Selection) -> Selection + Send + Sync + 'static) -> Self {
        Self(Arc::new(shape))
    }

    /// 仅追加一个过滤条件
    pub fn filter(condition: Condition) -> Self {
        Self::new(move |s| s.filter(condition.clone()))
    }

    pub fn apply(&self, selection: Selection) -> Selection {
        (self.0)(selection)
    }

    /// 先应用 `self` 再应用 `next`
    pub fn then(&self, next: &Navigation) -> Navigation {
        let first = Arc::clone(&self.0);
        let second = Arc::clone(&next.0);
        Self(Arc::new(move |s| second(first(s))))
    }
}

impl fmt::Debug for Navigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Navigation(..)")
    }
}

/// 将可选塑形函数应用到基础查询
pub fn shape(navigation: Option<&Navigation>) -> Selection {
    match navigation {
        Some(nav) => nav.apply(Selection::new()),
        None => Selection::new(),
    }
}
