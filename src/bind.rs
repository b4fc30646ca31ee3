//! # SQL Predicate Assembly
//!
//! Building a feature query means assembling a `WHERE` clause from an
//! arbitrary combination of filters, each contributing a fragment and its
//! bind arguments. [`WhereClauseBuilder`] accumulates those fragments and
//! joins them with `AND`; [`BindArgument`] is the owned, typed value bound
//! to each `?` placeholder.
//!
//! The one piece of real policy here is [`WhereClauseBuilder::append_in`]:
//! given a list of string filters where `%` means wildcard, it partitions
//! the list into `LIKE` terms and a single `IN (...)` term, which keeps the
//! common no-wildcard case on the index.

use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::ToSql;

// =============================================================================
// BindArgument
// =============================================================================

/// An owned SQL bind value.
///
/// Implements [`rusqlite::ToSql`] so a `&[BindArgument]` slice can be handed
/// straight to `rusqlite` parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub enum BindArgument {
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl BindArgument {
    /// True for text arguments containing the `%` wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, BindArgument::Text(s) if s.contains('%'))
    }
}

impl ToSql for BindArgument {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            BindArgument::Null => ToSqlOutput::Owned(Value::Null),
            BindArgument::Int(v) => ToSqlOutput::Owned(Value::Integer(*v as i64)),
            BindArgument::Long(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            BindArgument::Double(v) => ToSqlOutput::Owned(Value::Real(*v)),
            BindArgument::Text(v) => ToSqlOutput::Borrowed(rusqlite::types::ValueRef::Text(
                v.as_bytes(),
            )),
            BindArgument::Blob(v) => {
                ToSqlOutput::Borrowed(rusqlite::types::ValueRef::Blob(v.as_slice()))
            }
        })
    }
}

impl From<i64> for BindArgument {
    fn from(v: i64) -> Self {
        BindArgument::Long(v)
    }
}

impl From<String> for BindArgument {
    fn from(v: String) -> Self {
        BindArgument::Text(v)
    }
}

impl From<&str> for BindArgument {
    fn from(v: &str) -> Self {
        BindArgument::Text(v.to_string())
    }
}

// =============================================================================
// WhereClauseBuilder
// =============================================================================

/// Accumulates `WHERE` clause fragments and their bind arguments.
///
/// Fragments added between calls to [`begin_condition`](Self::begin_condition)
/// belong to one condition; conditions are joined with ` AND ` when the final
/// selection string is requested. The joined string is cached and the cache
/// invalidated by any mutation.
#[derive(Debug, Default)]
pub struct WhereClauseBuilder {
    fragments: Vec<String>,
    args: Vec<BindArgument>,
    // None while a condition is open; set by begin_condition.
    needs_fragment: bool,
    cached: Option<String>,
}

impl WhereClauseBuilder {
    pub fn new() -> Self {
        Self {
            needs_fragment: true,
            ..Default::default()
        }
    }

    /// Starts a new condition. Subsequent `append` calls extend this
    /// condition until the next `begin_condition`.
    pub fn begin_condition(&mut self) {
        self.needs_fragment = true;
        self.cached = None;
    }

    /// Appends raw SQL text to the current condition.
    pub fn append(&mut self, sql: &str) {
        self.cached = None;
        if self.needs_fragment {
            self.fragments.push(String::new());
            self.needs_fragment = false;
        }
        // fragments is never empty here
        if let Some(last) = self.fragments.last_mut() {
            last.push_str(sql);
        }
    }

    /// Appends a bind argument for the most recent placeholder.
    pub fn add_arg(&mut self, arg: BindArgument) {
        self.args.push(arg);
    }

    /// Appends a filter over string column `col` matching any of `values`,
    /// where `%` in a value makes it a wildcard pattern.
    ///
    /// Wildcard values become `col LIKE ?` terms; the remainder collapses to
    /// a single `col IN (?, ...)` term. Terms are joined with ` OR ` and,
    /// when more than one is present, wrapped in parentheses so the fragment
    /// composes correctly under the outer `AND` join.
    pub fn append_in(&mut self, col: &str, values: &[String]) {
        let args: Vec<BindArgument> = values
            .iter()
            .map(|v| BindArgument::Text(v.clone()))
            .collect();
        self.append_in_args(col, args);
    }

    /// As [`append_in`](Self::append_in), over pre-built arguments. Non-text
    /// arguments always go to the `IN` term.
    pub fn append_in_args(&mut self, col: &str, values: Vec<BindArgument>) {
        let wildcards: Vec<&BindArgument> = values.iter().filter(|v| v.is_wildcard()).collect();
        let num_in = values.len() - wildcards.len();

        let mut terms: Vec<String> = Vec::new();
        for _ in &wildcards {
            terms.push(format!("{} LIKE ?", col));
        }
        match num_in {
            0 => {}
            1 => terms.push(format!("{} = ?", col)),
            n => {
                let marks = vec!["?"; n].join(", ");
                terms.push(format!("{} IN ({})", col, marks));
            }
        }

        if terms.is_empty() {
            // An empty value list matches nothing.
            self.append("1 = 0");
            return;
        }
        let fragment = if terms.len() > 1 {
            format!("({})", terms.join(" OR "))
        } else {
            terms.remove(0)
        };
        self.append(&fragment);

        // Arguments in emission order: wildcards first, then the IN values.
        let (wild, plain): (Vec<BindArgument>, Vec<BindArgument>) =
            values.into_iter().partition(|v| v.is_wildcard());
        self.args.extend(wild);
        self.args.extend(plain);
    }

    /// The accumulated `WHERE` clause body (no `WHERE` keyword), or `None`
    /// if no conditions were added.
    pub fn selection(&mut self) -> Option<&str> {
        if self.fragments.is_empty() {
            return None;
        }
        if self.cached.is_none() {
            self.cached = Some(self.fragments.join(" AND "));
        }
        self.cached.as_deref()
    }

    /// The bind arguments, in placeholder order.
    pub fn args(&self) -> &[BindArgument] {
        &self.args
    }

    /// Consumes the builder, returning the selection and arguments.
    pub fn into_parts(mut self) -> (Option<String>, Vec<BindArgument>) {
        let sel = self.selection().map(|s| s.to_string());
        (sel, self.args)
    }

    /// Resets to the empty state for reuse.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.args.clear();
        self.needs_fragment = true;
        self.cached = None;
    }
}
