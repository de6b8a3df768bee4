use serde::{Deserialize, Serialize};

/// A single column's filter value: equality against a scalar, or
/// disjunction (`IN (...)`) against a sequence — spec.md §4.1's filter
/// semantics exactly ("a value may be a single scalar ... or a sequence").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Eq(String),
    In(Vec<String>),
}

impl FilterValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            FilterValue::Eq(v) => vec![v.as_str()],
            FilterValue::In(vs) => vs.iter().map(|s| s.as_str()).collect(),
        }
    }
}

/// Conjunction of per-column filters, used by every Store listing method.
///
/// Deliberately a `Vec` of pairs rather than a `HashMap`: callers build these
/// by hand at call sites (two or three keys, typically `region` and `id`),
/// and a `Vec` keeps insertion order stable for building parameterized SQL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter(pub Vec<(String, FilterValue)>);

impl Filter {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((column.into(), FilterValue::Eq(value.into())));
        self
    }

    pub fn one_of(mut self, column: impl Into<String>, values: Vec<String>) -> Self {
        self.0.push((column.into(), FilterValue::In(values)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Renders `filter` as a `WHERE` clause (without the `WHERE` keyword) using
/// Postgres positional placeholders starting at `$1`, returning the clause
/// text and the flattened bind values in placeholder order.
///
/// Each column becomes `column = ANY(string_to_array($n, ','))` so both `Eq`
/// and `In` share one code path (`Eq` binds a one-element list) without
/// needing a typed array bind per column.
pub fn render_where(filter: &Filter) -> (String, Vec<String>) {
    if filter.is_empty() {
        return ("TRUE".to_string(), Vec::new());
    }

    let mut clauses = Vec::with_capacity(filter.0.len());
    let mut binds = Vec::with_capacity(filter.0.len());
    for (idx, (column, value)) in filter.0.iter().enumerate() {
        let placeholder = idx + 1;
        clauses.push(format!("{column} = ANY(string_to_array(${placeholder}, ','))"));
        binds.push(value.values().join(","));
    }
    (clauses.join(" AND "), binds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_is_true() {
        let (clause, binds) = render_where(&Filter::new());
        assert_eq!(clause, "TRUE");
        assert!(binds.is_empty());
    }

    #[test]
    fn conjoins_multiple_columns() {
        let filter = Filter::new()
            .eq("region", "us-west-1")
            .one_of("id", vec!["i-1".into(), "i-2".into()]);
        let (clause, binds) = render_where(&filter);
        assert_eq!(
            clause,
            "region = ANY(string_to_array($1, ',')) AND id = ANY(string_to_array($2, ','))"
        );
        assert_eq!(binds, vec!["us-west-1".to_string(), "i-1,i-2".to_string()]);
    }
}
