// Query Builder
//
// Assembles a bounded, parameterized SELECT from a dataset definition, a
// filter list and an optional aggregation. Values are only ever bound as
// parameters; identifiers are checked against their shape and the dataset's
// column allow-list before they reach the statement text.

use serde_json::Value;
use sqlparser::dialect::{Dialect, GenericDialect};
use std::collections::BTreeMap;

use crate::api::middleware::AppError;
use crate::models::{AggregationSpec, DatasetDefinition, FilterClause, FilterOperator};
use crate::validation::SqlValidator;

pub const DEFAULT_PREVIEW_LIMIT: u64 = 100;
pub const MAX_LIMIT: u64 = 1000;

/// Clamp a caller-supplied row limit into `1..=max`, falling back to `default`
pub fn clamp_limit(requested: Option<u64>, default: u64, max: u64) -> u64 {
    requested.unwrap_or(default).clamp(1, max.max(1))
}

/// Where the statement reads from
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    Table(String),
    /// Validated, read-only query text wrapped as `(...) AS subq`
    Subquery(String),
}

impl QuerySource {
    /// Statement that yields the source's columns and no rows
    pub fn probe_sql(&self, style: PlaceholderStyle) -> String {
        match self {
            QuerySource::Table(table) => format!("SELECT * FROM {} LIMIT 0", style.quote_path(table)),
            QuerySource::Subquery(query) => format!("SELECT * FROM ({}) AS subq LIMIT 0", query),
        }
    }
}

/// Placeholder and identifier-quoting syntax understood by a target engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1, $2, ...` and `"ident"` (PostgreSQL, DataFusion)
    Dollar,
    /// `?` and `` `ident` `` (MySQL)
    Question,
}

impl PlaceholderStyle {
    /// Quote an identifier so case and reserved words survive
    pub fn quote(self, ident: &str) -> String {
        match self {
            PlaceholderStyle::Dollar => format!("\"{}\"", ident.replace('"', "\"\"")),
            PlaceholderStyle::Question => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// Quote each part of a dotted name
    pub fn quote_path(self, path: &str) -> String {
        path.split('.').map(|part| self.quote(part)).collect::<Vec<_>>().join(".")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Sql(String),
    /// Column, alias or table name; quoted on render
    Ident(String),
    Param(usize),
    Limit,
}

/// Accumulates statement text into segments
#[derive(Default)]
struct SegmentWriter {
    segments: Vec<Segment>,
    sql: String,
}

impl SegmentWriter {
    fn sql(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn ident(&mut self, name: &str) {
        self.flush();
        self.segments.push(Segment::Ident(name.to_string()));
    }

    fn path(&mut self, path: &str) {
        for (idx, part) in path.split('.').enumerate() {
            if idx > 0 {
                self.sql(".");
            }
            self.ident(part);
        }
    }

    fn param(&mut self, idx: usize) {
        self.flush();
        self.segments.push(Segment::Param(idx));
    }

    fn finish_with_limit(mut self) -> Vec<Segment> {
        self.sql(" LIMIT ");
        self.flush();
        self.segments.push(Segment::Limit);
        self.segments
    }

    fn flush(&mut self) {
        if !self.sql.is_empty() {
            self.segments.push(Segment::Sql(std::mem::take(&mut self.sql)));
        }
    }
}

/// Statement text plus positional values, ready for one engine
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Output of the builder: canonical statement, bound values and the
/// structured plan used by in-process execution
#[derive(Debug, Clone)]
pub struct BuiltQuery {
    segments: Vec<Segment>,
    params: Vec<(String, Value)>,
    limit: u64,
    source: QuerySource,
    filters: Vec<FilterClause>,
    aggregation: Option<AggregationSpec>,
}

impl BuiltQuery {
    /// Canonical text with `:param_<i>` placeholders
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Sql(sql) => sql.clone(),
                Segment::Ident(name) => name.clone(),
                Segment::Param(idx) => match &self.params[*idx].1 {
                    Value::Array(_) => format!("(:{})", self.params[*idx].0),
                    _ => format!(":{}", self.params[*idx].0),
                },
                Segment::Limit => self.limit.to_string(),
            })
            .collect()
    }

    /// Bound values keyed by placeholder name
    pub fn bound_params(&self) -> BTreeMap<String, Value> {
        self.params.iter().cloned().collect()
    }

    pub fn params(&self) -> &[(String, Value)] {
        &self.params
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    pub fn filters(&self) -> &[FilterClause] {
        &self.filters
    }

    pub fn aggregation(&self) -> Option<&AggregationSpec> {
        self.aggregation.as_ref()
    }

    /// Render for an engine. The limit is raised by one so the executor can
    /// tell whether more rows were available than returned; IN lists expand
    /// to one placeholder per element.
    pub fn render(&self, style: PlaceholderStyle) -> RenderedQuery {
        self.render_with_casts(style, &[])
    }

    /// Render with an explicit `::type` cast after the placeholders whose
    /// rendered position has one in `casts`
    pub fn render_with_casts(&self, style: PlaceholderStyle, casts: &[Option<&str>]) -> RenderedQuery {
        let mut sql = String::new();
        let mut params = Vec::with_capacity(self.params.len());
        let bind = |value: &Value, params: &mut Vec<Value>| {
            params.push(value.clone());
            let position = params.len();
            match casts.get(position - 1).copied().flatten() {
                Some(cast) => format!("{}::{}", placeholder(style, position), cast),
                None => placeholder(style, position),
            }
        };

        for segment in &self.segments {
            match segment {
                Segment::Sql(text) => sql.push_str(text),
                Segment::Ident(name) => sql.push_str(&style.quote(name)),
                Segment::Param(idx) => match &self.params[*idx].1 {
                    Value::Array(items) if items.is_empty() => sql.push_str("(NULL)"),
                    Value::Array(items) => {
                        let placeholders: Vec<String> = items.iter().map(|item| bind(item, &mut params)).collect();
                        sql.push('(');
                        sql.push_str(&placeholders.join(", "));
                        sql.push(')');
                    }
                    value => {
                        let rendered = bind(value, &mut params);
                        sql.push_str(&rendered);
                    }
                },
                Segment::Limit => sql.push_str(&(self.limit + 1).to_string()),
            }
        }

        RenderedQuery { sql, params }
    }
}

fn placeholder(style: PlaceholderStyle, position: usize) -> String {
    match style {
        PlaceholderStyle::Dollar => format!("${}", position),
        PlaceholderStyle::Question => "?".to_string(),
    }
}

pub struct QueryBuilder {
    dialect: Box<dyn Dialect + Send + Sync>,
    allowed_columns: Option<Vec<String>>,
    limit: u64,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self {
            dialect: Box::new(GenericDialect {}),
            allowed_columns: None,
            limit: DEFAULT_PREVIEW_LIMIT,
        }
    }

    /// Dialect used to validate query text
    pub fn with_dialect(mut self, dialect: Box<dyn Dialect + Send + Sync>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Column allow-list; takes precedence over the definition's schema
    pub fn with_allowed_columns(mut self, columns: Vec<String>) -> Self {
        self.allowed_columns = Some(columns);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn build(
        &self,
        definition: &DatasetDefinition,
        filters: &[FilterClause],
        aggregation: Option<&AggregationSpec>,
    ) -> Result<BuiltQuery, AppError> {
        let source = self.resolve_source(definition)?;
        let allowed = self
            .allowed_columns
            .clone()
            .or_else(|| definition.known_columns());
        let allowed = allowed.as_deref();

        let mut out = SegmentWriter::default();
        out.sql("SELECT ");
        match aggregation {
            Some(spec) => {
                if spec.is_empty() {
                    return Err(AppError::EmptyAggregation(
                        "Aggregation needs at least one dimension or metric".to_string(),
                    ));
                }
                let mut first = true;
                for dimension in &spec.dimensions {
                    SqlValidator::validate_column(dimension, allowed)?;
                    if !std::mem::take(&mut first) {
                        out.sql(", ");
                    }
                    out.ident(dimension);
                }
                for metric in &spec.metrics {
                    SqlValidator::validate_column(&metric.column, allowed)?;
                    if !std::mem::take(&mut first) {
                        out.sql(", ");
                    }
                    out.sql(metric.function.as_str());
                    out.sql("(");
                    out.ident(&metric.column);
                    out.sql(") AS ");
                    out.ident(&metric.alias());
                }
            }
            None => out.sql("*"),
        }

        out.sql(" FROM ");
        match &source {
            QuerySource::Table(table) => out.path(table),
            QuerySource::Subquery(query) => {
                out.sql("(");
                out.sql(query);
                out.sql(") AS subq");
            }
        }

        let mut params = Vec::with_capacity(filters.len());
        for (idx, filter) in filters.iter().enumerate() {
            SqlValidator::validate_column(&filter.column, allowed)?;
            out.sql(if idx == 0 { " WHERE " } else { " AND " });
            out.ident(&filter.column);
            out.sql(" ");
            out.sql(filter.operator.sql());
            out.sql(" ");
            out.param(idx);
            params.push((format!("param_{}", idx), filter_value(filter)?));
        }

        if let Some(spec) = aggregation.filter(|spec| !spec.dimensions.is_empty()) {
            out.sql(" GROUP BY ");
            for (idx, dimension) in spec.dimensions.iter().enumerate() {
                if idx > 0 {
                    out.sql(", ");
                }
                out.ident(dimension);
            }
        }
        let segments = out.finish_with_limit();

        let built = BuiltQuery {
            segments,
            params,
            limit: self.limit,
            source,
            filters: filters.to_vec(),
            aggregation: aggregation.cloned(),
        };
        tracing::debug!("Built query: {}", built.text());
        Ok(built)
    }

    /// Validate and resolve what a definition reads from
    pub fn resolve_source(&self, definition: &DatasetDefinition) -> Result<QuerySource, AppError> {
        if let Some(query) = definition.query() {
            let validated = SqlValidator::validate_select_only(query, self.dialect.as_ref())?;
            return Ok(QuerySource::Subquery(validated));
        }
        if let Some(table) = definition.table() {
            SqlValidator::validate_table_name(table)?;
            return Ok(QuerySource::Table(table.to_string()));
        }
        Err(AppError::InvalidDatasetDefinition(
            "Dataset must define either a query or a table name".to_string(),
        ))
    }
}

/// IN takes a list (a scalar becomes a one-element list); other operators
/// take a scalar
fn filter_value(filter: &FilterClause) -> Result<Value, AppError> {
    match (filter.operator, &filter.value) {
        (FilterOperator::In, Value::Array(_)) => Ok(filter.value.clone()),
        (FilterOperator::In, scalar) => Ok(Value::Array(vec![scalar.clone()])),
        (_, Value::Array(_) | Value::Object(_)) => Err(AppError::Validation(format!(
            "Filter on '{}' with operator {} needs a scalar value",
            filter.column,
            filter.operator.sql()
        ))),
        (_, scalar) => Ok(scalar.clone()),
    }
}

/// Build with default settings, using the definition's schema as allow-list
pub fn build(
    definition: &DatasetDefinition,
    filters: &[FilterClause],
    aggregation: Option<&AggregationSpec>,
) -> Result<BuiltQuery, AppError> {
    QueryBuilder::new().build(definition, filters, aggregation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AggregateFunction;
    use serde_json::json;

    #[test]
    fn test_filter_on_table() {
        let query = build(
            &DatasetDefinition::from_table("orders"),
            &[FilterClause::new("status", FilterOperator::Eq, "shipped")],
            None,
        )
        .unwrap();
        assert_eq!(query.text(), "SELECT * FROM orders WHERE status = :param_0 LIMIT 100");
        assert_eq!(
            query.bound_params(),
            BTreeMap::from([("param_0".to_string(), json!("shipped"))])
        );
    }

    #[test]
    fn test_aggregation_on_table() {
        let aggregation = AggregationSpec::new()
            .dimension("region")
            .metric("amount", AggregateFunction::Sum);
        let query = build(&DatasetDefinition::from_table("orders"), &[], Some(&aggregation)).unwrap();
        assert_eq!(
            query.text(),
            "SELECT region, sum(amount) AS amount_sum FROM orders GROUP BY region LIMIT 100"
        );
        assert!(query.bound_params().is_empty());
    }

    #[test]
    fn test_metrics_only_has_no_group_by() {
        let aggregation = AggregationSpec::new()
            .metric("amount", AggregateFunction::Avg)
            .metric("id", AggregateFunction::Count);
        let query = build(
            &DatasetDefinition::from_table("orders"),
            &[FilterClause::new("region", FilterOperator::Neq, "north")],
            Some(&aggregation),
        )
        .unwrap();
        assert_eq!(
            query.text(),
            "SELECT avg(amount) AS amount_avg, count(id) AS id_count FROM orders WHERE region != :param_0 LIMIT 100"
        );
    }

    #[test]
    fn test_query_text_wrapped_as_subquery() {
        let query = build(
            &DatasetDefinition::from_query("SELECT id, total FROM sales;"),
            &[
                FilterClause::new("total", FilterOperator::Gt, 10),
                FilterClause::new("id", FilterOperator::Lt, 99),
            ],
            None,
        )
        .unwrap();
        assert_eq!(
            query.text(),
            "SELECT * FROM (SELECT id, total FROM sales) AS subq WHERE total > :param_0 AND id < :param_1 LIMIT 100"
        );
        assert_eq!(
            query.source(),
            &QuerySource::Subquery("SELECT id, total FROM sales".to_string())
        );
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(matches!(
            build(&DatasetDefinition::default(), &[], None),
            Err(AppError::InvalidDatasetDefinition(_))
        ));
        assert!(matches!(
            build(&DatasetDefinition::from_table("   "), &[], None),
            Err(AppError::InvalidDatasetDefinition(_))
        ));
        assert!(matches!(
            build(&DatasetDefinition::from_query("DELETE FROM x"), &[], None),
            Err(AppError::NonSelectQuery(_))
        ));
        assert!(matches!(
            build(&DatasetDefinition::from_table("orders"), &[], Some(&AggregationSpec::new())),
            Err(AppError::EmptyAggregation(_))
        ));
    }

    #[test]
    fn test_identifiers_fail_closed() {
        let definition = DatasetDefinition::from_table("orders").with_columns(["status", "region"]);
        let injected = FilterClause::new("status = 'x' OR 1=1 --", FilterOperator::Eq, "y");
        assert!(matches!(
            build(&definition, &[injected], None),
            Err(AppError::InvalidColumnReference(_))
        ));

        let unknown = FilterClause::new("amount", FilterOperator::Gt, 1);
        assert!(matches!(
            build(&definition, &[unknown], None),
            Err(AppError::InvalidColumnReference(_))
        ));

        assert!(matches!(
            build(&DatasetDefinition::from_table("orders; DROP TABLE orders"), &[], None),
            Err(AppError::InvalidColumnReference(_))
        ));
    }

    #[test]
    fn test_render_styles() {
        let query = QueryBuilder::new()
            .with_limit(25)
            .build(
                &DatasetDefinition::from_table("orders"),
                &[
                    FilterClause::new("region", FilterOperator::In, json!(["north", "south"])),
                    FilterClause::new("status", FilterOperator::Like, "ship%"),
                ],
                None,
            )
            .unwrap();

        assert_eq!(
            query.text(),
            "SELECT * FROM orders WHERE region IN (:param_0) AND status LIKE :param_1 LIMIT 25"
        );

        let pg = query.render(PlaceholderStyle::Dollar);
        assert_eq!(
            pg.sql,
            r#"SELECT * FROM "orders" WHERE "region" IN ($1, $2) AND "status" LIKE $3 LIMIT 26"#
        );
        assert_eq!(pg.params, vec![json!("north"), json!("south"), json!("ship%")]);

        let mysql = query.render(PlaceholderStyle::Question);
        assert_eq!(
            mysql.sql,
            "SELECT * FROM `orders` WHERE `region` IN (?, ?) AND `status` LIKE ? LIMIT 26"
        );
    }

    #[test]
    fn test_in_edge_cases() {
        let empty = build(
            &DatasetDefinition::from_table("orders"),
            &[FilterClause::new("id", FilterOperator::In, json!([]))],
            None,
        )
        .unwrap();
        assert_eq!(
            empty.render(PlaceholderStyle::Dollar).sql,
            r#"SELECT * FROM "orders" WHERE "id" IN (NULL) LIMIT 101"#
        );

        let scalar = build(
            &DatasetDefinition::from_table("orders"),
            &[FilterClause::new("id", FilterOperator::In, 7)],
            None,
        )
        .unwrap();
        assert_eq!(scalar.bound_params()["param_0"], json!([7]));

        assert!(matches!(
            build(
                &DatasetDefinition::from_table("orders"),
                &[FilterClause::new("id", FilterOperator::Eq, json!([1, 2]))],
                None,
            ),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_identifiers_quoted_per_engine() {
        let aggregation = AggregationSpec::new()
            .dimension("Region")
            .metric("order", AggregateFunction::Sum);
        let query = build(&DatasetDefinition::from_table("public.Sales"), &[], Some(&aggregation)).unwrap();

        assert_eq!(
            query.render(PlaceholderStyle::Dollar).sql,
            r#"SELECT "Region", sum("order") AS "order_sum" FROM "public"."Sales" GROUP BY "Region" LIMIT 101"#
        );
        assert_eq!(
            query.render(PlaceholderStyle::Question).sql,
            "SELECT `Region`, sum(`order`) AS `order_sum` FROM `public`.`Sales` GROUP BY `Region` LIMIT 101"
        );
        assert_eq!(
            QuerySource::Table("public.Sales".into()).probe_sql(PlaceholderStyle::Dollar),
            r#"SELECT * FROM "public"."Sales" LIMIT 0"#
        );
    }

    #[test]
    fn test_render_with_casts() {
        let query = build(
            &DatasetDefinition::from_table("orders"),
            &[
                FilterClause::new("status", FilterOperator::Eq, "shipped"),
                FilterClause::new("amount", FilterOperator::Gt, 10.5),
            ],
            None,
        )
        .unwrap();
        let rendered = query.render_with_casts(PlaceholderStyle::Dollar, &[None, Some("float8")]);
        assert_eq!(
            rendered.sql,
            r#"SELECT * FROM "orders" WHERE "status" = $1 AND "amount" > $2::float8 LIMIT 101"#
        );
        assert_eq!(rendered.params, vec![json!("shipped"), json!(10.5)]);
    }

    #[test]
    fn test_query_text_with_trailing_comment() {
        let query = build(
            &DatasetDefinition::from_query("SELECT id FROM sales -- recent only"),
            &[],
            None,
        )
        .unwrap();
        assert_eq!(query.text(), "SELECT * FROM (SELECT id FROM sales) AS subq LIMIT 100");
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, DEFAULT_PREVIEW_LIMIT, MAX_LIMIT), 100);
        assert_eq!(clamp_limit(Some(5000), DEFAULT_PREVIEW_LIMIT, MAX_LIMIT), 1000);
        assert_eq!(clamp_limit(Some(0), DEFAULT_PREVIEW_LIMIT, MAX_LIMIT), 1);
        assert_eq!(clamp_limit(Some(250), DEFAULT_PREVIEW_LIMIT, MAX_LIMIT), 250);
    }
}
