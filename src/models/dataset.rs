use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use super::connection::ConnectionDescriptor;

/// A reusable query or table reference against a data source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetDefinition {
    #[serde(default, alias = "query")]
    pub query_text: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    /// Known columns of the dataset, used as the identifier allow-list
    #[serde(default)]
    pub schema: Option<Vec<KnownColumn>>,
}

impl DatasetDefinition {
    pub fn from_table(table_name: impl Into<String>) -> Self {
        Self {
            table_name: Some(table_name.into()),
            ..Default::default()
        }
    }

    pub fn from_query(query_text: impl Into<String>) -> Self {
        Self {
            query_text: Some(query_text.into()),
            ..Default::default()
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema = Some(columns.into_iter().map(|c| KnownColumn::Name(c.into())).collect());
        self
    }

    /// Non-blank query text, if any
    pub fn query(&self) -> Option<&str> {
        self.query_text.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    /// Non-blank table name, if any
    pub fn table(&self) -> Option<&str> {
        self.table_name.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    pub fn known_columns(&self) -> Option<Vec<String>> {
        self.schema
            .as_ref()
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
    }
}

/// Either a bare column name or a stored schema entry with a `name`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KnownColumn {
    Name(String),
    Described { name: String },
}

impl KnownColumn {
    pub fn name(&self) -> &str {
        match self {
            KnownColumn::Name(name) => name,
            KnownColumn::Described { name } => name,
        }
    }
}

/// Comparison operators supported in filter clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    #[serde(alias = "=")]
    Eq,
    #[serde(alias = "!=")]
    Neq,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "IN")]
    In,
    #[serde(alias = "LIKE")]
    Like,
}

impl FilterOperator {
    pub fn sql(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Neq => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Lt => "<",
            FilterOperator::In => "IN",
            FilterOperator::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub column: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl FilterClause {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Count => "count",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sum" => Some(AggregateFunction::Sum),
            "avg" | "mean" => Some(AggregateFunction::Avg),
            "count" => Some(AggregateFunction::Count),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for AggregateFunction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        AggregateFunction::parse(&name).ok_or_else(|| {
            de::Error::custom(format!(
                "unsupported aggregation function '{}', expected one of sum, avg, count, min, max",
                name
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub column: String,
    pub function: AggregateFunction,
}

impl Metric {
    pub fn new(column: impl Into<String>, function: AggregateFunction) -> Self {
        Self {
            column: column.into(),
            function,
        }
    }

    /// Output column name, `<col>_<func>`
    pub fn alias(&self) -> String {
        format!("{}_{}", self.column, self.function.as_str())
    }
}

/// GROUP BY dimensions and aggregated metrics for chart data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// Accepts `{"amount": "sum"}` (order preserved) or `[{"column", "function"}]`
    #[serde(default, deserialize_with = "deserialize_metrics")]
    pub metrics: Vec<Metric>,
}

impl AggregationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimension(mut self, column: impl Into<String>) -> Self {
        self.dimensions.push(column.into());
        self
    }

    pub fn metric(mut self, column: impl Into<String>, function: AggregateFunction) -> Self {
        self.metrics.push(Metric::new(column, function));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty() && self.metrics.is_empty()
    }

    /// Output column names in SELECT order
    pub fn output_columns(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .cloned()
            .chain(self.metrics.iter().map(Metric::alias))
            .collect()
    }
}

fn deserialize_metrics<'de, D>(deserializer: D) -> Result<Vec<Metric>, D::Error>
where
    D: Deserializer<'de>,
{
    struct MetricsVisitor;

    impl<'de> Visitor<'de> for MetricsVisitor {
        type Value = Vec<Metric>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of column to aggregation function, or a list of metrics")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut metrics = Vec::new();
            while let Some((column, function)) = map.next_entry::<String, AggregateFunction>()? {
                metrics.push(Metric::new(column, function));
            }
            Ok(metrics)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut metrics = Vec::new();
            while let Some(metric) = seq.next_element::<Metric>()? {
                metrics.push(metric);
            }
            Ok(metrics)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(MetricsVisitor)
}

/// Inbound preview/query request from the orchestration layer
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetQueryRequest {
    pub source: ConnectionDescriptor,
    pub dataset: DatasetDefinition,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub aggregation: Option<AggregationSpec>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metrics_map_preserves_order() {
        let spec: AggregationSpec = serde_json::from_value(json!({
            "dimensions": ["region", "month"],
            "metrics": {"revenue": "sum", "orders": "COUNT", "price": "avg"}
        }))
        .unwrap();
        let names: Vec<String> = spec.metrics.iter().map(Metric::alias).collect();
        assert_eq!(names, vec!["revenue_sum", "orders_count", "price_avg"]);
        assert_eq!(spec.dimensions, vec!["region", "month"]);
    }

    #[test]
    fn test_metrics_list_form() {
        let spec: AggregationSpec = serde_json::from_value(json!({
            "metrics": [{"column": "amount", "function": "max"}]
        }))
        .unwrap();
        assert_eq!(spec.metrics, vec![Metric::new("amount", AggregateFunction::Max)]);
        assert!(spec.dimensions.is_empty());
    }

    #[test]
    fn test_unknown_function_rejected() {
        let result: Result<AggregationSpec, _> =
            serde_json::from_value(json!({"metrics": {"amount": "median"}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_operator_aliases() {
        let clause: FilterClause =
            serde_json::from_value(json!({"column": "a", "operator": "!=", "value": 3})).unwrap();
        assert_eq!(clause.operator, FilterOperator::Neq);
        let clause: FilterClause =
            serde_json::from_value(json!({"column": "a", "operator": "like", "value": "x%"})).unwrap();
        assert_eq!(clause.operator.sql(), "LIKE");
    }

    #[test]
    fn test_definition_accessors() {
        let def: DatasetDefinition = serde_json::from_value(json!({
            "query": "  ",
            "table_name": "orders",
            "schema": ["id", {"name": "status", "type": "string"}]
        }))
        .unwrap();
        assert_eq!(def.query(), None);
        assert_eq!(def.table(), Some("orders"));
        assert_eq!(def.known_columns(), Some(vec!["id".to_string(), "status".to_string()]));
    }
}
