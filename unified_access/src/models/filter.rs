//! Filtering, ordering and the list query wire form

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::schema::{FieldType, ModelSchema};

/// Query parameter names reserved by the list protocol
pub const RESERVED_PARAMS: &[&str] = &[
    "cursor",
    "limit",
    "order_by",
    "search",
    "id__in",
    "created_at__gte",
    "created_at__lt",
    "updated_at__gte",
    "updated_at__lt",
];

/// What a model allows callers to filter, search and sort by.
///
/// Empty `filterable` / `searchable` lists mean "derive from the schema":
/// every field is filterable and every string field is searchable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub filterable: Vec<String>,
    pub searchable: Vec<String>,
    /// Attribute fields usable in `order_by`, besides `created_at` / `updated_at`
    pub sortable: Vec<String>,
}

impl FilterSpec {
    pub fn sortable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sortable = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn searchable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.searchable = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Fill in schema-derived defaults
    pub fn resolve(mut self, schema: &ModelSchema) -> Self {
        if self.filterable.is_empty() {
            self.filterable = schema.fields().map(|f| f.name.clone()).collect();
        }
        if self.searchable.is_empty() {
            self.searchable = schema
                .fields()
                .filter(|f| f.field_type == FieldType::String)
                .map(|f| f.name.clone())
                .collect();
        }
        self
    }

    /// Check every listed field exists and sortable fields can back a cursor
    pub fn validate(&self, model: &str, schema: &ModelSchema) -> Result<()> {
        for name in self.filterable.iter().chain(&self.searchable) {
            if schema.get(name).is_none() {
                return Err(Error::ConfigurationError(format!(
                    "filter spec of '{}' names unknown field '{}'",
                    model, name
                )));
            }
        }
        for name in &self.searchable {
            if schema.get(name).map(|f| &f.field_type) != Some(&FieldType::String) {
                return Err(Error::ConfigurationError(format!(
                    "searchable field '{}.{}' must be a string",
                    model, name
                )));
            }
        }
        for name in &self.sortable {
            match schema.get(name) {
                Some(field) if !field.nullable && field.field_type.is_sortable() => {}
                Some(_) => {
                    return Err(Error::ConfigurationError(format!(
                        "sortable field '{}.{}' must be a non-nullable scalar",
                        model, name
                    )))
                }
                None => {
                    return Err(Error::ConfigurationError(format!(
                        "filter spec of '{}' names unknown field '{}'",
                        model, name
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn can_sort_by(&self, field: &str) -> bool {
        field == "created_at" || field == "updated_at" || self.sortable.iter().any(|f| f == field)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Sort key of a list operation; ties are always broken by record id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Desc,
        }
    }
}

impl Default for OrderBy {
    fn default() -> Self {
        Self::asc("created_at")
    }
}

/// `name` is ascending, `-name` descending
impl FromStr for OrderBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (field, direction) = match s.strip_prefix('-') {
            Some(rest) => (rest, Direction::Desc),
            None => (s, Direction::Asc),
        };
        if field.is_empty() {
            return Err(Error::Validation("empty order_by".to_string()));
        }
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Asc => write!(f, "{}", self.field),
            Direction::Desc => write!(f, "-{}", self.field),
        }
    }
}

/// Row filter of a list operation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    /// Attribute equality; a JSON null matches missing or null values
    pub eq: BTreeMap<String, Value>,
    pub id_in: Option<Vec<Uuid>>,
    pub created_at_gte: Option<DateTime<Utc>>,
    pub created_at_lt: Option<DateTime<Utc>>,
    pub updated_at_gte: Option<DateTime<Utc>>,
    pub updated_at_lt: Option<DateTime<Utc>>,
    /// Case-insensitive substring match over the searchable fields
    pub search: Option<String>,
}

impl ListFilter {
    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.eq.insert(field.to_string(), value);
        self
    }

    pub fn search(mut self, term: &str) -> Self {
        self.search = Some(term.to_string());
        self
    }
}

/// Arguments of a list operation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub filter: ListFilter,
    pub cursor: Option<String>,
    /// `None` means the configured default page size
    pub limit: Option<u32>,
    pub order: OrderBy,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order = order;
        self
    }

    pub fn filter(mut self, filter: ListFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Encode as URL query pairs
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(cursor) = &self.cursor {
            pairs.push(("cursor".to_string(), cursor.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs.push(("order_by".to_string(), self.order.to_string()));

        let f = &self.filter;
        if let Some(search) = &f.search {
            pairs.push(("search".to_string(), search.clone()));
        }
        if let Some(ids) = &f.id_in {
            let joined = ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",");
            pairs.push(("id__in".to_string(), joined));
        }
        for (name, ts) in [
            ("created_at__gte", &f.created_at_gte),
            ("created_at__lt", &f.created_at_lt),
            ("updated_at__gte", &f.updated_at_gte),
            ("updated_at__lt", &f.updated_at_lt),
        ] {
            if let Some(ts) = ts {
                pairs.push((name.to_string(), ts.to_rfc3339()));
            }
        }
        for (field, value) in &f.eq {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pairs.push((field.clone(), text));
        }
        pairs
    }

    /// Decode URL query pairs; attribute filters are typed through the schema
    pub fn from_query_pairs<'a, I>(pairs: I, schema: &ModelSchema) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut query = ListQuery::new();
        for (key, value) in pairs {
            match key {
                "cursor" => query.cursor = Some(value.to_string()),
                "limit" => {
                    query.limit = Some(value.parse().map_err(|_| {
                        Error::Validation(format!("invalid limit '{}'", value))
                    })?)
                }
                "order_by" => query.order = value.parse()?,
                "search" => query.filter.search = Some(value.to_string()),
                "id__in" => {
                    let ids = value
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| {
                            Uuid::parse_str(s)
                                .map_err(|_| Error::Validation(format!("invalid id '{}'", s)))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    query.filter.id_in = Some(ids);
                }
                "created_at__gte" => query.filter.created_at_gte = Some(parse_timestamp(value)?),
                "created_at__lt" => query.filter.created_at_lt = Some(parse_timestamp(value)?),
                "updated_at__gte" => query.filter.updated_at_gte = Some(parse_timestamp(value)?),
                "updated_at__lt" => query.filter.updated_at_lt = Some(parse_timestamp(value)?),
                field => {
                    let definition = schema.get(field).ok_or_else(|| {
                        Error::Validation(format!("unknown filter field '{}'", field))
                    })?;
                    let typed = match definition.field_type {
                        FieldType::String
                        | FieldType::Uuid
                        | FieldType::DateTime
                        | FieldType::Reference(_)
                            if value != "null" =>
                        {
                            Value::String(value.to_string())
                        }
                        _ => serde_json::from_str(value).map_err(|_| {
                            Error::Validation(format!("invalid value for '{}': {}", field, value))
                        })?,
                    };
                    query.filter.eq.insert(field.to_string(), typed);
                }
            }
        }
        Ok(query)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| Error::Validation(format!("invalid timestamp '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::FieldDefinition;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn schema() -> ModelSchema {
        ModelSchema::new()
            .field(FieldDefinition::new("name", FieldType::String))
            .field(FieldDefinition::new("price", FieldType::Float))
            .field(FieldDefinition::new("active", FieldType::Boolean))
            .field(FieldDefinition::new("meta", FieldType::Json).nullable(true))
    }

    #[rstest]
    #[case("name", OrderBy::asc("name"))]
    #[case("-price", OrderBy::desc("price"))]
    #[case("-created_at", OrderBy::desc("created_at"))]
    fn order_by_parses_prefix(#[case] input: &str, #[case] expected: OrderBy) {
        let parsed: OrderBy = input.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), input);
    }

    #[test]
    fn query_pairs_keep_types_through_the_schema() {
        let query = ListQuery::new()
            .limit(10)
            .order(OrderBy::desc("price"))
            .filter(
                ListFilter::default()
                    .eq("name", json!("12"))
                    .eq("price", json!(12.5))
                    .eq("active", json!(false))
                    .search("wid"),
            );

        let pairs = query.to_query_pairs();
        let decoded = ListQuery::from_query_pairs(
            pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &schema(),
        )
        .unwrap();

        assert_eq!(decoded, query);
    }

    #[test]
    fn unknown_filter_fields_are_rejected() {
        let err = ListQuery::from_query_pairs([("colour", "red")], &schema()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn spec_validation_rejects_nullable_sort_keys() {
        let spec = FilterSpec::default().sortable(["meta"]);
        assert!(spec.validate("product", &schema()).is_err());

        let spec = FilterSpec::default().sortable(["price"]).resolve(&schema());
        spec.validate("product", &schema()).unwrap();
        assert_eq!(spec.searchable, vec!["name".to_string()]);
        assert!(spec.can_sort_by("price"));
        assert!(spec.can_sort_by("created_at"));
        assert!(!spec.can_sort_by("name"));
    }
}
