//! PostgREST client for table access and RPCs.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use shared::Collection;
use tasklist_sync::{Direction, Filter, Query, StoreError};

const PREFER_RETURN: &str = "return=representation";
const PREFER_UPSERT: &str = "return=representation,resolution=merge-duplicates";

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    token: Option<String>,
}

/// Error body returned by PostgREST
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl RestClient {
    pub fn new(base_url: &str, anon_key: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            token,
        }
    }

    fn table_url(&self, collection: Collection) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let bearer = self.token.as_deref().unwrap_or(&self.anon_key);
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, StoreError> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(StoreError::Unauthenticated);
        }
        if !status.is_success() {
            return Err(rejection(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Value>, StoreError> {
        let request = self
            .request(Method::GET, self.table_url(collection))
            .query(&query_params(query));
        rows(self.send(request).await?)
    }

    pub async fn insert(&self, collection: Collection, body: Value, upsert: bool) -> Result<Vec<Value>, StoreError> {
        let request = self
            .request(Method::POST, self.table_url(collection))
            .header("Prefer", if upsert { PREFER_UPSERT } else { PREFER_RETURN })
            .json(&body);
        rows(self.send(request).await?)
    }

    pub async fn update(&self, collection: Collection, filters: &[Filter], patch: Value) -> Result<(), StoreError> {
        let request = self
            .request(Method::PATCH, self.table_url(collection))
            .query(&filter_params(filters))
            .json(&patch);
        self.send(request).await.map(|_| ())
    }

    pub async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<(), StoreError> {
        let request = self
            .request(Method::DELETE, self.table_url(collection))
            .query(&filter_params(filters));
        self.send(request).await.map(|_| ())
    }

    pub async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, name);
        let request = self.request(Method::POST, url).json(&args);
        self.send(request).await
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

fn rejection(status: StatusCode, body: &str) -> StoreError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            code,
            message: Some(message),
        }) => StoreError::Rejected { code, message },
        _ => StoreError::Rejected {
            code: None,
            message: format!("{}: {}", status, body.trim()),
        },
    }
}

fn rows(value: Value) -> Result<Vec<Value>, StoreError> {
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}

/// Plain-text form of a filter operand
pub(crate) fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Operand inside an `in.(...)` list; reserved characters force quoting
fn list_item(value: &Value) -> String {
    let text = literal(value);
    if text.contains([',', '(', ')', '"']) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text
    }
}

/// `operator.operand` form shared by REST filters and realtime filters
pub(crate) fn filter_operand(filter: &Filter) -> String {
    match filter {
        Filter::Eq(_, value) => format!("eq.{}", literal(value)),
        Filter::Gt(_, value) => format!("gt.{}", literal(value)),
        Filter::In(_, values) => format!(
            "in.({})",
            values.iter().map(list_item).collect::<Vec<_>>().join(",")
        ),
    }
}

pub(crate) fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.field().to_string(), filter_operand(f)))
        .collect()
}

pub(crate) fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(filter_params(&query.filters));
    if let Some(order) = &query.order {
        let direction = match order.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        params.push(("order".to_string(), format!("{}.{}", order.field, direction)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_query_params() {
        let list_id = Uuid::new_v4();
        let query = Query::new()
            .filter(Filter::eq("list_id", list_id))
            .filter(Filter::eq("completed", true))
            .order_by("created_at", Direction::Desc)
            .limit(5);
        let params = query_params(&query);

        assert_eq!(param(&params, "select"), Some("*"));
        assert_eq!(param(&params, "list_id"), Some(format!("eq.{}", list_id).as_str()));
        assert_eq!(param(&params, "completed"), Some("eq.true"));
        assert_eq!(param(&params, "order"), Some("created_at.desc"));
        assert_eq!(param(&params, "limit"), Some("5"));
    }

    #[test]
    fn test_in_filter_quotes_reserved_characters() {
        let filter = Filter::is_in("name", ["a", "b,c"]);
        assert_eq!(filter_operand(&filter), "in.(a,\"b,c\")");

        let ids = [Uuid::nil(), Uuid::nil()];
        let filter = Filter::is_in("todo_id", ids);
        assert_eq!(
            filter_operand(&filter),
            format!("in.({},{})", Uuid::nil(), Uuid::nil())
        );
    }

    #[test]
    fn test_rejection_uses_error_body() {
        let err = rejection(
            StatusCode::FORBIDDEN,
            r#"{"code":"42501","message":"new row violates row-level security policy"}"#,
        );
        assert_eq!(
            err,
            StoreError::rejected_with_code("42501", "new row violates row-level security policy")
        );

        let err = rejection(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(err, StoreError::Rejected { code: None, .. }));
    }

    #[test]
    fn test_rows_normalizes_shapes() {
        assert!(rows(Value::Null).unwrap().is_empty());
        assert_eq!(rows(serde_json::json!({"id": 1})).unwrap().len(), 1);
        assert_eq!(rows(serde_json::json!([1, 2])).unwrap().len(), 2);
    }
}
