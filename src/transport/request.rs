use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

/// Marks how far a request has already been through the recovery paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTag {
  /// Replayed after a 5xx
  pub retried: bool,
  /// Replayed after a token refresh; a second 401 is final
  pub refreshed: bool,
  /// Never triggers a refresh (login, refresh itself)
  pub skip_refresh: bool,
}

/// A logical API request, before auth and correlation are attached.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub tag: RequestTag,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      tag: RequestTag::default(),
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::PATCH, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  pub fn query(mut self, key: &str, value: impl ToString) -> Self {
    self.query.push((key.to_string(), value.to_string()));
    self
  }

  pub fn json(mut self, body: impl Serialize) -> Self {
    // Serializing plain data structs into a Value cannot fail
    self.body = serde_json::to_value(body).ok();
    self
  }

  pub fn without_refresh(mut self) -> Self {
    self.tag.skip_refresh = true;
    self
  }
}
