//! Response envelope normalization.
//!
//! List endpoints answer with a bare array, `{<name>: [...]}`,
//! `{data: {<name>: [...]}}` or `{data: [...]}`, sometimes with a `hasMore`
//! flag at either level. Single-entity endpoints wrap the same way. This is
//! the only place that looks at those shapes.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::TransportError;

use super::api_types::{ApiComment, ApiFeedItem, ApiNotification, ApiUser};
use super::types::{Comment, FeedItem, Notification, UserProfile};

/// One page of a list, independent of how the server wrapped it.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPage<T> {
  pub items: Vec<T>,
  /// Elements the server sent, counting ones later skipped as undecodable
  pub received: usize,
  /// Server-provided flag, if any
  pub has_more: Option<bool>,
}

impl NormalizedPage<Value> {
  /// Map raw elements to canonical entities, skipping the ones that do not
  /// decode.
  pub fn decode<T>(self, list: &str, mapper: ItemMapper<T>) -> NormalizedPage<T> {
    let mut items = Vec::with_capacity(self.items.len());
    for raw in self.items {
      match mapper(raw) {
        Ok(item) => items.push(item),
        Err(e) => warn!(list, "Skipping undecodable entry: {}", e),
      }
    }
    NormalizedPage {
      items,
      received: self.received,
      has_more: self.has_more,
    }
  }
}

/// Maps one raw list element to a canonical entity.
pub type ItemMapper<T> = fn(Value) -> Result<T, TransportError>;

/// Envelope adapter for one list family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEnvelope {
  /// Name of the wrapped list, e.g. `yeets` in `{yeets: [...]}`
  pub name: &'static str,
}

pub const ITEMS: ListEnvelope = ListEnvelope { name: "yeets" };
pub const USERS: ListEnvelope = ListEnvelope { name: "users" };
pub const NOTIFICATIONS: ListEnvelope = ListEnvelope { name: "notifications" };
pub const COMMENTS: ListEnvelope = ListEnvelope { name: "comments" };

/// Generic list keys some endpoints use instead of the family name.
const GENERIC_LIST_KEYS: [&str; 3] = ["list", "items", "results"];

impl ListEnvelope {
  /// Unwrap the raw list and the optional `hasMore` flag.
  pub fn normalize(&self, body: Value) -> Result<NormalizedPage<Value>, TransportError> {
    let has_more = has_more_flag(&body);

    let items = match body {
      Value::Array(items) => items,
      Value::Object(mut map) => {
        if let Some(list) = self.take_list(&mut map) {
          list
        } else {
          match map.remove("data") {
            Some(Value::Array(items)) => items,
            Some(Value::Object(mut data)) => self.take_list(&mut data).ok_or_else(|| self.unrecognized())?,
            _ => return Err(self.unrecognized()),
          }
        }
      }
      // Some endpoints answer an empty page with no body at all
      Value::Null => Vec::new(),
      _ => return Err(self.unrecognized()),
    };

    Ok(NormalizedPage {
      received: items.len(),
      items,
      has_more,
    })
  }

  /// Normalize and map each element to its canonical type. Elements that
  /// fail to map are skipped rather than failing the whole page.
  pub fn decode<T>(&self, body: Value, mapper: ItemMapper<T>) -> Result<NormalizedPage<T>, TransportError> {
    Ok(self.normalize(body)?.decode(self.name, mapper))
  }

  fn take_list(&self, map: &mut serde_json::Map<String, Value>) -> Option<Vec<Value>> {
    let key = std::iter::once(self.name)
      .chain(GENERIC_LIST_KEYS)
      .find(|key| matches!(map.get(*key), Some(Value::Array(_))))?;
    match map.remove(key) {
      Some(Value::Array(items)) => Some(items),
      _ => None,
    }
  }

  fn unrecognized(&self) -> TransportError {
    TransportError::Decode(format!("unrecognized {} list envelope", self.name))
  }
}

fn has_more_flag(body: &Value) -> Option<bool> {
  let flag = |v: &Value| {
    v.get("hasMore")
      .or_else(|| v.get("has_more"))
      .or_else(|| v.pointer("/pagination/hasMore"))
      .and_then(Value::as_bool)
  };
  flag(body).or_else(|| body.get("data").and_then(flag))
}

/// Envelope adapter for single-entity responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityEnvelope {
  pub name: &'static str,
}

pub const ITEM: EntityEnvelope = EntityEnvelope { name: "yeet" };
pub const USER: EntityEnvelope = EntityEnvelope { name: "user" };
pub const NOTIFICATION: EntityEnvelope = EntityEnvelope { name: "notification" };
pub const COMMENT: EntityEnvelope = EntityEnvelope { name: "comment" };

impl EntityEnvelope {
  /// Unwrap bare object, `{<name>: {...}}`, `{data: {<name>: {...}}}` or
  /// `{data: {...}}`.
  pub fn unwrap(&self, body: Value) -> Result<Value, TransportError> {
    let Value::Object(mut map) = body else {
      return Err(TransportError::Decode(format!(
        "expected {} object",
        self.name
      )));
    };

    if matches!(map.get(self.name), Some(Value::Object(_))) {
      if let Some(inner) = map.remove(self.name) {
        return Ok(inner);
      }
    }
    match map.remove("data") {
      Some(Value::Object(mut data)) => match data.remove(self.name) {
        Some(inner @ Value::Object(_)) => Ok(inner),
        Some(other) => {
          data.insert(self.name.to_string(), other);
          Ok(Value::Object(data))
        }
        None => Ok(Value::Object(data)),
      },
      Some(other) => {
        map.insert("data".to_string(), other);
        Ok(Value::Object(map))
      }
      None => Ok(Value::Object(map)),
    }
  }

  pub fn decode<T>(&self, body: Value, mapper: ItemMapper<T>) -> Result<T, TransportError> {
    mapper(self.unwrap(body)?)
  }
}

fn wire<W: DeserializeOwned>(raw: Value) -> Result<W, TransportError> {
  Ok(serde_json::from_value(raw)?)
}

/// Wire -> canonical mappers, one per entity type.
pub fn feed_item(raw: Value) -> Result<FeedItem, TransportError> {
  wire::<ApiFeedItem>(raw)?.into_item()
}

pub fn user_profile(raw: Value) -> Result<UserProfile, TransportError> {
  wire::<ApiUser>(raw)?.into_profile()
}

pub fn notification(raw: Value) -> Result<Notification, TransportError> {
  wire::<ApiNotification>(raw)?.into_notification()
}

pub fn comment(raw: Value) -> Result<Comment, TransportError> {
  wire::<ApiComment>(raw)?.into_comment()
}

/// Access token from a login or refresh response.
pub fn access_token(body: &Value) -> Option<String> {
  string_field(body, &["accessToken", "token", "access_token"])
}

/// Session credential, when the backend puts it in the body instead of a
/// cookie.
pub fn session_token(body: &Value) -> Option<String> {
  string_field(body, &["refreshToken", "refresh_token"])
}

fn string_field(body: &Value, names: &[&str]) -> Option<String> {
  let find = |v: &Value| {
    names
      .iter()
      .find_map(|name| v.get(*name).and_then(Value::as_str))
      .filter(|s| !s.is_empty())
      .map(String::from)
  };
  find(body).or_else(|| body.get("data").and_then(find))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn ids(page: &NormalizedPage<Value>) -> Vec<String> {
    page
      .items
      .iter()
      .map(|v| v["id"].as_str().unwrap().to_string())
      .collect()
  }

  #[test]
  fn test_bare_array() {
    let page = ITEMS.normalize(json!([{"id": "1"}, {"id": "2"}])).unwrap();
    assert_eq!(ids(&page), vec!["1", "2"]);
    assert_eq!(page.has_more, None);
  }

  #[test]
  fn test_named_list() {
    let page = USERS
      .normalize(json!({"users": [{"id": "a"}], "hasMore": true}))
      .unwrap();
    assert_eq!(ids(&page), vec!["a"]);
    assert_eq!(page.has_more, Some(true));
  }

  #[test]
  fn test_data_wrapped_named_list() {
    let page = USERS
      .normalize(json!({"data": {"users": [{"id": "a"}, {"id": "b"}], "hasMore": false}}))
      .unwrap();
    assert_eq!(ids(&page), vec!["a", "b"]);
    assert_eq!(page.has_more, Some(false));
  }

  #[test]
  fn test_data_array() {
    let page = NOTIFICATIONS
      .normalize(json!({"data": [{"id": "n1"}], "pagination": {"hasMore": true}}))
      .unwrap();
    assert_eq!(ids(&page), vec!["n1"]);
    assert_eq!(page.has_more, Some(true));
  }

  #[test]
  fn test_generic_list_key() {
    let page = ITEMS.normalize(json!({"list": [{"id": "x"}]})).unwrap();
    assert_eq!(ids(&page), vec!["x"]);
    let page = COMMENTS
      .normalize(json!({"data": {"list": [{"id": "c"}]}}))
      .unwrap();
    assert_eq!(ids(&page), vec!["c"]);
  }

  #[test]
  fn test_null_is_empty_page() {
    let page = ITEMS.normalize(Value::Null).unwrap();
    assert!(page.items.is_empty());
  }

  #[test]
  fn test_unrecognized_envelope() {
    assert!(matches!(
      ITEMS.normalize(json!({"message": "ok"})),
      Err(TransportError::Decode(_))
    ));
    assert!(ITEMS.normalize(json!("text")).is_err());
  }

  #[test]
  fn test_decode_skips_bad_entries() {
    let page = ITEMS
      .decode(json!({"yeets": [{"id": "1"}, {"content": "no id"}]}), feed_item)
      .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, "1");
  }

  #[test]
  fn test_entity_envelopes() {
    let expected = json!({"id": "u1", "username": "ann"});
    for body in [
      json!({"id": "u1", "username": "ann"}),
      json!({"user": {"id": "u1", "username": "ann"}}),
      json!({"data": {"user": {"id": "u1", "username": "ann"}}}),
      json!({"data": {"id": "u1", "username": "ann"}}),
    ] {
      assert_eq!(USER.unwrap(body).unwrap(), expected);
    }
    assert!(USER.unwrap(json!([1])).is_err());
  }

  #[test]
  fn test_entity_decode() {
    let profile = USER
      .decode(json!({"data": {"user": {"_id": "u1", "fullname": "Ann"}}}), user_profile)
      .unwrap();
    assert_eq!(profile.id, "u1");
  }

  #[test]
  fn test_access_token_locations() {
    assert_eq!(access_token(&json!({"accessToken": "a"})).as_deref(), Some("a"));
    assert_eq!(access_token(&json!({"token": "b"})).as_deref(), Some("b"));
    assert_eq!(
      access_token(&json!({"data": {"accessToken": "c"}})).as_deref(),
      Some("c")
    );
    assert_eq!(access_token(&json!({"accessToken": ""})), None);
    assert_eq!(access_token(&json!({})), None);
  }

  #[test]
  fn test_session_token() {
    assert_eq!(
      session_token(&json!({"accessToken": "a", "refreshToken": "r"})).as_deref(),
      Some("r")
    );
    assert_eq!(session_token(&json!({"accessToken": "a"})), None);
  }
}
