//! Push channel transports.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tracing::debug;

use super::events::{PushEvent, SseDecoder};
use crate::error::PushError;

pub type EventStream = BoxStream<'static, Result<PushEvent, PushError>>;

/// Opens an authenticated event stream. The stream ends when the server
/// closes the connection.
#[async_trait]
pub trait PushConnector: Send + Sync {
  async fn connect(&self, token: &str, user_id: Option<&str>) -> Result<EventStream, PushError>;
}

/// Server-sent events over reqwest.
#[derive(Clone)]
pub struct SseConnector {
  client: reqwest::Client,
  url: String,
}

impl SseConnector {
  pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, PushError> {
    url::Url::parse(url).map_err(|e| PushError::Connect(e.to_string()))?;

    // No overall timeout: the response body is open for the whole session
    let client = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .build()
      .map_err(|e| PushError::Connect(e.to_string()))?;

    Ok(Self {
      client,
      url: url.to_string(),
    })
  }
}

#[async_trait]
impl PushConnector for SseConnector {
  async fn connect(&self, token: &str, user_id: Option<&str>) -> Result<EventStream, PushError> {
    let mut builder = self
      .client
      .get(&self.url)
      .bearer_auth(token)
      .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(id) = user_id {
      builder = builder.query(&[("userId", id)]);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| PushError::Connect(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(PushError::Connect(format!("HTTP {}", status.as_u16())));
    }
    debug!(url = %self.url, "Event stream opened");

    let mut decoder = SseDecoder::default();
    let events = response
      .bytes_stream()
      .map(move |chunk| match chunk {
        Ok(bytes) => decoder
          .feed(&bytes)
          .into_iter()
          .filter_map(|frame| frame.into_event())
          .map(Ok)
          .collect::<Vec<_>>(),
        Err(e) => vec![Err(PushError::Connect(e.to_string()))],
      })
      .flat_map(stream::iter)
      .boxed();

    Ok(events)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_sse_connector_yields_typed_events() {
    let server = MockServer::start().await;
    let body = concat!(
      ": hello\n\n",
      "event: notification_read\n",
      "data: {\"notificationId\": \"n1\"}\n\n",
      "event: presence\n",
      "data: {}\n\n",
      "event: yeet_liked\n",
      "data: {\"yeetId\": \"y1\", \"likeCount\": 2}\n\n",
    );
    Mock::given(method("GET"))
      .and(path("/events"))
      .and(query_param("userId", "u1"))
      .and(header("authorization", "Bearer tok"))
      .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
      .mount(&server)
      .await;

    let connector =
      SseConnector::new(&format!("{}/events", server.uri()), Duration::from_secs(5)).unwrap();
    let events: Vec<_> = connector
      .connect("tok", Some("u1"))
      .await
      .unwrap()
      .collect()
      .await;

    assert_eq!(
      events,
      vec![
        Ok(PushEvent::NotificationRead { id: "n1".into() }),
        Ok(PushEvent::ItemLiked {
          item_id: "y1".into(),
          user_id: None,
          like_count: Some(2)
        }),
      ]
    );
  }

  #[tokio::test]
  async fn test_sse_connector_rejects_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(401))
      .mount(&server)
      .await;

    let connector = SseConnector::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let err = match connector.connect("tok", None).await {
      Ok(_) => panic!("expected a connect error"),
      Err(e) => e,
    };
    assert_eq!(err, PushError::Connect("HTTP 401".into()));
  }
}
