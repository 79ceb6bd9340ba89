// Copyright 2018-2025 the Deno authors. MIT license.

use bytes::Bytes;
use std::fmt;

/// Completes a platform message with the receiver's reply, or with `None`
/// for an empty reply.
pub type PlatformMessageResponse = Box<dyn FnOnce(Option<Bytes>) + Send>;

/// A message sent over a named channel between isolates and the platform.
pub struct PlatformMessage {
  channel: String,
  data: Option<Bytes>,
  response: Option<PlatformMessageResponse>,
}

impl PlatformMessage {
  pub fn new(channel: impl Into<String>, data: Option<Bytes>) -> Self {
    Self {
      channel: channel.into(),
      data,
      response: None,
    }
  }

  pub fn with_response(
    channel: impl Into<String>,
    data: Option<Bytes>,
    response: impl FnOnce(Option<Bytes>) + Send + 'static,
  ) -> Self {
    Self {
      channel: channel.into(),
      data,
      response: Some(Box::new(response)),
    }
  }

  pub fn channel(&self) -> &str {
    &self.channel
  }

  pub fn data(&self) -> Option<&Bytes> {
    self.data.as_ref()
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  pub fn expects_response(&self) -> bool {
    self.response.is_some()
  }

  /// Replies to the sender. Messages sent without a response callback drop
  /// the reply.
  pub fn respond(mut self, data: Option<Bytes>) {
    if let Some(response) = self.response.take() {
      response(data);
    }
  }
}

impl fmt::Debug for PlatformMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PlatformMessage")
      .field("channel", &self.channel)
      .field("data", &self.data.as_ref().map(Bytes::len))
      .field("expects_response", &self.expects_response())
      .finish()
  }
}

/// Receives the platform messages of the isolates that hold a given root
/// isolate token.
pub trait PlatformMessageHandler: Send + Sync {
  fn handle_platform_message(&self, message: PlatformMessage);

  /// Whether messages are handled on the platform thread, as opposed to the
  /// thread that sent them.
  fn does_handle_platform_message_on_platform_thread(&self) -> bool {
    false
  }
}
