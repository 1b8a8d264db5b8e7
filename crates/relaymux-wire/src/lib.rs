// Relay wire protocol: UTF-8 JSON arrays whose first element names the kind.
// Classification is pure; callers decide what a malformed frame means for
// the peer that sent it.
use serde_json::Value;
use std::fmt;

pub const LABEL_REQ: &str = "REQ";
pub const LABEL_CLOSE: &str = "CLOSE";
pub const LABEL_EVENT: &str = "EVENT";
pub const LABEL_EOSE: &str = "EOSE";
pub const LABEL_OK: &str = "OK";
pub const LABEL_NOTICE: &str = "NOTICE";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed frame: invalid json")]
    InvalidJson(#[source] serde_json::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("malformed frame: unknown message kind {0:?}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Close,
    Publish,
    Event,
    Eose,
    Ok,
    Notice,
}

impl MessageKind {
    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::Request => LABEL_REQ,
            MessageKind::Close => LABEL_CLOSE,
            // Publish and delivery share a label; arity tells them apart.
            MessageKind::Publish | MessageKind::Event => LABEL_EVENT,
            MessageKind::Eose => LABEL_EOSE,
            MessageKind::Ok => LABEL_OK,
            MessageKind::Notice => LABEL_NOTICE,
        }
    }

    /// Kinds only a relay may send. A client sending one of these is a protocol error.
    pub fn is_relay_only(&self) -> bool {
        matches!(
            self,
            MessageKind::Event | MessageKind::Eose | MessageKind::Ok | MessageKind::Notice
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Request => "subscribe",
            MessageKind::Close => "close",
            MessageKind::Publish => "push-event",
            MessageKind::Event => "event-delivery",
            MessageKind::Eose => "end-of-stored-events",
            MessageKind::Ok => "acknowledgement",
            MessageKind::Notice => "notice",
        };
        f.write_str(name)
    }
}

/// A classified protocol frame.
///
/// ```
/// use relaymux_wire::{Message, MessageKind};
///
/// let message = Message::parse(r#"["REQ","feed",{"kinds":[1]}]"#).expect("parse");
/// assert_eq!(message.kind(), MessageKind::Request);
/// assert_eq!(message.subscription_id(), Some("feed"));
///
/// let rewritten = message.with_subscription_id("feed:abc".to_string());
/// assert_eq!(rewritten.encode(), r#"["REQ","feed:abc",{"kinds":[1]}]"#);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // ["REQ", subId, filter...]
    Request {
        subscription_id: String,
        filters: Vec<Value>,
    },
    // ["CLOSE", subId]
    Close { subscription_id: String },
    // ["EVENT", event] sent by a client.
    Publish { event_id: String, event: Value },
    // ["EVENT", subId, event] sent by a relay.
    Event {
        subscription_id: String,
        event: Value,
    },
    // ["EOSE", subId]
    Eose { subscription_id: String },
    // ["OK", eventId, accepted, message]
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    // ["NOTICE", message]
    Notice { message: String },
}

impl Message {
    /// Parse and classify a raw text frame.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw).map_err(Error::InvalidJson)?;
        let Value::Array(items) = value else {
            return Err(Error::MalformedFrame("frame is not a json array"));
        };
        Self::from_items(items)
    }

    fn from_items(items: Vec<Value>) -> Result<Self> {
        let mut items = items.into_iter();
        let label = match items.next() {
            Some(Value::String(label)) => label,
            Some(_) => return Err(Error::MalformedFrame("message kind is not a string")),
            None => return Err(Error::MalformedFrame("empty frame")),
        };
        let rest: Vec<Value> = items.collect();

        match label.as_str() {
            LABEL_REQ => {
                let mut rest = rest.into_iter();
                let subscription_id =
                    expect_id(rest.next(), "subscribe requires a subscription id")?;
                let filters: Vec<Value> = rest.collect();
                if filters.iter().any(|filter| !filter.is_object()) {
                    return Err(Error::MalformedFrame("subscribe filters must be objects"));
                }
                Ok(Message::Request {
                    subscription_id,
                    filters,
                })
            }
            LABEL_CLOSE => {
                let subscription_id =
                    expect_id(rest.into_iter().next(), "close requires a subscription id")?;
                Ok(Message::Close { subscription_id })
            }
            LABEL_EVENT => classify_event(rest),
            LABEL_EOSE => {
                let subscription_id = expect_id(
                    rest.into_iter().next(),
                    "end-of-stored-events requires a subscription id",
                )?;
                Ok(Message::Eose { subscription_id })
            }
            LABEL_OK => {
                let mut rest = rest.into_iter();
                let event_id = expect_id(rest.next(), "acknowledgement requires an event id")?;
                let accepted = match rest.next() {
                    Some(Value::Bool(accepted)) => accepted,
                    _ => {
                        return Err(Error::MalformedFrame(
                            "acknowledgement requires a boolean status",
                        ));
                    }
                };
                // Older relays omit the message; treat it as empty.
                let message = match rest.next() {
                    Some(Value::String(message)) => message,
                    None | Some(Value::Null) => String::new(),
                    Some(_) => {
                        return Err(Error::MalformedFrame(
                            "acknowledgement message must be a string",
                        ));
                    }
                };
                Ok(Message::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            LABEL_NOTICE => match rest.into_iter().next() {
                Some(Value::String(message)) => Ok(Message::Notice { message }),
                _ => Err(Error::MalformedFrame("notice requires a message")),
            },
            _ => Err(Error::UnknownKind(label)),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Close { .. } => MessageKind::Close,
            Message::Publish { .. } => MessageKind::Publish,
            Message::Event { .. } => MessageKind::Event,
            Message::Eose { .. } => MessageKind::Eose,
            Message::Ok { .. } => MessageKind::Ok,
            Message::Notice { .. } => MessageKind::Notice,
        }
    }

    /// Subscription id carried in the second position, if this kind has one.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Message::Request {
                subscription_id, ..
            }
            | Message::Close { subscription_id }
            | Message::Event {
                subscription_id, ..
            }
            | Message::Eose { subscription_id } => Some(subscription_id),
            _ => None,
        }
    }

    /// Event id for push-event and acknowledgement frames.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Message::Publish { event_id, .. } | Message::Ok { event_id, .. } => Some(event_id),
            Message::Event { event, .. } => event.get("id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Replace the subscription id; kinds without one are returned unchanged.
    pub fn with_subscription_id(mut self, id: String) -> Self {
        match &mut self {
            Message::Request {
                subscription_id, ..
            }
            | Message::Close { subscription_id }
            | Message::Event {
                subscription_id, ..
            }
            | Message::Eose { subscription_id } => *subscription_id = id,
            _ => {}
        }
        self
    }

    pub fn encode(&self) -> String {
        let label = Value::from(self.kind().label());
        let items: Vec<Value> = match self {
            Message::Request {
                subscription_id,
                filters,
            } => {
                let mut items = Vec::with_capacity(filters.len() + 2);
                items.push(label);
                items.push(Value::from(subscription_id.as_str()));
                items.extend(filters.iter().cloned());
                items
            }
            Message::Close { subscription_id } | Message::Eose { subscription_id } => {
                vec![label, Value::from(subscription_id.as_str())]
            }
            Message::Publish { event, .. } => vec![label, event.clone()],
            Message::Event {
                subscription_id,
                event,
            } => vec![label, Value::from(subscription_id.as_str()), event.clone()],
            Message::Ok {
                event_id,
                accepted,
                message,
            } => vec![
                label,
                Value::from(event_id.as_str()),
                Value::from(*accepted),
                Value::from(message.as_str()),
            ],
            Message::Notice { message } => vec![label, Value::from(message.as_str())],
        };
        Value::Array(items).to_string()
    }
}

fn expect_id(value: Option<Value>, reason: &'static str) -> Result<String> {
    match value {
        Some(Value::String(id)) if !id.is_empty() => Ok(id),
        _ => Err(Error::MalformedFrame(reason)),
    }
}

fn classify_event(rest: Vec<Value>) -> Result<Message> {
    let mut rest = rest.into_iter();
    match rest.next() {
        // ["EVENT", subId, event] from a relay.
        Some(Value::String(subscription_id)) => {
            if subscription_id.is_empty() {
                return Err(Error::MalformedFrame(
                    "event-delivery requires a subscription id",
                ));
            }
            match rest.next() {
                Some(event @ Value::Object(_)) => Ok(Message::Event {
                    subscription_id,
                    event,
                }),
                _ => Err(Error::MalformedFrame(
                    "event-delivery requires an event object",
                )),
            }
        }
        // ["EVENT", event] from a client.
        Some(event @ Value::Object(_)) => {
            let event_id = match event.get("id") {
                Some(Value::String(id)) if !id.is_empty() => id.clone(),
                _ => return Err(Error::MalformedFrame("push-event requires an event id")),
            };
            Ok(Message::Publish { event_id, event })
        }
        _ => Err(Error::MalformedFrame(
            "event requires a subscription id or an event object",
        )),
    }
}
