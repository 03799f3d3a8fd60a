//! Wire framing: topic/action/state enums, frame building, and parsing.
//!
//! A frame is `TOPIC | ACTION | data...` with fields joined by the ASCII
//! unit separator and terminated by the ASCII record separator. One
//! transport payload may carry several frames back to back; [`parse_messages`]
//! yields each one, reporting malformed frames individually instead of
//! aborting the batch.

use thiserror::Error;

/// Field separator within a frame (ASCII unit separator).
pub const FIELD_SEPARATOR: char = '\u{1f}';
/// Frame separator within a transport payload (ASCII record separator).
pub const MESSAGE_SEPARATOR: char = '\u{1e}';

/// Error describing a single undecodable frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame had no action field.
    #[error("frame `{0}` is missing topic or action")]
    Malformed(String),
    /// The topic tag is not part of the protocol.
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
    /// The action tag is not part of the protocol.
    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $tag:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Returns the wire tag for this variant.
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $tag),+
                }
            }

            /// Parses a wire tag, or `None` when unknown.
            #[must_use]
            pub fn parse(tag: &str) -> Option<Self> {
                match tag {
                    $($tag => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Message topic: which subsystem a frame belongs to.
    Topic {
        /// Connection lifecycle: handshake, heartbeat, redirects.
        Connection => "C",
        /// Authentication round-trip.
        Auth => "A",
        /// Record synchronization.
        Record => "R",
        /// Ephemeral pub/sub events (routed, not handled by this crate).
        Event => "E",
        /// Remote procedure calls (routed, not handled by this crate).
        Rpc => "P",
        /// Server-side error reports.
        Error => "X",
    }
}

wire_enum! {
    /// Message action within a topic.
    Action {
        Read => "R",
        Update => "U",
        Subscribe => "S",
        Unsubscribe => "US",
        SubscriptionHasProvider => "SH",
        Ack => "A",
        Error => "E",
        Ping => "PI",
        Pong => "PO",
        Challenge => "CH",
        ChallengeResponse => "CHR",
        Redirect => "RED",
        Rejection => "REJ",
        Request => "REQ",
        Listen => "L",
        Unlisten => "UL",
        SubscriptionForPatternFound => "SP",
        SubscriptionForPatternRemoved => "SR",
    }
}

wire_enum! {
    /// Well-known event and error codes carried in frame data fields.
    Event {
        ConnectionError => "CONNECTION_ERROR",
        TooManyAuthAttempts => "TOO_MANY_AUTH_ATTEMPTS",
        AuthenticationTimeout => "CONNECTION_AUTHENTICATION_TIMEOUT",
        IsClosed => "IS_CLOSED",
        HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
        MaxReconnectionAttemptsReached => "MAX_RECONNECTION_ATTEMPTS_REACHED",
        MessageParseError => "MESSAGE_PARSE_ERROR",
        MessageDenied => "MESSAGE_DENIED",
        ListenerExists => "LISTENER_EXISTS",
        NotListening => "NOT_LISTENING",
        UnsolicitedMessage => "UNSOLICITED_MESSAGE",
        RecordNotFound => "RECORD_NOT_FOUND",
    }
}

wire_enum! {
    /// Connection state machine states.
    ConnectionState {
        Closed => "CLOSED",
        AwaitingConnection => "AWAITING_CONNECTION",
        Challenging => "CHALLENGING",
        AwaitingAuthentication => "AWAITING_AUTHENTICATION",
        Authenticating => "AUTHENTICATING",
        Open => "OPEN",
        Reconnecting => "RECONNECTING",
        Error => "ERROR",
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub action: Action,
    pub data: Vec<String>,
}

impl Message {
    /// Data field at `index`, if present.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.data.get(index).map(String::as_str)
    }
}

/// Encodes one outbound frame, including the trailing frame separator.
#[must_use]
pub fn build_message(topic: Topic, action: Action, data: &[&str]) -> String {
    let mut frame = String::new();
    frame.push_str(topic.as_str());
    frame.push(FIELD_SEPARATOR);
    frame.push_str(action.as_str());
    for field in data {
        frame.push(FIELD_SEPARATOR);
        frame.push_str(field);
    }
    frame.push(MESSAGE_SEPARATOR);
    frame
}

/// Decodes every frame in a transport payload.
///
/// Empty segments (for example the tail after the final separator) are
/// skipped. Each malformed frame is reported in place so the caller can
/// surface a parse error without losing the rest of the batch.
#[must_use]
pub fn parse_messages(raw: &str) -> Vec<Result<Message, FrameError>> {
    raw.split(MESSAGE_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(parse_frame)
        .collect()
}

fn parse_frame(segment: &str) -> Result<Message, FrameError> {
    let mut fields = segment.split(FIELD_SEPARATOR);
    let topic_tag = fields
        .next()
        .ok_or_else(|| FrameError::Malformed(segment.to_owned()))?;
    let action_tag = fields
        .next()
        .ok_or_else(|| FrameError::Malformed(segment.to_owned()))?;
    let topic = Topic::parse(topic_tag)
        .ok_or_else(|| FrameError::UnknownTopic(topic_tag.to_owned()))?;
    let action = Action::parse(action_tag)
        .ok_or_else(|| FrameError::UnknownAction(action_tag.to_owned()))?;
    Ok(Message {
        topic,
        action,
        data: fields.map(str::to_owned).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_joins_fields_and_terminates() {
        let frame = build_message(Topic::Record, Action::Read, &["user/alice"]);
        assert_eq!(frame, "R\u{1f}R\u{1f}user/alice\u{1e}");
    }

    #[test]
    fn build_without_data() {
        let frame = build_message(Topic::Connection, Action::Ping, &[]);
        assert_eq!(frame, "C\u{1f}PI\u{1e}");
    }

    #[test]
    fn parse_single_frame() {
        let parsed = parse_messages("R\u{1f}R\u{1f}user/alice\u{1e}");
        assert_eq!(parsed.len(), 1);
        let msg = parsed[0].as_ref().unwrap();
        assert_eq!(msg.topic, Topic::Record);
        assert_eq!(msg.action, Action::Read);
        assert_eq!(msg.data, vec!["user/alice".to_owned()]);
    }

    #[test]
    fn parse_multiple_frames_in_one_payload() {
        let payload = format!(
            "{}{}",
            build_message(Topic::Connection, Action::Ping, &[]),
            build_message(Topic::Record, Action::Update, &["r", "1-a", "{}"]),
        );
        let parsed = parse_messages(&payload);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].as_ref().unwrap().action, Action::Ping);
        assert_eq!(parsed[1].as_ref().unwrap().action, Action::Update);
    }

    #[test]
    fn parse_skips_empty_segments() {
        assert!(parse_messages("").is_empty());
        assert!(parse_messages("\u{1e}\u{1e}").is_empty());
    }

    #[test]
    fn parse_reports_unknown_topic_in_place() {
        let payload = format!(
            "ZZ\u{1f}R\u{1e}{}",
            build_message(Topic::Connection, Action::Pong, &[])
        );
        let parsed = parse_messages(&payload);
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0],
            Err(FrameError::UnknownTopic("ZZ".to_owned()))
        );
        assert!(parsed[1].is_ok());
    }

    #[test]
    fn parse_reports_unknown_action() {
        let parsed = parse_messages("R\u{1f}??\u{1e}");
        assert_eq!(
            parsed[0],
            Err(FrameError::UnknownAction("??".to_owned()))
        );
    }

    #[test]
    fn parse_reports_missing_action() {
        let parsed = parse_messages("R\u{1e}");
        assert!(matches!(parsed[0], Err(FrameError::Malformed(_))));
    }

    #[test]
    fn update_frame_layout() {
        // RECORD|UPDATE|<name>|<version>|<json>|<prevVersion>
        let frame = build_message(
            Topic::Record,
            Action::Update,
            &["r", "2-abc", r#"{"a":1}"#, "1-xyz"],
        );
        let parsed = parse_messages(&frame);
        let msg = parsed[0].as_ref().unwrap();
        assert_eq!(msg.field(0), Some("r"));
        assert_eq!(msg.field(1), Some("2-abc"));
        assert_eq!(msg.field(2), Some(r#"{"a":1}"#));
        assert_eq!(msg.field(3), Some("1-xyz"));
        assert_eq!(msg.field(4), None);
    }

    #[test]
    fn empty_data_field_is_preserved() {
        let parsed = parse_messages("R\u{1f}U\u{1f}\u{1f}x\u{1e}");
        let msg = parsed[0].as_ref().unwrap();
        assert_eq!(msg.data, vec![String::new(), "x".to_owned()]);
    }

    #[test]
    fn wire_tags_roundtrip() {
        for topic in [
            Topic::Connection,
            Topic::Auth,
            Topic::Record,
            Topic::Event,
            Topic::Rpc,
            Topic::Error,
        ] {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        for action in [
            Action::Read,
            Action::Update,
            Action::Subscribe,
            Action::Unsubscribe,
            Action::SubscriptionHasProvider,
            Action::Ack,
            Action::Error,
            Action::Ping,
            Action::Pong,
            Action::Challenge,
            Action::ChallengeResponse,
            Action::Redirect,
            Action::Rejection,
            Action::Request,
            Action::Listen,
            Action::Unlisten,
            Action::SubscriptionForPatternFound,
            Action::SubscriptionForPatternRemoved,
        ] {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        for state in [
            ConnectionState::Closed,
            ConnectionState::AwaitingConnection,
            ConnectionState::Challenging,
            ConnectionState::AwaitingAuthentication,
            ConnectionState::Authenticating,
            ConnectionState::Open,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
        ] {
            assert_eq!(ConnectionState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn event_codes_roundtrip() {
        for event in [
            Event::ConnectionError,
            Event::TooManyAuthAttempts,
            Event::AuthenticationTimeout,
            Event::IsClosed,
            Event::HeartbeatTimeout,
            Event::MaxReconnectionAttemptsReached,
            Event::MessageParseError,
            Event::MessageDenied,
            Event::ListenerExists,
            Event::NotListening,
            Event::UnsolicitedMessage,
            Event::RecordNotFound,
        ] {
            assert_eq!(Event::parse(event.as_str()), Some(event));
        }
        assert_eq!(Event::parse("NOT_A_CODE"), None);
    }

    #[test]
    fn display_uses_wire_tag() {
        assert_eq!(Topic::Record.to_string(), "R");
        assert_eq!(ConnectionState::AwaitingConnection.to_string(), "AWAITING_CONNECTION");
    }
}
