//! Realtime socket feed: frame codec, body decoding and the decoder that
//! turns frames into live-list updates.

pub mod connection;
pub mod live;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::Read;
use tracing::{debug, warn};

use crate::telegram::{RawTelegramItem, SourceReport, parse_report_body};
use crate::upstream::is_connection_limit;
use live::{Change, LiveEvents};

pub const EARTHQUAKE_CLASSIFICATION: &str = "telegram.earthquake";

// ───────────────────────────── Frames ────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Start { socket_id: Option<i64> },
    Ping { ping_id: String },
    Pong,
    Data(Value),
    Error { message: String, code: Option<i64>, close: bool },
    Other(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameHead {
    #[serde(rename = "type")]
    kind: String,
    ping_id: Option<String>,
    socket_id: Option<i64>,
    error: Option<String>,
    code: Option<i64>,
    #[serde(default)]
    close: bool,
}

pub fn parse_frame(text: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(text).context("socket frame is not JSON")?;
    let head: FrameHead = serde_json::from_value(value.clone()).context("socket frame has no type")?;
    Ok(match head.kind.as_str() {
        "start" => Frame::Start {
            socket_id: head.socket_id,
        },
        "ping" => Frame::Ping {
            ping_id: head.ping_id.unwrap_or_default(),
        },
        "pong" => Frame::Pong,
        "data" => Frame::Data(value),
        "error" => Frame::Error {
            message: head.error.unwrap_or_default(),
            code: head.code,
            close: head.close,
        },
        other => Frame::Other(other.to_string()),
    })
}

pub fn pong(ping_id: &str) -> String {
    json!({ "type": "pong", "pingId": ping_id }).to_string()
}

/// Undo the delivery encoding of an inline body: base64, then gzip.
pub fn decode_body(item: &RawTelegramItem) -> Result<String> {
    let Some(body) = item.body.as_deref() else {
        bail!("telegram {} carries no body", item.id);
    };
    let bytes = match item.encoding.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("base64") => BASE64
            .decode(body.trim().as_bytes())
            .with_context(|| format!("telegram {}: invalid base64 body", item.id))?,
        _ => body.as_bytes().to_vec(),
    };
    match item.compression.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("gzip") => {
            let mut out = String::new();
            GzDecoder::new(bytes.as_slice())
                .read_to_string(&mut out)
                .with_context(|| format!("telegram {}: gzip body does not inflate", item.id))?;
            Ok(out)
        }
        None | Some("") => String::from_utf8(bytes).context("telegram body is not UTF-8"),
        Some(other) => bail!("telegram {}: unsupported compression {other}", item.id),
    }
}

/// A data frame as a telegram.  `Ok(None)` for other classifications.
pub fn decode_data(frame: Value) -> Result<Option<SourceReport>> {
    let classification = frame
        .get("classification")
        .and_then(Value::as_str)
        .unwrap_or(EARTHQUAKE_CLASSIFICATION);
    if classification != EARTHQUAKE_CLASSIFICATION {
        debug!(classification, "ignoring non-earthquake frame");
        return Ok(None);
    }
    let item = RawTelegramItem::from_envelope(frame)?;
    let tree = parse_report_body(&decode_body(&item)?)?;
    Ok(Some(SourceReport { item, tree }))
}

// ───────────────────────────── Decoder ───────────────────────────────────

/// What the connection should do after one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Reply(String),
    Applied { event_id: String, change: Change },
    Upstream { message: String, close: bool, too_many: bool },
    Started,
    Ignored,
}

pub struct Decoder {
    live: LiveEvents,
}

impl Decoder {
    pub fn new(cap: usize) -> Self {
        Self {
            live: LiveEvents::new(cap),
        }
    }

    pub fn live(&self) -> &LiveEvents {
        &self.live
    }

    /// Handle one text frame.  Undecodable data frames are logged and
    /// ignored; they never end the connection.
    pub fn handle(&mut self, text: &str) -> Reaction {
        let frame = match parse_frame(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("unreadable socket frame: {e:#}");
                return Reaction::Ignored;
            }
        };
        match frame {
            Frame::Ping { ping_id } => Reaction::Reply(pong(&ping_id)),
            Frame::Start { socket_id } => {
                debug!(?socket_id, "socket started");
                Reaction::Started
            }
            Frame::Pong | Frame::Other(_) => Reaction::Ignored,
            Frame::Error {
                message,
                code,
                close,
            } => Reaction::Upstream {
                too_many: is_connection_limit(None, &message),
                message: match code {
                    Some(code) => format!("{message} (code {code})"),
                    None => message,
                },
                close,
            },
            Frame::Data(value) => match decode_data(value) {
                Ok(Some(report)) => self.apply(&report),
                Ok(None) => Reaction::Ignored,
                Err(e) => {
                    warn!("undecodable telegram frame: {e:#}");
                    Reaction::Ignored
                }
            },
        }
    }

    fn apply(&mut self, report: &SourceReport) -> Reaction {
        let Some(disclosure) = live::disclose(report) else {
            return Reaction::Ignored;
        };
        let change = self.live.apply(&disclosure, Utc::now());
        Reaction::Applied {
            event_id: disclosure.info.event_id,
            change,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::data_frame;
    use super::*;
    use crate::realtime::live::Confirmation;
    use crate::telegram::test_support::*;

    #[test]
    fn ping_is_answered_with_same_id() {
        let mut d = Decoder::new(10);
        let reply = d.handle(r#"{"type":"ping","pingId":"abc-123"}"#);
        let Reaction::Reply(text) = reply else {
            panic!("expected a pong, got {reply:?}");
        };
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "pong");
        assert_eq!(v["pingId"], "abc-123");
    }

    #[test]
    fn gzip_base64_frame_updates_live_list() {
        let mut d = Decoder::new(10);
        let reaction = d.handle(&data_frame("t1", "VXSE51", "EV1", QUICK_XML));
        assert_eq!(
            reaction,
            Reaction::Applied { event_id: "EV1".into(), change: Change::Inserted }
        );
        assert_eq!(d.live().get("EV1").unwrap().confirmation, Confirmation::Unconfirmed);

        d.handle(&data_frame("t2", "VXSE53", "EV1", DETAILED_XML));
        let e = d.live().get("EV1").unwrap();
        assert_eq!(e.confirmation, Confirmation::Confirmed);
        assert_eq!(e.epicenter.as_deref(), Some("石川県能登地方"));
    }

    #[test]
    fn plain_utf8_body_is_accepted() {
        let mut frame = envelope("t3", "VXSE53", "2024-01-01T07:12:18Z", Some("EV2"));
        frame["type"] = "data".into();
        frame["encoding"] = "utf-8".into();
        frame["body"] = DETAILED_XML.into();
        let mut d = Decoder::new(10);
        assert!(matches!(d.handle(&frame.to_string()), Reaction::Applied { .. }));
    }

    #[test]
    fn other_classifications_and_garbage_are_ignored() {
        let mut d = Decoder::new(10);
        assert_eq!(
            d.handle(r#"{"type":"data","classification":"telegram.volcano","head":{}}"#),
            Reaction::Ignored
        );
        assert_eq!(d.handle("not json"), Reaction::Ignored);
        assert!(d.live().is_empty());
    }

    #[test]
    fn error_frame_reports_connection_limit() {
        let mut d = Decoder::new(10);
        let r = d.handle(r#"{"type":"error","error":"Too many connections.","code":4807,"close":true}"#);
        assert_eq!(
            r,
            Reaction::Upstream {
                message: "Too many connections. (code 4807)".into(),
                close: true,
                too_many: true,
            }
        );
    }
}
