//! Inbound NOTIFY requests: property set parsing and sequence tracking.
//!
//! A NOTIFY body looks like:
//!
//! ```xml
//! <e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
//!   <e:property>
//!     <Volume>42</Volume>
//!   </e:property>
//! </e:propertyset>
//! ```
//!
//! Each `property` element carries exactly one state variable. Namespace
//! prefixes are ignored.

use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::NotifyError;

/// One evented state variable and its new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVariableChange {
    pub name: String,
    pub value: String,
}

impl StateVariableChange {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A validated NOTIFY request, minus the SID used to route it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRequest {
    /// Event key from the `SEQ` header
    pub seq: u32,
    /// Changes in document order
    pub changes: Vec<StateVariableChange>,
}

impl NotifyRequest {
    pub fn new(seq: u32, changes: Vec<StateVariableChange>) -> Self {
        Self { seq, changes }
    }

    /// Build a request from the raw `SEQ` header value and body.
    pub fn parse(seq: &str, body: &str) -> Result<Self, NotifyError> {
        Ok(Self {
            seq: parse_seq(seq)?,
            changes: parse_property_set(body)?,
        })
    }
}

/// Status returned to the NOTIFY sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    /// 200, event accepted
    Ok,
    /// 400, malformed request
    BadRequest,
    /// 412, unknown SID or subscription not accepting events
    PreconditionFailed,
}

impl NotifyStatus {
    pub fn as_u16(&self) -> u16 {
        match self {
            NotifyStatus::Ok => 200,
            NotifyStatus::BadRequest => 400,
            NotifyStatus::PreconditionFailed => 412,
        }
    }
}

impl fmt::Display for NotifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            NotifyStatus::Ok => "OK",
            NotifyStatus::BadRequest => "Bad Request",
            NotifyStatus::PreconditionFailed => "Precondition Failed",
        };
        write!(f, "{} {}", self.as_u16(), reason)
    }
}

/// Parse a `SEQ` header value.
pub fn parse_seq(value: &str) -> Result<u32, NotifyError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| NotifyError::InvalidSequence(value.to_string()))
}

/// The event key expected after `seq`. Wraps from `u32::MAX` to 1, since 0
/// is reserved for the initial event.
pub fn next_seq(seq: u32) -> u32 {
    if seq == u32::MAX {
        1
    } else {
        seq + 1
    }
}

/// Extract the state variable changes from an `e:propertyset` document.
pub fn parse_property_set(body: &str) -> Result<Vec<StateVariableChange>, NotifyError> {
    let mut reader = Reader::from_str(body);
    let mut changes = Vec::new();
    let mut current: Option<StateVariableChange> = None;
    let mut depth = 0usize;
    let mut seen_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| NotifyError::InvalidBody(e.to_string()))?;

        match event {
            Event::Start(e) => {
                let name = local_name(&e)?;
                match depth {
                    0 if name == "propertyset" => seen_root = true,
                    1 if name == "property" => {}
                    0 | 1 => return Err(unexpected_element(&name)),
                    2 => current = Some(StateVariableChange::new(name, String::new())),
                    // Markup nested inside a value contributes only its text
                    _ => {}
                }
                depth += 1;
            }
            Event::Empty(e) => {
                let name = local_name(&e)?;
                match depth {
                    0 if name == "propertyset" => seen_root = true,
                    1 if name == "property" => {}
                    0 | 1 => return Err(unexpected_element(&name)),
                    2 => changes.push(StateVariableChange::new(name, String::new())),
                    _ => {}
                }
            }
            Event::Text(text) if depth >= 3 => {
                let text = text
                    .unescape()
                    .map_err(|e| NotifyError::InvalidBody(e.to_string()))?;
                if let Some(change) = current.as_mut() {
                    change.value.push_str(&text);
                }
            }
            Event::CData(data) if depth >= 3 => {
                if let Some(change) = current.as_mut() {
                    change
                        .value
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 2 {
                    if let Some(change) = current.take() {
                        changes.push(change);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(NotifyError::InvalidBody(
            "missing propertyset element".to_string(),
        ));
    }
    if depth != 0 {
        return Err(NotifyError::InvalidBody(
            "unexpected end of document".to_string(),
        ));
    }

    Ok(changes)
}

fn local_name(element: &BytesStart<'_>) -> Result<String, NotifyError> {
    std::str::from_utf8(element.local_name().as_ref())
        .map(str::to_string)
        .map_err(|e| NotifyError::InvalidBody(e.to_string()))
}

fn unexpected_element(name: &str) -> NotifyError {
    NotifyError::InvalidBody(format!("unexpected element <{}>", name))
}
