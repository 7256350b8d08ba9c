//! Expected replies and the checks that compare against them.
//!
//! A failed check is an assertion mismatch: it is recorded and reported, it
//! does not abort the run.

use std::fmt;

use serde::Serialize;

use crate::resp::Response;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// `+OK`
    Ok,
    /// Any error reply.
    Error,
    Integer(i64),
    /// A non-null bulk (or simple) string with this exact content.
    Bulk(Vec<u8>),
    /// The null bulk string or null array.
    Nil,
    /// An array of bulk strings, in this order.
    List(Vec<String>),
    /// Structurally equal to this reply.
    Exact(Response),
    /// A stream range whose entries carry these field/value lists, in order.
    /// Entry IDs are server-assigned and ignored.
    StreamFields(Vec<Vec<String>>),
    /// Same entries as this stream range reply, ignoring entry IDs.
    SameStream(Response),
    /// Anything except an error reply.
    NotError,
}

impl Expect {
    pub fn bulk(payload: impl AsRef<[u8]>) -> Self {
        Expect::Bulk(payload.as_ref().to_vec())
    }

    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expect::List(items.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, observed: &Response) -> bool {
        match self {
            Expect::Ok => matches!(observed, Response::Simple(text) if text == "OK"),
            Expect::Error => observed.is_error(),
            Expect::Integer(value) => observed.as_integer() == Some(*value),
            Expect::Bulk(payload) => observed.as_bytes() == Some(payload.as_slice()),
            Expect::Nil => observed.is_null(),
            Expect::List(items) => match observed.as_array() {
                Some(observed) => {
                    observed.len() == items.len()
                        && observed
                            .iter()
                            .zip(items)
                            .all(|(got, want)| got.as_bytes() == Some(want.as_bytes()))
                }
                None => false,
            },
            Expect::Exact(expected) => observed == expected,
            Expect::StreamFields(entries) => {
                let expected: Vec<Response> = entries
                    .iter()
                    .map(|fields| Response::bulk_array(fields))
                    .collect();
                stream_fields(observed).as_deref() == Some(expected.as_slice())
            }
            Expect::SameStream(expected) => match stream_fields(expected) {
                Some(expected) => stream_fields(observed) == Some(expected),
                None => observed == expected,
            },
            Expect::NotError => !observed.is_error(),
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::Ok => write!(f, "OK"),
            Expect::Error => write!(f, "(error)"),
            Expect::Integer(value) => write!(f, "(integer) {value}"),
            Expect::Bulk(payload) => write!(f, "{:?}", String::from_utf8_lossy(payload)),
            Expect::Nil => write!(f, "(nil)"),
            Expect::List(items) => write!(f, "{items:?}"),
            Expect::Exact(reply) => write!(f, "{reply}"),
            Expect::StreamFields(entries) => write!(f, "stream entries {entries:?}"),
            Expect::SameStream(reply) => write!(f, "stream entries of {reply}"),
            Expect::NotError => write!(f, "(any non-error)"),
        }
    }
}

/// Field/value arrays of an `XRANGE`-style reply: `[[id, [f, v, ..]], ..]`.
fn stream_fields(reply: &Response) -> Option<Vec<Response>> {
    reply
        .as_array()?
        .iter()
        .map(|entry| match entry.as_array()? {
            [_id, fields] => Some(fields.clone()),
            _ => None,
        })
        .collect()
}

/// One issued command and how its reply compared.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub node: String,
    pub command: String,
    pub expected: String,
    pub observed: String,
    pub passed: bool,
    /// Times the command was issued before the reply matched or the window closed.
    pub attempts: u32,
}

impl Check {
    pub fn new(node: &str, command: String, expect: &Expect, observed: &Response) -> Self {
        Self {
            node: node.to_string(),
            command,
            expected: expect.to_string(),
            observed: observed.to_string(),
            passed: expect.matches(observed),
            attempts: 1,
        }
    }

    /// A check about something other than a single reply (listener results).
    pub fn observation(
        node: &str,
        what: impl Into<String>,
        expected: impl Into<String>,
        observed: impl Into<String>,
        passed: bool,
    ) -> Self {
        Self {
            node: node.to_string(),
            command: what.into(),
            expected: expected.into(),
            observed: observed.into(),
            passed,
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}
