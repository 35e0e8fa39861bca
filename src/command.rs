//! Command dispatch.
//!
//! Turns a decoded argument vector into a store operation and a response.
//! Command names are case-insensitive. Unknown commands and wrong arity are
//! ordinary `Err` responses; the connection stays open.

use crate::protocol::Status;
use crate::storage::Store;
use std::borrow::Cow;
use thiserror::Error;
use tracing::trace;

/// Longest command name echoed back in an error message.
const MAX_NAME_IN_ERROR: usize = 32;

/// A parsed command borrowing its operands from the request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Get { key: &'a [u8] },
    Set { key: &'a [u8], value: &'a [u8] },
    Del { key: &'a [u8] },
}

/// Application-level command errors, reported to the client with `Status::Err`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("wrong number of arguments for '{0}'")]
    WrongArity(&'static str),
}

/// Response ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<'a> {
    pub status: Status,
    pub payload: Cow<'a, [u8]>,
}

impl<'a> Response<'a> {
    fn ok() -> Self {
        Self {
            status: Status::Ok,
            payload: Cow::Borrowed(&[]),
        }
    }

    fn value(value: &'a [u8]) -> Self {
        Self {
            status: Status::Ok,
            payload: Cow::Borrowed(value),
        }
    }

    fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: Cow::Borrowed(&[]),
        }
    }

    fn error(err: CommandError) -> Self {
        Self {
            status: Status::Err,
            payload: Cow::Owned(err.to_string().into_bytes()),
        }
    }
}

impl<'a> Command<'a> {
    /// Parse an argument vector. The first element names the command.
    pub fn parse(args: &[&'a [u8]]) -> Result<Self, CommandError> {
        let (name, operands) = args.split_first().ok_or(CommandError::Empty)?;

        if name.eq_ignore_ascii_case(b"get") {
            match *operands {
                [key] => Ok(Command::Get { key }),
                _ => Err(CommandError::WrongArity("get")),
            }
        } else if name.eq_ignore_ascii_case(b"set") {
            match *operands {
                [key, value] => Ok(Command::Set { key, value }),
                _ => Err(CommandError::WrongArity("set")),
            }
        } else if name.eq_ignore_ascii_case(b"del") {
            match *operands {
                [key] => Ok(Command::Del { key }),
                _ => Err(CommandError::WrongArity("del")),
            }
        } else {
            let shown = &name[..name.len().min(MAX_NAME_IN_ERROR)];
            Err(CommandError::Unknown(String::from_utf8_lossy(shown).into_owned()))
        }
    }

    /// Apply the command to the store.
    pub fn execute<'s>(&self, store: &'s mut Store) -> Response<'s> {
        match *self {
            Command::Get { key } => match store.get(key) {
                Some(value) => Response::value(value),
                None => Response::not_found(),
            },
            Command::Set { key, value } => {
                store.set(key, value);
                Response::ok()
            }
            Command::Del { key } => {
                store.del(key);
                Response::ok()
            }
        }
    }
}

/// Parse and execute one request against the store.
pub fn dispatch<'s>(args: &[&[u8]], store: &'s mut Store) -> Response<'s> {
    match Command::parse(args) {
        Ok(command) => {
            trace!(?command, "dispatch");
            command.execute(store)
        }
        Err(e) => {
            trace!(error = %e, "rejected command");
            Response::error(e)
        }
    }
}
