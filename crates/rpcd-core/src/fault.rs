//! Protocol-level faults.
//!
//! A `Fault` is what a method returns instead of a result when the call
//! cannot be satisfied. It is reported to the remote caller, never raised
//! as a local error. Codes follow the common XML-RPC fault interoperability
//! convention so clients can tell failure reasons apart.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::value::Value;

/// Well-known fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// Generic application failure (the historical default of -1).
    Application,
    /// Requested method not found.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal server error.
    Internal,
}

impl FaultCode {
    pub const fn code(self) -> i32 {
        match self {
            FaultCode::Application => -1,
            FaultCode::MethodNotFound => -32601,
            FaultCode::InvalidParams => -32602,
            FaultCode::Internal => -32603,
        }
    }
}

/// A fault returned by `Method::execute`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (fault {code})")]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn with_code(code: FaultCode, message: impl Into<String>) -> Self {
        Self::new(code.code(), message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::with_code(FaultCode::Application, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_code(FaultCode::InvalidParams, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::with_code(FaultCode::MethodNotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_code(FaultCode::Internal, message)
    }

    pub fn is(&self, code: FaultCode) -> bool {
        self.code == code.code()
    }

    /// The conventional `{faultCode, faultString}` struct encoding.
    pub fn to_value(&self) -> Value {
        let mut members = BTreeMap::new();
        members.insert("faultCode".to_string(), Value::Int(self.code));
        members.insert("faultString".to_string(), Value::String(self.message.clone()));
        Value::Struct(members)
    }
}

impl From<Fault> for Value {
    fn from(fault: Fault) -> Self {
        fault.to_value()
    }
}
