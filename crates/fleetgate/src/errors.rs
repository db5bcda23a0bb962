use std::fmt;
use std::sync::Arc;

use fleet_core::Strng;

/// Canonical status codes shared by the domain and the transport edge.
///
/// Adapters attach one of these to every failure they surface; handlers
/// translate them into wire responses without further interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
	Internal,
	InvalidArgument,
	NotFound,
	AlreadyExists,
	Unauthenticated,
	PermissionDenied,
	FailedPrecondition,
	DeadlineExceeded,
	ResourceExhausted,
	Unimplemented,
	Unavailable,
}

impl Code {
	pub fn as_str(&self) -> &'static str {
		match self {
			Code::Internal => "internal",
			Code::InvalidArgument => "invalid_argument",
			Code::NotFound => "not_found",
			Code::AlreadyExists => "already_exists",
			Code::Unauthenticated => "unauthenticated",
			Code::PermissionDenied => "permission_denied",
			Code::FailedPrecondition => "failed_precondition",
			Code::DeadlineExceeded => "deadline_exceeded",
			Code::ResourceExhausted => "resource_exhausted",
			Code::Unimplemented => "unimplemented",
			Code::Unavailable => "unavailable",
		}
	}

	pub fn from_str_lossy(s: &str) -> Code {
		match s {
			"invalid_argument" => Code::InvalidArgument,
			"not_found" => Code::NotFound,
			"already_exists" => Code::AlreadyExists,
			"unauthenticated" => Code::Unauthenticated,
			"permission_denied" => Code::PermissionDenied,
			"failed_precondition" => Code::FailedPrecondition,
			"deadline_exceeded" => Code::DeadlineExceeded,
			"resource_exhausted" => Code::ResourceExhausted,
			"unimplemented" => Code::Unimplemented,
			"unavailable" => Code::Unavailable,
			_ => Code::Internal,
		}
	}
}

impl fmt::Display for Code {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A failure produced by an infrastructure adapter, carrying the canonical
/// code plus the underlying cause for logs. Use-cases pass these through
/// untouched; they never construct transport responses themselves.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DomainError {
	pub code: Code,
	pub message: String,
	// anyhow::Error does not implement std::error::Error, so the cause is
	// carried for display only, not as a `source`.
	pub cause: Option<Arc<anyhow::Error>>,
}

impl DomainError {
	pub fn new(code: Code, message: impl Into<String>) -> Self {
		DomainError {
			code,
			message: message.into(),
			cause: None,
		}
	}

	pub fn wrap(code: Code, message: impl Into<String>, cause: anyhow::Error) -> Self {
		DomainError {
			code,
			message: message.into(),
			cause: Some(Arc::new(cause)),
		}
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(Code::Internal, message)
	}

	pub fn unavailable(message: impl Into<String>) -> Self {
		Self::new(Code::Unavailable, message)
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("invalid {field}: {message}")]
	InvalidInput { field: Strng, message: String },

	#[error("session not found")]
	SessionNotFound,

	#[error("cluster not found: {0}")]
	ClusterNotFound(Strng),

	#[error("{subsystem} not ready")]
	NotReady { subsystem: Strng },

	// Deliberately opaque: token verification must not reveal which check
	// rejected the token.
	#[error("invalid or expired token")]
	InvalidToken,

	#[error("corrupt CA material: {0}")]
	CorruptCa(String),

	#[error(transparent)]
	Domain(#[from] DomainError),
}

impl Error {
	pub fn invalid_input(field: impl Into<Strng>, message: impl Into<String>) -> Self {
		Error::InvalidInput {
			field: field.into(),
			message: message.into(),
		}
	}

	pub fn not_ready(subsystem: impl Into<Strng>) -> Self {
		Error::NotReady {
			subsystem: subsystem.into(),
		}
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Error::Domain(DomainError::internal(message))
	}

	pub fn unavailable(message: impl Into<String>) -> Self {
		Error::Domain(DomainError::unavailable(message))
	}

	pub fn resource_exhausted(message: impl Into<String>) -> Self {
		Error::Domain(DomainError::new(Code::ResourceExhausted, message))
	}

	/// The transport code for this error. Concrete variants map first; a
	/// wrapped `DomainError` contributes its own code.
	pub fn code(&self) -> Code {
		match self {
			Error::InvalidInput { .. } => Code::InvalidArgument,
			Error::SessionNotFound => Code::NotFound,
			Error::ClusterNotFound(_) => Code::NotFound,
			Error::NotReady { .. } => Code::Unavailable,
			Error::InvalidToken => Code::Unauthenticated,
			Error::CorruptCa(_) => Code::Internal,
			Error::Domain(d) => d.code,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn concrete_errors_map_before_domain_codes() {
		assert_eq!(
			Error::invalid_input("resource", "no such resource").code(),
			Code::InvalidArgument
		);
		assert_eq!(Error::SessionNotFound.code(), Code::NotFound);
		assert_eq!(
			Error::ClusterNotFound(fleet_core::strng::new("dev")).code(),
			Code::NotFound
		);
		assert_eq!(Error::not_ready("tunnel").code(), Code::Unavailable);
		assert_eq!(Error::InvalidToken.code(), Code::Unauthenticated);
	}

	#[test]
	fn domain_error_code_passthrough() {
		let err = Error::from(DomainError::new(Code::FailedPrecondition, "conflict"));
		assert_eq!(err.code(), Code::FailedPrecondition);
		assert_eq!(err.to_string(), "failed_precondition: conflict");
	}

	#[test]
	fn unknown_wire_code_becomes_internal() {
		assert_eq!(Code::from_str_lossy("banana"), Code::Internal);
		assert_eq!(Code::from_str_lossy("not_found"), Code::NotFound);
	}
}
