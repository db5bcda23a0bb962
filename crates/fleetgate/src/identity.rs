use fleet_core::{Strng, strng};

/// Group granted to every authenticated caller, mirroring the Kubernetes
/// built-in.
pub const AUTHENTICATED_GROUP: Strng = strng::literal!("system:authenticated");

/// OIDC-sourced groups are namespaced so they can never collide with
/// Kubernetes built-in groups like `system:masters`.
pub const OIDC_GROUP_PREFIX: &str = "oidc:";

/// The authenticated caller, produced only at the trust boundary (OIDC
/// middleware on the server, trusted-subject middleware on the agent) and
/// carried through request-scoped state from there.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UserInfo {
	pub subject: Strng,
	pub groups: Vec<Strng>,
}

impl UserInfo {
	pub fn new(subject: impl Into<Strng>) -> Self {
		UserInfo {
			subject: subject.into(),
			groups: vec![AUTHENTICATED_GROUP],
		}
	}

	/// The process's own ambient identity. Backend adapters recognise the
	/// empty subject and skip impersonation, so calls run with the service
	/// account the process holds. Never produced by an auth boundary.
	pub fn local() -> Self {
		UserInfo {
			subject: strng::EMPTY,
			groups: Vec::new(),
		}
	}

	pub fn with_oidc_groups<I, S>(subject: impl Into<Strng>, groups: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut all = vec![AUTHENTICATED_GROUP];
		all.extend(
			groups
				.into_iter()
				.map(|g| strng::new(format!("{OIDC_GROUP_PREFIX}{}", g.as_ref()))),
		);
		UserInfo {
			subject: subject.into(),
			groups: all,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn oidc_groups_are_prefixed() {
		let user = UserInfo::with_oidc_groups("alice", ["admins", "dev"]);
		assert_eq!(user.subject.as_str(), "alice");
		assert_eq!(
			user
				.groups
				.iter()
				.map(|g| g.as_str())
				.collect::<Vec<_>>(),
			vec!["system:authenticated", "oidc:admins", "oidc:dev"]
		);
	}

	#[test]
	fn plain_user_gets_authenticated_group() {
		let user = UserInfo::new("bob");
		assert_eq!(user.groups.len(), 1);
		assert_eq!(user.groups[0], AUTHENTICATED_GROUP);
	}
}
