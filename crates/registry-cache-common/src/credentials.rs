//! Upstream registry credentials
//!
//! Credentials reach a cache through a shoot resource reference. The shoot
//! lists `{name, resourceRef}` pairs; the control plane copies each referenced
//! secret into the shoot namespace with a `ref-` prefix.

use k8s_openapi::api::core::v1::Secret;

use crate::crd::Shoot;
use crate::Error;

/// Prefix of control-plane copies of referenced resources
pub const REFERENCED_RESOURCE_PREFIX: &str = "ref-";

/// Secret key holding the upstream username
pub const USERNAME_KEY: &str = "username";

/// Secret key holding the upstream password
pub const PASSWORD_KEY: &str = "password";

/// Username/password pair for an upstream registry
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamCredentials {
    /// Upstream username
    pub username: String,
    /// Upstream password
    pub password: String,
}

impl std::fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl UpstreamCredentials {
    /// Read credentials from a secret holding exactly `username` and `password`
    pub fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let key = secret_key(secret);
        let data = secret.data.clone().unwrap_or_default();

        let username = data
            .get(USERNAME_KEY)
            .ok_or_else(|| Error::credential(&key, "secret is missing username value"))?;
        let password = data
            .get(PASSWORD_KEY)
            .ok_or_else(|| Error::credential(&key, "secret is missing password value"))?;
        if data.len() != 2 {
            return Err(Error::credential(
                &key,
                format!(
                    "secret should have only two data entries, found {}",
                    data.len()
                ),
            ));
        }

        let decode = |field: &str, bytes: &[u8]| {
            String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::credential(&key, format!("{} is not valid UTF-8", field)))
        };

        Ok(Self {
            username: decode(USERNAME_KEY, &username.0)?,
            password: decode(PASSWORD_KEY, &password.0)?,
        })
    }
}

/// Resolve a credential reference name to the control-plane secret name.
///
/// Fails if the shoot has no resource with that name or if the resource is not
/// a `Secret`.
pub fn lookup_referenced_secret(shoot: &Shoot, reference_name: &str) -> Result<String, Error> {
    let reference = shoot.find_resource(reference_name).ok_or_else(|| {
        Error::credential(
            reference_name,
            "missing or invalid referenced resource in shoot spec.resources",
        )
    })?;

    if reference.resource_ref.kind != "Secret" {
        return Err(Error::credential(
            reference_name,
            format!(
                "invalid referenced resource, expected kind Secret, not {}: {}",
                reference.resource_ref.kind, reference.resource_ref.name
            ),
        ));
    }

    Ok(format!(
        "{}{}",
        REFERENCED_RESOURCE_PREFIX, reference.resource_ref.name
    ))
}

fn secret_key(secret: &Secret) -> String {
    format!(
        "{}/{}",
        secret.metadata.namespace.as_deref().unwrap_or_default(),
        secret.metadata.name.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CrossVersionObjectReference, NamedResourceReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(entries: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("ref-docker-hub".to_string()),
                namespace: Some("shoot--dev--a".to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn shoot_with(resources: Vec<NamedResourceReference>) -> Shoot {
        let mut shoot = Shoot::default();
        shoot.spec.resources = resources;
        shoot
    }

    fn reference(name: &str, kind: &str, target: &str) -> NamedResourceReference {
        NamedResourceReference {
            name: name.to_string(),
            resource_ref: CrossVersionObjectReference {
                kind: kind.to_string(),
                name: target.to_string(),
                api_version: Some("v1".to_string()),
            },
        }
    }

    #[test]
    fn exactly_username_and_password_passes() {
        let creds =
            UpstreamCredentials::from_secret(&secret(&[("username", "u"), ("password", "p")]))
                .unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p");
    }

    #[test]
    fn missing_key_fails_with_secret_name() {
        let err = UpstreamCredentials::from_secret(&secret(&[("username", "u")])).unwrap_err();
        assert!(err.to_string().contains("shoot--dev--a/ref-docker-hub"));
        assert!(err.to_string().contains("password"));

        let err = UpstreamCredentials::from_secret(&secret(&[("password", "p")])).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn extra_key_fails() {
        let err = UpstreamCredentials::from_secret(&secret(&[
            ("username", "u"),
            ("password", "p"),
            ("token", "t"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("only two data entries"));
    }

    #[test]
    fn empty_secret_fails() {
        let mut s = secret(&[]);
        s.data = None;
        assert!(UpstreamCredentials::from_secret(&s).is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let creds = UpstreamCredentials {
            username: "u".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn reference_resolves_to_prefixed_secret() {
        let shoot = shoot_with(vec![reference("docker-creds", "Secret", "docker-hub")]);
        assert_eq!(
            lookup_referenced_secret(&shoot, "docker-creds").unwrap(),
            "ref-docker-hub"
        );
    }

    #[test]
    fn reference_of_wrong_kind_fails_closed() {
        let shoot = shoot_with(vec![reference("docker-creds", "ConfigMap", "docker-hub")]);
        let err = lookup_referenced_secret(&shoot, "docker-creds").unwrap_err();
        assert!(err.to_string().contains("expected kind Secret, not ConfigMap"));
    }

    #[test]
    fn absent_reference_fails_closed() {
        let shoot = shoot_with(vec![]);
        assert!(lookup_referenced_secret(&shoot, "docker-creds").is_err());
    }
}
