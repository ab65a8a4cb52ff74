//! Activation surface (C8).
//!
//! Defines the registration payload grammar and the authentication seam
//! only; the actual transport (sysfs file, chardev ioctl, or anything else
//! a host chooses) is a collaborator outside this crate, and the
//! salted-SHA-256 password hash is deliberately not implemented here, only
//! the literal-compare fallback is, behind the same `Authenticator` trait
//! a stronger implementation would plug into.

use std::path::Path;

use subtle::ConstantTimeEq;

use crate::config::SecretPassword;
use crate::devices::{classify_path, DeviceKey};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Gates activation on whether the calling principal is authorized to
/// perform it at all, independent of password correctness. Mirrors the
/// kernel module's admin-only sysfs store: a non-admin caller is rejected
/// with `PermissionDenied` before the password is even looked at.
pub trait CallerContext: Send + Sync {
    fn is_admin(&self) -> bool;
}

/// Checks the calling process's real effective UID, the same gate the
/// kernel module's sysfs store enforces implicitly via file permissions.
#[cfg(unix)]
pub struct UnixRootContext;

#[cfg(unix)]
impl CallerContext for UnixRootContext {
    fn is_admin(&self) -> bool {
        effective_uid() == 0
    }
}

#[cfg(unix)]
fn effective_uid() -> u32 {
    extern "C" {
        fn geteuid() -> u32;
    }
    unsafe { geteuid() }
}

/// A `CallerContext` that always authorizes. For hosts that already gate
/// the activation transport itself (e.g. a sysfs file only root can open),
/// or for tests that don't care about the admin check.
pub struct AlwaysAdmin;

impl CallerContext for AlwaysAdmin {
    fn is_admin(&self) -> bool {
        true
    }
}

/// Parse an activation payload of the form `"<path>\r<password>\0"`.
///
/// Requires a trailing NUL, exactly one `\r` separator, and a non-empty
/// path (leading whitespace on the path is trimmed).
pub fn parse_activation_payload(buf: &[u8]) -> Result<(String, String)> {
    let Some((&0, body)) = buf.split_last() else {
        return Err(Error::InvalidArgument(
            "activation payload missing trailing NUL".to_string(),
        ));
    };

    let text = std::str::from_utf8(body)
        .map_err(|_| Error::InvalidArgument("activation payload is not valid UTF-8".to_string()))?;

    let mut parts = text.splitn(2, '\r');
    let path = parts.next().unwrap_or("");
    let password = parts
        .next()
        .ok_or_else(|| Error::InvalidArgument("activation payload missing \\r separator".to_string()))?;

    if password.contains('\r') {
        return Err(Error::InvalidArgument(
            "activation payload contains more than one \\r".to_string(),
        ));
    }

    let path = path.trim_start();
    if path.is_empty() {
        return Err(Error::InvalidArgument(
            "activation payload has an empty path".to_string(),
        ));
    }

    Ok((path.to_string(), password.to_string()))
}

/// Verifies a candidate password against whatever secret an implementor
/// holds. The salted-SHA-256 path from the original activation tool is not
/// implemented here; a caller that needs it supplies its own `Authenticator`.
pub trait Authenticator: Send + Sync {
    fn check(&self, candidate: &str) -> bool;
}

/// The literal-compare fallback: compares in constant time so password
/// length/content can't be inferred from comparison latency.
pub struct LiteralAuthenticator {
    expected: SecretPassword,
}

impl LiteralAuthenticator {
    pub fn new(expected: SecretPassword) -> Self {
        Self { expected }
    }
}

impl Authenticator for LiteralAuthenticator {
    fn check(&self, candidate: &str) -> bool {
        let expected = self.expected.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected.ct_eq(candidate).into()
    }
}

/// Parse, authenticate, and register the device named in `payload`.
///
/// Checks `caller` before even parsing `payload`: a non-admin caller gets
/// `PermissionDenied` regardless of whether the password would have been
/// correct.
pub fn activate(
    engine: &Engine,
    payload: &[u8],
    auth: &dyn Authenticator,
    caller: &dyn CallerContext,
) -> Result<DeviceKey> {
    if !caller.is_admin() {
        return Err(Error::PermissionDenied);
    }
    let (path, password) = parse_activation_payload(payload)?;
    if !auth.check(&password) {
        return Err(Error::AccessDenied);
    }
    engine.register(Path::new(&path))
}

/// Parse, authenticate, and unregister the device named in `payload`.
pub fn deactivate(
    engine: &Engine,
    payload: &[u8],
    auth: &dyn Authenticator,
    caller: &dyn CallerContext,
) -> Result<()> {
    if !caller.is_admin() {
        return Err(Error::PermissionDenied);
    }
    let (path, password) = parse_activation_payload(payload)?;
    if !auth.check(&password) {
        return Err(Error::AccessDenied);
    }
    let key = classify_path(Path::new(&path))?;
    engine.unregister(&key)
}
