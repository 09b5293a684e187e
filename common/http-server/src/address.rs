//! Bind address resolution.

/// Environment variable consulted when no explicit address is configured.
pub const PORT_ENV_VAR: &str = "PORT";

/// Port used when neither an explicit address nor `PORT` is set.
pub const DEFAULT_PORT: &str = "8080";

/// Returns the address to bind: `explicit` verbatim when non-empty, otherwise
/// `":" + $PORT`, falling back to `:8080`.
///
/// The result is not validated here; a malformed address surfaces as a bind
/// error when the listener is created.
pub fn resolve(explicit: &str) -> String {
    resolve_with(explicit, |key| std::env::var(key).ok())
}

/// Same as [`resolve`], with the environment lookup supplied by the caller.
pub fn resolve_with<F>(explicit: &str, lookup: F) -> String
where
    F: FnOnce(&str) -> Option<String>,
{
    if !explicit.is_empty() {
        return explicit.to_string();
    }

    let port = lookup(PORT_ENV_VAR)
        .filter(|port| !port.is_empty())
        .unwrap_or_else(|| DEFAULT_PORT.to_string());

    format!(":{port}")
}

/// Turns a resolved address into something `TcpListener::bind` accepts.
/// A bare `:port` means every interface.
pub(crate) fn to_bind_target(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    }
}
