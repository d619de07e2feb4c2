//! Prefix composition and path pattern translation.
//!
//! # Responsibilities
//! - Merge a router prefix with a sub-prefix or endpoint path
//! - Rewrite colon-style patterns (`/users/:id`) into axum's brace syntax
//!
//! # Design Decisions
//! - Pure functions: same input always yields the same output
//! - A sub-prefix of exactly `/` is absorbed into the parent prefix
//! - No validation of path shape; the underlying router owns the grammar

/// Merge `to_merge` onto `prefix`.
///
/// A `to_merge` of exactly `/` leaves `prefix` untouched, and a root `prefix`
/// contributes nothing, so `convert_path("/", "/api") == "/api"`.
pub fn convert_path(prefix: &str, to_merge: &str) -> String {
    if to_merge == "/" {
        return prefix.to_string();
    }

    let base = if prefix == "/" { "" } else { prefix };
    format!("{}{}", base, to_merge)
}

/// Translate a colon-style pattern into the syntax axum's router expects.
///
/// `:name` becomes `{name}` and `*name` becomes `{*name}`. Segments that are
/// already in brace form pass through unchanged.
pub fn to_axum_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{}}}", name)
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{}}}", name)
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_sub_prefix() {
        for prefix in ["/", "/owo", "/api/v1", ""] {
            assert_eq!(convert_path(prefix, "/"), prefix);
        }
    }

    #[test]
    fn test_root_prefix_is_dropped() {
        assert_eq!(convert_path("/", "/uwu"), "/uwu");
        assert_eq!(convert_path("/owo", "/uwu"), "/owo/uwu");
        assert_eq!(convert_path("/owo/uwu", "/:userId"), "/owo/uwu/:userId");
    }

    #[test]
    fn test_axum_path_translation() {
        assert_eq!(to_axum_path("/uwu/:userId"), "/uwu/{userId}");
        assert_eq!(to_axum_path("/files/*rest"), "/files/{*rest}");
        assert_eq!(to_axum_path("/plain/path"), "/plain/path");
        assert_eq!(to_axum_path("/a/{id}"), "/a/{id}");
        assert_eq!(to_axum_path("/"), "/");
        assert_eq!(to_axum_path(""), "/");
    }
}
