use crate::config::RouteRule;

/// Matches a request path + method against a list of route rules.
/// Returns the first matching rule.
pub fn match_route<'a>(rules: &'a [RouteRule], path: &str, method: &str) -> Option<&'a RouteRule> {
    rules.iter().find(|rule| {
        // Empty method filter matches all
        let method_ok = rule.match_rule.methods.is_empty()
            || rule
                .match_rule
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method));
        method_ok && match_path(&rule.match_rule.path, path)
    })
}

/// Match a path pattern against a request path.
/// Supports:
///   - Exact: `/login`
///   - Parameters: `/dashboard/invoices/:id`
///   - Single wildcard: `/public/*`
///   - Double wildcard: `/dashboard/**` (matches any depth, including none)
fn match_path(pattern: &str, path: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut ri = 0;
    for pp in pattern_parts {
        if pp == "**" {
            return true;
        }
        let Some(segment) = path_parts.get(ri) else {
            return false;
        };
        if pp != "*" && !pp.starts_with(':') && pp != *segment {
            return false;
        }
        ri += 1;
    }

    ri == path_parts.len()
}

/// Remove `prefix` from the front of `path_and_query`, keeping a leading `/`.
/// Only strips on a segment boundary, so `/api` never eats `/apiary`.
pub fn strip_path_prefix(path_and_query: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path_and_query.to_string();
    }
    match path_and_query.strip_prefix(prefix) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('?') => format!("/{}", rest),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path_and_query.to_string(),
    }
}
