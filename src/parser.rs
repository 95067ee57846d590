//! Extracts backend secret paths from free-form strings: container env
//! values and the opt-in pod-template annotation. Pure and allocation-light;
//! the collector owns de-duplication.

pub const SENTINEL: &str = "vault:";

/// One occurrence of a `vault:` reference, or one comma-separated annotation
/// entry, resolved to a path and whether it pins a specific version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRef {
    pub path: String,
    pub is_versioned: bool,
}

/// Parses an env var value of the form `...vault:<path>#<field>[#<version>]...`,
/// possibly repeated. A segment runs from one `vault:` occurrence up to the
/// next (or end of string).
pub fn parse_env_value(value: &str) -> Vec<ParsedRef> {
    let mut refs = Vec::new();
    let mut rest = value;

    while let Some(start) = rest.find(SENTINEL) {
        let after_sentinel = &rest[start + SENTINEL.len()..];
        let segment_end = after_sentinel.find(SENTINEL).unwrap_or(after_sentinel.len());
        let segment = &after_sentinel[..segment_end];

        if let Some(parsed) = parse_segment(segment) {
            refs.push(parsed);
        }

        rest = &after_sentinel[segment_end..];
    }

    refs
}

fn parse_segment(segment: &str) -> Option<ParsedRef> {
    let mut parts = segment.split('#');
    let path = parts.next().unwrap_or("");
    if path.is_empty() {
        return None;
    }

    let remaining: Vec<&str> = parts.collect();
    if remaining.is_empty() {
        // no '#' at all: cannot identify a field
        return None;
    }

    let is_versioned = remaining
        .last()
        .map(|last| !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false);

    Some(ParsedRef {
        path: path.to_string(),
        is_versioned,
    })
}

/// Parses the comma-separated annotation value `<path>[#<anything>]`,
/// `<path>[#<anything>], ...`. Unlike the env-var grammar, *any* `#` marks an
/// entry as pinned, regardless of what follows it.
pub fn parse_annotation_value(value: &str) -> Vec<ParsedRef> {
    value
        .split(',')
        .filter_map(|entry| {
            let mut it = entry.splitn(2, '#');
            let path = it.next().unwrap_or("");
            if path.is_empty() {
                return None;
            }
            let is_versioned = it.next().is_some();
            Some(ParsedRef {
                path: path.to_string(),
                is_versioned,
            })
        })
        .collect()
}
