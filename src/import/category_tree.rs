use crate::category::Category;
use std::collections::BTreeMap;

pub const PATH_SEPARATOR: char = '>';

/// Expands `>`-delimited category paths into the deduplicated set of
/// tree nodes needed to represent all of them, ancestors first.
/// Segments are trimmed and empty segments dropped; an all-empty path
/// contributes nothing.
pub fn expand_paths<I, S>(paths: I) -> Vec<Category>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut nodes = BTreeMap::new();
    for raw in paths {
        let segments: Vec<&str> = raw
            .as_ref()
            .split(PATH_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let mut parent: Option<String> = None;
        for (depth, segment) in segments.iter().enumerate() {
            let path = match parent.as_deref() {
                Some(p) => format!("{p}{PATH_SEPARATOR}{segment}"),
                None => segment.to_string(),
            };
            nodes.entry(path.clone()).or_insert_with(|| Category {
                path: path.clone(),
                name: segment.to_string(),
                parent_path: parent.clone(),
                depth: depth as u32,
            });
            parent = Some(path);
        }
    }
    // A parent path is a strict prefix of its children, so the ordered
    // map yields ancestors before descendants.
    nodes.into_values().collect()
}
