//! Region path helpers.
//!
//! Region paths are `/`-separated repository paths. Everything editable lives
//! below a `/jcr:content` node; annotations hang off their owning region under
//! a `cq:annotations` child.

pub const JCR_CONTENT: &str = "/jcr:content";
pub const ANNOTATIONS_SUFFIX: &str = "/cq:annotations";
pub const ANNOTATIONS_INFIX: &str = "/cq:annotations/";

/// True for paths that address annotation data rather than a region
pub fn is_annotation_path(path: &str) -> bool {
    path.contains(ANNOTATIONS_SUFFIX)
}

/// Parents of `path`, nearest first.
///
/// Only paths below the content root have resolvable parents; the walk stops
/// after yielding the content root itself.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut result = Vec::new();
    if !path.contains(JCR_CONTENT) {
        return result;
    }

    let mut current = path;
    while let Some(idx) = current.rfind('/') {
        current = &current[..idx];
        if current.is_empty() {
            break;
        }
        result.push(current);
        if current.ends_with(JCR_CONTENT) {
            break;
        }
    }
    result
}

/// Path of an annotation entry owned by `owner`
pub fn annotation_entry_path(owner: &str, name: &str) -> String {
    format!("{}{}{}", owner, ANNOTATIONS_INFIX, name)
}

/// Owning region of an annotation entry path
pub fn annotation_owner(entry_path: &str) -> Option<&str> {
    entry_path
        .rfind(ANNOTATIONS_INFIX)
        .map(|idx| &entry_path[..idx])
}
