use ops_common::Tag;

pub const NAME_KEY: &str = "Name";
pub const CREATED_BY_KEY: &str = "CreatedBy";
pub const CREATED_BY_VALUE: &str = "ops";

/// Marks security groups the tool created for an instance.
pub const OPS_CREATED_KEY: &str = "ops-created";

/// Copies `tags`, adds `Name=<default_name>` unless a `Name` tag is present,
/// and appends the `CreatedBy=ops` marker exactly once. Returns the tags and
/// the resolved resource name.
pub fn build_tags(tags: &[Tag], default_name: &str) -> (Vec<Tag>, String) {
    let mut out: Vec<Tag> = tags
        .iter()
        .filter(|t| t.key != CREATED_BY_KEY)
        .cloned()
        .collect();

    let name = match name_tag(&out) {
        Some(n) => n.to_string(),
        None => {
            out.push(Tag::new(NAME_KEY, default_name));
            default_name.to_string()
        }
    };

    out.push(Tag::new(CREATED_BY_KEY, CREATED_BY_VALUE));
    (out, name)
}

/// Value of the last `Name` tag, if any.
pub fn name_tag(tags: &[Tag]) -> Option<&str> {
    tags.iter()
        .rev()
        .find(|t| t.key == NAME_KEY)
        .map(|t| t.value.as_str())
}

pub fn is_created_by_ops(tags: &[Tag]) -> bool {
    tags.iter()
        .any(|t| t.key == CREATED_BY_KEY && t.value == CREATED_BY_VALUE)
}

/// `key=value` strings for backends whose tags are plain strings.
pub fn flatten_tags(tags: &[Tag]) -> Vec<String> {
    tags.iter().map(|t| format!("{}={}", t.key, t.value)).collect()
}

pub fn parse_flat_tags(tags: &[String]) -> Vec<Tag> {
    tags.iter()
        .map(|t| match t.split_once('=') {
            Some((k, v)) => Tag::new(k, v),
            None => Tag::new(t.as_str(), ""),
        })
        .collect()
}
