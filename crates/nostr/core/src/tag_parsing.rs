pub(crate) fn tag_name(tag: &[String]) -> Option<&str> {
    tag.first().map(String::as_str)
}

pub(crate) fn tag_field(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str)
}

pub(crate) fn is_tag(tag: &[String], name: &str) -> bool {
    matches!(tag_name(tag), Some(tag_name) if tag_name == name)
}

/// Values (second element) of every tag named `name`.
pub(crate) fn tag_values<'a>(
    tags: &'a [Vec<String>],
    name: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    tags.iter()
        .filter(move |tag| is_tag(tag, name))
        .filter_map(|tag| tag_field(tag, 1))
}
