/// Normalize a model name for family-alias lookups
///
/// Strips a vendor prefix (`vendor/model`), a `-latest` suffix, and a
/// trailing `-YYYYMMDD` date stamp, so dated and vendor-prefixed
/// aliases resolve to the same channel bucket as the family name.
pub fn normalize_model_name(model: &str) -> String {
    let mut name = match model.split_once('/') {
        Some((_, rest)) => rest,
        None => model,
    };

    if let Some(stripped) = name.strip_suffix("-latest") {
        name = stripped;
    } else if let Some(stripped) = strip_date_suffix(name) {
        name = stripped;
    }

    name.to_owned()
}

fn strip_date_suffix(name: &str) -> Option<&str> {
    let (head, tail) = name.split_at_checked(name.len().checked_sub(9)?)?;
    let mut chars = tail.chars();
    if chars.next() == Some('-') && chars.all(|c| c.is_ascii_digit()) {
        Some(head)
    } else {
        None
    }
}
