use crate::error::{Error, Result};

/// Parse a textual numeric list (`[1.0, 2, -3e-2]`) into a vector.
///
/// The length is not checked here; callers compare it against the configured
/// dimension because the error kind depends on where the vector came from.
pub fn parse_embedding(text: &str) -> Result<Vec<f32>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::DataFormat("embedding is blank".to_string()));
    }

    let values: Vec<f64> = serde_json::from_str(trimmed).map_err(|e| {
        Error::DataFormat(format!("unparsable embedding `{}`: {}", preview(trimmed), e))
    })?;

    if values.is_empty() {
        return Err(Error::DataFormat("embedding is an empty list".to_string()));
    }

    Ok(values.into_iter().map(|v| v as f32).collect())
}

fn preview(text: &str) -> String {
    const MAX: usize = 32;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let v = parse_embedding(" [1.0, 0, -0.25, 5e-1] ").unwrap();
        assert_eq!(v, vec![1.0, 0.0, -0.25, 0.5]);
    }

    #[test]
    fn test_parse_rejects_blank_and_garbage() {
        assert!(matches!(parse_embedding("   "), Err(Error::DataFormat(_))));
        assert!(matches!(parse_embedding("[]"), Err(Error::DataFormat(_))));
        assert!(matches!(parse_embedding("[1.0, abc]"), Err(Error::DataFormat(_))));
        assert!(matches!(parse_embedding("1.0, 2.0"), Err(Error::DataFormat(_))));
    }
}
